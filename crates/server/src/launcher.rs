use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use droidmirror_protocol::{AgentConfig, EncodingParams};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adb::{Adb, AdbError};

/// Lines of agent output kept for launch failure reports.
const LOG_TAIL_LINES: usize = 64;
/// How long the agent gets to exit after SIGTERM before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

const AGENT_MAIN_CLASS: &str = "com.genymobile.scrcpy.Server";

#[derive(Debug, thiserror::Error)]
pub enum AgentLaunchError {
    #[error("failed to push agent to device: {0}")]
    Push(#[source] AdbError),
    #[error("failed to start agent: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent not ready after {timeout:?}. Log:\n{log}")]
    Timeout { timeout: Duration, log: String },
    #[error("agent exited ({status}) before becoming ready. Log:\n{log}")]
    Exited { status: String, log: String },
}

/// Random 31-bit session token. The agent derives its socket name from it.
pub fn generate_token() -> u32 {
    (Uuid::new_v4().as_u128() as u32) & 0x7FFF_FFFF
}

/// Abstract socket name the agent dials for a given token.
pub fn channel_name(token: u32) -> String {
    format!("scrcpy_{token:08x}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub code: Option<i32>,
    pub success: bool,
    pub description: String,
}

impl AgentExit {
    fn from_wait(result: &std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self {
                code: status.code(),
                success: status.success(),
                description: status.to_string(),
            },
            Err(e) => Self {
                code: None,
                success: false,
                description: format!("wait failed: {e}"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Stdout,
    Stderr,
}

struct LogTail {
    lines: VecDeque<String>,
}

impl LogTail {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(LOG_TAIL_LINES),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == LOG_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// A running agent. Dropping the handle without [`AgentLauncher::stop`]
/// still terminates the process.
pub struct AgentHandle {
    token: u32,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<AgentExit>>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resolves to `Some` once the agent process has exited.
    pub fn exit_watch(&self) -> watch::Receiver<Option<AgentExit>> {
        self.exit_rx.clone()
    }
}

/// Starts and stops the scrcpy server on a device.
pub struct AgentLauncher {
    adb: Arc<dyn Adb>,
    config: AgentConfig,
    ready_timeout: Duration,
}

impl AgentLauncher {
    pub fn new(adb: Arc<dyn Adb>, config: AgentConfig) -> Self {
        let ready_timeout = Duration::from_secs(config.ready_timeout_secs);
        Self {
            adb,
            config,
            ready_timeout,
        }
    }

    /// Shorter ready timeout (for testing).
    #[cfg(test)]
    pub(crate) fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Launch the agent and wait until it reports ready.
    pub async fn start(
        &self,
        device_id: &str,
        params: &EncodingParams,
        token: u32,
    ) -> Result<AgentHandle, AgentLaunchError> {
        self.kill_stale(device_id).await;

        self.adb
            .run(
                Some(device_id),
                &["push", &self.config.server_path, &self.config.device_path],
            )
            .await
            .map_err(AgentLaunchError::Push)?;

        let args = self.agent_args(token, params);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut child = self
            .adb
            .command(Some(device_id), &arg_refs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentLaunchError::Spawn)?;
        let pid = child.id();

        tracing::info!(device_id, token, pid = pid.unwrap_or(0), "Agent process spawned");

        // Both pipes must be drained for the agent's whole life, otherwise
        // it blocks once the pipe buffer fills.
        let (line_tx, mut lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, Source::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, Source::Stderr, line_tx);
        }

        self.wait_ready(&mut child, &mut lines, token).await?;
        tracing::info!(device_id, token, "Agent ready");

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let task = tokio::spawn(supervise(child, lines, stop_rx, exit_tx, token));

        Ok(AgentHandle {
            token,
            pid,
            stop_tx: Some(stop_tx),
            exit_rx,
            task,
        })
    }

    /// Terminate the agent and wait for its supervisor to finish.
    pub async fn stop(&self, mut handle: AgentHandle) {
        tracing::debug!(token = handle.token(), pid = ?handle.pid(), "Stopping agent");
        if let Some(tx) = handle.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut handle.task).await {
            tracing::warn!(token = handle.token, "Agent supervisor failed: {e}");
        }
    }

    /// A previous agent may still hold the device encoder; it may also be
    /// long gone, so failure is expected and ignored.
    async fn kill_stale(&self, device_id: &str) {
        if let Err(e) = self
            .adb
            .run(Some(device_id), &["shell", "pkill", "-f", "scrcpy"])
            .await
        {
            tracing::debug!(device_id, "No stale agent killed: {e}");
        }
        if self.config.settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;
        }
    }

    fn agent_args(&self, token: u32, params: &EncodingParams) -> Vec<String> {
        vec![
            "shell".to_string(),
            format!("CLASSPATH={}", self.config.device_path),
            "app_process".to_string(),
            "/".to_string(),
            AGENT_MAIN_CLASS.to_string(),
            self.config.version.clone(),
            format!("scid={token:08x}"),
            "tunnel_forward=false".to_string(),
            "video=true".to_string(),
            "video_codec=h264".to_string(),
            "video_source=display".to_string(),
            "audio=false".to_string(),
            "control=false".to_string(),
            "cleanup=true".to_string(),
            format!("max_size={}", params.max_size),
            format!("max_fps={}", params.max_fps),
            format!("video_bit_rate={}", params.bit_rate),
        ]
    }

    async fn wait_ready(
        &self,
        child: &mut Child,
        lines: &mut mpsc::UnboundedReceiver<(Source, String)>,
        token: u32,
    ) -> Result<(), AgentLaunchError> {
        let mut tail = LogTail::new();
        let deadline = tokio::time::sleep(self.ready_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(token, timeout = ?self.ready_timeout, "Agent did not become ready, killing");
                    let _ = child.kill().await;
                    return Err(AgentLaunchError::Timeout {
                        timeout: self.ready_timeout,
                        log: tail.render(),
                    });
                }
                status = child.wait() => {
                    // Pick up whatever the agent printed on its way out.
                    while let Ok(Some((source, line))) =
                        tokio::time::timeout(Duration::from_millis(200), lines.recv()).await
                    {
                        log_line(token, source, &line);
                        tail.push(line);
                    }
                    let exit = AgentExit::from_wait(&status);
                    tracing::error!(token, status = %exit.description, "Agent exited before ready");
                    return Err(AgentLaunchError::Exited {
                        status: exit.description,
                        log: tail.render(),
                    });
                }
                Some((source, line)) = lines.recv() => {
                    log_line(token, source, &line);
                    let ready = matches!(source, Source::Stdout)
                        && line.contains(self.config.ready_marker.as_str());
                    tail.push(line);
                    if ready {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn forward_lines<R>(reader: R, source: Source, tx: mpsc::UnboundedSender<(Source, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((source, line)).is_err() {
                break;
            }
        }
    });
}

fn log_line(token: u32, source: Source, line: &str) {
    match source {
        Source::Stdout => tracing::debug!(target: "agent", token, "{line}"),
        Source::Stderr => tracing::info!(target: "agent", token, "stderr: {line}"),
    }
}

async fn supervise(
    mut child: Child,
    mut lines: mpsc::UnboundedReceiver<(Source, String)>,
    mut stop_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<AgentExit>>,
    token: u32,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            // Explicit stop, or the handle was dropped.
            _ = &mut stop_rx => break terminate(&mut child, token).await,
            Some((source, line)) = lines.recv() => log_line(token, source, &line),
        }
    };

    let exit = AgentExit::from_wait(&status);
    if exit.success {
        tracing::info!(token, "Agent exited cleanly");
    } else {
        tracing::info!(token, status = %exit.description, "Agent exited");
    }
    exit_tx.send_replace(Some(exit));
}

async fn terminate(child: &mut Child, token: u32) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        tracing::info!(token, pid, "Sending SIGTERM to agent");
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(token, "Agent did not exit in time, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}
