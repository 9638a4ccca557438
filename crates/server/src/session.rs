use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use droidmirror_protocol::{
    map_point, DemuxError, EncodingParams, InputEvent, MirrorConfig, Resolution, SessionConfig,
    SessionPhase, SessionStatus, TransportConfig,
};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adb::{Adb, AdbError};
use crate::bridge::{TransportBridge, TransportError};
use crate::broadcast::{Broadcaster, StreamMetrics, ViewerConnection};
use crate::launcher::{self, AgentExit, AgentHandle, AgentLaunchError, AgentLauncher};
use crate::{device, input, stream};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a mirroring session is already active")]
    AlreadyActive,
    #[error("no active mirroring session")]
    NotActive,
    #[error("session start was cancelled")]
    Cancelled,
    #[error(transparent)]
    Launch(#[from] AgentLaunchError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("device command failed: {0}")]
    Device(#[from] AdbError),
    #[error("failed to open video socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("session task failed: {0}")]
    Task(String),
}

/// The one live mirroring session.
#[derive(Debug)]
pub struct MirrorSession {
    pub device_id: String,
    pub params: EncodingParams,
    pub token: u32,
    pub device_resolution: Option<Resolution>,
    /// Set by the demuxer when the agent's metadata header arrives.
    pub stream_resolution: Arc<OnceLock<Resolution>>,
    pub saved_volume: Option<u32>,
    pub transport_endpoint: SocketAddr,
}

impl MirrorSession {
    pub fn map_point(&self, x: i32, y: i32) -> (i32, i32) {
        map_point(
            self.device_resolution,
            self.stream_resolution.get().copied(),
            x,
            y,
        )
    }
}

struct DemuxTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What the session supervisor watches for.
struct FailureSignals {
    agent_exit: watch::Receiver<Option<AgentExit>>,
    demux_failed: oneshot::Receiver<DemuxError>,
}

/// Everything acquired for a session, in acquisition order. Filled in as
/// bring-up progresses so a failed start releases exactly what it got.
#[derive(Default)]
struct SessionResources {
    device_id: String,
    muted: bool,
    saved_volume: Option<u32>,
    bridged: bool,
    demux: Option<DemuxTask>,
    agent: Option<AgentHandle>,
    supervisor_cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct Inner {
    session: Option<Arc<MirrorSession>>,
    resources: Option<SessionResources>,
    start_cancel: Option<CancellationToken>,
}

/// Owns the single mirroring session and its state machine:
/// Idle -> Starting -> Active -> Stopping -> Idle.
///
/// Transitions happen with `inner` locked; the phase is published on a
/// watch channel so callers can wait for a transition without polling.
pub struct SessionController {
    adb: Arc<dyn Adb>,
    launcher: AgentLauncher,
    bridge: TransportBridge,
    broadcaster: Arc<Broadcaster>,
    transport: TransportConfig,
    session_config: SessionConfig,
    inner: Mutex<Inner>,
    phase: watch::Sender<SessionPhase>,
}

impl SessionController {
    pub fn new(config: &MirrorConfig, adb: Arc<dyn Adb>, metrics: Arc<StreamMetrics>) -> Arc<Self> {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Arc::new(Self {
            launcher: AgentLauncher::new(Arc::clone(&adb), config.agent.clone()),
            bridge: TransportBridge::new(Arc::clone(&adb)),
            broadcaster: Arc::new(Broadcaster::new(
                config.broadcast.viewer_queue_capacity,
                metrics,
            )),
            adb,
            transport: config.transport.clone(),
            session_config: config.session.clone(),
            inner: Mutex::new(Inner::default()),
            phase,
        })
    }

    pub fn adb(&self) -> &dyn Adb {
        self.adb.as_ref()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    #[cfg(test)]
    pub(crate) fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start mirroring `device_id`. Resolves once the agent is ready.
    ///
    /// Bring-up runs in its own task: if the caller goes away mid-start the
    /// session still either becomes Active or is released back to Idle.
    pub async fn start_session(
        self: &Arc<Self>,
        device_id: &str,
        params: EncodingParams,
    ) -> Result<Arc<MirrorSession>, SessionError> {
        let mut phase_rx = self.phase.subscribe();
        let cancel = loop {
            {
                let mut inner = self.lock();
                let phase = *self.phase.borrow();
                match phase {
                    SessionPhase::Idle => {
                        let cancel = CancellationToken::new();
                        inner.start_cancel = Some(cancel.clone());
                        self.phase.send_replace(SessionPhase::Starting);
                        break cancel;
                    }
                    SessionPhase::Stopping => {}
                    SessionPhase::Starting | SessionPhase::Active => {
                        return Err(SessionError::AlreadyActive);
                    }
                }
            }
            tracing::debug!(device_id, "Waiting for previous session to stop");
            let _ = phase_rx.wait_for(|p| *p != SessionPhase::Stopping).await;
        };

        tracing::info!(device_id, ?params, "Starting mirroring session");
        let this = Arc::clone(self);
        let device_id = device_id.to_string();
        let task = tokio::spawn(async move { this.bring_up(device_id, params, cancel).await });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                // Resources the task held were dropped with it; the agent
                // child is killed on drop.
                tracing::error!("Session start task failed: {e}");
                {
                    let mut inner = self.lock();
                    *inner = Inner::default();
                    self.phase.send_replace(SessionPhase::Idle);
                }
                Err(SessionError::Task(e.to_string()))
            }
        }
    }

    async fn bring_up(
        self: Arc<Self>,
        device_id: String,
        params: EncodingParams,
        cancel: CancellationToken,
    ) -> Result<Arc<MirrorSession>, SessionError> {
        let token = launcher::generate_token();
        let mut resources = SessionResources {
            device_id: device_id.clone(),
            ..SessionResources::default()
        };

        let acquired = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.acquire(&device_id, params, token, &mut resources) => result,
        };

        let failure = match acquired {
            Ok((session, signals)) => {
                let mut inner = self.lock();
                if cancel.is_cancelled() {
                    SessionError::Cancelled
                } else {
                    let supervisor_cancel = CancellationToken::new();
                    self.spawn_supervisor(token, signals, supervisor_cancel.clone());
                    resources.supervisor_cancel = Some(supervisor_cancel);

                    inner.session = Some(Arc::clone(&session));
                    inner.resources = Some(resources);
                    inner.start_cancel = None;
                    self.phase.send_replace(SessionPhase::Active);
                    tracing::info!(
                        device_id = %device_id,
                        token,
                        endpoint = %session.transport_endpoint,
                        params = ?session.params,
                        "Mirroring session active"
                    );
                    return Ok(session);
                }
            }
            Err(e) => e,
        };

        tracing::warn!(%device_id, token, "Session start failed: {failure}");
        self.release(resources).await;
        {
            let mut inner = self.lock();
            inner.start_cancel = None;
            self.phase.send_replace(SessionPhase::Idle);
        }
        Err(failure)
    }

    async fn acquire(
        &self,
        device_id: &str,
        params: EncodingParams,
        token: u32,
        resources: &mut SessionResources,
    ) -> Result<(Arc<MirrorSession>, FailureSignals), SessionError> {
        let device_resolution = device::physical_size(self.adb.as_ref(), device_id).await;

        if self.session_config.mute_device {
            let saved = match device::music_volume(self.adb.as_ref(), device_id).await {
                Ok(level) => level,
                Err(e) => {
                    tracing::warn!(device_id, "Failed to read media volume: {e}");
                    None
                }
            };
            // Marked before the command runs: a cancelled start may drop
            // this future after adb has already applied the change.
            resources.muted = true;
            resources.saved_volume = saved;
            if let Err(e) = device::set_music_volume(self.adb.as_ref(), device_id, 0).await {
                tracing::warn!(device_id, "Failed to mute device: {e}");
                resources.muted = false;
                resources.saved_volume = None;
            }
        }

        let listener =
            TcpListener::bind((self.transport.bind.as_str(), self.transport.video_port)).await?;
        let transport_endpoint = listener.local_addr()?;

        // Teardown is idempotent, so a partly established bridge is
        // released the same way as a complete one.
        resources.bridged = true;
        self.bridge
            .establish(device_id, &launcher::channel_name(token), transport_endpoint.port())
            .await?;

        let session = Arc::new(MirrorSession {
            device_id: device_id.to_string(),
            params,
            token,
            device_resolution,
            stream_resolution: Arc::new(OnceLock::new()),
            saved_volume: resources.saved_volume,
            transport_endpoint,
        });

        let (demux, demux_failed) = self.spawn_demuxer(listener, &session);
        resources.demux = Some(demux);

        let agent = self.launcher.start(device_id, &params, token).await?;
        let signals = FailureSignals {
            agent_exit: agent.exit_watch(),
            demux_failed,
        };
        resources.agent = Some(agent);

        Ok((session, signals))
    }

    fn spawn_demuxer(
        &self,
        listener: TcpListener,
        session: &MirrorSession,
    ) -> (DemuxTask, oneshot::Receiver<DemuxError>) {
        let cancel = CancellationToken::new();
        let (failed_tx, failed_rx) = oneshot::channel();
        let resolution = Arc::clone(&session.stream_resolution);
        let broadcaster = Arc::clone(&self.broadcaster);
        let task_cancel = cancel.clone();
        let token = session.token;
        let handle = tokio::spawn(async move {
            if let Err(e) = stream::run_demuxer(listener, resolution, broadcaster, task_cancel).await
            {
                tracing::error!(token, "Video stream failed: {e}");
                let _ = failed_tx.send(e);
            }
        });
        (DemuxTask { cancel, handle }, failed_rx)
    }

    fn spawn_supervisor(self: &Arc<Self>, token: u32, signals: FailureSignals, cancel: CancellationToken) {
        tokio::spawn(supervise(Arc::downgrade(self), token, signals, cancel));
    }

    /// Stop the session. Returns true if this call tore down a session or
    /// cancelled one that was starting.
    pub async fn stop_session(&self) -> bool {
        self.stop_matching(None).await
    }

    /// Stop the session only if it is still the one identified by `token`.
    async fn stop_if_current(&self, token: u32) {
        self.stop_matching(Some(token)).await;
    }

    async fn stop_matching(&self, only_token: Option<u32>) -> bool {
        let mut phase_rx = self.phase.subscribe();
        let mut cancelled_start = false;
        loop {
            let claimed = {
                let mut inner = self.lock();
                let phase = *self.phase.borrow();
                match phase {
                    SessionPhase::Idle => return cancelled_start,
                    SessionPhase::Starting => {
                        if only_token.is_some() {
                            return false;
                        }
                        if let Some(cancel) = &inner.start_cancel {
                            tracing::info!("Cancelling session start");
                            cancel.cancel();
                            cancelled_start = true;
                        }
                        None
                    }
                    SessionPhase::Stopping => None,
                    SessionPhase::Active => {
                        let current = inner.session.as_ref().map(|s| s.token);
                        if only_token.is_some() && current != only_token {
                            return false;
                        }
                        self.phase.send_replace(SessionPhase::Stopping);
                        Some((current, inner.resources.take()))
                    }
                }
            };

            match claimed {
                Some((token, resources)) => {
                    tracing::info!(token = token.unwrap_or(0), "Stopping mirroring session");
                    if let Some(resources) = resources {
                        self.release(resources).await;
                    }
                    {
                        let mut inner = self.lock();
                        inner.session = None;
                        self.phase.send_replace(SessionPhase::Idle);
                    }
                    tracing::info!(token = token.unwrap_or(0), "Mirroring session stopped");
                    return true;
                }
                None => {
                    let _ = phase_rx
                        .wait_for(|p| matches!(p, SessionPhase::Idle | SessionPhase::Active))
                        .await;
                }
            }
        }
    }

    /// Release session resources in teardown order. Every step is
    /// best-effort; failures are logged.
    async fn release(&self, resources: SessionResources) {
        let SessionResources {
            device_id,
            muted,
            saved_volume,
            bridged,
            demux,
            agent,
            supervisor_cancel,
        } = resources;

        if let Some(cancel) = supervisor_cancel {
            cancel.cancel();
        }
        if bridged {
            self.bridge.teardown(&device_id).await;
        }
        if let Some(agent) = agent {
            self.launcher.stop(agent).await;
        }
        if let Some(demux) = demux {
            demux.cancel.cancel();
            if let Err(e) = demux.handle.await {
                tracing::warn!(%device_id, "Demuxer task failed: {e}");
            }
        }
        self.broadcaster.close_all();
        if muted {
            let volume = saved_volume.unwrap_or(self.session_config.fallback_volume);
            if let Err(e) = device::set_music_volume(self.adb.as_ref(), &device_id, volume).await {
                tracing::warn!(%device_id, volume, "Failed to restore media volume: {e}");
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.lock();
        let phase = *self.phase.borrow();
        let session = inner.session.as_deref();
        SessionStatus {
            phase,
            active: phase == SessionPhase::Active,
            device_id: session.map(|s| s.device_id.clone()),
            device_resolution: session.and_then(|s| s.device_resolution),
            stream_resolution: session.and_then(|s| s.stream_resolution.get().copied()),
            transport_endpoint: session.map(|s| s.transport_endpoint.to_string()),
            viewers: self.broadcaster.viewer_count(),
        }
    }

    pub fn require_active(&self) -> Result<Arc<MirrorSession>, SessionError> {
        let inner = self.lock();
        match (&inner.session, *self.phase.borrow()) {
            (Some(session), SessionPhase::Active) => Ok(Arc::clone(session)),
            _ => Err(SessionError::NotActive),
        }
    }

    /// Map a stream-space point to device pixels. Identity without a session.
    pub fn map_point(&self, x: i32, y: i32) -> (i32, i32) {
        match self.lock().session.as_deref() {
            Some(session) => session.map_point(x, y),
            None => (x, y),
        }
    }

    /// Attach a viewer to the running session's video.
    pub fn subscribe_viewer(&self) -> Result<ViewerConnection, SessionError> {
        let _inner = self.lock();
        if *self.phase.borrow() != SessionPhase::Active {
            return Err(SessionError::NotActive);
        }
        Ok(self.broadcaster.subscribe())
    }

    pub async fn inject_input(&self, event: &InputEvent) -> Result<(), SessionError> {
        let session = self.require_active()?;
        input::inject(self.adb.as_ref(), &session, event).await?;
        Ok(())
    }
}

/// Stops the session when its agent dies or its video stream fails.
/// Cancelled by teardown, so an orderly stop never re-enters here.
async fn supervise(
    controller: Weak<SessionController>,
    token: u32,
    signals: FailureSignals,
    cancel: CancellationToken,
) {
    let FailureSignals {
        mut agent_exit,
        demux_failed,
    } = signals;

    let reason = tokio::select! {
        _ = cancel.cancelled() => return,
        exit = async { agent_exit.wait_for(|e| e.is_some()).await.ok().and_then(|e| (*e).clone()) } => {
            match exit {
                Some(exit) => format!("agent exited ({})", exit.description),
                None => "agent supervisor went away".to_string(),
            }
        }
        Ok(e) = demux_failed => format!("video stream failed: {e}"),
    };

    tracing::warn!(token, "Mirroring session ended unexpectedly: {reason}");
    if let Some(controller) = controller.upgrade() {
        controller.stop_if_current(token).await;
    }
}
