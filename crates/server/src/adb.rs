use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("failed to run adb: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("adb {args} exited with {code:?}: {stderr}")]
    Failed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// The adb command line, as seen by the rest of the server.
///
/// Everything that touches the device goes through here so tests can swap in
/// a recording fake.
#[async_trait]
pub trait Adb: Send + Sync {
    /// Run a command to completion and return its trimmed stdout.
    async fn run(&self, serial: Option<&str>, args: &[&str]) -> Result<String, AdbError>;

    /// Build (but do not spawn) a long-running command such as the agent.
    fn command(&self, serial: Option<&str>, args: &[&str]) -> Command;
}

/// Runs the real `adb` binary.
pub struct AdbCli {
    path: PathBuf,
}

impl AdbCli {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Adb for AdbCli {
    async fn run(&self, serial: Option<&str>, args: &[&str]) -> Result<String, AdbError> {
        let output = self
            .command(serial, args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(AdbError::Spawn)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(AdbError::Failed {
                args: args.join(" "),
                code: output.status.code(),
                stderr,
            })
        }
    }

    fn command(&self, serial: Option<&str>, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.path);
        if let Some(serial) = serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);
        cmd
    }
}
