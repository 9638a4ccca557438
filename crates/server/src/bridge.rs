use std::sync::Arc;

use crate::adb::{Adb, AdbError};

#[derive(Debug, thiserror::Error)]
#[error("failed to set up reverse tunnel {channel} -> tcp:{port}: {source}")]
pub struct TransportError {
    pub channel: String,
    pub port: u16,
    #[source]
    pub source: AdbError,
}

/// Manages the `adb reverse` mapping that lets the agent dial the host.
pub struct TransportBridge {
    adb: Arc<dyn Adb>,
}

impl TransportBridge {
    pub fn new(adb: Arc<dyn Adb>) -> Self {
        Self { adb }
    }

    /// Map the device's abstract socket `channel` onto local TCP `port`.
    pub async fn establish(
        &self,
        device_id: &str,
        channel: &str,
        port: u16,
    ) -> Result<(), TransportError> {
        // Leftover mappings from a crashed session would shadow ours.
        if let Err(e) = self
            .adb
            .run(Some(device_id), &["reverse", "--remove-all"])
            .await
        {
            tracing::debug!(device_id, "Clearing reverse mappings failed: {e}");
        }

        let local = format!("localabstract:{channel}");
        let remote = format!("tcp:{port}");
        self.adb
            .run(Some(device_id), &["reverse", &local, &remote])
            .await
            .map_err(|source| TransportError {
                channel: channel.to_string(),
                port,
                source,
            })?;

        tracing::info!(device_id, channel, port, "Reverse tunnel established");
        Ok(())
    }

    /// Remove every reverse mapping on the device. Never fails.
    pub async fn teardown(&self, device_id: &str) {
        match self
            .adb
            .run(Some(device_id), &["reverse", "--remove-all"])
            .await
        {
            Ok(_) => tracing::debug!(device_id, "Reverse tunnel removed"),
            Err(e) => tracing::warn!(device_id, "Failed to remove reverse tunnel: {e}"),
        }
    }
}
