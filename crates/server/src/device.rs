//! Device queries that are plain adb invocations.

use droidmirror_protocol::{DeviceInfo, Resolution};

use crate::adb::{Adb, AdbError};

/// List attached devices (`adb devices -l`).
pub async fn list_devices(adb: &dyn Adb) -> Result<Vec<DeviceInfo>, AdbError> {
    let output = adb.run(None, &["devices", "-l"]).await?;
    Ok(parse_devices(&output))
}

/// Physical display size reported by `wm size`.
pub async fn physical_size(adb: &dyn Adb, serial: &str) -> Option<Resolution> {
    match adb.run(Some(serial), &["shell", "wm", "size"]).await {
        Ok(output) => {
            let size = parse_physical_size(&output);
            if size.is_none() {
                tracing::warn!(device_id = serial, %output, "Unrecognized wm size output");
            }
            size
        }
        Err(e) => {
            tracing::warn!(device_id = serial, "Failed to query device resolution: {e}");
            None
        }
    }
}

/// Current media volume, if the device reports a number.
pub async fn music_volume(adb: &dyn Adb, serial: &str) -> Result<Option<u32>, AdbError> {
    let output = adb
        .run(
            Some(serial),
            &["shell", "settings", "get", "system", "volume_music"],
        )
        .await?;
    Ok(output.trim().parse().ok())
}

pub async fn set_music_volume(adb: &dyn Adb, serial: &str, volume: u32) -> Result<(), AdbError> {
    let level = volume.to_string();
    adb.run(
        Some(serial),
        &["shell", "media", "volume", "--set", level.as_str()],
    )
    .await?;
    Ok(())
}

pub(crate) fn parse_devices(output: &str) -> Vec<DeviceInfo> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let status = fields.next()?;
            if !matches!(status, "device" | "unauthorized" | "offline") {
                return None;
            }
            let model = fields
                .find_map(|f| f.strip_prefix("model:"))
                .map(|m| m.replace('_', " "))
                .unwrap_or_else(|| serial.to_string());
            Some(DeviceInfo {
                serial: serial.to_string(),
                status: status.to_string(),
                model,
                is_wireless: serial.contains(':'),
            })
        })
        .collect()
}

/// Pick the physical size out of `wm size`. An "Override size" line (set by
/// `wm size WxH`) is not what the panel renders at, so it is ignored.
pub(crate) fn parse_physical_size(output: &str) -> Option<Resolution> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Physical size:"))
        .and_then(Resolution::parse)
}
