use serde::{Deserialize, Serialize};

use crate::config::VideoConfig;
use crate::coords::Resolution;

/// Encoder settings passed to the agent for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingParams {
    pub max_size: u32,
    pub max_fps: u32,
    pub bit_rate: u32,
}

impl From<&VideoConfig> for EncodingParams {
    fn from(video: &VideoConfig) -> Self {
        Self {
            max_size: video.max_size,
            max_fps: video.max_fps,
            bit_rate: video.bit_rate,
        }
    }
}

/// Body of `POST /api/session`. Omitted encoder fields fall back to `[video]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u32>,
}

impl StartSessionRequest {
    pub fn encoding(&self, defaults: &VideoConfig) -> EncodingParams {
        EncodingParams {
            max_size: self.max_size.unwrap_or(defaults.max_size),
            max_fps: self.max_fps.unwrap_or(defaults.max_fps),
            bit_rate: self.bit_rate.unwrap_or(defaults.bit_rate),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    /// Local address the agent's video socket lands on
    pub transport_endpoint: String,
    pub session_token: u32,
    /// WebSocket path viewers connect to for the video units
    pub viewer_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub device_resolution: Option<Resolution>,
    pub stream_resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_endpoint: Option<String>,
    pub viewers: usize,
}

/// One line of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    /// "device", "unauthorized" or "offline"
    pub status: String,
    pub model: String,
    pub is_wireless: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Input forwarded to the device. Coordinates are in video stream pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    Tap {
        x: i32,
        y: i32,
    },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        #[serde(default = "default_swipe_duration")]
        duration_ms: u32,
    },
    /// Android keycode (KEYCODE_HOME = 3, KEYCODE_BACK = 4, ...)
    Key {
        keycode: u32,
    },
    Text {
        text: String,
    },
}

fn default_swipe_duration() -> u32 {
    300
}
