use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub adb: AdbConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the control API and viewer WebSocket
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the web player's static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbConfig {
    /// adb executable (looked up on PATH when not absolute)
    #[serde(default = "default_adb_path")]
    pub path: String,
}

/// How the on-device scrcpy server is pushed and started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Local path of the scrcpy-server jar
    #[serde(default = "default_server_path")]
    pub server_path: String,
    /// Where the jar is pushed on the device
    #[serde(default = "default_device_path")]
    pub device_path: String,
    /// Server version string; must match the jar exactly
    #[serde(default = "default_agent_version")]
    pub version: String,
    /// Substring on agent stdout that signals readiness
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,
    /// Seconds to wait for the ready marker
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Pause after killing a stale agent, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

/// Default encoding parameters, overridable per start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Longest side of the encoded video in pixels (0 = device native)
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    /// Frame rate cap
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    /// Bitrate in bits per second
    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Local address the agent's reverse tunnel lands on
    #[serde(default = "default_transport_bind")]
    pub bind: String,
    /// Local TCP port for the video socket (0 = pick a free port)
    #[serde(default = "default_video_port")]
    pub video_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Units a viewer may fall behind before it is dropped
    #[serde(default = "default_viewer_queue_capacity")]
    pub viewer_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Mute media volume on the device while mirroring
    #[serde(default = "default_true")]
    pub mute_device: bool,
    /// Volume restored when the saved value cannot be read
    #[serde(default = "default_fallback_volume")]
    pub fallback_volume: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            web_root: default_web_root(),
        }
    }
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            path: default_adb_path(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_path: default_server_path(),
            device_path: default_device_path(),
            version: default_agent_version(),
            ready_marker: default_ready_marker(),
            ready_timeout_secs: default_ready_timeout(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_fps: default_max_fps(),
            bit_rate: default_bit_rate(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: default_transport_bind(),
            video_port: default_video_port(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            viewer_queue_capacity: default_viewer_queue_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mute_device: true,
            fallback_volume: default_fallback_volume(),
        }
    }
}

impl MirrorConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Ports ---
        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.transport.video_port != 0 && self.transport.video_port == self.server.port {
            issues.push(format!(
                "ERROR: transport.video_port and server.port are both {}. \
                 The agent socket needs its own port.",
                self.server.port
            ));
        }

        // --- adb ---
        if self.adb.path.trim().is_empty() {
            issues.push("ERROR: adb.path must not be empty.".to_string());
        }

        // --- Agent ---
        if self.agent.ready_timeout_secs == 0 {
            issues.push("ERROR: agent.ready_timeout_secs must be at least 1.".to_string());
        }
        if self.agent.ready_marker.is_empty() {
            issues.push(
                "ERROR: agent.ready_marker must not be empty, every line would match.".to_string(),
            );
        }
        if self.agent.version.trim().is_empty() {
            issues.push(
                "ERROR: agent.version must match the scrcpy-server jar (e.g. \"3.3.4\").".to_string(),
            );
        }
        if self.agent.settle_ms > 10_000 {
            issues.push(format!(
                "WARNING: agent.settle_ms is {} ms; every session start waits this long.",
                self.agent.settle_ms
            ));
        }

        // --- Video ---
        if self.video.max_fps == 0 || self.video.max_fps > 240 {
            issues.push(format!(
                "ERROR: video.max_fps must be between 1 and 240, got {}.",
                self.video.max_fps
            ));
        }
        if self.video.bit_rate == 0 {
            issues.push("ERROR: video.bit_rate must be greater than 0.".to_string());
        } else if self.video.bit_rate > 100_000_000 {
            issues.push(format!(
                "WARNING: video.bit_rate is {} bps ({} Mbps), this is unusually high. \
                 Note the unit is bits per second, not kbps.",
                self.video.bit_rate,
                self.video.bit_rate / 1_000_000
            ));
        } else if self.video.bit_rate < 100_000 {
            issues.push(format!(
                "WARNING: video.bit_rate is {} bps, which is very low. \
                 The unit is bits per second (8000000 = 8 Mbps).",
                self.video.bit_rate
            ));
        }
        if self.video.max_size != 0 && self.video.max_size < 240 {
            issues.push(format!(
                "ERROR: video.max_size must be 0 (native) or at least 240, got {}.",
                self.video.max_size
            ));
        }

        // --- Broadcast ---
        if self.broadcast.viewer_queue_capacity == 0 {
            issues.push("ERROR: broadcast.viewer_queue_capacity must be >= 1.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3333
}
fn default_web_root() -> String {
    "web".to_string()
}
fn default_adb_path() -> String {
    "adb".to_string()
}
fn default_server_path() -> String {
    "resources/scrcpy-server".to_string()
}
fn default_device_path() -> String {
    "/data/local/tmp/scrcpy-server.jar".to_string()
}
fn default_agent_version() -> String {
    "3.3.4".to_string()
}
fn default_ready_marker() -> String {
    "INFO:".to_string()
}
fn default_ready_timeout() -> u64 {
    10
}
fn default_settle_ms() -> u64 {
    500
}
fn default_max_size() -> u32 {
    1920
}
fn default_max_fps() -> u32 {
    60
}
fn default_bit_rate() -> u32 {
    8_000_000
}
fn default_transport_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_video_port() -> u16 {
    27183
}
fn default_viewer_queue_capacity() -> usize {
    32 // ~0.5s at 60fps
}
fn default_true() -> bool {
    true
}
fn default_fallback_volume() -> u32 {
    7
}
