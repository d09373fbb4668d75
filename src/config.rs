//! Engine configuration with environment overrides.

use std::time::Duration;

/// Tunables for the sync engine. Defaults match the reference deployment;
/// every knob can be overridden via `EMOSYNC_*` environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    // Heartbeat parameters
    pub heartbeat_interval_ms: u64,
    pub heartbeat_miss_threshold: u32,

    // Reconnect parameters
    pub reconnect_delay_ms: u64,
    /// Linear cap on the reconnect delay (delay * attempts, capped here).
    pub reconnect_delay_max_ms: u64,
    /// 0 = retry forever.
    pub max_reconnect_attempts: u32,

    // Poll intervals
    pub audio_poll_interval_ms: u64,
    pub video_poll_interval_ms: u64,

    // Error slot
    pub error_dismiss_ms: u64,

    // Timeline
    pub timeline_capacity: usize,

    // HTTP
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            // Probe every 5s, declare dead after 3 missed responses
            heartbeat_interval_ms: 5_000,
            heartbeat_miss_threshold: 3,

            // Fixed 2s delay, linearly capped at 10s
            reconnect_delay_ms: 2_000,
            reconnect_delay_max_ms: 10_000,
            max_reconnect_attempts: 0,

            // Fast metrics at 20 Hz, statistics at 4 Hz
            audio_poll_interval_ms: 50,
            video_poll_interval_ms: 250,

            error_dismiss_ms: 10_000,
            timeline_capacity: 50,
            request_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("EMOSYNC_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval_ms = v.parse().unwrap_or(config.heartbeat_interval_ms);
        }
        if let Ok(v) = std::env::var("EMOSYNC_HEARTBEAT_MISS_THRESHOLD") {
            config.heartbeat_miss_threshold = v.parse().unwrap_or(config.heartbeat_miss_threshold);
        }
        if let Ok(v) = std::env::var("EMOSYNC_RECONNECT_DELAY_MS") {
            config.reconnect_delay_ms = v.parse().unwrap_or(config.reconnect_delay_ms);
        }
        if let Ok(v) = std::env::var("EMOSYNC_RECONNECT_DELAY_MAX_MS") {
            config.reconnect_delay_max_ms = v.parse().unwrap_or(config.reconnect_delay_max_ms);
        }
        if let Ok(v) = std::env::var("EMOSYNC_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v.parse().unwrap_or(config.max_reconnect_attempts);
        }
        if let Ok(v) = std::env::var("EMOSYNC_AUDIO_POLL_INTERVAL_MS") {
            config.audio_poll_interval_ms = v.parse().unwrap_or(config.audio_poll_interval_ms);
        }
        if let Ok(v) = std::env::var("EMOSYNC_VIDEO_POLL_INTERVAL_MS") {
            config.video_poll_interval_ms = v.parse().unwrap_or(config.video_poll_interval_ms);
        }
        if let Ok(v) = std::env::var("EMOSYNC_ERROR_DISMISS_MS") {
            config.error_dismiss_ms = v.parse().unwrap_or(config.error_dismiss_ms);
        }
        if let Ok(v) = std::env::var("EMOSYNC_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = v.parse().unwrap_or(config.request_timeout_ms);
        }

        config
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Reconnect delay for a given attempt: fixed base, linearly capped.
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        let scaled = self
            .reconnect_delay_ms
            .saturating_mul(attempts.max(1) as u64)
            .min(self.reconnect_delay_max_ms);
        Duration::from_millis(scaled)
    }

    pub fn error_dismiss(&self) -> Duration {
        Duration::from_millis(self.error_dismiss_ms)
    }
}
