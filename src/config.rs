//! Client configuration.

use std::time::Duration;

/// Configuration for the game-session client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the game server
    pub ws_url: String,
    /// Base URL of the REST backend (voice mappings, scripts, synthesis)
    pub api_url: String,
    /// Delay before a reconnect attempt after an unexpected close.
    /// Fixed interval, no backoff.
    pub reconnect_delay: Duration,
    /// Voice used when a speaker has no mapping entry
    pub default_voice: String,
    /// Whether narration playback starts enabled
    pub tts_enabled: bool,
    /// Initial playback volume (0.0..=1.0)
    pub volume: f32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000/ws/game".to_string(),
            api_url: "http://localhost:8000/api".to_string(),
            reconnect_delay: Duration::from_millis(3000),
            default_voice: "narrator".to_string(),
            tts_enabled: false,
            volume: 1.0,
        }
    }
}
