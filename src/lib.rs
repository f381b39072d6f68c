//! noirlive - real-time client for AI-narrated murder-mystery sessions
//!
//! Maintains a persistent WebSocket connection to a game server, folds
//! the game-state stream into immutable snapshots, and drives a queued,
//! interruptible text-to-speech pipeline synchronized to the incoming
//! narration. UI layers consume the [`session::GameSession`] facade and
//! never touch the connection, reducer or queue internals directly.

#![forbid(unsafe_code)]

/// Client configuration
pub mod config;
/// WebSocket connection manager with fixed-delay reconnect
pub mod connection;
/// Shared error type
pub mod error;
/// Tagged wire messages
pub mod protocol;
/// Script/character read API
pub mod scripts;
/// Session facade consumed by the UI
pub mod session;
/// Game-state snapshots and reducer
pub mod state;
/// Queued, interruptible TTS playback
pub mod tts;
/// Character-to-voice mapping cache
pub mod voices;

pub use config::ClientConfig;
pub use connection::ConnectionStatus;
pub use error::{ClientError, Result};
pub use session::{GameSession, SessionEvent};
pub use state::{GamePhase, GameState, NarrativeEvent};
pub use tts::Caption;
