//! Error type shared across the session client.
//!
//! Connectivity and protocol failures never cross component boundaries
//! as errors; they become status transitions and logged skips. What
//! remains here are the request/response failures a caller can actually
//! observe: REST lookups, speech synthesis, and the audio unlock.

/// Error type for game-session client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Audio output unavailable: {0}")]
    AudioUnavailable(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Backend rejected request: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
