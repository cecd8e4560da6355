//! Error types for the live voice session.

/// Top-level error type for the live audio streaming subsystem.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Microphone permission denied, device busy, or no input device.
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Transport connect or setup handshake failed.
    #[error("session open failed: {0}")]
    SessionOpenFailed(String),

    /// Transport failure while the session was open.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound audio chunk.
    #[error("decode error: {0}")]
    Decode(String),

    /// Operation not valid in the current session state.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Output device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl LiveError {
    /// Whether this error ends the session it occurred in.
    ///
    /// Decode failures only cost one reply fragment.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_) | Self::SessionOpenFailed(_) | Self::Transport(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LiveError>;
