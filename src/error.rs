//! Error types for the tether engine.

/// Top-level error type for the gateway session engine.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Connection or chat transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Missing or rejected auth credentials (user-visible blocking state).
    #[error("auth error: {0}")]
    Auth(String),

    /// Malformed or unexpected protocol traffic that could not be absorbed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Persistence store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TetherError>;
