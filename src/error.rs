//! Error types for sheetsense.
//!
//! Every pipeline stage reports failures through [`Error`]. The binary wraps
//! it with `anyhow` and uses [`Error::stage`] to tell the user which stage
//! aborted the run.

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The spreadsheet could not be reached (auth, network, non-2xx).
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The sheet's header row is missing or malformed.
    #[error("schema error: {0}")]
    Schema(String),

    /// The AI endpoint failed (non-2xx, timeout, unusable response).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The AI provider signalled throttling.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A protocol message did not match the fixed message schema.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The local vector store could not be read or written.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Missing or invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A caller passed an argument the operation cannot accept.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Name of the pipeline stage this error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::SourceUnavailable(_) | Error::Schema(_) => "source",
            Error::Upstream(_) | Error::RateLimited(_) => "analysis",
            Error::ProtocolViolation(_) => "protocol",
            Error::StoreUnavailable(_) => "store",
            Error::Config(_) => "config",
            Error::InvalidInput(_) => "input",
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}
