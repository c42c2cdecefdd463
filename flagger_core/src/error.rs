use std::sync::Arc;

/// Represents a result type for operations in the Flagger SDK.
///
/// This `Result` type is a standard Rust `Result` type where the error
/// variant is defined by the flagger-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Flagger SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Initialization arguments failed validation: empty API key, empty SDK
    /// name/version, or a URL that does not parse as absolute.
    #[error("bad init arguments")]
    BadInitArgs,

    /// Both the primary and the backup configuration sources were exhausted.
    /// The SDK stays disabled: flag functions return defaults and ingestion
    /// accepts no data.
    #[error("unable to fetch configuration from source and backup URLs")]
    ConfigurationFetchFailed,

    /// Transient network error; feeds the retry logic.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Transport(Arc<reqwest::Error>),

    /// Bad JSON in a response body or an SSE frame. Logged and skipped; the
    /// connection continues.
    #[error("failed to parse payload")]
    Parse(#[source] Arc<serde_json::Error>),

    /// A payload was evicted from the retry queue to make room, or was too
    /// large to ever fit.
    #[error("retry queue overflow, payload evicted")]
    QueueOverflow,

    /// Indicates that the background runtime thread panicked. This should
    /// normally never happen.
    #[error("flagger runtime thread panicked")]
    RuntimePanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Transport(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}
