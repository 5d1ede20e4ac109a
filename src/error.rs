use thiserror::Error;

/// Failure of a single transport attempt towards a subordinate context.
#[derive(Debug, Error)]
pub enum SendError {
    /// The context has no live communication endpoint (yet).
    #[error("subordinate endpoint is not reachable")]
    Unreachable,
    /// The context refused a message scoped to a different origin.
    #[error("target origin {target} does not match subordinate origin {actual}")]
    OriginMismatch { target: String, actual: String },
    /// The context has been disposed or navigated away.
    #[error("subordinate context is closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of the persistent fallback store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistent storage is unavailable")]
    Unavailable,
    #[error("store file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the registry, synchronizers and the host daemon.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The broadcast hub was shut down before this registration.
    #[error("mode registry has been shut down")]
    RegistryClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid subordinate address {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
