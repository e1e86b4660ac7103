//! Federation-specific error types.

use thiserror::Error;

/// Errors that can occur in federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    // ── Bounded containers ──────────────────────────────────────────────────

    #[error("Invalid map capacity {requested} (maximum is {max})")]
    Capacity { requested: usize, max: usize },

    #[error("Map is full: all {capacity} entries are already allocated")]
    MapFull { capacity: usize },

    #[error("{len} entries do not fit a map of capacity {capacity}")]
    TooLarge { len: usize, capacity: usize },

    // ── Canonical signing ───────────────────────────────────────────────────

    #[error("Failed to canonicalize message: {0}")]
    Encoding(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    // ── Key management ──────────────────────────────────────────────────────

    #[error("Invalid key ID '{0}'")]
    InvalidKeyId(String),

    #[error("Failed to load signing key from storage: {0}")]
    KeyLoad(String),

    #[error("Key validity of {0:?} is out of range")]
    Validity(std::time::Duration),

    // ── Streaming ───────────────────────────────────────────────────────────

    #[error("Stream aborted: {0}")]
    StreamAborted(String),

    // ── General ─────────────────────────────────────────────────────────────

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FederationError {
    /// Error code string for logs and for the `Error` wire frame.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "CAPACITY_ERROR",
            Self::MapFull { .. } => "MAP_FULL",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::Encoding(_) => "ENCODING_ERROR",
            Self::Signing(_) => "SIGNING_ERROR",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::InvalidKeyId(_) => "INVALID_KEY_ID",
            Self::KeyLoad(_) => "KEY_LOAD_ERROR",
            Self::Validity(_) => "VALIDITY_ERROR",
            Self::StreamAborted(_) => "STREAM_ABORTED",
            Self::Serialisation(_) => "SERIALISATION_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<bincode::Error> for FederationError {
    fn from(e: bincode::Error) -> Self {
        FederationError::Encoding(e.to_string())
    }
}
