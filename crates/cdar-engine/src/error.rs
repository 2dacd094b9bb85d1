//! Error types for the cdar engine

/// All errors that can occur while packing or unpacking an archive
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Source, destination or store I/O failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A chunk failed to compress or its stored bytes failed to decode
    #[error("Codec error: {0}")]
    Codec(String),
    /// The dictionary violates a structural invariant
    #[error("Invalid dictionary: {0}")]
    DictionaryInvalid(String),
    /// Stored bytes for a referenced chunk are missing
    #[error("Chunk {checksum} not found in store: {reason}")]
    StoreNotFound {
        /// Hex checksum of the missing chunk
        checksum: String,
        /// What was missing (file, range)
        reason: String,
    },
    /// Reconstructed content does not match the recorded checksum
    #[error("Verification failed for {what}: expected {expected}, got {actual}")]
    Verification {
        /// What was verified (the whole file or a single chunk)
        what: String,
        /// Expected hex checksum
        expected: String,
        /// Computed hex checksum
        actual: String,
    },
    /// Chunker or pack parameters are out of range
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    /// Archive header is malformed
    #[error("Archive format error: {0}")]
    ArchiveFormat(String),
    /// The operation was cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl From<prost::DecodeError> for ArchiveError {
    fn from(e: prost::DecodeError) -> Self {
        ArchiveError::DictionaryInvalid(format!("undecodable dictionary: {e}"))
    }
}

impl From<tokio::task::JoinError> for ArchiveError {
    fn from(e: tokio::task::JoinError) -> Self {
        ArchiveError::Io(std::io::Error::other(format!("worker task failed: {e}")))
    }
}
