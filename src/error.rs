//! Error types for the repository and its upload engine.

/// Crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file or directory with this name already exists.
    #[error("name already present in the directory: {0}")]
    NameConflict(String),

    /// The finished upload hashes to content already stored under another name.
    #[error("content of {name} duplicates existing file {existing}")]
    ContentDuplicate { name: String, existing: String },

    /// A chunk arrived for an upload that timed out, was cancelled, or never started.
    #[error("no live upload for {0}")]
    SessionUnavailable(String),

    #[error("chunk {received} arrived out of sequence, expected {expected}")]
    OutOfSequence { expected: u64, received: u64 },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("chunk exceeds the {limit} byte limit")]
    ChunkTooLarge { limit: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("upload in progress: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failures that leave a session unusable; the engine tears the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ChunkTooLarge { .. })
    }
}
