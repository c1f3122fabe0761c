use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot resolve storage backend '{0}'")]
    Resolve(String),

    /// Failure reading the caller's source stream during a write. Surfaced
    /// immediately; the write is aborted without waiting for replicas.
    #[error("Failed reading blob source: {0}")]
    Transfer(std::io::Error),

    /// A replica accepted a blob but reported a size that disagrees with
    /// the bytes actually read from the source. Counts as that replica's
    /// failure even though its call returned no error.
    #[error("Replica reported size {actual}, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Insufficient successful writes: {succeeded} of {required} required")]
    InsufficientWrites { succeeded: usize, required: usize },

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob reference: {0}")]
    InvalidRef(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
