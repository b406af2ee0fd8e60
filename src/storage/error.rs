use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("access of {length} bytes at offset {offset} exceeds size {size}")]
    OutOfBounds { offset: u64, length: usize, size: u64 },

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}
