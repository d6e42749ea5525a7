//! Error types for StrataDB.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in StrataDB operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer pool errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    // Index errors
    #[error("Hash directory full, cannot grow past depth {max_depth}")]
    DirectoryFull { max_depth: u32 },

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
