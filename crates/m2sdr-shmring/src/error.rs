//! Error types for the shared-memory ring.

use thiserror::Error;

/// Errors that can occur while creating or using a ring.
#[derive(Error, Debug)]
pub enum ShmError {
    /// Failed to create, size or open the backing file
    #[error("ring file error: {0}")]
    File(String),

    /// Failed to map the file into the address space
    #[error("memory mapping error: {0}")]
    Mmap(String),

    /// Header geometry does not describe a usable ring
    #[error("invalid ring header: {0}")]
    InvalidHeader(String),

    /// Malformed creation parameters
    #[error("invalid ring configuration: {0}")]
    InvalidConfig(String),

    /// Chunk length does not match the ring's chunk_bytes
    #[error("chunk of {got} bytes, ring expects {expected}")]
    ChunkSize { got: usize, expected: usize },

    /// Blocking write exceeded its deadline
    #[error("timed out waiting for ring space")]
    Timeout,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ring operations.
pub type ShmResult<T> = Result<T, ShmError>;
