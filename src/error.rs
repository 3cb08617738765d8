//! Error types for Quaver.

use thiserror::Error;

/// Result type alias using Quaver's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Quaver operations.
///
/// Backpressure ([`Error::QueueFull`]) is always returned to the immediate
/// caller and never silently dropped. Signal interruption during blocking
/// I/O is retried internally and never surfaced as an error.
#[derive(Error, Debug)]
pub enum Error {
    /// A non-blocking queue operation could not proceed.
    #[error("queue full: operation would block")]
    QueueFull,

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
