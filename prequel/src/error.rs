//! Error kinds shared by every layer of the library.
//!
//! Errors are surfaced to the caller unchanged; nothing in the core is
//! allowed to swallow a failure silently. A failed write during cache
//! eviction has no caller to report to synchronously, so the engine stashes
//! it and re-raises it on the next operation that touches the affected
//! block (see [`crate::engine::Engine`]).

use thiserror::Error;

/// The error type returned by every fallible operation in this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller supplied an invalid input that is detectable without I/O:
    /// an out-of-range index, invalid cursor use, an impossible size, a
    /// double free.
    #[error("invalid argument: {0}")]
    BadArgument(String),

    /// The allocator could not satisfy a request: growth is disabled, or
    /// the backing file cannot be grown further.
    #[error("allocation failed: {0}")]
    BadAlloc(String),

    /// An operation was attempted on a closed or otherwise unusable object.
    #[error("invalid operation: {0}")]
    BadOperation(String),

    /// A failure reported by the VFS/file layer, a short read/write, or an
    /// invalid on-disk encoding (such as an out-of-range variant tag).
    #[error("I/O error: {0}")]
    Io(String),

    /// `validate()` detected an invariant violation: a broken sort order,
    /// mismatched counts, or a dangling link.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl Error {
    /// Shorthand for [`Error::BadArgument`].
    pub fn bad_argument(msg: impl Into<String>) -> Self {
        Error::BadArgument(msg.into())
    }

    /// Shorthand for [`Error::BadAlloc`].
    pub fn bad_alloc(msg: impl Into<String>) -> Self {
        Error::BadAlloc(msg.into())
    }

    /// Shorthand for [`Error::BadOperation`].
    pub fn bad_operation(msg: impl Into<String>) -> Self {
        Error::BadOperation(msg.into())
    }

    /// Shorthand for [`Error::Corruption`].
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
