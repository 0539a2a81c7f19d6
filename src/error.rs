//! Error types for shelfdb.
//!
//! The crate exposes a small closed taxonomy instead of an open-ended report
//! type: callers of an embedded storage library need to distinguish "you
//! passed a bad index" from "the cache is out of slots" from "the file is
//! damaged" programmatically, not by parsing messages.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shelfdb operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Out-of-range index or invalid configuration.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// Operation not valid in the container's current state
    /// (e.g. `pop` on an empty stack).
    #[error("bad operation: {0}")]
    BadOperation(String),

    /// `get`/`set` through a cursor that is at the end or whose element
    /// was erased.
    #[error("bad cursor: {0}")]
    BadCursor(&'static str),

    /// Arithmetic overflow in a size computation.
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    /// File driver failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every cache slot is pinned and another pin was requested.
    #[error("cache exhausted: all {capacity} block slots are pinned")]
    CacheExhausted { capacity: usize },

    /// A self-check detected an invariant violation in persistent state.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl Error {
    pub(crate) fn bad_argument(msg: impl Into<String>) -> Self {
        Error::BadArgument(msg.into())
    }

    pub(crate) fn bad_operation(msg: impl Into<String>) -> Self {
        Error::BadOperation(msg.into())
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}
