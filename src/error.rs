//! # Error Handling
//!
//! A single crate-wide error enum covers every failure mode: query
//! compilation, storage, codecs, the snapshot pool, and cancellation.
//! Using one enum keeps function signatures simple and lets callers
//! match on the variants they care about.
//!
//! Two variants deserve special attention:
//!
//! - [`Error::NotFound`] is a *signal*, not necessarily a failure. The
//!   persistence gateway returns it for an absent payload or bitmap so the
//!   applier and the query engine can distinguish "empty" from "missing".
//!   The query engine maps it to an empty bitmap on equality-positive
//!   fetches; the applier treats it as fatal for operations that require an
//!   existing payload.
//! - [`Error::Storage`] wraps any `rusqlite` error via `#[from]`, so the
//!   `?` operator converts them automatically. `QueryReturnedNoRows` must
//!   never reach this variant - gateway methods that can legitimately find
//!   nothing translate it to [`Error::NotFound`] first.

use thiserror::Error;

/// All errors that can occur in store operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Query compilation
    // =========================================================================
    /// The query string is not syntactically valid.
    #[error("parse error: {0}")]
    Parse(String),

    /// The query is syntactically valid but ill-typed: mixed value types in
    /// an `IN (...)` list, or a string literal on a numeric-only attribute.
    #[error("type error: {0}")]
    Type(String),

    // =========================================================================
    // Storage
    // =========================================================================
    /// An expected payload or bitmap is absent.
    #[error("not found")]
    NotFound,

    /// The underlying SQLite store failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The on-disk schema does not match what this build expects.
    #[error("schema error: {0}")]
    Schema(String),

    /// A persisted blob (bitmap or attribute map) failed to decode.
    #[error("codec error: {0}")]
    Codec(String),

    // =========================================================================
    // Snapshot pool
    // =========================================================================
    /// The live `last-block` did not reach the requested block in time.
    #[error("block {requested} not ready: last committed block is {last}")]
    BlockNotReady { requested: u64, last: u64 },

    /// The requested block is beyond the last committed block.
    #[error("block {requested} is in the future: last committed block is {last}")]
    FutureBlock { requested: u64, last: u64 },

    /// The requested block fell off the back of the snapshot ring.
    #[error("block {requested} is no longer available in the snapshot ring")]
    BlockRetired { requested: u64 },

    /// A historic transaction handle was used after being returned to its pool.
    #[error("historic transaction has been returned to the pool")]
    HandleReturned,

    /// A freshly pinned read transaction did not land on the expected block.
    #[error("snapshot pinned at block {actual}, expected {expected}")]
    SnapshotPin { expected: u64, actual: u64 },

    // =========================================================================
    // Control flow
    // =========================================================================
    /// The caller's cancellation token fired, or the store is shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// An error propagated from the upstream event source.
    #[error("event source error: {0}")]
    Upstream(String),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Maps `QueryReturnedNoRows` to [`Error::NotFound`], everything else to
/// [`Error::Storage`]. Gateway methods with a legitimate "absent" outcome
/// route their errors through here.
pub(crate) fn not_found_on_no_rows(err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
        other => Error::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::FutureBlock {
            requested: 12,
            last: 9,
        };
        assert_eq!(
            err.to_string(),
            "block 12 is in the future: last committed block is 9"
        );

        let err = Error::BlockRetired { requested: 3 };
        assert_eq!(
            err.to_string(),
            "block 3 is no longer available in the snapshot ring"
        );
    }

    #[test]
    fn sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Storage(_)));
    }

    #[test]
    fn no_rows_becomes_not_found() {
        let err = not_found_on_no_rows(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, Error::NotFound));
    }
}
