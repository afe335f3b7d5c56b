//! Typed errors returned by object stores.
//!
//! Every store operation fails with a [`StoreError`], which carries an
//! [`ErrorKind`] from a small fixed taxonomy plus the operation name and
//! remote path. Callers branch on the kind; the adapter maps kinds to errno.

use std::fmt;
use std::io;
use thiserror::Error;

/// Classification of an object store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Anything that does not fit another kind. May wrap an `io::Error`.
    Other,
    /// The operation ran past its deadline.
    Timeout,
    /// The call context was cancelled.
    Canceled,
    /// The object does not exist.
    NotExist,
    /// The object already exists.
    Exists,
    /// Access was denied.
    NotAllowed,
    /// Stored data failed an integrity check.
    Integrity,
    /// The request was malformed.
    Invalid,
    /// A precondition (e.g. a generation match) failed.
    Precondition,
    /// The service is temporarily unavailable.
    Unavailable,
    /// Network failure.
    Net,
    /// The store gave up after retrying.
    TooManyTries,
    /// The store does not implement the operation.
    NotSupported,
}

impl ErrorKind {
    /// Classifies a local I/O error.
    pub fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotExist,
            io::ErrorKind::AlreadyExists => ErrorKind::Exists,
            io::ErrorKind::PermissionDenied => ErrorKind::NotAllowed,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::InvalidInput => ErrorKind::Invalid,
            io::ErrorKind::InvalidData => ErrorKind::Integrity,
            io::ErrorKind::Unsupported => ErrorKind::NotSupported,
            _ => ErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Other => "unknown error",
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::Canceled => "operation was canceled",
            ErrorKind::NotExist => "resource does not exist",
            ErrorKind::Exists => "resource already exists",
            ErrorKind::NotAllowed => "access denied",
            ErrorKind::Integrity => "integrity check failed",
            ErrorKind::Invalid => "invalid argument",
            ErrorKind::Precondition => "precondition failed",
            ErrorKind::Unavailable => "resource unavailable",
            ErrorKind::Net => "network error",
            ErrorKind::TooManyTries => "too many tries",
            ErrorKind::NotSupported => "operation not supported",
        };
        f.write_str(s)
    }
}

/// An error returned by an [`ObjectStore`](crate::ObjectStore) operation.
#[derive(Debug, Error)]
#[error("{op} {path}: {kind}")]
pub struct StoreError {
    kind: ErrorKind,
    op: &'static str,
    path: String,
    #[source]
    source: Option<io::Error>,
}

impl StoreError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, op: &'static str, path: impl Into<String>) -> Self {
        Self {
            kind,
            op,
            path: path.into(),
            source: None,
        }
    }

    /// Wraps a local I/O error, classifying it with [`ErrorKind::from_io`].
    pub fn from_io(op: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        Self {
            kind: ErrorKind::from_io(&source),
            op,
            path: path.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the OS error code of the wrapped I/O error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.as_ref().and_then(io::Error::raw_os_error)
    }

    /// Returns true if the error is [`ErrorKind::NotExist`].
    pub fn is_not_exist(&self) -> bool {
        self.kind == ErrorKind::NotExist
    }
}

/// Result type for object store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let e = StoreError::from_io("open", "a/b", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(e.kind(), ErrorKind::NotExist);
        assert!(e.is_not_exist());

        let e = StoreError::from_io(
            "open",
            "a/b",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(e.kind(), ErrorKind::NotAllowed);
    }

    #[test]
    fn test_raw_os_error_passthrough() {
        // EISDIR on Linux and macOS
        let e = StoreError::from_io("read", "x", io::Error::from_raw_os_error(21));
        assert_eq!(e.raw_os_error(), Some(21));
        assert_eq!(StoreError::new(ErrorKind::Net, "stat", "x").raw_os_error(), None);
    }

    #[test]
    fn test_display_includes_op_and_path() {
        let e = StoreError::new(ErrorKind::Timeout, "list", "bucket/dir/");
        assert_eq!(e.to_string(), "list bucket/dir/: operation timed out");
    }
}
