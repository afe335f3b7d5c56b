//! Error handling and mapping for the FUSE filesystem.
//!
//! Store failures carry an [`ErrorKind`]; this module maps each kind to the
//! POSIX error code returned to the kernel. Adapter-local failures (bad
//! inode, bad handle, out-of-order writes) have their own variants.

use objfs_core::{ErrorKind, StoreError};
use std::io;
use thiserror::Error;
use tracing::{error, warn};

/// FUSE-specific errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FuseError {
    /// Object store error (boxed to reduce enum size).
    #[error("Store operation failed: {0}")]
    Store(Box<StoreError>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid inode.
    #[error("Invalid inode: {0}")]
    InvalidInode(u64),

    /// Invalid file handle.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// The handle's I/O strategy does not support the operation, or was
    /// already torn down.
    #[error("Wrong handle type for operation")]
    WrongHandleType,

    /// A direct write did not land at the running offset.
    #[error("Write at offset {actual}, expected {expected}")]
    OffsetMismatch { expected: u64, actual: u64 },

    /// No entry with this name.
    #[error("No such entry: {0}")]
    NotFound(String),

    /// Names must be non-empty and must not contain `/`.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// The operation is not a file operation.
    #[error("Is a directory")]
    IsDirectory,

    /// The operation needs a directory.
    #[error("Not a directory")]
    NotDirectory,

    /// The handle was opened read-only.
    #[error("Handle is read-only")]
    ReadOnly,

    /// Operation not implemented.
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// A previously recorded errno (e.g. the memoized first flush result).
    #[error("errno {0}")]
    Errno(i32),
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Store(e) => store_error_to_errno(e),
            FuseError::Io(e) => io_error_to_errno(e),
            FuseError::InvalidInode(_) | FuseError::NotFound(_) => libc::ENOENT,
            FuseError::InvalidHandle(_) | FuseError::WrongHandleType => libc::EBADF,
            FuseError::OffsetMismatch { .. } | FuseError::InvalidName(_) => libc::EINVAL,
            FuseError::IsDirectory => libc::EISDIR,
            FuseError::NotDirectory => libc::ENOTDIR,
            FuseError::ReadOnly => libc::EPERM,
            FuseError::NotSupported(_) => libc::ENOSYS,
            FuseError::Errno(code) => *code,
        }
    }

    /// Returns the store error kind, if this is a store error.
    pub fn store_kind(&self) -> Option<ErrorKind> {
        match self {
            FuseError::Store(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Converts an object store error to a libc error code.
///
/// Transient kinds map to retryable codes; nothing is retried here.
pub fn store_error_to_errno(e: &StoreError) -> i32 {
    match e.kind() {
        ErrorKind::Timeout => libc::ETIMEDOUT,
        ErrorKind::Canceled => libc::EINTR,
        ErrorKind::NotExist => libc::ENOENT,
        ErrorKind::Exists => libc::EEXIST,
        ErrorKind::NotAllowed => libc::EACCES,
        ErrorKind::Integrity => {
            warn!(error = %e, "Store integrity error");
            libc::EIO
        }
        ErrorKind::Invalid => {
            warn!(error = %e, "Store rejected request as invalid");
            libc::EINVAL
        }
        ErrorKind::Precondition | ErrorKind::Unavailable => libc::EAGAIN,
        ErrorKind::Net => libc::ENETUNREACH,
        ErrorKind::TooManyTries => {
            error!(error = %e, "Store gave up after retries");
            libc::EINVAL
        }
        ErrorKind::NotSupported => libc::ENOTSUP,
        ErrorKind::Other => e.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// Converts an IO error to a libc error code, falling back to `EIO`.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Result type for FUSE operations.
pub type FuseResult<T> = Result<T, FuseError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for StoreError {
    fn to_errno(&self) -> i32 {
        store_error_to_errno(self)
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

impl ToErrno for FuseError {
    fn to_errno(&self) -> i32 {
        FuseError::to_errno(self)
    }
}

// Manual From implementation to box errors for smaller enum size
impl From<StoreError> for FuseError {
    fn from(e: StoreError) -> Self {
        FuseError::Store(Box::new(e))
    }
}
