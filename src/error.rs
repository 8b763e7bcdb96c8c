//! Error types for patchfs

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the overlay
///
/// Host failures are folded into this set by their raw errno, so every error
/// can be handed back to the kernel with the code it originally carried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Mutating operation on the read-only overlay
    #[error("read-only filesystem")]
    ReadOnly,

    /// Backing path does not exist
    #[error("no such file or directory")]
    NotFound,

    /// Host access check failed
    #[error("permission denied")]
    PermissionDenied,

    /// Any other host error, carrying its original errno
    #[error("os error {0}")]
    Os(i32),

    /// Startup configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// External unmount helper failed
    #[error("unmount failed: {0}")]
    Unmount(String),
}

impl Error {
    /// Build an error from a raw errno value
    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::ENOENT => Error::NotFound,
            libc::EACCES => Error::PermissionDenied,
            libc::EROFS => Error::ReadOnly,
            other => Error::Os(other),
        }
    }

    /// Errno to report back through FUSE
    pub fn errno(&self) -> i32 {
        match self {
            Error::ReadOnly => libc::EROFS,
            Error::NotFound => libc::ENOENT,
            Error::PermissionDenied => libc::EACCES,
            Error::Os(code) => *code,
            Error::InvalidConfig(_) => libc::EINVAL,
            Error::Unmount(_) => libc::EIO,
        }
    }

    /// Whether this error is part of normal overlay operation
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Error::ReadOnly | Error::NotFound | Error::PermissionDenied
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from_errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::from_errno(err as i32)
    }
}
