//! Error types shared across the filesystem engine.
//!
//! Every fallible operation in the crate returns one of the variants defined
//! here. The set is closed: backends and internal layers map their failures
//! onto it rather than defining their own error types.

use core::fmt::{self, Display};
use std::io;

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Standard result type for filesystem operations.
pub type FsResult<T> = Result<T, Error>;

/// Failure kinds surfaced by the filesystem engine.
///
/// Path and allocator errors are returned to the caller without mutating any
/// state. [`Error::Corrupt`] is fatal to the mount: no further writes are
/// issued once it has been observed.
#[derive(Debug)]
pub enum Error {
    /// A path component does not exist.
    NotFound,

    /// The name is already taken on create, or a rename target exists.
    Exists,

    /// The data block bitmaps are exhausted.
    NoSpace,

    /// The inode bitmaps are exhausted.
    NoInode,

    /// Malformed path, bad file descriptor, bad offset or parameter.
    Invalid,

    /// Backend I/O failure.
    Io(io::Error),

    /// An on-disk invariant violation was discovered during an operation.
    Corrupt,

    /// The resource is held (open file table slot, busy device).
    Busy,

    /// The request exceeds the maximum file size.
    TooLarge,

    /// Directory removal attempted on a non-empty directory.
    NotEmpty,

    /// The path resolved to something that is not a directory.
    NotDirectory,

    /// The operation expects a regular file but found a directory.
    IsDirectory,

    /// The mount previously failed permanently; mutations are rejected.
    Errored,

    /// The backend cannot express the requested operation.
    Unsupported,
}

impl Error {
    /// Wraps the current OS error (`errno`) into [`Error::Io`].
    pub(crate) fn last_os_error() -> Self {
        Error::Io(io::Error::last_os_error())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => f.write_str("no such file or directory"),
            Error::Exists => f.write_str("name already exists"),
            Error::NoSpace => f.write_str("no free data blocks"),
            Error::NoInode => f.write_str("no free inodes"),
            Error::Invalid => f.write_str("invalid argument"),
            Error::Io(e) => write!(f, "backend i/o error: {e}"),
            Error::Corrupt => f.write_str("filesystem inconsistency detected"),
            Error::Busy => f.write_str("resource busy"),
            Error::TooLarge => f.write_str("file too large"),
            Error::NotEmpty => f.write_str("directory not empty"),
            Error::NotDirectory => f.write_str("not a directory"),
            Error::IsDirectory => f.write_str("is a directory"),
            Error::Errored => f.write_str("filesystem is in errored state"),
            Error::Unsupported => f.write_str("operation not supported by backend"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}
