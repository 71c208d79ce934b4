//! Status codes.
//!
//! Every interface boundary in the kernel reports failure through [`Errno`].
//! The numbering follows the WASI `errno` table so a status can be handed to a
//! guest without translation. Success has no variant: it is `Ok(_)` on the
//! Rust side and [`ESUCCESS`] on the wire.

use serde::{Deserialize, Serialize};
use strum::FromRepr;
use thiserror::Error;

/// Wire value for a successful call.
pub const ESUCCESS: u16 = 0;

/// Kernel status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, FromRepr, Serialize, Deserialize)]
#[repr(u16)]
pub enum Errno {
    /// Argument list too long.
    #[error("argument list too long")]
    TooBig = 1,

    /// Permission denied.
    #[error("permission denied")]
    Acces = 2,

    /// Resource unavailable, try again.
    #[error("resource unavailable, try again")]
    Again = 6,

    /// Bad file descriptor.
    #[error("bad file descriptor")]
    Badf = 8,

    /// Device or resource busy.
    #[error("device or resource busy")]
    Busy = 10,

    /// Operation canceled.
    #[error("operation canceled")]
    Canceled = 11,

    /// No child processes.
    #[error("no child processes")]
    Child = 12,

    /// File exists.
    #[error("file exists")]
    Exist = 20,

    /// Bad address.
    #[error("bad address")]
    Fault = 21,

    /// Interrupted function.
    #[error("interrupted function")]
    Intr = 27,

    /// Invalid argument.
    #[error("invalid argument")]
    Inval = 28,

    /// I/O error.
    #[error("I/O error")]
    Io = 29,

    /// Is a directory.
    #[error("is a directory")]
    Isdir = 31,

    /// Too many levels of symbolic links.
    #[error("too many levels of symbolic links")]
    Loop = 32,

    /// File descriptor value too large.
    #[error("file descriptor value too large")]
    Mfile = 33,

    /// Filename too long.
    #[error("filename too long")]
    Nametoolong = 37,

    /// No buffer space available.
    #[error("no buffer space available")]
    Nobufs = 42,

    /// No such device.
    #[error("no such device")]
    Nodev = 43,

    /// No such file or directory.
    #[error("no such file or directory")]
    Noent = 44,

    /// Executable file format error.
    #[error("executable file format error")]
    Noexec = 45,

    /// Not enough space.
    #[error("not enough space")]
    Nomem = 48,

    /// Function not supported.
    #[error("function not supported")]
    Nosys = 52,

    /// Not a directory or a symbolic link to a directory.
    #[error("not a directory")]
    Notdir = 54,

    /// Directory not empty.
    #[error("directory not empty")]
    Notempty = 55,

    /// Not supported.
    #[error("not supported")]
    Notsup = 58,

    /// Inappropriate I/O control operation.
    #[error("inappropriate I/O control operation")]
    Notty = 59,

    /// Operation not permitted.
    #[error("operation not permitted")]
    Perm = 63,

    /// Broken pipe.
    #[error("broken pipe")]
    Pipe = 64,

    /// Read-only file system.
    #[error("read-only file system")]
    Rofs = 69,

    /// Invalid seek.
    #[error("invalid seek")]
    Spipe = 70,

    /// No such process.
    #[error("no such process")]
    Srch = 71,

    /// Cross-device link.
    #[error("cross-device link")]
    Xdev = 75,
}

impl Errno {
    /// The wire value of this status.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Decode a wire value. Returns `Ok(())` for [`ESUCCESS`] and `None` for
    /// codes this kernel never produces.
    pub fn from_code(code: u16) -> Option<Result<(), Errno>> {
        if code == ESUCCESS {
            return Some(Ok(()));
        }
        Errno::from_repr(code).map(Err)
    }
}

/// Encode a kernel result as a wire status.
pub fn status_of<T>(result: &Result<T, Errno>) -> u16 {
    match result {
        Ok(_) => ESUCCESS,
        Err(e) => e.code(),
    }
}

/// Result type used across every kernel interface.
pub type KernelResult<T> = Result<T, Errno>;
