//! Flag sets carried by open requests and descriptors.
//!
//! Bit positions match the WASI preview1 ABI, with one extension bit
//! ([`FdFlags::CLOEXEC`]) for close-on-exec and a kernel-private event
//! mask ([`Events`]) for signal delivery.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags that control how a path is walked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LookupFlags: u32 {
        /// Expand symbolic links met during resolution.
        const SYMLINK_FOLLOW = 1 << 0;
    }
}

bitflags! {
    /// Flags for opening a path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OpenFlags: u16 {
        /// Create the file if it does not exist.
        const CREAT = 1 << 0;
        /// Fail unless the path is a directory.
        const DIRECTORY = 1 << 1;
        /// Fail if the file already exists.
        const EXCL = 1 << 2;
        /// Truncate the file to size 0.
        const TRUNC = 1 << 3;
    }
}

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FdFlags: u16 {
        /// Append mode: writes go to the end of the file.
        const APPEND = 1 << 0;
        /// Synchronized data integrity writes.
        const DSYNC = 1 << 1;
        /// Non-blocking mode.
        const NONBLOCK = 1 << 2;
        /// Synchronized read I/O.
        const RSYNC = 1 << 3;
        /// Synchronized file integrity writes.
        const SYNC = 1 << 4;
        /// Close the descriptor when a child process inherits the table.
        const CLOEXEC = 1 << 5;
    }
}

bitflags! {
    /// Rights granted to a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Rights: u64 {
        const FD_DATASYNC = 1 << 0;
        const FD_READ = 1 << 1;
        const FD_SEEK = 1 << 2;
        const FD_FDSTAT_SET_FLAGS = 1 << 3;
        const FD_SYNC = 1 << 4;
        const FD_TELL = 1 << 5;
        const FD_WRITE = 1 << 6;
        const FD_ADVISE = 1 << 7;
        const FD_ALLOCATE = 1 << 8;
        const PATH_CREATE_DIRECTORY = 1 << 9;
        const PATH_CREATE_FILE = 1 << 10;
        const PATH_LINK_SOURCE = 1 << 11;
        const PATH_LINK_TARGET = 1 << 12;
        const PATH_OPEN = 1 << 13;
        const FD_READDIR = 1 << 14;
        const PATH_READLINK = 1 << 15;
        const PATH_RENAME_SOURCE = 1 << 16;
        const PATH_RENAME_TARGET = 1 << 17;
        const PATH_FILESTAT_GET = 1 << 18;
        const PATH_FILESTAT_SET_SIZE = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET = 1 << 21;
        const FD_FILESTAT_SET_SIZE = 1 << 22;
        const FD_FILESTAT_SET_TIMES = 1 << 23;
        const PATH_SYMLINK = 1 << 24;
        const PATH_REMOVE_DIRECTORY = 1 << 25;
        const PATH_UNLINK_FILE = 1 << 26;
        const POLL_FD_READWRITE = 1 << 27;
        const SOCK_SHUTDOWN = 1 << 28;
        const SOCK_ACCEPT = 1 << 29;
    }
}

impl Default for Rights {
    fn default() -> Self {
        Rights::all()
    }
}

bitflags! {
    /// Asynchronous events a process can receive through an event sink.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Events: u32 {
        /// Interrupt from the controlling terminal.
        const SIGINT = 1 << 0;
        /// Terminal window size changed.
        const WINCH = 1 << 1;
    }
}

/// WASI signal number for SIGINT.
pub const SIGINT: u32 = 2;

/// WASI signal number for SIGKILL.
pub const SIGKILL: u32 = 9;

/// Exit status of a process killed because an ancestor terminated.
pub const EXIT_KILLED: u32 = 128 + SIGKILL;

/// Exit status of a process stopped by an interrupt.
pub const EXIT_INTERRUPTED: u32 = 128 + SIGINT;
