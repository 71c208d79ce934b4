//! Shared types for wasmux.
//!
//! This crate is the leaf of the workspace: status codes, flag sets, file
//! metadata, identifiers and poll records. It has no internal dependencies,
//! so filesystem backends and device drivers can implement the kernel's
//! capability traits against these types alone.
//!
//! |-------------------|-------------------------------------------------|
//! | Type              | Purpose                                         |
//! |-------------------|-------------------------------------------------|
//! | [`Errno`]         | Status code returned across every interface     |
//! | [`Pid`]           | Process id, monotonic and never reused          |
//! | [`Fd`]            | Descriptor table slot                           |
//! | [`Rights`]        | Operation categories a descriptor may perform   |
//! | [`Filestat`]      | File metadata                                   |
//! | [`Subscription`]  | One poll request entry                          |
//! |-------------------|-------------------------------------------------|

pub mod errno;
pub mod flags;
pub mod fs;
pub mod ids;
pub mod poll;

pub use errno::{ESUCCESS, Errno, KernelResult, status_of};
pub use flags::{
    EXIT_INTERRUPTED, EXIT_KILLED, Events, FdFlags, LookupFlags, OpenFlags, Rights, SIGINT,
    SIGKILL,
};
pub use fs::{Dircookie, Dirent, Fdstat, FileType, Filestat, Timestamp, Whence};
pub use ids::{DeviceId, Fd, Pid, TerminalId};
pub use poll::{
    ClockId, ClockSubscription, EventType, PollEvent, Subscription, SubscriptionKind,
};

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
