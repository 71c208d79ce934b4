//! Poll subscription and event records.

use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::errno::Errno;
use crate::fs::Timestamp;
use crate::ids::Fd;

/// Clock a timeout is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Serialize, Deserialize)]
#[repr(u32)]
pub enum ClockId {
    /// Wall-clock time since the Unix epoch.
    Realtime = 0,
    /// Time since the kernel started; never goes backwards.
    Monotonic = 1,
    /// Time since the calling process started.
    ProcessCputime = 2,
    /// Same as `ProcessCputime`; processes are single-threaded.
    ThreadCputime = 3,
}

/// Kind of event a subscription waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// A clock deadline elapsed.
    Clock = 0,
    /// A descriptor has data available to read.
    FdRead = 1,
    /// A descriptor can accept writes.
    FdWrite = 2,
}

/// A clock wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSubscription {
    pub clock: ClockId,
    /// Deadline (if `absolute`) or delay, in nanoseconds.
    pub timeout: Timestamp,
    /// Resolution hint; not honored beyond the host timer's precision.
    pub precision: Timestamp,
    pub absolute: bool,
}

impl ClockSubscription {
    /// A relative timeout on the monotonic clock.
    pub fn relative(timeout: Timestamp) -> Self {
        Self {
            clock: ClockId::Monotonic,
            timeout,
            precision: 0,
            absolute: false,
        }
    }
}

/// What a subscription waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Clock(ClockSubscription),
    FdRead(Fd),
    FdWrite(Fd),
}

/// One entry of a poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Opaque tag echoed back in the matching event.
    pub userdata: u64,
    pub kind: SubscriptionKind,
}

impl Subscription {
    pub fn clock(userdata: u64, clock: ClockSubscription) -> Self {
        Self {
            userdata,
            kind: SubscriptionKind::Clock(clock),
        }
    }

    pub fn fd_read(userdata: u64, fd: Fd) -> Self {
        Self {
            userdata,
            kind: SubscriptionKind::FdRead(fd),
        }
    }

    pub fn fd_write(userdata: u64, fd: Fd) -> Self {
        Self {
            userdata,
            kind: SubscriptionKind::FdWrite(fd),
        }
    }

    /// The event type this subscription reports as.
    pub fn event_type(&self) -> EventType {
        match self.kind {
            SubscriptionKind::Clock(_) => EventType::Clock,
            SubscriptionKind::FdRead(_) => EventType::FdRead,
            SubscriptionKind::FdWrite(_) => EventType::FdWrite,
        }
    }
}

/// Outcome of a single subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollEvent {
    pub userdata: u64,
    /// `None` on success.
    pub error: Option<Errno>,
    pub event_type: EventType,
    /// Bytes available to read or room to write, when known.
    pub nbytes: u64,
}

impl PollEvent {
    pub fn ready(userdata: u64, event_type: EventType, nbytes: u64) -> Self {
        Self {
            userdata,
            error: None,
            event_type,
            nbytes,
        }
    }

    pub fn failed(userdata: u64, event_type: EventType, error: Errno) -> Self {
        Self {
            userdata,
            error: Some(error),
            event_type,
            nbytes: 0,
        }
    }
}
