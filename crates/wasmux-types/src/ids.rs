//! Identifiers for processes, descriptors, and devices.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A slot number in a process's descriptor table.
pub type Fd = u32;

/// A process identifier.
///
/// Allocated monotonically by the process manager and never reused. The
/// default is [`Pid::INIT`].
#[derive(Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(u32);

impl Pid {
    /// The first process started by a kernel.
    pub const INIT: Pid = Pid(0);

    /// Wrap a raw process number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw process number.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The id allocated after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u32> for Pid {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

/// Major/minor pair naming a device node.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DeviceId {
    /// Driver number.
    pub major: u32,
    /// Instance number within the driver.
    pub minor: u32,
}

impl DeviceId {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// A terminal is addressed by its device node.
pub type TerminalId = DeviceId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_ordering() {
        let a = Pid::INIT;
        let b = a.next();
        assert!(a < b);
        assert_eq!(b.get(), 1);
        assert_eq!(Pid::default(), Pid::INIT);
        assert_eq!(format!("{b}"), "1");
        assert_eq!(format!("{b:?}"), "Pid(1)");
    }

    #[test]
    fn test_device_display() {
        assert_eq!(DeviceId::new(1, 0).to_string(), "1:0");
    }
}
