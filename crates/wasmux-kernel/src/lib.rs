//! # wasmux-kernel
//!
//! Kernel core for wasmux, a multi-process environment for WebAssembly
//! programs hosted inside a single runtime.
//!
//! A kernel:
//! - Owns `/` and routes every path to the backend mounted at its longest
//!   matching prefix, expanding symlinks across mounts
//! - Gives each process a descriptor table over shared open descriptors
//! - Spawns and terminates processes through an external execution host
//! - Multiplexes clock and descriptor readiness in `poll_oneoff`
//! - Delivers interrupts and window changes as events or terminations

pub mod channel;
pub mod config;
pub mod fd_table;
pub mod kernel;
pub mod poll;
pub mod process;
pub mod signal;
#[cfg(any(test, feature = "test-mock"))]
pub mod testing;
pub mod vfs;

pub use channel::{GuestEndpoint, KernelEndpoint, PendingCall, channel};
pub use config::{ConfigError, KernelConfig};
pub use fd_table::{DescriptorEntry, FdTable};
pub use kernel::Kernel;
pub use poll::{PollOutcome, PollSub, WaitQueue};
pub use process::{
    CompileError, Executable, ExecutionHost, ExecutionUnit, ExitWaiter, Foreground, Launch,
    ProcessManager, ProcessSnapshot, ProcessState, SpawnRequest, Spawned,
};
pub use signal::EventSource;
pub use vfs::{
    Descriptor, EventSink, Filesystem, MountInfo, MountOptions, MountTable, OpenRequest,
    Resolution, Resolved,
};

pub use wasmux_types as types;
