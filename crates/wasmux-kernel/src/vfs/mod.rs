//! Virtual filesystem.
//!
//! Key components:
//!
//! - [`Descriptor`] - Open handle capability every backend object implements
//! - [`Filesystem`] - Backend capability (open, mkdir, unlink, rename, ...)
//! - [`MountTable`] - Routes paths to backends and expands symlinks
//! - [`EventSink`] - Optional capability for descriptors that take signals
//!
//! ## Design Decisions
//!
//! - **Path-based backends**: backends receive normalized paths relative to
//!   their own root; only the mount table knows the global namespace.
//! - **Symlinks in the core**: backends report symlinks but never follow
//!   them, so expansion across mounts and the hop limit live in one place.
//! - **Longest-prefix routing**: the most specific mount point wins.

pub mod backends;
mod descriptor;
mod filesystem;
mod mount;
pub mod path;

#[cfg(any(test, feature = "test-mock"))]
pub use backends::{MemDescriptor, MemoryFs};
pub use descriptor::{Descriptor, EventSink};
pub use filesystem::{Filesystem, MountOptions, OpenRequest, Resolution};
pub use mount::{MountInfo, MountTable, Resolved};
