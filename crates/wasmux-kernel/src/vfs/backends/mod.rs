//! Filesystem backends.
//!
//! Production backends live with the embedder; the kernel ships an
//! in-memory tree for exercising the capability contracts.

#[cfg(any(test, feature = "test-mock"))]
mod memory;

#[cfg(any(test, feature = "test-mock"))]
pub use memory::{MemDescriptor, MemoryFs};
