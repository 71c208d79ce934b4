//! The filesystem capability.
//!
//! Backends are path-based: every path handed to a [`Filesystem`] is relative
//! to the backend's own root, starts with `/`, and has already been
//! normalized by the mount table (no `.` or `..` components, no repeated
//! slashes). The mount table handles routing and symlink expansion.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use wasmux_types::{
    DeviceId, Errno, FdFlags, Filestat, KernelResult, LookupFlags, OpenFlags, Rights,
};

use super::descriptor::Descriptor;

/// Parameters of an `open` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    pub lookup: LookupFlags,
    pub oflags: OpenFlags,
    pub rights_base: Rights,
    pub rights_inheriting: Rights,
    pub fdflags: FdFlags,
}

impl Default for OpenRequest {
    fn default() -> Self {
        Self {
            lookup: LookupFlags::empty(),
            oflags: OpenFlags::empty(),
            rights_base: Rights::all(),
            rights_inheriting: Rights::all(),
            fdflags: FdFlags::empty(),
        }
    }
}

impl OpenRequest {
    /// Open without expanding symlinks.
    pub fn nofollow() -> Self {
        Self::default()
    }

    /// Open, expanding symlinks along the way.
    pub fn follow() -> Self {
        Self {
            lookup: LookupFlags::SYMLINK_FOLLOW,
            ..Default::default()
        }
    }

    pub fn with_oflags(mut self, oflags: OpenFlags) -> Self {
        self.oflags = oflags;
        self
    }

    pub fn with_fdflags(mut self, fdflags: FdFlags) -> Self {
        self.fdflags = fdflags;
        self
    }

    pub fn with_rights(mut self, base: Rights, inheriting: Rights) -> Self {
        self.rights_base = base;
        self.rights_inheriting = inheriting;
        self
    }

    /// Whether symlinks should be expanded.
    pub fn follows_symlinks(&self) -> bool {
        self.lookup.contains(LookupFlags::SYMLINK_FOLLOW)
    }
}

/// What a backend found when asked to open a path.
pub enum Resolution {
    /// The whole path was walked and opened.
    Complete(Arc<dyn Descriptor>),
    /// The walk met something other than a directory before the path ended.
    /// `end` is the byte offset just past that component; it may be a
    /// symlink the mount table should expand.
    NotDirectory { end: usize },
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Complete(desc) => f
                .debug_tuple("Complete")
                .field(&desc.path())
                .finish(),
            Resolution::NotDirectory { end } => f
                .debug_struct("NotDirectory")
                .field("end", end)
                .finish(),
        }
    }
}

/// Backend-specific options passed at mount time.
///
/// Keys and their meaning belong to the backend; the kernel only carries
/// them. Typical keys are `name`, `create`, `prompt` and `keepMetadata`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions(BTreeMap<String, String>);

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an option.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    /// Boolean option. Accepts yes/on/true and no/off/false in any case.
    ///
    /// `Ok(None)` when the key is absent, `Inval` when the value is not a
    /// recognized boolean.
    pub fn flag(&self, key: &str) -> KernelResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "yes" | "on" | "true" => Ok(Some(true)),
                "no" | "off" | "false" => Ok(Some(false)),
                _ => Err(Errno::Inval),
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MountOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Core filesystem capability.
///
/// All operations may suspend, and all resolve with a status. None of them
/// panic on bad input.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Open `path`.
    ///
    /// Backends never expand symlinks themselves. A symlink in final position
    /// is returned as an open descriptor when `req` asks to follow symlinks,
    /// regardless of `req.oflags`, so the mount table can expand it. A
    /// non-directory met before the last component is reported as
    /// [`Resolution::NotDirectory`].
    async fn open(&self, path: &str, req: &OpenRequest) -> KernelResult<Resolution>;

    /// Create a directory. The parent must exist.
    async fn mkdir(&self, path: &str) -> KernelResult<()>;

    /// Remove a file (`is_dir == false`) or an empty directory.
    async fn unlink(&self, path: &str, is_dir: bool) -> KernelResult<()>;

    /// Rename within this backend, replacing `to` if it exists.
    async fn rename(&self, from: &str, to: &str) -> KernelResult<()>;

    /// Create a symlink at `path` whose text is `target`.
    async fn symlink(&self, target: &str, path: &str) -> KernelResult<()>;

    /// Create a device node.
    async fn mknod(&self, _path: &str, _dev: DeviceId) -> KernelResult<()> {
        Err(Errno::Notsup)
    }

    /// Prepare the backend for mounting. Called once, before the backend
    /// becomes reachable.
    async fn initialize(&self, _opts: &MountOptions) -> KernelResult<()> {
        Ok(())
    }

    /// Attributes of the backend's root directory.
    async fn root_filestat(&self) -> KernelResult<Filestat>;
}
