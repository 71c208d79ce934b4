//! The descriptor capability.
//!
//! A [`Descriptor`] is an open handle to a file, directory, device or
//! symlink. Every backend variant implements it; the kernel never looks
//! behind the trait object. Operations that make no sense for the object
//! (writing to a directory, listing a regular file) fall through to the
//! provided defaults, which return a fixed "wrong file type" status instead
//! of failing in some backend-specific way.

use async_trait::async_trait;
use tokio::sync::oneshot;

use wasmux_types::{
    Dirent, Errno, Events, FdFlags, Fdstat, FileType, Filestat, KernelResult, Rights, Timestamp,
    Whence,
};

use crate::poll::PollSub;

/// Open handle to a filesystem object.
///
/// Descriptors are shared: a table slot holds an `Arc<dyn Descriptor>`, and
/// `dup`/inheritance put the same `Arc` in a second slot after calling
/// [`Descriptor::duplicate`]. Implementations therefore use interior
/// mutability for cursors and cached state, and count references themselves
/// if `close` must only release the resource on the last one.
#[async_trait]
pub trait Descriptor: Send + Sync {
    // ========================================================================
    // Identity and metadata
    // ========================================================================

    /// Descriptor attributes (type, flags, rights).
    async fn fdstat(&self) -> Fdstat;

    /// Attributes of the underlying object.
    async fn filestat(&self) -> KernelResult<Filestat>;

    /// Real absolute path this descriptor was opened at.
    ///
    /// Empty until [`Descriptor::initialize`] ran.
    fn path(&self) -> String;

    /// Record the resolved absolute path. The resolver calls this exactly once
    /// before handing the descriptor out.
    async fn initialize(&self, path: &str) -> KernelResult<()>;

    /// Set access and modification times. `None` leaves a time unchanged.
    async fn set_filestat_times(
        &self,
        _atim: Option<Timestamp>,
        _mtim: Option<Timestamp>,
    ) -> KernelResult<()> {
        Err(Errno::Notsup)
    }

    async fn set_fdstat_flags(&self, _flags: FdFlags) -> KernelResult<()> {
        Err(Errno::Notsup)
    }

    async fn set_fdstat_rights(&self, _base: Rights, _inheriting: Rights) -> KernelResult<()> {
        Err(Errno::Notsup)
    }

    /// Whether this descriptor is a terminal.
    fn isatty(&self) -> bool {
        false
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Release one reference to the descriptor.
    async fn close(&self) -> KernelResult<()> {
        Ok(())
    }

    /// Called when a second descriptor-table slot starts sharing this handle.
    fn duplicate(&self) {}

    // ========================================================================
    // I/O
    // ========================================================================

    /// Read up to `len` bytes at the cursor and advance it.
    async fn read(&self, _len: usize) -> KernelResult<Vec<u8>> {
        Err(self.wrong_type().await)
    }

    /// Read up to `len` bytes at `pos` without moving the cursor.
    async fn pread(&self, _len: usize, _pos: u64) -> KernelResult<Vec<u8>> {
        Err(self.wrong_type().await)
    }

    /// Write at the cursor (or the end, in append mode). Returns bytes written.
    async fn write(&self, _buf: &[u8]) -> KernelResult<u64> {
        Err(self.wrong_type().await)
    }

    /// Write at `pos` without moving the cursor.
    async fn pwrite(&self, _buf: &[u8], _pos: u64) -> KernelResult<u64> {
        Err(self.wrong_type().await)
    }

    /// Move the cursor. Returns the new absolute offset.
    async fn seek(&self, _offset: i64, _whence: Whence) -> KernelResult<u64> {
        Err(self.wrong_type().await)
    }

    async fn truncate(&self, _size: u64) -> KernelResult<()> {
        Err(self.wrong_type().await)
    }

    /// List directory entries. `refresh` re-reads the backing store instead
    /// of serving a cached listing.
    async fn readdir(&self, _refresh: bool) -> KernelResult<Vec<Dirent>> {
        Err(Errno::Notdir)
    }

    /// Whole contents of the object.
    async fn read_to_end(&self) -> KernelResult<Vec<u8>> {
        let stat = self.filestat().await?;
        self.pread(stat.size as usize, 0).await
    }

    /// Contents as UTF-8. Meant for short text such as symlink targets.
    async fn read_str(&self) -> KernelResult<String> {
        let bytes = self.read_to_end().await?;
        String::from_utf8(bytes).map_err(|_| Errno::Inval)
    }

    // ========================================================================
    // Readiness and events
    // ========================================================================

    /// Queue a readiness subscription.
    ///
    /// The descriptor must eventually resolve `sub`, either right away when it
    /// is already ready or later from its own wait queue. The default answers
    /// immediately with `Notsup`.
    async fn add_poll_sub(&self, sub: PollSub) {
        sub.fail(Errno::Notsup);
    }

    /// The event-sink capability, for descriptors that accept signals.
    fn as_event_sink(&self) -> Option<&dyn EventSink> {
        None
    }

    /// Status for an operation that does not apply to this object type.
    async fn wrong_type(&self) -> Errno {
        match self.fdstat().await.filetype {
            FileType::Directory => Errno::Isdir,
            _ => Errno::Badf,
        }
    }
}

/// Descriptors that receive asynchronous events from the kernel.
pub trait EventSink: Send + Sync {
    /// Events this sink accepts.
    fn mask(&self) -> Events;

    /// Deliver events. Bits outside [`EventSink::mask`] are dropped.
    fn send_events(&self, events: Events);

    /// Take and clear the pending events selected by `events`.
    fn obtain_events(&self, events: Events) -> Events;

    /// Make this sink the interrupt notifier for a process.
    ///
    /// The returned receiver completes once the registration ends: when the
    /// descriptor closes or another process registers in its place. Fails
    /// with `Inval` if the sink does not accept interrupts.
    fn make_notifier(&self) -> KernelResult<oneshot::Receiver<()>>;
}
