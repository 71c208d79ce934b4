//! Event delivery to processes.
//!
//! An [`EventSource`] is a character device a process opens to receive
//! asynchronous events (interrupt, window change). The kernel pushes events
//! into it; the process reads them as a 4-byte little-endian mask or polls it
//! for readiness. A source that accepts interrupts can also be registered as
//! the process's interrupt notifier, which tells the kernel to deliver SIGINT
//! as an event instead of terminating the process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use wasmux_types::{
    Errno, EventType, Events, FdFlags, Fdstat, FileType, Filestat, KernelResult, Rights,
    Timestamp,
};

use crate::poll::{PollSub, WaitQueue};
use crate::vfs::{Descriptor, EventSink};

/// Size of one read: the pending mask as a little-endian `u32`.
pub const EVENT_READ_LEN: usize = 4;

#[derive(Debug)]
struct SourceState {
    pending: Events,
    fd_flags: FdFlags,
    rights_base: Rights,
    rights_inheriting: Rights,
    notifier: Option<oneshot::Sender<()>>,
}

/// Character device that collects events for one process.
#[derive(Debug)]
pub struct EventSource {
    mask: Events,
    state: Mutex<SourceState>,
    waiters: WaitQueue,
    /// Table slots sharing this source, across processes.
    refs: AtomicUsize,
}

impl EventSource {
    /// A source accepting the events in `mask`.
    pub fn new(mask: Events) -> Self {
        Self {
            mask,
            state: Mutex::new(SourceState {
                pending: Events::empty(),
                fd_flags: FdFlags::empty(),
                rights_base: Rights::FD_READ | Rights::POLL_FD_READWRITE | Rights::FD_FDSTAT_SET_FLAGS,
                rights_inheriting: Rights::empty(),
                notifier: None,
            }),
            waiters: WaitQueue::new(),
            refs: AtomicUsize::new(1),
        }
    }

    /// Events delivered but not yet read.
    pub fn pending(&self) -> Events {
        self.state.lock().pending
    }

    /// Whether a notifier registration is currently held.
    pub fn has_notifier(&self) -> bool {
        self.state
            .lock()
            .notifier
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Descriptor for EventSource {
    async fn fdstat(&self) -> Fdstat {
        let state = self.state.lock();
        Fdstat {
            filetype: FileType::CharacterDevice,
            flags: state.fd_flags,
            rights_base: state.rights_base,
            rights_inheriting: state.rights_inheriting,
        }
    }

    async fn filestat(&self) -> KernelResult<Filestat> {
        Ok(Filestat::of_type(FileType::CharacterDevice))
    }

    fn path(&self) -> String {
        String::new()
    }

    async fn initialize(&self, _path: &str) -> KernelResult<()> {
        Ok(())
    }

    async fn set_filestat_times(
        &self,
        _atim: Option<Timestamp>,
        _mtim: Option<Timestamp>,
    ) -> KernelResult<()> {
        Ok(())
    }

    async fn set_fdstat_flags(&self, flags: FdFlags) -> KernelResult<()> {
        self.state.lock().fd_flags = flags;
        Ok(())
    }

    async fn set_fdstat_rights(&self, base: Rights, inheriting: Rights) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.rights_base = base;
        state.rights_inheriting = inheriting;
        Ok(())
    }

    /// The notifier and parked pollers are released by the last close only.
    async fn close(&self) -> KernelResult<()> {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Errno::Badf)?;
        if prev > 1 {
            return Ok(());
        }
        if let Some(tx) = self.state.lock().notifier.take() {
            let _ = tx.send(());
        }
        self.waiters.fail_all(Errno::Badf);
        Ok(())
    }

    fn duplicate(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the pending mask and clears it.
    async fn read(&self, len: usize) -> KernelResult<Vec<u8>> {
        if len < EVENT_READ_LEN {
            return Err(Errno::Nobufs);
        }
        let events = std::mem::take(&mut self.state.lock().pending);
        Ok(events.bits().to_le_bytes().to_vec())
    }

    async fn add_poll_sub(&self, sub: PollSub) {
        if sub.event_type() != EventType::FdRead {
            sub.fail(Errno::Notsup);
            return;
        }
        // Checked and parked under one lock so an event sent in between
        // cannot be missed.
        let state = self.state.lock();
        if state.pending.is_empty() {
            self.waiters.push(sub);
        } else {
            drop(state);
            sub.resolve(EVENT_READ_LEN as u64);
        }
    }

    fn as_event_sink(&self) -> Option<&dyn EventSink> {
        Some(self)
    }
}

impl EventSink for EventSource {
    fn mask(&self) -> Events {
        self.mask
    }

    fn send_events(&self, events: Events) {
        let ready = {
            let mut state = self.state.lock();
            state.pending |= events & self.mask;
            !state.pending.is_empty()
        };
        if ready {
            self.waiters.wake(EventType::FdRead, EVENT_READ_LEN as u64);
        }
    }

    fn obtain_events(&self, events: Events) -> Events {
        let mut state = self.state.lock();
        let taken = state.pending & events;
        state.pending.remove(taken);
        taken
    }

    fn make_notifier(&self) -> KernelResult<oneshot::Receiver<()>> {
        if !self.mask.contains(Events::SIGINT) {
            return Err(Errno::Inval);
        }
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.state.lock().notifier.replace(tx) {
            debug!("displacing previous interrupt notifier");
            let _ = previous.send(());
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;
    use wasmux_types::Pid;

    #[tokio::test]
    async fn test_read_clears_pending() {
        let source = EventSource::new(Events::SIGINT);
        source.send_events(Events::SIGINT | Events::WINCH);
        assert_eq!(source.pending(), Events::SIGINT);

        assert_eq!(source.read(2).await, Err(Errno::Nobufs));
        let bytes = source.read(16).await.unwrap();
        assert_eq!(bytes, Events::SIGINT.bits().to_le_bytes().to_vec());
        assert!(source.pending().is_empty());
    }

    #[tokio::test]
    async fn test_poll_ready_immediately() {
        let source = EventSource::new(Events::all());
        source.send_events(Events::WINCH);
        let (sub, mut rx) = PollSub::new(Pid::INIT, 1, EventType::FdRead);
        source.add_poll_sub(sub).await;
        assert_eq!(rx.try_recv().unwrap().nbytes, 4);
    }

    #[tokio::test]
    async fn test_poll_parks_until_event() {
        let source = EventSource::new(Events::all());
        let (sub, mut rx) = PollSub::new(Pid::INIT, 1, EventType::FdRead);
        source.add_poll_sub(sub).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        source.send_events(Events::SIGINT);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.error, None);
        assert_eq!(event.event_type, EventType::FdRead);
    }

    #[test]
    fn test_obtain_takes_selected_bits() {
        let source = EventSource::new(Events::all());
        source.send_events(Events::SIGINT | Events::WINCH);
        assert_eq!(source.obtain_events(Events::SIGINT), Events::SIGINT);
        assert_eq!(source.obtain_events(Events::SIGINT), Events::empty());
        assert_eq!(source.pending(), Events::WINCH);
    }

    #[tokio::test]
    async fn test_notifier_lifecycle() {
        let winch_only = EventSource::new(Events::WINCH);
        assert_eq!(winch_only.make_notifier().err(), Some(Errno::Inval));

        let source = EventSource::new(Events::SIGINT);
        let mut first = source.make_notifier().unwrap();
        assert!(source.has_notifier());
        assert!(matches!(first.try_recv(), Err(TryRecvError::Empty)));

        let mut second = source.make_notifier().unwrap();
        assert!(first.try_recv().is_ok());
        assert!(matches!(second.try_recv(), Err(TryRecvError::Empty)));

        source.close().await.unwrap();
        assert!(second.try_recv().is_ok());
        assert!(!source.has_notifier());
    }

    #[tokio::test]
    async fn test_shared_source_released_by_last_close() {
        let source = EventSource::new(Events::SIGINT);
        let mut notifier = source.make_notifier().unwrap();
        let (sub, mut rx) = PollSub::new(Pid::INIT, 1, EventType::FdRead);
        source.add_poll_sub(sub).await;
        source.duplicate();

        source.close().await.unwrap();
        assert!(source.has_notifier());
        assert!(matches!(notifier.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        source.close().await.unwrap();
        assert!(!source.has_notifier());
        assert!(notifier.try_recv().is_ok());
        assert_eq!(rx.try_recv().unwrap().error, Some(Errno::Badf));
        assert_eq!(source.close().await, Err(Errno::Badf));
    }
}
