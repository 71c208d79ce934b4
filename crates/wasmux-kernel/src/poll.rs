//! Readiness polling.
//!
//! A poll request fans out into one [`PollSub`] per descriptor subscription.
//! Each sub is handed to its descriptor, which either answers immediately or
//! parks it in a [`WaitQueue`] until the resource becomes ready. The poll
//! itself waits on the subs, the earliest clock deadline, and the calling
//! process's cancellation token, whichever comes first.

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use wasmux_types::{
    ClockId, ClockSubscription, Errno, EventType, KernelResult, Pid, PollEvent, Subscription,
    SubscriptionKind, now_nanos,
};

use crate::process::ProcessManager;

/// A pending readiness request, owned by whoever will answer it.
///
/// Resolving consumes the sub, so a subscription produces at most one
/// outcome. Dropping it unresolved abandons it; the waiting poll then treats
/// it as gone.
#[derive(Debug)]
pub struct PollSub {
    pid: Pid,
    userdata: u64,
    event_type: EventType,
    tx: oneshot::Sender<PollEvent>,
}

impl PollSub {
    pub fn new(
        pid: Pid,
        userdata: u64,
        event_type: EventType,
    ) -> (Self, oneshot::Receiver<PollEvent>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                pid,
                userdata,
                event_type,
                tx,
            },
            rx,
        )
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn userdata(&self) -> u64 {
        self.userdata
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Report readiness with `nbytes` available.
    pub fn resolve(self, nbytes: u64) {
        let event = PollEvent::ready(self.userdata, self.event_type, nbytes);
        // The poll may already have returned; nothing to do then.
        let _ = self.tx.send(event);
    }

    /// Report failure.
    pub fn fail(self, errno: Errno) {
        let event = PollEvent::failed(self.userdata, self.event_type, errno);
        let _ = self.tx.send(event);
    }

    /// Whether the waiting poll has gone away.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Subs parked on one resource, in arrival order.
#[derive(Debug, Default)]
pub struct WaitQueue {
    subs: Mutex<VecDeque<PollSub>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a sub. Abandoned subs are pruned first so a resource that never
    /// becomes ready does not accumulate dead entries.
    pub fn push(&self, sub: PollSub) {
        let mut subs = self.subs.lock();
        subs.retain(|s| !s.is_abandoned());
        subs.push_back(sub);
    }

    /// Resolve every parked sub of `event_type`. Returns how many were resolved.
    pub fn wake(&self, event_type: EventType, nbytes: u64) -> usize {
        let woken: Vec<PollSub> = {
            let mut subs = self.subs.lock();
            let (woken, kept): (Vec<PollSub>, Vec<PollSub>) =
                subs.drain(..).partition(|s| s.event_type == event_type);
            *subs = kept.into();
            woken
        };
        let n = woken.len();
        for sub in woken {
            sub.resolve(nbytes);
        }
        n
    }

    /// Resolve every parked sub.
    pub fn wake_all(&self, nbytes: u64) -> usize {
        let woken: Vec<PollSub> = self.subs.lock().drain(..).collect();
        let n = woken.len();
        for sub in woken {
            sub.resolve(nbytes);
        }
        n
    }

    /// Fail every parked sub, e.g. when the resource closes.
    pub fn fail_all(&self, errno: Errno) {
        let failed: Vec<PollSub> = self.subs.lock().drain(..).collect();
        for sub in failed {
            sub.fail(errno);
        }
    }

    /// Drop abandoned subs.
    pub fn prune(&self) {
        self.subs.lock().retain(|s| !s.is_abandoned());
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().is_empty()
    }
}

/// Result of a poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Descriptor events that resolved.
    pub events: Vec<PollEvent>,
    /// Userdata of the clock subscription whose deadline elapsed, if the
    /// poll ended on a timeout.
    pub timed_out: Option<u64>,
}

impl PollOutcome {
    fn events(events: Vec<PollEvent>) -> Self {
        Self {
            events,
            timed_out: None,
        }
    }
}

/// Turn a clock subscription into an instant on the tokio clock.
fn deadline(clock: &ClockSubscription, epoch: Instant, started: Instant) -> Instant {
    let now = Instant::now();
    if !clock.absolute {
        return now + Duration::from_nanos(clock.timeout);
    }
    match clock.clock {
        ClockId::Realtime => {
            let remaining = clock.timeout.saturating_sub(now_nanos());
            now + Duration::from_nanos(remaining)
        }
        ClockId::Monotonic => epoch + Duration::from_nanos(clock.timeout),
        ClockId::ProcessCputime | ClockId::ThreadCputime => {
            started + Duration::from_nanos(clock.timeout)
        }
    }
}

type Pending = FuturesUnordered<oneshot::Receiver<PollEvent>>;

/// Collect whatever has already resolved without waiting.
fn drain_ready(pending: &mut Pending, events: &mut Vec<PollEvent>) {
    while let Some(Some(res)) = pending.next().now_or_never() {
        if let Ok(event) = res {
            events.push(event);
        }
    }
}

impl ProcessManager {
    /// Wait until at least one subscription is satisfied.
    ///
    /// Only the earliest clock deadline is armed. Descriptor subscriptions on
    /// an fd the process does not hold fail immediately with `Badf`. If the
    /// process is terminated while waiting, the poll returns with no events.
    #[tracing::instrument(name = "poll.oneoff", skip(self, subs), fields(pid = %pid, n = subs.len()))]
    pub async fn poll(&self, pid: Pid, subs: &[Subscription]) -> KernelResult<PollOutcome> {
        if subs.is_empty() {
            return Err(Errno::Inval);
        }
        let (token, started) = self.poll_context(pid)?;
        let epoch = self.epoch();

        let mut pending: Pending = FuturesUnordered::new();
        let mut events = Vec::new();
        let mut earliest: Option<(Instant, u64)> = None;

        for sub in subs {
            match sub.kind {
                SubscriptionKind::Clock(clock) => {
                    let at = deadline(&clock, epoch, started);
                    if earliest.is_none_or(|(current, _)| at < current) {
                        earliest = Some((at, sub.userdata));
                    }
                }
                SubscriptionKind::FdRead(fd) | SubscriptionKind::FdWrite(fd) => {
                    let event_type = sub.event_type();
                    match self.descriptor(pid, fd) {
                        Some(desc) => {
                            let (poll_sub, rx) = PollSub::new(pid, sub.userdata, event_type);
                            desc.add_poll_sub(poll_sub).await;
                            pending.push(rx);
                        }
                        None => {
                            debug!(fd, "poll on unknown descriptor");
                            events.push(PollEvent::failed(sub.userdata, event_type, Errno::Badf));
                        }
                    }
                }
            }
        }

        drain_ready(&mut pending, &mut events);
        if !events.is_empty() {
            return Ok(PollOutcome::events(events));
        }

        let sleep = async move {
            match earliest {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(sleep);

        loop {
            if pending.is_empty() && earliest.is_none() {
                debug!("every subscription was dropped");
                return Ok(PollOutcome::default());
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("process terminated during poll");
                    return Ok(PollOutcome::default());
                }
                Some(res) = pending.next(), if !pending.is_empty() => {
                    if let Ok(event) = res {
                        events.push(event);
                        drain_ready(&mut pending, &mut events);
                        return Ok(PollOutcome::events(events));
                    }
                }
                _ = &mut sleep => {
                    return Ok(PollOutcome {
                        events: Vec::new(),
                        timed_out: earliest.map(|(_, userdata)| userdata),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd_table::FdTable;
    use crate::signal::EventSource;
    use crate::testing::{MockHost, spawn_idle};
    use crate::vfs::{Descriptor, EventSink};
    use std::sync::Arc;
    use wasmux_types::{Events, Fd};

    #[test]
    fn test_sub_resolves_once() {
        let (sub, mut rx) = PollSub::new(Pid::INIT, 7, EventType::FdRead);
        assert!(!sub.is_abandoned());
        sub.resolve(4);
        let event = rx.try_recv().unwrap();
        assert_eq!(event, PollEvent::ready(7, EventType::FdRead, 4));
    }

    #[test]
    fn test_wait_queue_prunes_abandoned() {
        let queue = WaitQueue::new();
        let (a, rx_a) = PollSub::new(Pid::INIT, 1, EventType::FdRead);
        let (b, mut rx_b) = PollSub::new(Pid::INIT, 2, EventType::FdWrite);
        queue.push(a);
        drop(rx_a);
        queue.push(b);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.wake(EventType::FdRead, 1), 0);
        assert_eq!(queue.wake(EventType::FdWrite, 9), 1);
        assert_eq!(rx_b.try_recv().unwrap().nbytes, 9);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_timeout() {
        let (pm, _host) = MockHost::manager().await;
        let pid = spawn_idle(&pm, FdTable::new()).await;

        let start = Instant::now();
        let subs = [Subscription::clock(
            11,
            ClockSubscription::relative(50_000_000),
        )];
        let outcome = pm.poll(pid, &subs).await.unwrap();

        assert!(outcome.events.is_empty());
        assert_eq!(outcome.timed_out, Some(11));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_deadline_wins() {
        let (pm, _host) = MockHost::manager().await;
        let pid = spawn_idle(&pm, FdTable::new()).await;

        let subs = [
            Subscription::clock(1, ClockSubscription::relative(80_000_000)),
            Subscription::clock(2, ClockSubscription::relative(20_000_000)),
        ];
        let outcome = pm.poll(pid, &subs).await.unwrap();
        assert_eq!(outcome.timed_out, Some(2));
    }

    #[tokio::test]
    async fn test_empty_and_unknown_fd() {
        let (pm, _host) = MockHost::manager().await;
        let pid = spawn_idle(&pm, FdTable::new()).await;

        assert_eq!(pm.poll(pid, &[]).await, Err(Errno::Inval));

        let outcome = pm.poll(pid, &[Subscription::fd_read(3, 42)]).await.unwrap();
        assert_eq!(outcome.events, vec![PollEvent::failed(3, EventType::FdRead, Errno::Badf)]);
    }

    #[tokio::test]
    async fn test_wakes_on_event() {
        let (pm, _host) = MockHost::manager().await;
        let source = Arc::new(EventSource::new(Events::all()));
        let mut fds = FdTable::new();
        let fd: Fd = fds.add_file(source.clone() as Arc<dyn Descriptor>);
        let pid = spawn_idle(&pm, fds).await;

        let pm = Arc::new(pm);
        let poller = {
            let pm = pm.clone();
            tokio::spawn(async move { pm.poll(pid, &[Subscription::fd_read(5, fd)]).await })
        };
        tokio::task::yield_now().await;
        source.send_events(Events::WINCH);

        let outcome = poller.await.unwrap().unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].userdata, 5);
        assert_eq!(outcome.events[0].error, None);
    }

    #[tokio::test]
    async fn test_terminate_ends_poll() {
        let (pm, _host) = MockHost::manager().await;
        let source = Arc::new(EventSource::new(Events::all()));
        let mut fds = FdTable::new();
        let fd = fds.add_file(source as Arc<dyn Descriptor>);
        let pid = spawn_idle(&pm, fds).await;

        let pm = Arc::new(pm);
        let poller = {
            let pm = pm.clone();
            tokio::spawn(async move { pm.poll(pid, &[Subscription::fd_read(1, fd)]).await })
        };
        tokio::task::yield_now().await;
        pm.terminate(pid, 0).await.unwrap();

        let outcome = poller.await.unwrap().unwrap();
        assert_eq!(outcome, PollOutcome::default());
    }
}
