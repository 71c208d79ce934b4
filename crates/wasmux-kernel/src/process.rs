//! Process manager.
//!
//! Owns every live process: its descriptor table, environment, working
//! directory, place in the process tree, terminal foreground association,
//! and interrupt registration. Executable images are compiled and started by
//! an external [`ExecutionHost`]; the manager only sequences the lifecycle.
//!
//! ```text
//! spawn ──▶ Spawned ──start──▶ Running ──terminate──▶ Terminated
//!              └───────────── terminate ──────────────────┘
//! ```
//!
//! Process ids are allocated monotonically and never reused, so any id below
//! the next one that is not live has terminated.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wasmux_types::{
    EXIT_INTERRUPTED, EXIT_KILLED, Errno, Events, Fd, KernelResult, Pid, TerminalId, Timestamp,
    now_nanos,
};

use crate::fd_table::FdTable;
use crate::vfs::{Descriptor, MountTable, OpenRequest};

// ============================================================================
// Execution host seam
// ============================================================================

/// A compiled executable image. Opaque to the kernel.
pub trait Executable: Send + Sync {
    /// Lets the host recover its concrete image type.
    fn as_any(&self) -> &dyn Any;
}

/// Why an image could not be compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The file had no content. The process exits with status 0.
    #[error("executable image is empty")]
    Empty,
    /// The content is not a valid image.
    #[error("executable image is invalid")]
    Invalid,
}

/// What a started process needs besides its image.
#[derive(Debug, Clone)]
pub struct Launch {
    pub pid: Pid,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
}

/// A running execution unit.
pub trait ExecutionUnit: Send + Sync {
    /// Stop the unit. Called once, after its descriptors are closed.
    fn terminate(&self);
}

/// Compiles images and starts execution units.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    async fn compile(&self, path: &str, bytes: Vec<u8>)
    -> Result<Arc<dyn Executable>, CompileError>;

    async fn start(
        &self,
        image: Arc<dyn Executable>,
        launch: Launch,
    ) -> KernelResult<Box<dyn ExecutionUnit>>;
}

// ============================================================================
// Requests and results
// ============================================================================

/// Which terminal a new process reads from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Foreground {
    /// Take over the parent's terminal, if it has one.
    #[default]
    Inherit,
    /// No terminal.
    Detached,
    /// Become the foreground process of this terminal.
    Terminal(TerminalId),
}

/// Parameters of [`ProcessManager::spawn`].
#[derive(Debug)]
pub struct SpawnRequest {
    pub parent: Option<Pid>,
    /// Absolute path of the executable.
    pub command: String,
    pub fds: FdTable,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    /// Background job: not cancelled by an interrupt pending on the parent.
    pub is_job: bool,
    pub foreground: Foreground,
    /// The caller blocks until the child exits. The parent gives up its
    /// terminal to the child meanwhile.
    pub wait: bool,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            parent: None,
            args: vec![command.clone()],
            command,
            fds: FdTable::new(),
            env: BTreeMap::new(),
            cwd: "/".to_string(),
            is_job: false,
            foreground: Foreground::Inherit,
            wait: false,
        }
    }

    pub fn parent(mut self, parent: Pid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn fds(mut self, fds: FdTable) -> Self {
        self.fds = fds;
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn job(mut self) -> Self {
        self.is_job = true;
        self
    }

    pub fn foreground(mut self, foreground: Foreground) -> Self {
        self.foreground = foreground;
        self
    }

    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }
}

/// Completes with the exit status of a process.
#[derive(Debug)]
pub struct ExitWaiter(oneshot::Receiver<u32>);

impl ExitWaiter {
    pub async fn wait(self) -> u32 {
        // The sender only drops unsent if the manager itself is gone.
        self.0.await.unwrap_or(EXIT_KILLED)
    }
}

/// Result of a spawn.
#[derive(Debug)]
pub struct Spawned {
    pub pid: Pid,
    /// Present when the request asked to wait.
    pub exit: Option<ExitWaiter>,
}

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    /// Registered, image not yet running.
    Spawned,
    Running,
    Terminated,
}

/// Point-in-time view of a process, for introspection backends.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub children: Vec<Pid>,
    pub state: ProcessState,
    pub started_at: Timestamp,
    /// Open descriptors with the path each was opened at.
    pub fds: Vec<(Fd, String)>,
}

// ============================================================================
// Process table
// ============================================================================

struct SigintRegistration {
    desc: Arc<dyn Descriptor>,
    released: oneshot::Receiver<()>,
}

impl SigintRegistration {
    fn is_active(&mut self) -> bool {
        matches!(self.released.try_recv(), Err(TryRecvError::Empty))
    }
}

struct Process {
    parent: Option<Pid>,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: String,
    fds: FdTable,
    children: Vec<Pid>,
    foreground: Option<TerminalId>,
    state: ProcessState,
    started: Instant,
    started_at: Timestamp,
    token: CancellationToken,
    unit: Option<Box<dyn ExecutionUnit>>,
    exit_tx: Option<oneshot::Sender<u32>>,
    sigint: Option<SigintRegistration>,
}

impl Process {
    /// Whether an interrupt should be delivered as an event.
    fn catches_sigint(&mut self) -> bool {
        let active = self.sigint.as_mut().is_some_and(SigintRegistration::is_active);
        if !active {
            self.sigint = None;
        }
        active
    }
}

#[derive(Default)]
struct ProcessTable {
    procs: HashMap<Pid, Process>,
    next_pid: Pid,
    foreground: HashMap<TerminalId, Pid>,
}

impl ProcessTable {
    fn get(&self, pid: Pid) -> KernelResult<&Process> {
        self.procs.get(&pid).ok_or(Errno::Srch)
    }

    fn get_mut(&mut self, pid: Pid) -> KernelResult<&mut Process> {
        self.procs.get_mut(&pid).ok_or(Errno::Srch)
    }

    /// `pid` and all its descendants, children before parents.
    fn subtree(&self, pid: Pid) -> Vec<Pid> {
        let mut order = Vec::new();
        let mut stack = vec![(pid, false)];
        while let Some((pid, expanded)) = stack.pop() {
            if expanded {
                order.push(pid);
                continue;
            }
            stack.push((pid, true));
            if let Some(proc) = self.procs.get(&pid) {
                for child in proc.children.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        order
    }

    /// Unlink a process from the table, handing its terminal to its parent.
    fn detach(&mut self, pid: Pid) -> Option<Process> {
        let proc = self.procs.remove(&pid)?;
        if let Some(terminal) = proc.foreground {
            let owner = self.foreground.get(&terminal).copied();
            match proc.parent.filter(|parent| self.procs.contains_key(parent)) {
                Some(parent) => {
                    if owner == Some(pid) {
                        self.foreground.insert(terminal, parent);
                    }
                    if let Some(parent) = self.procs.get_mut(&parent) {
                        parent.foreground = Some(terminal);
                    }
                }
                None if owner == Some(pid) => {
                    self.foreground.remove(&terminal);
                }
                None => {}
            }
        }
        if let Some(parent) = proc.parent.and_then(|p| self.procs.get_mut(&p)) {
            parent.children.retain(|child| *child != pid);
        }
        Some(proc)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owns the process table and sequences process lifecycles.
pub struct ProcessManager {
    table: Mutex<ProcessTable>,
    mounts: Arc<MountTable>,
    host: Arc<dyn ExecutionHost>,
    images: Mutex<HashMap<String, Arc<dyn Executable>>>,
    cache_images: bool,
    epoch: Instant,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("live", &self.table.lock().procs.len())
            .field("cache_images", &self.cache_images)
            .finish()
    }
}

impl ProcessManager {
    pub fn new(mounts: Arc<MountTable>, host: Arc<dyn ExecutionHost>) -> Self {
        Self {
            table: Mutex::new(ProcessTable::default()),
            mounts,
            host,
            images: Mutex::new(HashMap::new()),
            cache_images: true,
            epoch: Instant::now(),
        }
    }

    /// Enable or disable the compiled image cache.
    pub fn with_image_cache(mut self, enabled: bool) -> Self {
        self.cache_images = enabled;
        self
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    /// Start a process.
    ///
    /// The process is registered before its image is loaded, so a failed
    /// load tears it down like any other termination: an empty image exits
    /// with status 0, an invalid one with `Noexec`, a missing one with the
    /// open error. The caller gets the failure status.
    #[tracing::instrument(
        name = "process.spawn",
        skip(self, req),
        fields(command = %req.command, parent = ?req.parent)
    )]
    pub async fn spawn(&self, req: SpawnRequest) -> KernelResult<Spawned> {
        let SpawnRequest {
            parent,
            command,
            fds,
            args,
            env,
            cwd,
            is_job,
            foreground,
            wait,
        } = req;

        let (pid, exit) = {
            let mut table = self.table.lock();
            let inherited = match parent {
                Some(parent) => {
                    let parent = table.get_mut(parent)?;
                    let terminal = parent.foreground;
                    if wait {
                        parent.foreground = None;
                    }
                    terminal
                }
                None => None,
            };
            let terminal = match foreground {
                Foreground::Inherit => inherited,
                Foreground::Detached => None,
                Foreground::Terminal(terminal) => Some(terminal),
            };

            let pid = table.next_pid;
            table.next_pid = pid.next();
            if let Some(parent) = parent.and_then(|p| table.procs.get_mut(&p)) {
                parent.children.push(pid);
            }
            if let Some(terminal) = terminal {
                table.foreground.insert(terminal, pid);
            }

            let (exit_tx, exit) = if wait {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(ExitWaiter(rx)))
            } else {
                (None, None)
            };

            table.procs.insert(
                pid,
                Process {
                    parent,
                    command: command.clone(),
                    args: args.clone(),
                    env: env.clone(),
                    cwd: cwd.clone(),
                    fds,
                    children: Vec::new(),
                    foreground: terminal,
                    state: ProcessState::Spawned,
                    started: Instant::now(),
                    started_at: now_nanos(),
                    token: CancellationToken::new(),
                    unit: None,
                    exit_tx,
                    sigint: None,
                },
            );
            (pid, exit)
        };
        debug!(%pid, "registered");

        let image = match self.load_image(&command).await {
            Ok(image) => image,
            Err((errno, status)) => {
                warn!(%pid, ?errno, "failed to load executable");
                self.abort_spawn(pid, status).await?;
                return Err(errno);
            }
        };

        if !is_job && self.parent_interrupted(parent) {
            debug!(%pid, "parent has a pending interrupt");
            self.abort_spawn(pid, EXIT_INTERRUPTED).await?;
            return Ok(Spawned { pid, exit });
        }

        let launch = Launch {
            pid,
            args,
            env,
            cwd,
        };
        let unit = match self.host.start(image, launch).await {
            Ok(unit) => unit,
            Err(errno) => {
                warn!(%pid, ?errno, "failed to start execution unit");
                self.abort_spawn(pid, u32::from(errno.code())).await?;
                return Err(errno);
            }
        };

        let orphan = {
            let mut table = self.table.lock();
            match table.procs.get_mut(&pid) {
                Some(proc) => {
                    proc.unit = Some(unit);
                    proc.state = ProcessState::Running;
                    None
                }
                None => Some(unit),
            }
        };
        // Terminated while starting.
        if let Some(unit) = orphan {
            unit.terminate();
        }

        info!(%pid, %command, "process started");
        Ok(Spawned { pid, exit })
    }

    /// Tear down a process that never finished spawning. An ancestor
    /// terminated meanwhile may already have taken it down.
    async fn abort_spawn(&self, pid: Pid, status: u32) -> KernelResult<()> {
        match self.terminate(pid, status).await {
            Err(Errno::Srch) => {
                debug!(%pid, "already terminated with an ancestor");
                Ok(())
            }
            other => other,
        }
    }

    /// Load an image, returning the errno for the caller and the exit
    /// status for the half-created process on failure.
    async fn load_image(&self, path: &str) -> Result<Arc<dyn Executable>, (Errno, u32)> {
        if self.cache_images {
            // Keyed by path only: a rewritten file keeps its stale image
            // until `invalidate_image` drops it.
            if let Some(image) = self.images.lock().get(path) {
                return Ok(Arc::clone(image));
            }
        }

        let fail = |errno: Errno| (errno, u32::from(errno.code()));
        let desc = self
            .mounts
            .open(path, &OpenRequest::follow())
            .await
            .map_err(fail)?;
        let bytes = desc.read_to_end().await;
        if let Err(err) = desc.close().await {
            warn!(?err, path, "failed to close executable");
        }
        let bytes = bytes.map_err(fail)?;

        let image = match self.host.compile(path, bytes).await {
            Ok(image) => image,
            Err(CompileError::Empty) => return Err((Errno::Noexec, 0)),
            Err(CompileError::Invalid) => return Err(fail(Errno::Noexec)),
        };
        if self.cache_images {
            self.images
                .lock()
                .insert(path.to_string(), Arc::clone(&image));
        }
        Ok(image)
    }

    /// Drop a cached image so the next spawn recompiles it.
    pub fn invalidate_image(&self, path: &str) -> bool {
        self.images.lock().remove(path).is_some()
    }

    /// Consume an interrupt pending on the parent's registered sink.
    fn parent_interrupted(&self, parent: Option<Pid>) -> bool {
        let Some(parent) = parent else {
            return false;
        };
        let mut table = self.table.lock();
        let Some(proc) = table.procs.get_mut(&parent) else {
            return false;
        };
        if !proc.catches_sigint() {
            return false;
        }
        proc.sigint
            .as_ref()
            .and_then(|reg| reg.desc.as_event_sink())
            .is_some_and(|sink| !sink.obtain_events(Events::SIGINT).is_empty())
    }

    /// Terminate a process and, first, all its descendants.
    ///
    /// Descendants exit with `128 + SIGKILL`. Each process hands its terminal
    /// back to its parent, leaves its parent's child list, has its pending
    /// polls cancelled and its descriptors closed, and signals its exit
    /// waiter.
    #[tracing::instrument(name = "process.terminate", skip(self), fields(pid = %pid))]
    pub async fn terminate(&self, pid: Pid, status: u32) -> KernelResult<()> {
        let victims: Vec<(Pid, Process)> = {
            let mut table = self.table.lock();
            table.get(pid)?;
            table
                .subtree(pid)
                .into_iter()
                .filter_map(|victim| table.detach(victim).map(|proc| (victim, proc)))
                .collect()
        };

        for (victim, mut proc) in victims {
            let status = if victim == pid { status } else { EXIT_KILLED };
            proc.token.cancel();
            let failures = proc.fds.tear_down().await;
            if !failures.is_empty() {
                warn!(pid = %victim, failed = failures.len(), "descriptors failed to close");
            }
            if let Some(unit) = proc.unit.take() {
                unit.terminate();
            }
            if let Some(tx) = proc.exit_tx.take() {
                let _ = tx.send(status);
            }
            info!(pid = %victim, status, "process terminated");
        }
        Ok(())
    }

    /// Deliver events to a process.
    ///
    /// An interrupt to a process without an active interrupt registration
    /// terminates it. Otherwise the events go to every event-sink descriptor
    /// the process holds.
    pub async fn publish_event(&self, events: Events, pid: Pid) -> KernelResult<()> {
        let sinks = {
            let mut table = self.table.lock();
            let proc = table.get_mut(pid)?;
            if events.contains(Events::SIGINT) && !proc.catches_sigint() {
                None
            } else {
                let sinks: Vec<Arc<dyn Descriptor>> = proc
                    .fds
                    .iter()
                    .filter(|(_, entry)| entry.desc.as_event_sink().is_some())
                    .map(|(_, entry)| Arc::clone(&entry.desc))
                    .collect();
                Some(sinks)
            }
        };

        match sinks {
            None => {
                debug!(%pid, "uncaught interrupt");
                self.terminate(pid, EXIT_INTERRUPTED).await
            }
            Some(sinks) => {
                if sinks.is_empty() {
                    warn!(%pid, ?events, "no event sink to deliver to");
                }
                for desc in sinks {
                    if let Some(sink) = desc.as_event_sink() {
                        sink.send_events(events);
                    }
                }
                Ok(())
            }
        }
    }

    /// Register `fd` as the process's interrupt notifier.
    ///
    /// `Badf` if the slot is empty, `Inval` if the descriptor is not an event
    /// sink that accepts interrupts. The registration lapses when the sink
    /// closes or is registered again.
    pub fn attach_sigint(&self, fd: Fd, pid: Pid) -> KernelResult<()> {
        let mut table = self.table.lock();
        let proc = table.get_mut(pid)?;
        let desc = proc.fds.get_desc(fd).ok_or(Errno::Badf)?;
        let released = desc.as_event_sink().ok_or(Errno::Inval)?.make_notifier()?;
        proc.sigint = Some(SigintRegistration { desc, released });
        debug!(%pid, fd, "interrupt notifier attached");
        Ok(())
    }

    // ========================================================================
    // Queries and per-process state
    // ========================================================================

    pub fn state(&self, pid: Pid) -> KernelResult<ProcessState> {
        let table = self.table.lock();
        match table.procs.get(&pid) {
            Some(proc) => Ok(proc.state),
            None if pid < table.next_pid => Ok(ProcessState::Terminated),
            None => Err(Errno::Srch),
        }
    }

    /// Live process ids, ascending.
    pub fn list(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.table.lock().procs.keys().copied().collect();
        pids.sort();
        pids
    }

    pub fn snapshot(&self, pid: Pid) -> KernelResult<ProcessSnapshot> {
        let table = self.table.lock();
        let proc = table.get(pid)?;
        Ok(ProcessSnapshot {
            pid,
            parent: proc.parent,
            command: proc.command.clone(),
            args: proc.args.clone(),
            cwd: proc.cwd.clone(),
            env: proc.env.clone(),
            children: proc.children.clone(),
            state: proc.state,
            started_at: proc.started_at,
            fds: proc
                .fds
                .iter()
                .map(|(fd, entry)| (fd, entry.desc.path()))
                .collect(),
        })
    }

    pub fn with_fds<R>(&self, pid: Pid, f: impl FnOnce(&FdTable) -> R) -> KernelResult<R> {
        let table = self.table.lock();
        Ok(f(&table.get(pid)?.fds))
    }

    pub fn with_fds_mut<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut FdTable) -> R,
    ) -> KernelResult<R> {
        let mut table = self.table.lock();
        Ok(f(&mut table.get_mut(pid)?.fds))
    }

    pub fn cwd(&self, pid: Pid) -> KernelResult<String> {
        Ok(self.table.lock().get(pid)?.cwd.clone())
    }

    pub fn set_cwd(&self, pid: Pid, cwd: impl Into<String>) -> KernelResult<()> {
        self.table.lock().get_mut(pid)?.cwd = cwd.into();
        Ok(())
    }

    pub fn set_env(&self, pid: Pid, key: impl Into<String>, value: impl Into<String>) -> KernelResult<()> {
        self.table
            .lock()
            .get_mut(pid)?
            .env
            .insert(key.into(), value.into());
        Ok(())
    }

    pub fn children(&self, pid: Pid) -> KernelResult<Vec<Pid>> {
        Ok(self.table.lock().get(pid)?.children.clone())
    }

    /// The process currently reading from `terminal`.
    pub fn foreground_of(&self, terminal: TerminalId) -> Option<Pid> {
        self.table.lock().foreground.get(&terminal).copied()
    }

    pub(crate) fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Cancellation token and start instant of a live process.
    pub(crate) fn poll_context(&self, pid: Pid) -> KernelResult<(CancellationToken, Instant)> {
        let table = self.table.lock();
        let proc = table.get(pid)?;
        Ok((proc.token.clone(), proc.started))
    }

    pub(crate) fn descriptor(&self, pid: Pid, fd: Fd) -> Option<Arc<dyn Descriptor>> {
        self.table.lock().procs.get(&pid)?.fds.get_desc(fd)
    }
}
