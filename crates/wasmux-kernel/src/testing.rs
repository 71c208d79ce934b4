//! Test doubles for the execution host.
//!
//! [`MockHost`] accepts any image starting with the wasm magic number and
//! starts units that do nothing but record their termination.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use wasmux_types::{KernelResult, OpenFlags, Pid};

use crate::fd_table::FdTable;
use crate::process::{
    CompileError, Executable, ExecutionHost, ExecutionUnit, Launch, ProcessManager, SpawnRequest,
};
use crate::vfs::{MemoryFs, MountOptions, MountTable, OpenRequest};

/// Leading bytes of a valid image.
pub const WASM_MAGIC: &[u8] = b"\0asm\x01\0\0\0";

/// Path of the image [`spawn_idle`] runs.
pub const IDLE: &str = "/bin/idle";

/// A compiled mock image.
#[derive(Debug)]
pub struct MockImage {
    pub path: String,
    pub size: usize,
}

impl Executable for MockImage {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Execution host that records what it was asked to do.
#[derive(Debug, Default)]
pub struct MockHost {
    started: Mutex<Vec<Pid>>,
    terminated: Arc<Mutex<Vec<Pid>>>,
    compiles: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockHost {
    /// A manager over a fresh in-memory root holding [`IDLE`].
    pub async fn manager() -> (ProcessManager, Arc<MockHost>) {
        let mounts = Arc::new(MountTable::new(40));
        mounts
            .mount_root(Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .expect("mounting an empty root");
        mounts.create_dir("/bin").await.expect("creating /bin");
        install_image(&mounts, IDLE, WASM_MAGIC).await;

        let host = Arc::new(MockHost::default());
        let pm = ProcessManager::new(mounts, host.clone());
        (pm, host)
    }

    /// Pids of started units, in start order.
    pub fn started(&self) -> Vec<Pid> {
        self.started.lock().clone()
    }

    /// Pids of terminated units, in termination order.
    pub fn terminated(&self) -> Vec<Pid> {
        self.terminated.lock().clone()
    }

    /// Make every later compile wait for a notification on the returned
    /// handle.
    pub fn hold_compiles(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Number of compile calls.
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionHost for MockHost {
    async fn compile(
        &self,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<Arc<dyn Executable>, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if bytes.is_empty() {
            return Err(CompileError::Empty);
        }
        if !bytes.starts_with(WASM_MAGIC) {
            return Err(CompileError::Invalid);
        }
        Ok(Arc::new(MockImage {
            path: path.to_string(),
            size: bytes.len(),
        }))
    }

    async fn start(
        &self,
        _image: Arc<dyn Executable>,
        launch: Launch,
    ) -> KernelResult<Box<dyn ExecutionUnit>> {
        self.started.lock().push(launch.pid);
        Ok(Box::new(MockUnit {
            pid: launch.pid,
            terminated: self.terminated.clone(),
        }))
    }
}

/// Unit started by [`MockHost`].
#[derive(Debug)]
pub struct MockUnit {
    pid: Pid,
    terminated: Arc<Mutex<Vec<Pid>>>,
}

impl ExecutionUnit for MockUnit {
    fn terminate(&self) {
        self.terminated.lock().push(self.pid);
    }
}

/// Write `bytes` to a new file at `path`.
pub async fn install_image(mounts: &MountTable, path: &str, bytes: &[u8]) {
    let req = OpenRequest::follow().with_oflags(OpenFlags::CREAT | OpenFlags::TRUNC);
    let desc = mounts.open(path, &req).await.expect("creating image");
    desc.write(bytes).await.expect("writing image");
    desc.close().await.expect("closing image");
}

/// Spawn a parentless [`IDLE`] process owning `fds`.
pub async fn spawn_idle(pm: &ProcessManager, fds: FdTable) -> Pid {
    pm.spawn(SpawnRequest::new(IDLE).fds(fds))
        .await
        .expect("spawning idle")
        .pid
}
