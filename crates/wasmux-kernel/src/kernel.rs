//! The Kernel: one wasmux instance.
//!
//! A kernel owns:
//! - A mount table (the global namespace)
//! - A process manager (process tree, descriptor tables, poll, signals)
//! - Its configuration
//!
//! Introspection backends (a `/proc`-style filesystem, a task list) receive
//! the process manager from [`Kernel::introspection`] instead of reaching for
//! a global.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use wasmux_types::{KernelResult, Pid, Subscription};

use crate::config::KernelConfig;
use crate::fd_table::FdTable;
use crate::poll::PollOutcome;
use crate::process::{ExecutionHost, Foreground, ProcessManager, SpawnRequest, Spawned};
use crate::vfs::{Filesystem, MountOptions, MountTable};

/// A kernel instance.
pub struct Kernel {
    config: KernelConfig,
    mounts: Arc<MountTable>,
    processes: Arc<ProcessManager>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("processes", &self.processes)
            .finish()
    }
}

impl Kernel {
    /// Create a kernel with an empty namespace.
    pub fn new(config: KernelConfig, host: Arc<dyn ExecutionHost>) -> Self {
        let mounts = Arc::new(MountTable::new(config.symlink_hop_limit));
        let processes = Arc::new(
            ProcessManager::new(mounts.clone(), host).with_image_cache(config.cache_executables),
        );
        Self {
            config,
            mounts,
            processes,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    /// Install the root filesystem.
    pub async fn mount_root(
        &self,
        fs: Arc<dyn Filesystem>,
        options: MountOptions,
    ) -> KernelResult<()> {
        self.mounts.mount_root(fs, options).await
    }

    pub async fn mount(
        &self,
        path: &str,
        fs: Arc<dyn Filesystem>,
        options: MountOptions,
    ) -> KernelResult<()> {
        self.mounts.add_mount(path, fs, options).await
    }

    pub async fn unmount(&self, path: &str) -> KernelResult<Arc<dyn Filesystem>> {
        self.mounts.remove_mount(path).await
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Start a top-level process with the configured environment and
    /// working directory.
    pub async fn spawn_init(
        &self,
        command: &str,
        args: Vec<String>,
        fds: FdTable,
        foreground: Foreground,
    ) -> KernelResult<Spawned> {
        let env: BTreeMap<String, String> = self.config.env.clone();
        let req = SpawnRequest::new(command)
            .args(args)
            .fds(fds)
            .env(env)
            .cwd(self.config.default_workdir.clone())
            .foreground(foreground);
        let spawned = self.processes.spawn(req).await?;
        info!(pid = %spawned.pid, command, "top-level process started");
        Ok(spawned)
    }

    pub async fn spawn(&self, req: SpawnRequest) -> KernelResult<Spawned> {
        self.processes.spawn(req).await
    }

    pub async fn terminate(&self, pid: Pid, status: u32) -> KernelResult<()> {
        self.processes.terminate(pid, status).await
    }

    pub async fn poll(&self, pid: Pid, subs: &[Subscription]) -> KernelResult<PollOutcome> {
        self.processes.poll(pid, subs).await
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// Shared handle for introspection backends.
    pub fn introspection(&self) -> Arc<ProcessManager> {
        Arc::clone(&self.processes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use crate::testing::{MockHost, WASM_MAGIC, install_image};
    use crate::vfs::{MemoryFs, OpenRequest};
    use wasmux_types::{ClockSubscription, DeviceId, Errno};

    async fn booted(config: KernelConfig) -> (Kernel, Arc<MockHost>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let host = Arc::new(MockHost::default());
        let kernel = Kernel::new(config, host.clone());
        kernel
            .mount_root(Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();
        for dir in ["/usr", "/usr/bin", "/home", "/home/ant", "/tmp"] {
            kernel.mounts().create_dir(dir).await.unwrap();
        }
        install_image(kernel.mounts(), "/usr/bin/shell", WASM_MAGIC).await;
        (kernel, host)
    }

    #[tokio::test]
    async fn test_spawn_init_uses_config() {
        let (kernel, host) = booted(KernelConfig::default()).await;
        let tty = DeviceId::new(4, 0);
        let shell = kernel
            .spawn_init(
                "/usr/bin/shell",
                vec!["shell".into()],
                FdTable::new(),
                Foreground::Terminal(tty),
            )
            .await
            .unwrap();

        let snap = kernel.introspection().snapshot(shell.pid).unwrap();
        assert_eq!(snap.cwd, "/home/ant");
        assert_eq!(snap.env["SHELL"], "/usr/bin/shell");
        assert_eq!(snap.state, ProcessState::Running);
        assert_eq!(kernel.processes().foreground_of(tty), Some(shell.pid));
        assert_eq!(host.started(), vec![shell.pid]);

        kernel.terminate(shell.pid, 0).await.unwrap();
        assert_eq!(kernel.processes().list(), Vec::<Pid>::new());
    }

    #[tokio::test]
    async fn test_hop_limit_from_config() {
        let (kernel, _host) = booted(KernelConfig::default().with_hop_limit(1)).await;
        kernel.mounts().add_symlink("/tmp", "/t1").await.unwrap();
        kernel.mounts().add_symlink("/t1", "/t2").await.unwrap();

        assert!(kernel.mounts().open("/t1", &OpenRequest::follow()).await.is_ok());
        assert_eq!(
            kernel.mounts().open("/t2", &OpenRequest::follow()).await.err(),
            Some(Errno::Loop)
        );
    }

    #[tokio::test]
    async fn test_mount_and_unmount() {
        let (kernel, _host) = booted(KernelConfig::default()).await;
        kernel
            .mount("/tmp", Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();
        assert!(kernel.mounts().is_mount_point("/tmp").await);
        kernel.unmount("/tmp").await.unwrap();
        assert!(!kernel.mounts().is_mount_point("/tmp").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_through_facade() {
        let (kernel, _host) = booted(KernelConfig::default()).await;
        let pid = kernel
            .spawn_init("/usr/bin/shell", vec![], FdTable::new(), Foreground::Detached)
            .await
            .unwrap()
            .pid;
        let subs = [Subscription::clock(3, ClockSubscription::relative(1_000))];
        let outcome = kernel.poll(pid, &subs).await.unwrap();
        assert_eq!(outcome.timed_out, Some(3));
    }
}
