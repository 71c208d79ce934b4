//! Mount table and path resolver.
//!
//! Routes absolute paths to mounted backends by longest prefix, and expands
//! symlinks the backends report. Backends only ever see normalized,
//! backend-relative paths.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use wasmux_types::{Errno, FileType, Filestat, KernelResult, OpenFlags};

use super::descriptor::Descriptor;
use super::filesystem::{Filesystem, MountOptions, OpenRequest, Resolution};
use super::path::{abspath, basename, dirname, is_within, join_within, realpath, strip_within};

/// Information about a mount point.
#[derive(Debug, Clone)]
pub struct MountInfo {
    /// The mount path (e.g., "/mnt/data").
    pub path: String,
    /// Options the backend was mounted with.
    pub options: MountOptions,
}

struct Mount {
    fs: Arc<dyn Filesystem>,
    options: MountOptions,
}

/// A successfully resolved path.
pub struct Resolved {
    /// Open descriptor, already initialized with `path`.
    pub desc: Arc<dyn Descriptor>,
    /// Backend that owns the object.
    pub fs: Arc<dyn Filesystem>,
    /// Mount point the backend is attached at.
    pub mount_point: String,
    /// Real absolute path after symlink expansion.
    pub path: String,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("mount_point", &self.mount_point)
            .field("path", &self.path)
            .finish()
    }
}

/// Where a not-yet-opened entry lives: its real path and owning backend.
struct Location {
    path: String,
    mount_point: String,
    fs: Arc<dyn Filesystem>,
    rel: String,
}

/// Routes filesystem operations to mounted backends.
///
/// Mount points are matched by longest prefix: with `/` and `/mnt/data`
/// both mounted, `/mnt/data/x` goes to the `/mnt/data` backend as `/x`.
pub struct MountTable {
    /// Mount points, keyed by real path.
    mounts: RwLock<BTreeMap<String, Mount>>,
    /// Symlink expansions allowed per resolution.
    hop_limit: usize,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("mounts", &"<locked>")
            .field("hop_limit", &self.hop_limit)
            .finish()
    }
}

/// Build the path a symlink expands to.
///
/// `link` is the link's own absolute path, `rest` whatever followed it in the
/// path being resolved (empty, or starting with `/`).
fn splice(link: &str, target: &str, rest: &str) -> String {
    if target.starts_with('/') {
        realpath(&format!("{target}{rest}"))
    } else {
        realpath(&format!("{}/{target}{rest}", dirname(link)))
    }
}

/// Read a symlink's text and release the descriptor.
async fn read_target(link: Arc<dyn Descriptor>) -> KernelResult<String> {
    let target = link.read_str().await;
    if let Err(err) = link.close().await {
        warn!(?err, "failed to close symlink descriptor");
    }
    target
}

impl MountTable {
    /// Create an empty mount table.
    pub fn new(hop_limit: usize) -> Self {
        Self {
            mounts: RwLock::new(BTreeMap::new()),
            hop_limit,
        }
    }

    // ========================================================================
    // Mount management
    // ========================================================================

    /// Install the root filesystem. Fails with `Busy` unless the table is empty.
    pub async fn mount_root(
        &self,
        fs: Arc<dyn Filesystem>,
        options: MountOptions,
    ) -> KernelResult<()> {
        if !self.mounts.read().await.is_empty() {
            return Err(Errno::Busy);
        }
        fs.initialize(&options).await?;
        let mut mounts = self.mounts.write().await;
        if !mounts.is_empty() {
            return Err(Errno::Busy);
        }
        mounts.insert("/".to_string(), Mount { fs, options });
        debug!("root filesystem mounted");
        Ok(())
    }

    /// Mount `fs` on an existing empty directory.
    ///
    /// The path is resolved (symlinks followed) and the mount is keyed by the
    /// resulting real path. The backend is initialized before it becomes
    /// reachable.
    #[tracing::instrument(name = "vfs.mount", skip(self, fs, options))]
    pub async fn add_mount(
        &self,
        path: &str,
        fs: Arc<dyn Filesystem>,
        options: MountOptions,
    ) -> KernelResult<()> {
        if self.is_mount_point(path).await {
            return Err(Errno::Busy);
        }

        let req = OpenRequest::follow().with_oflags(OpenFlags::DIRECTORY);
        let target = self.resolve(path, &req).await?;
        // A symlink alias of a mount point resolves to its real path.
        let busy = self.mounts.read().await.contains_key(&target.path);
        let entries = if busy {
            Ok(Vec::new())
        } else {
            target.desc.readdir(true).await
        };
        if let Err(err) = target.desc.close().await {
            warn!(?err, "failed to close mount target");
        }
        if busy {
            return Err(Errno::Busy);
        }
        if !entries?.is_empty() {
            return Err(Errno::Notempty);
        }

        fs.initialize(&options).await?;

        let mut mounts = self.mounts.write().await;
        if mounts.contains_key(&target.path) {
            return Err(Errno::Busy);
        }
        debug!(mount_point = %target.path, "mounted");
        mounts.insert(target.path, Mount { fs, options });
        Ok(())
    }

    /// Unmount the filesystem at `path`.
    ///
    /// `Inval` if nothing is mounted there, `Busy` if another mount lies
    /// beneath it.
    pub async fn remove_mount(&self, path: &str) -> KernelResult<Arc<dyn Filesystem>> {
        let path = realpath(path);
        let mut mounts = self.mounts.write().await;
        if !mounts.contains_key(&path) {
            return Err(Errno::Inval);
        }
        if mounts
            .keys()
            .any(|other| *other != path && is_within(other, &path))
        {
            return Err(Errno::Busy);
        }
        let mount = mounts.remove(&path).ok_or(Errno::Inval)?;
        debug!(mount_point = %path, "unmounted");
        Ok(mount.fs)
    }

    /// List all current mounts, sorted by path.
    pub async fn list_mounts(&self) -> Vec<MountInfo> {
        let mounts = self.mounts.read().await;
        mounts
            .iter()
            .map(|(path, mount)| MountInfo {
                path: path.clone(),
                options: mount.options.clone(),
            })
            .collect()
    }

    /// Whether `path` (normalized lexically) is a mount point.
    pub async fn is_mount_point(&self, path: &str) -> bool {
        self.mounts.read().await.contains_key(&realpath(path))
    }

    /// Find the mount owning a normalized absolute path.
    async fn find_mount(&self, path: &str) -> KernelResult<(String, Arc<dyn Filesystem>)> {
        let mounts = self.mounts.read().await;
        mounts
            .iter()
            .filter(|(mount_point, _)| is_within(path, mount_point))
            .max_by_key(|(mount_point, _)| mount_point.len())
            .map(|(mount_point, mount)| (mount_point.clone(), Arc::clone(&mount.fs)))
            .ok_or(Errno::Noent)
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolve and open an absolute path.
    ///
    /// With `SYMLINK_FOLLOW`, every symlink met along the way (including the
    /// last component) is expanded, up to the table's hop limit; `Loop` once
    /// that is exhausted. Without it, a symlink mid-path is `Notdir` and a
    /// final symlink is opened as itself.
    #[tracing::instrument(name = "vfs.resolve", skip(self, req), level = "debug")]
    pub async fn resolve(&self, path: &str, req: &OpenRequest) -> KernelResult<Resolved> {
        let follow = req.follows_symlinks();
        let mut path = realpath(path);
        let mut hops = self.hop_limit;

        loop {
            let (mount_point, fs) = self.find_mount(&path).await?;
            let rel = strip_within(&path, &mount_point);

            let (link, target, rest) = match fs.open(&rel, req).await? {
                Resolution::Complete(desc) => {
                    let is_link = desc.fdstat().await.filetype.is_symlink();
                    if !(follow && is_link) {
                        desc.initialize(&path).await?;
                        return Ok(Resolved {
                            desc,
                            fs,
                            mount_point,
                            path,
                        });
                    }
                    let target = read_target(desc).await?;
                    (path.clone(), target, String::new())
                }
                Resolution::NotDirectory { end } => {
                    if !follow {
                        return Err(Errno::Notdir);
                    }
                    let prefix = rel.get(..end).ok_or(Errno::Inval)?;
                    let desc = match fs.open(prefix, &OpenRequest::nofollow()).await? {
                        Resolution::Complete(desc) => desc,
                        Resolution::NotDirectory { .. } => return Err(Errno::Notdir),
                    };
                    if !desc.fdstat().await.filetype.is_symlink() {
                        if let Err(err) = desc.close().await {
                            warn!(?err, "failed to close descriptor");
                        }
                        return Err(Errno::Notdir);
                    }
                    let target = read_target(desc).await?;
                    let rest = rel[end..].to_string();
                    (join_within(&mount_point, prefix), target, rest)
                }
            };

            if hops == 0 {
                debug!(%path, "symlink hop limit reached");
                return Err(Errno::Loop);
            }
            hops -= 1;
            path = splice(&link, &target, &rest);
        }
    }

    /// Open an absolute path.
    pub async fn open(&self, path: &str, req: &OpenRequest) -> KernelResult<Arc<dyn Descriptor>> {
        Ok(self.resolve(path, req).await?.desc)
    }

    /// Open `path` relative to an open directory. Absolute paths ignore `dir`.
    pub async fn open_at(
        &self,
        dir: &dyn Descriptor,
        path: &str,
        req: &OpenRequest,
    ) -> KernelResult<Arc<dyn Descriptor>> {
        self.open(&abspath(&dir.path(), path), req).await
    }

    /// Locate an entry by resolving its parent directory.
    ///
    /// The last component is not expanded, so the result may name a symlink
    /// or something that does not exist yet.
    async fn locate(&self, path: &str) -> KernelResult<Location> {
        let path = realpath(path);
        if path == "/" {
            return Err(Errno::Busy);
        }
        let req = OpenRequest::follow().with_oflags(OpenFlags::DIRECTORY);
        let parent = self.resolve(dirname(&path), &req).await?;
        if let Err(err) = parent.desc.close().await {
            warn!(?err, "failed to close parent directory");
        }

        let path = join_within(&parent.path, &format!("/{}", basename(&path)));
        let (mount_point, fs) = self.find_mount(&path).await?;
        let rel = strip_within(&path, &mount_point);
        Ok(Location {
            path,
            mount_point,
            fs,
            rel,
        })
    }

    // ========================================================================
    // Namespace operations
    // ========================================================================

    /// Create a directory. The parent must exist.
    pub async fn create_dir(&self, path: &str) -> KernelResult<()> {
        let loc = self.locate(path).await.map_err(|err| match err {
            Errno::Busy => Errno::Exist,
            other => other,
        })?;
        if self.is_mount_point(&loc.path).await {
            return Err(Errno::Exist);
        }
        loc.fs.mkdir(&loc.rel).await
    }

    /// Create a symlink at `path` pointing at `target`. The target text is
    /// stored as given and is not checked.
    pub async fn add_symlink(&self, target: &str, path: &str) -> KernelResult<()> {
        let loc = self.locate(path).await.map_err(|err| match err {
            Errno::Busy => Errno::Exist,
            other => other,
        })?;
        if self.is_mount_point(&loc.path).await {
            return Err(Errno::Exist);
        }
        loc.fs.symlink(target, &loc.rel).await
    }

    /// Remove a file or symlink (`is_dir == false`) or an empty directory.
    /// Mount points cannot be removed.
    pub async fn remove_entry(&self, path: &str, is_dir: bool) -> KernelResult<()> {
        let loc = self.locate(path).await?;
        if self.is_mount_point(&loc.path).await {
            return Err(Errno::Busy);
        }
        loc.fs.unlink(&loc.rel, is_dir).await
    }

    /// Text of the symlink at `path`.
    pub async fn read_link(&self, path: &str) -> KernelResult<String> {
        let loc = self.locate(path).await.map_err(|err| match err {
            Errno::Busy => Errno::Inval,
            other => other,
        })?;
        let link = self.resolve(&loc.path, &OpenRequest::nofollow()).await?;
        if !link.desc.fdstat().await.filetype.is_symlink() {
            if let Err(err) = link.desc.close().await {
                warn!(?err, "failed to close descriptor");
            }
            return Err(Errno::Inval);
        }
        read_target(link.desc).await
    }

    /// Attributes of the object at `path`.
    pub async fn filestat(&self, path: &str, req: &OpenRequest) -> KernelResult<Filestat> {
        let resolved = self.resolve(path, req).await?;
        let stat = resolved.desc.filestat().await;
        if let Err(err) = resolved.desc.close().await {
            warn!(?err, "failed to close descriptor");
        }
        stat
    }

    /// Rename `from` to `to` within one backend.
    ///
    /// `from` itself is not expanded, so moving a symlink moves the link.
    /// An existing `to` is replaced when the types agree and, for
    /// directories, it is empty.
    pub async fn move_entry(&self, from: &str, to: &str) -> KernelResult<()> {
        let src = self.locate(from).await?;
        let dst = self.locate(to).await?;
        if self.is_mount_point(&src.path).await || self.is_mount_point(&dst.path).await {
            return Err(Errno::Busy);
        }
        if !Arc::ptr_eq(&src.fs, &dst.fs) {
            return Err(Errno::Xdev);
        }

        let src_type = self.entry_type(&src).await?;
        if src_type == FileType::Directory && is_within(&dst.path, &src.path) {
            return Err(Errno::Inval);
        }

        match self.resolve(&dst.path, &OpenRequest::nofollow()).await {
            Ok(existing) => {
                let dst_type = existing.desc.fdstat().await.filetype;
                let check = if dst_type == FileType::Directory {
                    if src_type != FileType::Directory {
                        Err(Errno::Notdir)
                    } else {
                        match existing.desc.readdir(true).await {
                            Ok(entries) if !entries.is_empty() => Err(Errno::Notempty),
                            Ok(_) => Ok(()),
                            Err(err) => Err(err),
                        }
                    }
                } else if src_type == FileType::Directory {
                    Err(Errno::Isdir)
                } else {
                    Ok(())
                };
                if let Err(err) = existing.desc.close().await {
                    warn!(?err, "failed to close descriptor");
                }
                check?;
            }
            Err(Errno::Noent) => {}
            Err(err) => return Err(err),
        }

        debug!(from = %src.path, to = %dst.path, mount_point = %src.mount_point, "rename");
        src.fs.rename(&src.rel, &dst.rel).await
    }

    async fn entry_type(&self, loc: &Location) -> KernelResult<FileType> {
        let resolved = self.resolve(&loc.path, &OpenRequest::nofollow()).await?;
        let filetype = resolved.desc.fdstat().await.filetype;
        if let Err(err) = resolved.desc.close().await {
            warn!(?err, "failed to close descriptor");
        }
        Ok(filetype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::backends::MemoryFs;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use wasmux_types::DeviceId;

    async fn table() -> MountTable {
        let table = MountTable::new(40);
        table
            .mount_root(Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();
        table
    }

    async fn write_file(table: &MountTable, path: &str, data: &[u8]) {
        let req = OpenRequest::follow().with_oflags(OpenFlags::CREAT | OpenFlags::TRUNC);
        let desc = table.open(path, &req).await.unwrap();
        desc.write(data).await.unwrap();
        desc.close().await.unwrap();
    }

    async fn read_file(table: &MountTable, path: &str) -> KernelResult<Vec<u8>> {
        let desc = table.open(path, &OpenRequest::follow()).await?;
        let data = desc.read_to_end().await;
        desc.close().await?;
        data
    }

    #[tokio::test]
    async fn test_resolve_normalizes_path() {
        let table = table().await;
        table.create_dir("/etc").await.unwrap();
        write_file(&table, "/etc/hosts", b"localhost").await;

        let resolved = table
            .resolve("/etc/./../etc//hosts/", &OpenRequest::follow())
            .await
            .unwrap();
        assert_eq!(resolved.path, "/etc/hosts");
        assert_eq!(resolved.desc.path(), "/etc/hosts");
        assert_eq!(resolved.mount_point, "/");
    }

    #[tokio::test]
    async fn test_nested_mount_routing() {
        let table = table().await;
        table.create_dir("/mnt").await.unwrap();
        table.create_dir("/mnt/data").await.unwrap();
        table
            .add_mount("/mnt/data", Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();

        write_file(&table, "/mnt/data/a.txt", b"inner").await;
        write_file(&table, "/mnt/b.txt", b"outer").await;

        let resolved = table
            .resolve("/mnt/data/a.txt", &OpenRequest::follow())
            .await
            .unwrap();
        assert_eq!(resolved.mount_point, "/mnt/data");
        assert_eq!(read_file(&table, "/mnt/b.txt").await.unwrap(), b"outer");

        let mounts = table.list_mounts().await;
        let paths: Vec<_> = mounts.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/mnt/data"]);
    }

    #[tokio::test]
    async fn test_symlink_hop_limit() {
        let table = table().await;
        write_file(&table, "/f", b"end").await;
        table.add_symlink("/f", "/l1").await.unwrap();
        for i in 2..=41 {
            table
                .add_symlink(&format!("/l{}", i - 1), &format!("/l{i}"))
                .await
                .unwrap();
        }

        assert_eq!(read_file(&table, "/l40").await.unwrap(), b"end");
        assert_eq!(read_file(&table, "/l41").await, Err(Errno::Loop));
    }

    #[tokio::test]
    async fn test_symlink_cycle_is_loop() {
        let table = table().await;
        table.add_symlink("/b", "/a").await.unwrap();
        table.add_symlink("/a", "/b").await.unwrap();
        assert_eq!(read_file(&table, "/a").await, Err(Errno::Loop));
    }

    #[tokio::test]
    async fn test_absolute_symlink_crosses_mounts() {
        let table = table().await;
        table.create_dir("/etc").await.unwrap();
        write_file(&table, "/etc/hosts", b"root").await;
        table.create_dir("/data").await.unwrap();
        table
            .add_mount("/data", Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();
        table.add_symlink("/etc", "/data/etc").await.unwrap();
        table.add_symlink("../etc/hosts", "/data/hosts").await.unwrap();

        let resolved = table
            .resolve("/data/etc/hosts", &OpenRequest::follow())
            .await
            .unwrap();
        assert_eq!(resolved.path, "/etc/hosts");
        assert_eq!(resolved.mount_point, "/");

        // Relative targets are spliced at the link's own directory.
        assert_eq!(read_file(&table, "/data/hosts").await.unwrap(), b"root");
    }

    #[tokio::test]
    async fn test_nofollow() {
        let table = table().await;
        table.create_dir("/real").await.unwrap();
        table.add_symlink("/real", "/link").await.unwrap();

        let link = table.open("/link", &OpenRequest::nofollow()).await.unwrap();
        assert!(link.fdstat().await.filetype.is_symlink());
        assert_eq!(
            table.open("/link/x", &OpenRequest::nofollow()).await.err(),
            Some(Errno::Notdir)
        );
        assert_eq!(table.read_link("/link").await.unwrap(), "/real");
        assert_eq!(table.read_link("/real").await, Err(Errno::Inval));
    }

    #[tokio::test]
    async fn test_file_mid_path_is_notdir() {
        let table = table().await;
        write_file(&table, "/file", b"x").await;
        assert_eq!(
            table.open("/file/x", &OpenRequest::follow()).await.err(),
            Some(Errno::Notdir)
        );
    }

    #[tokio::test]
    async fn test_mount_errors() {
        let table = table().await;
        table.create_dir("/full").await.unwrap();
        write_file(&table, "/full/x", b"x").await;
        table.create_dir("/empty").await.unwrap();

        assert_eq!(
            table
                .add_mount("/full", Arc::new(MemoryFs::new()), MountOptions::new())
                .await,
            Err(Errno::Notempty)
        );
        assert_eq!(
            table
                .add_mount("/missing", Arc::new(MemoryFs::new()), MountOptions::new())
                .await,
            Err(Errno::Noent)
        );

        table
            .add_mount("/empty", Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();
        assert_eq!(
            table
                .add_mount("/empty", Arc::new(MemoryFs::new()), MountOptions::new())
                .await,
            Err(Errno::Busy)
        );

        table.create_dir("/empty/sub").await.unwrap();
        write_file(&table, "/empty/sub/y", b"y").await;
        assert_eq!(
            table
                .add_mount("/empty/sub", Arc::new(MemoryFs::new()), MountOptions::new())
                .await,
            Err(Errno::Notempty)
        );
        assert_eq!(
            table
                .mount_root(Arc::new(MemoryFs::new()), MountOptions::new())
                .await,
            Err(Errno::Busy)
        );
    }

    #[tokio::test]
    async fn test_mount_follows_symlink_to_real_path() {
        let table = table().await;
        table.create_dir("/target").await.unwrap();
        table.add_symlink("/target", "/alias").await.unwrap();
        table
            .add_mount("/alias", Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();
        assert!(table.is_mount_point("/target").await);
        assert!(!table.is_mount_point("/alias").await);

        // Occupied mount point reached through the alias.
        write_file(&table, "/target/data", b"x").await;
        assert_eq!(
            table
                .add_mount("/alias", Arc::new(MemoryFs::new()), MountOptions::new())
                .await,
            Err(Errno::Busy)
        );
    }

    #[tokio::test]
    async fn test_remove_mount() {
        let table = table().await;
        table.create_dir("/a").await.unwrap();
        table
            .add_mount("/a", Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();
        table.create_dir("/a/b").await.unwrap();
        table
            .add_mount("/a/b", Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();

        assert_eq!(table.remove_mount("/nope").await.err(), Some(Errno::Inval));
        assert_eq!(table.remove_mount("/a").await.err(), Some(Errno::Busy));
        assert_eq!(table.remove_entry("/a/b", true).await, Err(Errno::Busy));
        table.remove_mount("/a/b").await.unwrap();
        table.remove_mount("/a/").await.unwrap();
        assert!(!table.is_mount_point("/a").await);
    }

    #[tokio::test]
    async fn test_move_entry() {
        let table = table().await;
        table.create_dir("/src").await.unwrap();
        write_file(&table, "/src/f", b"data").await;
        table.create_dir("/dir").await.unwrap();
        table.create_dir("/full").await.unwrap();
        write_file(&table, "/full/x", b"x").await;

        table.move_entry("/src/f", "/g").await.unwrap();
        assert_eq!(read_file(&table, "/g").await.unwrap(), b"data");
        assert_eq!(read_file(&table, "/src/f").await, Err(Errno::Noent));

        assert_eq!(table.move_entry("/g", "/dir").await, Err(Errno::Notdir));
        assert_eq!(table.move_entry("/dir", "/g").await, Err(Errno::Isdir));
        assert_eq!(table.move_entry("/src", "/full").await, Err(Errno::Notempty));
        assert_eq!(table.move_entry("/src", "/src/inner").await, Err(Errno::Inval));
        table.move_entry("/src", "/dir").await.unwrap();
        assert_eq!(table.move_entry("/", "/x").await, Err(Errno::Busy));
    }

    #[tokio::test]
    async fn test_move_across_mounts_is_xdev() {
        let table = table().await;
        write_file(&table, "/f", b"x").await;
        table.create_dir("/other").await.unwrap();
        table
            .add_mount("/other", Arc::new(MemoryFs::new()), MountOptions::new())
            .await
            .unwrap();
        assert_eq!(table.move_entry("/f", "/other/f").await, Err(Errno::Xdev));
        assert_eq!(table.move_entry("/other", "/moved").await, Err(Errno::Busy));
    }

    #[tokio::test]
    async fn test_open_at_and_filestat() {
        let table = table().await;
        table.create_dir("/home").await.unwrap();
        write_file(&table, "/home/notes", b"12345").await;

        let home = table.open("/home", &OpenRequest::follow()).await.unwrap();
        let notes = table
            .open_at(home.as_ref(), "./notes", &OpenRequest::follow())
            .await
            .unwrap();
        assert_eq!(notes.path(), "/home/notes");

        let stat = table.filestat("/home/notes", &OpenRequest::follow()).await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(stat.filetype.is_file());
    }

    /// Records every path a backend is asked about.
    struct Recording {
        inner: MemoryFs,
        seen: Mutex<Vec<String>>,
    }

    impl Recording {
        fn note(&self, path: &str) {
            self.seen.lock().push(path.to_string());
        }
    }

    #[async_trait]
    impl Filesystem for Recording {
        async fn open(&self, path: &str, req: &OpenRequest) -> KernelResult<Resolution> {
            self.note(path);
            self.inner.open(path, req).await
        }

        async fn mkdir(&self, path: &str) -> KernelResult<()> {
            self.note(path);
            self.inner.mkdir(path).await
        }

        async fn unlink(&self, path: &str, is_dir: bool) -> KernelResult<()> {
            self.note(path);
            self.inner.unlink(path, is_dir).await
        }

        async fn rename(&self, from: &str, to: &str) -> KernelResult<()> {
            self.note(from);
            self.note(to);
            self.inner.rename(from, to).await
        }

        async fn symlink(&self, target: &str, path: &str) -> KernelResult<()> {
            self.note(path);
            self.inner.symlink(target, path).await
        }

        async fn mknod(&self, path: &str, dev: DeviceId) -> KernelResult<()> {
            self.note(path);
            self.inner.mknod(path, dev).await
        }

        async fn root_filestat(&self) -> KernelResult<Filestat> {
            self.inner.root_filestat().await
        }
    }

    #[tokio::test]
    async fn test_backend_never_sees_dot_components() {
        let recording = Arc::new(Recording {
            inner: MemoryFs::new(),
            seen: Mutex::new(Vec::new()),
        });
        let table = MountTable::new(40);
        table
            .mount_root(recording.clone(), MountOptions::new())
            .await
            .unwrap();

        table.create_dir("/a/").await.unwrap();
        table.create_dir("/a/./b").await.unwrap();
        table.add_symlink("./b/.", "/a/up").await.unwrap();
        write_file(&table, "/a/b/../b/./f", b"x").await;
        assert_eq!(read_file(&table, "/a/up/f").await.unwrap(), b"x");
        let _ = read_file(&table, "//a/./missing/../b//f").await;
        table.move_entry("/a/b/./f", "/a/../a/g").await.unwrap();

        let seen = recording.seen.lock();
        assert!(!seen.is_empty());
        for path in seen.iter() {
            assert!(path.starts_with('/'), "{path}");
            assert!(!path.contains("//"), "{path}");
            assert!(
                path.split('/').all(|c| c != "." && c != ".."),
                "{path}"
            );
        }
    }
}
