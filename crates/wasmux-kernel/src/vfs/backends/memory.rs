//! In-memory filesystem backend.
//!
//! An inode tree behind one lock. Used for testing; all data is lost when the
//! last handle drops.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use wasmux_types::{
    DeviceId, Dirent, Errno, EventType, FdFlags, Fdstat, FileType, Filestat, KernelResult,
    OpenFlags, Rights, Timestamp, Whence, now_nanos,
};

use crate::poll::PollSub;
use crate::vfs::descriptor::Descriptor;
use crate::vfs::filesystem::{Filesystem, OpenRequest, Resolution};

type Ino = u64;

const ROOT: Ino = 1;

/// Device numbers handed out to new instances.
static NEXT_DEV: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
enum Content {
    File(Vec<u8>),
    Dir(BTreeMap<String, Ino>),
    Symlink(String),
    Device(DeviceId),
}

#[derive(Debug)]
struct Node {
    content: Content,
    atim: Timestamp,
    mtim: Timestamp,
    ctim: Timestamp,
}

impl Node {
    fn new(content: Content) -> Self {
        let now = now_nanos();
        Self {
            content,
            atim: now,
            mtim: now,
            ctim: now,
        }
    }

    fn filetype(&self) -> FileType {
        match self.content {
            Content::File(_) => FileType::RegularFile,
            Content::Dir(_) => FileType::Directory,
            Content::Symlink(_) => FileType::SymbolicLink,
            Content::Device(_) => FileType::CharacterDevice,
        }
    }

    fn size(&self) -> u64 {
        match &self.content {
            Content::File(data) => data.len() as u64,
            Content::Dir(entries) => entries.len() as u64,
            Content::Symlink(target) => target.len() as u64,
            Content::Device(_) => 0,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.content, Content::Dir(_))
    }
}

#[derive(Debug)]
struct Tree {
    dev: u64,
    nodes: HashMap<Ino, Node>,
    next_ino: Ino,
    open: usize,
}

/// Offsets just past each non-empty component of `path`, with its name.
fn components(path: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut pos = 0;
    for part in path.split('/') {
        let end = pos + part.len();
        if !part.is_empty() {
            out.push((end, part));
        }
        pos = end + 1;
    }
    out
}

/// Split into parent path and final name. `None` for the root.
fn split_last(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return None;
    }
    Some((&trimmed[..idx], name))
}

impl Tree {
    fn new(dev: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT, Node::new(Content::Dir(BTreeMap::new())));
        Self {
            dev,
            nodes,
            next_ino: ROOT + 1,
            open: 0,
        }
    }

    fn node(&self, ino: Ino) -> KernelResult<&Node> {
        self.nodes.get(&ino).ok_or(Errno::Badf)
    }

    fn node_mut(&mut self, ino: Ino) -> KernelResult<&mut Node> {
        self.nodes.get_mut(&ino).ok_or(Errno::Badf)
    }

    fn dir(&self, ino: Ino) -> KernelResult<&BTreeMap<String, Ino>> {
        match &self.node(ino)?.content {
            Content::Dir(entries) => Ok(entries),
            _ => Err(Errno::Notdir),
        }
    }

    fn dir_mut(&mut self, ino: Ino) -> KernelResult<&mut BTreeMap<String, Ino>> {
        match &mut self.node_mut(ino)?.content {
            Content::Dir(entries) => Ok(entries),
            _ => Err(Errno::Notdir),
        }
    }

    /// Walk a path that must consist of directories only.
    fn lookup_dir(&self, path: &str) -> KernelResult<Ino> {
        let mut cur = ROOT;
        for (_, name) in components(path) {
            cur = *self.dir(cur)?.get(name).ok_or(Errno::Noent)?;
        }
        self.dir(cur)?;
        Ok(cur)
    }

    fn insert(&mut self, parent: Ino, name: &str, content: Content) -> KernelResult<Ino> {
        if self.dir(parent)?.contains_key(name) {
            return Err(Errno::Exist);
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, Node::new(content));
        self.dir_mut(parent)?.insert(name.to_string(), ino);
        self.node_mut(parent)?.mtim = now_nanos();
        Ok(ino)
    }

    /// Create a node at `path` whose parent must exist.
    fn create_at(&mut self, path: &str, content: Content) -> KernelResult<Ino> {
        let (parent, name) = split_last(path).ok_or(Errno::Exist)?;
        let parent = self.lookup_dir(parent)?;
        self.insert(parent, name, content)
    }

    fn filestat(&self, ino: Ino) -> KernelResult<Filestat> {
        let node = self.node(ino)?;
        Ok(Filestat {
            dev: self.dev,
            ino,
            filetype: node.filetype(),
            nlink: 1,
            size: node.size(),
            atim: node.atim,
            mtim: node.mtim,
            ctim: node.ctim,
        })
    }
}

/// In-memory filesystem backend.
///
/// Thread-safe via an internal lock. Every instance gets its own device
/// number, so objects from two instances never compare as the same file.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    tree: Arc<RwLock<Tree>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// Create a new filesystem containing only an empty root directory.
    pub fn new() -> Self {
        let dev = NEXT_DEV.fetch_add(1, Ordering::Relaxed);
        Self {
            tree: Arc::new(RwLock::new(Tree::new(dev))),
        }
    }

    /// Descriptors opened on this filesystem and not yet fully closed.
    pub fn open_descriptors(&self) -> usize {
        self.tree.read().open
    }

    fn descriptor(&self, tree: &mut Tree, ino: Ino, req: &OpenRequest) -> KernelResult<MemDescriptor> {
        let filetype = tree.node(ino)?.filetype();
        tree.open += 1;
        Ok(MemDescriptor {
            tree: Arc::clone(&self.tree),
            ino,
            filetype,
            path: Mutex::new(String::new()),
            state: Mutex::new(HandleState {
                cursor: 0,
                flags: req.fdflags,
                rights_base: req.rights_base,
                rights_inheriting: req.rights_inheriting,
            }),
            refs: AtomicUsize::new(1),
        })
    }
}

#[async_trait]
impl Filesystem for MemoryFs {
    async fn open(&self, path: &str, req: &OpenRequest) -> KernelResult<Resolution> {
        let mut tree = self.tree.write();
        let comps = components(path);
        let mut cur = ROOT;
        let mut created = false;

        for (i, &(end, name)) in comps.iter().enumerate() {
            let last = i + 1 == comps.len();
            let child = tree.dir(cur)?.get(name).copied();
            match child {
                Some(ino) => {
                    if !last && !tree.node(ino)?.is_dir() {
                        return Ok(Resolution::NotDirectory { end });
                    }
                    cur = ino;
                }
                None if last && req.oflags.contains(OpenFlags::CREAT) => {
                    cur = tree.insert(cur, name, Content::File(Vec::new()))?;
                    created = true;
                }
                None => return Err(Errno::Noent),
            }
        }

        let node = tree.node(cur)?;
        let skip_oflags = node.filetype().is_symlink() && req.follows_symlinks();
        if !skip_oflags {
            if !created && req.oflags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                return Err(Errno::Exist);
            }
            if req.oflags.contains(OpenFlags::DIRECTORY) && !node.is_dir() {
                return Err(Errno::Notdir);
            }
            if req.oflags.contains(OpenFlags::TRUNC) {
                match &mut tree.node_mut(cur)?.content {
                    Content::File(data) => data.clear(),
                    Content::Dir(_) => return Err(Errno::Isdir),
                    _ => {}
                }
            }
        }

        let desc = self.descriptor(&mut tree, cur, req)?;
        Ok(Resolution::Complete(Arc::new(desc)))
    }

    async fn mkdir(&self, path: &str) -> KernelResult<()> {
        self.tree
            .write()
            .create_at(path, Content::Dir(BTreeMap::new()))
            .map(|_| ())
    }

    async fn unlink(&self, path: &str, is_dir: bool) -> KernelResult<()> {
        let mut tree = self.tree.write();
        let (parent, name) = split_last(path).ok_or(Errno::Busy)?;
        let parent = tree.lookup_dir(parent)?;
        let ino = *tree.dir(parent)?.get(name).ok_or(Errno::Noent)?;
        let node = tree.node(ino)?;
        match (&node.content, is_dir) {
            (Content::Dir(entries), true) if !entries.is_empty() => return Err(Errno::Notempty),
            (Content::Dir(_), false) => return Err(Errno::Isdir),
            (_, true) if !node.is_dir() => return Err(Errno::Notdir),
            _ => {}
        }
        tree.dir_mut(parent)?.remove(name);
        tree.nodes.remove(&ino);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> KernelResult<()> {
        if from == to {
            return Ok(());
        }
        let mut tree = self.tree.write();
        let (src_parent, src_name) = split_last(from).ok_or(Errno::Busy)?;
        let (dst_parent, dst_name) = split_last(to).ok_or(Errno::Busy)?;
        let src_parent = tree.lookup_dir(src_parent)?;
        let dst_parent = tree.lookup_dir(dst_parent)?;
        let ino = *tree.dir(src_parent)?.get(src_name).ok_or(Errno::Noent)?;
        let src_is_dir = tree.node(ino)?.is_dir();

        if let Some(existing) = tree.dir(dst_parent)?.get(dst_name).copied() {
            match (&tree.node(existing)?.content, src_is_dir) {
                (Content::Dir(_), false) => return Err(Errno::Isdir),
                (Content::Dir(entries), true) if !entries.is_empty() => {
                    return Err(Errno::Notempty);
                }
                (Content::Dir(_), true) => {}
                (_, true) => return Err(Errno::Notdir),
                _ => {}
            }
            tree.nodes.remove(&existing);
        }

        tree.dir_mut(src_parent)?.remove(src_name);
        tree.dir_mut(dst_parent)?.insert(dst_name.to_string(), ino);
        tree.node_mut(ino)?.ctim = now_nanos();
        Ok(())
    }

    async fn symlink(&self, target: &str, path: &str) -> KernelResult<()> {
        self.tree
            .write()
            .create_at(path, Content::Symlink(target.to_string()))
            .map(|_| ())
    }

    async fn mknod(&self, path: &str, dev: DeviceId) -> KernelResult<()> {
        self.tree
            .write()
            .create_at(path, Content::Device(dev))
            .map(|_| ())
    }

    async fn root_filestat(&self) -> KernelResult<Filestat> {
        self.tree.read().filestat(ROOT)
    }
}

#[derive(Debug)]
struct HandleState {
    cursor: u64,
    flags: FdFlags,
    rights_base: Rights,
    rights_inheriting: Rights,
}

/// Open handle into a [`MemoryFs`].
#[derive(Debug)]
pub struct MemDescriptor {
    tree: Arc<RwLock<Tree>>,
    ino: Ino,
    filetype: FileType,
    path: Mutex<String>,
    state: Mutex<HandleState>,
    refs: AtomicUsize,
}

impl MemDescriptor {
    fn read_at(&self, len: usize, pos: u64) -> KernelResult<Vec<u8>> {
        let tree = self.tree.read();
        let bytes: &[u8] = match &tree.node(self.ino)?.content {
            Content::File(data) => data,
            Content::Symlink(target) => target.as_bytes(),
            Content::Dir(_) => return Err(Errno::Isdir),
            Content::Device(_) => return Err(Errno::Badf),
        };
        let start = (pos as usize).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn write_at(&self, buf: &[u8], pos: u64) -> KernelResult<u64> {
        let mut tree = self.tree.write();
        let node = tree.node_mut(self.ino)?;
        let is_dir = node.is_dir();
        let Content::File(data) = &mut node.content else {
            return Err(if is_dir { Errno::Isdir } else { Errno::Badf });
        };
        let pos = pos as usize;
        if pos + buf.len() > data.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        node.mtim = now_nanos();
        Ok(buf.len() as u64)
    }

    fn size(&self) -> KernelResult<u64> {
        Ok(self.tree.read().node(self.ino)?.size())
    }
}

#[async_trait]
impl Descriptor for MemDescriptor {
    async fn fdstat(&self) -> Fdstat {
        let state = self.state.lock();
        Fdstat {
            filetype: self.filetype,
            flags: state.flags,
            rights_base: state.rights_base,
            rights_inheriting: state.rights_inheriting,
        }
    }

    async fn filestat(&self) -> KernelResult<Filestat> {
        self.tree.read().filestat(self.ino)
    }

    fn path(&self) -> String {
        self.path.lock().clone()
    }

    async fn initialize(&self, path: &str) -> KernelResult<()> {
        *self.path.lock() = path.to_string();
        Ok(())
    }

    async fn set_filestat_times(
        &self,
        atim: Option<Timestamp>,
        mtim: Option<Timestamp>,
    ) -> KernelResult<()> {
        let mut tree = self.tree.write();
        let node = tree.node_mut(self.ino)?;
        if let Some(atim) = atim {
            node.atim = atim;
        }
        if let Some(mtim) = mtim {
            node.mtim = mtim;
        }
        Ok(())
    }

    async fn set_fdstat_flags(&self, flags: FdFlags) -> KernelResult<()> {
        self.state.lock().flags = flags;
        Ok(())
    }

    async fn set_fdstat_rights(&self, base: Rights, inheriting: Rights) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.rights_base = base;
        state.rights_inheriting = inheriting;
        Ok(())
    }

    async fn close(&self) -> KernelResult<()> {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Errno::Badf)?;
        if prev == 1 {
            self.tree.write().open -= 1;
        }
        Ok(())
    }

    fn duplicate(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    async fn read(&self, len: usize) -> KernelResult<Vec<u8>> {
        let mut state = self.state.lock();
        let data = self.read_at(len, state.cursor)?;
        state.cursor += data.len() as u64;
        Ok(data)
    }

    async fn pread(&self, len: usize, pos: u64) -> KernelResult<Vec<u8>> {
        self.read_at(len, pos)
    }

    async fn write(&self, buf: &[u8]) -> KernelResult<u64> {
        let mut state = self.state.lock();
        let pos = if state.flags.contains(FdFlags::APPEND) {
            self.size()?
        } else {
            state.cursor
        };
        let n = self.write_at(buf, pos)?;
        state.cursor = pos + n;
        Ok(n)
    }

    async fn pwrite(&self, buf: &[u8], pos: u64) -> KernelResult<u64> {
        self.write_at(buf, pos)
    }

    async fn seek(&self, offset: i64, whence: Whence) -> KernelResult<u64> {
        if self.filetype.is_dir() {
            return Err(Errno::Isdir);
        }
        let mut state = self.state.lock();
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => state.cursor,
            Whence::End => self.size()?,
        };
        let pos = base.checked_add_signed(offset).ok_or(Errno::Inval)?;
        state.cursor = pos;
        Ok(pos)
    }

    async fn truncate(&self, size: u64) -> KernelResult<()> {
        let mut tree = self.tree.write();
        let node = tree.node_mut(self.ino)?;
        match &mut node.content {
            Content::File(data) => {
                data.resize(size as usize, 0);
                node.mtim = now_nanos();
                Ok(())
            }
            Content::Dir(_) => Err(Errno::Isdir),
            _ => Err(Errno::Badf),
        }
    }

    async fn readdir(&self, _refresh: bool) -> KernelResult<Vec<Dirent>> {
        let tree = self.tree.read();
        let entries = tree.dir(self.ino)?;
        entries
            .iter()
            .enumerate()
            .map(|(i, (name, &ino))| {
                let filetype = tree.node(ino)?.filetype();
                Ok(Dirent::new(i as u64 + 1, ino, name.clone(), filetype))
            })
            .collect()
    }

    async fn add_poll_sub(&self, sub: PollSub) {
        if !self.filetype.is_file() {
            sub.fail(Errno::Notsup);
            return;
        }
        // Regular files never block.
        let nbytes = match sub.event_type() {
            EventType::FdRead => {
                let cursor = self.state.lock().cursor;
                self.size().unwrap_or(0).saturating_sub(cursor)
            }
            _ => 0,
        };
        sub.resolve(nbytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(fs: &MemoryFs, path: &str, req: OpenRequest) -> KernelResult<Arc<dyn Descriptor>> {
        match fs.open(path, &req).await? {
            Resolution::Complete(desc) => Ok(desc),
            Resolution::NotDirectory { .. } => Err(Errno::Notdir),
        }
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let fs = MemoryFs::new();
        let req = OpenRequest::default().with_oflags(OpenFlags::CREAT);
        let file = open(&fs, "/test.txt", req).await.unwrap();
        assert_eq!(file.write(b"hello world").await.unwrap(), 11);
        assert_eq!(file.seek(0, Whence::Set).await.unwrap(), 0);
        assert_eq!(file.read(5).await.unwrap(), b"hello");
        assert_eq!(file.pread(5, 6).await.unwrap(), b"world");
        assert_eq!(file.filestat().await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_open_flags() {
        let fs = MemoryFs::new();
        fs.mkdir("/dir").await.unwrap();
        let req = OpenRequest::default().with_oflags(OpenFlags::CREAT | OpenFlags::EXCL);
        open(&fs, "/dir/f", req).await.unwrap();
        assert_eq!(open(&fs, "/dir/f", req).await.err(), Some(Errno::Exist));

        let dir_only = OpenRequest::default().with_oflags(OpenFlags::DIRECTORY);
        assert_eq!(open(&fs, "/dir/f", dir_only).await.err(), Some(Errno::Notdir));
        assert!(open(&fs, "/dir", dir_only).await.is_ok());
        assert_eq!(
            open(&fs, "/missing", OpenRequest::default()).await.err(),
            Some(Errno::Noent)
        );
    }

    #[tokio::test]
    async fn test_not_directory_offset() {
        let fs = MemoryFs::new();
        fs.mkdir("/a").await.unwrap();
        fs.symlink("/elsewhere", "/a/link").await.unwrap();
        match fs.open("/a/link/x/y", &OpenRequest::follow()).await.unwrap() {
            Resolution::NotDirectory { end } => assert_eq!(&"/a/link/x/y"[..end], "/a/link"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_final_symlink_ignores_oflags_when_following() {
        let fs = MemoryFs::new();
        fs.symlink("/target", "/link").await.unwrap();
        let req = OpenRequest::follow().with_oflags(OpenFlags::DIRECTORY);
        let link = open(&fs, "/link", req).await.unwrap();
        assert_eq!(link.read_str().await.unwrap(), "/target");

        let req = OpenRequest::nofollow().with_oflags(OpenFlags::DIRECTORY);
        assert_eq!(open(&fs, "/link", req).await.err(), Some(Errno::Notdir));
    }

    #[tokio::test]
    async fn test_unlink_and_rename() {
        let fs = MemoryFs::new();
        fs.mkdir("/d").await.unwrap();
        fs.symlink("x", "/d/l").await.unwrap();
        assert_eq!(fs.unlink("/d", true).await, Err(Errno::Notempty));
        assert_eq!(fs.unlink("/d", false).await, Err(Errno::Isdir));
        assert_eq!(fs.unlink("/d/l", true).await, Err(Errno::Notdir));

        fs.rename("/d/l", "/l").await.unwrap();
        fs.unlink("/d", true).await.unwrap();
        fs.unlink("/l", false).await.unwrap();
        assert_eq!(fs.unlink("/l", false).await, Err(Errno::Noent));
    }

    #[tokio::test]
    async fn test_readdir_and_refcount() {
        let fs = MemoryFs::new();
        fs.mkdir("/b").await.unwrap();
        fs.mknod("/a", DeviceId::new(1, 0)).await.unwrap();

        let root = open(&fs, "/", OpenRequest::default()).await.unwrap();
        let names: Vec<_> = root
            .readdir(true)
            .await
            .unwrap()
            .into_iter()
            .map(|d| (d.name, d.filetype))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), FileType::CharacterDevice),
                ("b".to_string(), FileType::Directory)
            ]
        );

        assert_eq!(fs.open_descriptors(), 1);
        root.duplicate();
        root.close().await.unwrap();
        assert_eq!(fs.open_descriptors(), 1);
        root.close().await.unwrap();
        assert_eq!(fs.open_descriptors(), 0);
        assert_eq!(root.close().await, Err(Errno::Badf));
    }
}
