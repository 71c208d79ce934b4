//! Per-process descriptor table.
//!
//! Maps small integers to shared open descriptors. New descriptors take the
//! lowest unoccupied slot, whether it was freed or never handed out.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use wasmux_types::{Errno, Fd, FdFlags};

use crate::vfs::Descriptor;

/// A descriptor in a table slot, with slot-level flags.
#[derive(Clone)]
pub struct DescriptorEntry {
    /// The open descriptor, possibly shared with other slots and processes.
    pub desc: Arc<dyn Descriptor>,
    /// Slot flags. Only [`FdFlags::CLOEXEC`] is interpreted by the table.
    pub fd_flags: FdFlags,
}

impl DescriptorEntry {
    pub fn new(desc: Arc<dyn Descriptor>) -> Self {
        Self {
            desc,
            fd_flags: FdFlags::empty(),
        }
    }

    pub fn with_flags(desc: Arc<dyn Descriptor>, fd_flags: FdFlags) -> Self {
        Self { desc, fd_flags }
    }

    /// Whether a child process must not inherit this slot.
    pub fn is_cloexec(&self) -> bool {
        self.fd_flags.contains(FdFlags::CLOEXEC)
    }
}

impl std::fmt::Debug for DescriptorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorEntry")
            .field("path", &self.desc.path())
            .field("fd_flags", &self.fd_flags)
            .finish()
    }
}

/// Per-process descriptor table.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: BTreeMap<Fd, DescriptorEntry>,
}

impl FdTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with `descs` in slots 0, 1, 2, ...
    pub fn from_entries(descs: impl IntoIterator<Item = Arc<dyn Descriptor>>) -> Self {
        let mut table = Self::new();
        for desc in descs {
            table.add_file(desc);
        }
        table
    }

    /// Store `desc` in the lowest free slot.
    pub fn add_file(&mut self, desc: Arc<dyn Descriptor>) -> Fd {
        self.add_file_with_flags(desc, FdFlags::empty())
    }

    pub fn add_file_with_flags(&mut self, desc: Arc<dyn Descriptor>, fd_flags: FdFlags) -> Fd {
        let fd = self.lowest_free();
        self.entries
            .insert(fd, DescriptorEntry::with_flags(desc, fd_flags));
        fd
    }

    /// Vacate a slot and hand back its entry. The descriptor is not closed.
    ///
    /// # Panics
    ///
    /// If the slot is empty.
    pub fn free_fd(&mut self, fd: Fd) -> DescriptorEntry {
        let Some(entry) = self.entries.remove(&fd) else {
            panic!("descriptor {fd} not present in descriptor table");
        };
        entry
    }

    /// Put a new entry in an occupied slot and return the old one.
    ///
    /// # Panics
    ///
    /// If the slot is empty.
    pub fn replace_fd(&mut self, fd: Fd, entry: DescriptorEntry) -> DescriptorEntry {
        match self.entries.get_mut(&fd) {
            Some(slot) => std::mem::replace(slot, entry),
            None => panic!("descriptor {fd} not present in descriptor table"),
        }
    }

    /// Store an entry at a chosen slot, returning whatever it displaced.
    ///
    /// Unoccupied slots below `fd` stay available to [`FdTable::add_file`].
    pub fn set_fd(&mut self, fd: Fd, entry: DescriptorEntry) -> Option<DescriptorEntry> {
        self.entries.insert(fd, entry)
    }

    /// Make `dst` share `src`'s descriptor, as `dup2` does.
    ///
    /// The new slot starts without flags. Returns the displaced entry, which
    /// the caller is responsible for closing.
    ///
    /// # Panics
    ///
    /// If `src` is empty.
    pub fn duplicate_fd(&mut self, src: Fd, dst: Fd) -> Option<DescriptorEntry> {
        let desc = match self.entries.get(&src) {
            Some(entry) => Arc::clone(&entry.desc),
            None => panic!("descriptor {src} not present in descriptor table"),
        };
        if src == dst {
            return None;
        }
        desc.duplicate();
        self.set_fd(dst, DescriptorEntry::new(desc))
    }

    /// First slot not in use: the first gap in the occupied keys, or the
    /// slot after the last of a contiguous run from 0.
    fn lowest_free(&self) -> Fd {
        let mut slot: Fd = 0;
        for &used in self.entries.keys() {
            if used != slot {
                break;
            }
            // Every slot up to `Fd::MAX` occupied cannot fit in memory.
            slot = slot.saturating_add(1);
        }
        slot
    }

    pub fn get(&self, fd: Fd) -> Option<&DescriptorEntry> {
        self.entries.get(&fd)
    }

    pub fn get_desc(&self, fd: Fd) -> Option<Arc<dyn Descriptor>> {
        self.entries.get(&fd).map(|entry| Arc::clone(&entry.desc))
    }

    /// Replace a slot's flags. `Badf` if the slot is empty.
    pub fn set_fd_flags(&mut self, fd: Fd, fd_flags: FdFlags) -> Result<(), Errno> {
        let entry = self.entries.get_mut(&fd).ok_or(Errno::Badf)?;
        entry.fd_flags = fd_flags;
        Ok(())
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Fd, &DescriptorEntry)> {
        self.entries.iter().map(|(fd, entry)| (*fd, entry))
    }

    /// The table a child process inherits.
    ///
    /// Close-on-exec slots are left out and become free in the child. Every
    /// inherited descriptor is told it gained a sharer, so closing it in one
    /// table leaves the other working.
    pub fn clone_for_child(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_cloexec())
            .map(|(fd, entry)| {
                entry.desc.duplicate();
                (*fd, entry.clone())
            })
            .collect();
        Self { entries }
    }

    /// Close every descriptor, consuming the table.
    ///
    /// A failing close does not stop the rest; failures are returned.
    pub async fn tear_down(self) -> Vec<(Fd, Errno)> {
        let mut failures = Vec::new();
        for (fd, entry) in self.entries {
            if let Err(err) = entry.desc.close().await {
                warn!(fd, ?err, "close failed during teardown");
                failures.push((fd, err));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{MemoryFs, MountOptions, MountTable, OpenRequest};
    use wasmux_types::OpenFlags;

    // Test-only equality so `assert_eq!` can compare `Option<DescriptorEntry>`.
    impl PartialEq for DescriptorEntry {
        fn eq(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.desc, &other.desc) && self.fd_flags == other.fd_flags
        }
    }

    async fn files(n: usize) -> (MemoryFs, Vec<Arc<dyn Descriptor>>) {
        let fs = MemoryFs::new();
        let table = MountTable::new(40);
        table
            .mount_root(Arc::new(fs.clone()), MountOptions::new())
            .await
            .unwrap();
        let mut descs = Vec::new();
        for i in 0..n {
            let req = OpenRequest::follow().with_oflags(OpenFlags::CREAT);
            descs.push(table.open(&format!("/f{i}"), &req).await.unwrap());
        }
        (fs, descs)
    }

    #[tokio::test]
    async fn test_lowest_free_slot_reused() {
        let (_fs, descs) = files(5).await;
        let mut table = FdTable::from_entries(descs.iter().take(3).cloned());
        table.set_fd(4, DescriptorEntry::new(descs[3].clone()));

        // Slot 3 was skipped by set_fd, so it is the first free one.
        assert_eq!(table.add_file(descs[4].clone()), 3);
        table.free_fd(3);
        assert_eq!(table.add_file(descs[4].clone()), 3);
        assert_eq!(table.add_file(descs[4].clone()), 5);
    }

    #[tokio::test]
    async fn test_set_fd_far_slot() {
        let (_fs, descs) = files(3).await;
        let mut table = FdTable::new();
        assert!(table.set_fd(Fd::MAX, DescriptorEntry::new(descs[0].clone())).is_none());
        assert_eq!(table.duplicate_fd(Fd::MAX, 1 << 30), None);

        assert_eq!(table.add_file(descs[1].clone()), 0);
        assert_eq!(table.add_file(descs[2].clone()), 1);
        assert_eq!(table.len(), 4);
        assert_eq!(table.get(Fd::MAX).unwrap().desc.path(), "/f0");
        assert_eq!(table.get(1 << 30).unwrap().desc.path(), "/f0");
    }

    #[tokio::test]
    async fn test_free_then_add() {
        let (_fs, descs) = files(3).await;
        let mut table = FdTable::from_entries(descs.clone());
        let entry = table.free_fd(1);
        assert_eq!(entry.desc.path(), "/f1");
        assert!(!table.contains(1));
        assert_eq!(table.add_file(descs[0].clone()), 1);
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    #[should_panic(expected = "not present")]
    async fn test_free_missing_panics() {
        let mut table = FdTable::new();
        table.free_fd(7);
    }

    #[tokio::test]
    #[should_panic(expected = "not present")]
    async fn test_replace_missing_panics() {
        let (_fs, descs) = files(1).await;
        let mut table = FdTable::new();
        table.replace_fd(0, DescriptorEntry::new(descs[0].clone()));
    }

    #[tokio::test]
    async fn test_duplicate_fd_shares_descriptor() {
        let (fs, descs) = files(2).await;
        let mut table = FdTable::from_entries(descs);
        table.set_fd_flags(0, FdFlags::CLOEXEC).unwrap();

        let displaced = table.duplicate_fd(0, 1).expect("slot 1 was occupied");
        assert_eq!(displaced.desc.path(), "/f1");
        displaced.desc.close().await.unwrap();

        let dup = table.get(1).unwrap();
        assert_eq!(dup.desc.path(), "/f0");
        assert!(!dup.is_cloexec());

        table.free_fd(1).desc.close().await.unwrap();
        assert_eq!(fs.open_descriptors(), 1);
        assert!(table.tear_down().await.is_empty());
        assert_eq!(fs.open_descriptors(), 0);
    }

    #[tokio::test]
    async fn test_clone_for_child() {
        let (fs, descs) = files(3).await;
        let mut parent = FdTable::from_entries(descs);
        parent.set_fd_flags(2, FdFlags::CLOEXEC).unwrap();

        let mut child = parent.clone_for_child();
        assert!(child.contains(0) && child.contains(1));
        assert!(!child.contains(2));
        let shared = parent.get_desc(0).unwrap();
        shared.duplicate();
        assert_eq!(child.add_file(shared), 2);

        child.free_fd(0).desc.close().await.unwrap();
        assert!(parent.get_desc(0).unwrap().read(1).await.is_ok());

        let failures = child.tear_down().await;
        assert!(failures.is_empty());
        assert_eq!(fs.open_descriptors(), 3);
        assert!(parent.tear_down().await.is_empty());
        assert_eq!(fs.open_descriptors(), 0);
    }

    #[tokio::test]
    async fn test_tear_down_reports_failures() {
        let (_fs, descs) = files(2).await;
        let table = FdTable::from_entries(descs.clone());
        descs[0].close().await.unwrap();

        let failures = table.tear_down().await;
        assert_eq!(failures, vec![(0, Errno::Badf)]);
    }
}
