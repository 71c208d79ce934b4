//! File metadata types.
//!
//! These mirror the WASI `filestat`, `fdstat` and `dirent` records so the
//! syscall layer can copy them into guest memory field by field.

use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::flags::{FdFlags, Rights};

/// Nanoseconds since the Unix epoch.
pub type Timestamp = u64;

/// Opaque directory cookie; the position just past an entry.
pub type Dircookie = u64;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    /// Type could not be determined.
    #[default]
    Unknown = 0,
    /// Block device.
    BlockDevice = 1,
    /// Character device (terminals, pipes, event sources).
    CharacterDevice = 2,
    /// Directory.
    Directory = 3,
    /// Regular file.
    RegularFile = 4,
    /// Datagram socket.
    SocketDgram = 5,
    /// Stream socket.
    SocketStream = 6,
    /// Symbolic link.
    SymbolicLink = 7,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::RegularFile)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::SymbolicLink)
    }
}

/// File attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Filestat {
    /// Device ID of the filesystem holding the file.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// File type.
    pub filetype: FileType,
    /// Number of hard links.
    pub nlink: u64,
    /// Size in bytes (target length for symlinks).
    pub size: u64,
    /// Last access time.
    pub atim: Timestamp,
    /// Last modification time.
    pub mtim: Timestamp,
    /// Last status change time.
    pub ctim: Timestamp,
}

impl Filestat {
    /// Attributes of an anonymous object of the given type, all times zero.
    pub fn of_type(filetype: FileType) -> Self {
        Self {
            filetype,
            ..Default::default()
        }
    }
}

/// Descriptor attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fdstat {
    /// Type of the underlying object.
    pub filetype: FileType,
    /// Descriptor flags.
    pub flags: FdFlags,
    /// Rights that apply to this descriptor.
    pub rights_base: Rights,
    /// Rights handed to descriptors opened through this one.
    pub rights_inheriting: Rights,
}

impl Fdstat {
    /// Create an fdstat with the given type and every right granted.
    pub fn new(filetype: FileType) -> Self {
        Self {
            filetype,
            flags: FdFlags::empty(),
            rights_base: Rights::all(),
            rights_inheriting: Rights::all(),
        }
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirent {
    /// Cookie of the next entry.
    pub next: Dircookie,
    /// Inode number of the entry.
    pub ino: u64,
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub filetype: FileType,
}

impl Dirent {
    /// Create a new directory entry.
    pub fn new(next: Dircookie, ino: u64, name: impl Into<String>, filetype: FileType) -> Self {
        Self {
            next,
            ino,
            name: name.into(),
            filetype,
        }
    }
}

/// Reference point for a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
pub enum Whence {
    /// Seek relative to the start of the file.
    Set = 0,
    /// Seek relative to the current position.
    Cur = 1,
    /// Seek relative to the end of the file.
    End = 2,
}
