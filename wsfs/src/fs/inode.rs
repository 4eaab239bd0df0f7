use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub type InodeId = u64;
pub type ChunkId = u64;

pub const PLACEHOLDER_INODE_ID: InodeId = 0;
pub const ROOT_INODE_ID: InodeId = 1;
/// Generation carried by the reserved inode 0.
pub const PLACEHOLDER_GENERATION: u64 = u64::MAX;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialInode {
    pub rdev: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInode {
    pub hard_links: u32,
    pub open_handles: u32,
    pub chunk_size: u32,
    /// Unused bytes at the end of the last chunk.
    pub trim: u32,
    /// `None` marks a sparse chunk that has never been written.
    pub chunks: Vec<Option<ChunkId>>,
    pub mtime: u64,
}

impl FileInode {
    pub fn new(chunk_size: u32, now: u64) -> Self {
        Self {
            hard_links: 1,
            open_handles: 0,
            chunk_size,
            trim: 0,
            chunks: Vec::new(),
            mtime: now,
        }
    }

    pub fn size(&self) -> u64 {
        self.chunks.len() as u64 * self.chunk_size as u64 - self.trim as u64
    }

    pub fn allocated_chunks(&self) -> u64 {
        self.chunks.iter().filter(|c| c.is_some()).count() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInode {
    pub parent: InodeId,
    pub subdirs: HashMap<String, InodeId>,
    pub mtime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkInode {
    pub parent: InodeId,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    Special(SpecialInode),
    File(FileInode),
    Directory(DirectoryInode),
    Symlink(SymlinkInode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Outstanding references held by the driver.
    pub lookups: u64,
    pub generation: u64,
    pub deleted: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime: u64,
    pub crtime: u64,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub kind: InodeKind,
}

impl Inode {
    pub fn new(kind: InodeKind, mode: u32, uid: u32, gid: u32, now: u64, generation: u64) -> Self {
        Self {
            lookups: 0,
            generation,
            deleted: false,
            mode,
            uid,
            gid,
            ctime: now,
            crtime: now,
            xattrs: BTreeMap::new(),
            kind,
        }
    }

    /// The record stored under id 0. It is never a live node.
    pub fn placeholder() -> Self {
        let mut inode = Self::new(
            InodeKind::Special(SpecialInode { rdev: 0 }),
            0,
            0,
            0,
            0,
            PLACEHOLDER_GENERATION,
        );
        inode.deleted = true;
        inode
    }

    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, InodeKind::Directory(_))
    }

    pub fn mtime(&self) -> u64 {
        match &self.kind {
            InodeKind::File(f) => f.mtime,
            InodeKind::Directory(d) => d.mtime,
            InodeKind::Symlink(_) | InodeKind::Special(_) => self.ctime,
        }
    }

    /// True once nothing can reach the node any more and it may be purged.
    pub fn is_reclaimable(&self) -> bool {
        let handles = match &self.kind {
            InodeKind::File(f) => f.open_handles,
            _ => 0,
        };
        self.deleted && self.lookups == 0 && handles == 0
    }
}
