use super::inode::{Inode, InodeId, InodeKind};

/// Attributes reported for a node. Times are milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub ino: InodeId,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub crtime: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

/// Attributes paired with the generation that disambiguates a reused id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub generation: u64,
    pub attr: FileAttributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenReply {
    pub handle: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReply {
    pub entry: Entry,
    pub open: OpenReply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeId,
    pub name: String,
    /// `S_IF*` type bits of the entry.
    pub kind: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Fields to change in `setattr`. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<u64>,
    pub ctime: Option<u64>,
    pub crtime: Option<u64>,
}

const STAT_BLOCK_SIZE: u64 = 512;

pub struct InodeWithId<'a> {
    pub inode: &'a Inode,
    pub id: InodeId,
    pub block_size: u32,
}

impl From<InodeWithId<'_>> for FileAttributes {
    fn from(inode_with_id: InodeWithId<'_>) -> Self {
        let inode = inode_with_id.inode;
        let mtime = inode.mtime();

        let (size, blocks, nlink, rdev, blksize) = match &inode.kind {
            InodeKind::File(file) => (
                file.size(),
                (file.allocated_chunks() * file.chunk_size as u64).div_ceil(STAT_BLOCK_SIZE),
                file.hard_links,
                0,
                file.chunk_size,
            ),
            InodeKind::Directory(_) => (0, 0, 1, 0, inode_with_id.block_size),
            InodeKind::Symlink(link) => {
                (link.target.len() as u64, 0, 1, 0, inode_with_id.block_size)
            }
            InodeKind::Special(special) => (0, 0, 1, special.rdev, inode_with_id.block_size),
        };

        FileAttributes {
            ino: inode_with_id.id,
            size,
            blocks,
            atime: mtime,
            mtime,
            ctime: inode.ctime,
            crtime: inode.crtime,
            mode: inode.mode,
            nlink,
            uid: inode.uid,
            gid: inode.gid,
            rdev,
            blksize,
        }
    }
}

impl From<InodeWithId<'_>> for Entry {
    fn from(inode_with_id: InodeWithId<'_>) -> Self {
        Entry {
            generation: inode_with_id.inode.generation,
            attr: inode_with_id.into(),
        }
    }
}
