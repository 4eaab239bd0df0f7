use crate::fs::types::{FileAttributes, StatFs};
use deku::prelude::*;

/// Opcode carried by every reply and by out-of-band control messages.
pub const OPCODE_INTERNAL: u8 = 0;
/// Internal-channel subtype that marks a message as a reply.
pub const INTERNAL_REPLY: u8 = 1;

pub const STATUS_SUCCESS: i32 = 0;

// setattr field tags
pub const SETATTR_END: u8 = 0;
pub const SETATTR_MODE: u8 = 1;
pub const SETATTR_UID: u8 = 2;
pub const SETATTR_GID: u8 = 3;
pub const SETATTR_SIZE: u8 = 4;
pub const SETATTR_MTIME: u8 = 5;
pub const SETATTR_CTIME: u8 = 6;
pub const SETATTR_CRTIME: u8 = 7;

pub const XATTR_REPLY_SIZE: u8 = 0;
pub const XATTR_REPLY_DATA: u8 = 1;

/// Largest payload a single `read` returns; it has to fit one wire buffer.
pub const MAX_READ_SIZE: u32 = u16::MAX as u32;

/// Encoded sizes of the fixed blocks.
pub const REPLY_HEADER_SIZE: usize = 9;
pub const ATTR_BLOCK_SIZE: usize = 7 * 8 + 6 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Internal = 0,
    Init = 1,
    Destroy = 2,
    Lookup = 3,
    Forget = 4,
    BatchForget = 5,
    Getattr = 6,
    Setattr = 7,
    Readlink = 8,
    Mknod = 9,
    Mkdir = 10,
    Unlink = 11,
    Rmdir = 12,
    Symlink = 13,
    Rename = 14,
    Link = 15,
    Open = 16,
    Read = 17,
    Write = 18,
    Flush = 19,
    Release = 20,
    Fsync = 21,
    Opendir = 22,
    Readdir = 23,
    Readdirplus = 24,
    Releasedir = 25,
    Fsyncdir = 26,
    Statfs = 27,
    Setxattr = 28,
    Getxattr = 29,
    Listxattr = 30,
    Removexattr = 31,
    Access = 32,
    Create = 33,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Internal,
            1 => Self::Init,
            2 => Self::Destroy,
            3 => Self::Lookup,
            4 => Self::Forget,
            5 => Self::BatchForget,
            6 => Self::Getattr,
            7 => Self::Setattr,
            8 => Self::Readlink,
            9 => Self::Mknod,
            10 => Self::Mkdir,
            11 => Self::Unlink,
            12 => Self::Rmdir,
            13 => Self::Symlink,
            14 => Self::Rename,
            15 => Self::Link,
            16 => Self::Open,
            17 => Self::Read,
            18 => Self::Write,
            19 => Self::Flush,
            20 => Self::Release,
            21 => Self::Fsync,
            22 => Self::Opendir,
            23 => Self::Readdir,
            24 => Self::Readdirplus,
            25 => Self::Releasedir,
            26 => Self::Fsyncdir,
            27 => Self::Statfs,
            28 => Self::Setxattr,
            29 => Self::Getxattr,
            30 => Self::Listxattr,
            31 => Self::Removexattr,
            32 => Self::Access,
            33 => Self::Create,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyKind {
    Empty = 0,
    Attr = 1,
    Entry = 2,
    Data = 3,
    Open = 4,
    Write = 5,
    Readdir = 6,
    Statfs = 7,
    Xattr = 8,
    Create = 9,
    Readdirplus = 10,
}

/// `[opcode][reply][kind][responseId][status]` in front of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct ReplyHeader {
    pub opcode: u8,
    pub reply: u8,
    pub kind: u8,
    #[deku(endian = "big")]
    pub response_id: u16,
    #[deku(endian = "big")]
    pub status: i32,
}

impl ReplyHeader {
    pub fn new(kind: ReplyKind, response_id: u16, status: i32) -> Self {
        Self {
            opcode: OPCODE_INTERNAL,
            reply: INTERNAL_REPLY,
            kind: kind as u8,
            response_id,
            status,
        }
    }
}

/// Node attributes as they travel on the wire. Times are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct AttrBlock {
    #[deku(endian = "big")]
    pub ino: u64,
    #[deku(endian = "big")]
    pub size: u64,
    #[deku(endian = "big")]
    pub blocks: u64,
    #[deku(endian = "big")]
    pub atime: u64,
    #[deku(endian = "big")]
    pub mtime: u64,
    #[deku(endian = "big")]
    pub ctime: u64,
    #[deku(endian = "big")]
    pub crtime: u64,
    #[deku(endian = "big")]
    pub mode: u32,
    #[deku(endian = "big")]
    pub nlink: u32,
    #[deku(endian = "big")]
    pub uid: u32,
    #[deku(endian = "big")]
    pub gid: u32,
    #[deku(endian = "big")]
    pub rdev: u32,
    #[deku(endian = "big")]
    pub blksize: u32,
}

impl From<&FileAttributes> for AttrBlock {
    fn from(attr: &FileAttributes) -> Self {
        Self {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct StatfsBlock {
    #[deku(endian = "big")]
    pub blocks: u64,
    #[deku(endian = "big")]
    pub bfree: u64,
    #[deku(endian = "big")]
    pub bavail: u64,
    #[deku(endian = "big")]
    pub files: u64,
    #[deku(endian = "big")]
    pub ffree: u64,
    #[deku(endian = "big")]
    pub bsize: u32,
    #[deku(endian = "big")]
    pub namelen: u32,
    #[deku(endian = "big")]
    pub frsize: u32,
}

impl From<&StatFs> for StatfsBlock {
    fn from(stats: &StatFs) -> Self {
        Self {
            blocks: stats.blocks,
            bfree: stats.bfree,
            bavail: stats.bavail,
            files: stats.files,
            ffree: stats.ffree,
            bsize: stats.bsize,
            namelen: stats.namelen,
            frsize: stats.frsize,
        }
    }
}
