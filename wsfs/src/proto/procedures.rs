//! One decode → engine call → encode pipeline per opcode. Every procedure
//! starts after the opcode byte, with the response id.

use super::codec::{MAX_FIELD_LEN, PacketReader};
use super::errors::{ProtoError, ProtoResult};
use super::protocol::{
    ATTR_BLOCK_SIZE, MAX_READ_SIZE, REPLY_HEADER_SIZE, ReplyKind, SETATTR_CRTIME, SETATTR_CTIME, SETATTR_END, SETATTR_GID,
    SETATTR_MODE, SETATTR_MTIME, SETATTR_SIZE, SETATTR_UID,
};
use super::responses;
use crate::fs::Wsfs;
use crate::fs::errors::FsError;
use crate::fs::inode::InodeId;
use crate::fs::types::{DirEntry, SetAttributes};
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Encodes `result`, or an error reply of the verb's kind.
fn reply<T>(
    kind: ReplyKind,
    response_id: u16,
    result: Result<T, FsError>,
    encode: impl FnOnce(u16, T) -> ProtoResult<Bytes>,
) -> ProtoResult<Bytes> {
    match result {
        Ok(value) => encode(response_id, value),
        Err(e) => {
            debug!("Request {} failed: {}", response_id, e);
            responses::error(kind, response_id, e.to_errno())
        }
    }
}

fn to_offset(offset: i64) -> Result<u64, FsError> {
    u64::try_from(offset).map_err(|_| FsError::InvalidArgument)
}

/// Replies to `getxattr`/`listxattr`: a size query when `size` is 0,
/// otherwise the data if it fits the caller's buffer. Values that cannot
/// travel in one wire buffer fail at the size query too.
fn xattr_reply(response_id: u16, value: &[u8], size: u32) -> ProtoResult<Bytes> {
    if value.len() <= MAX_FIELD_LEN && size == 0 {
        responses::xattr_size(response_id, value.len() as u32)
    } else if value.len() <= MAX_FIELD_LEN && value.len() <= size as usize {
        responses::xattr_data(response_id, value)
    } else {
        responses::error(
            ReplyKind::Xattr,
            response_id,
            FsError::OutOfRange.to_errno(),
        )
    }
}

/// Per-entry bytes of a directory listing reply, on top of the name.
const READDIR_ENTRY_SIZE: usize = 8 + 4 + 2;
const READDIRPLUS_ENTRY_SIZE: usize = READDIR_ENTRY_SIZE + 8 + ATTR_BLOCK_SIZE;

/// Number of leading `entries` whose reply stays within `max_reply_size`
/// bytes and the `u16` entry count.
fn entries_within(entries: &[DirEntry], entry_size: usize, max_reply_size: usize) -> usize {
    let mut used = REPLY_HEADER_SIZE + 2;
    let mut count = 0;
    for entry in entries.iter().take(u16::MAX as usize) {
        used += entry_size + entry.name.len();
        if used > max_reply_size {
            break;
        }
        count += 1;
    }
    count
}

/// The engine takes `u32` counts; larger ones are split.
async fn forget_all(fs: &Wsfs, ino: InodeId, mut nlookup: u64) -> Result<(), FsError> {
    while nlookup > u32::MAX as u64 {
        fs.forget(ino, u32::MAX).await?;
        nlookup -= u32::MAX as u64;
    }
    fs.forget(ino, nlookup as u32).await
}

fn decode_setattr(request: &mut PacketReader) -> ProtoResult<SetAttributes> {
    let mut attrs = SetAttributes::default();
    loop {
        match request.u8()? {
            SETATTR_END => return Ok(attrs),
            SETATTR_MODE => attrs.mode = Some(request.u32()?),
            SETATTR_UID => attrs.uid = Some(request.u32()?),
            SETATTR_GID => attrs.gid = Some(request.u32()?),
            SETATTR_SIZE => attrs.size = Some(request.u64()?),
            SETATTR_MTIME => attrs.mtime = Some(request.u64()?),
            SETATTR_CTIME => attrs.ctime = Some(request.u64()?),
            SETATTR_CRTIME => attrs.crtime = Some(request.u64()?),
            tag => return Err(ProtoError::UnknownSetattrTag(tag)),
        }
    }
}

pub async fn init(_fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    info!("Driver session initialized");
    responses::empty(response_id)
}

pub async fn destroy(_fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    info!("Driver session destroyed");
    responses::empty(response_id)
}

pub async fn lookup(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let parent = request.u64()?;
    let name = request.string()?;

    let result = fs.lookup(parent, &name).await;
    reply(ReplyKind::Entry, response_id, result, |id, entry| {
        responses::entry(id, &entry)
    })
}

pub async fn forget(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let nlookup = request.u64()?;

    let result = forget_all(fs, ino, nlookup).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn batch_forget(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let count = request.u32()?;

    let mut items = Vec::new();
    for _ in 0..count {
        let ino = request.u64()?;
        let nlookup = request.u64()?;
        items.push((ino, nlookup));
    }

    let mut first_error = None;
    for (ino, nlookup) in items {
        if let Err(e) = forget_all(fs, ino, nlookup).await {
            warn!("batch_forget: ino {} failed: {}", ino, e);
            first_error.get_or_insert(e);
        }
    }

    let result = first_error.map_or(Ok(()), Err);
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn getattr(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;

    let result = fs.getattr(ino).await;
    reply(ReplyKind::Attr, response_id, result, |id, attr| {
        responses::attr(id, &attr)
    })
}

pub async fn setattr(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let attrs = decode_setattr(request)?;

    let result = fs.setattr(ino, &attrs).await;
    reply(ReplyKind::Attr, response_id, result, |id, attr| {
        responses::attr(id, &attr)
    })
}

pub async fn readlink(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;

    let result = fs.readlink(ino).await;
    reply(ReplyKind::Data, response_id, result, |id, target| {
        responses::data(id, target.as_bytes())
    })
}

pub async fn mknod(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let uid = request.u32()?;
    let gid = request.u32()?;
    let parent = request.u64()?;
    let name = request.string()?;
    let mode = request.u32()?;
    let umask = request.u32()?;
    let rdev = request.u32()?;

    let result = fs.mknod(uid, gid, parent, &name, mode, umask, rdev).await;
    reply(ReplyKind::Entry, response_id, result, |id, entry| {
        responses::entry(id, &entry)
    })
}

pub async fn mkdir(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let uid = request.u32()?;
    let gid = request.u32()?;
    let parent = request.u64()?;
    let name = request.string()?;
    let mode = request.u32()?;

    let result = fs.mkdir(uid, gid, parent, &name, mode, 0).await;
    reply(ReplyKind::Entry, response_id, result, |id, entry| {
        responses::entry(id, &entry)
    })
}

pub async fn unlink(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let parent = request.u64()?;
    let name = request.string()?;

    let result = fs.unlink(parent, &name).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn rmdir(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let parent = request.u64()?;
    let name = request.string()?;

    let result = fs.rmdir(parent, &name).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn symlink(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let uid = request.u32()?;
    let gid = request.u32()?;
    let parent = request.u64()?;
    let name = request.string()?;
    let target = request.string()?;

    let result = fs.symlink(uid, gid, parent, &name, &target).await;
    reply(ReplyKind::Entry, response_id, result, |id, entry| {
        responses::entry(id, &entry)
    })
}

pub async fn rename(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let parent = request.u64()?;
    let name = request.string()?;
    let new_parent = request.u64()?;
    let new_name = request.string()?;
    let flags = request.u32()?;

    let result = fs.rename(parent, &name, new_parent, &new_name, flags).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn link(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let new_parent = request.u64()?;
    let new_name = request.string()?;

    let result = fs.link(ino, new_parent, &new_name).await;
    reply(ReplyKind::Entry, response_id, result, |id, entry| {
        responses::entry(id, &entry)
    })
}

pub async fn open(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let flags = request.i32()?;

    let result = fs.open(ino, flags).await;
    reply(ReplyKind::Open, response_id, result, |id, open| {
        responses::open(id, &open)
    })
}

pub async fn read(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let fh = request.u64()?;
    let offset = request.i64()?;
    let size = request.u32()?;
    let _flags = request.i32()?;

    let result = match to_offset(offset) {
        Ok(offset) => fs.read(ino, fh, offset, size.min(MAX_READ_SIZE)).await,
        Err(e) => Err(e),
    };
    reply(ReplyKind::Data, response_id, result, |id, data| {
        responses::data(id, &data)
    })
}

pub async fn write(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let fh = request.u64()?;
    let offset = request.i64()?;
    let data = request.buffer()?;
    let _write_flags = request.u32()?;
    let _flags = request.i32()?;

    let result = match to_offset(offset) {
        Ok(offset) => fs.write(ino, fh, offset, &data).await,
        Err(e) => Err(e),
    };
    reply(ReplyKind::Write, response_id, result, responses::write)
}

pub async fn flush(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let fh = request.u64()?;

    let result = fs.flush(ino, fh).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn release(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let fh = request.u64()?;
    let flags = request.i32()?;

    let result = fs.release(ino, fh, flags).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

/// Shared by `fsync` and `fsyncdir`.
pub async fn fsync(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let fh = request.u64()?;
    let datasync = request.u8()? != 0;

    let result = fs.fsync(ino, fh, datasync).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn opendir(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let flags = request.i32()?;

    let result = fs.opendir(ino, flags).await;
    reply(ReplyKind::Open, response_id, result, |id, open| {
        responses::open(id, &open)
    })
}

pub async fn readdir(
    fs: &Wsfs,
    request: &mut PacketReader,
    max_reply_size: usize,
) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let fh = request.u64()?;
    let offset = request.i64()?;

    let result = to_offset(offset)
        .and_then(|offset| fs.readdir(ino, fh, offset))
        .map(|mut entries| {
            entries.truncate(entries_within(&entries, READDIR_ENTRY_SIZE, max_reply_size));
            entries
        });
    reply(ReplyKind::Readdir, response_id, result, |id, entries| {
        responses::readdir(id, &entries)
    })
}

/// Every entry handed back takes a lookup reference, so the listing is
/// sized to the reply before the engine is asked for it.
pub async fn readdirplus(
    fs: &Wsfs,
    request: &mut PacketReader,
    max_reply_size: usize,
) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let fh = request.u64()?;
    let offset = request.i64()?;

    let result = match to_offset(offset).and_then(|offset| {
        let listing = fs.readdir(ino, fh, offset)?;
        let limit = entries_within(&listing, READDIRPLUS_ENTRY_SIZE, max_reply_size);
        Ok((offset, limit))
    }) {
        Ok((offset, limit)) => fs.readdirplus(ino, fh, offset, limit).await,
        Err(e) => Err(e),
    };
    reply(ReplyKind::Readdirplus, response_id, result, |id, entries| {
        responses::readdirplus(id, &entries)
    })
}

pub async fn releasedir(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let fh = request.u64()?;
    let flags = request.i32()?;

    let result = fs.releasedir(ino, fh, flags);
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn statfs(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;

    let result = fs.statfs().await;
    reply(ReplyKind::Statfs, response_id, result, |id, stats| {
        responses::statfs(id, &stats)
    })
}

pub async fn setxattr(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let name = request.string()?;
    let value = request.buffer()?;
    let flags = request.i32()?;
    let _position = request.u32()?;

    let result = fs.setxattr(ino, &name, &value, flags).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn getxattr(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let name = request.string()?;
    let size = request.u32()?;

    let result = fs.getxattr(ino, &name).await;
    reply(ReplyKind::Xattr, response_id, result, |id, value| {
        xattr_reply(id, &value, size)
    })
}

pub async fn listxattr(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let size = request.u32()?;

    let result = fs.listxattr(ino).await;
    reply(ReplyKind::Xattr, response_id, result, |id, names| {
        let mut list = Vec::new();
        for name in names {
            list.extend_from_slice(name.as_bytes());
            list.push(0);
        }
        xattr_reply(id, &list, size)
    })
}

pub async fn removexattr(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let name = request.string()?;

    let result = fs.removexattr(ino, &name).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn access(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let ino = request.u64()?;
    let mask = request.u32()?;

    let result = fs.access(ino, mask).await;
    reply(ReplyKind::Empty, response_id, result, |id, ()| {
        responses::empty(id)
    })
}

pub async fn create(fs: &Wsfs, request: &mut PacketReader) -> ProtoResult<Bytes> {
    let response_id = request.u16()?;
    let uid = request.u32()?;
    let gid = request.u32()?;
    let parent = request.u64()?;
    let name = request.string()?;
    let mode = request.u32()?;
    let umask = request.u32()?;
    let flags = request.i32()?;

    let result = fs.create(uid, gid, parent, &name, mode, umask, flags).await;
    reply(ReplyKind::Create, response_id, result, |id, created| {
        responses::create(id, &created)
    })
}
