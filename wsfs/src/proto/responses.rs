use super::codec::PacketWriter;
use super::errors::ProtoResult;
use super::protocol::{
    AttrBlock, ReplyHeader, ReplyKind, STATUS_SUCCESS, StatfsBlock, XATTR_REPLY_DATA,
    XATTR_REPLY_SIZE,
};
use crate::fs::types::{CreateReply, DirEntry, Entry, FileAttributes, OpenReply, StatFs};
use bytes::Bytes;

fn success(kind: ReplyKind, response_id: u16) -> ProtoResult<PacketWriter> {
    let mut packet = PacketWriter::new();
    packet.put_deku(&ReplyHeader::new(kind, response_id, STATUS_SUCCESS))?;
    Ok(packet)
}

fn put_entry(packet: &mut PacketWriter, entry: &Entry) -> ProtoResult<()> {
    packet.u64(entry.generation)?;
    packet.put_deku(&AttrBlock::from(&entry.attr))
}

/// Failure reply: the header alone with a positive errno as status.
pub fn error(kind: ReplyKind, response_id: u16, errno: i32) -> ProtoResult<Bytes> {
    let mut packet = PacketWriter::with_capacity(9);
    packet.put_deku(&ReplyHeader::new(kind, response_id, errno))?;
    packet.finalize()
}

pub fn empty(response_id: u16) -> ProtoResult<Bytes> {
    success(ReplyKind::Empty, response_id)?.finalize()
}

pub fn attr(response_id: u16, attr: &FileAttributes) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Attr, response_id)?;
    packet.put_deku(&AttrBlock::from(attr))?;
    packet.finalize()
}

pub fn entry(response_id: u16, entry: &Entry) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Entry, response_id)?;
    put_entry(&mut packet, entry)?;
    packet.finalize()
}

pub fn data(response_id: u16, data: &[u8]) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Data, response_id)?;
    packet.buffer(data)?;
    packet.finalize()
}

pub fn open(response_id: u16, open: &OpenReply) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Open, response_id)?;
    packet.u64(open.handle)?;
    packet.u32(open.flags)?;
    packet.finalize()
}

pub fn write(response_id: u16, written: u32) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Write, response_id)?;
    packet.u32(written)?;
    packet.finalize()
}

/// At most `u16::MAX` entries fit one reply; the driver continues from the
/// next offset.
pub fn readdir(response_id: u16, entries: &[DirEntry]) -> ProtoResult<Bytes> {
    let entries = &entries[..entries.len().min(u16::MAX as usize)];
    let mut packet = success(ReplyKind::Readdir, response_id)?;
    packet.u16(entries.len() as u16)?;
    for dir_entry in entries {
        packet.u64(dir_entry.ino)?;
        packet.u32(dir_entry.kind)?;
        packet.string(&dir_entry.name)?;
    }
    packet.finalize()
}

pub fn readdirplus(response_id: u16, entries: &[(DirEntry, Entry)]) -> ProtoResult<Bytes> {
    let entries = &entries[..entries.len().min(u16::MAX as usize)];
    let mut packet = success(ReplyKind::Readdirplus, response_id)?;
    packet.u16(entries.len() as u16)?;
    for (dir_entry, entry) in entries {
        packet.u64(dir_entry.ino)?;
        packet.u32(dir_entry.kind)?;
        packet.string(&dir_entry.name)?;
        put_entry(&mut packet, entry)?;
    }
    packet.finalize()
}

pub fn statfs(response_id: u16, stats: &StatFs) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Statfs, response_id)?;
    packet.put_deku(&StatfsBlock::from(stats))?;
    packet.finalize()
}

/// Answer to a size query.
pub fn xattr_size(response_id: u16, size: u32) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Xattr, response_id)?;
    packet.u8(XATTR_REPLY_SIZE)?;
    packet.u32(size)?;
    packet.finalize()
}

pub fn xattr_data(response_id: u16, data: &[u8]) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Xattr, response_id)?;
    packet.u8(XATTR_REPLY_DATA)?;
    packet.buffer(data)?;
    packet.finalize()
}

pub fn create(response_id: u16, reply: &CreateReply) -> ProtoResult<Bytes> {
    let mut packet = success(ReplyKind::Create, response_id)?;
    put_entry(&mut packet, &reply.entry)?;
    packet.u64(reply.open.handle)?;
    packet.u32(reply.open.flags)?;
    packet.finalize()
}
