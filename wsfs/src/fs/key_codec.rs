use super::errors::FsError;
use bytes::Bytes;

const PREFIX_INODE: u8 = 0x01;
const PREFIX_CHUNK: u8 = 0x02;
const PREFIX_SYSTEM: u8 = 0x07;

const SYSTEM_INODE_COUNTER_SUBTYPE: u8 = 0x01;
const SYSTEM_CHUNK_COUNTER_SUBTYPE: u8 = 0x02;

const U64_SIZE: usize = 8;
const KEY_RECORD_SIZE: usize = 1 + U64_SIZE;

/// Named record collections kept in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Inodes,
    Chunks,
}

impl Collection {
    fn prefix(self) -> u8 {
        match self {
            Self::Inodes => PREFIX_INODE,
            Self::Chunks => PREFIX_CHUNK,
        }
    }

    fn counter_subtype(self) -> u8 {
        match self {
            Self::Inodes => SYSTEM_INODE_COUNTER_SUBTYPE,
            Self::Chunks => SYSTEM_CHUNK_COUNTER_SUBTYPE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inodes => "inodes",
            Self::Chunks => "chunks",
        }
    }
}

pub struct KeyCodec;

impl KeyCodec {
    pub fn record_key(collection: Collection, id: u64) -> Bytes {
        let mut key = Vec::with_capacity(KEY_RECORD_SIZE);
        key.push(collection.prefix());
        key.extend_from_slice(&id.to_be_bytes());
        Bytes::from(key)
    }

    pub fn counter_key(collection: Collection) -> Bytes {
        Bytes::from(vec![PREFIX_SYSTEM, collection.counter_subtype()])
    }

    pub fn encode_counter(next_id: u64) -> Bytes {
        Bytes::copy_from_slice(&next_id.to_be_bytes())
    }

    pub fn decode_counter(data: &[u8]) -> Result<u64, FsError> {
        let bytes: [u8; U64_SIZE] = data.try_into().map_err(|_| FsError::InvalidData)?;
        Ok(u64::from_be_bytes(bytes))
    }
}
