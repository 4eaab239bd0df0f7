use crate::db::{KvStore, Transaction};
use crate::fs::errors::FsError;
use crate::fs::inode::{Inode, InodeId};
use crate::fs::key_codec::{Collection, KeyCodec};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// First id handed out on a fresh store. 0 is the placeholder and 1 the root.
pub const FIRST_ALLOCATED_INODE_ID: InodeId = 2;

#[derive(Clone)]
pub struct InodeStore {
    db: Arc<dyn KvStore>,
    next_id: Arc<AtomicU64>,
}

impl InodeStore {
    pub fn new(db: Arc<dyn KvStore>, initial_next_id: u64) -> Self {
        Self {
            db,
            next_id: Arc::new(AtomicU64::new(initial_next_id)),
        }
    }

    pub fn allocate(&self) -> InodeId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub async fn get(&self, id: InodeId) -> Result<Option<Inode>, FsError> {
        let key = KeyCodec::record_key(Collection::Inodes, id);

        let Some(data) = self.db.get(&key).await.map_err(|e| {
            tracing::error!("InodeStore::get({}): store get failed: {}", id, e);
            FsError::StoreFailure
        })?
        else {
            return Ok(None);
        };

        bincode::deserialize(&data).map(Some).map_err(|e| {
            tracing::warn!(
                "InodeStore::get({}): failed to deserialize inode data (len={}): {:?}",
                id,
                data.len(),
                e
            );
            FsError::InvalidData
        })
    }

    pub fn save(&self, txn: &mut Transaction, id: InodeId, inode: &Inode) -> Result<(), FsError> {
        let key = KeyCodec::record_key(Collection::Inodes, id);
        let data = bincode::serialize(inode).map_err(|e| {
            tracing::error!("InodeStore::save({}): failed to serialize: {:?}", id, e);
            FsError::InvalidData
        })?;
        txn.put_bytes(&key, Bytes::from(data));
        Ok(())
    }

    pub fn delete(&self, txn: &mut Transaction, id: InodeId) {
        let key = KeyCodec::record_key(Collection::Inodes, id);
        txn.delete_bytes(&key);
    }

    pub fn save_counter(&self, txn: &mut Transaction) {
        let key = KeyCodec::counter_key(Collection::Inodes);
        txn.put_bytes(&key, KeyCodec::encode_counter(self.next_id()));
    }
}
