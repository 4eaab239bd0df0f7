use crate::db::{KvStore, Transaction};
use crate::fs::errors::FsError;
use crate::fs::inode::ChunkId;
use crate::fs::key_codec::{Collection, KeyCodec};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

pub const FIRST_ALLOCATED_CHUNK_ID: ChunkId = 1;

const PARALLEL_CHUNK_OPS: usize = 20;

#[derive(Clone)]
pub struct ChunkStore {
    db: Arc<dyn KvStore>,
    next_id: Arc<AtomicU64>,
}

impl ChunkStore {
    pub fn new(db: Arc<dyn KvStore>, initial_next_id: u64) -> Self {
        Self {
            db,
            next_id: Arc::new(AtomicU64::new(initial_next_id)),
        }
    }

    pub fn allocate(&self) -> ChunkId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub async fn get(&self, id: ChunkId) -> Result<Option<Bytes>, FsError> {
        let key = KeyCodec::record_key(Collection::Chunks, id);
        match self.db.get(&key).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("Failed to read chunk {}: {}", id, e);
                Err(FsError::StoreFailure)
            }
        }
    }

    /// Fetches several chunks concurrently, preserving input order. Sparse
    /// slots and missing records come back as `None`.
    pub async fn get_many(&self, ids: &[Option<ChunkId>]) -> Result<Vec<Option<Bytes>>, FsError> {
        let ids: Vec<Option<ChunkId>> = ids.to_vec();
        let this = self.clone();
        stream::iter(ids)
            .map(move |id| {
                let store = this.clone();
                async move {
                    match id {
                        Some(id) => store.get(id).await,
                        None => Ok(None),
                    }
                }
            })
            .buffered(PARALLEL_CHUNK_OPS)
            .try_collect()
            .await
    }

    pub fn save(&self, txn: &mut Transaction, id: ChunkId, data: Bytes) {
        let key = KeyCodec::record_key(Collection::Chunks, id);
        txn.put_bytes(&key, data);
    }

    pub fn delete(&self, txn: &mut Transaction, id: ChunkId) {
        let key = KeyCodec::record_key(Collection::Chunks, id);
        txn.delete_bytes(&key);
    }

    pub fn delete_all<'a>(
        &self,
        txn: &mut Transaction,
        ids: impl IntoIterator<Item = &'a Option<ChunkId>>,
    ) {
        for id in ids.into_iter().flatten() {
            self.delete(txn, *id);
        }
    }

    pub fn save_counter(&self, txn: &mut Transaction) {
        let key = KeyCodec::counter_key(Collection::Chunks);
        txn.put_bytes(&key, KeyCodec::encode_counter(self.next_id()));
    }
}
