use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is unavailable: {0}")]
    Unavailable(String),

    #[error("store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Bytes, Bytes),
    Delete(Bytes),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Ordered key-value store holding every record the filesystem persists.
///
/// A batch handed to [`KvStore::write`] must be applied all-or-nothing.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>>;

    async fn write(&self, batch: Vec<WriteOp>) -> Result<()>;

    async fn usage(&self) -> Result<StoreUsage>;
}

/// Staged writes for one logical filesystem operation.
#[derive(Debug, Default)]
pub struct Transaction {
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&mut self, key: &Bytes, value: Bytes) {
        self.ops.push(WriteOp::Put(key.clone(), value));
    }

    pub fn delete_bytes(&mut self, key: &Bytes) {
        self.ops.push(WriteOp::Delete(key.clone()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_inner(self) -> Vec<WriteOp> {
        self.ops
    }
}

pub struct MemoryStore {
    records: RwLock<BTreeMap<Bytes, Bytes>>,
    capacity_bytes: u64,
}

impl MemoryStore {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            capacity_bytes,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(key).cloned())
    }

    async fn write(&self, batch: Vec<WriteOp>) -> Result<()> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        for op in batch {
            match op {
                WriteOp::Put(key, value) => {
                    records.insert(key, value);
                }
                WriteOp::Delete(key) => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn usage(&self) -> Result<StoreUsage> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let used_bytes = records
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum();
        Ok(StoreUsage {
            capacity_bytes: self.capacity_bytes,
            used_bytes,
        })
    }
}
