use super::inode::InodeId;
use super::types::DirEntry;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DirListing {
    pub ino: InodeId,
    pub entries: Arc<Vec<DirEntry>>,
}

/// Listings materialized by `opendir`, keyed by randomly issued handles.
#[derive(Default)]
pub struct DirHandleCache {
    listings: DashMap<u64, DirListing>,
}

impl DirHandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entries` under a fresh handle. Handles already in use, and 0,
    /// are re-rolled.
    pub fn insert(&self, ino: InodeId, entries: Vec<DirEntry>) -> u64 {
        let listing = DirListing {
            ino,
            entries: Arc::new(entries),
        };
        loop {
            let handle = rand::random::<u64>();
            if handle == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.listings.entry(handle) {
                slot.insert(listing);
                return handle;
            }
        }
    }

    pub fn get(&self, handle: u64) -> Option<DirListing> {
        self.listings.get(&handle).map(|l| l.clone())
    }

    pub fn remove(&self, handle: u64) -> Option<DirListing> {
        self.listings.remove(&handle).map(|(_, l)| l)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.listings.len()
    }
}
