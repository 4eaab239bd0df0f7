pub mod chunk;
pub mod inode;

pub use chunk::ChunkStore;
pub use inode::InodeStore;

use crate::db::KvStore;
use crate::fs::errors::FsError;
use crate::fs::key_codec::{Collection, KeyCodec};

/// Reads the persisted allocation counter of a collection, falling back to
/// `first_id` on a fresh store.
pub async fn load_counter(
    db: &dyn KvStore,
    collection: Collection,
    first_id: u64,
) -> Result<u64, FsError> {
    let key = KeyCodec::counter_key(collection);
    match db.get(&key).await? {
        Some(data) => KeyCodec::decode_counter(&data).map_err(|e| {
            tracing::error!(
                "corrupt {} counter (len={})",
                collection.as_str(),
                data.len()
            );
            e
        }),
        None => Ok(first_id),
    }
}
