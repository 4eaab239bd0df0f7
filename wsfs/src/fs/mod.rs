pub mod dir_handles;
pub mod errors;
pub mod inode;
pub mod key_codec;
pub mod lock_manager;
pub mod store;
pub mod types;

use self::dir_handles::{DirHandleCache, DirListing};
use self::errors::FsError;
use self::inode::{
    DirectoryInode, FileInode, Inode, InodeId, InodeKind, PLACEHOLDER_GENERATION,
    PLACEHOLDER_INODE_ID, ROOT_INODE_ID, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT,
    S_IFREG, S_IFSOCK, SpecialInode, SymlinkInode,
};
use self::key_codec::Collection;
use self::lock_manager::LockManager;
use self::store::chunk::FIRST_ALLOCATED_CHUNK_ID;
use self::store::inode::FIRST_ALLOCATED_INODE_ID;
use self::store::{ChunkStore, InodeStore, load_counter};
use self::types::{
    CreateReply, DirEntry, Entry, FileAttributes, InodeWithId, OpenReply, SetAttributes, StatFs,
};
use crate::db::{KvStore, Transaction};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHUNK_SIZE: u32 = 4096;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const NAME_MAX: usize = 255;
/// Upper bound on the chunk list of a single file.
pub const MAX_CHUNKS_PER_FILE: u64 = 1 << 20;

pub const RENAME_NOREPLACE: u32 = 1;
pub const RENAME_EXCHANGE: u32 = 2;

pub const XATTR_CREATE: i32 = 1;
pub const XATTR_REPLACE: i32 = 2;

const PARALLEL_INODE_LOADS: usize = 20;

/// Milliseconds since the Unix epoch.
pub fn get_current_time() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(e) => {
            warn!("System time is before UNIX epoch: {:?}", e);
            0
        }
    }
}

pub fn validate_filename(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        Err(FsError::InvalidArgument)
    } else if name.len() > NAME_MAX {
        Err(FsError::NameTooLong)
    } else {
        Ok(())
    }
}

fn validate_xattr_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name.contains('\0') {
        Err(FsError::InvalidArgument)
    } else if name.len() > NAME_MAX {
        Err(FsError::NameTooLong)
    } else {
        Ok(())
    }
}

fn new_generation() -> u64 {
    loop {
        let generation = rand::random::<u64>();
        if generation != PLACEHOLDER_GENERATION {
            return generation;
        }
    }
}

fn new_file_handle() -> u64 {
    loop {
        let handle = rand::random::<u64>();
        if handle != 0 {
            return handle;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsOptions {
    /// Chunk size given to newly created files.
    pub chunk_size: u32,
    /// Block size reported by `statfs` and for non-file nodes.
    pub block_size: u32,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

struct NewNode<'a> {
    uid: u32,
    gid: u32,
    parent: InodeId,
    name: &'a str,
    mode: u32,
    kind: InodeKind,
    now: u64,
}

pub struct Wsfs {
    db: Arc<dyn KvStore>,
    inode_store: InodeStore,
    chunk_store: ChunkStore,
    lock_manager: LockManager,
    dir_handles: DirHandleCache,
    chunk_size: u32,
    block_size: u32,
}

impl Wsfs {
    pub async fn new(db: Arc<dyn KvStore>, options: FsOptions) -> Result<Self, FsError> {
        if options.chunk_size == 0 || options.block_size == 0 {
            return Err(FsError::InvalidArgument);
        }

        let next_inode_id =
            load_counter(db.as_ref(), Collection::Inodes, FIRST_ALLOCATED_INODE_ID).await?;
        let next_chunk_id =
            load_counter(db.as_ref(), Collection::Chunks, FIRST_ALLOCATED_CHUNK_ID).await?;

        let fs = Self {
            inode_store: InodeStore::new(db.clone(), next_inode_id),
            chunk_store: ChunkStore::new(db.clone(), next_chunk_id),
            db,
            lock_manager: LockManager::new(),
            dir_handles: DirHandleCache::new(),
            chunk_size: options.chunk_size,
            block_size: options.block_size,
        };
        fs.ensure_reserved_inodes().await?;
        Ok(fs)
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Self, FsError> {
        Self::new_in_memory_with_chunk_size(DEFAULT_CHUNK_SIZE).await
    }

    #[cfg(test)]
    pub async fn new_in_memory_with_chunk_size(chunk_size: u32) -> Result<Self, FsError> {
        let db = Arc::new(crate::db::MemoryStore::new(1 << 30));
        Self::new(
            db,
            FsOptions {
                chunk_size,
                block_size: DEFAULT_BLOCK_SIZE,
            },
        )
        .await
    }

    async fn ensure_reserved_inodes(&self) -> Result<(), FsError> {
        let mut txn = Transaction::new();

        if self.inode_store.get(PLACEHOLDER_INODE_ID).await?.is_none() {
            self.inode_store
                .save(&mut txn, PLACEHOLDER_INODE_ID, &Inode::placeholder())?;
        }

        if self.inode_store.get(ROOT_INODE_ID).await?.is_none() {
            info!("Initializing empty filesystem");
            let now = get_current_time();
            let root = Inode::new(
                InodeKind::Directory(DirectoryInode {
                    parent: ROOT_INODE_ID,
                    subdirs: HashMap::new(),
                    mtime: now,
                }),
                S_IFDIR | 0o755,
                0,
                0,
                now,
                new_generation(),
            );
            self.inode_store.save(&mut txn, ROOT_INODE_ID, &root)?;
        }

        if !txn.is_empty() {
            self.commit(txn).await?;
        }
        Ok(())
    }

    async fn commit(&self, mut txn: Transaction) -> Result<(), FsError> {
        self.inode_store.save_counter(&mut txn);
        self.chunk_store.save_counter(&mut txn);
        self.db.write(txn.into_inner()).await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            FsError::StoreFailure
        })
    }

    fn attributes(&self, id: InodeId, inode: &Inode) -> FileAttributes {
        InodeWithId {
            inode,
            id,
            block_size: self.block_size,
        }
        .into()
    }

    fn entry(&self, id: InodeId, inode: &Inode) -> Entry {
        InodeWithId {
            inode,
            id,
            block_size: self.block_size,
        }
        .into()
    }

    async fn fetch(&self, id: InodeId) -> Result<Option<Inode>, FsError> {
        if id == PLACEHOLDER_INODE_ID {
            return Ok(None);
        }
        self.inode_store.get(id).await
    }

    async fn load(&self, id: InodeId) -> Result<Inode, FsError> {
        self.fetch(id).await?.ok_or(FsError::NoSuchEntry)
    }

    /// Loads a live directory that names are resolved in. Anything else,
    /// including a removed directory, counts as a missing entry.
    async fn load_parent(&self, id: InodeId) -> Result<Inode, FsError> {
        match self.fetch(id).await? {
            Some(inode) if inode.is_directory() && !inode.deleted => Ok(inode),
            _ => Err(FsError::NoSuchEntry),
        }
    }

    fn dir_ref(inode: &Inode) -> Result<&DirectoryInode, FsError> {
        match &inode.kind {
            InodeKind::Directory(dir) => Ok(dir),
            _ => Err(FsError::NotADirectory),
        }
    }

    fn dir_mut(inode: &mut Inode) -> Result<&mut DirectoryInode, FsError> {
        match &mut inode.kind {
            InodeKind::Directory(dir) => Ok(dir),
            _ => Err(FsError::NotADirectory),
        }
    }

    fn file_ref(inode: &Inode) -> Result<&FileInode, FsError> {
        match &inode.kind {
            InodeKind::File(file) => Ok(file),
            InodeKind::Directory(_) => Err(FsError::IsADirectory),
            _ => Err(FsError::InvalidArgument),
        }
    }

    fn file_mut(inode: &mut Inode) -> Result<&mut FileInode, FsError> {
        match &mut inode.kind {
            InodeKind::File(file) => Ok(file),
            InodeKind::Directory(_) => Err(FsError::IsADirectory),
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// Stages `inode`, or its removal together with its chunks once nothing
    /// references it any more. Returns true if it was removed.
    fn persist_or_reclaim(
        &self,
        txn: &mut Transaction,
        id: InodeId,
        inode: &Inode,
    ) -> Result<bool, FsError> {
        if id != ROOT_INODE_ID && inode.is_reclaimable() {
            debug!("Reclaiming inode {}", id);
            if let InodeKind::File(file) = &inode.kind {
                self.chunk_store.delete_all(txn, &file.chunks);
            }
            self.inode_store.delete(txn, id);
            Ok(true)
        } else {
            self.inode_store.save(txn, id, inode)?;
            Ok(false)
        }
    }

    /// Removes one name from `inode` and stages the outcome.
    fn drop_name(
        &self,
        txn: &mut Transaction,
        id: InodeId,
        inode: &mut Inode,
    ) -> Result<(), FsError> {
        match &mut inode.kind {
            InodeKind::File(file) => {
                file.hard_links = file.hard_links.saturating_sub(1);
                if file.hard_links == 0 {
                    inode.deleted = true;
                }
            }
            _ => inode.deleted = true,
        }
        self.persist_or_reclaim(txn, id, inode)?;
        Ok(())
    }

    /// Builds a node and links it into its parent. Writes are staged, not
    /// committed.
    async fn make_node(
        &self,
        txn: &mut Transaction,
        node: NewNode<'_>,
    ) -> Result<(InodeId, Inode), FsError> {
        validate_filename(node.name)?;

        let mut parent_inode = self.load_parent(node.parent).await?;
        let dir = Self::dir_mut(&mut parent_inode)?;
        if dir.subdirs.contains_key(node.name) {
            return Err(FsError::AlreadyExists);
        }

        let id = self.inode_store.allocate();
        debug!("Allocated inode {} for {}", id, node.name);

        let mut inode = Inode::new(
            node.kind,
            node.mode,
            node.uid,
            node.gid,
            node.now,
            new_generation(),
        );
        inode.lookups = 1;

        dir.subdirs.insert(node.name.to_string(), id);
        dir.mtime = node.now;

        self.inode_store.save(txn, node.parent, &parent_inode)?;
        self.inode_store.save(txn, id, &inode)?;
        Ok((id, inode))
    }

    pub async fn lookup(&self, parent: InodeId, name: &str) -> Result<Entry, FsError> {
        debug!("lookup: parent={}, name={}", parent, name);
        let _guard = self.lock_manager.acquire().await;

        let parent_inode = self.load_parent(parent).await?;
        let dir = Self::dir_ref(&parent_inode)?;
        let id = match name {
            "." => parent,
            ".." => dir.parent,
            _ => *dir.subdirs.get(name).ok_or(FsError::NoSuchEntry)?,
        };

        let mut inode = self.load(id).await?;
        inode.lookups = inode.lookups.saturating_add(1);

        let mut txn = Transaction::new();
        self.inode_store.save(&mut txn, id, &inode)?;
        self.commit(txn).await?;

        Ok(self.entry(id, &inode))
    }

    /// Drops `nlookup` references held by the driver. Unknown inodes are
    /// ignored since the driver may forget nodes that were already reclaimed.
    pub async fn forget(&self, id: InodeId, nlookup: u32) -> Result<(), FsError> {
        debug!("forget: ino={}, nlookup={}", id, nlookup);
        let _guard = self.lock_manager.acquire().await;

        let Some(mut inode) = self.fetch(id).await? else {
            return Ok(());
        };
        inode.lookups = inode.lookups.saturating_sub(nlookup as u64);

        let mut txn = Transaction::new();
        self.persist_or_reclaim(&mut txn, id, &inode)?;
        self.commit(txn).await
    }

    pub async fn getattr(&self, id: InodeId) -> Result<FileAttributes, FsError> {
        debug!("getattr: ino={}", id);
        match self.fetch(id).await? {
            Some(inode) => Ok(self.attributes(id, &inode)),
            None => Err(FsError::BadDescriptor),
        }
    }

    pub async fn setattr(
        &self,
        id: InodeId,
        setattr: &SetAttributes,
    ) -> Result<FileAttributes, FsError> {
        debug!("setattr: ino={}, attrs={:?}", id, setattr);
        let _guard = self.lock_manager.acquire().await;

        let mut inode = self.load(id).await?;
        let mut txn = Transaction::new();

        if let Some(mode) = setattr.mode {
            inode.mode = inode.file_type() | (mode & !S_IFMT);
        }
        if let Some(uid) = setattr.uid {
            inode.uid = uid;
        }
        if let Some(gid) = setattr.gid {
            inode.gid = gid;
        }
        if let Some(size) = setattr.size {
            match &mut inode.kind {
                InodeKind::File(file) => self.truncate(&mut txn, file, size).await?,
                InodeKind::Directory(_) => return Err(FsError::IsADirectory),
                _ => return Err(FsError::InvalidArgument),
            }
        }
        if let Some(mtime) = setattr.mtime {
            match &mut inode.kind {
                InodeKind::File(file) => file.mtime = mtime,
                InodeKind::Directory(dir) => dir.mtime = mtime,
                // These report ctime as their modification time.
                InodeKind::Symlink(_) | InodeKind::Special(_) => inode.ctime = mtime,
            }
        }
        if let Some(ctime) = setattr.ctime {
            inode.ctime = ctime;
        }
        if let Some(crtime) = setattr.crtime {
            inode.crtime = crtime;
        }

        self.inode_store.save(&mut txn, id, &inode)?;
        self.commit(txn).await?;

        Ok(self.attributes(id, &inode))
    }

    async fn truncate(
        &self,
        txn: &mut Transaction,
        file: &mut FileInode,
        size: u64,
    ) -> Result<(), FsError> {
        let old_size = file.size();
        let chunk_size = file.chunk_size as u64;

        let expected_chunks = size.div_ceil(chunk_size);
        if expected_chunks > MAX_CHUNKS_PER_FILE {
            return Err(FsError::FileTooLarge);
        }
        let expected_chunks = expected_chunks as usize;
        let remainder = size % chunk_size;
        let trim = if remainder == 0 {
            0
        } else {
            chunk_size - remainder
        };

        if expected_chunks >= file.chunks.len() {
            file.chunks.resize(expected_chunks, None);
        } else {
            for chunk_id in file.chunks.drain(expected_chunks..).flatten() {
                self.chunk_store.delete(txn, chunk_id);
            }
        }

        // Bytes past the new end must read back as zeros if the file grows again.
        if size < old_size
            && trim > 0
            && let Some(Some(last)) = file.chunks.last().copied()
        {
            let stored = self.chunk_store.get(last).await?.unwrap_or_default();
            let mut data = BytesMut::from(stored.as_ref());
            data.resize(chunk_size as usize, 0);
            data[(chunk_size - trim) as usize..].fill(0);
            self.chunk_store.save(txn, last, data.freeze());
        }

        file.trim = trim as u32;
        Ok(())
    }

    pub async fn readlink(&self, id: InodeId) -> Result<String, FsError> {
        debug!("readlink: ino={}", id);
        let inode = self.load(id).await?;
        match inode.kind {
            InodeKind::Symlink(link) => Ok(link.target),
            _ => Err(FsError::NotASymlink),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mknod(
        &self,
        uid: u32,
        gid: u32,
        parent: InodeId,
        name: &str,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<Entry, FsError> {
        debug!(
            "mknod: parent={}, name={}, mode={:o}, umask={:o}",
            parent, name, mode, umask
        );
        let _guard = self.lock_manager.acquire().await;

        let now = get_current_time();
        let file_type = match mode & S_IFMT {
            0 => S_IFREG,
            t => t,
        };
        let kind = match file_type {
            S_IFREG => InodeKind::File(FileInode::new(self.chunk_size, now)),
            S_IFDIR => InodeKind::Directory(DirectoryInode {
                parent,
                subdirs: HashMap::new(),
                mtime: now,
            }),
            S_IFCHR | S_IFBLK | S_IFIFO | S_IFSOCK => InodeKind::Special(SpecialInode { rdev }),
            S_IFLNK => return Err(FsError::Unsupported),
            _ => return Err(FsError::InvalidArgument),
        };

        let mut txn = Transaction::new();
        let (id, inode) = self
            .make_node(
                &mut txn,
                NewNode {
                    uid,
                    gid,
                    parent,
                    name,
                    mode: file_type | (mode & !umask & !S_IFMT),
                    kind,
                    now,
                },
            )
            .await?;
        self.commit(txn).await?;

        Ok(self.entry(id, &inode))
    }

    pub async fn mkdir(
        &self,
        uid: u32,
        gid: u32,
        parent: InodeId,
        name: &str,
        mode: u32,
        umask: u32,
    ) -> Result<Entry, FsError> {
        self.mknod(uid, gid, parent, name, (mode & !S_IFMT) | S_IFDIR, umask, 0)
            .await
    }

    pub async fn symlink(
        &self,
        uid: u32,
        gid: u32,
        parent: InodeId,
        name: &str,
        target: &str,
    ) -> Result<Entry, FsError> {
        debug!("symlink: parent={}, name={}, target={}", parent, name, target);
        let _guard = self.lock_manager.acquire().await;

        let now = get_current_time();
        let mut txn = Transaction::new();
        let (id, inode) = self
            .make_node(
                &mut txn,
                NewNode {
                    uid,
                    gid,
                    parent,
                    name,
                    mode: S_IFLNK | 0o777,
                    kind: InodeKind::Symlink(SymlinkInode {
                        parent,
                        target: target.to_string(),
                    }),
                    now,
                },
            )
            .await?;
        self.commit(txn).await?;

        Ok(self.entry(id, &inode))
    }

    pub async fn unlink(&self, parent: InodeId, name: &str) -> Result<(), FsError> {
        debug!("unlink: parent={}, name={}", parent, name);
        self.remove(parent, name, false).await
    }

    pub async fn rmdir(&self, parent: InodeId, name: &str) -> Result<(), FsError> {
        debug!("rmdir: parent={}, name={}", parent, name);
        self.remove(parent, name, true).await
    }

    fn check_removable(inode: &Inode, want_directory: bool) -> Result<(), FsError> {
        match (&inode.kind, want_directory) {
            (InodeKind::Directory(dir), true) if !dir.subdirs.is_empty() => Err(FsError::NotEmpty),
            (InodeKind::Directory(_), true) => Ok(()),
            (_, true) => Err(FsError::NotADirectory),
            (InodeKind::Directory(_), false) => Err(FsError::IsADirectory),
            (_, false) => Ok(()),
        }
    }

    async fn remove(
        &self,
        parent: InodeId,
        name: &str,
        want_directory: bool,
    ) -> Result<(), FsError> {
        validate_filename(name)?;
        let _guard = self.lock_manager.acquire().await;

        let mut parent_inode = self.load_parent(parent).await?;
        let dir = Self::dir_mut(&mut parent_inode)?;
        let child_id = *dir.subdirs.get(name).ok_or(FsError::NoSuchEntry)?;

        let mut child = self.load(child_id).await?;
        Self::check_removable(&child, want_directory)?;

        dir.subdirs.remove(name);
        dir.mtime = get_current_time();

        let mut txn = Transaction::new();
        self.drop_name(&mut txn, child_id, &mut child)?;
        self.inode_store.save(&mut txn, parent, &parent_inode)?;
        self.commit(txn).await
    }

    /// Fails if `ancestor` lies on the path from `start` up to the root.
    async fn ensure_not_within(&self, ancestor: InodeId, start: InodeId) -> Result<(), FsError> {
        let mut current = start;
        loop {
            if current == ancestor {
                return Err(FsError::InvalidArgument);
            }
            if current == ROOT_INODE_ID {
                return Ok(());
            }
            let inode = self.load(current).await?;
            current = Self::dir_ref(&inode)?.parent;
        }
    }

    pub async fn rename(
        &self,
        parent: InodeId,
        name: &str,
        new_parent: InodeId,
        new_name: &str,
        flags: u32,
    ) -> Result<(), FsError> {
        debug!(
            "rename: {}/{} -> {}/{} flags={}",
            parent, name, new_parent, new_name, flags
        );

        if flags & RENAME_EXCHANGE != 0 {
            return Err(FsError::Unsupported);
        }
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(FsError::InvalidArgument);
        }
        validate_filename(name)?;
        validate_filename(new_name)?;

        let _guard = self.lock_manager.acquire().await;

        let mut src_parent = self.load_parent(parent).await?;
        let src_id = *Self::dir_ref(&src_parent)?
            .subdirs
            .get(name)
            .ok_or(FsError::NoSuchEntry)?;
        let mut dst_parent = if new_parent == parent {
            None
        } else {
            Some(self.load_parent(new_parent).await?)
        };

        if parent == new_parent && name == new_name {
            return Ok(());
        }

        let mut src = self.load(src_id).await?;
        if src.is_directory() && new_parent != parent {
            self.ensure_not_within(src_id, new_parent).await?;
        }

        let mut txn = Transaction::new();

        let target_dir = match &dst_parent {
            Some(p) => Self::dir_ref(p)?,
            None => Self::dir_ref(&src_parent)?,
        };
        if let Some(&dst_id) = target_dir.subdirs.get(new_name) {
            if flags & RENAME_NOREPLACE != 0 {
                return Err(FsError::AlreadyExists);
            }
            // Both names already refer to the same inode.
            if dst_id == src_id {
                return Ok(());
            }

            let mut dst = self.load(dst_id).await?;
            match (src.is_directory(), &dst.kind) {
                (true, InodeKind::Directory(dir)) if !dir.subdirs.is_empty() => {
                    return Err(FsError::NotEmpty);
                }
                (true, InodeKind::Directory(_)) => {}
                (true, _) => return Err(FsError::NotADirectory),
                (false, InodeKind::Directory(_)) => return Err(FsError::IsADirectory),
                (false, _) => {}
            }
            self.drop_name(&mut txn, dst_id, &mut dst)?;
        }

        let now = get_current_time();

        let src_dir = Self::dir_mut(&mut src_parent)?;
        src_dir.subdirs.remove(name);
        src_dir.mtime = now;

        let dst_dir = match dst_parent.as_mut() {
            Some(p) => Self::dir_mut(p)?,
            None => Self::dir_mut(&mut src_parent)?,
        };
        dst_dir.subdirs.insert(new_name.to_string(), src_id);
        dst_dir.mtime = now;

        match &mut src.kind {
            InodeKind::Directory(dir) => dir.parent = new_parent,
            InodeKind::Symlink(link) => link.parent = new_parent,
            InodeKind::File(_) | InodeKind::Special(_) => {}
        }

        self.inode_store.save(&mut txn, src_id, &src)?;
        self.inode_store.save(&mut txn, parent, &src_parent)?;
        if let Some(p) = &dst_parent {
            self.inode_store.save(&mut txn, new_parent, p)?;
        }
        self.commit(txn).await
    }

    pub async fn link(
        &self,
        id: InodeId,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<Entry, FsError> {
        debug!("link: ino={} -> {}/{}", id, new_parent, new_name);
        validate_filename(new_name)?;
        let _guard = self.lock_manager.acquire().await;

        let mut parent_inode = self.load_parent(new_parent).await?;
        let dir = Self::dir_mut(&mut parent_inode)?;
        if dir.subdirs.contains_key(new_name) {
            return Err(FsError::AlreadyExists);
        }

        let mut inode = self.load(id).await?;
        let InodeKind::File(file) = &mut inode.kind else {
            return Err(FsError::NotPermitted);
        };
        file.hard_links = file
            .hard_links
            .checked_add(1)
            .ok_or(FsError::TooManyLinks)?;
        inode.deleted = false;
        inode.lookups = inode.lookups.saturating_add(1);

        dir.subdirs.insert(new_name.to_string(), id);
        dir.mtime = get_current_time();

        let mut txn = Transaction::new();
        self.inode_store.save(&mut txn, id, &inode)?;
        self.inode_store.save(&mut txn, new_parent, &parent_inode)?;
        self.commit(txn).await?;

        Ok(self.entry(id, &inode))
    }

    pub async fn open(&self, id: InodeId, flags: i32) -> Result<OpenReply, FsError> {
        debug!("open: ino={}, flags={:#x}", id, flags);
        let _guard = self.lock_manager.acquire().await;

        let mut inode = self.load(id).await?;
        let file = Self::file_mut(&mut inode)?;
        file.open_handles = file.open_handles.saturating_add(1);

        let mut txn = Transaction::new();
        self.inode_store.save(&mut txn, id, &inode)?;
        self.commit(txn).await?;

        Ok(OpenReply {
            handle: new_file_handle(),
            flags: 0,
        })
    }

    pub async fn read(
        &self,
        id: InodeId,
        handle: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        debug!(
            "read: ino={}, fh={}, offset={}, size={}",
            id, handle, offset, size
        );
        let _guard = self.lock_manager.acquire().await;

        let inode = self.load(id).await?;
        let file = Self::file_ref(&inode)?;

        let file_size = file.size();
        if offset >= file_size || size == 0 {
            return Ok(Bytes::new());
        }
        let end = file_size.min(offset + size as u64);

        let chunk_size = file.chunk_size as u64;
        let first = (offset / chunk_size) as usize;
        let last = ((end - 1) / chunk_size) as usize;
        let chunks = self.chunk_store.get_many(&file.chunks[first..=last]).await?;

        let mut result = BytesMut::with_capacity((end - offset) as usize);
        for (idx, chunk) in (first..=last).zip(chunks) {
            let chunk_start = idx as u64 * chunk_size;
            let from = (offset.max(chunk_start) - chunk_start) as usize;
            let to = (end.min(chunk_start + chunk_size) - chunk_start) as usize;

            // Sparse chunks, and anything a short chunk lacks, read as zeros.
            let copied = match &chunk {
                Some(data) if data.len() > from => {
                    let upto = data.len().min(to);
                    result.extend_from_slice(&data[from..upto]);
                    upto - from
                }
                _ => 0,
            };
            result.resize(result.len() + (to - from - copied), 0);
        }

        Ok(result.freeze())
    }

    pub async fn write(
        &self,
        id: InodeId,
        handle: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, FsError> {
        debug!(
            "write: ino={}, fh={}, offset={}, len={}",
            id,
            handle,
            offset,
            data.len()
        );
        let written = u32::try_from(data.len()).map_err(|_| FsError::InvalidArgument)?;
        let _guard = self.lock_manager.acquire().await;

        let mut inode = self.load(id).await?;
        let file = Self::file_mut(&mut inode)?;
        if data.is_empty() {
            return Ok(0);
        }

        let chunk_size = file.chunk_size as u64;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;
        let last_chunk = (end - 1) / chunk_size;
        if last_chunk >= MAX_CHUNKS_PER_FILE {
            return Err(FsError::FileTooLarge);
        }
        let first = (offset / chunk_size) as usize;
        let last = last_chunk as usize;

        let old_size = file.size();
        if file.chunks.len() <= last {
            file.chunks.resize(last + 1, None);
        }

        // Only partially covered chunks need their current contents.
        let to_fetch: Vec<_> = (first..=last)
            .map(|idx| {
                let chunk_start = idx as u64 * chunk_size;
                let covers_chunk = offset <= chunk_start && end >= chunk_start + chunk_size;
                if covers_chunk { None } else { file.chunks[idx] }
            })
            .collect();
        let existing = self.chunk_store.get_many(&to_fetch).await?;

        let mut txn = Transaction::new();
        for (idx, current) in (first..=last).zip(existing) {
            let chunk_start = idx as u64 * chunk_size;
            let from = offset.max(chunk_start);
            let to = end.min(chunk_start + chunk_size);

            let mut buf = match current {
                Some(stored) => BytesMut::from(stored.as_ref()),
                None => BytesMut::zeroed(chunk_size as usize),
            };
            buf.resize(chunk_size as usize, 0);
            buf[(from - chunk_start) as usize..(to - chunk_start) as usize]
                .copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);

            let chunk_id = match file.chunks[idx] {
                Some(chunk_id) => chunk_id,
                None => self.chunk_store.allocate(),
            };
            self.chunk_store.save(&mut txn, chunk_id, buf.freeze());
            file.chunks[idx] = Some(chunk_id);
        }

        let new_size = old_size.max(end);
        file.trim = (file.chunks.len() as u64 * chunk_size - new_size) as u32;
        file.mtime = get_current_time();

        self.inode_store.save(&mut txn, id, &inode)?;
        self.commit(txn).await?;

        debug!("write: ino={} new size {}", id, new_size);
        Ok(written)
    }

    pub async fn release(&self, id: InodeId, handle: u64, flags: i32) -> Result<(), FsError> {
        debug!("release: ino={}, fh={}, flags={:#x}", id, handle, flags);
        let _guard = self.lock_manager.acquire().await;

        let Some(mut inode) = self.fetch(id).await? else {
            return Err(FsError::BadDescriptor);
        };
        if let InodeKind::File(file) = &mut inode.kind {
            file.open_handles = file.open_handles.saturating_sub(1);
        }

        let mut txn = Transaction::new();
        self.persist_or_reclaim(&mut txn, id, &inode)?;
        self.commit(txn).await
    }

    /// Regular file creation followed by an open, in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        uid: u32,
        gid: u32,
        parent: InodeId,
        name: &str,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<CreateReply, FsError> {
        debug!(
            "create: parent={}, name={}, mode={:o}, flags={:#x}",
            parent, name, mode, flags
        );
        let _guard = self.lock_manager.acquire().await;

        let now = get_current_time();
        let mut file = FileInode::new(self.chunk_size, now);
        file.open_handles = 1;

        let mut txn = Transaction::new();
        let (id, inode) = self
            .make_node(
                &mut txn,
                NewNode {
                    uid,
                    gid,
                    parent,
                    name,
                    mode: S_IFREG | (mode & !umask & !S_IFMT),
                    kind: InodeKind::File(file),
                    now,
                },
            )
            .await?;
        self.commit(txn).await?;

        Ok(CreateReply {
            entry: self.entry(id, &inode),
            open: OpenReply {
                handle: new_file_handle(),
                flags: 0,
            },
        })
    }

    pub async fn opendir(&self, id: InodeId, flags: i32) -> Result<OpenReply, FsError> {
        debug!("opendir: ino={}, flags={:#x}", id, flags);
        let _guard = self.lock_manager.acquire().await;

        let inode = self.load(id).await?;
        let entries = self.list_directory(id, &inode).await?;
        let handle = self.dir_handles.insert(id, entries);

        Ok(OpenReply { handle, flags: 0 })
    }

    /// `.` and `..` first, then every child sorted by name.
    async fn list_directory(
        &self,
        id: InodeId,
        inode: &Inode,
    ) -> Result<Vec<DirEntry>, FsError> {
        let dir = Self::dir_ref(inode)?;

        let mut children: Vec<(&String, InodeId)> =
            dir.subdirs.iter().map(|(name, id)| (name, *id)).collect();
        children.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let child_ids: Vec<InodeId> = children.iter().map(|(_, id)| *id).collect();
        let inode_store = self.inode_store.clone();
        let child_inodes: Vec<Option<Inode>> = stream::iter(child_ids)
            .map(move |child_id| {
                let store = inode_store.clone();
                async move {
                    if child_id == PLACEHOLDER_INODE_ID {
                        return Ok(None);
                    }
                    store.get(child_id).await
                }
            })
            .buffered(PARALLEL_INODE_LOADS)
            .try_collect()
            .await?;

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(DirEntry {
            ino: id,
            name: ".".to_string(),
            kind: S_IFDIR,
        });
        entries.push(DirEntry {
            ino: dir.parent,
            name: "..".to_string(),
            kind: S_IFDIR,
        });
        for ((name, child_id), child) in children.into_iter().zip(child_inodes) {
            match child {
                Some(child) => entries.push(DirEntry {
                    ino: child_id,
                    name: name.clone(),
                    kind: child.file_type(),
                }),
                None => warn!(
                    "Directory {} references missing inode {} ({})",
                    id, child_id, name
                ),
            }
        }
        Ok(entries)
    }

    fn listing(&self, id: InodeId, handle: u64) -> Result<DirListing, FsError> {
        match self.dir_handles.get(handle) {
            Some(listing) if listing.ino == id => Ok(listing),
            _ => {
                warn!("Unknown directory handle {} for inode {}", handle, id);
                Err(FsError::BadDescriptor)
            }
        }
    }

    pub fn readdir(
        &self,
        id: InodeId,
        handle: u64,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        debug!("readdir: ino={}, fh={}, offset={}", id, handle, offset);
        let listing = self.listing(id, handle)?;
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(listing.entries.iter().skip(skip).cloned().collect())
    }

    /// Like `readdir`, with the entry of every listed node, returning at most
    /// `limit` entries. Each returned node other than `.` and `..` gains a
    /// lookup reference.
    pub async fn readdirplus(
        &self,
        id: InodeId,
        handle: u64,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<(DirEntry, Entry)>, FsError> {
        debug!(
            "readdirplus: ino={}, fh={}, offset={}, limit={}",
            id, handle, offset, limit
        );
        let listing = self.listing(id, handle)?;
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);

        let _guard = self.lock_manager.acquire().await;

        let mut referenced: HashMap<InodeId, Inode> = HashMap::new();
        let mut result = Vec::new();
        for dir_entry in listing.entries.iter().skip(skip).take(limit) {
            let is_self_or_parent = dir_entry.name == "." || dir_entry.name == "..";

            let inode = match referenced.get(&dir_entry.ino) {
                Some(inode) => inode.clone(),
                None => match self.fetch(dir_entry.ino).await? {
                    Some(inode) => inode,
                    None => continue,
                },
            };

            let inode = if is_self_or_parent {
                inode
            } else {
                let mut inode = inode;
                inode.lookups = inode.lookups.saturating_add(1);
                referenced.insert(dir_entry.ino, inode.clone());
                inode
            };
            result.push((dir_entry.clone(), self.entry(dir_entry.ino, &inode)));
        }

        if !referenced.is_empty() {
            let mut txn = Transaction::new();
            for (ino, inode) in &referenced {
                self.inode_store.save(&mut txn, *ino, inode)?;
            }
            self.commit(txn).await?;
        }

        Ok(result)
    }

    pub fn releasedir(&self, id: InodeId, handle: u64, flags: i32) -> Result<(), FsError> {
        debug!("releasedir: ino={}, fh={}, flags={:#x}", id, handle, flags);
        match self.dir_handles.remove(handle) {
            Some(_) => Ok(()),
            None => {
                warn!("Release of unknown directory handle {}", handle);
                Err(FsError::BadDescriptor)
            }
        }
    }

    pub async fn statfs(&self) -> Result<StatFs, FsError> {
        debug!("statfs");
        let usage = self.db.usage().await?;

        let block_size = self.block_size as u64;
        let blocks = usage.capacity_bytes / block_size;
        let bfree = blocks.saturating_sub(usage.used_bytes.div_ceil(block_size));
        let files = self.inode_store.next_id();

        Ok(StatFs {
            blocks,
            bfree,
            bavail: bfree,
            files,
            ffree: u64::MAX - files,
            bsize: self.block_size,
            namelen: NAME_MAX as u32,
            frsize: self.block_size,
        })
    }

    pub async fn setxattr(
        &self,
        id: InodeId,
        name: &str,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        debug!(
            "setxattr: ino={}, name={}, len={}, flags={:#x}",
            id,
            name,
            value.len(),
            flags
        );
        validate_xattr_name(name)?;
        let _guard = self.lock_manager.acquire().await;

        let mut inode = self.load(id).await?;
        let exists = inode.xattrs.contains_key(name);
        if flags & XATTR_CREATE != 0 && exists {
            return Err(FsError::AlreadyExists);
        }
        if flags & XATTR_REPLACE != 0 && !exists {
            return Err(FsError::NoSuchAttribute);
        }
        inode.xattrs.insert(name.to_string(), value.to_vec());

        let mut txn = Transaction::new();
        self.inode_store.save(&mut txn, id, &inode)?;
        self.commit(txn).await
    }

    pub async fn getxattr(&self, id: InodeId, name: &str) -> Result<Vec<u8>, FsError> {
        debug!("getxattr: ino={}, name={}", id, name);
        let mut inode = self.load(id).await?;
        inode.xattrs.remove(name).ok_or(FsError::NoSuchAttribute)
    }

    /// Attribute names in sorted order.
    pub async fn listxattr(&self, id: InodeId) -> Result<Vec<String>, FsError> {
        debug!("listxattr: ino={}", id);
        let inode = self.load(id).await?;
        Ok(inode.xattrs.into_keys().collect())
    }

    pub async fn removexattr(&self, id: InodeId, name: &str) -> Result<(), FsError> {
        debug!("removexattr: ino={}, name={}", id, name);
        let _guard = self.lock_manager.acquire().await;

        let mut inode = self.load(id).await?;
        if inode.xattrs.remove(name).is_none() {
            return Err(FsError::NoSuchAttribute);
        }

        let mut txn = Transaction::new();
        self.inode_store.save(&mut txn, id, &inode)?;
        self.commit(txn).await
    }

    pub async fn access(&self, id: InodeId, mask: u32) -> Result<(), FsError> {
        debug!("access: ino={}, mask={:o}", id, mask);
        self.load(id).await.map(|_| ())
    }

    pub async fn flush(&self, id: InodeId, handle: u64) -> Result<(), FsError> {
        debug!("flush: ino={}, fh={}", id, handle);
        self.load(id).await.map(|_| ())
    }

    /// Every commit is already in the store when an operation returns.
    pub async fn fsync(&self, id: InodeId, handle: u64, datasync: bool) -> Result<(), FsError> {
        debug!("fsync: ino={}, fh={}, datasync={}", id, handle, datasync);
        self.load(id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    const README: &[u8] = b"# Wsfs\n\nThis is Wsfs! It is a toy filesystem backed by a key-value store.\n";

    async fn fs_with_store(chunk_size: u32) -> (Wsfs, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(1 << 30));
        let fs = Wsfs::new(
            store.clone(),
            FsOptions {
                chunk_size,
                block_size: DEFAULT_BLOCK_SIZE,
            },
        )
        .await
        .unwrap();
        (fs, store)
    }

    async fn create_file(fs: &Wsfs, name: &str) -> InodeId {
        fs.mknod(0, 0, ROOT_INODE_ID, name, S_IFREG | 0o644, 0, 0)
            .await
            .unwrap()
            .attr
            .ino
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn lookups(fs: &Wsfs, id: InodeId) -> u64 {
        fs.inode_store.get(id).await.unwrap().unwrap().lookups
    }

    #[tokio::test]
    async fn test_fresh_filesystem_has_root_and_placeholder() {
        let fs = Wsfs::new_in_memory().await.unwrap();

        let root = fs.getattr(ROOT_INODE_ID).await.unwrap();
        assert_eq!(root.mode, S_IFDIR | 0o755);
        assert_eq!(root.nlink, 1);

        let placeholder = fs.inode_store.get(PLACEHOLDER_INODE_ID).await.unwrap().unwrap();
        assert_eq!(placeholder.generation, PLACEHOLDER_GENERATION);
        assert_eq!(
            fs.getattr(PLACEHOLDER_INODE_ID).await,
            Err(FsError::BadDescriptor)
        );
        assert_eq!(fs.getattr(12345).await, Err(FsError::BadDescriptor));
    }

    #[tokio::test]
    async fn test_mknod_applies_umask_and_lookup_counts() {
        let fs = Wsfs::new_in_memory().await.unwrap();

        let entry = fs
            .mknod(7, 8, ROOT_INODE_ID, "notes", S_IFREG | 0o666, 0o022, 0)
            .await
            .unwrap();
        assert_eq!(entry.attr.mode, S_IFREG | 0o644);
        assert_eq!(entry.attr.uid, 7);
        assert_eq!(entry.attr.gid, 8);
        assert_ne!(entry.generation, PLACEHOLDER_GENERATION);
        let id = entry.attr.ino;
        assert_eq!(lookups(&fs, id).await, 1);

        let found = fs.lookup(ROOT_INODE_ID, "notes").await.unwrap();
        assert_eq!(found.attr, entry.attr);
        assert_eq!(found.generation, entry.generation);
        assert_eq!(lookups(&fs, id).await, 2);

        fs.lookup(ROOT_INODE_ID, "notes").await.unwrap();
        assert_eq!(lookups(&fs, id).await, 3);
    }

    #[tokio::test]
    async fn test_lookup_failures() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let file = create_file(&fs, "f").await;

        assert_eq!(
            fs.lookup(ROOT_INODE_ID, "missing").await,
            Err(FsError::NoSuchEntry)
        );
        assert_eq!(fs.lookup(file, "x").await, Err(FsError::NoSuchEntry));
        assert_eq!(fs.lookup(999, "x").await, Err(FsError::NoSuchEntry));
    }

    #[tokio::test]
    async fn test_mknod_kinds_and_name_checks() {
        let fs = Wsfs::new_in_memory().await.unwrap();

        let dev = fs
            .mknod(0, 0, ROOT_INODE_ID, "tty", S_IFCHR | 0o600, 0, 0x0401)
            .await
            .unwrap();
        assert_eq!(dev.attr.rdev, 0x0401);
        assert_eq!(dev.attr.mode & S_IFMT, S_IFCHR);

        let fifo = fs
            .mknod(0, 0, ROOT_INODE_ID, "pipe", S_IFIFO | 0o600, 0, 0)
            .await
            .unwrap();
        assert_eq!(fifo.attr.mode & S_IFMT, S_IFIFO);

        assert_eq!(
            fs.mknod(0, 0, ROOT_INODE_ID, "link", S_IFLNK | 0o777, 0, 0)
                .await,
            Err(FsError::Unsupported)
        );
        assert_eq!(
            fs.mknod(0, 0, ROOT_INODE_ID, "tty", S_IFREG | 0o600, 0, 0)
                .await,
            Err(FsError::AlreadyExists)
        );
        assert_eq!(
            fs.mknod(0, 0, ROOT_INODE_ID, "a/b", S_IFREG | 0o600, 0, 0)
                .await,
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            fs.mknod(0, 0, ROOT_INODE_ID, "..", S_IFREG | 0o600, 0, 0)
                .await,
            Err(FsError::InvalidArgument)
        );
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(
            fs.mknod(0, 0, ROOT_INODE_ID, &long, S_IFREG | 0o600, 0, 0)
                .await,
            Err(FsError::NameTooLong)
        );
        assert_eq!(
            fs.mknod(0, 0, 4242, "orphan", S_IFREG | 0o600, 0, 0).await,
            Err(FsError::NoSuchEntry)
        );
    }

    #[tokio::test]
    async fn test_write_read_round_trip_across_chunk_sizes() {
        for chunk_size in [16u32, 1000, DEFAULT_CHUNK_SIZE] {
            let fs = Wsfs::new_in_memory_with_chunk_size(chunk_size)
                .await
                .unwrap();
            let cs = chunk_size as usize;

            for (i, len) in [1, cs - 1, cs, cs + 1, 3 * cs + 7].into_iter().enumerate() {
                let id = create_file(&fs, &format!("file{i}")).await;
                let fh = fs.open(id, 0).await.unwrap().handle;
                let data = pattern(len);

                assert_eq!(fs.write(id, fh, 0, &data).await.unwrap(), len as u32);
                let read = fs.read(id, fh, 0, len as u32).await.unwrap();
                assert_eq!(read.as_ref(), data.as_slice(), "chunk={chunk_size} len={len}");

                let attrs = fs.getattr(id).await.unwrap();
                assert_eq!(attrs.size, len as u64);
                assert_eq!(attrs.blksize, chunk_size);
            }
        }
    }

    #[tokio::test]
    async fn test_overwrite_in_middle_of_chunks() {
        let fs = Wsfs::new_in_memory_with_chunk_size(8).await.unwrap();
        let id = create_file(&fs, "f").await;
        let fh = fs.open(id, 0).await.unwrap().handle;

        fs.write(id, fh, 0, b"aaaaaaaaaaaaaaaaaaaa").await.unwrap();
        fs.write(id, fh, 6, b"XYZW").await.unwrap();

        let read = fs.read(id, fh, 0, 100).await.unwrap();
        assert_eq!(read.as_ref(), b"aaaaaaXYZWaaaaaaaaaa");
        assert_eq!(fs.read(id, fh, 18, 100).await.unwrap().as_ref(), b"aa");
        assert!(fs.read(id, fh, 20, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sparse_read_returns_zeros() {
        let fs = Wsfs::new_in_memory_with_chunk_size(64).await.unwrap();
        let id = create_file(&fs, "sparse").await;
        let fh = fs.open(id, 0).await.unwrap().handle;

        fs.write(id, fh, 3 * 64, b"tail").await.unwrap();

        let head = fs.read(id, fh, 0, 3 * 64).await.unwrap();
        assert_eq!(head.len(), 3 * 64);
        assert!(head.iter().all(|b| *b == 0));

        let inode = fs.inode_store.get(id).await.unwrap().unwrap();
        let InodeKind::File(file) = inode.kind else {
            panic!("expected a file");
        };
        assert_eq!(file.chunks[..3], [None, None, None]);
        assert_eq!(file.size(), 3 * 64 + 4);

        let attrs = fs.getattr(id).await.unwrap();
        assert_eq!(attrs.blocks, 1);
    }

    #[tokio::test]
    async fn test_truncate_is_idempotent_and_zeroes_tail() {
        let fs = Wsfs::new_in_memory_with_chunk_size(16).await.unwrap();
        let id = create_file(&fs, "t").await;
        let fh = fs.open(id, 0).await.unwrap().handle;
        let data = pattern(40);
        fs.write(id, fh, 0, &data).await.unwrap();

        let shrink = SetAttributes {
            size: Some(21),
            ..Default::default()
        };
        let first = fs.setattr(id, &shrink).await.unwrap();
        let second = fs.setattr(id, &shrink).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size, 21);

        let grow = SetAttributes {
            size: Some(40),
            ..Default::default()
        };
        let grown = fs.setattr(id, &grow).await.unwrap();
        assert_eq!(grown.size, 40);

        let read = fs.read(id, fh, 0, 40).await.unwrap();
        assert_eq!(&read[..21], &data[..21]);
        assert!(read[21..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_truncate_to_chunk_boundary_and_zero() {
        let (fs, store) = fs_with_store(16).await;
        let id = create_file(&fs, "t").await;
        let fh = fs.open(id, 0).await.unwrap().handle;
        fs.write(id, fh, 0, &pattern(48)).await.unwrap();
        let with_chunks = store.len();

        let attrs = fs
            .setattr(
                id,
                &SetAttributes {
                    size: Some(32),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(attrs.size, 32);
        assert_eq!(store.len(), with_chunks - 1);

        let attrs = fs
            .setattr(
                id,
                &SetAttributes {
                    size: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(attrs.size, 0);
        assert_eq!(attrs.blocks, 0);
        assert_eq!(store.len(), with_chunks - 3);
    }

    #[tokio::test]
    async fn test_setattr_applies_only_present_fields() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let id = create_file(&fs, "f").await;
        let before = fs.getattr(id).await.unwrap();

        let after = fs
            .setattr(
                id,
                &SetAttributes {
                    mode: Some(0o600),
                    uid: Some(42),
                    mtime: Some(1_000),
                    crtime: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(after.mode, S_IFREG | 0o600);
        assert_eq!(after.uid, 42);
        assert_eq!(after.gid, before.gid);
        assert_eq!(after.mtime, 1_000);
        assert_eq!(after.crtime, 500);
        assert_eq!(after.ctime, before.ctime);
        assert_eq!(after.size, before.size);

        let dir = fs.mkdir(0, 0, ROOT_INODE_ID, "d", 0o755, 0).await.unwrap();
        assert_eq!(
            fs.setattr(
                dir.attr.ino,
                &SetAttributes {
                    size: Some(1),
                    ..Default::default()
                }
            )
            .await,
            Err(FsError::IsADirectory)
        );
    }

    #[tokio::test]
    async fn test_rmdir_requires_empty_directory() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let dir = fs.mkdir(0, 0, ROOT_INODE_ID, "docs", 0o755, 0o022).await.unwrap();
        assert_eq!(dir.attr.mode, S_IFDIR | 0o755);
        let dir_id = dir.attr.ino;

        fs.mknod(0, 0, dir_id, "a.txt", S_IFREG | 0o644, 0, 0)
            .await
            .unwrap();
        assert_eq!(fs.rmdir(ROOT_INODE_ID, "docs").await, Err(FsError::NotEmpty));
        assert_eq!(
            fs.unlink(ROOT_INODE_ID, "docs").await,
            Err(FsError::IsADirectory)
        );
        assert_eq!(fs.rmdir(dir_id, "a.txt").await, Err(FsError::NotADirectory));

        fs.unlink(dir_id, "a.txt").await.unwrap();
        fs.rmdir(ROOT_INODE_ID, "docs").await.unwrap();

        let handle = fs.opendir(ROOT_INODE_ID, 0).await.unwrap().handle;
        let names: Vec<_> = fs
            .readdir(ROOT_INODE_ID, handle, 0)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", ".."]);
        assert_eq!(
            fs.lookup(ROOT_INODE_ID, "docs").await,
            Err(FsError::NoSuchEntry)
        );
    }

    #[tokio::test]
    async fn test_readme_scenario() {
        let fs = Wsfs::new_in_memory().await.unwrap();

        let entry = fs
            .mknod(0, 0, ROOT_INODE_ID, "readme.md", S_IFREG | 0o664, 0, 0)
            .await
            .unwrap();
        let ino = entry.attr.ino;
        let fh = fs.open(ino, 0).await.unwrap().handle;
        assert_eq!(
            fs.write(ino, fh, 0, README).await.unwrap(),
            README.len() as u32
        );
        fs.release(ino, fh, 0).await.unwrap();

        let dh = fs.opendir(ROOT_INODE_ID, 0).await.unwrap().handle;
        let entries = fs.readdir(ROOT_INODE_ID, dh, 0).unwrap();
        let readme = entries
            .iter()
            .find(|e| e.name == "readme.md")
            .expect("readme.md listed");
        assert_eq!(readme.kind, S_IFREG);
        assert_eq!(readme.ino, ino);
        fs.releasedir(ROOT_INODE_ID, dh, 0).unwrap();

        let fh = fs.open(ino, 0).await.unwrap().handle;
        let data = fs.read(ino, fh, 0, 512).await.unwrap();
        assert_eq!(data.as_ref(), README);
        fs.release(ino, fh, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_hard_link_survives_unlink_of_original() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let ino = create_file(&fs, "original").await;
        let fh = fs.open(ino, 0).await.unwrap().handle;
        fs.write(ino, fh, 0, README).await.unwrap();
        fs.release(ino, fh, 0).await.unwrap();

        let linked = fs.link(ino, ROOT_INODE_ID, "alias").await.unwrap();
        assert_eq!(linked.attr.ino, ino);
        assert_eq!(linked.attr.nlink, 2);

        fs.unlink(ROOT_INODE_ID, "original").await.unwrap();
        // Drop every reference the driver holds.
        fs.forget(ino, u32::MAX).await.unwrap();

        let alias = fs.lookup(ROOT_INODE_ID, "alias").await.unwrap();
        assert_eq!(alias.attr.ino, ino);
        assert_eq!(alias.attr.nlink, 1);
        let fh = fs.open(ino, 0).await.unwrap().handle;
        assert_eq!(fs.read(ino, fh, 0, 512).await.unwrap().as_ref(), README);
    }

    #[tokio::test]
    async fn test_link_rejects_non_files_and_taken_names() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let dir = fs.mkdir(0, 0, ROOT_INODE_ID, "d", 0o755, 0).await.unwrap();
        let file = create_file(&fs, "f").await;

        assert_eq!(
            fs.link(dir.attr.ino, ROOT_INODE_ID, "d2").await,
            Err(FsError::NotPermitted)
        );
        assert_eq!(
            fs.link(file, ROOT_INODE_ID, "d").await,
            Err(FsError::AlreadyExists)
        );
        assert_eq!(
            fs.link(file, 777, "x").await,
            Err(FsError::NoSuchEntry)
        );
    }

    #[tokio::test]
    async fn test_unlinked_node_is_purged_after_last_reference() {
        let (fs, store) = fs_with_store(16).await;
        let baseline = store.len();

        let ino = create_file(&fs, "doomed").await;
        let fh = fs.open(ino, 0).await.unwrap().handle;
        fs.write(ino, fh, 0, &pattern(40)).await.unwrap();

        fs.unlink(ROOT_INODE_ID, "doomed").await.unwrap();
        // Still open and still known to the driver.
        assert_eq!(fs.read(ino, fh, 0, 40).await.unwrap().len(), 40);
        assert_eq!(fs.getattr(ino).await.unwrap().nlink, 0);

        fs.forget(ino, 1).await.unwrap();
        assert!(fs.inode_store.get(ino).await.unwrap().is_some());

        fs.release(ino, fh, 0).await.unwrap();
        assert!(fs.inode_store.get(ino).await.unwrap().is_none());
        assert_eq!(store.len(), baseline);

        // Forgetting a reclaimed node is harmless.
        fs.forget(ino, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_moves_and_replaces() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let a = fs.mkdir(0, 0, ROOT_INODE_ID, "a", 0o755, 0).await.unwrap().attr.ino;
        let b = fs.mkdir(0, 0, ROOT_INODE_ID, "b", 0o755, 0).await.unwrap().attr.ino;
        let sub = fs.mkdir(0, 0, a, "sub", 0o755, 0).await.unwrap().attr.ino;

        fs.rename(a, "sub", b, "moved", 0).await.unwrap();
        assert_eq!(
            fs.lookup(a, "sub").await,
            Err(FsError::NoSuchEntry)
        );
        assert_eq!(fs.lookup(b, "moved").await.unwrap().attr.ino, sub);
        let dh = fs.opendir(sub, 0).await.unwrap().handle;
        let parent_entry = &fs.readdir(sub, dh, 1).unwrap()[0];
        assert_eq!((parent_entry.name.as_str(), parent_entry.ino), ("..", b));

        let x = create_file(&fs, "x").await;
        let y = create_file(&fs, "y").await;
        assert_eq!(
            fs.rename(ROOT_INODE_ID, "x", ROOT_INODE_ID, "y", RENAME_NOREPLACE)
                .await,
            Err(FsError::AlreadyExists)
        );
        fs.rename(ROOT_INODE_ID, "x", ROOT_INODE_ID, "y", 0)
            .await
            .unwrap();
        assert_eq!(fs.lookup(ROOT_INODE_ID, "y").await.unwrap().attr.ino, x);
        assert_eq!(fs.getattr(y).await.unwrap().nlink, 0);

        assert_eq!(
            fs.rename(ROOT_INODE_ID, "y", ROOT_INODE_ID, "a", 0).await,
            Err(FsError::IsADirectory)
        );
        assert_eq!(
            fs.rename(ROOT_INODE_ID, "nothing", ROOT_INODE_ID, "z", 0)
                .await,
            Err(FsError::NoSuchEntry)
        );
    }

    #[tokio::test]
    async fn test_rename_rejects_cycles_and_exchange() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let a = fs.mkdir(0, 0, ROOT_INODE_ID, "a", 0o755, 0).await.unwrap().attr.ino;
        let inner = fs.mkdir(0, 0, a, "inner", 0o755, 0).await.unwrap().attr.ino;
        fs.mkdir(0, 0, ROOT_INODE_ID, "full", 0o755, 0).await.unwrap();
        let full = fs.lookup(ROOT_INODE_ID, "full").await.unwrap().attr.ino;
        create_file_in(&fs, full, "keep").await;

        assert_eq!(
            fs.rename(ROOT_INODE_ID, "a", inner, "a", 0).await,
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            fs.rename(ROOT_INODE_ID, "a", ROOT_INODE_ID, "full", 0).await,
            Err(FsError::NotEmpty)
        );
        assert_eq!(
            fs.rename(ROOT_INODE_ID, "a", ROOT_INODE_ID, "full", RENAME_EXCHANGE)
                .await,
            Err(FsError::Unsupported)
        );
    }

    async fn create_file_in(fs: &Wsfs, parent: InodeId, name: &str) -> InodeId {
        fs.mknod(0, 0, parent, name, S_IFREG | 0o644, 0, 0)
            .await
            .unwrap()
            .attr
            .ino
    }

    #[tokio::test]
    async fn test_symlink_and_readlink() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let link = fs
            .symlink(0, 0, ROOT_INODE_ID, "hosts", "/etc/hosts")
            .await
            .unwrap();
        assert_eq!(link.attr.mode, S_IFLNK | 0o777);
        assert_eq!(link.attr.size, 10);
        assert_eq!(fs.readlink(link.attr.ino).await.unwrap(), "/etc/hosts");

        let file = create_file(&fs, "plain").await;
        assert_eq!(fs.readlink(file).await, Err(FsError::NotASymlink));
        assert_eq!(
            fs.symlink(0, 0, ROOT_INODE_ID, "plain", "x").await,
            Err(FsError::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_open_and_io_type_checks() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let dir = fs.mkdir(0, 0, ROOT_INODE_ID, "d", 0o755, 0).await.unwrap().attr.ino;
        let file = create_file(&fs, "f").await;

        assert_eq!(fs.open(dir, 0).await, Err(FsError::IsADirectory));
        assert_eq!(fs.opendir(file, 0).await, Err(FsError::NotADirectory));
        assert_eq!(fs.write(dir, 1, 0, b"x").await, Err(FsError::IsADirectory));
        assert_eq!(
            fs.write(file, 1, u64::MAX - 1, b"xyz").await,
            Err(FsError::FileTooLarge)
        );
    }

    #[tokio::test]
    async fn test_directory_handles() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let b = create_file(&fs, "b").await;
        let a = fs.mkdir(0, 0, ROOT_INODE_ID, "a", 0o755, 0).await.unwrap().attr.ino;

        let handle = fs.opendir(ROOT_INODE_ID, 0).await.unwrap().handle;
        let entries = fs.readdir(ROOT_INODE_ID, handle, 0).unwrap();
        let summary: Vec<_> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.ino, e.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                (".", ROOT_INODE_ID, S_IFDIR),
                ("..", ROOT_INODE_ID, S_IFDIR),
                ("a", a, S_IFDIR),
                ("b", b, S_IFREG),
            ]
        );
        assert_eq!(fs.readdir(ROOT_INODE_ID, handle, 3).unwrap().len(), 1);
        assert!(fs.readdir(ROOT_INODE_ID, handle, 10).unwrap().is_empty());
        assert_eq!(fs.readdir(a, handle, 0), Err(FsError::BadDescriptor));

        fs.releasedir(ROOT_INODE_ID, handle, 0).unwrap();
        assert_eq!(
            fs.readdir(ROOT_INODE_ID, handle, 0),
            Err(FsError::BadDescriptor)
        );
        assert_eq!(
            fs.releasedir(ROOT_INODE_ID, handle, 0),
            Err(FsError::BadDescriptor)
        );
    }

    #[tokio::test]
    async fn test_readdirplus_takes_lookup_references() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let file = create_file(&fs, "f").await;
        fs.link(file, ROOT_INODE_ID, "g").await.unwrap();
        let before = lookups(&fs, file).await;

        let handle = fs.opendir(ROOT_INODE_ID, 0).await.unwrap().handle;
        let entries = fs
            .readdirplus(ROOT_INODE_ID, handle, 0, usize::MAX)
            .await
            .unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].1.attr.ino, file);
        assert_eq!(entries[3].1.attr.ino, file);
        assert_eq!(lookups(&fs, file).await, before + 2);
        assert_eq!(lookups(&fs, ROOT_INODE_ID).await, 0);
    }

    #[tokio::test]
    async fn test_removed_directory_accepts_no_new_names() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let dir = fs
            .mkdir(0, 0, ROOT_INODE_ID, "d", 0o755, 0)
            .await
            .unwrap()
            .attr
            .ino;
        let file = create_file(&fs, "f").await;
        fs.rmdir(ROOT_INODE_ID, "d").await.unwrap();

        assert_eq!(
            fs.mknod(0, 0, dir, "x", S_IFREG | 0o644, 0, 0).await,
            Err(FsError::NoSuchEntry)
        );
        assert_eq!(
            fs.mkdir(0, 0, dir, "sub", 0o755, 0).await,
            Err(FsError::NoSuchEntry)
        );
        assert_eq!(fs.link(file, dir, "g").await, Err(FsError::NoSuchEntry));
        assert_eq!(
            fs.rename(ROOT_INODE_ID, "f", dir, "f", 0).await,
            Err(FsError::NoSuchEntry)
        );

        fs.forget(dir, 1).await.unwrap();
        assert!(fs.inode_store.get(dir).await.unwrap().is_none());
        assert_eq!(fs.lookup(ROOT_INODE_ID, "f").await.unwrap().attr.ino, file);
    }

    #[tokio::test]
    async fn test_limited_readdirplus_references_only_returned_nodes() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let a = create_file(&fs, "a").await;
        let b = create_file(&fs, "b").await;
        let c = create_file(&fs, "c").await;
        let before = [lookups(&fs, a).await, lookups(&fs, b).await, lookups(&fs, c).await];

        let handle = fs.opendir(ROOT_INODE_ID, 0).await.unwrap().handle;
        let entries = fs.readdirplus(ROOT_INODE_ID, handle, 2, 2).await.unwrap();
        let names: Vec<_> = entries.iter().map(|(e, _)| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert_eq!(lookups(&fs, a).await, before[0] + 1);
        assert_eq!(lookups(&fs, b).await, before[1] + 1);
        assert_eq!(lookups(&fs, c).await, before[2]);

        let rest = fs.readdirplus(ROOT_INODE_ID, handle, 4, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(lookups(&fs, c).await, before[2] + 1);
    }

    #[tokio::test]
    async fn test_xattr_operations() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let id = create_file(&fs, "f").await;

        fs.setxattr(id, "user.b", b"2", 0).await.unwrap();
        fs.setxattr(id, "user.a", b"1", XATTR_CREATE).await.unwrap();
        assert_eq!(
            fs.setxattr(id, "user.a", b"x", XATTR_CREATE).await,
            Err(FsError::AlreadyExists)
        );
        assert_eq!(
            fs.setxattr(id, "user.c", b"x", XATTR_REPLACE).await,
            Err(FsError::NoSuchAttribute)
        );
        fs.setxattr(id, "user.a", b"one", XATTR_REPLACE)
            .await
            .unwrap();

        assert_eq!(fs.getxattr(id, "user.a").await.unwrap(), b"one");
        assert_eq!(
            fs.listxattr(id).await.unwrap(),
            vec!["user.a".to_string(), "user.b".to_string()]
        );

        fs.removexattr(id, "user.a").await.unwrap();
        assert_eq!(
            fs.getxattr(id, "user.a").await,
            Err(FsError::NoSuchAttribute)
        );
        assert_eq!(
            fs.removexattr(id, "user.a").await,
            Err(FsError::NoSuchAttribute)
        );
    }

    #[tokio::test]
    async fn test_create_opens_file() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let reply = fs
            .create(5, 6, ROOT_INODE_ID, "new", 0o666, 0o022, 0)
            .await
            .unwrap();
        assert_eq!(reply.entry.attr.mode, S_IFREG | 0o644);
        assert_ne!(reply.open.handle, 0);

        let ino = reply.entry.attr.ino;
        fs.write(ino, reply.open.handle, 0, b"hello").await.unwrap();
        fs.release(ino, reply.open.handle, 0).await.unwrap();
        assert_eq!(
            fs.read(ino, 0, 0, 16).await.unwrap().as_ref(),
            b"hello"
        );
        assert_eq!(
            fs.create(0, 0, ROOT_INODE_ID, "new", 0o644, 0, 0).await,
            Err(FsError::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_statfs_reports_usage() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let empty = fs.statfs().await.unwrap();
        assert_eq!(empty.bsize, DEFAULT_BLOCK_SIZE);
        assert_eq!(empty.frsize, DEFAULT_BLOCK_SIZE);
        assert_eq!(empty.namelen, NAME_MAX as u32);
        assert_eq!(empty.blocks, (1u64 << 30) / DEFAULT_BLOCK_SIZE as u64);
        assert!(empty.bfree < empty.blocks);
        assert_eq!(empty.bavail, empty.bfree);

        let id = create_file(&fs, "big").await;
        fs.write(id, 0, 0, &pattern(8 * DEFAULT_CHUNK_SIZE as usize))
            .await
            .unwrap();
        let used = fs.statfs().await.unwrap();
        assert!(used.bfree <= empty.bfree - 8);
        assert_eq!(used.files, empty.files + 1);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let (fs, store) = fs_with_store(32).await;
        let id = create_file(&fs, "kept").await;
        fs.write(id, 0, 0, README).await.unwrap();
        drop(fs);

        let reopened = Wsfs::new(store.clone(), FsOptions::default()).await.unwrap();
        let entry = reopened.lookup(ROOT_INODE_ID, "kept").await.unwrap();
        assert_eq!(entry.attr.ino, id);
        assert_eq!(entry.attr.blksize, 32);
        assert_eq!(
            reopened.read(id, 0, 0, 512).await.unwrap().as_ref(),
            README
        );

        let next = create_file(&reopened, "next").await;
        assert_eq!(next, id + 1);
    }

    #[tokio::test]
    async fn test_access_flush_fsync_validate_inode() {
        let fs = Wsfs::new_in_memory().await.unwrap();
        let id = create_file(&fs, "f").await;

        fs.access(id, 0o4).await.unwrap();
        fs.flush(id, 1).await.unwrap();
        fs.fsync(id, 1, true).await.unwrap();
        assert_eq!(fs.access(999, 0).await, Err(FsError::NoSuchEntry));
        assert_eq!(fs.fsync(999, 1, false).await, Err(FsError::NoSuchEntry));
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_chunk_list_consistent() {
        let fs = Arc::new(Wsfs::new_in_memory_with_chunk_size(8).await.unwrap());
        let id = create_file(&fs, "shared").await;

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let fs = fs.clone();
            tasks.push(tokio::spawn(async move {
                fs.write(id, 0, i as u64 * 8, &[b'a' + i; 8]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let data = fs.read(id, 0, 0, 64).await.unwrap();
        for i in 0..8usize {
            assert!(data[i * 8..(i + 1) * 8].iter().all(|b| *b == b'a' + i as u8));
        }
    }
}
