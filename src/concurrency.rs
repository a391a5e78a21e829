/// Shared access to one index: many readers, a single writer.
///
/// Tree operations assume the caller holds the right lock for the subtree
/// they touch. `SharedArt` takes that lock for the whole tree.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::art::key::ArtKey;
use crate::art::leaf::RowId;
use crate::art::Art;
use crate::error::Result;
use crate::storage::block::BlockPointer;
use crate::storage::block_manager::BlockManager;

/// Cloneable handle to an index guarded by a `parking_lot::RwLock`.
#[derive(Clone, Default)]
pub struct SharedArt {
    inner: Arc<RwLock<Art>>,
}

impl SharedArt {
    pub fn new(art: Art) -> Self {
        SharedArt {
            inner: Arc::new(RwLock::new(art)),
        }
    }

    /// Acquire a shared (read) lock.
    pub fn read(&self) -> RwLockReadGuard<'_, Art> {
        self.inner.read()
    }

    /// Acquire an exclusive (write) lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, Art> {
        self.inner.write()
    }

    /// Row ids stored under `key`, copied out so the lock is not held.
    pub fn lookup(&self, key: &ArtKey) -> Option<Vec<RowId>> {
        self.inner.read().lookup(key).map(<[RowId]>::to_vec)
    }

    pub fn insert(&self, key: &ArtKey, row_id: RowId) -> Result<()> {
        self.inner.write().insert(key, row_id)
    }

    pub fn erase(&self, key: &ArtKey, row_id: RowId) -> Result<bool> {
        self.inner.write().erase(key, row_id)
    }

    pub fn vacuum(&self) -> Result<()> {
        self.inner.write().vacuum()
    }

    /// Persist the tree. Writers are blocked until the checkpoint is done.
    pub fn checkpoint<M: BlockManager + ?Sized>(&self, manager: &mut M) -> Result<BlockPointer> {
        self.inner.write().checkpoint(manager)
    }

    /// Unwrap the index once every other handle has been dropped.
    pub fn try_into_inner(self) -> std::result::Result<Art, SharedArt> {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => Ok(lock.into_inner()),
            Err(inner) => Err(SharedArt { inner }),
        }
    }
}
