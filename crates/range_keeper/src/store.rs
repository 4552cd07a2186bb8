//! Seams to the host node's document store and replication facility.
//!
//! The cleanup engine never talks to storage directly; the node implements
//! these traits over its real engine. [`crate::memory`] provides an
//! in-memory implementation for embedding and tests.

use std::fmt;

use async_trait::async_trait;

use crate::error::CleanupError;
use crate::range::{ChunkRange, KeyPattern};

/// Fully qualified collection name, `db.coll`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionName {
    db: String,
    coll: String,
}

impl CollectionName {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Lock strength requested when opening a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    IntentShared,
    IntentExclusive,
    Exclusive,
}

/// Opaque storage-level document locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub u64);

/// An index resolved on a collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardIndexDesc {
    pub name: String,
    pub key_pattern: KeyPattern,
}

impl ShardIndexDesc {
    /// Extend shard-key range bounds to this index's full key pattern.
    ///
    /// Keys are order-preserving encodings and the shard key is a leading
    /// prefix of the index key, so the encoded bounds carry over unchanged.
    pub fn extend_range_bounds(&self, range: &ChunkRange) -> (Vec<u8>, Vec<u8>) {
        (range.min().to_vec(), range.max().to_vec())
    }
}

/// Forward, bounded index scan with caller-controlled pacing. `Err` from
/// `next` means the scan died mid-range (non-fatal to the range; the caller
/// retries the range from the start on its next pass).
pub trait RangeScan: Send {
    fn next(&mut self) -> Result<Option<RecordId>, CleanupError>;
}

/// A collection opened under a lock. Dropping the handle releases the lock.
pub trait CollectionHandle: Send + Sync {
    fn name(&self) -> &CollectionName;

    /// The index whose key pattern the shard key prefixes, if any.
    fn shard_key_index(&self, shard_key: &KeyPattern) -> Option<ShardIndexDesc>;

    /// Re-resolve an index by name; `None` means it was dropped concurrently.
    fn index_by_name(&self, name: &str) -> Option<ShardIndexDesc>;

    /// Open a forward scan over `[min, max)` in `index` order.
    fn scan_index(
        &self,
        index: &ShardIndexDesc,
        min: &[u8],
        max: &[u8],
    ) -> Result<Box<dyn RangeScan + '_>, CleanupError>;

    /// Delete one document in its own unit of work. Write conflicts are
    /// retried inside the store and never surface here.
    fn delete_document(&self, id: RecordId) -> Result<(), CleanupError>;
}

/// The host node's document store.
pub trait DocumentStore: Send + Sync + 'static {
    /// `None` means the collection does not exist (e.g. dropped while
    /// cleanup work was still queued).
    fn open_collection<'a>(
        &'a self,
        name: &CollectionName,
        mode: LockMode,
    ) -> Option<Box<dyn CollectionHandle + 'a>>;
}

/// Majority durability acknowledgement for this task's preceding writes.
#[async_trait]
pub trait ReplicationWaiter: Send + Sync + 'static {
    async fn wait_for_majority(&self) -> Result<(), CleanupError>;
}
