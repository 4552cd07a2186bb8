//! In-memory document store implementing the collaborator seams.
//!
//! Useful for embedding the cleanup engine without a real storage backend
//! and for driving its tests. Scan-fault injection mimics a cursor dying
//! mid-range.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::error::CleanupError;
use crate::range::KeyPattern;
use crate::store::{
    CollectionHandle, CollectionName, DocumentStore, LockMode, RangeScan, RecordId,
    ReplicationWaiter, ShardIndexDesc,
};

/// In-memory multi-collection store.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<CollectionName, Arc<MemoryCollection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_collection(
        &self,
        name: CollectionName,
        indexes: Vec<KeyPattern>,
    ) -> Arc<MemoryCollection> {
        let coll = Arc::new(MemoryCollection::new(name.clone(), indexes));
        self.collections
            .write()
            .expect("collections lock")
            .insert(name, coll.clone());
        coll
    }

    pub fn drop_collection(&self, name: &CollectionName) {
        self.collections
            .write()
            .expect("collections lock")
            .remove(name);
    }

    pub fn collection(&self, name: &CollectionName) -> Option<Arc<MemoryCollection>> {
        self.collections
            .read()
            .expect("collections lock")
            .get(name)
            .cloned()
    }
}

impl DocumentStore for MemoryStore {
    fn open_collection<'a>(
        &'a self,
        name: &CollectionName,
        _mode: LockMode,
    ) -> Option<Box<dyn CollectionHandle + 'a>> {
        let coll = self.collection(name)?;
        Some(Box::new(MemoryCollectionHandle { coll }))
    }
}

struct Rows {
    by_key: BTreeMap<Vec<u8>, RecordId>,
    by_id: HashMap<RecordId, Vec<u8>>,
}

/// One collection: documents keyed by their encoded shard key.
pub struct MemoryCollection {
    name: CollectionName,
    indexes: Mutex<Vec<ShardIndexDesc>>,
    rows: Mutex<Rows>,
    next_id: AtomicU64,
    /// `Some(n)`: the n-th scan opened from now fails, then the fault clears.
    scan_fault: Mutex<Option<u64>>,
    deleted_keys: Mutex<Vec<Vec<u8>>>,
}

impl MemoryCollection {
    fn new(name: CollectionName, indexes: Vec<KeyPattern>) -> Self {
        let indexes = indexes
            .into_iter()
            .map(|key_pattern| ShardIndexDesc {
                name: index_name(&key_pattern),
                key_pattern,
            })
            .collect();
        Self {
            name,
            indexes: Mutex::new(indexes),
            rows: Mutex::new(Rows {
                by_key: BTreeMap::new(),
                by_id: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            scan_fault: Mutex::new(None),
            deleted_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, key: impl Into<Vec<u8>>) {
        let key = key.into();
        let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut rows = self.rows.lock().expect("rows lock");
        if let Some(old) = rows.by_key.insert(key.clone(), id) {
            rows.by_id.remove(&old);
        }
        rows.by_id.insert(id, key);
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.rows
            .lock()
            .expect("rows lock")
            .by_key
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("rows lock").by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys in index order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.rows
            .lock()
            .expect("rows lock")
            .by_key
            .keys()
            .cloned()
            .collect()
    }

    /// Keys in the order the engine deleted them.
    pub fn deleted_keys(&self) -> Vec<Vec<u8>> {
        self.deleted_keys.lock().expect("deleted keys lock").clone()
    }

    /// Make the scan opened after the next `after` successful ones die on
    /// its first fetch, one-shot.
    pub fn fail_scan_after(&self, after: u64) {
        *self.scan_fault.lock().expect("scan fault lock") = Some(after);
    }

    fn claim_scan_fault(&self) -> bool {
        let mut fault = self.scan_fault.lock().expect("scan fault lock");
        match fault.as_mut() {
            Some(0) => {
                *fault = None;
                true
            }
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        }
    }
}

fn index_name(pattern: &KeyPattern) -> String {
    let mut name = pattern.fields().join("_1_");
    name.push_str("_1");
    name
}

struct MemoryCollectionHandle {
    coll: Arc<MemoryCollection>,
}

impl CollectionHandle for MemoryCollectionHandle {
    fn name(&self) -> &CollectionName {
        &self.coll.name
    }

    fn shard_key_index(&self, shard_key: &KeyPattern) -> Option<ShardIndexDesc> {
        self.coll
            .indexes
            .lock()
            .expect("indexes lock")
            .iter()
            .find(|idx| shard_key.is_prefix_of(&idx.key_pattern))
            .cloned()
    }

    fn index_by_name(&self, name: &str) -> Option<ShardIndexDesc> {
        self.coll
            .indexes
            .lock()
            .expect("indexes lock")
            .iter()
            .find(|idx| idx.name == name)
            .cloned()
    }

    fn scan_index(
        &self,
        _index: &ShardIndexDesc,
        min: &[u8],
        max: &[u8],
    ) -> Result<Box<dyn RangeScan + '_>, CleanupError> {
        let fail = self.coll.claim_scan_fault();
        let ids = self
            .coll
            .rows
            .lock()
            .expect("rows lock")
            .by_key
            .range(min.to_vec()..max.to_vec())
            .map(|(_, id)| *id)
            .collect();
        Ok(Box::new(MemoryScan { ids, pos: 0, fail }))
    }

    fn delete_document(&self, id: RecordId) -> Result<(), CleanupError> {
        let mut rows = self.coll.rows.lock().expect("rows lock");
        let Some(key) = rows.by_id.remove(&id) else {
            return Err(CleanupError::Storage(format!(
                "record {id:?} not found in {}",
                self.coll.name
            )));
        };
        rows.by_key.remove(&key);
        drop(rows);
        self.coll
            .deleted_keys
            .lock()
            .expect("deleted keys lock")
            .push(key);
        Ok(())
    }
}

struct MemoryScan {
    ids: Vec<RecordId>,
    pos: usize,
    fail: bool,
}

impl RangeScan for MemoryScan {
    fn next(&mut self) -> Result<Option<RecordId>, CleanupError> {
        if self.fail {
            return Err(CleanupError::Storage("injected scan failure".into()));
        }
        let next = self.ids.get(self.pos).copied();
        self.pos += 1;
        Ok(next)
    }
}

/// Replication waiter that acknowledges immediately, for single-node use.
#[derive(Default)]
pub struct NoopReplication;

#[async_trait]
impl ReplicationWaiter for NoopReplication {
    async fn wait_for_majority(&self) -> Result<(), CleanupError> {
        Ok(())
    }
}
