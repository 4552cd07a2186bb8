//! FIFO queue of orphaned key ranges pending physical deletion.
//!
//! Ranges are deleted strictly in enqueue order, one bounded batch per
//! scheduling slot, with a majority-replication wait after every batch so
//! the queue never races ahead of durability. Each queued range carries a
//! shared notification that resolves exactly once when the range finishes
//! (or when the queue is torn down).

use std::collections::VecDeque;

use crate::error::{CleanupError, CleanupStatus};
use crate::notification::CleanupNotification;
use crate::range::{ChunkRange, KeyPattern};
use crate::store::CollectionHandle;

pub(crate) struct Deletion {
    pub range: ChunkRange,
    pub notification: CleanupNotification,
}

/// Per-collection deletion queue. Lives inside the metadata manager's state
/// mutex; every mutating call happens with that lock held.
#[derive(Default)]
pub struct RangeDeletionQueue {
    orphans: VecDeque<Deletion>,
}

impl RangeDeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a range to the tail. Overlapping or duplicate ranges are not
    /// merged; a second entry simply deletes zero documents for keys the
    /// first already removed.
    pub fn add(&mut self, range: ChunkRange) {
        self.orphans.push_back(Deletion {
            range,
            notification: CleanupNotification::pending(),
        });
    }

    /// Notification of the most recently queued entry overlapping `range`.
    ///
    /// Entries drain oldest-first, so completion of the newest overlapping
    /// entry subsumes every older one queued before it. Returns an
    /// already-resolved success when nothing overlaps.
    pub fn overlaps(&self, range: &ChunkRange) -> CleanupNotification {
        self.orphans
            .iter()
            .rev()
            .find(|deletion| deletion.range.overlaps(range))
            .map(|deletion| deletion.notification.clone())
            .unwrap_or_else(|| CleanupNotification::ready(Ok(())))
    }

    pub fn size(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Pending ranges in deletion order, for diagnostics.
    pub fn pending_ranges(&self) -> Vec<ChunkRange> {
        self.orphans.iter().map(|d| d.range.clone()).collect()
    }

    pub(crate) fn head_range(&self) -> Option<ChunkRange> {
        self.orphans.front().map(|d| d.range.clone())
    }

    /// Drop the head entry, waking anything waiting on its completion.
    pub(crate) fn pop_head(&mut self, status: CleanupStatus) {
        if let Some(head) = self.orphans.pop_front() {
            head.notification.set(status);
        }
    }

    /// Resolve every still-pending notification with success and empty the
    /// queue. Deletion was not attempted for the remaining entries, so there
    /// is no failure to report; waiters just stop waiting.
    pub fn clear(&mut self) {
        for deletion in self.orphans.drain(..) {
            deletion.notification.set(Ok(()));
        }
    }
}

impl Drop for RangeDeletionQueue {
    fn drop(&mut self) {
        // Wake anybody sleeping on orphan ranges.
        self.clear();
    }
}

/// Delete up to `max_to_delete` documents of `range` from the collection,
/// and report how many were removed. Zero means the range is now empty.
///
/// One document per unit of work, in index order, through a fresh bounded
/// forward scan per document. A scan death mid-range stops this pass and
/// leaves the remainder for the next one.
pub(crate) fn do_deletion(
    coll: &dyn CollectionHandle,
    shard_key: &KeyPattern,
    range: &ChunkRange,
    max_to_delete: u64,
) -> Result<u64, CleanupError> {
    let Some(index) = coll.shard_key_index(shard_key) else {
        let err = CleanupError::ShardIndexNotFound {
            collection: coll.name().to_string(),
            key_pattern: shard_key.to_string(),
        };
        tracing::info!(collection = %coll.name(), key_pattern = %shard_key, "unable to find shard key index");
        return Err(err);
    };

    // The shard key may be a prefix of a longer index key; widen the bounds
    // to the index we actually scan.
    let (min, max) = index.extend_range_bounds(range);

    tracing::debug!(
        collection = %coll.name(),
        range = %range,
        index = %index.name,
        "beginning removal of orphaned range"
    );

    let Some(index) = coll.index_by_name(&index.name) else {
        tracing::info!(collection = %coll.name(), index = %index.name, "shard key index was dropped during range deletion");
        return Err(CleanupError::ShardIndexDropped {
            collection: coll.name().to_string(),
            index: index.name,
        });
    };

    let mut deleted = 0u64;
    loop {
        // Deleting invalidates the cursor position, so open a fresh bounded
        // scan for each document.
        let mut scan = coll.scan_index(&index, &min, &max)?;
        let next = match scan.next() {
            Ok(next) => next,
            Err(err) => {
                tracing::warn!(
                    collection = %coll.name(),
                    range = %range,
                    deleted,
                    error = %err,
                    "cursor error while deleting orphaned range, stopping this pass"
                );
                break;
            }
        };
        let Some(id) = next else {
            break; // range exhausted
        };
        drop(scan);

        coll.delete_document(id)?;
        deleted += 1;
        if deleted >= max_to_delete {
            break;
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::{CollectionName, DocumentStore, LockMode};
    use std::sync::Arc;

    fn range(min: &str, max: &str) -> ChunkRange {
        ChunkRange::new(min.as_bytes().to_vec(), max.as_bytes().to_vec())
    }

    #[test]
    fn ranges_pop_in_enqueue_order() {
        let mut queue = RangeDeletionQueue::new();
        queue.add(range("a", "b"));
        queue.add(range("b", "c"));
        queue.add(range("c", "d"));
        assert_eq!(queue.size(), 3);

        assert_eq!(queue.head_range(), Some(range("a", "b")));
        queue.pop_head(Ok(()));
        assert_eq!(queue.head_range(), Some(range("b", "c")));
        queue.pop_head(Ok(()));
        assert_eq!(queue.head_range(), Some(range("c", "d")));
        queue.pop_head(Ok(()));
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_resolves_head_notification_with_status() {
        let mut queue = RangeDeletionQueue::new();
        queue.add(range("a", "m"));
        queue.add(range("m", "z"));
        let first = queue.overlaps(&range("a", "b"));
        let second = queue.overlaps(&range("m", "n"));

        queue.pop_head(Err(CleanupError::Storage("disk on fire".into())));
        assert_eq!(
            first.get(),
            Some(Err(CleanupError::Storage("disk on fire".into())))
        );
        assert!(!second.is_resolved());

        queue.pop_head(Ok(()));
        assert_eq!(second.get(), Some(Ok(())));
    }

    #[test]
    fn overlaps_prefers_newest_entry() {
        let mut queue = RangeDeletionQueue::new();
        queue.add(range("a", "m"));
        queue.add(range("h", "z"));

        // Both entries overlap; the notification must belong to the newest.
        let notification = queue.overlaps(&range("i", "j"));
        queue.pop_head(Ok(())); // resolves the oldest only
        assert!(!notification.is_resolved());
        queue.pop_head(Ok(()));
        assert_eq!(notification.get(), Some(Ok(())));
    }

    #[test]
    fn overlaps_without_match_is_resolved_success() {
        let mut queue = RangeDeletionQueue::new();
        queue.add(range("a", "b"));
        assert_eq!(queue.overlaps(&range("x", "z")).get(), Some(Ok(())));
    }

    #[test]
    fn clear_wakes_all_waiters_with_success() {
        let mut queue = RangeDeletionQueue::new();
        queue.add(range("a", "b"));
        queue.add(range("b", "c"));
        let n1 = queue.overlaps(&range("a", "b"));
        let n2 = queue.overlaps(&range("b", "c"));

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(n1.get(), Some(Ok(())));
        assert_eq!(n2.get(), Some(Ok(())));
    }

    #[test]
    fn drop_wakes_waiters() {
        let mut queue = RangeDeletionQueue::new();
        queue.add(range("a", "b"));
        let n = queue.overlaps(&range("a", "b"));
        drop(queue);
        assert_eq!(n.get(), Some(Ok(())));
    }

    fn store_with_keys(keys: &[&str]) -> (Arc<MemoryStore>, CollectionName) {
        let store = Arc::new(MemoryStore::new());
        let name = CollectionName::new("db", "coll");
        let coll = store.create_collection(name.clone(), vec![KeyPattern::new(["k"])]);
        for key in keys {
            coll.insert(key.as_bytes().to_vec());
        }
        (store, name)
    }

    #[test]
    fn do_deletion_removes_in_index_order_up_to_budget() {
        let (store, name) = store_with_keys(&["a", "b", "c", "d", "e"]);
        let coll = store
            .open_collection(&name, LockMode::IntentExclusive)
            .expect("collection exists");

        let deleted = do_deletion(coll.as_ref(), &KeyPattern::new(["k"]), &range("a", "e"), 3)
            .expect("deletion succeeds");
        assert_eq!(deleted, 3);

        let remaining = store.collection(&name).expect("collection").keys();
        assert_eq!(remaining, vec![b"d".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn do_deletion_on_cleared_range_is_idempotent() {
        let (store, name) = store_with_keys(&["a", "b"]);
        let coll = store
            .open_collection(&name, LockMode::IntentExclusive)
            .expect("collection exists");
        let shard_key = KeyPattern::new(["k"]);

        assert_eq!(
            do_deletion(coll.as_ref(), &shard_key, &range("a", "z"), 10).expect("first pass"),
            2
        );
        assert_eq!(
            do_deletion(coll.as_ref(), &shard_key, &range("a", "z"), 10).expect("second pass"),
            0
        );
        assert_eq!(
            do_deletion(coll.as_ref(), &shard_key, &range("a", "z"), 10).expect("third pass"),
            0
        );
    }

    #[test]
    fn do_deletion_without_shard_index_is_an_internal_error() {
        let (store, name) = store_with_keys(&["a"]);
        let coll = store
            .open_collection(&name, LockMode::IntentExclusive)
            .expect("collection exists");

        let err = do_deletion(
            coll.as_ref(),
            &KeyPattern::new(["not_indexed"]),
            &range("a", "z"),
            10,
        )
        .expect_err("no index serves this key pattern");
        assert!(matches!(err, CleanupError::ShardIndexNotFound { .. }));
    }

    #[test]
    fn scan_death_stops_the_pass_and_keeps_partial_progress() {
        let (store, name) = store_with_keys(&["a", "b", "c", "d"]);
        let coll_ref = store.collection(&name).expect("collection");
        let coll = store
            .open_collection(&name, LockMode::IntentExclusive)
            .expect("collection exists");
        let shard_key = KeyPattern::new(["k"]);

        // Fail the third scan of the pass: two documents go, then the cursor
        // dies and the pass reports partial progress instead of an error.
        coll_ref.fail_scan_after(2);
        let deleted =
            do_deletion(coll.as_ref(), &shard_key, &range("a", "z"), 10).expect("non-fatal");
        assert_eq!(deleted, 2);
        assert_eq!(coll_ref.len(), 2);

        // The next pass picks the range back up from the start.
        let deleted =
            do_deletion(coll.as_ref(), &shard_key, &range("a", "z"), 10).expect("retry pass");
        assert_eq!(deleted, 2);
        assert!(coll_ref.is_empty());
    }

    #[test]
    fn shard_key_prefix_resolves_longer_index() {
        let store = Arc::new(MemoryStore::new());
        let name = CollectionName::new("db", "coll");
        let coll_ref = store.create_collection(
            name.clone(),
            vec![KeyPattern::new(["user_id", "created_at"])],
        );
        coll_ref.insert(b"u1".to_vec());
        coll_ref.insert(b"u2".to_vec());

        let coll = store
            .open_collection(&name, LockMode::IntentExclusive)
            .expect("collection exists");
        let deleted = do_deletion(
            coll.as_ref(),
            &KeyPattern::new(["user_id"]),
            &range("u1", "u2"),
            10,
        )
        .expect("prefix index serves the shard key");
        assert_eq!(deleted, 1);
        assert_eq!(coll_ref.keys(), vec![b"u2".to_vec()]);
    }
}
