//! Collection metadata lifecycle: ownership snapshots, reader reference
//! tracking, inbound migrations, and orphan-range disposal.
//!
//! One manager per sharded collection per node. All state transitions run
//! under a single mutex held only for short, non-blocking sections; scans,
//! deletes, and replication waits happen in the background deletion pass
//! with the mutex released.
//!
//! Safety model for orphan ranges:
//! - a range is queued for deletion only once no reader can still depend on
//!   it through the active snapshot or any superseded one,
//! - a range displaced from ownership while its snapshot still has live
//!   readers is parked as that tracker's single deferred orphan and queued
//!   when the tracker retires,
//! - the deletion queue drains strictly FIFO, one replication-acknowledged
//!   batch per scheduling slot.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;

use crate::deletion_queue::{do_deletion, RangeDeletionQueue};
use crate::error::CleanupStatus;
use crate::notification::CleanupNotification;
use crate::range::{ChunkInfo, ChunkRange, ChunkVersion, OwnershipSnapshot};
use crate::store::{CollectionHandle, CollectionName, DocumentStore, LockMode, ReplicationWaiter};

/// Tuning for the background deletion pipeline.
#[derive(Debug)]
pub struct CleanupConfig {
    batch_size: AtomicU64,
    /// Pause between successive deletion passes over the same queue.
    pub pass_delay: Duration,
}

impl CleanupConfig {
    pub const DEFAULT_BATCH_SIZE: u64 = 128;

    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size: AtomicU64::new(batch_size.max(1)),
            pass_delay: Duration::ZERO,
        }
    }

    /// Max documents deleted per scheduling slot. Read fresh on every pass,
    /// so the knob is tunable at runtime.
    pub fn batch_size(&self) -> u64 {
        self.batch_size.load(Ordering::Relaxed).max(1)
    }

    pub fn set_batch_size(&self, batch_size: u64) {
        self.batch_size.store(batch_size.max(1), Ordering::Relaxed);
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BATCH_SIZE)
    }
}

type TrackerId = u64;

/// One ownership snapshot plus the bookkeeping that keeps it alive:
/// how many scoped handles reference it, and at most one orphaned range
/// whose deletion was deferred until those handles release.
struct Tracker {
    metadata: Option<Arc<OwnershipSnapshot>>,
    usage_count: u64,
    orphans: Option<ChunkRange>,
}

impl Tracker {
    fn new(metadata: Option<Arc<OwnershipSnapshot>>) -> Self {
        Self {
            metadata,
            usage_count: 0,
            orphans: None,
        }
    }
}

struct ManagerState {
    next_tracker_id: TrackerId,
    /// Authoritative tracker; its metadata is `None` while unsharded.
    active: TrackerId,
    trackers: BTreeMap<TrackerId, Tracker>,
    /// Superseded trackers still alive for in-flight readers, oldest first.
    in_use: VecDeque<TrackerId>,
    /// Chunks mid-migration into this node, keyed by range min.
    receiving: BTreeMap<Vec<u8>, ChunkInfo>,
    ranges_to_clean: RangeDeletionQueue,
    /// Replaced whenever in-use trackers retire, so waiters can re-check.
    generation: CleanupNotification,
}

impl ManagerState {
    fn active_tracker(&self) -> &Tracker {
        self.trackers.get(&self.active).expect("active tracker")
    }

    fn active_tracker_mut(&mut self) -> &mut Tracker {
        self.trackers.get_mut(&self.active).expect("active tracker")
    }

    /// Replace the active tracker. The displaced one stays alive only if a
    /// reader still references it or it holds an undispatched orphan.
    fn set_active_metadata(&mut self, metadata: Option<Arc<OwnershipSnapshot>>) {
        let old = self.active;
        let keep = {
            let tracker = self.trackers.get(&old).expect("active tracker");
            tracker.usage_count != 0 || tracker.orphans.is_some()
        };
        if keep {
            self.in_use.push_back(old);
        } else {
            self.trackers.remove(&old);
        }

        let id = self.next_tracker_id;
        self.next_tracker_id += 1;
        self.trackers.insert(id, Tracker::new(metadata));
        self.active = id;
    }

    /// Does `range` overlap a chunk in any snapshot with live readers?
    fn overlaps_in_use_chunk(&self, range: &ChunkRange) -> bool {
        let referenced = |id: &TrackerId| {
            let tracker = &self.trackers[id];
            tracker.usage_count != 0
                && tracker
                    .metadata
                    .as_ref()
                    .is_some_and(|m| m.range_overlaps_chunk(range))
        };
        referenced(&self.active) || self.in_use.iter().any(referenced)
    }

    /// Does `range` overlap a deferred orphan on any live tracker?
    fn overlaps_in_use_cleanups(&self, range: &ChunkRange) -> bool {
        let deferred = |id: &TrackerId| {
            self.trackers[id]
                .orphans
                .as_ref()
                .is_some_and(|orphan| orphan.overlaps(range))
        };
        deferred(&self.active) || self.in_use.iter().any(deferred)
    }

    /// Wake generation waiters and start a new generation.
    fn notify_in_use(&mut self) {
        self.generation.set(Ok(()));
        self.generation = CleanupNotification::pending();
    }
}

struct ManagerInner {
    collection: CollectionName,
    store: Arc<dyn DocumentStore>,
    replication: Arc<dyn ReplicationWaiter>,
    runtime: Handle,
    config: Arc<CleanupConfig>,
    state: Mutex<ManagerState>,
}

/// Owns the chunk-ownership lifecycle for one collection on this node.
///
/// Lives as long as the node believes the collection is sharded locally;
/// dropping it tears down the deletion queue and wakes every waiter with
/// success.
pub struct MetadataManager {
    inner: Arc<ManagerInner>,
}

impl MetadataManager {
    pub fn new(
        collection: CollectionName,
        store: Arc<dyn DocumentStore>,
        replication: Arc<dyn ReplicationWaiter>,
        runtime: Handle,
        config: Arc<CleanupConfig>,
    ) -> Self {
        let mut trackers = BTreeMap::new();
        trackers.insert(0, Tracker::new(None));
        Self {
            inner: Arc::new(ManagerInner {
                collection,
                store,
                replication,
                runtime,
                config,
                state: Mutex::new(ManagerState {
                    next_tracker_id: 1,
                    active: 0,
                    trackers,
                    in_use: VecDeque::new(),
                    receiving: BTreeMap::new(),
                    ranges_to_clean: RangeDeletionQueue::new(),
                    generation: CleanupNotification::pending(),
                }),
            }),
        }
    }

    pub fn collection(&self) -> &CollectionName {
        &self.inner.collection
    }

    /// Borrow the active snapshot, bumping its tracker's reference count.
    pub fn get_active_metadata(&self) -> ScopedCollectionMetadata {
        let mut state = self.inner.lock_state();
        let id = state.active;
        let tracker = state.active_tracker_mut();
        tracker.usage_count += 1;
        ScopedCollectionMetadata {
            manager: self.inner.clone(),
            tracker: id,
            snapshot: tracker.metadata.clone(),
        }
    }

    /// Install a fresher ownership snapshot, or `None` when the collection
    /// is no longer sharded.
    pub fn refresh_active_metadata(&self, remote: Option<OwnershipSnapshot>) {
        let mut guard = self.inner.lock_state();
        let state = &mut *guard;
        let active_metadata = state.active_tracker().metadata.clone();

        // Never sharded in the first place; every caller path refreshes
        // regardless of whether the collection is sharded, so stay quiet.
        if remote.is_none() && active_metadata.is_none() {
            assert!(
                state.receiving.is_empty(),
                "receiving chunks tracked for an unsharded collection"
            );
            assert!(
                state.ranges_to_clean.is_empty(),
                "deletion queue non-empty for an unsharded collection"
            );
            return;
        }

        // Collection is becoming unsharded: discard tracking wholesale.
        let Some(remote) = remote else {
            let active = active_metadata.expect("sharded metadata");
            tracing::info!(
                collection = %self.inner.collection,
                metadata = %active,
                "marking collection as no longer sharded"
            );
            state.receiving.clear();
            state.ranges_to_clean.clear();
            state.set_active_metadata(None);
            return;
        };

        // Collection is becoming sharded.
        let Some(active) = active_metadata else {
            assert!(
                state.receiving.is_empty(),
                "receiving chunks tracked before the first ownership snapshot"
            );
            assert!(
                state.ranges_to_clean.is_empty(),
                "deletion queue non-empty before the first ownership snapshot"
            );
            tracing::info!(
                collection = %self.inner.collection,
                metadata = %remote,
                "marking collection as sharded"
            );
            state.set_active_metadata(Some(Arc::new(remote)));
            return;
        };

        // Versions are monotonic; a stale or duplicate refresh is a no-op.
        if active.version() >= remote.version() {
            tracing::debug!(
                collection = %self.inner.collection,
                active = %active,
                remote = %remote,
                "ignoring refresh of active metadata with an older version"
            );
            return;
        }

        tracing::info!(
            collection = %self.inner.collection,
            from = %active,
            to = %remote,
            "refreshing collection metadata"
        );

        // Receiving chunks now covered by the new snapshot have completed
        // their migration; ownership caught up to reality, so nothing to
        // move or delete.
        let collection = &self.inner.collection;
        state.receiving.retain(|min, info| {
            let range = ChunkRange::new(min.clone(), info.max.clone());
            if remote.range_overlaps_chunk(&range) {
                tracing::debug!(
                    collection = %collection,
                    range = %range,
                    "verified chunk has been migrated to this shard"
                );
                false
            } else {
                true
            }
        });

        state.set_active_metadata(Some(Arc::new(remote)));
    }

    /// Register an inbound migration for `range`.
    ///
    /// Rejected when a potentially long-running query could still depend on
    /// documents in the range through any live snapshot. On acceptance the
    /// range is queued for pre-emptive cleanup so stale leftovers from a
    /// prior failed migration are purged before new data streams in.
    pub fn begin_receive(&self, range: ChunkRange) -> bool {
        let mut guard = self.inner.lock_state();
        let state = &mut *guard;
        if state.overlaps_in_use_chunk(&range) {
            tracing::debug!(
                collection = %self.inner.collection,
                range = %range,
                "rejecting inbound migration, range is depended on by in-flight readers"
            );
            return false;
        }
        state.receiving.insert(
            range.min().to_vec(),
            ChunkInfo {
                max: range.max().to_vec(),
                version: ChunkVersion::IGNORED,
            },
        );
        self.inner.push_range_to_clean(state, range);
        true
    }

    /// Abandon an inbound migration. Partially received documents have no
    /// readers, so the range goes straight to the deletion queue.
    pub fn forget_receive(&self, range: &ChunkRange) {
        let mut guard = self.inner.lock_state();
        let state = &mut *guard;
        let removed = state.receiving.remove(range.min());
        assert!(
            removed.is_some(),
            "forget_receive for a range that is not being received"
        );
        self.inner.push_range_to_clean(state, range.clone());
    }

    /// Dispose of a range this node no longer owns (donor side, after a
    /// chunk migrated out or a fresher snapshot displaced it).
    pub fn clean_up_range(&self, range: ChunkRange) {
        let mut guard = self.inner.lock_state();
        let state = &mut *guard;

        let active = state.active_tracker();
        let active_overlap = active
            .metadata
            .as_ref()
            .is_some_and(|m| m.range_overlaps_chunk(&range));
        if (active.usage_count == 0 || !active_overlap) && !state.overlaps_in_use_chunk(&range) {
            // No running query can depend on it; queue it immediately.
            self.inner.push_range_to_clean(state, range);
        } else {
            let active = state.active_tracker_mut();
            assert!(
                active.orphans.is_none(),
                "tracker already holds a deferred orphan range"
            );
            active.orphans = Some(range);
        }
    }

    /// Does `key` fall in a chunk currently being migrated into this node?
    pub fn key_is_pending(&self, key: &[u8]) -> bool {
        let state = self.inner.lock_state();
        if state.receiving.is_empty() {
            return false;
        }
        let up_to_key = (Bound::Unbounded, Bound::Included(key));
        match state.receiving.range::<[u8], _>(up_to_key).next_back() {
            Some((min, info)) => min.as_slice() <= key && key < info.max.as_slice(),
            None => false,
        }
    }

    /// Notification resolving once no tracked deletion work overlapping
    /// `range` remains.
    ///
    /// While a live tracker still defers an overlapping orphan the range is
    /// not even queued yet, so the caller gets the generation notification:
    /// wait, then re-check.
    pub fn track_cleanup(&self, range: &ChunkRange) -> CleanupNotification {
        let state = self.inner.lock_state();
        if state.overlaps_in_use_cleanups(range) {
            return state.generation.clone();
        }
        state.ranges_to_clean.overlaps(range)
    }

    pub fn number_of_ranges_to_clean(&self) -> usize {
        self.inner.lock_state().ranges_to_clean.size()
    }

    /// Deferred orphans still parked on live trackers, not yet queued.
    pub fn number_of_ranges_to_clean_still_in_use(&self) -> usize {
        let state = self.inner.lock_state();
        let deferred = |id: &TrackerId| state.trackers[id].orphans.is_some();
        let mut count = usize::from(deferred(&state.active));
        count += state.in_use.iter().filter(|id| deferred(id)).count();
        count
    }

    /// Superseded snapshots still alive for in-flight readers.
    pub fn number_of_metadata_snapshots(&self) -> usize {
        self.inner.lock_state().in_use.len()
    }

    /// Snapshot of cleanup state for status reporting.
    pub fn diagnostics(&self) -> CleanupDiagnostics {
        let state = self.inner.lock_state();
        let pending_chunks = state
            .receiving
            .iter()
            .map(|(min, info)| ChunkRange::new(min.clone(), info.max.clone()))
            .collect();
        let active_metadata_ranges = state
            .active_tracker()
            .metadata
            .as_ref()
            .map(|m| m.chunk_ranges().collect())
            .unwrap_or_default();
        CleanupDiagnostics {
            ranges_to_clean: state.ranges_to_clean.pending_ranges(),
            pending_chunks,
            active_metadata_ranges,
        }
    }
}

/// Diagnostic document consumed by status reporting.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupDiagnostics {
    pub ranges_to_clean: Vec<ChunkRange>,
    pub pending_chunks: Vec<ChunkRange>,
    pub active_metadata_ranges: Vec<ChunkRange>,
}

impl ManagerInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        // Contract-violation assertions fire with this lock held; the
        // handle and manager destructors that run during the unwind still
        // need the state, so a poisoned lock is taken as-is.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue a range for deletion. The empty-to-non-empty transition is the
    /// sole trigger that (re)schedules the deletion task, which keeps at
    /// most one task active per queue.
    fn push_range_to_clean(self: &Arc<Self>, state: &mut ManagerState, range: ChunkRange) {
        state.ranges_to_clean.add(range);
        if state.ranges_to_clean.size() == 1 {
            Self::schedule_cleanup(Arc::downgrade(self), &self.runtime, Duration::ZERO);
        }
    }

    /// Spawn one deletion pass. The task holds only a weak reference: the
    /// manager going away means the collection is gone, and the pass exits
    /// silently.
    fn schedule_cleanup(weak: Weak<ManagerInner>, runtime: &Handle, delay: Duration) {
        runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let max_to_delete = inner.config.batch_size();
            let again = {
                let Some(coll) = inner
                    .store
                    .open_collection(&inner.collection, LockMode::IntentExclusive)
                else {
                    return; // collection was dropped
                };
                inner.cleanup_next_range(coll.as_ref(), max_to_delete).await
            };
            if again {
                let delay = inner.config.pass_delay;
                let runtime = inner.runtime.clone();
                Self::schedule_cleanup(Arc::downgrade(&inner), &runtime, delay);
            }
        });
    }

    /// One deletion step over the head range. Returns false when the queue
    /// is empty, true when progress was made and the caller should re-check
    /// for more work.
    async fn cleanup_next_range(
        self: &Arc<Self>,
        coll: &dyn CollectionHandle,
        max_to_delete: u64,
    ) -> bool {
        let (range, shard_key) = {
            let state = self.lock_state();
            let Some(range) = state.ranges_to_clean.head_range() else {
                return false;
            };
            // The queue is cleared before metadata is discarded, so a
            // non-empty queue implies a sharded active snapshot.
            let Some(metadata) = state.active_tracker().metadata.clone() else {
                tracing::debug!(
                    collection = %self.collection,
                    "skipping range deletion pass, collection is not sharded"
                );
                return false;
            };
            (range, metadata.shard_key().clone())
        };

        match do_deletion(coll, &shard_key, &range, max_to_delete) {
            Err(err) => {
                self.pop_range(Err(err));
                true
            }
            Ok(0) => {
                tracing::debug!(
                    collection = %self.collection,
                    range = %range,
                    "orphaned range fully cleared"
                );
                self.pop_range(Ok(()));
                true
            }
            Ok(deleted) => {
                // Documents went away locally; never consider them deleted
                // before a majority has durably recorded it.
                if let Err(err) = self.replication.wait_for_majority().await {
                    tracing::warn!(
                        collection = %self.collection,
                        range = %range,
                        deleted,
                        error = %err,
                        "error waiting for majority replication after removing documents"
                    );
                    self.pop_range(Err(err));
                }
                true
            }
        }
    }

    fn pop_range(&self, status: CleanupStatus) {
        self.lock_state().ranges_to_clean.pop_head(status);
    }

    /// Called from scoped handle drops, unlocked.
    fn decrement_tracker_usage(self: &Arc<Self>, tracker_id: TrackerId) {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let tracker = state
            .trackers
            .get_mut(&tracker_id)
            .expect("tracker behind a live handle");
        assert!(tracker.usage_count != 0, "tracker usage count underflow");
        tracker.usage_count -= 1;
        if tracker.usage_count != 0 {
            return;
        }

        // Some counter reached zero; retire every zero-usage tracker at the
        // front of the in-use list, dispatching their deferred orphans.
        let mut notify = false;
        while let Some(&front) = state.in_use.front() {
            if state.trackers[&front].usage_count != 0 {
                break;
            }
            state.in_use.pop_front();
            let retired = state
                .trackers
                .remove(&front)
                .expect("tracker on the in-use list");
            if let Some(orphans) = retired.orphans {
                notify = true;
                self.push_range_to_clean(state, orphans);
            }
        }

        // With nothing superseded left, an unreferenced active tracker can
        // flush its own deferred orphan.
        if state.in_use.is_empty() {
            let active = state.active_tracker_mut();
            if active.usage_count == 0 && active.orphans.is_some() {
                let orphans = active.orphans.take().expect("deferred orphan");
                self.push_range_to_clean(state, orphans);
                notify = true;
            }
        }

        if notify {
            state.notify_in_use();
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // Wake everybody up to see us die. Runs during contract-violation
        // unwinds too, so tolerate a poisoned lock.
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.generation.set(Ok(()));
        state.ranges_to_clean.clear();
    }
}

/// Borrowed, reference-counted view of one ownership snapshot.
///
/// Construction increments the tracker's usage count, drop decrements it
/// and may retire the tracker, dispatching its deferred orphan range to the
/// deletion queue. Move-only: each live handle owns exactly one increment.
pub struct ScopedCollectionMetadata {
    manager: Arc<ManagerInner>,
    tracker: TrackerId,
    snapshot: Option<Arc<OwnershipSnapshot>>,
}

impl ScopedCollectionMetadata {
    /// `None` while the collection is unsharded.
    pub fn snapshot(&self) -> Option<&OwnershipSnapshot> {
        self.snapshot.as_deref()
    }

    pub fn is_sharded(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl Drop for ScopedCollectionMetadata {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        manager.decrement_tracker_usage(self.tracker);
    }
}
