//! Shard metadata lifecycle and orphan-range cleanup.
//!
//! A sharded storage node tracks which key ranges of a collection it owns,
//! reconciles ownership changes pushed by the cluster's routing authority,
//! and physically deletes data left behind by completed chunk migrations,
//! all while long-running reads may still hold a stale view of ownership.
//!
//! Two components, layered:
//! - [`deletion_queue::RangeDeletionQueue`]: FIFO queue of orphaned key
//!   ranges pending incremental, replication-paced deletion.
//! - [`metadata_manager::MetadataManager`]: owns the authoritative chunk
//!   ownership snapshot, keeps superseded snapshots alive while readers
//!   reference them, tracks inbound migrations, and decides when an orphan
//!   range becomes safe to hand to the deletion queue.
//!
//! The host node supplies the storage and replication seams in [`store`];
//! [`memory`] ships an in-memory store for embedding and tests.

pub mod deletion_queue;
pub mod error;
pub mod memory;
pub mod metadata_manager;
pub mod notification;
pub mod range;
pub mod store;

pub use error::{CleanupError, CleanupStatus};
pub use metadata_manager::{
    CleanupConfig, CleanupDiagnostics, MetadataManager, ScopedCollectionMetadata,
};
pub use notification::CleanupNotification;
pub use range::{ChunkRange, ChunkVersion, KeyPattern, OwnershipSnapshot};
pub use store::{CollectionName, LockMode, RecordId};
