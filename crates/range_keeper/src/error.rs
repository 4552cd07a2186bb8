//! Typed failure statuses carried by cleanup notifications.

use thiserror::Error;

/// Resolution value of a range cleanup notification.
///
/// Cloned into every waiter holding the same notification, so the error
/// variant must stay cheap to clone.
pub type CleanupStatus = Result<(), CleanupError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CleanupError {
    /// No index on the collection serves the shard key pattern.
    #[error("unable to find shard key index for {key_pattern} in {collection}")]
    ShardIndexNotFound {
        collection: String,
        key_pattern: String,
    },
    /// The shard key index disappeared between resolution and use.
    #[error("shard key index {index} on {collection} was dropped")]
    ShardIndexDropped { collection: String, index: String },
    /// Storage-level failure reported by the document store.
    #[error("storage error: {0}")]
    Storage(String),
    /// Majority write concern wait failed or timed out.
    #[error("error waiting for majority replication of deletions: {0}")]
    Replication(String),
}
