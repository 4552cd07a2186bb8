//! Shared one-shot completion statuses for queued range deletions.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::CleanupStatus;

/// Clonable shared future that resolves exactly once, to success or to the
/// failure encountered while deleting a range. Any number of waiters may
/// hold clones; all observe the same resolution.
#[derive(Clone, Debug)]
pub struct CleanupNotification {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    status: Mutex<Option<CleanupStatus>>,
    notify: Notify,
}

impl CleanupNotification {
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(Inner {
                status: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// An already-resolved notification; `wait` returns immediately.
    pub fn ready(status: CleanupStatus) -> Self {
        Self {
            inner: Arc::new(Inner {
                status: Mutex::new(Some(status)),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve the notification. The first resolution wins; later calls are
    /// ignored so teardown can blanket-resolve without clobbering results.
    pub fn set(&self, status: CleanupStatus) {
        let mut slot = self.inner.status.lock().expect("notification lock");
        if slot.is_none() {
            *slot = Some(status);
            drop(slot);
            self.inner.notify.notify_waiters();
        }
    }

    pub fn get(&self) -> Option<CleanupStatus> {
        self.inner.status.lock().expect("notification lock").clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.get().is_some()
    }

    pub async fn wait(&self) -> CleanupStatus {
        loop {
            // Register before checking so a concurrent `set` cannot slip
            // between the check and the await.
            let notified = self.inner.notify.notified();
            if let Some(status) = self.get() {
                return status;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CleanupError;
    use std::time::Duration;

    #[test]
    fn first_resolution_wins() {
        let n = CleanupNotification::pending();
        assert!(!n.is_resolved());
        n.set(Err(CleanupError::Storage("boom".into())));
        n.set(Ok(()));
        assert_eq!(n.get(), Some(Err(CleanupError::Storage("boom".into()))));
    }

    #[test]
    fn ready_is_resolved() {
        assert_eq!(CleanupNotification::ready(Ok(())).get(), Some(Ok(())));
    }

    #[tokio::test]
    async fn wait_wakes_on_set() {
        let n = CleanupNotification::pending();
        let waiter = {
            let n = n.clone();
            tokio::spawn(async move { n.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        n.set(Ok(()));
        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter timed out")
            .expect("waiter panicked");
        assert_eq!(status, Ok(()));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_resolved() {
        let n = CleanupNotification::ready(Ok(()));
        assert_eq!(n.wait().await, Ok(()));
    }
}
