//! Task pool for long-lived background routines.
//!
//! A [`Pool`] couples a [`CancellationToken`] with a [`TaskTracker`] so that
//! every routine started through it observes the same shutdown signal and can
//! be awaited on stop.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Pool {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a routine; it receives a child of the pool's token.
    pub fn go<F, Fut>(&self, routine: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel.child_token();
        self.tracker.spawn(routine(token));
    }

    /// Token cancelled by [`Pool::stop`].
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Cancels every routine and waits for all of them to return.
    pub async fn stop(&self) {
        debug!(routines = self.tracker.len(), "stopping pool");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn stop_cancels_and_waits() {
        let pool = Pool::new();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        pool.go(|token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(pool.len(), 1);

        pool.stop().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(pool.is_empty());
    }
}
