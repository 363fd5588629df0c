use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;

/// Bounded task pool: at most `max_concurrency` spawned futures run at once.
#[derive(Debug, Clone)]
pub struct InProcessQueue {
    semaphore: Arc<Semaphore>,
}

impl InProcessQueue {
    pub fn new(max_concurrency: usize) -> Self {
        let permits = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                tracing::warn!("in-process queue closed; dropping task");
                return;
            };
            fut.await;
        })
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// One async mutex per key, created on first use and dropped once unused.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
