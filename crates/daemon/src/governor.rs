//! Concurrency governor for heavyweight conversion steps.
//!
//! External subprocesses and large in-memory decodes are the scarce
//! resources; small in-process conversions should not be throttled. Each
//! heavyweight converter class gets a counting semaphore of fixed capacity,
//! organized as a named pool table built from configuration.

use backup_transformer_config::PoolsConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Converter classes gated by a pool.
///
/// PNG/WEBP/JPEG conversions are unbounded aside from the allocation guard
/// and have no class here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    /// Video thumbnail extraction (external decoder).
    Video,
    /// HEIC decode (external converter).
    Heic,
    /// GIF decode (large in-memory frames).
    Gif,
}

impl std::fmt::Display for PoolClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolClass::Video => write!(f, "video"),
            PoolClass::Heic => write!(f, "heic"),
            PoolClass::Gif => write!(f, "gif"),
        }
    }
}

/// Named resource-pool table keyed by converter class.
#[derive(Debug)]
pub struct PoolTable {
    pools: HashMap<PoolClass, Arc<Semaphore>>,
}

impl PoolTable {
    /// Build the pool table from configured capacities.
    pub fn new(cfg: &PoolsConfig) -> Self {
        let mut pools = HashMap::new();
        pools.insert(PoolClass::Video, Arc::new(Semaphore::new(cfg.video)));
        pools.insert(PoolClass::Heic, Arc::new(Semaphore::new(cfg.heic)));
        pools.insert(PoolClass::Gif, Arc::new(Semaphore::new(cfg.gif)));
        Self { pools }
    }

    fn pool(&self, class: PoolClass) -> &Arc<Semaphore> {
        // The constructor inserts every class, so the lookup cannot miss.
        self.pools
            .get(&class)
            .expect("pool table is built with every class")
    }

    /// Acquire a permit for `class`, waiting until capacity is available.
    ///
    /// The permit releases its slot on drop, on every exit path.
    pub async fn acquire(&self, class: PoolClass) -> OwnedSemaphorePermit {
        self.pool(class)
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore should not be closed")
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self, class: PoolClass) -> Option<OwnedSemaphorePermit> {
        self.pool(class).clone().try_acquire_owned().ok()
    }

    /// Number of free slots for `class`.
    pub fn available_permits(&self, class: PoolClass) -> usize {
        self.pool(class).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table(video: usize, heic: usize, gif: usize) -> PoolTable {
        PoolTable::new(&PoolsConfig { video, heic, gif })
    }

    #[tokio::test]
    async fn test_initial_capacities() {
        let pools = table(5, 100, 5);
        assert_eq!(pools.available_permits(PoolClass::Video), 5);
        assert_eq!(pools.available_permits(PoolClass::Heic), 100);
        assert_eq!(pools.available_permits(PoolClass::Gif), 5);
    }

    #[tokio::test]
    async fn test_permit_limiting() {
        let pools = table(2, 1, 1);

        let permit1 = pools.try_acquire(PoolClass::Video);
        assert!(permit1.is_some());
        assert_eq!(pools.available_permits(PoolClass::Video), 1);

        let permit2 = pools.try_acquire(PoolClass::Video);
        assert!(permit2.is_some());
        assert_eq!(pools.available_permits(PoolClass::Video), 0);

        // Capacity exhausted: a third acquisition fails.
        assert!(pools.try_acquire(PoolClass::Video).is_none());

        // Other classes are unaffected.
        assert!(pools.try_acquire(PoolClass::Gif).is_some());

        drop(permit1);
        assert_eq!(pools.available_permits(PoolClass::Video), 1);
        assert!(pools.try_acquire(PoolClass::Video).is_some());
    }

    // Scheduling more jobs than a class's capacity never allows more than
    // that capacity of concurrent holders, observable via a counter double.
    #[tokio::test]
    async fn test_concurrency_never_exceeds_capacity() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        const CAPACITY: usize = 3;
        const JOBS: usize = 20;

        let pools = Arc::new(table(CAPACITY, 1, 1));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..JOBS {
            let pools = pools.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = pools.acquire(PoolClass::Video).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(pools.available_permits(PoolClass::Video), CAPACITY);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pools = Arc::new(table(1, 1, 1));

        let held = pools.acquire(PoolClass::Gif).await;

        let waiter = {
            let pools = pools.clone();
            tokio::spawn(async move {
                let _permit = pools.acquire(PoolClass::Gif).await;
            })
        };

        // The waiter cannot finish while the permit is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }
}
