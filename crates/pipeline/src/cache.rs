//! Single-flight cache manager
//!
//! Every stage that calls the completion capability goes through
//! [`CacheManager::get_or_compute`]. For one key the compute function runs at
//! most once across all callers:
//!
//! 1. Callers in this process queue on a per-key async mutex
//! 2. The holder takes a lease record in the shared store, so callers in
//!    other processes wait for the value instead of computing it
//! 3. The value is written only after a complete, successful computation;
//!    an abandoned or failed computation writes nothing
//!
//! Store failures surface as `CacheUnavailable`. They are never papered over
//! by recomputing.

use crate::clock::Clock;
use crate::error::{PipelineError, Result};
use graphrag_core::{CacheEntry, CacheKey};
use graphrag_db::CacheStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// How often a waiter re-reads the store while another process computes
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(50);

type KeyLocks = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

fn unavailable(e: graphrag_db::DbError) -> PipelineError {
    PipelineError::CacheUnavailable(e.to_string())
}

/// Holds one key's in-process lock slot; frees the slot when last out
struct KeySlot {
    locks: KeyLocks,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for KeySlot {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map and this slot are the only holders left
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Releases the shared lease unless already released
struct ClaimGuard {
    store: Arc<dyn CacheStore>,
    key: String,
    owner: String,
    armed: bool,
}

impl ClaimGuard {
    async fn release(mut self) -> Result<()> {
        self.armed = false;
        self.store
            .release(&self.key, &self.owner)
            .await
            .map_err(unavailable)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cancelled mid-computation: free the lease in the background
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let key = std::mem::take(&mut self.key);
            let owner = std::mem::take(&mut self.owner);
            handle.spawn(async move {
                if let Err(e) = store.release(&key, &owner).await {
                    warn!(key, error = %e, "Failed to release cache claim");
                }
            });
        }
    }
}

/// Content-addressed cache with at-most-once computation per key
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    /// Identifies this manager's leases
    owner: String,
    ttl_secs: Option<u64>,
    lease: Duration,
    locks: KeyLocks,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            owner: uuid::Uuid::new_v4().to_string(),
            ttl_secs: None,
            lease: Duration::from_secs(300),
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn with_ttl(mut self, ttl_secs: Option<u64>) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Cached value for `key`, if present and fresh
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        self.lookup(&key.render()).await
    }

    async fn lookup<T: DeserializeOwned>(&self, rendered: &str) -> Result<Option<T>> {
        let Some(entry) = self.store.get(rendered).await.map_err(unavailable)? else {
            return Ok(None);
        };
        if entry.is_expired(self.clock.now_ms()) {
            debug!(key = rendered, "Cache entry expired");
            self.store.remove(rendered).await.map_err(unavailable)?;
            return Ok(None);
        }
        match serde_json::from_str(&entry.value) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = rendered, error = %e, "Discarding unreadable cache entry");
                self.store.remove(rendered).await.map_err(unavailable)?;
                Ok(None)
            }
        }
    }

    /// Store a value directly
    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        let entry = CacheEntry::new(
            key,
            serde_json::to_string(value)?,
            self.clock.now_ms(),
            self.ttl_secs,
        );
        self.store.put(entry).await.map_err(unavailable)
    }

    /// Remove every entry under `prefix`
    #[instrument(skip(self))]
    pub async fn invalidate(&self, prefix: &str) -> Result<u64> {
        let removed = self
            .store
            .invalidate_prefix(prefix)
            .await
            .map_err(unavailable)?;
        debug!(prefix, removed, "Invalidated cache prefix");
        Ok(removed)
    }

    fn slot(&self, rendered: &str) -> KeySlot {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks
            .entry(rendered.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeySlot {
            locks: self.locks.clone(),
            key: rendered.to_string(),
            lock,
        }
    }

    /// Return the cached value for `key` or compute, store and return it.
    ///
    /// Concurrent callers with the same key share one computation. If
    /// `deadline` passes first the call fails with `TimeoutExceeded` and
    /// nothing is written.
    #[instrument(skip(self, deadline, compute), fields(key = %key))]
    pub async fn get_or_compute<T, F, Fut>(&self, key: &CacheKey, deadline: Instant, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let rendered = key.render();
        if let Some(value) = self.lookup(&rendered).await? {
            debug!("Cache hit");
            return Ok(value);
        }

        let slot = self.slot(&rendered);
        let _local = tokio::time::timeout_at(deadline, slot.lock.lock())
            .await
            .map_err(|_| PipelineError::timeout(format!("waiting for {}", rendered)))?;

        // Another local caller may have filled it while we queued
        if let Some(value) = self.lookup(&rendered).await? {
            debug!("Cache hit after wait");
            return Ok(value);
        }

        let Some(claim) = self.claim(&rendered, deadline).await? else {
            // Another process computed it while we waited
            return self
                .lookup(&rendered)
                .await?
                .ok_or_else(|| PipelineError::CacheUnavailable(format!("{} vanished after compute", rendered)));
        };

        if let Some(value) = self.lookup(&rendered).await? {
            claim.release().await?;
            return Ok(value);
        }

        debug!("Cache miss, computing");
        let value = match tokio::time::timeout_at(deadline, compute()).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                claim.release().await?;
                return Err(e);
            }
            Err(_) => {
                claim.release().await?;
                return Err(PipelineError::timeout(format!("computing {}", rendered)));
            }
        };

        self.put(key, &value).await?;
        claim.release().await?;
        Ok(value)
    }

    /// Take the shared lease, or wait until the value shows up elsewhere.
    ///
    /// `None` means another process stored the value while we waited.
    async fn claim(&self, rendered: &str, deadline: Instant) -> Result<Option<ClaimGuard>> {
        let lease_ms = self.lease.as_millis() as i64;
        loop {
            let won = self
                .store
                .try_claim(rendered, &self.owner, self.clock.now_ms(), lease_ms)
                .await
                .map_err(unavailable)?;
            if won {
                return Ok(Some(ClaimGuard {
                    store: self.store.clone(),
                    key: rendered.to_string(),
                    owner: self.owner.clone(),
                    armed: true,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::timeout(format!("waiting for {}", rendered)));
            }
            tokio::time::sleep_until((now + CLAIM_POLL_INTERVAL).min(deadline)).await;

            if self
                .store
                .get(rendered)
                .await
                .map_err(unavailable)?
                .is_some_and(|e| !e.is_expired(self.clock.now_ms()))
            {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use graphrag_core::Stage;
    use graphrag_db::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(input: &str) -> CacheKey {
        CacheKey::derive("doc:test", Stage::Extract, [input])
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_computes_once_then_hits() {
        let manager = CacheManager::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let value: String = manager
                .get_or_compute(&key("a"), far(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("value".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let manager = Arc::new(CacheManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..16 {
            let manager = manager.clone();
            let calls = calls.clone();
            tasks.spawn(async move {
                manager
                    .get_or_compute(&key("shared"), far(), || async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, PipelineError>(vec![n, 42])
                    })
                    .await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &vec![0, 42]));
        assert!(manager.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_managers_sharing_a_store_compute_once() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let first = Arc::new(CacheManager::new(store.clone(), Arc::new(SystemClock)));
        let second = Arc::new(CacheManager::new(store, Arc::new(SystemClock)));
        assert_ne!(first.owner(), second.owner());
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |manager: Arc<CacheManager>, calls: Arc<AtomicUsize>| async move {
            manager
                .get_or_compute(&key("cross"), far(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, PipelineError>(7u32)
                })
                .await
        };
        let (a, b) = tokio::join!(
            run(first, calls.clone()),
            run(second, calls.clone())
        );
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_compute_writes_nothing() {
        let manager = CacheManager::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        let result: Result<String> = manager
            .get_or_compute(&key("bad"), far(), || async {
                Err(PipelineError::ProviderError {
                    attempts: 1,
                    message: "boom".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert!(manager.get::<String>(&key("bad")).await.unwrap().is_none());

        // The lease was released, so a retry computes
        let value: String = manager
            .get_or_compute(&key("bad"), far(), || async { Ok("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }

    #[tokio::test]
    async fn test_deadline_cancels_without_writing() {
        let manager = CacheManager::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        let deadline = Instant::now() + Duration::from_millis(20);
        let result: Result<String> = manager
            .get_or_compute(&key("slow"), deadline, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            })
            .await;
        assert!(matches!(result, Err(PipelineError::TimeoutExceeded { .. })));
        assert!(manager.get::<String>(&key("slow")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry_recomputes() {
        let clock = Arc::new(ManualClock::new(0));
        let manager =
            CacheManager::new(Arc::new(MemoryStore::new()), clock.clone()).with_ttl(Some(60));
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let compute = || async move { Ok::<_, PipelineError>(calls.fetch_add(1, Ordering::SeqCst)) };

        assert_eq!(manager.get_or_compute(&key("t"), far(), compute).await.unwrap(), 0);
        clock.advance(Duration::from_secs(30));
        assert_eq!(manager.get_or_compute(&key("t"), far(), compute).await.unwrap(), 0);
        clock.advance(Duration::from_secs(31));
        assert_eq!(manager.get_or_compute(&key("t"), far(), compute).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        let manager = CacheManager::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        manager.put(&key("x"), &1u8).await.unwrap();
        manager
            .put(&CacheKey::derive("doc:other", Stage::Extract, ["x"]), &2u8)
            .await
            .unwrap();

        let removed = manager
            .invalidate(&CacheKey::namespace_prefix("doc:test"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(manager.get::<u8>(&key("x")).await.unwrap().is_none());
    }
}
