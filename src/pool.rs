//! Slot pool: the bounded cache of resident model instances.
//!
//! Per model id, the lifecycle is:
//!
//! ```text
//! unloaded --load()--> loading --success--> loaded --unload()--> unloading --> unloaded
//!                         |
//!                         +--failure--> error (next load() retries)
//! ```
//!
//! At most `capacity` slots are in {loading, loaded} at any instant. When a
//! load would exceed capacity, the loaded slot with the oldest `last_used_at`
//! among slots with no in-flight requests is evicted; if every resident slot
//! is busy the load is rejected instead of blocking.
//!
//! All bookkeeping (slot map membership, status, in_flight, last_used_at)
//! happens under one std mutex with no await inside the critical section.
//! Slow backend start/stop calls run outside the lock; callers whose target
//! slot is mid-transition suspend on a per-slot watch channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;

use crate::backend::{BackendHandle, InferenceBackend};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::registry::ModelRegistry;

/// Lifecycle status of a slot. A model id with no slot is implicitly
/// `unloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Error,
}

impl SlotStatus {
    /// Resident slots count toward the pool capacity.
    fn is_resident(self) -> bool {
        matches!(self, SlotStatus::Loading | SlotStatus::Loaded)
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Unloaded => write!(f, "unloaded"),
            SlotStatus::Loading => write!(f, "loading"),
            SlotStatus::Loaded => write!(f, "loaded"),
            SlotStatus::Unloading => write!(f, "unloading"),
            SlotStatus::Error => write!(f, "error"),
        }
    }
}

/// A resident-model record.
struct Slot {
    status: SlotStatus,
    handle: Option<Arc<dyn BackendHandle>>,
    /// Pool clock tick of the last dispatch into this slot. Strictly
    /// increasing across the pool, so LRU ordering has no ties.
    last_used_at: u64,
    in_flight: u32,
    /// Status transitions are published here for waiters; dropping the slot
    /// drops the sender, which also wakes them.
    notify: watch::Sender<SlotStatus>,
}

impl Slot {
    fn new_loading() -> Self {
        let (notify, _) = watch::channel(SlotStatus::Loading);
        Self {
            status: SlotStatus::Loading,
            handle: None,
            last_used_at: 0,
            in_flight: 0,
            notify,
        }
    }

    fn set_status(&mut self, status: SlotStatus) {
        self.status = status;
        self.notify.send_replace(status);
    }
}

/// Point-in-time view of a slot, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub model_id: String,
    pub status: SlotStatus,
    pub in_flight: u32,
}

/// What the admission check under the pool lock decided.
enum Admission {
    /// Slot is loaded; handle cloned, bookkeeping done.
    Ready(Arc<dyn BackendHandle>),
    /// Slot is mid-transition; wait for it to resolve, then retry.
    Wait(watch::Receiver<SlotStatus>),
    /// Caller owns the load; a victim was already marked unloading if
    /// eviction was needed.
    Load {
        victim: Option<(String, Arc<dyn BackendHandle>)>,
    },
}

/// Bounded pool of resident model instances with LRU eviction.
pub struct SlotPool {
    capacity: usize,
    autoload: bool,
    backend: Arc<dyn InferenceBackend>,
    registry: Arc<ModelRegistry>,
    clock: AtomicU64,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SlotPool {
    pub fn new(
        config: &PoolConfig,
        registry: Arc<ModelRegistry>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            capacity: config.capacity.max(1),
            autoload: config.autoload,
            backend,
            registry,
            clock: AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Acquire a ready slot for dispatching a request into `model_id`,
    /// loading (and evicting) as needed. The returned guard keeps the slot's
    /// in-flight count raised until dropped.
    pub async fn acquire(self: &Arc<Self>, model_id: &str) -> Result<SlotGuard> {
        loop {
            match self.admit(model_id, true)? {
                Admission::Ready(handle) => return Ok(self.guard(model_id, handle)),
                Admission::Wait(rx) => {
                    // Callers that piggyback on an in-progress load observe
                    // that attempt's outcome instead of starting another.
                    if wait_resolved(rx).await == Some(SlotStatus::Error) {
                        return Err(Error::LoadFailed(model_id.to_string()));
                    }
                }
                Admission::Load { victim } => {
                    let handle = self.run_load(model_id, true, victim).await?;
                    return Ok(self.guard(model_id, handle));
                }
            }
        }
    }

    /// Decrement the in-flight count for a slot. Never fails; called from
    /// guard drop, including on client disconnect mid-generation.
    pub fn release(&self, model_id: &str) {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get_mut(model_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }

    /// Control-plane load: same transition as the autoload path but without
    /// attaching a request, and not subject to the autoload policy.
    /// Idempotent for models that are already loading or loaded.
    pub async fn explicit_load(self: &Arc<Self>, model_id: &str) -> Result<()> {
        loop {
            match self.admit(model_id, false)? {
                Admission::Ready(_) => return Ok(()),
                Admission::Wait(rx) => {
                    if *rx.borrow() == SlotStatus::Loading {
                        // already converging on loaded, nothing to do
                        return Ok(());
                    }
                    // unloading: wait it out, then load fresh
                    wait_resolved(rx).await;
                }
                Admission::Load { victim } => {
                    self.run_load(model_id, false, victim).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Control-plane unload. Rejects with `busy` if the slot is loading or
    /// has in-flight requests; unloading a model that is not resident is a
    /// no-op.
    pub async fn explicit_unload(self: &Arc<Self>, model_id: &str) -> Result<()> {
        let handle = {
            let mut slots = self.lock_slots();
            let Some(slot) = slots.get_mut(model_id) else {
                return Ok(());
            };
            match slot.status {
                SlotStatus::Unloaded | SlotStatus::Error => {
                    // clear the stale record
                    slots.remove(model_id);
                    return Ok(());
                }
                SlotStatus::Unloading => return Ok(()),
                SlotStatus::Loading => {
                    return Err(Error::Busy(format!("model {} is loading", model_id)));
                }
                SlotStatus::Loaded => {
                    if slot.in_flight > 0 {
                        return Err(Error::Busy(format!(
                            "model {} has {} requests in flight",
                            model_id, slot.in_flight
                        )));
                    }
                    slot.set_status(SlotStatus::Unloading);
                    slot.handle
                        .take()
                        .ok_or_else(|| Error::Internal(format!("loaded slot {} has no handle", model_id)))?
                }
            }
        };

        if let Err(e) = handle.stop().await {
            tracing::warn!("Error stopping model {}: {}", model_id, e);
        }
        self.lock_slots().remove(model_id);
        tracing::info!("Model {} unloaded", model_id);
        Ok(())
    }

    /// Stop every resident instance. Used at shutdown.
    pub async fn unload_all(self: &Arc<Self>) {
        let handles: Vec<(String, Arc<dyn BackendHandle>)> = {
            let mut slots = self.lock_slots();
            slots
                .iter_mut()
                .filter_map(|(id, slot)| {
                    if slot.status == SlotStatus::Loaded {
                        slot.set_status(SlotStatus::Unloading);
                        slot.handle.take().map(|h| (id.clone(), h))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (model_id, handle) in handles {
            if let Err(e) = handle.stop().await {
                tracing::warn!("Error stopping model {}: {}", model_id, e);
            }
            self.lock_slots().remove(&model_id);
        }
    }

    /// Current status of a model; absent slot means `unloaded`.
    pub fn status_of(&self, model_id: &str) -> SlotStatus {
        self.lock_slots()
            .get(model_id)
            .map(|s| s.status)
            .unwrap_or(SlotStatus::Unloaded)
    }

    /// Snapshot of every slot currently in the pool.
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.lock_slots()
            .iter()
            .map(|(id, slot)| SlotSnapshot {
                model_id: id.clone(),
                status: slot.status,
                in_flight: slot.in_flight,
            })
            .collect()
    }

    /// Number of slots counting toward capacity (loading or loaded).
    pub fn resident_count(&self) -> usize {
        self.lock_slots()
            .values()
            .filter(|s| s.status.is_resident())
            .count()
    }

    /// In-flight request count for a model (0 if not resident).
    pub fn in_flight(&self, model_id: &str) -> u32 {
        self.lock_slots()
            .get(model_id)
            .map(|s| s.in_flight)
            .unwrap_or(0)
    }

    fn guard(self: &Arc<Self>, model_id: &str, handle: Arc<dyn BackendHandle>) -> SlotGuard {
        SlotGuard {
            pool: self.clone(),
            model_id: model_id.to_string(),
            handle,
        }
    }

    /// The admission check: one critical section deciding whether the caller
    /// gets a ready handle, must wait, or owns the load. Marking an eviction
    /// victim happens here too, in the same section as its in_flight check,
    /// so eviction cannot race an acquire of the victim.
    fn admit(&self, model_id: &str, attach: bool) -> Result<Admission> {
        let mut slots = self.lock_slots();

        if let Some(slot) = slots.get_mut(model_id) {
            match slot.status {
                SlotStatus::Loaded => {
                    let handle = slot.handle.clone().ok_or_else(|| {
                        Error::Internal(format!("loaded slot {} has no handle", model_id))
                    })?;
                    if attach {
                        slot.last_used_at = self.tick();
                        slot.in_flight += 1;
                    }
                    return Ok(Admission::Ready(handle));
                }
                SlotStatus::Loading | SlotStatus::Unloading => {
                    return Ok(Admission::Wait(slot.notify.subscribe()));
                }
                // error is terminal per attempt; a new load retries
                SlotStatus::Error | SlotStatus::Unloaded => {}
            }
        }

        if !self.registry.contains(model_id) {
            return Err(Error::ModelNotFound(model_id.to_string()));
        }

        if attach && !self.autoload {
            // admission control: dispatch may not trigger a load
            return Err(Error::ModelNotLoaded(model_id.to_string()));
        }

        let resident = slots.values().filter(|s| s.status.is_resident()).count();
        let mut victim = None;
        if resident >= self.capacity {
            let candidate = slots
                .iter_mut()
                .filter(|(id, slot)| {
                    id.as_str() != model_id
                        && slot.status == SlotStatus::Loaded
                        && slot.in_flight == 0
                })
                .min_by_key(|(_, slot)| slot.last_used_at);

            match candidate {
                Some((victim_id, slot)) => {
                    slot.set_status(SlotStatus::Unloading);
                    let handle = slot.handle.take().ok_or_else(|| {
                        Error::Internal(format!("loaded slot {} has no handle", victim_id))
                    })?;
                    victim = Some((victim_id.clone(), handle));
                }
                None => {
                    return Err(Error::CapacityExhausted(format!(
                        "{} resident models at capacity {}, none evictable",
                        resident, self.capacity
                    )));
                }
            }
        }

        // Take ownership of the load. Reuses a stale unloaded/error slot if
        // one lingers; its watch channel carries over to new waiters.
        let slot = slots
            .entry(model_id.to_string())
            .or_insert_with(Slot::new_loading);
        slot.handle = None;
        slot.set_status(SlotStatus::Loading);

        Ok(Admission::Load { victim })
    }

    /// Drive a load owned by this caller: stop the eviction victim (if any),
    /// start the backend, then publish the outcome. Runs outside the pool
    /// lock except for the bookkeeping transitions.
    async fn run_load(
        self: &Arc<Self>,
        model_id: &str,
        attach: bool,
        victim: Option<(String, Arc<dyn BackendHandle>)>,
    ) -> Result<Arc<dyn BackendHandle>> {
        if let Some((victim_id, handle)) = victim {
            tracing::info!(
                "Capacity reached, evicting LRU model {} to load {}",
                victim_id,
                model_id
            );
            if let Err(e) = handle.stop().await {
                tracing::warn!("Error stopping evicted model {}: {}", victim_id, e);
            }
            // Dropping the slot drops its watch sender, waking any waiters.
            self.lock_slots().remove(&victim_id);
        }

        let descriptor = self
            .registry
            .get(model_id)
            .cloned()
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;

        tracing::info!("Loading model {}", model_id);
        match self.backend.start(&descriptor).await {
            Ok(handle) => {
                let mut slots = self.lock_slots();
                let slot = slots.get_mut(model_id).ok_or_else(|| {
                    Error::Internal(format!("slot for {} vanished during load", model_id))
                })?;
                slot.handle = Some(handle.clone());
                slot.last_used_at = self.tick();
                if attach {
                    slot.in_flight += 1;
                }
                slot.set_status(SlotStatus::Loaded);
                tracing::info!("Model {} loaded", model_id);
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!("Failed to load model {}: {}", model_id, e);
                let mut slots = self.lock_slots();
                if let Some(slot) = slots.get_mut(model_id) {
                    slot.handle = None;
                    slot.set_status(SlotStatus::Error);
                }
                Err(Error::LoadFailed(format!("{}: {}", model_id, e)))
            }
        }
    }
}

/// Wait until a mid-transition slot resolves. Returns the resolved status,
/// or None if the slot was removed from the pool while waiting.
async fn wait_resolved(mut rx: watch::Receiver<SlotStatus>) -> Option<SlotStatus> {
    loop {
        let status = *rx.borrow_and_update();
        match status {
            SlotStatus::Loading | SlotStatus::Unloading => {
                if rx.changed().await.is_err() {
                    return None;
                }
            }
            resolved => return Some(resolved),
        }
    }
}

/// RAII claim on a loaded slot. Holds the backend handle for forwarding and
/// releases the slot's in-flight count when dropped, whether the response
/// stream completed, failed mid-way, or the client disconnected.
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    model_id: String,
    handle: Arc<dyn BackendHandle>,
}

impl SlotGuard {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn handle(&self) -> &Arc<dyn BackendHandle> {
        &self.handle
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(&self.model_id);
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::registry::{ModelCapability, ModelDescriptor, ModelRegistry};
    use crate::test_util::MockBackend;
    use std::path::PathBuf;

    fn registry(ids: &[&str]) -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::from_descriptors(
            ids.iter()
                .map(|id| ModelDescriptor {
                    id: id.to_string(),
                    source: PathBuf::from(format!("/models/{}.gguf", id)),
                    capabilities: vec![ModelCapability::Completion],
                })
                .collect(),
        ))
    }

    fn pool_with(
        capacity: usize,
        autoload: bool,
        ids: &[&str],
    ) -> (Arc<SlotPool>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let config = PoolConfig { capacity, autoload };
        let pool = SlotPool::new(&config, registry(ids), backend.clone());
        (pool, backend)
    }

    #[tokio::test]
    async fn test_status_defaults_to_unloaded() {
        let (pool, _) = pool_with(2, true, &["a"]);
        assert_eq!(pool.status_of("a"), SlotStatus::Unloaded);
        assert_eq!(pool.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_loads_and_attaches() {
        let (pool, backend) = pool_with(2, true, &["a"]);
        let guard = pool.acquire("a").await.unwrap();
        assert_eq!(pool.status_of("a"), SlotStatus::Loaded);
        assert_eq!(pool.in_flight("a"), 1);
        assert_eq!(backend.starts(), 1);
        drop(guard);
        assert_eq!(pool.in_flight("a"), 0);
    }

    #[tokio::test]
    async fn test_acquire_unknown_model() {
        let (pool, _) = pool_with(2, true, &["a"]);
        let err = pool.acquire("ghost").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_autoload_disabled_rejects_without_creating_slot() {
        let (pool, backend) = pool_with(2, false, &["a"]);
        let err = pool.acquire("a").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotLoaded(_)));
        assert_eq!(pool.snapshot().len(), 0);
        assert_eq!(backend.starts(), 0);

        // explicit load is exempt from the policy; dispatch then succeeds
        pool.explicit_load("a").await.unwrap();
        let guard = pool.acquire("a").await.unwrap();
        assert_eq!(guard.model_id(), "a");
    }

    #[tokio::test]
    async fn test_failed_load_resolves_to_error_and_allows_retry() {
        let (pool, backend) = pool_with(2, true, &["a"]);
        backend.fail_next_start_of("a");

        let err = pool.acquire("a").await.unwrap_err();
        assert!(matches!(err, Error::LoadFailed(_)));
        assert_eq!(pool.status_of("a"), SlotStatus::Error);
        assert_eq!(pool.resident_count(), 0);

        // retry re-enters loading and succeeds
        let guard = pool.acquire("a").await.unwrap();
        assert_eq!(pool.status_of("a"), SlotStatus::Loaded);
        drop(guard);
    }

    #[tokio::test]
    async fn test_explicit_load_is_idempotent() {
        let (pool, backend) = pool_with(2, true, &["a"]);
        pool.explicit_load("a").await.unwrap();
        pool.explicit_load("a").await.unwrap();
        assert_eq!(backend.starts(), 1);
        assert_eq!(pool.status_of("a"), SlotStatus::Loaded);
        // explicit load attaches no request
        assert_eq!(pool.in_flight("a"), 0);
    }

    #[tokio::test]
    async fn test_explicit_unload_busy_when_in_flight() {
        let (pool, _) = pool_with(2, true, &["a"]);
        let guard = pool.acquire("a").await.unwrap();
        let err = pool.explicit_unload("a").await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        assert_eq!(pool.status_of("a"), SlotStatus::Loaded);

        drop(guard);
        pool.explicit_unload("a").await.unwrap();
        assert_eq!(pool.status_of("a"), SlotStatus::Unloaded);
    }

    #[tokio::test]
    async fn test_explicit_unload_not_resident_is_noop() {
        let (pool, backend) = pool_with(2, true, &["a"]);
        pool.explicit_unload("a").await.unwrap();
        assert_eq!(backend.stops(), 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let (pool, backend) = pool_with(2, true, &["a", "b", "c"]);
        drop(pool.acquire("a").await.unwrap());
        drop(pool.acquire("b").await.unwrap());
        assert_eq!(pool.resident_count(), 2);

        // a is least recently used; loading c evicts it
        drop(pool.acquire("c").await.unwrap());
        assert_eq!(pool.resident_count(), 2);
        assert_eq!(pool.status_of("a"), SlotStatus::Unloaded);
        assert_eq!(pool.status_of("b"), SlotStatus::Loaded);
        assert_eq!(pool.status_of("c"), SlotStatus::Loaded);
        assert_eq!(backend.stopped_models(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_lru_respects_recency_bump() {
        let (pool, backend) = pool_with(2, true, &["a", "b", "c"]);
        drop(pool.acquire("a").await.unwrap());
        drop(pool.acquire("b").await.unwrap());
        // touch a again; b becomes the LRU victim
        drop(pool.acquire("a").await.unwrap());

        drop(pool.acquire("c").await.unwrap());
        assert_eq!(pool.status_of("a"), SlotStatus::Loaded);
        assert_eq!(pool.status_of("b"), SlotStatus::Unloaded);
        assert_eq!(backend.stopped_models(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_capacity_exhausted_when_all_busy() {
        let (pool, _) = pool_with(1, true, &["a", "b"]);
        let guard = pool.acquire("a").await.unwrap();

        let err = pool.acquire("b").await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(_)));
        // the denied request had no side effects on pool state
        assert_eq!(pool.status_of("a"), SlotStatus::Loaded);
        assert_eq!(pool.status_of("b"), SlotStatus::Unloaded);

        // releasing the claim makes a evictable again
        drop(guard);
        let guard_b = pool.acquire("b").await.unwrap();
        assert_eq!(pool.status_of("a"), SlotStatus::Unloaded);
        assert_eq!(pool.status_of("b"), SlotStatus::Loaded);
        drop(guard_b);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_converge_on_one_start() {
        let backend = Arc::new(MockBackend::with_start_delay(50));
        let config = PoolConfig {
            capacity: 2,
            autoload: true,
        };
        let pool = SlotPool::new(&config, registry(&["a"]), backend.clone());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire("a").await.map(|g| g.model_id().to_string())
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "a");
        }
        assert_eq!(backend.starts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_observe_shared_failure() {
        let backend = Arc::new(MockBackend::with_start_delay(50));
        backend.fail_next_start_of("a");
        let config = PoolConfig {
            capacity: 2,
            autoload: true,
        };
        let pool = SlotPool::new(&config, registry(&["a"]), backend.clone());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.acquire("a").await.map(|_| ()) }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::LoadFailed(_)));
        }
        // one failed attempt, no retries triggered by the waiters
        assert_eq!(backend.start_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unload_all_stops_everything() {
        let (pool, backend) = pool_with(2, true, &["a", "b"]);
        drop(pool.acquire("a").await.unwrap());
        drop(pool.acquire("b").await.unwrap());

        pool.unload_all().await;
        assert_eq!(pool.resident_count(), 0);
        assert_eq!(backend.stops(), 2);
    }

    #[tokio::test]
    async fn test_release_unknown_model_is_noop() {
        let (pool, _) = pool_with(2, true, &["a"]);
        pool.release("ghost");
    }
}
