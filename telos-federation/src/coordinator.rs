//! The coherence coordinator
//!
//! Leases eligible outbox records, applies them to L2 and L1 in per-id
//! sequence order, and marks them applied. Failed applies retry with
//! exponential backoff up to the configured attempt budget, then move to
//! the dead-letter state and surface a `CoherenceFailure` event. A crashed
//! coordinator's leases expire after the lease duration, so a successor
//! instance resumes exactly where it stopped.
//!
//! Invalidation order is fixed: every update and delete invalidates the L1
//! entry before touching L2, so readers never observe a cached vector that
//! no longer matches the canonical concept.

use crate::events::CoherenceEvent;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telos_ann::AnnIndex;
use telos_cache::VectorCache;
use telos_config::TelosConfig;
use telos_kernel::ConceptId;
use telos_store::{ChangeKind, ConceptStore, OutboxRecord};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(10);
const LEASE_BATCH: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Injected apply fault, used by chaos experiments and tests.
/// Returning `Err` fails the L2 apply for matching records.
type ApplyFault = Box<dyn Fn(&OutboxRecord) -> Result<(), String> + Send + Sync>;

/// Coordinator counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CoordinatorStats {
    /// Records applied
    pub applied: u64,
    /// Apply attempts that failed and were rescheduled
    pub retried: u64,
    /// Records dead-lettered
    pub dead: u64,
    /// Vectors promoted into L1
    pub promoted: u64,
}

/// Drives outbox records from `pending` to `applied`.
///
/// Cheap to clone; clones share the same coordinator.
#[derive(Clone)]
pub struct CoherenceCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: ConceptStore,
    index: AnnIndex,
    cache: VectorCache,
    lease_ms: u64,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    max_attempts: u32,
    /// Last applied payload hash per concept; the idempotence check
    applied_hashes: DashMap<ConceptId, [u8; 32]>,
    events: broadcast::Sender<CoherenceEvent>,
    fault: RwLock<Option<ApplyFault>>,
    running: AtomicBool,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    applied: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
    promoted: AtomicU64,
}

impl CoherenceCoordinator {
    /// Create a coordinator over the three tiers
    pub fn new(
        config: &TelosConfig,
        store: ConceptStore,
        index: AnnIndex,
        cache: VectorCache,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                index,
                cache,
                lease_ms: config.outbox_lease_ms,
                backoff_base_ms: config.outbox_backoff_base_ms,
                backoff_max_ms: config.outbox_backoff_max_ms,
                max_attempts: config.outbox_max_attempts,
                applied_hashes: DashMap::new(),
                events,
                fault: RwLock::new(None),
                running: AtomicBool::new(false),
                worker: parking_lot::Mutex::new(None),
                applied: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                dead: AtomicU64::new(0),
                promoted: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to coherence events
    pub fn subscribe(&self) -> broadcast::Receiver<CoherenceEvent> {
        self.inner.events.subscribe()
    }

    /// Install (or clear) an apply fault for chaos experiments
    pub fn inject_apply_fault(
        &self,
        fault: Option<Box<dyn Fn(&OutboxRecord) -> Result<(), String> + Send + Sync>>,
    ) {
        *self.inner.fault.write() = fault;
    }

    /// Start the propagation loop. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while inner.running.load(Ordering::Acquire) {
                ticker.tick().await;
                if let Err(err) = Self::drive(&inner) {
                    warn!(error = %err, "coherence tick failed");
                }
            }
        });
        *self.inner.worker.lock() = Some(handle);
    }

    /// Stop the propagation loop and wait for it to settle. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run one synchronous propagation pass over eligible records.
    /// Exposed so tests can tick deterministically.
    pub fn tick_once(&self) -> Result<usize, telos_store::StoreError> {
        Self::drive(&self.inner)
    }

    /// Counters snapshot
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            applied: self.inner.applied.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
            dead: self.inner.dead.load(Ordering::Relaxed),
            promoted: self.inner.promoted.load(Ordering::Relaxed),
        }
    }

    /// Promotion policy hook: called by the fabric when a miss was served
    /// by a lower tier. Inserts into L1 when the concept is hot enough.
    pub fn promote(&self, id: ConceptId, usage_count: u64, vector: &[f32]) {
        if usage_count > crate::PROMOTION_USAGE_THRESHOLD {
            self.inner.cache.put(id, vector.to_vec());
            self.inner.promoted.fetch_add(1, Ordering::Relaxed);
            let _ = self.inner.events.send(CoherenceEvent::Promoted { id });
        }
    }

    #[instrument(skip_all)]
    fn drive(inner: &CoordinatorInner) -> Result<usize, telos_store::StoreError> {
        let now = now_ms();
        let eligible = inner.store.outbox_eligible(now, LEASE_BATCH)?;
        let mut advanced = 0;

        for record in eligible {
            // Per-id ordering: an earlier live record for the same concept
            // must land first; records for other ids proceed regardless.
            if inner
                .store
                .outbox_has_earlier_unapplied(record.concept_id, record.sequence)?
            {
                continue;
            }
            let Some(leased) = inner.store.outbox_lease(record.sequence, inner.lease_ms)? else {
                continue;
            };
            advanced += 1;
            Self::apply_leased(inner, leased)?;
        }
        Ok(advanced)
    }

    fn apply_leased(
        inner: &CoordinatorInner,
        record: OutboxRecord,
    ) -> Result<(), telos_store::StoreError> {
        // Idempotent apply: a payload we already landed is a no-op.
        if inner
            .applied_hashes
            .get(&record.concept_id)
            .map(|h| *h == record.payload_hash)
            .unwrap_or(false)
        {
            inner.store.outbox_mark_applied(record.sequence)?;
            return Ok(());
        }

        match Self::apply_to_tiers(inner, &record) {
            Ok(()) => {
                inner.store.outbox_mark_applied(record.sequence)?;
                inner
                    .applied_hashes
                    .insert(record.concept_id, record.payload_hash);
                inner.applied.fetch_add(1, Ordering::Relaxed);
                debug!(sequence = record.sequence, id = %record.concept_id, "outbox record applied");
                let _ = inner.events.send(CoherenceEvent::Applied {
                    sequence: record.sequence,
                    id: record.concept_id,
                });
            }
            Err(message) => {
                if record.attempts >= inner.max_attempts {
                    inner.store.outbox_mark_dead(record.sequence)?;
                    inner.dead.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        sequence = record.sequence,
                        id = %record.concept_id,
                        attempts = record.attempts,
                        error = %message,
                        "outbox record dead-lettered"
                    );
                    let _ = inner.events.send(CoherenceEvent::CoherenceFailure {
                        sequence: record.sequence,
                        id: record.concept_id,
                        attempts: record.attempts,
                        message,
                    });
                } else {
                    let backoff = backoff_ms(
                        inner.backoff_base_ms,
                        inner.backoff_max_ms,
                        record.attempts,
                    );
                    inner
                        .store
                        .outbox_mark_retry(record.sequence, now_ms() + backoff)?;
                    inner.retried.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    fn apply_to_tiers(inner: &CoordinatorInner, record: &OutboxRecord) -> Result<(), String> {
        // Invalidate L1 before any L2 mutation, so a reader racing this
        // apply re-reads through the fabric instead of serving stale bytes.
        if matches!(record.kind, ChangeKind::Update | ChangeKind::Delete) {
            inner.cache.invalidate(record.concept_id);
        }

        if let Some(fault) = inner.fault.read().as_ref() {
            fault(record)?;
        }

        match (&record.kind, &record.vector) {
            (ChangeKind::Delete, _) | (_, None) => {
                // No embedding to index: ensure L2 holds nothing for the id.
                inner
                    .index
                    .remove(record.concept_id)
                    .map_err(|e| e.to_string())?;
            }
            (ChangeKind::Insert, Some(vector)) => {
                inner
                    .index
                    .insert(record.concept_id, vector.clone())
                    .map_err(|e| e.to_string())?;
            }
            (ChangeKind::Update, Some(vector)) => {
                inner
                    .index
                    .update(record.concept_id, vector.clone())
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

fn backoff_ms(base: u64, cap: u64, attempts: u32) -> u64 {
    let shift = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u64 << shift).min(cap)
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use telos_ann::AnnParams;
    use telos_kernel::Concept;

    struct Harness {
        _dir: tempfile::TempDir,
        store: ConceptStore,
        index: AnnIndex,
        cache: VectorCache,
        coordinator: CoherenceCoordinator,
    }

    fn harness(config: TelosConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = ConceptStore::open(dir.path().join("l3")).unwrap();
        let index = AnnIndex::open(dir.path().join("l2"), AnnParams::default()).unwrap();
        let cache = VectorCache::new(1 << 20);
        let coordinator =
            CoherenceCoordinator::new(&config, store.clone(), index.clone(), cache.clone());
        Harness {
            _dir: dir,
            store,
            index,
            cache,
            coordinator,
        }
    }

    fn fast_config() -> TelosConfig {
        let mut config = TelosConfig::default();
        config.outbox_backoff_base_ms = 0;
        config.outbox_backoff_max_ms = 0;
        config.outbox_max_attempts = 3;
        config
    }

    async fn commit_vector(h: &Harness, id: ConceptId, vector: Vec<f32>) {
        let mut txn = h.store.begin();
        h.store
            .put_with_vector(&mut txn, Concept::new(id), Some(vector))
            .unwrap();
        h.store.commit(txn).await.unwrap();
    }

    #[tokio::test]
    async fn insert_propagates_to_l2() {
        let h = harness(fast_config());
        let id = h.store.allocate_id().unwrap();
        commit_vector(&h, id, vec![1.0, 0.0]).await;

        h.coordinator.tick_once().unwrap();
        assert!(h.index.contains(id));
        assert_eq!(h.coordinator.stats().applied, 1);
    }

    #[tokio::test]
    async fn update_invalidates_l1_before_l2() {
        let h = harness(fast_config());
        let id = h.store.allocate_id().unwrap();
        commit_vector(&h, id, vec![0.1, 0.2]).await;
        h.coordinator.tick_once().unwrap();

        // Stale L1 entry that must never survive the update.
        h.cache.put(id, vec![0.1, 0.2]);
        commit_vector(&h, id, vec![0.9, 0.8]).await;
        h.coordinator.tick_once().unwrap();

        assert!(h.cache.get(id).is_none());
        assert_eq!(h.index.vector_of(id), Some(vec![0.9, 0.8]));
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let h = harness(fast_config());
        let id = h.store.allocate_id().unwrap();
        commit_vector(&h, id, vec![0.5, 0.5]).await;

        h.coordinator.tick_once().unwrap();
        let record = h.store.outbox_get(1).unwrap().unwrap();

        // Re-applying the same payload leaves the tiers unchanged (P4).
        let before_l2 = h.index.vector_of(id);
        CoherenceCoordinator::apply_to_tiers(&h.coordinator.inner, &record).unwrap();
        assert_eq!(h.index.vector_of(id), before_l2);
        assert_eq!(h.index.len(), 1);
    }

    #[tokio::test]
    async fn per_id_order_is_preserved_under_backoff() {
        let mut config = fast_config();
        config.outbox_backoff_base_ms = 60_000;
        config.outbox_backoff_max_ms = 60_000;
        let h = harness(config);
        let id = h.store.allocate_id().unwrap();

        // First change fails and backs off; the second must wait for it.
        h.coordinator.inject_apply_fault(Some(Box::new(|_| {
            Err("injected l2 outage".to_string())
        })));
        commit_vector(&h, id, vec![1.0, 0.0]).await;
        h.coordinator.tick_once().unwrap();

        h.coordinator.inject_apply_fault(None);
        commit_vector(&h, id, vec![0.0, 1.0]).await;
        h.coordinator.tick_once().unwrap();

        // Sequence 2 stayed pending behind the backing-off sequence 1.
        assert!(!h.index.contains(id));
        let second = h.store.outbox_get(2).unwrap().unwrap();
        assert_eq!(second.state, telos_store::OutboxState::Pending);
    }

    #[tokio::test]
    async fn dead_letter_after_attempt_budget() {
        let h = harness(fast_config());
        let mut events = h.coordinator.subscribe();
        let id = h.store.allocate_id().unwrap();

        h.cache.put(id, vec![9.0]);
        h.coordinator
            .inject_apply_fault(Some(Box::new(|_| Err("deterministic failure".to_string()))));
        commit_vector(&h, id, vec![1.0]).await;

        for _ in 0..3 {
            h.coordinator.tick_once().unwrap();
        }

        let record = h.store.outbox_get(1).unwrap().unwrap();
        assert_eq!(record.state, telos_store::OutboxState::Dead);
        assert_eq!(h.coordinator.stats().dead, 1);
        // L1 was invalidated on the first attempt and never repopulated.
        assert!(h.cache.get(id).is_none());

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CoherenceEvent::CoherenceFailure { sequence: 1, .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let mut config = fast_config();
        config.outbox_lease_ms = 0;
        let h = harness(config);
        let id = h.store.allocate_id().unwrap();
        commit_vector(&h, id, vec![0.3]).await;

        // First lease expires immediately (lease_ms = 0); a successor
        // instance can lease and finish the record.
        let leased = h.store.outbox_lease(1, 0).unwrap().unwrap();
        assert_eq!(leased.attempts, 1);
        h.coordinator.tick_once().unwrap();
        let record = h.store.outbox_get(1).unwrap().unwrap();
        assert_eq!(record.state, telos_store::OutboxState::Applied);
    }

    #[tokio::test]
    async fn promotion_respects_usage_threshold() {
        let h = harness(fast_config());
        let id = h.store.allocate_id().unwrap();
        h.coordinator.promote(id, 2, &[1.0]);
        assert!(h.cache.get(id).is_none());
        h.coordinator.promote(id, 4, &[1.0]);
        assert_eq!(h.cache.get(id).unwrap().as_ref(), &vec![1.0]);
        assert_eq!(h.coordinator.stats().promoted, 1);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_ms(50, 5000, 1), 50);
        assert_eq!(backoff_ms(50, 5000, 2), 100);
        assert_eq!(backoff_ms(50, 5000, 4), 400);
        assert_eq!(backoff_ms(50, 5000, 12), 5000);
    }

    #[tokio::test]
    async fn update_with_cleared_vector_removes_l2_entry() {
        let h = harness(fast_config());
        let id = h.store.allocate_id().unwrap();
        commit_vector(&h, id, vec![1.0, 0.0]).await;
        h.coordinator.tick_once().unwrap();
        assert!(h.index.contains(id));

        let mut txn = h.store.begin();
        h.store
            .put_with_vector(&mut txn, Concept::new(id), None)
            .unwrap();
        h.store.commit(txn).await.unwrap();
        h.coordinator.tick_once().unwrap();
        assert!(!h.index.contains(id));
    }
}
