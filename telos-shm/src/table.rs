//! Segment registry with reference-counted lifetime

use crate::view::SegmentView;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use telos_kernel::{Dtype, ErrorKind, HandleRef, TelosError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors raised by the handle table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShmError {
    /// The named segment has been released or never existed
    #[error("handle expired: {0}")]
    HandleExpired(String),

    /// Bad allocation request or dtype/view mismatch
    #[error("invalid handle operation: {0}")]
    Invalid(String),

    /// The owner token is not registered
    #[error("unknown owner token: {0}")]
    UnknownOwner(Uuid),
}

impl From<ShmError> for TelosError {
    fn from(err: ShmError) -> Self {
        let kind = match &err {
            ShmError::HandleExpired(_) => ErrorKind::HandleExpired,
            ShmError::Invalid(_) | ShmError::UnknownOwner(_) => ErrorKind::InvalidArgument,
        };
        TelosError::new(kind, err.to_string())
    }
}

/// Opaque capability token identifying the component that owns a segment.
///
/// Tokens exist so the reaper can tell live owners from crashed ones; they
/// grant nothing by themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(Uuid);

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner:{}", self.0)
    }
}

/// A live capability to a shared-memory segment.
///
/// Holds the serializable descriptor plus the owner token it was allocated
/// under. The reference count lives in the table, not here; cloning a
/// `SharedHandle` does not retain.
#[derive(Debug, Clone)]
pub struct SharedHandle {
    href: HandleRef,
    owner: OwnerToken,
}

impl SharedHandle {
    /// The serializable descriptor for this segment
    pub fn href(&self) -> &HandleRef {
        &self.href
    }

    /// The owner token the segment was allocated under
    pub fn owner(&self) -> OwnerToken {
        self.owner
    }
}

pub(crate) struct Segment {
    pub(crate) bytes: Arc<RwLock<Vec<u8>>>,
    pub(crate) href: HandleRef,
    refcount: AtomicUsize,
    owner: OwnerToken,
}

/// Counters exposed to the free-energy feature vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmStats {
    /// Segments currently registered
    pub live_segments: usize,
    /// Bytes held by live segments
    pub live_bytes: usize,
    /// Allocations over the table lifetime
    pub total_allocations: u64,
    /// Segments released by the reaper
    pub reaped: u64,
}

/// Process-wide registry of shared-memory segments.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct HandleTable {
    inner: Arc<TableInner>,
}

struct TableInner {
    /// Process generation, part of every segment name
    generation: Uuid,
    /// Monotonic name counter
    next_id: AtomicU64,
    /// Live segments by name
    segments: DashMap<String, Arc<Segment>>,
    /// Live owner tokens
    owners: DashMap<Uuid, ()>,
    /// Lifetime allocation counter
    total_allocations: AtomicU64,
    /// Reaper release counter
    reaped: AtomicU64,
}

impl HandleTable {
    /// Create a registry for a fresh process generation
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                generation: Uuid::new_v4(),
                next_id: AtomicU64::new(1),
                segments: DashMap::new(),
                owners: DashMap::new(),
                total_allocations: AtomicU64::new(0),
                reaped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new owner token (one per component or worker)
    pub fn register_owner(&self) -> OwnerToken {
        let token = OwnerToken(Uuid::new_v4());
        self.inner.owners.insert(token.0, ());
        token
    }

    /// Invalidate an owner token, marking its segments as orphaned.
    ///
    /// Segments are not released here; the reaper does that, so in-flight
    /// readers of a crashing worker's buffers are not yanked mid-scan.
    pub fn invalidate_owner(&self, token: OwnerToken) {
        self.inner.owners.remove(&token.0);
    }

    /// Allocate a zero-filled segment with reference count 1
    pub fn allocate(
        &self,
        element_count: usize,
        dtype: Dtype,
        owner: OwnerToken,
    ) -> crate::Result<SharedHandle> {
        if element_count == 0 {
            return Err(ShmError::Invalid("zero-length segment".to_string()));
        }
        if !self.inner.owners.contains_key(&owner.0) {
            return Err(ShmError::UnknownOwner(owner.0));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("telos-shm-{}-{}", self.inner.generation.simple(), id);
        let href = HandleRef {
            name: name.clone(),
            dtype,
            element_count,
        };

        let segment = Arc::new(Segment {
            bytes: Arc::new(RwLock::new(vec![0u8; href.byte_len()])),
            href: href.clone(),
            refcount: AtomicUsize::new(1),
            owner,
        });
        self.inner.segments.insert(name, segment);
        self.inner.total_allocations.fetch_add(1, Ordering::Relaxed);

        debug!(handle = %href, "segment allocated");
        Ok(SharedHandle { href, owner })
    }

    /// Increment the reference count of a live segment
    pub fn retain(&self, href: &HandleRef) -> crate::Result<()> {
        let segment = self
            .inner
            .segments
            .get(&href.name)
            .ok_or_else(|| ShmError::HandleExpired(href.name.clone()))?;
        segment.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Decrement the reference count; the decrement that reaches zero
    /// unregisters the segment before returning.
    pub fn release(&self, href: &HandleRef) -> crate::Result<()> {
        let removed = {
            let segment = self
                .inner
                .segments
                .get(&href.name)
                .ok_or_else(|| ShmError::HandleExpired(href.name.clone()))?;
            segment.refcount.fetch_sub(1, Ordering::AcqRel) == 1
        };
        if removed {
            self.inner.segments.remove(&href.name);
            debug!(handle = %href, "segment reclaimed");
        }
        Ok(())
    }

    /// Map a live segment into a view.
    ///
    /// Views over the same segment share bytes; each view is independent and
    /// unmapped by drop.
    pub fn map(&self, href: &HandleRef) -> crate::Result<SegmentView> {
        let segment = self
            .inner
            .segments
            .get(&href.name)
            .ok_or_else(|| ShmError::HandleExpired(href.name.clone()))?;
        Ok(SegmentView::new(Arc::clone(&segment.bytes), segment.href.clone()))
    }

    /// Current reference count of a segment, if live
    pub fn refcount(&self, href: &HandleRef) -> Option<usize> {
        self.inner
            .segments
            .get(&href.name)
            .map(|s| s.refcount.load(Ordering::Acquire))
    }

    /// Whether a segment is still registered
    pub fn is_live(&self, href: &HandleRef) -> bool {
        self.inner.segments.contains_key(&href.name)
    }

    /// Release every segment whose owner token has been invalidated.
    ///
    /// Returns the number of segments reclaimed. Called by the worker pool
    /// monitor after replacing a crashed worker.
    pub fn reap_orphans(&self) -> usize {
        let orphaned: Vec<String> = self
            .inner
            .segments
            .iter()
            .filter(|entry| !self.inner.owners.contains_key(&entry.owner.0))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reclaimed = 0;
        for name in orphaned {
            if self.inner.segments.remove(&name).is_some() {
                reclaimed += 1;
                warn!(segment = %name, "reaped orphaned segment");
            }
        }
        self.inner.reaped.fetch_add(reclaimed as u64, Ordering::Relaxed);
        reclaimed
    }

    /// Snapshot of table counters
    pub fn stats(&self) -> ShmStats {
        let live_bytes = self
            .inner
            .segments
            .iter()
            .map(|s| s.href.byte_len())
            .sum();
        ShmStats {
            live_segments: self.inner.segments.len(),
            live_bytes,
            total_allocations: self.inner.total_allocations.load(Ordering::Relaxed),
            reaped: self.inner.reaped.load(Ordering::Relaxed),
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table_and_owner() -> (HandleTable, OwnerToken) {
        let table = HandleTable::new();
        let owner = table.register_owner();
        (table, owner)
    }

    #[test]
    fn allocate_starts_at_refcount_one() {
        let (table, owner) = table_and_owner();
        let h = table.allocate(16, Dtype::F32, owner).unwrap();
        assert_eq!(table.refcount(h.href()), Some(1));
    }

    #[test]
    fn release_to_zero_expires_handle() {
        let (table, owner) = table_and_owner();
        let h = table.allocate(16, Dtype::F32, owner).unwrap();
        table.retain(h.href()).unwrap();
        table.release(h.href()).unwrap();
        assert!(table.is_live(h.href()));
        table.release(h.href()).unwrap();
        assert!(!table.is_live(h.href()));
        assert_eq!(
            table.map(h.href()).unwrap_err(),
            ShmError::HandleExpired(h.href().name.clone())
        );
    }

    #[test]
    fn release_after_expiry_is_an_error() {
        let (table, owner) = table_and_owner();
        let h = table.allocate(4, Dtype::U8, owner).unwrap();
        table.release(h.href()).unwrap();
        assert!(matches!(
            table.release(h.href()),
            Err(ShmError::HandleExpired(_))
        ));
    }

    #[test]
    fn views_share_bytes() {
        let (table, owner) = table_and_owner();
        let h = table.allocate(8, Dtype::F32, owner).unwrap();
        let writer = table.map(h.href()).unwrap();
        let reader = table.map(h.href()).unwrap();
        writer.fill_f32(2.5).unwrap();
        assert!(reader.read_f32().unwrap().iter().all(|v| *v == 2.5));
    }

    #[test]
    fn names_are_unique() {
        let (table, owner) = table_and_owner();
        let a = table.allocate(1, Dtype::U8, owner).unwrap();
        let b = table.allocate(1, Dtype::U8, owner).unwrap();
        assert_ne!(a.href().name, b.href().name);
    }

    #[test]
    fn zero_length_allocation_rejected() {
        let (table, owner) = table_and_owner();
        assert!(table.allocate(0, Dtype::F32, owner).is_err());
    }

    #[test]
    fn reaper_releases_orphans_only() {
        let table = HandleTable::new();
        let live = table.register_owner();
        let crashed = table.register_owner();
        let kept = table.allocate(4, Dtype::F32, live).unwrap();
        let orphan = table.allocate(4, Dtype::F32, crashed).unwrap();

        table.invalidate_owner(crashed);
        assert_eq!(table.reap_orphans(), 1);
        assert!(table.is_live(kept.href()));
        assert!(!table.is_live(orphan.href()));
        assert_eq!(table.stats().reaped, 1);
    }

    proptest! {
        // P1: balanced retain/release sequences leave no live segments and
        // no view outlives its segment's bytes.
        #[test]
        fn balanced_sequences_drain_the_table(extra_retains in 0usize..8) {
            let (table, owner) = table_and_owner();
            let h = table.allocate(4, Dtype::F32, owner).unwrap();
            for _ in 0..extra_retains {
                table.retain(h.href()).unwrap();
            }
            for _ in 0..extra_retains + 1 {
                table.release(h.href()).unwrap();
            }
            prop_assert_eq!(table.stats().live_segments, 0);
            prop_assert!(table.map(h.href()).is_err());
        }
    }
}
