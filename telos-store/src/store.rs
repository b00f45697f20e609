//! The sled-backed concept store

use crate::error::{StoreError, StoreResult};
use crate::record::{Change, ChangeKind, OutboxRecord, OutboxState, StoredConcept, Tier};
use crate::txn::{Transaction, WriteOp};
use sled::transaction::{ConflictableTransactionError, Transactional};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use telos_kernel::{Concept, ConceptId};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

const META_NEXT_ID: &[u8] = b"next_concept_id";
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Store-level counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Concepts currently stored
    pub concepts: usize,
    /// Last committed change sequence
    pub last_sequence: u64,
    /// Outbox records awaiting propagation
    pub outbox_pending: usize,
    /// Outbox records in the dead-letter state
    pub outbox_dead: usize,
}

/// Single-writer, many-reader transactional store over concepts.
///
/// Cheap to clone; clones share the same database.
#[derive(Clone)]
pub struct ConceptStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    _db: sled::Db,
    concepts: sled::Tree,
    outbox: sled::Tree,
    meta: sled::Tree,
    writer: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<Change>,
    last_sequence: AtomicU64,
}

fn key_of(id: ConceptId) -> [u8; 8] {
    id.as_u64().to_be_bytes()
}

fn seq_key(sequence: u64) -> [u8; 8] {
    sequence.to_be_bytes()
}

fn decode_stored(bytes: &[u8]) -> StoreResult<StoredConcept> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode_stored(record: &StoredConcept) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

fn decode_outbox(bytes: &[u8]) -> StoreResult<OutboxRecord> {
    bincode::deserialize(bytes).map_err(|e| StoreError::StorageFailure(format!("outbox codec: {e}")))
}

fn encode_outbox(record: &OutboxRecord) -> StoreResult<Vec<u8>> {
    bincode::serialize(record).map_err(|e| StoreError::StorageFailure(format!("outbox codec: {e}")))
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl ConceptStore {
    /// Open (or create) the store under `dir`
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(dir.as_ref())?;
        let concepts = db.open_tree("concepts")?;
        let outbox = db.open_tree("outbox")?;
        let meta = db.open_tree("meta")?;

        // The outbox key space is the change sequence; its last key is the
        // sequence cursor, so the cursor needs no separate durable cell.
        let last_sequence = outbox
            .last()?
            .map(|(key, _)| u64::from_be_bytes(key.as_ref().try_into().unwrap_or_default()))
            .unwrap_or(0);

        debug!(last_sequence, "concept store opened");
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                _db: db,
                concepts,
                outbox,
                meta,
                writer: tokio::sync::Mutex::new(()),
                changes,
                last_sequence: AtomicU64::new(last_sequence),
            }),
        })
    }

    /// Allocate the next concept identifier from the persisted counter
    pub fn allocate_id(&self) -> StoreResult<ConceptId> {
        let updated = self.inner.meta.update_and_fetch(META_NEXT_ID, |old| {
            let next = old
                .map(|v| u64::from_be_bytes(v.try_into().unwrap_or_default()))
                .unwrap_or(1);
            Some((next + 1).to_be_bytes().to_vec())
        })?;
        let next = updated
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or_default()))
            .unwrap_or(2);
        Ok(ConceptId(next - 1))
    }

    /// Begin a transaction against the current committed state
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.inner.last_sequence.load(Ordering::Acquire))
    }

    /// Read a concept inside a transaction (repeatable; read-your-writes)
    pub fn get(&self, txn: &mut Transaction, id: ConceptId) -> StoreResult<Option<Concept>> {
        if txn.aborted {
            return Err(StoreError::Invalid("transaction aborted".to_string()));
        }
        if let Some(op) = txn.writes.get(&id) {
            return Ok(match op {
                WriteOp::Put { concept, .. } => Some(concept.clone()),
                WriteOp::Delete => None,
            });
        }
        if let Some((_, cached)) = txn.reads.get(&id) {
            return Ok(cached.as_ref().map(|r| r.concept.clone()));
        }
        let record = self.read_committed(id)?;
        let version = record.as_ref().map(|r| r.version).unwrap_or(0);
        let concept = record.as_ref().map(|r| r.concept.clone());
        txn.reads.insert(id, (version, record));
        Ok(concept)
    }

    /// Buffer an insert/overwrite, keeping any previously stored embedding
    pub fn put(&self, txn: &mut Transaction, concept: Concept) -> StoreResult<()> {
        self.buffer_put(txn, concept, None, true)
    }

    /// Buffer an insert/overwrite together with a refreshed embedding.
    /// `None` clears the stored embedding.
    pub fn put_with_vector(
        &self,
        txn: &mut Transaction,
        concept: Concept,
        vector: Option<Vec<f32>>,
    ) -> StoreResult<()> {
        self.buffer_put(txn, concept, vector, false)
    }

    fn buffer_put(
        &self,
        txn: &mut Transaction,
        concept: Concept,
        vector: Option<Vec<f32>>,
        keep_stored_vector: bool,
    ) -> StoreResult<()> {
        if txn.aborted {
            return Err(StoreError::Invalid("transaction aborted".to_string()));
        }
        txn.writes.insert(
            concept.id,
            WriteOp::Put {
                concept,
                vector,
                keep_stored_vector,
            },
        );
        Ok(())
    }

    /// Buffer a delete
    pub fn delete(&self, txn: &mut Transaction, id: ConceptId) -> StoreResult<()> {
        if txn.aborted {
            return Err(StoreError::Invalid("transaction aborted".to_string()));
        }
        txn.writes.insert(id, WriteOp::Delete);
        Ok(())
    }

    /// Abort a transaction, discarding its buffered writes
    pub fn abort(&self, mut txn: Transaction) {
        txn.aborted = true;
    }

    /// Commit: validate the read set, apply mutations and their outbox
    /// records atomically, make them durable, then publish change records.
    /// Returns the last sequence number committed.
    #[instrument(skip_all, fields(writes = txn.writes.len()))]
    pub async fn commit(&self, txn: Transaction) -> StoreResult<u64> {
        if txn.aborted {
            return Err(StoreError::Invalid("transaction aborted".to_string()));
        }
        let _writer = self.inner.writer.lock().await;

        // First-committer-wins: every version observed by this transaction
        // must still be current.
        for (id, (observed_version, _)) in &txn.reads {
            let current = self
                .read_committed(*id)?
                .map(|r| r.version)
                .unwrap_or(0);
            if current != *observed_version {
                return Err(StoreError::Conflict(id.to_string()));
            }
        }

        // A concept leaves the store only when nothing references it.
        for (id, op) in &txn.writes {
            if matches!(op, WriteOp::Delete) {
                self.check_unreferenced(*id, &txn)?;
            }
        }

        // Materialize mutations and their change/outbox records.
        let base_sequence = self.inner.last_sequence.load(Ordering::Acquire);
        let mut next_sequence = base_sequence;
        let mut concept_writes: Vec<([u8; 8], Option<Vec<u8>>)> = Vec::new();
        let mut outbox_writes: Vec<([u8; 8], Vec<u8>)> = Vec::new();
        let mut published: Vec<Change> = Vec::new();

        for (id, op) in &txn.writes {
            let prior = self.read_committed(*id)?;
            let (kind, record) = match op {
                WriteOp::Put {
                    concept,
                    vector,
                    keep_stored_vector,
                } => {
                    let kind = if prior.is_some() {
                        ChangeKind::Update
                    } else {
                        ChangeKind::Insert
                    };
                    let vector = if *keep_stored_vector {
                        prior.as_ref().and_then(|r| r.vector.clone())
                    } else {
                        vector.clone()
                    };
                    let record = StoredConcept {
                        version: prior.as_ref().map(|r| r.version).unwrap_or(0) + 1,
                        concept: concept.clone(),
                        vector,
                    };
                    (kind, Some(record))
                }
                WriteOp::Delete => {
                    if prior.is_none() {
                        // Deleting an absent id is a no-op, not a change.
                        continue;
                    }
                    (ChangeKind::Delete, None)
                }
            };

            next_sequence += 1;
            let vector_ref = record.as_ref().and_then(|r| r.vector.as_deref());
            let outbox = OutboxRecord {
                sequence: next_sequence,
                targets: vec![Tier::L2, Tier::L1],
                kind,
                concept_id: *id,
                payload_hash: OutboxRecord::hash_payload(kind, *id, vector_ref),
                vector: vector_ref.map(|v| v.to_vec()),
                attempts: 0,
                earliest_retry_ms: 0,
                state: OutboxState::Pending,
                lease_until_ms: 0,
            };

            concept_writes.push((key_of(*id), record.as_ref().map(encode_stored).transpose()?));
            outbox_writes.push((seq_key(next_sequence), encode_outbox(&outbox)?));
            published.push(Change {
                sequence: next_sequence,
                id: *id,
                kind,
                snapshot: record,
            });
        }

        if published.is_empty() {
            return Ok(base_sequence);
        }

        // One atomic multi-tree write: concept mutations and their outbox
        // records move together or not at all.
        (&self.inner.concepts, &self.inner.outbox)
            .transaction(|(concepts, outbox)| {
                for (key, value) in &concept_writes {
                    match value {
                        Some(bytes) => {
                            concepts.insert(key.as_slice(), bytes.as_slice())?;
                        }
                        None => {
                            concepts.remove(key.as_slice())?;
                        }
                    }
                }
                for (key, bytes) in &outbox_writes {
                    outbox.insert(key.as_slice(), bytes.as_slice())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| StoreError::StorageFailure(format!("{e:?}")))?;

        // Durable before commit returns.
        self.inner
            ._db
            .flush_async()
            .await
            .map_err(|e| StoreError::StorageFailure(e.to_string()))?;

        self.inner
            .last_sequence
            .store(next_sequence, Ordering::Release);
        for change in published {
            // Lagging or absent subscribers are not a commit failure.
            let _ = self.inner.changes.send(change);
        }

        Ok(next_sequence)
    }

    /// Subscribe to the change stream; returns the sequence the stream is
    /// current as-of plus the receiver.
    pub fn subscribe(&self) -> (u64, broadcast::Receiver<Change>) {
        (
            self.inner.last_sequence.load(Ordering::Acquire),
            self.inner.changes.subscribe(),
        )
    }

    /// Read the committed record for an id, outside any transaction
    pub fn read_committed(&self, id: ConceptId) -> StoreResult<Option<StoredConcept>> {
        match self.inner.concepts.get(key_of(id))? {
            Some(bytes) => Ok(Some(decode_stored(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Scan every stored concept (used to regenerate L2)
    pub fn scan(&self) -> StoreResult<Vec<StoredConcept>> {
        let mut records = Vec::new();
        for entry in self.inner.concepts.iter() {
            let (_, bytes) = entry?;
            records.push(decode_stored(&bytes)?);
        }
        Ok(records)
    }

    /// Last committed change sequence
    pub fn last_sequence(&self) -> u64 {
        self.inner.last_sequence.load(Ordering::Acquire)
    }

    fn check_unreferenced(&self, id: ConceptId, txn: &Transaction) -> StoreResult<()> {
        // Writes buffered in this transaction take precedence over stored
        // state; a concept deleted alongside its referencer is fine.
        for (other_id, op) in &txn.writes {
            if *other_id == id {
                continue;
            }
            if let WriteOp::Put { concept, .. } = op {
                if concept.referenced_ids().contains(&id) {
                    return Err(StoreError::Invalid(format!(
                        "{id} is still referenced by {other_id}"
                    )));
                }
            }
        }
        for entry in self.inner.concepts.iter() {
            let (key, bytes) = entry?;
            let other_id = ConceptId(u64::from_be_bytes(
                key.as_ref().try_into().unwrap_or_default(),
            ));
            if other_id == id || txn.writes.contains_key(&other_id) {
                continue;
            }
            let record = decode_stored(&bytes)?;
            if record.concept.referenced_ids().contains(&id) {
                return Err(StoreError::Invalid(format!(
                    "{id} is still referenced by {other_id}"
                )));
            }
        }
        Ok(())
    }

    // --- outbox accessors (consumed by the coherence coordinator) ---

    /// Records eligible for a lease at `now_ms`, in sequence order
    pub fn outbox_eligible(&self, now_ms: u64, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let mut eligible = Vec::new();
        for entry in self.inner.outbox.iter() {
            let (_, bytes) = entry?;
            let record = decode_outbox(&bytes)?;
            if record.leasable(now_ms) {
                eligible.push(record);
                if eligible.len() >= limit {
                    break;
                }
            }
        }
        Ok(eligible)
    }

    /// Lease an eligible record: `pending` (or expired `in_flight`) becomes
    /// `in_flight` with a fresh lease and a bumped attempt count. Returns
    /// `None` when the record is no longer leasable.
    pub fn outbox_lease(
        &self,
        sequence: u64,
        lease_ms: u64,
    ) -> StoreResult<Option<OutboxRecord>> {
        let key = seq_key(sequence);
        loop {
            let Some(current_bytes) = self.inner.outbox.get(key)? else {
                return Ok(None);
            };
            let current = decode_outbox(&current_bytes)?;
            let now = now_ms();
            if !current.leasable(now) {
                return Ok(None);
            }
            let mut leased = current.clone();
            leased.state = OutboxState::InFlight;
            leased.lease_until_ms = now + lease_ms;
            leased.attempts += 1;
            let leased_bytes = encode_outbox(&leased)?;
            match self.inner.outbox.compare_and_swap(
                key,
                Some(current_bytes),
                Some(leased_bytes),
            )? {
                Ok(()) => return Ok(Some(leased)),
                Err(_) => continue,
            }
        }
    }

    /// Mark a record applied; applied records are never reread
    pub fn outbox_mark_applied(&self, sequence: u64) -> StoreResult<()> {
        self.update_outbox(sequence, |record| {
            record.state = OutboxState::Applied;
            record.lease_until_ms = 0;
        })
    }

    /// Return a record to `pending` with a retry-at timestamp
    pub fn outbox_mark_retry(&self, sequence: u64, earliest_retry_ms: u64) -> StoreResult<()> {
        self.update_outbox(sequence, |record| {
            record.state = OutboxState::Pending;
            record.lease_until_ms = 0;
            record.earliest_retry_ms = earliest_retry_ms;
        })
    }

    /// Move a record to the dead-letter state
    pub fn outbox_mark_dead(&self, sequence: u64) -> StoreResult<()> {
        warn!(sequence, "outbox record dead-lettered");
        self.update_outbox(sequence, |record| {
            record.state = OutboxState::Dead;
            record.lease_until_ms = 0;
        })
    }

    /// Whether a pending or in-flight record with a smaller sequence exists
    /// for the same concept. Used to keep per-id apply order while records
    /// for different ids proceed independently; dead records do not block.
    pub fn outbox_has_earlier_unapplied(
        &self,
        id: ConceptId,
        sequence: u64,
    ) -> StoreResult<bool> {
        for entry in self.inner.outbox.range(..seq_key(sequence).to_vec()) {
            let (_, bytes) = entry?;
            let record = decode_outbox(&bytes)?;
            if record.concept_id == id
                && matches!(record.state, OutboxState::Pending | OutboxState::InFlight)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Read a single outbox record
    pub fn outbox_get(&self, sequence: u64) -> StoreResult<Option<OutboxRecord>> {
        match self.inner.outbox.get(seq_key(sequence))? {
            Some(bytes) => Ok(Some(decode_outbox(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update_outbox(&self, sequence: u64, f: impl Fn(&mut OutboxRecord)) -> StoreResult<()> {
        let key = seq_key(sequence);
        loop {
            let Some(current_bytes) = self.inner.outbox.get(key)? else {
                return Err(StoreError::NotFound(format!("outbox record {sequence}")));
            };
            let mut record = decode_outbox(&current_bytes)?;
            f(&mut record);
            let next_bytes = encode_outbox(&record)?;
            match self
                .inner
                .outbox
                .compare_and_swap(key, Some(current_bytes), Some(next_bytes))?
            {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    /// Store-level counters
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let mut pending = 0;
        let mut dead = 0;
        for entry in self.inner.outbox.iter() {
            let (_, bytes) = entry?;
            match decode_outbox(&bytes)?.state {
                OutboxState::Pending | OutboxState::InFlight => pending += 1,
                OutboxState::Dead => dead += 1,
                OutboxState::Applied => {}
            }
        }
        Ok(StoreStats {
            concepts: self.inner.concepts.len(),
            last_sequence: self.inner.last_sequence.load(Ordering::Acquire),
            outbox_pending: pending,
            outbox_dead: dead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telos_kernel::RelationKind;

    fn open_store() -> (tempfile::TempDir, ConceptStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConceptStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_commit_get_round_trip() {
        let (_dir, store) = open_store();
        let id = store.allocate_id().unwrap();
        let concept = Concept::labeled(id, "entropy");

        let mut txn = store.begin();
        store
            .put_with_vector(&mut txn, concept.clone(), Some(vec![0.1, 0.2]))
            .unwrap();
        let seq = store.commit(txn).await.unwrap();
        assert_eq!(seq, 1);

        let mut txn = store.begin();
        let loaded = store.get(&mut txn, id).unwrap().unwrap();
        assert_eq!(loaded.label.as_deref(), Some("entropy"));
        let record = store.read_committed(id).unwrap().unwrap();
        assert_eq!(record.vector, Some(vec![0.1, 0.2]));
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn conflicting_commit_fails_first_committer_wins() {
        let (_dir, store) = open_store();
        let id = store.allocate_id().unwrap();
        let mut setup = store.begin();
        store.put(&mut setup, Concept::labeled(id, "v0")).unwrap();
        store.commit(setup).await.unwrap();

        let mut a = store.begin();
        let mut b = store.begin();
        let mut from_a = store.get(&mut a, id).unwrap().unwrap();
        let mut from_b = store.get(&mut b, id).unwrap().unwrap();

        from_a.label = Some("from-a".to_string());
        store.put(&mut a, from_a).unwrap();
        store.commit(a).await.unwrap();

        from_b.label = Some("from-b".to_string());
        store.put(&mut b, from_b).unwrap();
        let err = store.commit(b).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let record = store.read_committed(id).unwrap().unwrap();
        assert_eq!(record.concept.label.as_deref(), Some("from-a"));
    }

    #[tokio::test]
    async fn change_stream_sequences_are_gap_free() {
        let (_dir, store) = open_store();
        let (as_of, mut rx) = store.subscribe();
        assert_eq!(as_of, 0);

        for i in 0..3 {
            let id = store.allocate_id().unwrap();
            let mut txn = store.begin();
            store
                .put(&mut txn, Concept::labeled(id, format!("c{i}")))
                .unwrap();
            store.commit(txn).await.unwrap();
        }

        let mut sequences = Vec::new();
        for _ in 0..3 {
            sequences.push(rx.recv().await.unwrap().sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn update_and_delete_produce_kinds_and_outbox_records() {
        let (_dir, store) = open_store();
        let id = store.allocate_id().unwrap();

        let mut txn = store.begin();
        store
            .put_with_vector(&mut txn, Concept::new(id), Some(vec![1.0]))
            .unwrap();
        store.commit(txn).await.unwrap();

        let mut txn = store.begin();
        store
            .put_with_vector(&mut txn, Concept::new(id), Some(vec![2.0]))
            .unwrap();
        store.commit(txn).await.unwrap();

        let mut txn = store.begin();
        store.delete(&mut txn, id).unwrap();
        store.commit(txn).await.unwrap();

        let first = store.outbox_get(1).unwrap().unwrap();
        let second = store.outbox_get(2).unwrap().unwrap();
        let third = store.outbox_get(3).unwrap().unwrap();
        assert_eq!(first.kind, ChangeKind::Insert);
        assert_eq!(second.kind, ChangeKind::Update);
        assert_eq!(third.kind, ChangeKind::Delete);
        assert_eq!(second.vector, Some(vec![2.0]));
        assert_eq!(third.vector, None);
        assert_ne!(first.payload_hash, second.payload_hash);
        assert!(first.state == OutboxState::Pending);
    }

    #[tokio::test]
    async fn delete_of_referenced_concept_is_rejected() {
        let (_dir, store) = open_store();
        let target = store.allocate_id().unwrap();
        let referrer = store.allocate_id().unwrap();

        let mut txn = store.begin();
        store.put(&mut txn, Concept::new(target)).unwrap();
        let mut r = Concept::new(referrer);
        r.relate(RelationKind::IsA, target).unwrap();
        store.put(&mut txn, r).unwrap();
        store.commit(txn).await.unwrap();

        let mut txn = store.begin();
        store.delete(&mut txn, target).unwrap();
        assert!(matches!(
            store.commit(txn).await.unwrap_err(),
            StoreError::Invalid(_)
        ));

        // Removing the referencer first unblocks the delete.
        let mut txn = store.begin();
        store.delete(&mut txn, referrer).unwrap();
        store.delete(&mut txn, target).unwrap();
        store.commit(txn).await.unwrap();
        assert!(store.read_committed(target).unwrap().is_none());
    }

    #[tokio::test]
    async fn abort_discards_buffered_writes() {
        let (_dir, store) = open_store();
        let id = store.allocate_id().unwrap();
        let mut txn = store.begin();
        store.put(&mut txn, Concept::new(id)).unwrap();
        store.abort(txn);
        assert!(store.read_committed(id).unwrap().is_none());
        assert_eq!(store.last_sequence(), 0);
    }

    #[tokio::test]
    async fn outbox_lease_lifecycle() {
        let (_dir, store) = open_store();
        let id = store.allocate_id().unwrap();
        let mut txn = store.begin();
        store
            .put_with_vector(&mut txn, Concept::new(id), Some(vec![0.5]))
            .unwrap();
        store.commit(txn).await.unwrap();

        let eligible = store.outbox_eligible(now_ms(), 16).unwrap();
        assert_eq!(eligible.len(), 1);

        let leased = store.outbox_lease(1, 60_000).unwrap().unwrap();
        assert_eq!(leased.state, OutboxState::InFlight);
        assert_eq!(leased.attempts, 1);

        // A held lease is not re-leasable.
        assert!(store.outbox_lease(1, 60_000).unwrap().is_none());

        store.outbox_mark_applied(1).unwrap();
        assert!(store.outbox_eligible(now_ms(), 16).unwrap().is_empty());
        assert!(store.outbox_lease(1, 60_000).unwrap().is_none());
    }

    #[tokio::test]
    async fn outbox_retry_and_dead_letter() {
        let (_dir, store) = open_store();
        let id = store.allocate_id().unwrap();
        let mut txn = store.begin();
        store.put(&mut txn, Concept::new(id)).unwrap();
        store.commit(txn).await.unwrap();

        store.outbox_lease(1, 60_000).unwrap().unwrap();
        store.outbox_mark_retry(1, now_ms() + 10_000).unwrap();
        // Not eligible until the retry timestamp passes.
        assert!(store.outbox_eligible(now_ms(), 16).unwrap().is_empty());
        assert!(!store.outbox_eligible(now_ms() + 20_000, 16).unwrap().is_empty());

        store.outbox_mark_dead(1).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.outbox_dead, 1);
        assert_eq!(stats.outbox_pending, 0);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let store = ConceptStore::open(dir.path()).unwrap();
            id = store.allocate_id().unwrap();
            let mut txn = store.begin();
            store
                .put_with_vector(&mut txn, Concept::labeled(id, "durable"), Some(vec![3.0]))
                .unwrap();
            store.commit(txn).await.unwrap();
        }
        let store = ConceptStore::open(dir.path()).unwrap();
        let record = store.read_committed(id).unwrap().unwrap();
        assert_eq!(record.concept.label.as_deref(), Some("durable"));
        assert_eq!(store.last_sequence(), 1);
        let fresh = store.allocate_id().unwrap();
        assert!(fresh > id);
    }
}
