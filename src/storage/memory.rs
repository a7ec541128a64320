// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! In-memory document store with latency and fault injection.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{Cas, DocId, DocumentContent, DocumentStore, StoreError, StoreOptions, StoredDocument};

const NUM_SHARDS: usize = 64;

/// Store operation kinds, used to target injected faults and read counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Insert,
    Replace,
    Remove,
    Stage,
}

impl StoreOp {
    const ALL: [StoreOp; 5] = [
        StoreOp::Get,
        StoreOp::Insert,
        StoreOp::Replace,
        StoreOp::Remove,
        StoreOp::Stage,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// What an injected fault does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fail with `CasMismatch` without applying the operation.
    CasMismatch,
    /// Fail with `Transient` without applying the operation.
    Transient,
    /// Fail with `Timeout` without applying the operation.
    Timeout,
    /// Apply the operation, then report `Timeout` (lost acknowledgement).
    TimeoutAfterApply,
    /// Fail with `DurabilityImpossible` without applying the operation.
    DurabilityImpossible,
}

/// A fault armed against a store operation.
#[derive(Debug, Clone)]
pub struct Fault {
    op: StoreOp,
    kind: FaultKind,
    key: Option<String>,
    remaining: usize,
}

impl Fault {
    /// Creates a fault that fires once on the next matching operation.
    pub fn new(op: StoreOp, kind: FaultKind) -> Self {
        Self {
            op,
            kind,
            key: None,
            remaining: 1,
        }
    }

    /// Restricts the fault to documents with this key.
    pub fn on_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets how many times the fault fires before disarming.
    pub fn times(mut self, times: usize) -> Self {
        self.remaining = times.max(1);
        self
    }

    fn matches(&self, op: StoreOp, id: &DocId) -> bool {
        self.op == op && self.key.as_deref().map_or(true, |k| k == id.key())
    }

    fn error(&self, id: &DocId, opts: &StoreOptions) -> StoreError {
        match self.kind {
            FaultKind::CasMismatch => StoreError::CasMismatch { id: id.clone() },
            FaultKind::Transient => StoreError::Transient {
                id: id.clone(),
                reason: "injected fault".to_string(),
            },
            FaultKind::Timeout | FaultKind::TimeoutAfterApply => StoreError::Timeout {
                id: id.clone(),
                timeout: opts.timeout,
            },
            FaultKind::DurabilityImpossible => StoreError::DurabilityImpossible {
                level: opts.durability,
            },
        }
    }
}

/// A shard of the document map.
#[derive(Default)]
struct DocShard {
    docs: HashMap<DocId, StoredDocument>,
}

/// In-memory [`DocumentStore`].
///
/// Uses sharding to reduce contention; each shard is protected by a RwLock.
/// CAS values come from a single counter so they never repeat.
pub struct InMemoryDocumentStore {
    shards: [RwLock<DocShard>; NUM_SHARDS],
    next_cas: AtomicU64,
    latency: RwLock<Option<Duration>>,
    faults: Mutex<Vec<Fault>>,
    op_counts: [AtomicU64; StoreOp::ALL.len()],
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(DocShard::default())),
            next_cas: AtomicU64::new(1),
            latency: RwLock::new(None),
            faults: Mutex::new(Vec::new()),
            op_counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Adds a delay to every operation. Operations whose timeout is shorter
    /// than the delay fail with `Timeout` once the timeout elapses.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Arms a fault.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    /// Disarms all faults.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Number of operations of `op` served so far.
    pub fn op_count(&self, op: StoreOp) -> u64 {
        self.op_counts[op.index()].load(Ordering::Relaxed)
    }

    /// Reads an entry without going through the async interface or counters.
    pub fn peek(&self, id: &DocId) -> Option<StoredDocument> {
        self.shard(id).read().docs.get(id).cloned()
    }

    /// Number of entries, shadows included.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().docs.len()).sum()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn shard(&self, id: &DocId) -> &RwLock<DocShard> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % NUM_SHARDS]
    }

    #[inline]
    fn allocate_cas(&self) -> Cas {
        Cas(self.next_cas.fetch_add(1, Ordering::Relaxed))
    }

    /// Applies latency and faults ahead of an operation.
    ///
    /// Returns the error to report after applying the operation, if an
    /// armed fault asks for a lost acknowledgement.
    async fn before(
        &self,
        op: StoreOp,
        id: &DocId,
        opts: &StoreOptions,
    ) -> Result<Option<StoreError>, StoreError> {
        self.op_counts[op.index()].fetch_add(1, Ordering::Relaxed);

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            if latency > opts.timeout {
                tokio::time::sleep(opts.timeout).await;
                return Err(StoreError::Timeout {
                    id: id.clone(),
                    timeout: opts.timeout,
                });
            }
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        let Some(pos) = faults.iter().position(|f| f.matches(op, id)) else {
            return Ok(None);
        };
        let fault = faults[pos].clone();
        faults[pos].remaining -= 1;
        if faults[pos].remaining == 0 {
            faults.remove(pos);
        }
        trace!(?op, %id, kind = ?fault.kind, "injected store fault");

        let err = fault.error(id, opts);
        match fault.kind {
            FaultKind::TimeoutAfterApply => Ok(Some(err)),
            _ => Err(err),
        }
    }

    #[inline]
    fn finish<T>(value: T, deferred: Option<StoreError>) -> Result<T, StoreError> {
        match deferred {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(
        &self,
        id: &DocId,
        opts: &StoreOptions,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let deferred = self.before(StoreOp::Get, id, opts).await?;
        let doc = self.shard(id).read().docs.get(id).cloned();
        Self::finish(doc, deferred)
    }

    async fn insert(
        &self,
        id: &DocId,
        content: &DocumentContent,
        opts: &StoreOptions,
    ) -> Result<Cas, StoreError> {
        let deferred = self.before(StoreOp::Insert, id, opts).await?;
        let cas = {
            let mut shard = self.shard(id).write();
            match shard.docs.entry(id.clone()) {
                Entry::Occupied(_) => return Err(StoreError::AlreadyExists { id: id.clone() }),
                Entry::Vacant(slot) => {
                    let cas = self.allocate_cas();
                    slot.insert(StoredDocument {
                        cas,
                        content: Some(content.clone()),
                        meta: None,
                    });
                    cas
                }
            }
        };
        Self::finish(cas, deferred)
    }

    async fn replace(
        &self,
        id: &DocId,
        cas: Cas,
        content: &DocumentContent,
        opts: &StoreOptions,
    ) -> Result<Cas, StoreError> {
        let deferred = self.before(StoreOp::Replace, id, opts).await?;
        let new_cas = {
            let mut shard = self.shard(id).write();
            let doc = shard
                .docs
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
            if doc.cas != cas {
                return Err(StoreError::CasMismatch { id: id.clone() });
            }
            let new_cas = self.allocate_cas();
            doc.cas = new_cas;
            doc.content = Some(content.clone());
            doc.meta = None;
            new_cas
        };
        Self::finish(new_cas, deferred)
    }

    async fn remove(&self, id: &DocId, cas: Cas, opts: &StoreOptions) -> Result<(), StoreError> {
        let deferred = self.before(StoreOp::Remove, id, opts).await?;
        {
            let mut shard = self.shard(id).write();
            match shard.docs.get(id) {
                None => return Err(StoreError::NotFound { id: id.clone() }),
                Some(doc) if doc.cas != cas => {
                    return Err(StoreError::CasMismatch { id: id.clone() })
                }
                Some(_) => {
                    shard.docs.remove(id);
                }
            }
        }
        Self::finish((), deferred)
    }

    async fn stage(
        &self,
        id: &DocId,
        cas: Option<Cas>,
        meta: Option<&[u8]>,
        opts: &StoreOptions,
    ) -> Result<Cas, StoreError> {
        let deferred = self.before(StoreOp::Stage, id, opts).await?;
        let new_cas = {
            let mut shard = self.shard(id).write();
            match cas {
                None => match shard.docs.entry(id.clone()) {
                    Entry::Occupied(_) => {
                        return Err(StoreError::AlreadyExists { id: id.clone() })
                    }
                    Entry::Vacant(slot) => {
                        let new_cas = self.allocate_cas();
                        slot.insert(StoredDocument {
                            cas: new_cas,
                            content: None,
                            meta: meta.map(<[u8]>::to_vec),
                        });
                        new_cas
                    }
                },
                Some(expected) => {
                    let doc = shard
                        .docs
                        .get_mut(id)
                        .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
                    if doc.cas != expected {
                        return Err(StoreError::CasMismatch { id: id.clone() });
                    }
                    let new_cas = self.allocate_cas();
                    if meta.is_none() && doc.is_shadow() {
                        shard.docs.remove(id);
                    } else {
                        doc.cas = new_cas;
                        doc.meta = meta.map(<[u8]>::to_vec);
                    }
                    new_cas
                }
            }
        };
        Self::finish(new_cas, deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(key: &str) -> DocId {
        DocId::default_collection("test", key)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryDocumentStore::new();
        let opts = StoreOptions::default();

        let cas = store
            .insert(&id("a"), &DocumentContent::from("1"), &opts)
            .await
            .unwrap();
        let doc = store.get(&id("a"), &opts).await.unwrap().unwrap();
        assert_eq!(doc.cas, cas);
        assert_eq!(doc.content.unwrap().as_bytes(), b"1");
        assert!(doc.meta.is_none());

        let err = store
            .insert(&id("a"), &DocumentContent::from("2"), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_replace_checks_cas() {
        let store = InMemoryDocumentStore::new();
        let opts = StoreOptions::default();

        let cas = store
            .insert(&id("a"), &DocumentContent::from("1"), &opts)
            .await
            .unwrap();
        let cas2 = store
            .replace(&id("a"), cas, &DocumentContent::from("2"), &opts)
            .await
            .unwrap();
        assert_ne!(cas, cas2);

        // Stale CAS is rejected and the body is untouched
        let err = store
            .replace(&id("a"), cas, &DocumentContent::from("3"), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CasMismatch { .. }));
        assert_eq!(
            store.peek(&id("a")).unwrap().content.unwrap().as_bytes(),
            b"2"
        );
    }

    #[tokio::test]
    async fn test_stage_shadow_lifecycle() {
        let store = InMemoryDocumentStore::new();
        let opts = StoreOptions::default();

        let cas = store
            .stage(&id("s"), None, Some(b"meta"), &opts)
            .await
            .unwrap();
        let doc = store.peek(&id("s")).unwrap();
        assert!(doc.is_shadow());
        assert_eq!(doc.meta.as_deref(), Some(&b"meta"[..]));

        // A second shadow for the same id is rejected
        let err = store
            .stage(&id("s"), None, Some(b"other"), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        // Clearing a shadow's metadata removes it
        store.stage(&id("s"), Some(cas), None, &opts).await.unwrap();
        assert!(store.peek(&id("s")).is_none());
    }

    #[tokio::test]
    async fn test_stage_keeps_body() {
        let store = InMemoryDocumentStore::new();
        let opts = StoreOptions::default();

        let cas = store
            .insert(&id("a"), &DocumentContent::from("1"), &opts)
            .await
            .unwrap();
        let staged = store
            .stage(&id("a"), Some(cas), Some(b"links"), &opts)
            .await
            .unwrap();
        let doc = store.peek(&id("a")).unwrap();
        assert_eq!(doc.cas, staged);
        assert_eq!(doc.content.unwrap().as_bytes(), b"1");

        // Replacing the body clears the sidecar
        store
            .replace(&id("a"), staged, &DocumentContent::from("2"), &opts)
            .await
            .unwrap();
        assert!(store.peek(&id("a")).unwrap().meta.is_none());
    }

    #[tokio::test]
    async fn test_fault_fires_once_on_matching_key() {
        let store = InMemoryDocumentStore::new();
        let opts = StoreOptions::default();
        store.inject(Fault::new(StoreOp::Insert, FaultKind::Transient).on_key("b"));

        store
            .insert(&id("a"), &DocumentContent::from("1"), &opts)
            .await
            .unwrap();
        let err = store
            .insert(&id("b"), &DocumentContent::from("1"), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transient { .. }));
        assert!(store.peek(&id("b")).is_none());

        store
            .insert(&id("b"), &DocumentContent::from("1"), &opts)
            .await
            .unwrap();
        assert_eq!(store.op_count(StoreOp::Insert), 3);
    }

    #[tokio::test]
    async fn test_timeout_after_apply() {
        let store = InMemoryDocumentStore::new();
        let opts = StoreOptions::default();
        store.inject(Fault::new(StoreOp::Insert, FaultKind::TimeoutAfterApply));

        let err = store
            .insert(&id("a"), &DocumentContent::from("1"), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
        assert!(store.peek(&id("a")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_beyond_timeout() {
        let store = InMemoryDocumentStore::new();
        store.set_latency(Some(Duration::from_secs(5)));
        let opts = StoreOptions::new(Duration::from_secs(1), Default::default());

        let started = tokio::time::Instant::now();
        let err = store.get(&id("a"), &opts).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }
}
