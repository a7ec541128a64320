// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Resolution of attempts that did not finish on their own.
//!
//! Two sources feed cleanup:
//!
//! - *Client attempts*: attempts of this client whose unstaging or rollback
//!   stopped part-way. They are queued by the attempt itself and resolved by
//!   a background task as soon as possible.
//! - *Lost attempts*: entries left in ATRs by clients that crashed. A
//!   background task sweeps every ATR of every known metadata collection
//!   once per cleanup window and resolves entries that are definitely
//!   expired.
//!
//! Resolution follows the ATR entry: a `COMMITTED` attempt has its staged
//! content moved into place, anything else has its staging markers removed.
//! Documents are only touched while their links still name the attempt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::storage::{DocId, DocumentStore, StoreError, StoreOptions, StoredDocument};
use crate::time::TimeService;

use super::atr::{self, AtrEntry, AtrState, EntryUpdate, TxnLinks};
use super::config::{MetadataCollection, TransactionConfig};
use super::staged::MutationKind;

/// Bound on re-reads of a document that keeps changing under cleanup.
const MAX_DOC_SPINS: usize = 8;

/// What cleanup did with an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The attempt was committed; its changes are now in place.
    Completed,
    /// The attempt was not committed; its markers are gone.
    RolledBack,
    /// Nothing to do yet: the entry is absent or still live.
    Skipped,
}

/// A request to resolve one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CleanupRequest {
    pub atr_id: DocId,
    pub attempt_id: String,
    /// Resolve even if the entry has not expired.
    pub force: bool,
}

/// Resolves attempts recorded in ATRs.
pub struct Cleaner {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn TimeService>,
    opts: StoreOptions,
    num_atrs: usize,
    collections: Mutex<HashSet<MetadataCollection>>,
}

impl Cleaner {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn TimeService>,
        config: &TransactionConfig,
    ) -> Self {
        let mut collections = HashSet::new();
        if let Some(collection) = &config.metadata_collection {
            collections.insert(collection.clone());
        }
        Self {
            store,
            clock,
            opts: StoreOptions::new(config.kv_timeout, config.durability),
            num_atrs: config.num_atrs,
            collections: Mutex::new(collections),
        }
    }

    /// Adds a metadata collection to the lost-attempt sweep.
    pub fn register_collection(&self, collection: MetadataCollection) {
        self.collections.lock().insert(collection);
    }

    /// Collections currently swept.
    pub fn collections(&self) -> Vec<MetadataCollection> {
        self.collections.lock().iter().cloned().collect()
    }

    /// Resolves one attempt.
    ///
    /// Uncommitted attempts are only rolled back once expired, unless `force`
    /// is set by the client that owns the attempt.
    pub async fn cleanup_attempt(
        &self,
        atr_id: &DocId,
        attempt_id: &str,
        force: bool,
    ) -> Result<CleanupOutcome, StoreError> {
        let Some(entry) = atr::read_entry(&*self.store, atr_id, attempt_id, &self.opts).await?
        else {
            return Ok(CleanupOutcome::Skipped);
        };

        match entry.state {
            AtrState::Committed | AtrState::Completed => {
                for (kind, id) in entry.docs() {
                    self.commit_doc(kind, id, attempt_id).await?;
                }
                self.remove_entry(atr_id, attempt_id).await?;
                info!(%atr_id, attempt_id, "cleanup completed committed attempt");
                Ok(CleanupOutcome::Completed)
            }
            AtrState::Pending | AtrState::Aborted => {
                if !force && !entry.is_expired(&self.clock.now()) {
                    return Ok(CleanupOutcome::Skipped);
                }
                if entry.state == AtrState::Pending && !self.abort_entry(atr_id, attempt_id).await? {
                    // Committed by its owner in the meantime
                    return Ok(CleanupOutcome::Skipped);
                }
                self.rollback_docs(&entry, attempt_id).await?;
                self.remove_entry(atr_id, attempt_id).await?;
                info!(%atr_id, attempt_id, "cleanup rolled back attempt");
                Ok(CleanupOutcome::RolledBack)
            }
            AtrState::RolledBack => {
                self.remove_entry(atr_id, attempt_id).await?;
                Ok(CleanupOutcome::RolledBack)
            }
        }
    }

    /// Resolves every expired entry in every known ATR.
    ///
    /// Returns the number of attempts resolved. Failures on individual ATRs
    /// are logged and left for the next sweep.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut resolved = 0;

        for collection in self.collections() {
            for n in 0..self.num_atrs {
                let atr_id = collection.doc_id(atr::atr_key(n));
                let body = match atr::read_atr(&*self.store, &atr_id, &self.opts).await {
                    Ok(Some((_, body))) => body,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(%atr_id, error = %e, "failed to read atr during sweep");
                        continue;
                    }
                };

                for (attempt_id, entry) in &body.attempts {
                    if !entry.is_expired(&now) {
                        continue;
                    }
                    match self.cleanup_attempt(&atr_id, attempt_id, false).await {
                        Ok(CleanupOutcome::Skipped) => {}
                        Ok(_) => resolved += 1,
                        Err(e) => {
                            warn!(%atr_id, %attempt_id, error = %e, "lost attempt cleanup failed")
                        }
                    }
                }
            }
        }

        if resolved > 0 {
            debug!(resolved, "lost attempt sweep finished");
        }
        resolved
    }

    /// Flips a pending entry to aborted. Returns false if it is no longer
    /// pending.
    async fn abort_entry(&self, atr_id: &DocId, attempt_id: &str) -> Result<bool, StoreError> {
        let mut still_pending = false;
        atr::update_entry(&*self.store, atr_id, attempt_id, &self.opts, |e| match e {
            Some(e) if e.state == AtrState::Pending => {
                still_pending = true;
                EntryUpdate::Put(e.clone().with_state(AtrState::Aborted))
            }
            Some(e) if e.state == AtrState::Aborted => {
                still_pending = true;
                EntryUpdate::Skip
            }
            _ => {
                still_pending = false;
                EntryUpdate::Skip
            }
        })
        .await?;
        Ok(still_pending)
    }

    async fn remove_entry(&self, atr_id: &DocId, attempt_id: &str) -> Result<(), StoreError> {
        atr::update_entry(&*self.store, atr_id, attempt_id, &self.opts, |_| {
            EntryUpdate::Delete
        })
        .await
        .map(drop)
    }

    /// Reads `id` and returns its CAS and links if they belong to the attempt.
    async fn owned_links(
        &self,
        id: &DocId,
        attempt_id: &str,
    ) -> Result<Option<(StoredDocument, TxnLinks)>, StoreError> {
        let Some(doc) = self.store.get(id, &self.opts).await? else {
            return Ok(None);
        };
        let Some(meta) = doc.meta.as_deref() else {
            return Ok(None);
        };
        let links = TxnLinks::decode(id, meta)?;
        if links.attempt_id != attempt_id {
            return Ok(None);
        }
        Ok(Some((doc, links)))
    }

    /// Moves one committed document's staged content into place.
    async fn commit_doc(
        &self,
        kind: MutationKind,
        id: &DocId,
        attempt_id: &str,
    ) -> Result<(), StoreError> {
        for _ in 0..MAX_DOC_SPINS {
            let Some((doc, links)) = self.owned_links(id, attempt_id).await? else {
                return Ok(());
            };
            let result = match links.op {
                MutationKind::Insert | MutationKind::Replace => match links.staged_content() {
                    Some(content) => self
                        .store
                        .replace(id, doc.cas, &content, &self.opts)
                        .await
                        .map(drop),
                    None => Err(StoreError::Corruption {
                        id: id.clone(),
                        reason: format!("staged {kind:?} without content"),
                    }),
                },
                MutationKind::Remove => self.store.remove(id, doc.cas, &self.opts).await,
            };
            match result {
                Ok(()) | Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(StoreError::CasMismatch { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::CasMismatch { id: id.clone() })
    }

    async fn rollback_docs(&self, entry: &AtrEntry, attempt_id: &str) -> Result<(), StoreError> {
        for (_, id) in entry.docs() {
            rollback_doc(&*self.store, id, attempt_id, &self.opts).await?;
        }
        Ok(())
    }
}

/// Removes the staging marker an attempt left on `id`, if it is still there.
///
/// A shadow entry is deleted; otherwise the sidecar is cleared and the body
/// is left as committed.
pub(crate) async fn rollback_doc(
    store: &dyn DocumentStore,
    id: &DocId,
    attempt_id: &str,
    opts: &StoreOptions,
) -> Result<(), StoreError> {
    for _ in 0..MAX_DOC_SPINS {
        let Some(doc) = store.get(id, opts).await? else {
            return Ok(());
        };
        let owned = match doc.meta.as_deref() {
            Some(meta) => TxnLinks::decode(id, meta)?.attempt_id == attempt_id,
            None => false,
        };
        if !owned {
            return Ok(());
        }
        let result = if doc.is_shadow() {
            store.remove(id, doc.cas, opts).await
        } else {
            store.stage(id, Some(doc.cas), None, opts).await.map(drop)
        };
        match result {
            Ok(()) | Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(StoreError::CasMismatch { .. })
            | Err(StoreError::Timeout { .. })
            | Err(StoreError::Transient { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::CasMismatch { id: id.clone() })
}

/// Handle attempts use to hand work to cleanup.
#[derive(Clone)]
pub(crate) struct CleanupQueue {
    cleaner: Arc<Cleaner>,
    sender: Option<mpsc::UnboundedSender<CleanupRequest>>,
}

impl CleanupQueue {
    pub fn register_collection(&self, collection: MetadataCollection) {
        self.cleaner.register_collection(collection);
    }

    /// Queues an attempt. Dropped with a warning when client cleanup is off.
    pub fn push(&self, request: CleanupRequest) {
        let Some(sender) = &self.sender else {
            warn!(
                atr_id = %request.atr_id,
                attempt_id = %request.attempt_id,
                "client cleanup disabled, attempt left for lost-attempt cleanup"
            );
            return;
        };
        if sender.send(request).is_err() {
            warn!("cleanup task has stopped, attempt left for lost-attempt cleanup");
        }
    }
}

/// Background cleanup tasks. Aborted on drop.
#[derive(Default)]
pub(crate) struct CleanupTasks {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for CleanupTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Starts the background tasks the configuration asks for.
///
/// Without a tokio runtime no task can be spawned; cleanup is then only
/// available by calling [`Cleaner`] directly.
pub(crate) fn start(cleaner: Arc<Cleaner>, config: &TransactionConfig) -> (CleanupQueue, CleanupTasks) {
    let mut tasks = CleanupTasks::default();
    let wants_tasks = config.cleanup_client_attempts || config.cleanup_lost_attempts;

    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) if wants_tasks => {
            warn!("no tokio runtime, background transaction cleanup disabled");
            None
        }
        Err(_) => None,
    };

    let mut sender = None;
    if let Some(runtime) = &runtime {
        if config.cleanup_client_attempts {
            let (tx, rx) = mpsc::unbounded_channel();
            sender = Some(tx);
            tasks
                .handles
                .push(runtime.spawn(client_cleanup_loop(Arc::clone(&cleaner), rx)));
        }
        if config.cleanup_lost_attempts {
            tasks.handles.push(runtime.spawn(lost_cleanup_loop(
                Arc::clone(&cleaner),
                config.cleanup_window,
            )));
        }
    }

    (CleanupQueue { cleaner, sender }, tasks)
}

async fn client_cleanup_loop(
    cleaner: Arc<Cleaner>,
    mut rx: mpsc::UnboundedReceiver<CleanupRequest>,
) {
    while let Some(request) = rx.recv().await {
        match cleaner
            .cleanup_attempt(&request.atr_id, &request.attempt_id, request.force)
            .await
        {
            Ok(outcome) => debug!(
                atr_id = %request.atr_id,
                attempt_id = %request.attempt_id,
                ?outcome,
                "client attempt cleaned up"
            ),
            Err(e) => warn!(
                atr_id = %request.atr_id,
                attempt_id = %request.attempt_id,
                error = %e,
                "client attempt cleanup failed, leaving it to the lost-attempt sweep"
            ),
        }
    }
}

async fn lost_cleanup_loop(cleaner: Arc<Cleaner>, window: Duration) {
    let mut ticker = tokio::time::interval(window);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        cleaner.sweep().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentContent, InMemoryDocumentStore};
    use crate::time::{ManualTimeService, Timestamp};

    fn config() -> TransactionConfig {
        TransactionConfig::new().with_num_atrs(4)
    }

    struct Fixture {
        store: Arc<InMemoryDocumentStore>,
        clock: Arc<ManualTimeService>,
        cleaner: Cleaner,
        atr_id: DocId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryDocumentStore::new());
        let clock = Arc::new(ManualTimeService::new(10_000));
        let cleaner = Cleaner::new(store.clone(), clock.clone(), &config());
        cleaner.register_collection(MetadataCollection::new("b", "_default", "_default"));
        let atr_id = DocId::default_collection("b", atr::atr_key(1));
        Fixture {
            store,
            clock,
            cleaner,
            atr_id,
        }
    }

    fn links(atr_id: &DocId, op: MutationKind, staged: Option<&str>) -> Vec<u8> {
        let links = TxnLinks {
            txn_id: "t1".into(),
            attempt_id: "a1".into(),
            atr_id: atr_id.clone(),
            op,
            staged: staged.map(|s| s.as_bytes().to_vec()),
            staged_flags: crate::storage::JSON_FLAGS,
        };
        serde_json::to_vec(&links).unwrap()
    }

    /// Writes an entry for attempt `a1` with one staged replace and one
    /// staged insert.
    async fn stage_attempt(f: &Fixture, state: AtrState) -> (DocId, DocId) {
        let opts = StoreOptions::default();
        let replaced = DocId::default_collection("b", "replaced");
        let inserted = DocId::default_collection("b", "inserted");

        let cas = f
            .store
            .insert(&replaced, &DocumentContent::from("\"old\""), &opts)
            .await
            .unwrap();
        f.store
            .stage(
                &replaced,
                Some(cas),
                Some(&links(&f.atr_id, MutationKind::Replace, Some("\"new\""))),
                &opts,
            )
            .await
            .unwrap();
        f.store
            .stage(
                &inserted,
                None,
                Some(&links(&f.atr_id, MutationKind::Insert, Some("\"fresh\""))),
                &opts,
            )
            .await
            .unwrap();

        let mut entry = AtrEntry::pending("t1", Timestamp::from_millis(10_000), Duration::from_secs(15));
        entry.record(MutationKind::Replace, &replaced);
        entry.record(MutationKind::Insert, &inserted);
        let entry = entry.with_state(state);
        atr::update_entry(&*f.store, &f.atr_id, "a1", &opts, |_| {
            EntryUpdate::Put(entry.clone())
        })
        .await
        .unwrap();

        (replaced, inserted)
    }

    #[tokio::test]
    async fn test_committed_attempt_is_completed() {
        let f = fixture();
        let (replaced, inserted) = stage_attempt(&f, AtrState::Committed).await;

        let outcome = f.cleaner.cleanup_attempt(&f.atr_id, "a1", false).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::Completed);

        let doc = f.store.peek(&replaced).unwrap();
        assert_eq!(doc.content.unwrap().as_bytes(), b"\"new\"");
        assert!(doc.meta.is_none());
        let doc = f.store.peek(&inserted).unwrap();
        assert_eq!(doc.content.unwrap().as_bytes(), b"\"fresh\"");
        assert!(f.store.peek(&f.atr_id).is_none());
    }

    #[tokio::test]
    async fn test_pending_attempt_waits_for_expiry() {
        let f = fixture();
        let (replaced, inserted) = stage_attempt(&f, AtrState::Pending).await;

        let outcome = f.cleaner.cleanup_attempt(&f.atr_id, "a1", false).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::Skipped);
        assert!(f.store.peek(&inserted).is_some());

        f.clock.advance(Duration::from_secs(16));
        let outcome = f.cleaner.cleanup_attempt(&f.atr_id, "a1", false).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::RolledBack);

        let doc = f.store.peek(&replaced).unwrap();
        assert_eq!(doc.content.unwrap().as_bytes(), b"\"old\"");
        assert!(doc.meta.is_none());
        assert!(f.store.peek(&inserted).is_none());
        assert!(f.store.peek(&f.atr_id).is_none());
    }

    #[tokio::test]
    async fn test_forced_cleanup_ignores_expiry() {
        let f = fixture();
        let (_, inserted) = stage_attempt(&f, AtrState::Aborted).await;

        let outcome = f.cleaner.cleanup_attempt(&f.atr_id, "a1", true).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::RolledBack);
        assert!(f.store.peek(&inserted).is_none());
    }

    #[tokio::test]
    async fn test_foreign_links_are_left_alone() {
        let f = fixture();
        let (replaced, _) = stage_attempt(&f, AtrState::Committed).await;

        // Another attempt took over the document after ours was abandoned
        let opts = StoreOptions::default();
        let cas = f.store.peek(&replaced).unwrap().cas;
        let mut other: TxnLinks = serde_json::from_slice(&links(
            &f.atr_id,
            MutationKind::Replace,
            Some("\"other\""),
        ))
        .unwrap();
        other.attempt_id = "a2".into();
        f.store
            .stage(&replaced, Some(cas), Some(&serde_json::to_vec(&other).unwrap()), &opts)
            .await
            .unwrap();

        f.cleaner.cleanup_attempt(&f.atr_id, "a1", false).await.unwrap();
        let doc = f.store.peek(&replaced).unwrap();
        assert_eq!(doc.content.unwrap().as_bytes(), b"\"old\"");
        assert!(doc.meta.is_some());
    }

    #[tokio::test]
    async fn test_sweep_resolves_expired_entries() {
        let f = fixture();
        stage_attempt(&f, AtrState::Pending).await;

        assert_eq!(f.cleaner.sweep().await, 0);
        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.cleaner.sweep().await, 1);
        assert!(f.store.peek(&f.atr_id).is_none());
    }

    #[tokio::test]
    async fn test_missing_entry_is_skipped() {
        let f = fixture();
        let outcome = f.cleaner.cleanup_attempt(&f.atr_id, "nope", true).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::Skipped);
    }
}
