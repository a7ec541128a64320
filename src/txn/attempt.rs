// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! A single attempt at running a transaction body.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::query::{QueryEngine, QueryError, QueryMutation, QueryOptions, QueryResult, TxnQueryContext};
use crate::storage::{
    with_timeout, Cas, DocId, DocumentContent, DocumentStore, StoreError, StoreOptions,
    StoredDocument, DEFAULT_COLLECTION, DEFAULT_SCOPE,
};
use crate::time::TimeService;

use super::atr::{self, AtrEntry, AtrState, EntryUpdate, TxnLinks};
use super::cleanup::{self, CleanupQueue, CleanupRequest};
use super::config::{MetadataCollection, ResolvedConfig};
use super::error::{
    classify_store_error, ErrorClass, FinalError, TransactionOperationFailed, TxnError,
};
use super::reference::DocumentReference;
use super::staged::{MutationKind, StagedMutation, StagedMutationLog};
use super::transaction::AttemptState;

/// Pause between re-reads of the ATR while the commit point is unconfirmed.
const FLIP_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Collaborators shared by every attempt of a [`Transactions`](super::Transactions).
#[derive(Clone)]
pub(crate) struct AttemptEnv {
    pub store: Arc<dyn DocumentStore>,
    pub query: Option<Arc<dyn QueryEngine>>,
    pub clock: Arc<dyn TimeService>,
    pub cleanup: CleanupQueue,
}

/// Handle to one attempt of a transaction.
///
/// Cloning is cheap and every clone drives the same attempt. Operations on
/// one attempt are serialized: at most one store or query request is in
/// flight at a time, even when clones are used from parallel tasks.
///
/// Writes are staged as they are issued. Nothing becomes visible to other
/// readers until [`commit`](Self::commit) flips the attempt's ATR entry.
#[derive(Clone)]
pub struct AttemptContext {
    inner: Arc<AttemptInner>,
}

struct AttemptInner {
    txn_id: String,
    attempt_id: String,
    config: ResolvedConfig,
    deadline: Instant,
    env: AttemptEnv,
    op_lock: tokio::sync::Mutex<()>,
    shared: Mutex<AttemptShared>,
}

struct AttemptShared {
    state: AttemptState,
    log: StagedMutationLog,
    atr_id: Option<DocId>,
    /// First failure that poisoned the attempt; later operations fail fast.
    failure: Option<TransactionOperationFailed>,
    unstaging_complete: bool,
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptContext")
            .field("txn_id", &self.inner.txn_id)
            .field("attempt_id", &self.inner.attempt_id)
            .field("state", &self.state())
            .finish()
    }
}

impl AttemptContext {
    pub(crate) fn new(
        txn_id: String,
        config: ResolvedConfig,
        deadline: Instant,
        env: AttemptEnv,
    ) -> Self {
        Self {
            inner: Arc::new(AttemptInner {
                txn_id,
                attempt_id: Uuid::new_v4().to_string(),
                config,
                deadline,
                env,
                op_lock: tokio::sync::Mutex::new(()),
                shared: Mutex::new(AttemptShared {
                    state: AttemptState::NotStarted,
                    log: StagedMutationLog::new(),
                    atr_id: None,
                    failure: None,
                    unstaging_complete: false,
                }),
            }),
        }
    }

    /// Returns the attempt ID.
    #[inline]
    pub fn id(&self) -> &str {
        &self.inner.attempt_id
    }

    /// Returns the ID shared by all attempts of the transaction.
    #[inline]
    pub fn transaction_id(&self) -> &str {
        &self.inner.txn_id
    }

    /// Returns where the attempt is in its lifecycle.
    pub fn state(&self) -> AttemptState {
        self.inner.shared.lock().state.clone()
    }

    /// Number of staged mutations.
    pub fn staged_count(&self) -> usize {
        self.inner.shared.lock().log.len()
    }

    /// Returns true once the transaction's expiry budget is used up.
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Budget left before the transaction expires.
    pub fn remaining(&self) -> Duration {
        self.inner.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns true if every committed change was moved into place.
    pub fn unstaging_complete(&self) -> bool {
        self.inner.shared.lock().unstaging_complete
    }

    /// ATR chosen by the first write, if any.
    pub fn atr_id(&self) -> Option<DocId> {
        self.inner.shared.lock().atr_id.clone()
    }

    pub(crate) fn failure(&self) -> Option<TransactionOperationFailed> {
        self.inner.shared.lock().failure.clone()
    }

    /// Reads a document, observing this attempt's own staged writes.
    #[instrument(skip(self), fields(txn_id = %self.inner.txn_id, attempt_id = %self.inner.attempt_id))]
    pub async fn get(&self, id: &DocId) -> Result<DocumentReference, TxnError> {
        let _guard = self.inner.op_lock.lock().await;
        self.check_can_perform()?;
        let result = self.get_locked(id).await;
        result.map_err(|e| self.fail(e))
    }

    /// Stages the creation of a document.
    #[instrument(skip(self, content), fields(txn_id = %self.inner.txn_id, attempt_id = %self.inner.attempt_id))]
    pub async fn insert(
        &self,
        id: &DocId,
        content: impl Into<DocumentContent>,
    ) -> Result<DocumentReference, TxnError> {
        let content = content.into();
        let _guard = self.inner.op_lock.lock().await;
        self.check_can_perform()?;
        let result = self.insert_locked(id, content).await;
        result.map_err(|e| self.fail(e))
    }

    /// Stages new content for a document read earlier in this attempt.
    ///
    /// `prev` must be the most recent reference this attempt holds for the
    /// document; an older one fails with [`TxnError::CasMismatch`].
    #[instrument(skip(self, prev, content), fields(txn_id = %self.inner.txn_id, attempt_id = %self.inner.attempt_id, id = %prev.id()))]
    pub async fn replace(
        &self,
        prev: &DocumentReference,
        content: impl Into<DocumentContent>,
    ) -> Result<DocumentReference, TxnError> {
        let content = content.into();
        let _guard = self.inner.op_lock.lock().await;
        self.check_can_perform()?;
        let result = self.replace_locked(prev, content).await;
        result.map_err(|e| self.fail(e))
    }

    /// Stages the removal of a document read earlier in this attempt.
    #[instrument(skip(self, prev), fields(txn_id = %self.inner.txn_id, attempt_id = %self.inner.attempt_id, id = %prev.id()))]
    pub async fn remove(&self, prev: &DocumentReference) -> Result<(), TxnError> {
        let _guard = self.inner.op_lock.lock().await;
        self.check_can_perform()?;
        let result = self.remove_locked(prev).await;
        result.map_err(|e| self.fail(e))
    }

    /// Runs a statement that sees this attempt's staged writes.
    ///
    /// Every mutation the engine reports is staged like the equivalent
    /// key-value operation.
    #[instrument(skip(self, options), fields(txn_id = %self.inner.txn_id, attempt_id = %self.inner.attempt_id))]
    pub async fn query(
        &self,
        statement: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult, TxnError> {
        let _guard = self.inner.op_lock.lock().await;
        self.check_can_perform()?;
        let result = self.query_locked(statement, options).await;
        result.map_err(|e| self.fail(e))
    }

    /// Commits everything staged by this attempt.
    ///
    /// Staging happened as operations were issued, so this flips the ATR
    /// entry to `COMMITTED` (the commit point) and then moves each staged
    /// write into place. A failure to confirm the flip is reported as
    /// ambiguous and is never rolled back. Failures after the flip do not
    /// fail the commit; they are left to cleanup and reported through
    /// [`unstaging_complete`](Self::unstaging_complete).
    #[instrument(skip(self), fields(txn_id = %self.inner.txn_id, attempt_id = %self.inner.attempt_id))]
    pub async fn commit(&self) -> Result<(), TxnError> {
        let _guard = self.inner.op_lock.lock().await;
        self.check_can_perform()?;

        let (atr_id, mutations) = {
            let mut shared = self.inner.shared.lock();
            shared.state = AttemptState::Committing;
            (shared.atr_id.clone(), shared.log.to_vec())
        };

        let Some(atr_id) = atr_id else {
            self.finish_commit(true);
            info!("committed attempt without writes");
            return Ok(());
        };

        if mutations.is_empty() {
            // Everything staged was discarded again
            if let Err(e) = self.remove_entry(&atr_id).await {
                warn!(%atr_id, error = %e, "failed to remove empty atr entry");
                self.queue_cleanup(&atr_id, true);
            }
            self.finish_commit(true);
            info!("committed attempt whose writes cancelled out");
            return Ok(());
        }

        debug!(%atr_id, staged = mutations.len(), "all mutations staged, flipping atr entry");
        if let Err(failure) = self.flip_to_committed(&atr_id).await {
            let mut shared = self.inner.shared.lock();
            if failure.to_raise() == FinalError::CommitAmbiguous {
                error!(%atr_id, error = %failure, "commit is ambiguous");
                shared.state = AttemptState::Aborted(failure.clone());
                drop(shared);
                self.queue_cleanup(&atr_id, false);
            } else {
                warn!(%atr_id, error = %failure, "commit point not reached");
                shared.state = AttemptState::InProgress;
                shared.failure.get_or_insert_with(|| failure.clone());
            }
            return Err(failure.into());
        }

        let complete = self.unstage(&mutations).await;
        let entry_removed = if complete {
            match self.complete_entry(&atr_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(%atr_id, error = %e, "failed to complete committed atr entry");
                    false
                }
            }
        } else {
            false
        };
        if !entry_removed {
            self.queue_cleanup(&atr_id, false);
        }

        self.finish_commit(complete);
        info!(
            %atr_id,
            mutations = mutations.len(),
            unstaging_complete = complete,
            "attempt committed"
        );
        Ok(())
    }

    /// Undoes everything staged by this attempt.
    ///
    /// Rolling back an attempt that is already rolled back is a no-op.
    #[instrument(skip(self), fields(txn_id = %self.inner.txn_id, attempt_id = %self.inner.attempt_id))]
    pub async fn rollback(&self) -> Result<(), TxnError> {
        let _guard = self.inner.op_lock.lock().await;
        match self.state() {
            AttemptState::RolledBack => return Ok(()),
            AttemptState::NotStarted | AttemptState::InProgress => {}
            other => {
                return Err(TransactionOperationFailed::not_active(format!(
                    "cannot roll back an attempt that is {other:?}"
                ))
                .into())
            }
        }
        self.rollback_locked().await
    }

    fn check_can_perform(&self) -> Result<(), TxnError> {
        let mut shared = self.inner.shared.lock();
        if !shared.state.is_active() {
            return Err(TransactionOperationFailed::not_active(format!(
                "attempt is {:?}",
                shared.state
            ))
            .into());
        }
        if let Some(failure) = &shared.failure {
            return Err(failure.clone().into());
        }
        if self.expired() {
            let failure = TransactionOperationFailed::expired("transaction expired");
            shared.failure = Some(failure.clone());
            return Err(failure.into());
        }
        shared.state = AttemptState::InProgress;
        Ok(())
    }

    /// Records `err` as the attempt's failure if it poisons the attempt.
    fn fail(&self, err: TxnError) -> TxnError {
        if let Some(failure) = err.poisons_attempt() {
            let mut shared = self.inner.shared.lock();
            if shared.failure.is_none() {
                debug!(error = %failure, "attempt failed");
                shared.failure = Some(failure);
            }
        }
        err
    }

    fn finish_commit(&self, unstaging_complete: bool) {
        let mut shared = self.inner.shared.lock();
        shared.state = AttemptState::Committed;
        shared.unstaging_complete = unstaging_complete;
    }

    fn queue_cleanup(&self, atr_id: &DocId, force: bool) {
        self.inner.env.cleanup.push(CleanupRequest {
            atr_id: atr_id.clone(),
            attempt_id: self.inner.attempt_id.clone(),
            force,
        });
    }

    #[inline]
    fn store(&self) -> &dyn DocumentStore {
        &*self.inner.env.store
    }

    /// Options for a call that must finish within the transaction budget.
    #[inline]
    fn op_options(&self) -> StoreOptions {
        self.inner.config.store_options(self.remaining())
    }

    /// Options for calls that run past the budget: unstaging and rollback.
    #[inline]
    fn finish_options(&self) -> StoreOptions {
        self.inner.config.store_options(self.inner.config.kv_timeout)
    }

    async fn call<T, F>(&self, id: &DocId, opts: &StoreOptions, fut: F) -> Result<T, TxnError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        with_timeout(id, opts.timeout, fut)
            .await
            .map_err(|e| classify_store_error(e, self.expired()))
    }

    fn decode_links(id: &DocId, doc: &StoredDocument) -> Result<Option<TxnLinks>, TxnError> {
        doc.meta
            .as_deref()
            .map(|meta| TxnLinks::decode(id, meta))
            .transpose()
            .map_err(|e| classify_store_error(e, false))
    }

    fn links(&self, atr_id: &DocId, op: MutationKind, content: Option<&DocumentContent>) -> TxnLinks {
        TxnLinks {
            txn_id: self.inner.txn_id.clone(),
            attempt_id: self.inner.attempt_id.clone(),
            atr_id: atr_id.clone(),
            op,
            staged: content.map(|c| c.as_bytes().to_vec()),
            staged_flags: content.map_or(0, DocumentContent::flags),
        }
    }

    fn query_context(&self) -> TxnQueryContext {
        let shared = self.inner.shared.lock();
        TxnQueryContext {
            txn_id: self.inner.txn_id.clone(),
            attempt_id: self.inner.attempt_id.clone(),
            atr_id: shared.atr_id.clone(),
            staged: shared.log.to_vec(),
        }
    }

    fn staged(&self, id: &DocId) -> Option<StagedMutation> {
        self.inner.shared.lock().log.get(id).cloned()
    }

    fn log_upsert(&self, mutation: StagedMutation) {
        self.inner.shared.lock().log.upsert(mutation);
    }

    /// Picks the ATR on the first write.
    fn ensure_atr(&self, id: &DocId) -> DocId {
        if let Some(atr_id) = self.atr_id() {
            return atr_id;
        }
        let collection = self
            .inner
            .config
            .metadata_collection
            .clone()
            .unwrap_or_else(|| MetadataCollection::new(id.bucket(), DEFAULT_SCOPE, DEFAULT_COLLECTION));
        let atr_id = atr::atr_id_for(&collection, id.key(), self.inner.config.num_atrs);
        self.inner.env.cleanup.register_collection(collection);
        self.inner.shared.lock().atr_id = Some(atr_id.clone());
        debug!(%atr_id, "selected atr");
        atr_id
    }

    /// Declares a write in the ATR entry, creating the entry on first use.
    async fn record_intent(&self, kind: MutationKind, id: &DocId) -> Result<DocId, TxnError> {
        let atr_id = self.ensure_atr(id);
        let started = self.inner.env.clock.now();
        let expires = self.remaining();
        let txn_id = &self.inner.txn_id;
        let opts = self.op_options();

        let mut not_pending = None;
        let update = atr::update_entry(
            self.store(),
            &atr_id,
            &self.inner.attempt_id,
            &opts,
            |prior| match prior {
                None => {
                    not_pending = None;
                    let mut entry = AtrEntry::pending(txn_id.clone(), started, expires);
                    entry.record(kind, id);
                    EntryUpdate::Put(entry)
                }
                Some(entry) if entry.state == AtrState::Pending => {
                    not_pending = None;
                    let mut entry = entry.clone();
                    entry.record(kind, id);
                    EntryUpdate::Put(entry)
                }
                Some(entry) => {
                    not_pending = Some(entry.state);
                    EntryUpdate::Skip
                }
            },
        );
        self.call(&atr_id, &opts, update).await?;

        if let Some(state) = not_pending {
            return Err(TransactionOperationFailed::new(
                ErrorClass::Hard,
                format!("atr entry in {atr_id} is {state:?}, expected pending"),
            )
            .into());
        }
        Ok(atr_id)
    }

    /// Drops a document from the ATR entry after its staged insert was discarded.
    async fn forget_intent(&self, id: &DocId) -> Result<(), TxnError> {
        let Some(atr_id) = self.atr_id() else {
            return Ok(());
        };
        let opts = self.op_options();
        let update = atr::update_entry(
            self.store(),
            &atr_id,
            &self.inner.attempt_id,
            &opts,
            |prior| match prior {
                Some(entry) => {
                    let mut entry = entry.clone();
                    entry.forget(id);
                    EntryUpdate::Put(entry)
                }
                None => EntryUpdate::Skip,
            },
        );
        self.call(&atr_id, &opts, update).await.map(drop)
    }

    /// Fails if another live attempt has staged the document.
    async fn check_write_write(&self, id: &DocId, links: Option<&TxnLinks>) -> Result<(), TxnError> {
        let Some(links) = links else {
            return Ok(());
        };
        if links.attempt_id == self.inner.attempt_id {
            return Ok(());
        }

        let opts = self.op_options();
        let entry = self
            .call(
                &links.atr_id,
                &opts,
                atr::read_entry(self.store(), &links.atr_id, &links.attempt_id, &opts),
            )
            .await?;
        let blocking = match &entry {
            None => false,
            Some(entry) => match entry.state {
                AtrState::Pending => !entry.is_expired(&self.inner.env.clock.now()),
                AtrState::Committed => true,
                AtrState::Completed | AtrState::Aborted | AtrState::RolledBack => false,
            },
        };

        if blocking {
            debug!(%id, other_attempt = %links.attempt_id, "write-write conflict");
            return Err(TransactionOperationFailed::new(
                ErrorClass::WriteWriteConflict,
                format!("{id} is staged by attempt {}", links.attempt_id),
            )
            .retryable()
            .into());
        }
        Ok(())
    }

    async fn stage_doc(&self, id: &DocId, cas: Option<Cas>, links: &TxnLinks) -> Result<Cas, TxnError> {
        let meta = links
            .encode(id)
            .map_err(|e| classify_store_error(e, false))?;
        let opts = self.op_options();
        let staged = with_timeout(id, opts.timeout, self.store().stage(id, cas, Some(&meta), &opts)).await;
        match staged {
            // Removed since it was read
            Err(StoreError::NotFound { id }) if cas.is_some() => Err(TxnError::CasMismatch { id }),
            other => other.map_err(|e| classify_store_error(e, self.expired())),
        }
    }

    /// Restages a document this attempt already staged.
    async fn restage(
        &self,
        staged: &StagedMutation,
        kind: MutationKind,
        content: Option<DocumentContent>,
    ) -> Result<Cas, TxnError> {
        let atr_id = if kind != staged.kind {
            self.record_intent(kind, &staged.id).await?
        } else {
            self.ensure_atr(&staged.id)
        };
        let links = self.links(&atr_id, kind, content.as_ref());
        let cas = self.stage_doc(&staged.id, Some(staged.cas), &links).await?;
        self.log_upsert(StagedMutation::new(
            kind,
            staged.id.clone(),
            content,
            cas,
            staged.pre_stage_cas,
        ));
        Ok(cas)
    }

    async fn get_locked(&self, id: &DocId) -> Result<DocumentReference, TxnError> {
        if let Some(staged) = self.staged(id) {
            return match (staged.kind, staged.content) {
                (MutationKind::Remove, _) | (_, None) => Err(TxnError::DocumentNotFound { id: id.clone() }),
                (_, Some(content)) => Ok(DocumentReference::new(id.clone(), staged.cas, content, None)),
            };
        }

        let opts = self.op_options();
        let Some(doc) = self.call(id, &opts, self.store().get(id, &opts)).await? else {
            return Err(TxnError::DocumentNotFound { id: id.clone() });
        };
        let links = Self::decode_links(id, &doc)?;

        let content = match &links {
            Some(links) if links.attempt_id != self.inner.attempt_id => {
                let entry = self
                    .call(
                        &links.atr_id,
                        &opts,
                        atr::read_entry(self.store(), &links.atr_id, &links.attempt_id, &opts),
                    )
                    .await?;
                let committed = matches!(
                    entry.map(|e| e.state),
                    Some(AtrState::Committed | AtrState::Completed)
                );
                match (committed, links.op) {
                    (true, MutationKind::Remove) => None,
                    (true, _) => links.staged_content(),
                    (false, _) => doc.content.clone(),
                }
            }
            _ => doc.content.clone(),
        };

        let content = content.ok_or_else(|| TxnError::DocumentNotFound { id: id.clone() })?;
        debug!(%id, cas = ?doc.cas, "read document");
        Ok(DocumentReference::new(id.clone(), doc.cas, content, links))
    }

    async fn insert_locked(
        &self,
        id: &DocId,
        content: DocumentContent,
    ) -> Result<DocumentReference, TxnError> {
        if let Some(staged) = self.staged(id) {
            if staged.kind != MutationKind::Remove {
                return Err(TxnError::DocumentAlreadyExists { id: id.clone() });
            }
            let cas = self
                .restage(&staged, MutationKind::Replace, Some(content.clone()))
                .await?;
            debug!(%id, "staged insert over own remove as replace");
            return Ok(DocumentReference::new(id.clone(), cas, content, None));
        }

        let atr_id = self.record_intent(MutationKind::Insert, id).await?;
        let links = self.links(&atr_id, MutationKind::Insert, Some(&content));
        let cas = match self.stage_doc(id, None, &links).await {
            Ok(cas) => cas,
            Err(TxnError::DocumentAlreadyExists { .. }) => self.take_over_shadow(id, &links).await?,
            Err(e) => return Err(e),
        };

        self.log_upsert(StagedMutation::new(
            MutationKind::Insert,
            id.clone(),
            Some(content.clone()),
            cas,
            None,
        ));
        debug!(%id, "staged insert");
        Ok(DocumentReference::new(id.clone(), cas, content, None))
    }

    /// Stages an insert over an existing entry that only carries another
    /// attempt's staged insert, if that attempt is not live.
    async fn take_over_shadow(&self, id: &DocId, links: &TxnLinks) -> Result<Cas, TxnError> {
        let opts = self.op_options();
        let Some(doc) = self.call(id, &opts, self.store().get(id, &opts)).await? else {
            return self.stage_doc(id, None, links).await;
        };
        if !doc.is_shadow() {
            return Err(TxnError::DocumentAlreadyExists { id: id.clone() });
        }
        let foreign = Self::decode_links(id, &doc)?;
        self.check_write_write(id, foreign.as_ref()).await?;
        debug!(%id, "taking over abandoned staged insert");
        self.stage_doc(id, Some(doc.cas), links).await
    }

    async fn replace_locked(
        &self,
        prev: &DocumentReference,
        content: DocumentContent,
    ) -> Result<DocumentReference, TxnError> {
        let id = prev.id();
        let cas = match self.staged(id) {
            Some(staged) => {
                if staged.cas != prev.cas() {
                    return Err(TxnError::CasMismatch { id: id.clone() });
                }
                match staged.kind {
                    MutationKind::Remove => {
                        return Err(TxnError::DocumentNotFound { id: id.clone() })
                    }
                    kind @ (MutationKind::Insert | MutationKind::Replace) => {
                        self.restage(&staged, kind, Some(content.clone())).await?
                    }
                }
            }
            None => {
                self.check_write_write(id, prev.links.as_ref()).await?;
                let atr_id = self.record_intent(MutationKind::Replace, id).await?;
                let links = self.links(&atr_id, MutationKind::Replace, Some(&content));
                let cas = self.stage_doc(id, Some(prev.cas()), &links).await?;
                self.log_upsert(StagedMutation::new(
                    MutationKind::Replace,
                    id.clone(),
                    Some(content.clone()),
                    cas,
                    Some(prev.cas()),
                ));
                cas
            }
        };
        debug!(%id, "staged replace");
        Ok(DocumentReference::new(id.clone(), cas, content, None))
    }

    async fn remove_locked(&self, prev: &DocumentReference) -> Result<(), TxnError> {
        let id = prev.id();
        match self.staged(id) {
            Some(staged) => {
                if staged.cas != prev.cas() {
                    return Err(TxnError::CasMismatch { id: id.clone() });
                }
                match staged.kind {
                    MutationKind::Remove => {
                        return Err(TxnError::DocumentNotFound { id: id.clone() })
                    }
                    MutationKind::Insert => {
                        let opts = self.op_options();
                        self.call(id, &opts, self.store().remove(id, staged.cas, &opts))
                            .await?;
                        self.inner.shared.lock().log.remove(id);
                        self.forget_intent(id).await?;
                        debug!(%id, "discarded staged insert");
                        return Ok(());
                    }
                    MutationKind::Replace => {
                        self.restage(&staged, MutationKind::Remove, None).await?;
                    }
                }
            }
            None => {
                self.check_write_write(id, prev.links.as_ref()).await?;
                let atr_id = self.record_intent(MutationKind::Remove, id).await?;
                let links = self.links(&atr_id, MutationKind::Remove, None);
                let cas = self.stage_doc(id, Some(prev.cas()), &links).await?;
                self.log_upsert(StagedMutation::new(
                    MutationKind::Remove,
                    id.clone(),
                    None,
                    cas,
                    Some(prev.cas()),
                ));
            }
        }
        debug!(%id, "staged remove");
        Ok(())
    }

    async fn query_locked(
        &self,
        statement: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult, TxnError> {
        let Some(engine) = self.inner.env.query.clone() else {
            return Err(TransactionOperationFailed::new(
                ErrorClass::Hard,
                "no query engine configured",
            )
            .into());
        };

        let remaining = self.remaining();
        let timeout = options.timeout.map_or(remaining, |t| t.min(remaining));
        let mut options = options.clone();
        options.timeout = Some(timeout);
        options
            .scan_consistency
            .get_or_insert(self.inner.config.scan_consistency);
        options.txn = Some(self.query_context());

        let result = match tokio::time::timeout(timeout, engine.execute(statement, &options)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout { timeout }),
        };
        let result = result.map_err(|source| TxnError::Query {
            txn_id: self.inner.txn_id.clone(),
            source,
        })?;

        for mutation in &result.mutations {
            self.apply_query_mutation(mutation).await?;
        }
        debug!(
            rows = result.rows.len(),
            mutations = result.mutations.len(),
            "query executed"
        );
        Ok(result)
    }

    async fn apply_query_mutation(&self, mutation: &QueryMutation) -> Result<(), TxnError> {
        match mutation {
            QueryMutation::Insert { id, content } => {
                self.insert_locked(id, content.clone()).await.map(drop)
            }
            QueryMutation::Replace { id, content } => {
                let current = self.get_locked(id).await?;
                self.replace_locked(&current, content.clone()).await.map(drop)
            }
            QueryMutation::Remove { id } => {
                let current = self.get_locked(id).await?;
                self.remove_locked(&current).await
            }
        }
    }

    /// Flips the ATR entry to `COMMITTED`, re-reading it until the outcome
    /// is known or the budget runs out.
    async fn flip_to_committed(&self, atr_id: &DocId) -> Result<(), TransactionOperationFailed> {
        let mut unconfirmed = false;
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                return Err(if unconfirmed {
                    TransactionOperationFailed::ambiguous("commit point not confirmed before expiry")
                } else {
                    TransactionOperationFailed::expired("transaction expired before commit")
                });
            }

            let opts = self.inner.config.store_options(remaining);
            let mut unexpected = None;
            let update = atr::update_entry(
                self.store(),
                atr_id,
                &self.inner.attempt_id,
                &opts,
                |prior| match prior {
                    Some(entry) if entry.state == AtrState::Pending => {
                        unexpected = None;
                        EntryUpdate::Put(entry.clone().with_state(AtrState::Committed))
                    }
                    Some(entry) if entry.state == AtrState::Committed => {
                        unexpected = None;
                        EntryUpdate::Skip
                    }
                    other => {
                        unexpected = Some(other.map(|e| e.state));
                        EntryUpdate::Skip
                    }
                },
            );

            match with_timeout(atr_id, opts.timeout, update).await {
                Ok(_) => {
                    return match unexpected {
                        None => Ok(()),
                        Some(state) if unconfirmed => Err(TransactionOperationFailed::ambiguous(
                            format!("atr entry is {state:?} after an unconfirmed flip"),
                        )),
                        Some(state) => Err(TransactionOperationFailed::new(
                            ErrorClass::Hard,
                            format!("atr entry is {state:?}, cannot commit"),
                        )),
                    };
                }
                Err(e @ (StoreError::Timeout { .. } | StoreError::Transient { .. })) => {
                    unconfirmed = true;
                    warn!(%atr_id, error = %e, "commit flip unconfirmed, re-reading atr");
                    tokio::time::sleep(FLIP_RETRY_DELAY.min(self.remaining())).await;
                }
                Err(e) if unconfirmed => {
                    return Err(TransactionOperationFailed::ambiguous(format!(
                        "commit flip failed after an unconfirmed write: {e}"
                    )))
                }
                Err(e) => {
                    return Err(TransactionOperationFailed::new(
                        ErrorClass::Hard,
                        format!("commit flip failed: {e}"),
                    ))
                }
            }
        }
    }

    /// Moves committed writes into place. Returns false if any failed.
    async fn unstage(&self, mutations: &[StagedMutation]) -> bool {
        let opts = self.finish_options();
        let store = self.store();
        let mut complete = true;

        for m in mutations {
            let result = match (m.kind, m.content.as_ref()) {
                (MutationKind::Insert | MutationKind::Replace, Some(content)) => {
                    with_timeout(&m.id, opts.timeout, store.replace(&m.id, m.cas, content, &opts))
                        .await
                        .map(drop)
                }
                _ => with_timeout(&m.id, opts.timeout, store.remove(&m.id, m.cas, &opts)).await,
            };
            if let Err(e) = result {
                warn!(id = %m.id, kind = ?m.kind, error = %e, "failed to unstage committed mutation");
                complete = false;
            }
        }
        complete
    }

    /// Marks the entry `COMPLETED` once every write is in place, then drops it.
    async fn complete_entry(&self, atr_id: &DocId) -> Result<(), StoreError> {
        let opts = self.finish_options();
        let update = atr::update_entry(
            self.store(),
            atr_id,
            &self.inner.attempt_id,
            &opts,
            |prior| match prior {
                Some(entry) => EntryUpdate::Put(entry.clone().with_state(AtrState::Completed)),
                None => EntryUpdate::Skip,
            },
        );
        with_timeout(atr_id, opts.timeout, update).await?;
        self.remove_entry(atr_id).await
    }

    async fn remove_entry(&self, atr_id: &DocId) -> Result<(), StoreError> {
        let opts = self.finish_options();
        let update = atr::update_entry(
            self.store(),
            atr_id,
            &self.inner.attempt_id,
            &opts,
            |_| EntryUpdate::Delete,
        );
        with_timeout(atr_id, opts.timeout, update).await.map(drop)
    }

    async fn rollback_locked(&self) -> Result<(), TxnError> {
        let (atr_id, mutations) = {
            let shared = self.inner.shared.lock();
            (shared.atr_id.clone(), shared.log.to_vec())
        };
        let Some(atr_id) = atr_id else {
            self.inner.shared.lock().state = AttemptState::RolledBack;
            info!("rolled back attempt without writes");
            return Ok(());
        };

        let opts = self.finish_options();
        let abort = atr::update_entry(
            self.store(),
            &atr_id,
            &self.inner.attempt_id,
            &opts,
            |prior| match prior {
                Some(entry) => EntryUpdate::Put(entry.clone().with_state(AtrState::Aborted)),
                None => EntryUpdate::Skip,
            },
        );
        let declared = match with_timeout(&atr_id, opts.timeout, abort).await {
            Ok(entry) => entry,
            Err(e) => return Err(self.rollback_failed(&atr_id, e)),
        };

        // A stage whose acknowledgement was lost is only known to the entry
        let mut ids: Vec<DocId> = mutations.iter().map(|m| m.id.clone()).collect();
        if let Some(entry) = &declared {
            for (_, id) in entry.docs() {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }

        for id in &ids {
            let undo = cleanup::rollback_doc(self.store(), id, &self.inner.attempt_id, &opts);
            if let Err(e) = with_timeout(id, opts.timeout, undo).await {
                return Err(self.rollback_failed(&atr_id, e));
            }
        }

        if let Err(e) = self.remove_entry(&atr_id).await {
            warn!(%atr_id, error = %e, "rolled back but failed to remove atr entry");
            self.queue_cleanup(&atr_id, true);
        }

        {
            let mut shared = self.inner.shared.lock();
            shared.state = AttemptState::RolledBack;
            shared.log.clear();
        }
        info!(%atr_id, mutations = mutations.len(), "attempt rolled back");
        Ok(())
    }

    fn rollback_failed(&self, atr_id: &DocId, err: StoreError) -> TxnError {
        warn!(%atr_id, error = %err, "rollback failed, handing attempt to cleanup");
        let failure =
            TransactionOperationFailed::new(ErrorClass::Hard, format!("rollback failed: {err}"))
                .no_rollback();
        self.inner.shared.lock().state = AttemptState::Aborted(failure.clone());
        self.queue_cleanup(atr_id, true);
        failure.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryEngine;
    use crate::storage::{Fault, FaultKind, InMemoryDocumentStore, StoreOp};
    use crate::txn::{PerTransactionConfig, TransactionConfig, Transactions};
    use async_trait::async_trait;

    fn id(key: &str) -> DocId {
        DocId::default_collection("app", key)
    }

    fn content(s: &str) -> DocumentContent {
        DocumentContent::from(s)
    }

    fn config() -> TransactionConfig {
        TransactionConfig::new()
            .with_num_atrs(16)
            .with_cleanup_client_attempts(false)
            .with_cleanup_lost_attempts(false)
    }

    fn transactions(store: &Arc<InMemoryDocumentStore>) -> Transactions {
        Transactions::builder(store.clone())
            .config(config())
            .build()
            .unwrap()
    }

    async fn seed(store: &InMemoryDocumentStore, key: &str, body: &str) {
        store
            .insert(&id(key), &content(body), &StoreOptions::default())
            .await
            .unwrap();
    }

    fn body(store: &InMemoryDocumentStore, key: &str) -> Option<Vec<u8>> {
        store
            .peek(&id(key))
            .and_then(|d| d.content)
            .map(DocumentContent::into_bytes)
    }

    #[tokio::test]
    async fn test_read_your_own_writes() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        ctx.insert(&id("a"), content("1")).await.unwrap();
        let gets = store.op_count(StoreOp::Get);
        let doc = ctx.get(&id("a")).await.unwrap();
        assert_eq!(doc.content().as_bytes(), b"1");
        assert_eq!(store.op_count(StoreOp::Get), gets);

        let doc = ctx.replace(&doc, content("2")).await.unwrap();
        assert_eq!(ctx.get(&id("a")).await.unwrap().content().as_bytes(), b"2");
        assert_eq!(ctx.staged_count(), 1);

        // The staged insert stays invisible to plain readers
        assert!(store.peek(&id("a")).unwrap().is_shadow());

        seed(&store, "b", "10").await;
        let b = ctx.get(&id("b")).await.unwrap();
        ctx.remove(&b).await.unwrap();
        let err = ctx.get(&id("b")).await.unwrap_err();
        assert!(matches!(err, TxnError::DocumentNotFound { .. }));
        assert_eq!(body(&store, "b").unwrap(), b"10");

        drop(doc);
        ctx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_reference_is_rejected() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        let first = ctx.get(&id("a")).await.unwrap();
        let second = ctx.replace(&first, content("2")).await.unwrap();
        let err = ctx.replace(&first, content("3")).await.unwrap_err();
        assert!(matches!(err, TxnError::CasMismatch { .. }));
        assert!(err.is_retryable());
        assert_ne!(first.cas(), second.cas());

        // The mismatch poisons the attempt
        let err = ctx.get(&id("a")).await.unwrap_err();
        assert!(matches!(err, TxnError::OperationFailed(ref f) if f.should_retry()));
    }

    #[tokio::test]
    async fn test_concurrent_modification_is_detected() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        let doc = ctx.get(&id("a")).await.unwrap();
        store
            .replace(&id("a"), doc.cas(), &content("external"), &StoreOptions::default())
            .await
            .unwrap();

        let err = ctx.replace(&doc, content("2")).await.unwrap_err();
        assert!(matches!(err, TxnError::CasMismatch { .. }));
        assert_eq!(body(&store, "a").unwrap(), b"external");
    }

    #[tokio::test]
    async fn test_concurrent_remove_is_a_cas_mismatch() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        let doc = ctx.get(&id("a")).await.unwrap();
        store
            .remove(&id("a"), doc.cas(), &StoreOptions::default())
            .await
            .unwrap();

        let err = ctx.replace(&doc, content("2")).await.unwrap_err();
        assert!(matches!(err, TxnError::CasMismatch { .. }));
        assert!(err.is_retryable());
        assert!(ctx.failure().unwrap().should_retry());
        assert!(store.peek(&id("a")).is_none());
    }

    #[tokio::test]
    async fn test_rollback_clears_stage_with_lost_ack() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        // The shadow entry is written but the attempt never learns its cas
        store.inject(Fault::new(StoreOp::Stage, FaultKind::TimeoutAfterApply));
        let err = ctx.insert(&id("a"), content("1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ctx.staged_count(), 0);
        assert!(store.peek(&id("a")).unwrap().is_shadow());

        ctx.rollback().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::RolledBack);
        assert!(store.peek(&id("a")).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_commit_applies_every_mutation() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "y", "\"old\"").await;
        seed(&store, "z", "\"gone\"").await;
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        ctx.insert(&id("x"), content("\"new\"")).await.unwrap();
        let y = ctx.get(&id("y")).await.unwrap();
        ctx.replace(&y, content("\"updated\"")).await.unwrap();
        let z = ctx.get(&id("z")).await.unwrap();
        ctx.remove(&z).await.unwrap();

        // Nothing is visible before the commit point
        assert!(store.peek(&id("x")).unwrap().is_shadow());
        assert_eq!(body(&store, "y").unwrap(), b"\"old\"");
        assert!(store.peek(&id("z")).is_some());
        let atr_id = ctx.atr_id().unwrap();
        assert!(store.peek(&atr_id).is_some());

        ctx.commit().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::Committed);
        assert!(ctx.unstaging_complete());

        assert_eq!(body(&store, "x").unwrap(), b"\"new\"");
        assert_eq!(body(&store, "y").unwrap(), b"\"updated\"");
        assert!(store.peek(&id("y")).unwrap().meta.is_none());
        assert!(store.peek(&id("z")).is_none());
        assert!(store.peek(&atr_id).is_none());

        let err = ctx.get(&id("x")).await.unwrap_err();
        assert!(matches!(err, TxnError::OperationFailed(ref f) if f.class() == ErrorClass::NotActive));
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "y", "\"old\"").await;
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        ctx.insert(&id("x"), content("\"new\"")).await.unwrap();
        let y = ctx.get(&id("y")).await.unwrap();
        ctx.replace(&y, content("\"updated\"")).await.unwrap();
        let atr_id = ctx.atr_id().unwrap();

        ctx.rollback().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::RolledBack);
        assert!(store.peek(&id("x")).is_none());
        let y = store.peek(&id("y")).unwrap();
        assert_eq!(y.content.unwrap().as_bytes(), b"\"old\"");
        assert!(y.meta.is_none());
        assert!(store.peek(&atr_id).is_none());

        let ops: Vec<u64> = [StoreOp::Get, StoreOp::Replace, StoreOp::Remove, StoreOp::Stage]
            .iter()
            .map(|op| store.op_count(*op))
            .collect();
        ctx.rollback().await.unwrap();
        let after: Vec<u64> = [StoreOp::Get, StoreOp::Replace, StoreOp::Remove, StoreOp::Stage]
            .iter()
            .map(|op| store.op_count(*op))
            .collect();
        assert_eq!(ops, after);

        assert!(ctx.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_insert_existing_does_not_poison() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        let err = ctx.insert(&id("a"), content("2")).await.unwrap_err();
        assert!(matches!(err, TxnError::DocumentAlreadyExists { .. }));

        ctx.insert(&id("b"), content("3")).await.unwrap();
        let err = ctx.insert(&id("b"), content("4")).await.unwrap_err();
        assert!(matches!(err, TxnError::DocumentAlreadyExists { .. }));

        ctx.commit().await.unwrap();
        assert_eq!(body(&store, "b").unwrap(), b"3");
    }

    #[tokio::test]
    async fn test_remove_after_insert_discards() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        let doc = ctx.insert(&id("a"), content("1")).await.unwrap();
        ctx.remove(&doc).await.unwrap();
        assert_eq!(ctx.staged_count(), 0);
        assert!(store.peek(&id("a")).is_none());

        ctx.commit().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_insert_after_remove_becomes_replace() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        let doc = ctx.get(&id("a")).await.unwrap();
        ctx.remove(&doc).await.unwrap();
        ctx.insert(&id("a"), content("2")).await.unwrap();

        let log = ctx.inner.shared.lock().log.to_vec();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind(), MutationKind::Replace);

        ctx.commit().await.unwrap();
        assert_eq!(body(&store, "a").unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_live_foreign_staging_conflicts() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let txns = transactions(&store);
        let first = txns.begin(&PerTransactionConfig::new());
        let second = txns.begin(&PerTransactionConfig::new());

        let doc = first.get(&id("a")).await.unwrap();
        first.replace(&doc, content("2")).await.unwrap();

        // Read committed: the other attempt sees the committed body
        let seen = second.get(&id("a")).await.unwrap();
        assert_eq!(seen.content().as_bytes(), b"1");

        let err = second.replace(&seen, content("3")).await.unwrap_err();
        assert!(matches!(
            err,
            TxnError::OperationFailed(ref f) if f.class() == ErrorClass::WriteWriteConflict
        ));
        assert!(err.is_retryable());

        first.commit().await.unwrap();
        assert_eq!(body(&store, "a").unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_abandoned_foreign_staging_is_overwritten() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let txns = transactions(&store);
        let first = txns.begin(&PerTransactionConfig::new());
        let doc = first.get(&id("a")).await.unwrap();
        first.replace(&doc, content("2")).await.unwrap();

        // Mark the first attempt aborted without cleaning its markers
        let atr_id = first.atr_id().unwrap();
        atr::update_entry(&*store, &atr_id, first.id(), &StoreOptions::default(), |e| {
            EntryUpdate::Put(e.unwrap().clone().with_state(AtrState::Aborted))
        })
        .await
        .unwrap();

        let second = txns.begin(&PerTransactionConfig::new());
        let seen = second.get(&id("a")).await.unwrap();
        second.replace(&seen, content("3")).await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(body(&store, "a").unwrap(), b"3");
    }

    #[tokio::test]
    async fn test_unstaging_failure_is_not_fatal() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let txns = transactions(&store);
        let ctx = txns.begin(&PerTransactionConfig::new());

        let doc = ctx.get(&id("a")).await.unwrap();
        ctx.replace(&doc, content("2")).await.unwrap();
        store.inject(Fault::new(StoreOp::Replace, FaultKind::Transient).on_key("a"));
        ctx.commit().await.unwrap();
        assert!(!ctx.unstaging_complete());
        assert_eq!(body(&store, "a").unwrap(), b"1");

        // Readers already see the committed content through the ATR
        let reader = txns.begin(&PerTransactionConfig::new());
        let seen = reader.get(&id("a")).await.unwrap();
        assert_eq!(seen.content().as_bytes(), b"2");

        let outcome = txns
            .cleaner()
            .cleanup_attempt(&ctx.atr_id().unwrap(), ctx.id(), false)
            .await
            .unwrap();
        assert_eq!(outcome, crate::txn::CleanupOutcome::Completed);
        assert_eq!(body(&store, "a").unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_lost_ack_on_flip_is_resolved() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());

        ctx.insert(&id("a"), content("1")).await.unwrap();
        ctx.insert(&id("b"), content("2")).await.unwrap();
        // The next atr replace is the flip; it applies but reports a timeout
        store.inject(Fault::new(StoreOp::Replace, FaultKind::TimeoutAfterApply));

        ctx.commit().await.unwrap();
        assert_eq!(body(&store, "a").unwrap(), b"1");
        assert_eq!(body(&store, "b").unwrap(), b"2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_attempt_fails_fast() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "a", "1").await;
        let ctx = transactions(&store)
            .begin(&PerTransactionConfig::new().with_expiration(Duration::from_secs(1)));

        ctx.get(&id("a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ctx.expired());

        let err = ctx.get(&id("a")).await.unwrap_err();
        assert!(matches!(
            err,
            TxnError::OperationFailed(ref f) if f.to_raise() == FinalError::Expired
        ));
    }

    struct ScriptedEngine {
        mutations: Vec<QueryMutation>,
        fail: Option<QueryError>,
        seen: Mutex<Vec<TxnQueryContext>>,
    }

    #[async_trait]
    impl QueryEngine for ScriptedEngine {
        async fn execute(
            &self,
            _statement: &str,
            options: &QueryOptions,
        ) -> Result<QueryResult, QueryError> {
            if let Some(txn) = &options.txn {
                self.seen.lock().push(txn.clone());
            }
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            Ok(QueryResult {
                rows: vec![br#"{"ok":true}"#.to_vec()],
                mutations: self.mutations.clone(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_query_mutations_are_staged() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, "old", "1").await;
        let engine = Arc::new(ScriptedEngine {
            mutations: vec![
                QueryMutation::Insert {
                    id: id("q1"),
                    content: content("{\"q\":1}"),
                },
                QueryMutation::Remove { id: id("old") },
            ],
            fail: None,
            seen: Mutex::new(Vec::new()),
        });
        let txns = Transactions::builder(store.clone())
            .config(config())
            .query_engine(engine.clone())
            .build()
            .unwrap();
        let ctx = txns.begin(&PerTransactionConfig::new());

        ctx.insert(&id("kv"), content("0")).await.unwrap();
        let result = ctx
            .query("UPDATE app SET q = 1", &QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(result.rows_as_json().unwrap().len(), 1);

        // The engine saw the earlier KV write
        let seen = engine.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].staged.len(), 1);
        assert_eq!(seen[0].attempt_id, ctx.id());

        assert_eq!(ctx.staged_count(), 3);
        assert!(ctx.get(&id("old")).await.is_err());

        ctx.commit().await.unwrap();
        assert_eq!(body(&store, "q1").unwrap(), b"{\"q\":1}");
        assert!(store.peek(&id("old")).is_none());
    }

    #[tokio::test]
    async fn test_transient_query_error_is_retryable() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let engine = Arc::new(ScriptedEngine {
            mutations: Vec::new(),
            fail: Some(QueryError::Transient {
                reason: "index busy".into(),
            }),
            seen: Mutex::new(Vec::new()),
        });
        let txns = Transactions::builder(store.clone())
            .config(config())
            .query_engine(engine)
            .build()
            .unwrap();
        let ctx = txns.begin(&PerTransactionConfig::new());

        let err = ctx.query("SELECT 1", &QueryOptions::new()).await.unwrap_err();
        assert!(matches!(err, TxnError::Query { .. }));
        assert!(err.is_retryable());
        assert!(ctx.failure().is_some());
    }

    #[tokio::test]
    async fn test_query_without_engine_fails() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let ctx = transactions(&store).begin(&PerTransactionConfig::new());
        let err = ctx.query("SELECT 1", &QueryOptions::new()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
