// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Active transaction records.
//!
//! An ATR is an ordinary JSON document holding one entry per attempt that
//! hashed to it. The entry's state is the source of truth for whether the
//! attempt's staged changes are committed: the flip from `PENDING` to
//! `COMMITTED` is the commit point of the whole transaction.
//!
//! Documents staged by an attempt carry [`TxnLinks`] in their metadata
//! sidecar, pointing back at the ATR entry. Readers and cleanup follow
//! those links to decide what the staged content means.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::storage::{Cas, DocId, DocumentContent, DocumentStore, StoreError, StoreOptions};
use crate::time::Timestamp;

use super::config::MetadataCollection;
use super::staged::MutationKind;

/// Key prefix of ATR documents.
pub const ATR_KEY_PREFIX: &str = "_txn:atr-";

/// Bound on read-modify-write rounds against a contended ATR.
const MAX_ATR_SPINS: usize = 64;

/// Persisted state of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AtrState {
    Pending,
    Committed,
    Completed,
    Aborted,
    RolledBack,
}

/// One attempt's entry in an ATR document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtrEntry {
    pub txn_id: String,
    pub state: AtrState,
    pub started: Timestamp,
    pub expires_after_ms: u64,
    #[serde(default)]
    pub inserted: Vec<DocId>,
    #[serde(default)]
    pub replaced: Vec<DocId>,
    #[serde(default)]
    pub removed: Vec<DocId>,
}

impl AtrEntry {
    pub(crate) fn pending(txn_id: impl Into<String>, started: Timestamp, expires: Duration) -> Self {
        Self {
            txn_id: txn_id.into(),
            state: AtrState::Pending,
            started,
            expires_after_ms: expires.as_millis().min(u64::MAX as u128) as u64,
            inserted: Vec::new(),
            replaced: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Returns true if `now` is certainly past this attempt's expiry.
    pub fn is_expired(&self, now: &Timestamp) -> bool {
        let deadline = self
            .started
            .shifted(Duration::from_millis(self.expires_after_ms));
        now.definitely_after(&deadline)
    }

    /// Records `id` under `kind`, moving it out of any other list.
    pub(crate) fn record(&mut self, kind: MutationKind, id: &DocId) {
        self.forget(id);
        match kind {
            MutationKind::Insert => self.inserted.push(id.clone()),
            MutationKind::Replace => self.replaced.push(id.clone()),
            MutationKind::Remove => self.removed.push(id.clone()),
        }
    }

    pub(crate) fn forget(&mut self, id: &DocId) {
        self.inserted.retain(|d| d != id);
        self.replaced.retain(|d| d != id);
        self.removed.retain(|d| d != id);
    }

    /// Every document the attempt declared, with the kind of its write.
    pub fn docs(&self) -> impl Iterator<Item = (MutationKind, &DocId)> {
        self.inserted
            .iter()
            .map(|id| (MutationKind::Insert, id))
            .chain(self.replaced.iter().map(|id| (MutationKind::Replace, id)))
            .chain(self.removed.iter().map(|id| (MutationKind::Remove, id)))
    }

    pub(crate) fn with_state(mut self, state: AtrState) -> Self {
        self.state = state;
        self
    }
}

/// Body of an ATR document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtrDocument {
    #[serde(default)]
    pub attempts: BTreeMap<String, AtrEntry>,
}

/// Staging metadata written into a document's sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnLinks {
    pub txn_id: String,
    pub attempt_id: String,
    pub atr_id: DocId,
    pub op: MutationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<Vec<u8>>,
    #[serde(default)]
    pub staged_flags: u32,
}

impl TxnLinks {
    pub(crate) fn encode(&self, id: &DocId) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| corruption(id, e))
    }

    pub(crate) fn decode(id: &DocId, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| corruption(id, e))
    }

    /// Content the attempt staged, if the write carries any.
    pub fn staged_content(&self) -> Option<DocumentContent> {
        self.staged
            .as_ref()
            .map(|v| DocumentContent::new(v.clone(), self.staged_flags))
    }
}

fn corruption(id: &DocId, err: serde_json::Error) -> StoreError {
    StoreError::Corruption {
        id: id.clone(),
        reason: err.to_string(),
    }
}

/// Result of an update closure passed to [`update_entry`].
#[derive(Debug, Clone)]
pub(crate) enum EntryUpdate {
    Put(AtrEntry),
    Delete,
    Skip,
}

/// Key of ATR number `n`.
#[inline]
pub(crate) fn atr_key(n: usize) -> String {
    format!("{ATR_KEY_PREFIX}{n}")
}

/// Picks the ATR for an attempt whose first write is to `key`.
pub fn atr_id_for(collection: &MetadataCollection, key: &str, num_atrs: usize) -> DocId {
    let n = crc32fast::hash(key.as_bytes()) as usize % num_atrs.max(1);
    collection.doc_id(atr_key(n))
}

/// Reads and decodes an ATR document.
pub(crate) async fn read_atr(
    store: &dyn DocumentStore,
    atr_id: &DocId,
    opts: &StoreOptions,
) -> Result<Option<(Cas, AtrDocument)>, StoreError> {
    let Some(doc) = store.get(atr_id, opts).await? else {
        return Ok(None);
    };
    let Some(content) = doc.content else {
        return Ok(None);
    };
    let body: AtrDocument =
        serde_json::from_slice(content.as_bytes()).map_err(|e| corruption(atr_id, e))?;
    Ok(Some((doc.cas, body)))
}

/// Reads one attempt's entry.
pub(crate) async fn read_entry(
    store: &dyn DocumentStore,
    atr_id: &DocId,
    attempt_id: &str,
    opts: &StoreOptions,
) -> Result<Option<AtrEntry>, StoreError> {
    Ok(read_atr(store, atr_id, opts)
        .await?
        .and_then(|(_, mut body)| body.attempts.remove(attempt_id)))
}

/// Applies `f` to an attempt's entry with a CAS-checked read-modify-write.
///
/// `f` sees the current entry and may be called more than once if other
/// attempts sharing the ATR write concurrently. Returns the entry `f` saw on
/// the round that took effect. An ATR left with no entries is removed.
pub(crate) async fn update_entry<F>(
    store: &dyn DocumentStore,
    atr_id: &DocId,
    attempt_id: &str,
    opts: &StoreOptions,
    mut f: F,
) -> Result<Option<AtrEntry>, StoreError>
where
    F: FnMut(Option<&AtrEntry>) -> EntryUpdate + Send,
{
    for _ in 0..MAX_ATR_SPINS {
        let (cas, mut body) = match read_atr(store, atr_id, opts).await? {
            Some((cas, body)) => (Some(cas), body),
            None => (None, AtrDocument::default()),
        };
        let prior = body.attempts.get(attempt_id).cloned();

        match f(prior.as_ref()) {
            EntryUpdate::Skip => return Ok(prior),
            EntryUpdate::Delete if prior.is_none() => return Ok(None),
            EntryUpdate::Delete => {
                body.attempts.remove(attempt_id);
            }
            EntryUpdate::Put(entry) => {
                body.attempts.insert(attempt_id.to_string(), entry);
            }
        }

        let written = match cas {
            None => {
                let content = encode_atr(atr_id, &body)?;
                store.insert(atr_id, &content, opts).await.map(drop)
            }
            Some(cas) if body.attempts.is_empty() => store.remove(atr_id, cas, opts).await,
            Some(cas) => {
                let content = encode_atr(atr_id, &body)?;
                store.replace(atr_id, cas, &content, opts).await.map(drop)
            }
        };

        match written {
            Ok(()) => return Ok(prior),
            Err(StoreError::CasMismatch { .. })
            | Err(StoreError::AlreadyExists { .. })
            | Err(StoreError::NotFound { .. }) => {
                trace!(%atr_id, attempt_id, "atr changed underneath update, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::CasMismatch { id: atr_id.clone() })
}

fn encode_atr(atr_id: &DocId, body: &AtrDocument) -> Result<DocumentContent, StoreError> {
    serde_json::to_vec(body)
        .map(DocumentContent::json)
        .map_err(|e| corruption(atr_id, e))
}
