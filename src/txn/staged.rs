// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Ordered log of an attempt's staged writes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::storage::{Cas, DocId, DocumentContent};

/// Kind of a staged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Insert,
    Replace,
    Remove,
}

/// A write staged by an attempt but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedMutation {
    pub(crate) kind: MutationKind,
    pub(crate) id: DocId,
    pub(crate) content: Option<DocumentContent>,
    /// CAS of the document after staging.
    pub(crate) cas: Cas,
    /// CAS the staging write was conditioned on; `None` for inserts.
    pub(crate) pre_stage_cas: Option<Cas>,
}

impl StagedMutation {
    pub(crate) fn new(
        kind: MutationKind,
        id: DocId,
        content: Option<DocumentContent>,
        cas: Cas,
        pre_stage_cas: Option<Cas>,
    ) -> Self {
        Self {
            kind,
            id,
            content,
            cas,
            pre_stage_cas,
        }
    }

    #[inline]
    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    #[inline]
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// New content; `None` for removes.
    #[inline]
    pub fn content(&self) -> Option<&DocumentContent> {
        self.content.as_ref()
    }

    /// CAS later operations in the same attempt must present.
    #[inline]
    pub fn cas(&self) -> Cas {
        self.cas
    }

    #[inline]
    pub fn pre_stage_cas(&self) -> Option<Cas> {
        self.pre_stage_cas
    }
}

/// Pending writes keyed by document identity, in first-staged order.
///
/// Holds at most one entry per document. Upserting an id that is already
/// present replaces the entry in place.
#[derive(Debug, Default, Clone)]
pub struct StagedMutationLog {
    entries: Vec<StagedMutation>,
    index: HashMap<DocId, usize>,
}

impl StagedMutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `mutation.id`.
    ///
    /// Returns the entry it replaced, if any.
    pub fn upsert(&mut self, mutation: StagedMutation) -> Option<StagedMutation> {
        match self.index.get(&mutation.id) {
            Some(&pos) => Some(std::mem::replace(&mut self.entries[pos], mutation)),
            None => {
                self.index.insert(mutation.id.clone(), self.entries.len());
                self.entries.push(mutation);
                None
            }
        }
    }

    pub fn get(&self, id: &DocId) -> Option<&StagedMutation> {
        self.index.get(id).map(|&pos| &self.entries[pos])
    }

    pub fn remove(&mut self, id: &DocId) -> Option<StagedMutation> {
        let pos = self.index.remove(id)?;
        let removed = self.entries.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    /// Iterates entries in the order their ids were first staged.
    pub fn iter(&self) -> impl Iterator<Item = &StagedMutation> {
        self.entries.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub(crate) fn to_vec(&self) -> Vec<StagedMutation> {
        self.entries.clone()
    }
}
