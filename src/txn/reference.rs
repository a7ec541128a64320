// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Snapshot of a document as observed inside an attempt.

use crate::storage::{Cas, DocId, DocumentContent};

use super::atr::TxnLinks;

/// A document as it was read or written by an attempt.
///
/// The CAS is only good for the operation that produced it. Passing a stale
/// reference to `replace` or `remove` fails with `CasMismatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReference {
    pub(crate) id: DocId,
    pub(crate) cas: Cas,
    pub(crate) content: DocumentContent,
    /// Transaction links found on the document when it was read.
    pub(crate) links: Option<TxnLinks>,
}

impl DocumentReference {
    pub(crate) fn new(
        id: DocId,
        cas: Cas,
        content: DocumentContent,
        links: Option<TxnLinks>,
    ) -> Self {
        Self {
            id,
            cas,
            content,
            links,
        }
    }

    #[inline]
    pub fn id(&self) -> &DocId {
        &self.id
    }

    #[inline]
    pub fn cas(&self) -> Cas {
        self.cas
    }

    #[inline]
    pub fn content(&self) -> &DocumentContent {
        &self.content
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.content.flags()
    }

    /// Decodes the content as JSON.
    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.content.as_bytes())
    }
}
