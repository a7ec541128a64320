// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Document store error types.

use std::time::Duration;

use super::{DocId, DurabilityLevel};

/// Errors reported by a [`DocumentStore`](super::DocumentStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document {id} not found")]
    NotFound { id: DocId },

    #[error("document {id} already exists")]
    AlreadyExists { id: DocId },

    #[error("cas mismatch on document {id}")]
    CasMismatch { id: DocId },

    #[error("operation on {id} timed out after {timeout:?}")]
    Timeout { id: DocId, timeout: Duration },

    #[error("transient failure on {id}: {reason}")]
    Transient { id: DocId, reason: String },

    #[error("durability level {level:?} cannot be satisfied")]
    DurabilityImpossible { level: DurabilityLevel },

    #[error("corrupt document {id}: {reason}")]
    Corruption { id: DocId, reason: String },
}

impl StoreError {
    /// Returns the document the error refers to, if any.
    pub fn id(&self) -> Option<&DocId> {
        match self {
            StoreError::NotFound { id }
            | StoreError::AlreadyExists { id }
            | StoreError::CasMismatch { id }
            | StoreError::Timeout { id, .. }
            | StoreError::Transient { id, .. }
            | StoreError::Corruption { id, .. } => Some(id),
            StoreError::DurabilityImpossible { .. } => None,
        }
    }
}
