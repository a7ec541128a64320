// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction error types.

use crate::query::QueryError;
use crate::storage::{DocId, StoreError};

/// Boxed error returned by transaction bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What went wrong inside an attempt, as far as retry decisions go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    CasMismatch,
    /// Another live attempt has staged the document.
    WriteWriteConflict,
    Transient,
    Timeout,
    Expired,
    /// The outcome of the commit point could not be confirmed.
    Ambiguous,
    /// The attempt is no longer accepting operations.
    NotActive,
    Hard,
}

/// The terminal error an operation failure turns into if it ends the
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalError {
    Failed,
    Expired,
    CommitAmbiguous,
}

/// A failed attempt operation, classified at the point it happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transaction operation failed ({class:?}, retry={retry}): {message}")]
pub struct TransactionOperationFailed {
    class: ErrorClass,
    retry: bool,
    rollback: bool,
    raise: FinalError,
    message: String,
}

impl TransactionOperationFailed {
    pub(crate) fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            retry: false,
            rollback: true,
            raise: FinalError::Failed,
            message: message.into(),
        }
    }

    pub(crate) fn retryable(mut self) -> Self {
        self.retry = true;
        self
    }

    pub(crate) fn no_rollback(mut self) -> Self {
        self.rollback = false;
        self
    }

    pub(crate) fn raise(mut self, raise: FinalError) -> Self {
        self.raise = raise;
        self
    }

    pub(crate) fn expired(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Expired, message).raise(FinalError::Expired)
    }

    pub(crate) fn ambiguous(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Ambiguous, message)
            .no_rollback()
            .raise(FinalError::CommitAmbiguous)
    }

    pub(crate) fn not_active(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotActive, message).no_rollback()
    }

    #[inline]
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// Returns true if the transaction should be retried with a new attempt.
    #[inline]
    pub fn should_retry(&self) -> bool {
        self.retry
    }

    /// Returns true if the attempt should be rolled back.
    #[inline]
    pub fn should_rollback(&self) -> bool {
        self.rollback
    }

    #[inline]
    pub fn to_raise(&self) -> FinalError {
        self.raise
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors visible to transaction bodies.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TxnError {
    #[error("document {id} not found")]
    DocumentNotFound { id: DocId },

    #[error("document {id} already exists")]
    DocumentAlreadyExists { id: DocId },

    #[error("cas mismatch on document {id}")]
    CasMismatch { id: DocId },

    #[error(transparent)]
    OperationFailed(#[from] TransactionOperationFailed),

    #[error("query failed in transaction {txn_id}: {source}")]
    Query {
        txn_id: String,
        #[source]
        source: QueryError,
    },
}

/// How the orchestrator should react to an attempt failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Retry,
    Expired,
    Ambiguous,
    Fail,
}

impl TxnError {
    /// Returns true if a fresh attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    pub(crate) fn disposition(&self) -> Disposition {
        match self {
            TxnError::CasMismatch { .. } => Disposition::Retry,
            TxnError::OperationFailed(op) => match op.raise {
                FinalError::CommitAmbiguous => Disposition::Ambiguous,
                FinalError::Expired => Disposition::Expired,
                FinalError::Failed if op.retry => Disposition::Retry,
                FinalError::Failed => Disposition::Fail,
            },
            TxnError::Query { source, .. } if source.is_retryable() => Disposition::Retry,
            TxnError::Query { .. }
            | TxnError::DocumentNotFound { .. }
            | TxnError::DocumentAlreadyExists { .. } => Disposition::Fail,
        }
    }

    /// Returns the operation failure this error is or implies, if it poisons
    /// the attempt.
    pub(crate) fn poisons_attempt(&self) -> Option<TransactionOperationFailed> {
        match self {
            TxnError::CasMismatch { id } => Some(
                TransactionOperationFailed::new(
                    ErrorClass::CasMismatch,
                    format!("cas mismatch on {id}"),
                )
                .retryable(),
            ),
            TxnError::OperationFailed(op) if op.class != ErrorClass::NotActive => Some(op.clone()),
            TxnError::Query { source, .. } if source.is_retryable() => Some(
                TransactionOperationFailed::new(ErrorClass::Transient, source.to_string())
                    .retryable(),
            ),
            _ => None,
        }
    }
}

/// Terminal outcome of [`Transactions::run`](super::Transactions::run) when
/// the transaction did not commit (or may not have).
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction {txn_id} expired after {attempts} attempt(s)")]
    Expired {
        txn_id: String,
        attempts: u32,
        #[source]
        cause: BoxError,
    },

    #[error("transaction {txn_id} commit is ambiguous after {attempts} attempt(s)")]
    CommitAmbiguous {
        txn_id: String,
        attempts: u32,
        #[source]
        cause: BoxError,
    },

    #[error("transaction {txn_id} failed after {attempts} attempt(s): {cause}")]
    Failed {
        txn_id: String,
        attempts: u32,
        #[source]
        cause: BoxError,
    },
}

impl TransactionError {
    pub fn txn_id(&self) -> &str {
        match self {
            TransactionError::Expired { txn_id, .. }
            | TransactionError::CommitAmbiguous { txn_id, .. }
            | TransactionError::Failed { txn_id, .. } => txn_id,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            TransactionError::Expired { attempts, .. }
            | TransactionError::CommitAmbiguous { attempts, .. }
            | TransactionError::Failed { attempts, .. } => *attempts,
        }
    }

    /// The last failure that led to this outcome.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match self {
            TransactionError::Expired { cause, .. }
            | TransactionError::CommitAmbiguous { cause, .. }
            | TransactionError::Failed { cause, .. } => cause.as_ref(),
        }
    }
}

/// Classifies a store error raised while staging or reading.
///
/// `expired` is whether the transaction's budget is exhausted; a timeout is
/// only worth retrying while budget remains.
pub(crate) fn classify_store_error(err: StoreError, expired: bool) -> TxnError {
    match err {
        StoreError::CasMismatch { id } => TxnError::CasMismatch { id },
        StoreError::NotFound { id } => TxnError::DocumentNotFound { id },
        StoreError::AlreadyExists { id } => TxnError::DocumentAlreadyExists { id },
        StoreError::Timeout { .. } if expired => {
            TransactionOperationFailed::expired(err.to_string()).into()
        }
        StoreError::Timeout { .. } => {
            TransactionOperationFailed::new(ErrorClass::Timeout, err.to_string())
                .retryable()
                .into()
        }
        StoreError::Transient { .. } => {
            TransactionOperationFailed::new(ErrorClass::Transient, err.to_string())
                .retryable()
                .into()
        }
        StoreError::DurabilityImpossible { .. } | StoreError::Corruption { .. } => {
            TransactionOperationFailed::new(ErrorClass::Hard, err.to_string()).into()
        }
    }
}
