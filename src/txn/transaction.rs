// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Attempt state and transaction outcome types.

use super::error::TransactionOperationFailed;

/// Lifecycle of a single attempt.
///
/// ```text
/// NotStarted -> InProgress -> Committing -> Committed
///                    |             |
///                    +-------------+--> RolledBack | Aborted(reason)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    NotStarted,
    InProgress,
    /// The commit has begun; the attempt no longer accepts operations.
    Committing,
    Committed,
    RolledBack,
    /// The attempt stopped without a clean rollback, e.g. after an ambiguous
    /// commit or a failed rollback.
    Aborted(TransactionOperationFailed),
}

impl AttemptState {
    /// Returns true if the attempt accepts operations.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, AttemptState::NotStarted | AttemptState::InProgress)
    }

    /// Returns true if the attempt has reached one of its terminal states.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Committed | AttemptState::RolledBack | AttemptState::Aborted(_)
        )
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        *self == AttemptState::Committed
    }
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub(crate) txn_id: String,
    pub(crate) unstaging_complete: bool,
    pub(crate) attempts: u32,
}

impl TransactionResult {
    /// Identifier shared by every attempt of the transaction.
    #[inline]
    pub fn transaction_id(&self) -> &str {
        &self.txn_id
    }

    /// Returns false if some committed changes were left for cleanup to
    /// move into place. The transaction is committed either way.
    #[inline]
    pub fn unstaging_complete(&self) -> bool {
        self.unstaging_complete
    }

    /// Number of attempts made, including the one that committed.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
