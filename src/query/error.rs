// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Query engine error types.

use std::time::Duration;

/// Errors reported by a [`QueryEngine`](super::QueryEngine).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("parsing failed: {message}")]
    ParsingFailed { message: String },

    #[error("statement failed with code {code}: {message}")]
    Statement { code: u32, message: String },

    #[error("query timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("transient query failure: {reason}")]
    Transient { reason: String },
}

impl QueryError {
    /// Returns true if re-running the statement in a fresh attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Transient { .. } | QueryError::Timeout { .. })
    }
}
