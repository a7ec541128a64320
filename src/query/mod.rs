// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Query engine capability consumed by the transaction engine.
//!
//! Statements issued from inside a transaction carry a
//! [`TxnQueryContext`]: the attempt's identity and a snapshot of its staged
//! mutations. The engine must let the statement observe those staged
//! writes, and must report every document it changes as a
//! [`QueryMutation`] instead of applying it, so the attempt can stage it
//! exactly like a key-value write.

mod error;

pub use error::QueryError;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::storage::{DocId, DocumentContent};
use crate::txn::StagedMutation;

/// Index consistency requested for a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanConsistency {
    /// Return whatever the indexes hold right now.
    NotBounded,
    /// Wait for indexes to catch up with all mutations made before the request.
    #[default]
    RequestPlus,
}

/// Bucket/scope a statement's unqualified keyspaces resolve against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryScope {
    pub bucket: String,
    pub scope: String,
}

/// Transaction state handed to the engine with every in-transaction statement.
#[derive(Debug, Clone)]
pub struct TxnQueryContext {
    pub txn_id: String,
    pub attempt_id: String,
    pub atr_id: Option<DocId>,
    pub staged: Vec<StagedMutation>,
}

/// Per-statement options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub positional_params: Vec<serde_json::Value>,
    pub named_params: BTreeMap<String, serde_json::Value>,
    pub scan_consistency: Option<ScanConsistency>,
    pub readonly: bool,
    pub scope: Option<QueryScope>,
    pub raw: BTreeMap<String, serde_json::Value>,
    pub timeout: Option<Duration>,
    pub txn: Option<TxnQueryContext>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional parameter (`$1`, `$2`, ...).
    pub fn positional(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.positional_params.push(value.into());
        self
    }

    /// Sets a named parameter (`$name`).
    pub fn named(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.named_params.insert(name.into(), value.into());
        self
    }

    pub fn scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn scope(mut self, bucket: impl Into<String>, scope: impl Into<String>) -> Self {
        self.scope = Some(QueryScope {
            bucket: bucket.into(),
            scope: scope.into(),
        });
        self
    }

    /// Passes an engine-specific option through untouched.
    pub fn raw(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.raw.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Completion status of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    #[default]
    Success,
    Errors,
    Timeout,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWarning {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMetrics {
    pub elapsed: Duration,
    pub execution_time: Duration,
    pub result_count: u64,
    pub mutation_count: u64,
    pub error_count: u64,
    pub warning_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct QueryMetadata {
    pub request_id: String,
    pub client_context_id: String,
    pub status: QueryStatus,
    pub metrics: QueryMetrics,
    pub warnings: Vec<QueryWarning>,
    pub signature: Option<serde_json::Value>,
}

/// A document change performed by a statement, to be staged by the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryMutation {
    Insert { id: DocId, content: DocumentContent },
    Replace { id: DocId, content: DocumentContent },
    Remove { id: DocId },
}

impl QueryMutation {
    pub fn id(&self) -> &DocId {
        match self {
            QueryMutation::Insert { id, .. }
            | QueryMutation::Replace { id, .. }
            | QueryMutation::Remove { id } => id,
        }
    }
}

/// Rows, metadata and the mutations a statement asked for.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Vec<u8>>,
    pub metadata: QueryMetadata,
    pub mutations: Vec<QueryMutation>,
}

impl QueryResult {
    /// Iterates the raw JSON rows in the order the engine returned them.
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        self.rows.iter().map(Vec::as_slice)
    }

    /// Decodes every row as a JSON value.
    pub fn rows_as_json(&self) -> Result<Vec<serde_json::Value>, serde_json::Error> {
        self.rows().map(serde_json::from_slice).collect()
    }
}

/// Parameterized statement execution.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(
        &self,
        statement: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult, QueryError>;
}
