// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! doctxn: client-side multi-document ACID transactions for document databases
//!
//! This crate coordinates speculative reads and writes across many documents,
//! stages them durably next to the documents themselves, and commits them
//! atomically through a single compare-and-swap on a transaction record. The
//! database is reached only through the [`DocumentStore`] and [`QueryEngine`]
//! capability traits.

pub mod query;
pub mod storage;
pub mod time;
pub mod txn;

pub use query::{QueryEngine, QueryError, QueryOptions, QueryResult, ScanConsistency};
pub use storage::{
    Cas, DocId, DocumentContent, DocumentStore, DurabilityLevel, InMemoryDocumentStore,
    StoreError, StoreOptions,
};
pub use time::{HlcTimeService, TimeService, Timestamp};
pub use txn::{
    AttemptContext, AttemptState, DocumentReference, PerTransactionConfig, TransactionConfig,
    TransactionError, TransactionResult, Transactions, TxnError,
};
