// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Client-side multi-document transactions.
//!
//! This module provides ACID transactions over any [`DocumentStore`] with:
//! - Eager staging: every write is staged on the document when it is issued
//! - A single atomic commit point per attempt (the ATR entry flip)
//! - Automatic retry with backoff under contention, bounded by an expiry budget
//! - Cleanup of attempts left unfinished by this or other clients
//!
//! # Key Concepts
//!
//! ## Staging
//!
//! Writes never touch a document's visible body before commit. An insert
//! creates a *shadow* entry that plain readers treat as absent; a replace or
//! remove records the new content in the document's metadata sidecar. Each
//! staging write is conditioned on the CAS the attempt last observed, so a
//! concurrent change fails that specific write and the attempt is retried.
//!
//! ## Commit Point
//!
//! Every attempt that writes owns an entry in an *active transaction
//! record* (ATR). Flipping that entry from `PENDING` to `COMMITTED` is the
//! moment the whole transaction takes effect: from then on any reader that
//! follows a document's links sees the staged content, even before it has
//! been moved into place.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use doctxn::storage::{DocId, InMemoryDocumentStore};
//! use doctxn::txn::{TransactionConfig, Transactions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryDocumentStore::new());
//! let txns = Transactions::new(store, TransactionConfig::default())?;
//!
//! let result = txns
//!     .run(|ctx| async move {
//!         let from = DocId::default_collection("bank", "account::alice");
//!         let to = DocId::default_collection("bank", "account::bob");
//!
//!         let a = ctx.get(&from).await?;
//!         let b = ctx.get(&to).await?;
//!         let balance_a: i64 = a.content_as()?;
//!         let balance_b: i64 = b.content_as()?;
//!
//!         ctx.replace(&a, serde_json::json!(balance_a - 10)).await?;
//!         ctx.replace(&b, serde_json::json!(balance_b + 10)).await?;
//!         Ok(())
//!     })
//!     .await?;
//!
//! println!("committed {} after {} attempt(s)", result.transaction_id(), result.attempts());
//! # Ok(())
//! # }
//! ```
//!
//! [`DocumentStore`]: crate::storage::DocumentStore

mod atr;
mod attempt;
mod cleanup;
mod config;
mod error;
mod manager;
mod reference;
mod staged;
mod transaction;

pub use atr::{atr_id_for, AtrDocument, AtrEntry, AtrState, TxnLinks, ATR_KEY_PREFIX};
pub use attempt::AttemptContext;
pub use cleanup::{Cleaner, CleanupOutcome};
pub use config::{
    ConfigError, MetadataCollection, PerTransactionConfig, TransactionConfig,
    DEFAULT_CLEANUP_WINDOW, DEFAULT_EXPIRATION, DEFAULT_NUM_ATRS,
};
pub use error::{
    BoxError, ErrorClass, FinalError, TransactionError, TransactionOperationFailed, TxnError,
};
pub use manager::{Transactions, TransactionsBuilder};
pub use reference::DocumentReference;
pub use staged::{MutationKind, StagedMutation, StagedMutationLog};
pub use transaction::{AttemptState, TransactionResult};
