// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Document store capability consumed by the transaction engine.
//!
//! The engine never talks to a network or a disk directly. Everything it
//! needs from the database is expressed by [`DocumentStore`]: CRUD with
//! optimistic concurrency through a compare-and-swap token, plus a small
//! metadata sidecar per document where staged transactional changes are
//! recorded without touching the visible body.
//!
//! # Key Concepts
//!
//! - Every mutation returns a fresh [`Cas`]. Conditional writes present the
//!   CAS they last observed and fail with [`StoreError::CasMismatch`] if the
//!   document changed in between.
//! - A *shadow* entry is an id that carries metadata but no body. Staged
//!   inserts are shadows until they are committed; plain readers treat them
//!   as absent.
//!
//! # Example
//!
//! ```no_run
//! use doctxn::storage::{DocId, DocumentContent, DocumentStore, InMemoryDocumentStore, StoreOptions};
//!
//! # async fn example() -> Result<(), doctxn::storage::StoreError> {
//! let store = InMemoryDocumentStore::new();
//! let opts = StoreOptions::default();
//! let id = DocId::default_collection("app", "user::1");
//!
//! let cas = store.insert(&id, &DocumentContent::from(r#"{"name":"ada"}"#), &opts).await?;
//! store.replace(&id, cas, &DocumentContent::from(r#"{"name":"grace"}"#), &opts).await?;
//! # Ok(())
//! # }
//! ```

mod document;
mod error;
mod memory;

pub use document::{
    Cas, DocId, DocumentContent, DurabilityLevel, StoreOptions, StoredDocument,
    DEFAULT_COLLECTION, DEFAULT_KV_TIMEOUT, DEFAULT_SCOPE, JSON_FLAGS,
};
pub use error::StoreError;
pub use memory::{Fault, FaultKind, InMemoryDocumentStore, StoreOp};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

/// CRUD with compare-and-swap, plus a transaction metadata sidecar.
///
/// All calls honour `opts.timeout` and `opts.durability`; a mutation only
/// reports success once the durability requirement has been met.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads a document, including shadow entries and their metadata.
    ///
    /// Returns `Ok(None)` if nothing is stored under `id`.
    async fn get(
        &self,
        id: &DocId,
        opts: &StoreOptions,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Creates a document. Fails with `AlreadyExists` if any entry exists.
    async fn insert(
        &self,
        id: &DocId,
        content: &DocumentContent,
        opts: &StoreOptions,
    ) -> Result<Cas, StoreError>;

    /// Replaces the body of an entry (shadow or not) and clears its metadata.
    async fn replace(
        &self,
        id: &DocId,
        cas: Cas,
        content: &DocumentContent,
        opts: &StoreOptions,
    ) -> Result<Cas, StoreError>;

    /// Removes an entry (shadow or not).
    async fn remove(&self, id: &DocId, cas: Cas, opts: &StoreOptions) -> Result<(), StoreError>;

    /// Writes or clears the metadata sidecar without touching the body.
    ///
    /// - `cas = None` creates a shadow entry holding `meta` and fails with
    ///   `AlreadyExists` if anything is stored under `id`.
    /// - `cas = Some(_)` updates the sidecar of the existing entry. Clearing
    ///   the sidecar of a shadow entry removes the entry.
    async fn stage(
        &self,
        id: &DocId,
        cas: Option<Cas>,
        meta: Option<&[u8]>,
        opts: &StoreOptions,
    ) -> Result<Cas, StoreError>;
}

/// Runs a store call, mapping an elapsed `timeout` to [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(id: &DocId, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            id: id.clone(),
            timeout,
        }),
    }
}
