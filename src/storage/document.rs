// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Document identity, content and per-call options.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the default scope and collection.
pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

/// Common flags value marking content as JSON.
pub const JSON_FLAGS: u32 = 0x0200_0006;

/// Default per-operation timeout.
pub const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2_500);

/// Fully qualified document identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId {
    bucket: String,
    scope: String,
    collection: String,
    key: String,
}

impl DocId {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Creates an id in the default scope and collection of `bucket`.
    pub fn default_collection(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(bucket, DEFAULT_SCOPE, DEFAULT_COLLECTION, key)
    }

    #[inline]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[inline]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns an id for `key` in the same collection as `self`.
    pub fn sibling(&self, key: impl Into<String>) -> Self {
        Self::new(
            self.bucket.clone(),
            self.scope.clone(),
            self.collection.clone(),
            key,
        )
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}/{}",
            self.bucket, self.scope, self.collection, self.key
        )
    }
}

/// Opaque version stamp issued by the store on every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cas(pub u64);

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Document body bytes plus their flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentContent {
    value: Vec<u8>,
    flags: u32,
}

impl DocumentContent {
    pub fn new(value: Vec<u8>, flags: u32) -> Self {
        Self { value, flags }
    }

    /// Creates content flagged as JSON.
    pub fn json(value: impl Into<Vec<u8>>) -> Self {
        Self::new(value.into(), JSON_FLAGS)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.value
    }
}

impl From<&str> for DocumentContent {
    fn from(s: &str) -> Self {
        Self::json(s.as_bytes().to_vec())
    }
}

impl From<String> for DocumentContent {
    fn from(s: String) -> Self {
        Self::json(s.into_bytes())
    }
}

impl From<Vec<u8>> for DocumentContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self::json(bytes)
    }
}

impl From<&[u8]> for DocumentContent {
    fn from(bytes: &[u8]) -> Self {
        Self::json(bytes.to_vec())
    }
}

impl From<&serde_json::Value> for DocumentContent {
    fn from(value: &serde_json::Value) -> Self {
        Self::json(value.to_string().into_bytes())
    }
}

impl From<serde_json::Value> for DocumentContent {
    fn from(value: serde_json::Value) -> Self {
        Self::from(&value)
    }
}

/// Everything the store holds for one document id.
///
/// `content` is `None` for shadow entries: ids that only carry transaction
/// metadata for an insert that has been staged but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub cas: Cas,
    pub content: Option<DocumentContent>,
    pub meta: Option<Vec<u8>>,
}

impl StoredDocument {
    /// Returns true if this entry has no visible body.
    #[inline]
    pub fn is_shadow(&self) -> bool {
        self.content.is_none()
    }
}

/// Replication/persistence requirement attached to mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    None,
    #[default]
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

/// Options carried by every store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub timeout: Duration,
    pub durability: DurabilityLevel,
}

impl StoreOptions {
    pub fn new(timeout: Duration, durability: DurabilityLevel) -> Self {
        Self {
            timeout,
            durability,
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new(DEFAULT_KV_TIMEOUT, DurabilityLevel::default())
    }
}
