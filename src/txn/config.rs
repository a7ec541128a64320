// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Configuration for transactions.

use std::time::Duration;

use crate::query::ScanConsistency;
use crate::storage::{DocId, DurabilityLevel, StoreOptions, DEFAULT_KV_TIMEOUT};

/// Default expiry budget for a whole transaction.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(15);

/// Default interval between lost-attempt cleanup sweeps.
pub const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_secs(60);

/// Default number of ATR documents per collection.
pub const DEFAULT_NUM_ATRS: usize = 1024;

/// Errors returned for invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("expiration must be greater than zero")]
    ZeroExpiration,

    #[error("kv timeout must be greater than zero")]
    ZeroKvTimeout,

    #[error("num_atrs must be greater than zero")]
    ZeroAtrs,

    #[error("cleanup window must be greater than zero")]
    ZeroCleanupWindow,

    #[error("backoff_min {min:?} exceeds backoff_max {max:?}")]
    BackoffRange { min: Duration, max: Duration },
}

/// Where transaction metadata (ATR documents) is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetadataCollection {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl MetadataCollection {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Id of a document named `key` in this collection.
    pub(crate) fn doc_id(&self, key: impl Into<String>) -> DocId {
        DocId::new(&self.bucket, &self.scope, &self.collection, key)
    }
}

/// Client-wide transaction configuration.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Durability required of every transactional write.
    pub durability: DurabilityLevel,
    /// Upper bound on a single store call.
    pub kv_timeout: Duration,
    /// Budget for the whole transaction, across all attempts.
    pub expiration: Duration,
    /// Interval between lost-attempt sweeps.
    pub cleanup_window: Duration,
    /// Collection for ATR documents. `None` uses the default collection of
    /// the first mutated document's bucket.
    pub metadata_collection: Option<MetadataCollection>,
    pub scan_consistency: ScanConsistency,
    pub cleanup_lost_attempts: bool,
    pub cleanup_client_attempts: bool,
    pub num_atrs: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityLevel::Majority,
            kv_timeout: DEFAULT_KV_TIMEOUT,
            expiration: DEFAULT_EXPIRATION,
            cleanup_window: DEFAULT_CLEANUP_WINDOW,
            metadata_collection: None,
            scan_consistency: ScanConsistency::RequestPlus,
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
            num_atrs: DEFAULT_NUM_ATRS,
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(100),
        }
    }
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = timeout;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_cleanup_window(mut self, window: Duration) -> Self {
        self.cleanup_window = window;
        self
    }

    pub fn with_metadata_collection(mut self, collection: MetadataCollection) -> Self {
        self.metadata_collection = Some(collection);
        self
    }

    pub fn with_scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = consistency;
        self
    }

    pub fn with_cleanup_lost_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_lost_attempts = enabled;
        self
    }

    pub fn with_cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_client_attempts = enabled;
        self
    }

    pub fn with_num_atrs(mut self, num_atrs: usize) -> Self {
        self.num_atrs = num_atrs;
        self
    }

    /// Sets the retry backoff range.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    /// Checks the configuration for values no transaction could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiration.is_zero() {
            return Err(ConfigError::ZeroExpiration);
        }
        if self.kv_timeout.is_zero() {
            return Err(ConfigError::ZeroKvTimeout);
        }
        if self.num_atrs == 0 {
            return Err(ConfigError::ZeroAtrs);
        }
        if self.cleanup_window.is_zero() {
            return Err(ConfigError::ZeroCleanupWindow);
        }
        if self.backoff_min > self.backoff_max {
            return Err(ConfigError::BackoffRange {
                min: self.backoff_min,
                max: self.backoff_max,
            });
        }
        Ok(())
    }

    /// Applies per-transaction overrides.
    pub(crate) fn resolve(&self, per: &PerTransactionConfig) -> ResolvedConfig {
        ResolvedConfig {
            durability: per.durability.unwrap_or(self.durability),
            kv_timeout: per.kv_timeout.unwrap_or(self.kv_timeout),
            expiration: per.expiration.unwrap_or(self.expiration),
            scan_consistency: per.scan_consistency.unwrap_or(self.scan_consistency),
            metadata_collection: per
                .metadata_collection
                .clone()
                .or_else(|| self.metadata_collection.clone()),
            num_atrs: self.num_atrs,
        }
    }
}

/// Overrides for a single transaction.
#[derive(Debug, Clone, Default)]
pub struct PerTransactionConfig {
    pub durability: Option<DurabilityLevel>,
    pub kv_timeout: Option<Duration>,
    pub expiration: Option<Duration>,
    pub scan_consistency: Option<ScanConsistency>,
    pub metadata_collection: Option<MetadataCollection>,
}

impl PerTransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = Some(durability);
        self
    }

    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn with_metadata_collection(mut self, collection: MetadataCollection) -> Self {
        self.metadata_collection = Some(collection);
        self
    }
}

/// Effective settings for one transaction.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub durability: DurabilityLevel,
    pub kv_timeout: Duration,
    pub expiration: Duration,
    pub scan_consistency: ScanConsistency,
    pub metadata_collection: Option<MetadataCollection>,
    pub num_atrs: usize,
}

impl ResolvedConfig {
    /// Store options for a call allowed to run for at most `remaining`.
    pub fn store_options(&self, remaining: Duration) -> StoreOptions {
        StoreOptions::new(self.kv_timeout.min(remaining), self.durability)
    }
}
