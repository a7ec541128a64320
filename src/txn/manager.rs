// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction orchestration: attempts, retries and expiry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::query::QueryEngine;
use crate::storage::DocumentStore;
use crate::time::{HlcTimeService, TimeService};

use super::attempt::{AttemptContext, AttemptEnv};
use super::cleanup::{self, Cleaner, CleanupTasks};
use super::config::{ConfigError, PerTransactionConfig, TransactionConfig};
use super::error::{BoxError, Disposition, TransactionError, TxnError};
use super::transaction::TransactionResult;

/// Runs transaction bodies against a document store.
///
/// Each call to [`run`](Self::run) is one transaction: the body is invoked
/// with a fresh [`AttemptContext`] until an attempt commits, fails for good
/// or the expiry budget runs out. Attempts of one transaction never overlap.
///
/// Dropping the `Transactions` stops its background cleanup tasks.
pub struct Transactions {
    env: AttemptEnv,
    config: TransactionConfig,
    cleaner: Arc<Cleaner>,
    _tasks: CleanupTasks,
}

/// Builder for [`Transactions`].
pub struct TransactionsBuilder {
    store: Arc<dyn DocumentStore>,
    config: TransactionConfig,
    query: Option<Arc<dyn QueryEngine>>,
    clock: Option<Arc<dyn TimeService>>,
}

impl TransactionsBuilder {
    pub fn config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables [`AttemptContext::query`].
    pub fn query_engine(mut self, engine: Arc<dyn QueryEngine>) -> Self {
        self.query = Some(engine);
        self
    }

    /// Clock used to stamp and expire ATR entries. Defaults to an HLC.
    pub fn time_service(mut self, clock: Arc<dyn TimeService>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the configuration and starts background cleanup.
    pub fn build(self) -> Result<Transactions, ConfigError> {
        self.config.validate()?;

        let clock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(HlcTimeService::default()) as Arc<dyn TimeService>,
        };
        let cleaner = Arc::new(Cleaner::new(
            Arc::clone(&self.store),
            Arc::clone(&clock),
            &self.config,
        ));
        let (queue, tasks) = cleanup::start(Arc::clone(&cleaner), &self.config);

        info!(
            expiration = ?self.config.expiration,
            durability = ?self.config.durability,
            num_atrs = self.config.num_atrs,
            "transactions initialized"
        );

        Ok(Transactions {
            env: AttemptEnv {
                store: self.store,
                query: self.query,
                clock,
                cleanup: queue,
            },
            config: self.config,
            cleaner,
            _tasks: tasks,
        })
    }
}

impl Transactions {
    /// Creates a `Transactions` with no query engine and the default clock.
    pub fn new(store: Arc<dyn DocumentStore>, config: TransactionConfig) -> Result<Self, ConfigError> {
        Self::builder(store).config(config).build()
    }

    pub fn builder(store: Arc<dyn DocumentStore>) -> TransactionsBuilder {
        TransactionsBuilder {
            store,
            config: TransactionConfig::default(),
            query: None,
            clock: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Cleanup for attempts this or other clients left unfinished.
    #[inline]
    pub fn cleaner(&self) -> &Arc<Cleaner> {
        &self.cleaner
    }

    /// Runs `body` as a transaction with the client-wide configuration.
    pub async fn run<F, Fut>(&self, body: F) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>> + Send,
    {
        self.run_with(&PerTransactionConfig::default(), body).await
    }

    /// Runs `body` as a transaction with per-transaction overrides.
    ///
    /// The body is called once per attempt. If it returns `Ok` the attempt
    /// is committed (unless the body already did). Errors raised by the
    /// attempt's own operations decide whether another attempt is made;
    /// any other error fails the transaction with that error as the cause.
    pub async fn run_with<F, Fut>(
        &self,
        per: &PerTransactionConfig,
        body: F,
    ) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>> + Send,
    {
        let config = self.config.resolve(per);
        let txn_id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + config.expiration;
        let mut backoff = Backoff::new(self.config.backoff_min, self.config.backoff_max);
        let mut attempts = 0u32;
        let mut last_error: Option<BoxError> = None;

        loop {
            if Instant::now() >= deadline {
                warn!(%txn_id, attempts, "transaction expired");
                return Err(TransactionError::Expired {
                    txn_id,
                    attempts,
                    cause: last_error.unwrap_or_else(|| "expiry budget used up".into()),
                });
            }

            attempts += 1;
            let ctx = AttemptContext::new(txn_id.clone(), config.clone(), deadline, self.env.clone());
            debug!(%txn_id, attempt_id = ctx.id(), attempt = attempts, "starting attempt");

            let outcome = match body(ctx.clone()).await {
                Ok(()) if ctx.state().is_committed() => Ok(()),
                Ok(()) => ctx.commit().await.map_err(BoxError::from),
                Err(e) => Err(e),
            };
            let err = match outcome {
                Ok(()) => {
                    return Ok(TransactionResult {
                        txn_id,
                        unstaging_complete: ctx.unstaging_complete(),
                        attempts,
                    })
                }
                Err(e) => e,
            };

            let disposition = classify(&ctx, &err);
            if disposition == Disposition::Ambiguous {
                error!(%txn_id, attempt_id = ctx.id(), error = %err, "transaction commit is ambiguous");
                return Err(TransactionError::CommitAmbiguous {
                    txn_id,
                    attempts,
                    cause: err,
                });
            }

            if ctx.state().is_active() {
                if let Err(e) = ctx.rollback().await {
                    warn!(%txn_id, attempt_id = ctx.id(), error = %e, "rollback after failed attempt did not finish");
                }
            }

            match disposition {
                Disposition::Retry => {
                    let delay = backoff.next_delay(deadline.saturating_duration_since(Instant::now()));
                    warn!(
                        %txn_id,
                        attempt_id = ctx.id(),
                        attempt = attempts,
                        error = %err,
                        ?delay,
                        "attempt failed, retrying"
                    );
                    last_error = Some(err);
                    tokio::time::sleep(delay).await;
                }
                Disposition::Expired => {
                    warn!(%txn_id, attempts, "transaction expired");
                    return Err(TransactionError::Expired {
                        txn_id,
                        attempts,
                        cause: err,
                    });
                }
                Disposition::Fail | Disposition::Ambiguous => {
                    debug!(%txn_id, attempts, error = %err, "transaction failed");
                    return Err(TransactionError::Failed {
                        txn_id,
                        attempts,
                        cause: err,
                    });
                }
            }
        }
    }

    /// Starts a single attempt to be driven by hand.
    ///
    /// The caller is responsible for calling [`AttemptContext::commit`] or
    /// [`AttemptContext::rollback`]; nothing is retried.
    pub fn begin(&self, per: &PerTransactionConfig) -> AttemptContext {
        let config = self.config.resolve(per);
        let deadline = Instant::now() + config.expiration;
        AttemptContext::new(Uuid::new_v4().to_string(), config, deadline, self.env.clone())
    }
}

/// Decides what a failed attempt means for the transaction.
///
/// Errors from the attempt's own operations carry their classification. A
/// body that replaced such an error with its own still poisoned the
/// attempt, so the recorded failure is used instead.
fn classify(ctx: &AttemptContext, err: &BoxError) -> Disposition {
    if let Some(txn_err) = err.downcast_ref::<TxnError>() {
        return txn_err.disposition();
    }
    match ctx.failure() {
        Some(failure) => TxnError::from(failure).disposition(),
        None => Disposition::Fail,
    }
}

/// Exponential backoff with jitter between attempts.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { current: min, max }
    }

    /// Returns the next delay, never longer than `remaining`.
    pub fn next_delay(&mut self, remaining: Duration) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let half = (base.as_micros() / 2).min(u64::MAX as u128) as u64;
        let jitter = rand::thread_rng().gen_range(0..=half);
        Duration::from_micros(half + jitter).min(remaining)
    }
}
