// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Manually driven clock for tests and simulations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{TimeService, Timestamp};

/// A clock that only moves when told to.
///
/// Lets cleanup behaviour that depends on wall-clock expiry be exercised
/// without sleeping.
#[derive(Debug, Default)]
pub struct ManualTimeService {
    now_millis: AtomicU64,
}

impl ManualTimeService {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now_millis: AtomicU64::new(start_millis),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now_millis
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }
}

impl TimeService for ManualTimeService {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now_millis.load(Ordering::Acquire))
    }

    fn uncertainty_bound(&self) -> Duration {
        Duration::ZERO
    }
}
