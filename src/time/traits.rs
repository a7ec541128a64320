// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! TimeService trait definition.

use std::time::Duration;

use super::Timestamp;

/// Source of wall-clock timestamps for transaction records.
pub trait TimeService: Send + Sync {
    /// Returns the current time with uncertainty bounds.
    fn now(&self) -> Timestamp;

    /// Returns the maximum assumed error between this clock and other clients.
    fn uncertainty_bound(&self) -> Duration;
}
