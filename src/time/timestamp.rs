// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Millisecond timestamp with a bounded uncertainty interval.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A wall-clock reading `[earliest, latest]` in milliseconds since the Unix epoch.
///
/// Transaction records are stamped with these intervals so that a cleanup
/// process on another client can decide whether an attempt has *definitely*
/// outlived its expiry, even when the two clients' clocks disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    earliest: u64,
    latest: u64,
}

impl Timestamp {
    /// Creates a new timestamp with the given bounds.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `earliest > latest`.
    #[inline]
    pub fn new(earliest: u64, latest: u64) -> Self {
        debug_assert!(earliest <= latest, "earliest must be <= latest");
        Self { earliest, latest }
    }

    /// Creates a timestamp from a single point with zero uncertainty.
    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self {
            earliest: millis,
            latest: millis,
        }
    }

    /// Creates a timestamp from a point with symmetric uncertainty.
    #[inline]
    pub fn with_uncertainty(point: u64, uncertainty_millis: u64) -> Self {
        Self {
            earliest: point.saturating_sub(uncertainty_millis),
            latest: point.saturating_add(uncertainty_millis),
        }
    }

    #[inline]
    pub fn earliest(&self) -> u64 {
        self.earliest
    }

    #[inline]
    pub fn latest(&self) -> u64 {
        self.latest
    }

    /// Shifts both bounds forward by `offset`.
    #[inline]
    pub fn shifted(&self, offset: Duration) -> Self {
        let millis = offset.as_millis().min(u64::MAX as u128) as u64;
        Self {
            earliest: self.earliest.saturating_add(millis),
            latest: self.latest.saturating_add(millis),
        }
    }

    /// Returns true if this interval lies entirely after `other`.
    #[inline]
    pub fn definitely_after(&self, other: &Timestamp) -> bool {
        self.earliest > other.latest
    }

    /// Returns true if this interval lies entirely before `other`.
    #[inline]
    pub fn definitely_before(&self, other: &Timestamp) -> bool {
        self.latest < other.earliest
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}ms, {}ms]", self.earliest, self.latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitely_after() {
        let t1 = Timestamp::new(300, 400);
        let t2 = Timestamp::new(100, 200);
        assert!(t1.definitely_after(&t2));
        assert!(!t2.definitely_after(&t1));
        assert!(t2.definitely_before(&t1));
    }

    #[test]
    fn test_overlapping_is_neither() {
        let t1 = Timestamp::new(100, 300);
        let t2 = Timestamp::new(200, 400);
        assert!(!t1.definitely_after(&t2));
        assert!(!t1.definitely_before(&t2));
    }

    #[test]
    fn test_shifted() {
        let ts = Timestamp::new(100, 120).shifted(Duration::from_secs(1));
        assert_eq!(ts.earliest(), 1100);
        assert_eq!(ts.latest(), 1120);
    }

    #[test]
    fn test_saturating_bounds() {
        let ts = Timestamp::with_uncertainty(10, 100);
        assert_eq!(ts.earliest(), 0);
        assert_eq!(ts.latest(), 110);
    }
}
