// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Hybrid Logical Clock (HLC) implementation.
//!
//! Combines physical time with a logical counter so that every stamp handed
//! out by one client is strictly greater than the previous one, even if the
//! system clock steps backwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{TimeService, Timestamp};

/// Hybrid Logical Clock time service with millisecond resolution.
pub struct HlcTimeService {
    last_timestamp: AtomicU64,
    max_drift: Duration,
}

impl HlcTimeService {
    /// Creates a new HLC with the given assumed maximum drift between clients.
    pub fn new(max_drift: Duration) -> Self {
        Self {
            last_timestamp: AtomicU64::new(0),
            max_drift,
        }
    }

    fn physical_time_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for HlcTimeService {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl TimeService for HlcTimeService {
    fn now(&self) -> Timestamp {
        let uncertainty = self.max_drift.as_millis() as u64;

        loop {
            let physical = Self::physical_time_millis();
            let last = self.last_timestamp.load(Ordering::Acquire);
            let new_ts = physical.max(last.saturating_add(1));

            match self.last_timestamp.compare_exchange(
                last,
                new_ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Timestamp::with_uncertainty(new_ts, uncertainty),
                Err(_) => continue,
            }
        }
    }

    #[inline]
    fn uncertainty_bound(&self) -> Duration {
        self.max_drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hlc_strictly_increasing() {
        let hlc = HlcTimeService::new(Duration::from_millis(100));
        let mut last = hlc.now();

        for _ in 0..1000 {
            let current = hlc.now();
            assert!(current.earliest() > last.earliest());
            last = current;
        }
    }

    #[test]
    fn test_hlc_concurrent_monotonic() {
        use std::sync::Arc;
        use std::thread;

        let hlc = Arc::new(HlcTimeService::new(Duration::from_millis(100)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let hlc = Arc::clone(&hlc);
                thread::spawn(move || {
                    let mut last = hlc.now();
                    for _ in 0..1000 {
                        let current = hlc.now();
                        assert!(current.earliest() > last.earliest());
                        last = current;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }
    }

    #[test]
    fn test_hlc_uncertainty() {
        let hlc = HlcTimeService::new(Duration::from_millis(50));
        assert_eq!(hlc.uncertainty_bound(), Duration::from_millis(50));
        let ts = hlc.now();
        assert_eq!(ts.latest() - ts.earliest(), 100);
    }
}
