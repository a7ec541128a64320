// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Wall-clock time for transaction records.
//!
//! Attempt records are stamped with uncertainty intervals rather than
//! points. A record written by one client is only treated as expired by
//! another client once the reader's current interval lies entirely after
//! `started + expiry`, which keeps cleanup from racing a live attempt on a
//! client whose clock runs slow.

mod hlc;
mod manual;
mod timestamp;
mod traits;

pub use hlc::HlcTimeService;
pub use manual::ManualTimeService;
pub use timestamp::Timestamp;
pub use traits::TimeService;
