/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable time source.
//!
//! Every time-dependent decision in graphlock-rs (lease bounds, expiry, throttling, message
//! timestamps) reads "now" from a [`Clock`]. Sessions use the [`SystemClock`] unless told otherwise;
//! tests use a [`ManualClock`] to make those decisions deterministic.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use crate::types::Timestamp;

/// A source of [`Timestamp`]s.
pub trait Clock: Send + Sync {
    /// Read the current time.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time, in seconds since the Unix Epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|since_epoch| since_epoch.as_secs_f64())
            .unwrap_or(0.0);
        Timestamp::from_secs(secs)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    /// Create a `ManualClock` that reads `start` until it is advanced.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = *now + by;
    }

    /// Set the clock to `to`.
    pub fn set(&self, to: Timestamp) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[test]
fn manual_clock_clones_share_time_test() {
    let clock = ManualClock::new(Timestamp::from_secs(1.0));
    let other = clock.clone();
    clock.advance(Duration::from_millis(250));
    assert_eq!(other.now(), Timestamp::from_secs(1.25));
    other.set(Timestamp::from_secs(7.0));
    assert_eq!(clock.now(), Timestamp::from_secs(7.0));
}
