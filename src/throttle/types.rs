/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to the [throttler](super::MessageThrottler).

use std::{collections::HashMap, time::Duration};

use crate::{
    messages::MessageKind,
    types::{Timestamp, UserId},
};

/// Throttling intervals and history bounds.
#[derive(Clone, Debug, PartialEq)]
pub struct ThrottleConfiguration {
    /// Minimum time between two messages of the same kind from the same user. A zero (or missing)
    /// interval means the kind is never throttled.
    pub intervals: HashMap<MessageKind, Duration>,

    /// Whether throttling is switched on for each kind. A missing entry means off.
    pub enabled: HashMap<MessageKind, bool>,

    /// Maximum number of [`ThrottleRecord`]s kept in the history.
    pub max_history_records: usize,

    /// Maximum age of a [`ThrottleRecord`] kept in the history.
    pub max_history_age: Duration,
}

impl ThrottleConfiguration {
    pub fn interval(&self, kind: MessageKind) -> Duration {
        self.intervals.get(&kind).copied().unwrap_or(Duration::ZERO)
    }

    pub fn is_enabled(&self, kind: MessageKind) -> bool {
        self.enabled.get(&kind).copied().unwrap_or(false)
    }
}

impl Default for ThrottleConfiguration {
    fn default() -> Self {
        let mut intervals = HashMap::new();
        let mut enabled = HashMap::new();
        for kind in MessageKind::ALL {
            let interval = match kind {
                MessageKind::WirePreview => Duration::from_millis(100),
                MessageKind::Heartbeat => Duration::from_secs(1),
                _ => Duration::ZERO,
            };
            intervals.insert(kind, interval);
            enabled.insert(kind, kind.is_throttleable());
        }

        Self {
            intervals,
            enabled,
            max_history_records: 1000,
            max_history_age: Duration::from_secs(30),
        }
    }
}

/// A message of `kind` sent by `user` at `sent_at`.
#[derive(Clone, Debug, PartialEq)]
pub struct ThrottleRecord {
    pub user: UserId,
    pub kind: MessageKind,
    pub sent_at: Timestamp,
}

/// Counters for one `(user, kind)` pair.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThrottleStats {
    pub sent: u64,
    pub suppressed: u64,
    pub last_sent: Option<Timestamp>,
}
