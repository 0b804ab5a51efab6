/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! History-based implementation of the message throttler.
//!
//! Main type: [`MessageThrottler`].

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use super::types::{ThrottleConfiguration, ThrottleRecord, ThrottleStats};
use crate::{
    messages::MessageKind,
    types::{Timestamp, UserId},
};

/// Decides whether an outbound message may be sent now, and remembers what was sent.
///
/// # Usage
///
/// For every outbound message, the caller either:
/// 1. Calls [`should_throttle`](Self::should_throttle), and then [`record_sent`](Self::record_sent)
///    if the message went out or [`record_suppressed`](Self::record_suppressed) if it did not, or
/// 2. Calls [`admit`](Self::admit), which does both steps at once.
///
/// No method of the throttler ever fails.
pub struct MessageThrottler {
    config: ThrottleConfiguration,
    history: VecDeque<ThrottleRecord>,
    stats: HashMap<(UserId, MessageKind), ThrottleStats>,
}

impl MessageThrottler {
    pub fn new(config: ThrottleConfiguration) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            stats: HashMap::new(),
        }
    }

    /// Whether a message of `kind` from `user` at `now` should be suppressed.
    ///
    /// True only if throttling is enabled for `kind`, its interval is non-zero, and the last message
    /// of `kind` from `user` still in the history was sent less than one interval before `now`.
    pub fn should_throttle(&self, kind: MessageKind, user: &UserId, now: Timestamp) -> bool {
        let interval = self.config.interval(kind);
        if interval.is_zero() || !self.config.is_enabled(kind) {
            return false;
        }

        match self.last_sent(kind, user) {
            Some(last_sent) => now.saturating_duration_since(last_sent) < interval,
            None => false,
        }
    }

    /// Record that a message of `kind` from `user` went out at `now`, then compact the history.
    pub fn record_sent(&mut self, kind: MessageKind, user: &UserId, now: Timestamp) {
        self.history.push_back(ThrottleRecord {
            user: user.clone(),
            kind,
            sent_at: now,
        });

        let stats = self.stats.entry((user.clone(), kind)).or_default();
        stats.sent += 1;
        stats.last_sent = Some(now);

        self.cleanup(now);
    }

    /// Record that a message of `kind` from `user` was suppressed.
    pub fn record_suppressed(&mut self, kind: MessageKind, user: &UserId) {
        self.stats.entry((user.clone(), kind)).or_default().suppressed += 1;
    }

    /// Check whether a message may be sent, and record the outcome. Returns `true` if the message
    /// may be sent.
    pub fn admit(&mut self, kind: MessageKind, user: &UserId, now: Timestamp) -> bool {
        if self.should_throttle(kind, user, now) {
            self.record_suppressed(kind, user);
            false
        } else {
            self.record_sent(kind, user, now);
            true
        }
    }

    /// Drop records older than the configured age, then the oldest records beyond the configured
    /// count.
    pub fn cleanup(&mut self, now: Timestamp) {
        let max_age = self.config.max_history_age;
        while let Some(oldest) = self.history.front() {
            if now.saturating_duration_since(oldest.sent_at) > max_age {
                self.history.pop_front();
            } else {
                break;
            }
        }

        while self.history.len() > self.config.max_history_records {
            self.history.pop_front();
        }
    }

    pub fn set_interval(&mut self, kind: MessageKind, interval: Duration) {
        self.config.intervals.insert(kind, interval);
    }

    pub fn set_enabled(&mut self, kind: MessageKind, enabled: bool) {
        self.config.enabled.insert(kind, enabled);
    }

    pub fn interval(&self, kind: MessageKind) -> Duration {
        self.config.interval(kind)
    }

    pub fn is_enabled(&self, kind: MessageKind) -> bool {
        self.config.is_enabled(kind)
    }

    pub fn configuration(&self) -> &ThrottleConfiguration {
        &self.config
    }

    /// Get the counters for messages of `kind` from `user`. Pairs that never sent anything get zeroed
    /// counters.
    pub fn stats(&self, user: &UserId, kind: MessageKind) -> ThrottleStats {
        self.stats
            .get(&(user.clone(), kind))
            .cloned()
            .unwrap_or_default()
    }

    /// Iterate through the counters of every `(user, kind)` pair seen so far.
    pub fn all_stats(&self) -> impl Iterator<Item = (&UserId, MessageKind, &ThrottleStats)> {
        self.stats
            .iter()
            .map(|((user, kind), stats)| (user, *kind, stats))
    }

    /// Zero every counter. The history, and therefore throttling decisions, are unaffected.
    pub fn reset_stats(&mut self) {
        self.stats.clear();
    }

    /// Number of records currently in the history.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn last_sent(&self, kind: MessageKind, user: &UserId) -> Option<Timestamp> {
        self.history
            .iter()
            .rev()
            .find(|record| record.kind == kind && record.user == *user)
            .map(|record| record.sent_at)
    }
}

impl Default for MessageThrottler {
    fn default() -> Self {
        Self::new(ThrottleConfiguration::default())
    }
}

#[cfg(test)]
fn at(secs: f64) -> Timestamp {
    Timestamp::from_secs(secs)
}

#[test]
fn throttle_boundary_test() {
    let mut throttler = MessageThrottler::default();
    let alice = UserId::from("alice");
    throttler.set_interval(MessageKind::WirePreview, Duration::from_millis(500));

    assert!(!throttler.should_throttle(MessageKind::WirePreview, &alice, at(10.0)));
    throttler.record_sent(MessageKind::WirePreview, &alice, at(10.0));

    assert!(throttler.should_throttle(MessageKind::WirePreview, &alice, at(10.0)));
    assert!(throttler.should_throttle(MessageKind::WirePreview, &alice, at(10.25)));
    assert!(!throttler.should_throttle(MessageKind::WirePreview, &alice, at(10.5)));
    assert!(!throttler.should_throttle(MessageKind::WirePreview, &alice, at(11.0)));

    // Throttling is per user.
    let bob = UserId::from("bob");
    assert!(!throttler.should_throttle(MessageKind::WirePreview, &bob, at(10.25)));
}

#[test]
fn unthrottled_kinds_test() {
    let mut throttler = MessageThrottler::default();
    let alice = UserId::from("alice");
    for kind in [
        MessageKind::NodeOperation,
        MessageKind::LockRequest,
        MessageKind::LockRelease,
    ] {
        throttler.record_sent(kind, &alice, at(1.0));
        assert!(!throttler.should_throttle(kind, &alice, at(1.0)));
    }

    throttler.record_sent(MessageKind::Heartbeat, &alice, at(1.0));
    assert!(throttler.should_throttle(MessageKind::Heartbeat, &alice, at(1.5)));
    throttler.set_enabled(MessageKind::Heartbeat, false);
    assert!(!throttler.should_throttle(MessageKind::Heartbeat, &alice, at(1.5)));
    throttler.set_enabled(MessageKind::Heartbeat, true);
    throttler.set_interval(MessageKind::Heartbeat, Duration::ZERO);
    assert!(!throttler.should_throttle(MessageKind::Heartbeat, &alice, at(1.5)));
}

#[test]
fn admit_counts_sent_and_suppressed_test() {
    let mut throttler = MessageThrottler::default();
    let alice = UserId::from("alice");

    // 20 previews within 50 ms at 10 Hz.
    let mut admitted = 0;
    for i in 0..20 {
        if throttler.admit(MessageKind::WirePreview, &alice, at(100.0 + i as f64 * 0.0025)) {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);

    let stats = throttler.stats(&alice, MessageKind::WirePreview);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.suppressed, 19);
    assert_eq!(stats.last_sent, Some(at(100.0)));

    throttler.reset_stats();
    assert_eq!(
        throttler.stats(&alice, MessageKind::WirePreview),
        ThrottleStats::default()
    );
    assert!(throttler.should_throttle(MessageKind::WirePreview, &alice, at(100.05)));
}

#[test]
fn history_ceilings_test() {
    let config = ThrottleConfiguration {
        max_history_records: 5,
        max_history_age: Duration::from_secs(10),
        ..ThrottleConfiguration::default()
    };
    let mut throttler = MessageThrottler::new(config);
    let alice = UserId::from("alice");

    for i in 0..8 {
        throttler.record_sent(MessageKind::NodeOperation, &alice, at(i as f64));
    }
    assert_eq!(throttler.history_len(), 5);

    throttler.record_sent(MessageKind::NodeOperation, &alice, at(15.0));
    // Records sent at 3 and 4 are more than 10 s old.
    assert_eq!(throttler.history_len(), 4);

    throttler.cleanup(at(100.0));
    assert_eq!(throttler.history_len(), 0);
    assert_eq!(throttler.stats(&alice, MessageKind::NodeOperation).sent, 9);
}
