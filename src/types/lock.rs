/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Lease records and queued lock requests.

use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::data_types::{ElementId, Timestamp, UserId};

/// Lock state of an element, as seen by the local client.
///
/// Only `Unlocked` and `Locked` are ever stored. `Pending` is derived by
/// [`LockCoordinator::lock_state`](crate::locks::LockCoordinator::lock_state) when an element has no
/// active owner but still has queued requests, which happens between a lease ending and the next
/// sweep promoting the head of the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    Locked,
    Pending,
}

impl Display for LockState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unlocked => f.write_str("Unlocked"),
            LockState::Locked => f.write_str("Locked"),
            LockState::Pending => f.write_str("Pending"),
        }
    }
}

/// The current holder of one element, and the bounds of its lease.
///
/// # Invariants
///
/// 1. `expires_at > acquired_at`.
/// 2. A record is logically absent once `now > expires_at`. All queries treat such a record as
///    `Unlocked` even before the sweep removes it.
#[derive(Clone, Debug, PartialEq)]
pub struct LockRecord {
    pub element: ElementId,
    pub owner: UserId,
    pub state: LockState,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LockRecord {
    /// Create a `Locked` record for `owner` on `element` covering `[acquired_at, acquired_at + lease]`.
    pub fn locked(element: ElementId, owner: UserId, acquired_at: Timestamp, lease: Duration) -> Self {
        Self {
            element,
            owner,
            state: LockState::Locked,
            acquired_at,
            expires_at: acquired_at + lease,
        }
    }

    /// Whether the lease of this record ended before `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }

    /// Time left on the lease at `now`.
    pub fn time_remaining(&self, now: Timestamp) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// The length of the lease this record was granted with.
    pub fn lease(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.acquired_at)
    }

    /// Get a copy of this record with its state set to `Unlocked`, as reported to observers when the
    /// lock is released or expires.
    pub(crate) fn unlocked(&self) -> Self {
        Self {
            state: LockState::Unlocked,
            ..self.clone()
        }
    }
}

/// A request from a user other than the current owner, waiting in an element's
/// [`PendingQueue`](crate::locks::PendingQueue).
#[derive(Clone, Debug, PartialEq)]
pub struct PendingRequest {
    pub user: UserId,
    pub requested_at: Timestamp,
    pub lease: Duration,
}
