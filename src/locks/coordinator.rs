/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The local replica of lock ownership.
//!
//! Main type: [`LockCoordinator`].

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    time::Duration,
};

use super::pending::PendingQueue;
use crate::types::{ElementId, LockRecord, LockState, PendingRequest, Timestamp, UserId};

/// Lease-based lock table for every element of one document, as seen by one client.
///
/// # Usage
///
/// The coordinator never reads a clock and never sends messages. Every method that depends on time
/// takes the current time as `now`, and every change of ownership is appended to an internal list
/// of [`LockStateChange`]s that the caller drains with [`take_changes`](Self::take_changes) after each
/// call, in order to notify observers and tell peers.
///
/// Methods come in three groups:
/// 1. **Local operations**: [`request_lock`](Self::request_lock),
///    [`release_lock`](Self::release_lock), and [`withdraw_request`](Self::withdraw_request).
/// 2. **Remote operations**: [`apply_remote_lock`](Self::apply_remote_lock),
///    [`apply_remote_request`](Self::apply_remote_request), and
///    [`apply_remote_release`](Self::apply_remote_release), which mirror the local operations for
///    events announced by peers.
/// 3. **Maintenance**: [`tick`](Self::tick), which must be called periodically, and the
///    administrative [`clear_all`](Self::clear_all), [`clear_for_user`](Self::clear_for_user), and
///    [`reset`](Self::reset).
///
/// # Expiry
///
/// A record whose lease ended before `now` is treated as absent by every query, even before
/// [`tick`](Self::tick) removes it. Removal by `tick` is an implicit release: observers are told the
/// element is unlocked and the head of its queue is promoted.
///
/// # Duplicate and reordered events
///
/// For every `(element, user)` pair the coordinator remembers the latest lock event that user
/// announced, timed by the user's own clock. A grant or queued request that starts before that
/// event is outdated and ignored, and so is a release that happened before it. A grant and a
/// release at the same instant are ordered release last. Marks are dropped by [`tick`](Self::tick)
/// once they are older than the longest lease seen and the user neither holds nor waits for the
/// element.
///
/// # Crossing grants
///
/// Two users can both be granted an element if each asks before hearing of the other. When an
/// announced grant meets a live local record of another owner, the grant with the earlier
/// `acquired_at` wins, ties going to the smaller [`UserId`]. The loser is moved to the head of the
/// queue, so every client ends up with the same owner and the loser is served next.
#[derive(Default)]
pub struct LockCoordinator {
    locks: HashMap<ElementId, LockRecord>,
    pending: HashMap<ElementId, PendingQueue>,
    marks: HashMap<(ElementId, UserId), RemoteMark>,
    longest_lease: Duration,
    changes: Vec<LockStateChange>,
}

/// The latest lock event a peer announced for one element.
#[derive(Clone, Copy, Debug)]
struct RemoteMark {
    at: Timestamp,
    released: bool,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `element` for `user` for `lease`.
    ///
    /// - If the element is not locked, `user` is granted a lease of `[now, now + lease]`.
    /// - If `user` already holds the element, the lease is renewed so that it ends no earlier than
    ///   `now + lease`.
    /// - Otherwise the request joins the element's queue (unless `user` is already in it) and is
    ///   granted later, when every request ahead of it has been served.
    ///
    /// An expired record is released first, which may promote a queued request ahead of this one.
    pub fn request_lock(
        &mut self,
        element: ElementId,
        user: &UserId,
        lease: Duration,
        now: Timestamp,
    ) -> Result<LockOutcome, LockRequestError> {
        if element.is_nil() {
            return Err(LockRequestError::NilElementId);
        }
        if user.is_empty() {
            return Err(LockRequestError::EmptyUserId);
        }
        if lease.is_zero() {
            return Err(LockRequestError::ZeroLease);
        }
        self.longest_lease = self.longest_lease.max(lease);

        if self.locks.get(&element).is_some_and(|record| record.is_expired(now)) {
            self.expire(element, now);
        }

        match self.locks.get_mut(&element) {
            Some(record) if record.owner == *user => {
                record.expires_at = record.expires_at.max(now + lease);
                let record = record.clone();
                self.push_change(record, ChangeCause::Renewed);
                Ok(LockOutcome::Granted)
            }
            Some(_) => {
                let queued = self.pending.entry(element).or_default().push(PendingRequest {
                    user: user.clone(),
                    requested_at: now,
                    lease,
                });
                if queued {
                    log::debug!("Queued request from {} for element {}", user, element);
                }
                Ok(LockOutcome::Queued)
            }
            None => {
                self.grant(
                    LockRecord::locked(element, user.clone(), now, lease),
                    ChangeCause::Granted,
                );
                Ok(LockOutcome::Granted)
            }
        }
    }

    /// Release `element` on behalf of `user`, then promote the oldest queued request.
    ///
    /// Returns `false` without changing anything if `user` is not the current owner.
    pub fn release_lock(&mut self, element: ElementId, user: &UserId, now: Timestamp) -> bool {
        match self.locks.get(&element) {
            Some(record) if record.owner == *user => {}
            _ => return false,
        }
        self.remove_and_promote(element, ChangeCause::Released, now);
        true
    }

    /// Remove the queued request of `user` for `element`. Returns whether there was one.
    pub fn withdraw_request(&mut self, element: ElementId, user: &UserId) -> bool {
        let Some(queue) = self.pending.get_mut(&element) else {
            return false;
        };
        let removed = queue.remove(user);
        if queue.is_empty() {
            self.pending.remove(&element);
        }
        removed
    }

    /// Release every lock whose lease ended before `now`, promoting queued requests. Returns the
    /// number of locks released.
    pub fn tick(&mut self, now: Timestamp) -> usize {
        let mut expired: Vec<ElementId> = self
            .locks
            .values()
            .filter(|record| record.is_expired(now))
            .map(|record| record.element)
            .collect();
        expired.sort();
        for element in &expired {
            self.expire(*element, now);
        }

        // Queues left without an owner, e.g. after a remote release that was never followed by a
        // promotion.
        let mut orphaned: Vec<ElementId> = self
            .pending
            .keys()
            .filter(|element| !self.locks.contains_key(*element))
            .copied()
            .collect();
        orphaned.sort();
        for element in orphaned {
            self.promote(element, now);
        }

        self.prune_marks(now);
        expired.len()
    }

    /// Apply a lock announced by a peer.
    ///
    /// - A record whose lease already ended at `now` is stale and ignored.
    /// - A record that starts before the owner's latest announced event is outdated and ignored.
    /// - If the element is not locked, the announced record is adopted as is.
    /// - If the element is locked by the announced owner, the local record is overwritten, unless
    ///   the announced record is an earlier copy of the same lease.
    /// - Otherwise the two grants crossed. The earlier one wins and its loser is moved to the head
    ///   of the element's queue.
    pub fn apply_remote_lock(
        &mut self,
        record: LockRecord,
        now: Timestamp,
    ) -> Result<RemoteOutcome, LockRequestError> {
        if record.element.is_nil() {
            return Err(LockRequestError::NilElementId);
        }
        if record.owner.is_empty() {
            return Err(LockRequestError::EmptyUserId);
        }
        if record.state != LockState::Locked || !(record.expires_at > record.acquired_at) {
            return Err(LockRequestError::InvalidRecord);
        }
        if record.is_expired(now) {
            return Ok(RemoteOutcome::Stale);
        }
        if self.is_outdated_claim(record.element, &record.owner, record.acquired_at) {
            return Ok(RemoteOutcome::Outdated);
        }
        self.mark(record.element, &record.owner, record.acquired_at, false);
        self.longest_lease = self.longest_lease.max(record.lease());

        if self
            .locks
            .get(&record.element)
            .is_some_and(|local| local.is_expired(now))
        {
            self.expire(record.element, now);
        }

        match self.locks.get_mut(&record.element) {
            None => {
                self.grant(record, ChangeCause::Granted);
                Ok(RemoteOutcome::Applied)
            }
            Some(local) if local.owner == record.owner => {
                if local.acquired_at == record.acquired_at && record.expires_at <= local.expires_at {
                    return Ok(RemoteOutcome::Unchanged);
                }
                *local = record.clone();
                self.push_change(record, ChangeCause::Renewed);
                Ok(RemoteOutcome::Applied)
            }
            Some(local) => {
                let local = local.clone();
                if (record.acquired_at, &record.owner) < (local.acquired_at, &local.owner) {
                    log::debug!(
                        "Lock of {} on {} supersedes the crossing lock of {}",
                        record.owner,
                        record.element,
                        local.owner
                    );
                    self.pending
                        .entry(local.element)
                        .or_default()
                        .push_front(PendingRequest {
                            lease: local.lease(),
                            user: local.owner,
                            requested_at: local.acquired_at,
                        });
                    self.grant(record, ChangeCause::Superseded);
                    Ok(RemoteOutcome::Displaced)
                } else {
                    let lease = record.lease();
                    let moved = self
                        .pending
                        .entry(record.element)
                        .or_default()
                        .push_front(PendingRequest {
                            user: record.owner,
                            requested_at: record.acquired_at,
                            lease,
                        });
                    if moved {
                        Ok(RemoteOutcome::Contested)
                    } else {
                        Ok(RemoteOutcome::Unchanged)
                    }
                }
            }
        }
    }

    /// Apply a request a peer queued behind the owner it knows of.
    ///
    /// The request joins the element's queue unless it is outdated, or its user already holds or
    /// waits for the element. If nobody holds the element here, the queue is served at once, as
    /// [`tick`](Self::tick) would.
    pub fn apply_remote_request(
        &mut self,
        element: ElementId,
        request: PendingRequest,
        now: Timestamp,
    ) -> Result<RemoteOutcome, LockRequestError> {
        if element.is_nil() {
            return Err(LockRequestError::NilElementId);
        }
        if request.user.is_empty() {
            return Err(LockRequestError::EmptyUserId);
        }
        if request.lease.is_zero() {
            return Err(LockRequestError::ZeroLease);
        }
        if self.is_outdated_claim(element, &request.user, request.requested_at) {
            return Ok(RemoteOutcome::Outdated);
        }
        self.mark(element, &request.user, request.requested_at, false);
        self.longest_lease = self.longest_lease.max(request.lease);

        if self.locks.get(&element).is_some_and(|record| record.is_expired(now)) {
            self.expire(element, now);
        }
        if self.lock_owner(element, now) == Some(&request.user) {
            return Ok(RemoteOutcome::Unchanged);
        }

        if !self.pending.entry(element).or_default().push(request) {
            return Ok(RemoteOutcome::Unchanged);
        }
        self.promote(element, now);
        Ok(RemoteOutcome::Queued)
    }

    /// Apply a release announced by `user` at `released_at`, by their clock.
    ///
    /// If `user` owns the element this behaves like [`release_lock`](Self::release_lock). If `user` is
    /// only queued for it, their request is withdrawn. A release older than the latest grant or
    /// request `user` announced for the element is ignored. Returns whether anything changed.
    pub fn apply_remote_release(
        &mut self,
        element: ElementId,
        user: &UserId,
        released_at: Timestamp,
        now: Timestamp,
    ) -> bool {
        if self.is_outdated_release(element, user, released_at) {
            log::debug!("Ignored outdated release of {} by {}", element, user);
            return false;
        }
        self.mark(element, user, released_at, true);
        self.release_lock(element, user, now) || self.withdraw_request(element, user)
    }

    /// Release every lock, promoting queued requests as [`release_lock`](Self::release_lock) would.
    /// Returns the number of locks released.
    pub fn clear_all(&mut self, now: Timestamp) -> usize {
        let mut elements: Vec<ElementId> = self.locks.keys().copied().collect();
        elements.sort();
        for element in &elements {
            self.remove_and_promote(*element, ChangeCause::Released, now);
        }
        elements.len()
    }

    /// Withdraw every queued request of `user`, then release every lock they hold, promoting queued
    /// requests of other users. Returns the number of locks released.
    pub fn clear_for_user(&mut self, user: &UserId, now: Timestamp) -> usize {
        let queued: Vec<ElementId> = self.pending.keys().copied().collect();
        for element in queued {
            self.withdraw_request(element, user);
        }

        let mut owned: Vec<ElementId> = self
            .locks
            .values()
            .filter(|record| record.owner == *user)
            .map(|record| record.element)
            .collect();
        owned.sort();
        for element in &owned {
            self.remove_and_promote(*element, ChangeCause::Released, now);
        }
        owned.len()
    }

    /// Drop every record and queue without promoting anyone. Observers are told each element is
    /// unlocked.
    pub fn reset(&mut self) {
        let mut records: Vec<LockRecord> = self.locks.drain().map(|(_, record)| record).collect();
        records.sort_by_key(|record| record.element);
        for record in records {
            self.push_change(record.unlocked(), ChangeCause::Reset);
        }
        self.pending.clear();
        self.marks.clear();
    }

    pub fn is_locked(&self, element: ElementId, now: Timestamp) -> bool {
        self.lock_record(element, now).is_some()
    }

    pub fn is_locked_by(&self, element: ElementId, user: &UserId, now: Timestamp) -> bool {
        self.lock_owner(element, now) == Some(user)
    }

    /// Whether `user` may edit `element`: it is either unlocked or locked by `user`.
    pub fn can_modify(&self, element: ElementId, user: &UserId, now: Timestamp) -> bool {
        match self.lock_owner(element, now) {
            Some(owner) => owner == user,
            None => true,
        }
    }

    pub fn lock_owner(&self, element: ElementId, now: Timestamp) -> Option<&UserId> {
        self.lock_record(element, now).map(|record| &record.owner)
    }

    /// Get the state of `element`. `Pending` means nobody holds the element but requests for it
    /// are still queued.
    pub fn lock_state(&self, element: ElementId, now: Timestamp) -> LockState {
        if self.is_locked(element, now) {
            LockState::Locked
        } else if self.pending.get(&element).is_some_and(|queue| !queue.is_empty()) {
            LockState::Pending
        } else {
            LockState::Unlocked
        }
    }

    /// Time left on the lease of `element`, or zero if it is not locked.
    pub fn time_remaining(&self, element: ElementId, now: Timestamp) -> Duration {
        self.lock_record(element, now)
            .map(|record| record.time_remaining(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Get the record of `element`, if it is locked.
    pub fn lock_record(&self, element: ElementId, now: Timestamp) -> Option<&LockRecord> {
        self.locks
            .get(&element)
            .filter(|record| !record.is_expired(now))
    }

    /// Get the records of every lock `user` holds, ordered by element.
    pub fn locks_held_by(&self, user: &UserId, now: Timestamp) -> Vec<LockRecord> {
        let mut held: Vec<LockRecord> = self
            .locks
            .values()
            .filter(|record| record.owner == *user && !record.is_expired(now))
            .cloned()
            .collect();
        held.sort_by_key(|record| record.element);
        held
    }

    /// Get the elements `user` holds with less than `margin` left on their lease.
    pub fn expiring_within(&self, user: &UserId, margin: Duration, now: Timestamp) -> Vec<ElementId> {
        self.locks_held_by(user, now)
            .into_iter()
            .filter(|record| record.time_remaining(now) < margin)
            .map(|record| record.element)
            .collect()
    }

    /// Get the requests queued for `element`, oldest first.
    pub fn pending_requests(&self, element: ElementId) -> Vec<PendingRequest> {
        self.pending
            .get(&element)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get the elements `user` is queued for, ordered by element.
    pub fn queued_elements(&self, user: &UserId) -> Vec<ElementId> {
        let mut elements: Vec<ElementId> = self
            .pending
            .iter()
            .filter(|(_, queue)| queue.contains(user))
            .map(|(element, _)| *element)
            .collect();
        elements.sort();
        elements
    }

    /// The zero-based position of `user` in the queue of `element`.
    pub fn queue_position(&self, element: ElementId, user: &UserId) -> Option<usize> {
        self.pending.get(&element).and_then(|queue| queue.position(user))
    }

    /// Number of elements currently locked.
    pub fn active_lock_count(&self, now: Timestamp) -> usize {
        self.locks
            .values()
            .filter(|record| !record.is_expired(now))
            .count()
    }

    /// Number of requests queued across every element.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(PendingQueue::len).sum()
    }

    /// Drain the changes of ownership made since the last call, in the order they happened.
    pub fn take_changes(&mut self) -> Vec<LockStateChange> {
        std::mem::take(&mut self.changes)
    }

    fn expire(&mut self, element: ElementId, now: Timestamp) {
        self.remove_and_promote(element, ChangeCause::Expired, now);
    }

    fn remove_and_promote(&mut self, element: ElementId, cause: ChangeCause, now: Timestamp) {
        if let Some(record) = self.locks.remove(&element) {
            self.push_change(record.unlocked(), cause);
        }
        self.promote(element, now);
    }

    /// Grant `element` to the oldest queued request, if it is not locked.
    fn promote(&mut self, element: ElementId, now: Timestamp) {
        if self.locks.contains_key(&element) {
            return;
        }
        let next = self.pending.get_mut(&element).and_then(PendingQueue::pop_front);
        match next {
            Some(request) => {
                log::debug!("Promoting {} for element {}", request.user, element);
                self.grant(
                    LockRecord::locked(element, request.user, now, request.lease),
                    ChangeCause::Promoted,
                );
            }
            None => {
                self.pending.remove(&element);
            }
        }
    }

    /// Whether a grant or request of `user` starting at `at` predates their latest announced event.
    fn is_outdated_claim(&self, element: ElementId, user: &UserId, at: Timestamp) -> bool {
        self.marks
            .get(&(element, user.clone()))
            .is_some_and(|mark| at < mark.at || (at == mark.at && mark.released))
    }

    fn is_outdated_release(&self, element: ElementId, user: &UserId, at: Timestamp) -> bool {
        self.marks
            .get(&(element, user.clone()))
            .is_some_and(|mark| at < mark.at)
    }

    fn mark(&mut self, element: ElementId, user: &UserId, at: Timestamp, released: bool) {
        let mark = self
            .marks
            .entry((element, user.clone()))
            .or_insert(RemoteMark { at, released });
        if at > mark.at || (at == mark.at && released) {
            *mark = RemoteMark { at, released };
        }
    }

    fn prune_marks(&mut self, now: Timestamp) {
        let longest_lease = self.longest_lease;
        let locks = &self.locks;
        let pending = &self.pending;
        self.marks.retain(|(element, user), mark| {
            now.saturating_duration_since(mark.at) <= longest_lease
                || locks.get(element).is_some_and(|record| record.owner == *user)
                || pending.get(element).is_some_and(|queue| queue.contains(user))
        });
    }

    fn grant(&mut self, record: LockRecord, cause: ChangeCause) {
        self.withdraw_request(record.element, &record.owner);
        self.locks.insert(record.element, record.clone());
        self.push_change(record, cause);
    }

    fn push_change(&mut self, record: LockRecord, cause: ChangeCause) {
        self.changes.push(LockStateChange {
            element: record.element,
            record,
            cause,
        });
    }
}

/// Result of a local lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The requester holds the element now.
    Granted,
    /// The element is held by another user. The requester will be notified through a
    /// [`LockStateChange`] with cause [`Promoted`](ChangeCause::Promoted) when it is granted.
    Queued,
}

/// Result of applying a lock announced by a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    Queued,
    /// The announced lock was already known.
    Unchanged,
    /// The announced lease had already ended.
    Stale,
    /// The announced lock or request started before its user's latest announced event.
    Outdated,
    /// The announced lock crossed a later grant to another user, which it replaced. That user now
    /// heads the queue.
    Displaced,
    /// The announced lock crossed an earlier grant to another user, which stays. The announced owner
    /// now heads the queue.
    Contested,
}

/// A change of ownership of one element.
#[derive(Clone, Debug, PartialEq)]
pub struct LockStateChange {
    pub element: ElementId,
    /// The record after the change. Its state is `Unlocked` if the element was released.
    pub record: LockRecord,
    pub cause: ChangeCause,
}

/// Why a [`LockStateChange`] happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeCause {
    Granted,
    Renewed,
    /// A queued request was granted after the previous owner released the element or its lease
    /// expired.
    Promoted,
    Released,
    Expired,
    Reset,
    /// A crossing grant to another user took precedence. The previous owner was queued first.
    Superseded,
}

impl Display for ChangeCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeCause::Granted => "Granted",
            ChangeCause::Renewed => "Renewed",
            ChangeCause::Promoted => "Promoted",
            ChangeCause::Released => "Released",
            ChangeCause::Expired => "Expired",
            ChangeCause::Reset => "Reset",
            ChangeCause::Superseded => "Superseded",
        };
        f.write_str(name)
    }
}

/// Reasons why a lock request or an announced lock was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockRequestError {
    NilElementId,
    EmptyUserId,
    ZeroLease,
    /// An announced record that is not `Locked`, or whose lease does not end after it starts.
    InvalidRecord,
}

impl Display for LockRequestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LockRequestError::NilElementId => f.write_str("nil element id"),
            LockRequestError::EmptyUserId => f.write_str("empty user id"),
            LockRequestError::ZeroLease => f.write_str("zero lease duration"),
            LockRequestError::InvalidRecord => f.write_str("invalid lock record"),
        }
    }
}

impl std::error::Error for LockRequestError {}

#[cfg(test)]
const LEASE: Duration = Duration::from_secs(30);

#[cfg(test)]
fn at(secs: f64) -> Timestamp {
    Timestamp::from_secs(secs)
}

#[test]
fn release_promotes_queued_request_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

    assert_eq!(
        locks.request_lock(n1, &alice, LEASE, at(0.0)),
        Ok(LockOutcome::Granted)
    );
    assert_eq!(
        locks.request_lock(n1, &bob, LEASE, at(1.0)),
        Ok(LockOutcome::Queued)
    );
    assert_eq!(locks.lock_owner(n1, at(1.0)), Some(&alice));
    assert!(!locks.can_modify(n1, &bob, at(1.0)));

    assert!(locks.release_lock(n1, &alice, at(2.0)));
    assert_eq!(locks.lock_owner(n1, at(2.0)), Some(&bob));
    assert_eq!(locks.time_remaining(n1, at(2.0)), LEASE);

    let causes: Vec<(ChangeCause, LockState)> = locks
        .take_changes()
        .into_iter()
        .map(|change| (change.cause, change.record.state))
        .collect();
    assert_eq!(
        causes,
        vec![
            (ChangeCause::Granted, LockState::Locked),
            (ChangeCause::Released, LockState::Unlocked),
            (ChangeCause::Promoted, LockState::Locked),
        ]
    );
    assert!(locks.take_changes().is_empty());
}

#[test]
fn fifo_promotion_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let owner = UserId::from("owner");
    let users: Vec<UserId> = ["a", "b", "c"].into_iter().map(UserId::from).collect();

    locks.request_lock(n1, &owner, LEASE, at(0.0)).unwrap();
    for (i, user) in users.iter().enumerate() {
        assert_eq!(
            locks.request_lock(n1, user, LEASE, at(1.0 + i as f64)),
            Ok(LockOutcome::Queued)
        );
    }
    assert_eq!(locks.queue_position(n1, &users[2]), Some(2));
    assert_eq!(locks.pending_count(), 3);

    let mut holder = owner;
    for (i, user) in users.iter().enumerate() {
        assert!(locks.release_lock(n1, &holder, at(10.0 + i as f64)));
        assert_eq!(locks.lock_owner(n1, at(10.0 + i as f64)), Some(user));
        holder = user.clone();
    }
    assert_eq!(locks.pending_count(), 0);
}

#[test]
fn expiry_reclaims_and_promotes_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

    locks.request_lock(n1, &alice, LEASE, at(0.0)).unwrap();
    locks.request_lock(n1, &bob, LEASE, at(1.0)).unwrap();

    assert_eq!(locks.tick(at(30.0)), 0);
    assert_eq!(locks.lock_owner(n1, at(30.0)), Some(&alice));

    // Expired but not yet swept.
    assert_eq!(locks.lock_owner(n1, at(30.001)), None);
    assert_eq!(locks.lock_state(n1, at(30.001)), LockState::Pending);

    locks.take_changes();
    assert_eq!(locks.tick(at(30.001)), 1);
    assert_eq!(locks.lock_owner(n1, at(30.001)), Some(&bob));
    let causes: Vec<ChangeCause> = locks.take_changes().iter().map(|c| c.cause).collect();
    assert_eq!(causes, vec![ChangeCause::Expired, ChangeCause::Promoted]);
}

#[test]
fn request_on_expired_record_keeps_fifo_order_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let (alice, bob, carol) = (
        UserId::from("alice"),
        UserId::from("bob"),
        UserId::from("carol"),
    );

    locks.request_lock(n1, &alice, LEASE, at(0.0)).unwrap();
    locks.request_lock(n1, &bob, LEASE, at(1.0)).unwrap();
    assert_eq!(
        locks.request_lock(n1, &carol, LEASE, at(31.0)),
        Ok(LockOutcome::Queued)
    );
    assert_eq!(locks.lock_owner(n1, at(31.0)), Some(&bob));

    let n2 = ElementId::random();
    locks.request_lock(n2, &alice, LEASE, at(0.0)).unwrap();
    assert_eq!(
        locks.request_lock(n2, &carol, LEASE, at(31.0)),
        Ok(LockOutcome::Granted)
    );
}

#[test]
fn renewal_is_idempotent_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let alice = UserId::from("alice");

    locks.request_lock(n1, &alice, LEASE, at(0.0)).unwrap();
    assert_eq!(
        locks.request_lock(n1, &alice, LEASE, at(10.0)),
        Ok(LockOutcome::Granted)
    );
    assert_eq!(locks.lock_record(n1, at(10.0)).unwrap().expires_at, at(40.0));

    // A shorter renewal never shortens the lease.
    locks
        .request_lock(n1, &alice, Duration::from_secs(1), at(11.0))
        .unwrap();
    assert_eq!(locks.lock_record(n1, at(11.0)).unwrap().expires_at, at(40.0));
    assert!(locks.pending_requests(n1).is_empty());
}

#[test]
fn non_owner_release_does_not_mutate_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

    locks.request_lock(n1, &alice, LEASE, at(0.0)).unwrap();
    locks.take_changes();
    assert!(!locks.release_lock(n1, &bob, at(1.0)));
    assert!(!locks.release_lock(ElementId::random(), &alice, at(1.0)));
    assert_eq!(locks.lock_owner(n1, at(1.0)), Some(&alice));
    assert!(locks.take_changes().is_empty());
}

#[test]
fn invalid_requests_test() {
    let mut locks = LockCoordinator::new();
    let alice = UserId::from("alice");
    assert_eq!(
        locks.request_lock(ElementId::nil(), &alice, LEASE, at(0.0)),
        Err(LockRequestError::NilElementId)
    );
    assert_eq!(
        locks.request_lock(ElementId::random(), &UserId::from(""), LEASE, at(0.0)),
        Err(LockRequestError::EmptyUserId)
    );
    assert_eq!(
        locks.request_lock(ElementId::random(), &alice, Duration::ZERO, at(0.0)),
        Err(LockRequestError::ZeroLease)
    );
    assert_eq!(locks.active_lock_count(at(0.0)), 0);
}

#[test]
fn remote_events_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
    let alices = LockRecord::locked(n1, alice.clone(), at(0.0), LEASE);

    assert_eq!(
        locks.apply_remote_lock(alices.clone(), at(1.0)),
        Ok(RemoteOutcome::Applied)
    );
    assert_eq!(
        locks.apply_remote_lock(alices.clone(), at(1.0)),
        Ok(RemoteOutcome::Unchanged)
    );
    assert_eq!(locks.lock_record(n1, at(1.0)), Some(&alices));

    let bobs = LockRecord::locked(n1, bob.clone(), at(2.0), LEASE);
    assert_eq!(
        locks.apply_remote_lock(bobs.clone(), at(2.0)),
        Ok(RemoteOutcome::Contested)
    );
    assert_eq!(locks.lock_owner(n1, at(2.0)), Some(&alice));
    assert_eq!(locks.queue_position(n1, &bob), Some(0));

    // Bob gives up before being served.
    assert!(locks.apply_remote_release(n1, &bob, at(3.0), at(3.0)));
    assert_eq!(locks.queue_position(n1, &bob), None);

    let stale = LockRecord::locked(ElementId::random(), bob.clone(), at(0.0), LEASE);
    assert_eq!(
        locks.apply_remote_lock(stale, at(31.0)),
        Ok(RemoteOutcome::Stale)
    );

    let mut unlocked = bobs;
    unlocked.state = LockState::Unlocked;
    assert_eq!(
        locks.apply_remote_lock(unlocked, at(3.0)),
        Err(LockRequestError::InvalidRecord)
    );

    assert!(locks.apply_remote_release(n1, &alice, at(4.0), at(4.0)));
    assert!(!locks.is_locked(n1, at(4.0)));
    assert!(!locks.apply_remote_release(n1, &alice, at(4.0), at(4.0)));
}

#[test]
fn remote_requests_queue_behind_owner_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
    let request = |user: &UserId, secs: f64| PendingRequest {
        user: user.clone(),
        requested_at: at(secs),
        lease: LEASE,
    };

    locks.request_lock(n1, &alice, LEASE, at(0.0)).unwrap();
    assert_eq!(
        locks.apply_remote_request(n1, request(&bob, 1.0), at(1.0)),
        Ok(RemoteOutcome::Queued)
    );
    assert_eq!(
        locks.apply_remote_request(n1, request(&bob, 2.0), at(2.0)),
        Ok(RemoteOutcome::Unchanged)
    );
    assert_eq!(
        locks.apply_remote_request(n1, request(&alice, 2.0), at(2.0)),
        Ok(RemoteOutcome::Unchanged)
    );
    assert_eq!(locks.pending_count(), 1);
    assert_eq!(locks.lock_owner(n1, at(2.0)), Some(&alice));

    // Nobody holds n2 here, so the request is served at once.
    let n2 = ElementId::random();
    assert_eq!(
        locks.apply_remote_request(n2, request(&bob, 3.0), at(3.0)),
        Ok(RemoteOutcome::Queued)
    );
    assert_eq!(locks.lock_owner(n2, at(3.0)), Some(&bob));

    // A copy of Bob's first request, older than the second one.
    assert_eq!(
        locks.apply_remote_request(n1, request(&bob, 1.0), at(3.0)),
        Ok(RemoteOutcome::Outdated)
    );
    assert_eq!(
        locks.apply_remote_request(ElementId::nil(), request(&bob, 3.0), at(3.0)),
        Err(LockRequestError::NilElementId)
    );
}

#[test]
fn redelivered_events_are_ignored_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
    let first_grant = LockRecord::locked(n1, alice.clone(), at(0.0), LEASE);

    locks.apply_remote_lock(first_grant.clone(), at(0.0)).unwrap();
    locks.request_lock(n1, &bob, LEASE, at(1.0)).unwrap();
    assert!(locks.apply_remote_release(n1, &alice, at(2.0), at(2.0)));
    assert_eq!(locks.lock_owner(n1, at(2.0)), Some(&bob));

    // A copy of the first grant, still within its lease, arrives after the release.
    assert_eq!(
        locks.apply_remote_lock(first_grant.clone(), at(2.5)),
        Ok(RemoteOutcome::Outdated)
    );
    assert_eq!(locks.queue_position(n1, &alice), None);
    assert!(locks.release_lock(n1, &bob, at(3.0)));
    assert!(!locks.is_locked(n1, at(3.0)));

    // Alice locks again; a copy of Alice's old release must not undo it.
    let second_grant = LockRecord::locked(n1, alice.clone(), at(4.0), LEASE);
    assert_eq!(
        locks.apply_remote_lock(second_grant.clone(), at(4.0)),
        Ok(RemoteOutcome::Applied)
    );
    assert!(!locks.apply_remote_release(n1, &alice, at(2.0), at(5.0)));
    assert_eq!(locks.lock_record(n1, at(5.0)), Some(&second_grant));

    // An earlier copy of a renewed lease does not shorten it.
    let renewed = LockRecord::locked(n1, alice.clone(), at(4.0), Duration::from_secs(60));
    locks.apply_remote_lock(renewed.clone(), at(6.0)).unwrap();
    assert_eq!(
        locks.apply_remote_lock(second_grant, at(7.0)),
        Ok(RemoteOutcome::Unchanged)
    );
    assert_eq!(locks.lock_record(n1, at(7.0)), Some(&renewed));

    // A grant and a release at the same instant: the release wins whatever the arrival order.
    let n2 = ElementId::random();
    assert!(!locks.apply_remote_release(n2, &bob, at(8.0), at(8.0)));
    assert_eq!(
        locks.apply_remote_lock(LockRecord::locked(n2, bob.clone(), at(8.0), LEASE), at(8.0)),
        Ok(RemoteOutcome::Outdated)
    );
    assert!(!locks.is_locked(n2, at(8.0)));
}

#[test]
fn crossing_grants_resolve_to_earliest_test() {
    let (alice, bob, carol) = (
        UserId::from("alice"),
        UserId::from("bob"),
        UserId::from("carol"),
    );
    let n1 = ElementId::random();
    let alices = LockRecord::locked(n1, alice.clone(), at(0.0), LEASE);
    let bobs = LockRecord::locked(n1, bob.clone(), at(0.0), LEASE);

    // Bob's view: Bob was granted first, then hears of Alice's grant made at the same instant.
    let mut bob_view = LockCoordinator::new();
    bob_view.request_lock(n1, &bob, LEASE, at(0.0)).unwrap();
    bob_view.take_changes();
    assert_eq!(
        bob_view.apply_remote_lock(alices.clone(), at(0.1)),
        Ok(RemoteOutcome::Displaced)
    );
    assert_eq!(bob_view.lock_owner(n1, at(0.1)), Some(&alice));
    assert_eq!(bob_view.queue_position(n1, &bob), Some(0));
    let changes = bob_view.take_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].cause, ChangeCause::Superseded);
    assert_eq!(changes[0].record, alices);

    // Alice's view: Alice's grant stands and Bob goes to the head of the queue, ahead of Carol.
    let mut alice_view = LockCoordinator::new();
    alice_view.request_lock(n1, &alice, LEASE, at(0.0)).unwrap();
    alice_view.request_lock(n1, &carol, LEASE, at(0.05)).unwrap();
    assert_eq!(
        alice_view.apply_remote_lock(bobs.clone(), at(0.1)),
        Ok(RemoteOutcome::Contested)
    );
    assert_eq!(
        alice_view.apply_remote_lock(bobs, at(0.2)),
        Ok(RemoteOutcome::Unchanged)
    );
    assert_eq!(alice_view.lock_owner(n1, at(0.2)), Some(&alice));
    let queue: Vec<UserId> = alice_view
        .pending_requests(n1)
        .into_iter()
        .map(|request| request.user)
        .collect();
    assert_eq!(queue, vec![bob.clone(), carol]);

    // An earlier grant wins whatever the names.
    let mut view = LockCoordinator::new();
    view.request_lock(n1, &alice, LEASE, at(1.0)).unwrap();
    assert_eq!(
        view.apply_remote_lock(LockRecord::locked(n1, bob.clone(), at(0.5), LEASE), at(1.1)),
        Ok(RemoteOutcome::Displaced)
    );
    assert_eq!(view.lock_owner(n1, at(1.1)), Some(&bob));
}

#[test]
fn tick_prunes_old_marks_test() {
    let mut locks = LockCoordinator::new();
    let n1 = ElementId::random();
    let alice = UserId::from("alice");

    locks.apply_remote_lock(LockRecord::locked(n1, alice.clone(), at(0.0), LEASE), at(0.0)).unwrap();
    assert!(locks.apply_remote_release(n1, &alice, at(1.0), at(1.0)));
    locks.tick(at(20.0));
    assert_eq!(locks.marks.len(), 1);

    locks.tick(at(40.0));
    assert!(locks.marks.is_empty());
}

#[test]
fn bulk_release_test() {
    let mut locks = LockCoordinator::new();
    let (n1, n2, n3) = (ElementId::random(), ElementId::random(), ElementId::random());
    let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

    locks.request_lock(n1, &alice, LEASE, at(0.0)).unwrap();
    locks.request_lock(n2, &alice, LEASE, at(0.0)).unwrap();
    locks.request_lock(n3, &bob, LEASE, at(0.0)).unwrap();
    locks.request_lock(n1, &bob, LEASE, at(1.0)).unwrap();
    locks.request_lock(n3, &alice, LEASE, at(1.0)).unwrap();

    // Alice leaves: the queued request on n3 goes, and bob is promoted on n1.
    assert_eq!(locks.clear_for_user(&alice, at(2.0)), 2);
    assert_eq!(locks.lock_owner(n1, at(2.0)), Some(&bob));
    assert!(!locks.is_locked(n2, at(2.0)));
    assert_eq!(locks.queue_position(n3, &alice), None);
    assert!(locks.locks_held_by(&alice, at(2.0)).is_empty());
    assert_eq!(locks.locks_held_by(&bob, at(2.0)).len(), 2);

    locks.request_lock(n1, &alice, LEASE, at(3.0)).unwrap();
    assert_eq!(locks.clear_all(at(4.0)), 2);
    assert_eq!(locks.lock_owner(n1, at(4.0)), Some(&alice));
    assert!(!locks.is_locked(n3, at(4.0)));

    locks.request_lock(n1, &bob, LEASE, at(5.0)).unwrap();
    locks.take_changes();
    locks.reset();
    assert_eq!(locks.active_lock_count(at(5.0)), 0);
    assert_eq!(locks.pending_count(), 0);
    let changes = locks.take_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].cause, ChangeCause::Reset);
    assert_eq!(changes[0].record.state, LockState::Unlocked);
}

#[test]
fn expiring_within_test() {
    let mut locks = LockCoordinator::new();
    let (n1, n2) = (ElementId::random(), ElementId::random());
    let alice = UserId::from("alice");

    locks.request_lock(n1, &alice, LEASE, at(0.0)).unwrap();
    locks.request_lock(n2, &alice, LEASE, at(20.0)).unwrap();

    let margin = Duration::from_secs(5);
    assert_eq!(locks.expiring_within(&alice, margin, at(26.0)), vec![n1]);
    assert!(locks.expiring_within(&alice, margin, at(10.0)).is_empty());
}
