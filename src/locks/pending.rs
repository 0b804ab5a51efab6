/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! FIFO queue of lock requests waiting for one element.

use std::collections::VecDeque;

use crate::types::{PendingRequest, UserId};

/// Requests waiting for an element, oldest first. A user appears at most once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PendingQueue {
    requests: VecDeque<PendingRequest>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `request` to the back of the queue, unless its user is already queued. Returns whether
    /// the request was appended.
    pub fn push(&mut self, request: PendingRequest) -> bool {
        if self.contains(&request.user) {
            return false;
        }
        self.requests.push_back(request);
        true
    }

    /// Put `request` at the front of the queue, moving its user there if they are already queued.
    /// Returns whether the queue changed.
    pub fn push_front(&mut self, request: PendingRequest) -> bool {
        if self.position(&request.user) == Some(0) {
            return false;
        }
        self.remove(&request.user);
        self.requests.push_front(request);
        true
    }

    /// Remove and return the oldest request.
    pub fn pop_front(&mut self) -> Option<PendingRequest> {
        self.requests.pop_front()
    }

    /// Remove the request of `user`. Returns whether there was one.
    pub fn remove(&mut self, user: &UserId) -> bool {
        match self.position(user) {
            Some(index) => {
                self.requests.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.position(user).is_some()
    }

    /// The zero-based position of `user` in the queue.
    pub fn position(&self, user: &UserId) -> Option<usize> {
        self.requests.iter().position(|request| request.user == *user)
    }

    pub fn front(&self) -> Option<&PendingRequest> {
        self.requests.front()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.requests.iter()
    }
}

#[test]
fn pending_queue_is_fifo_and_unique_test() {
    use crate::types::Timestamp;
    use std::time::Duration;

    let request = |user: &str, at: f64| PendingRequest {
        user: UserId::from(user),
        requested_at: Timestamp::from_secs(at),
        lease: Duration::from_secs(30),
    };

    let mut queue = PendingQueue::new();
    assert!(queue.push(request("bob", 1.0)));
    assert!(queue.push(request("carol", 2.0)));
    assert!(!queue.push(request("bob", 3.0)));
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.position(&UserId::from("carol")), Some(1));

    assert!(queue.remove(&UserId::from("bob")));
    assert!(!queue.remove(&UserId::from("bob")));
    assert_eq!(queue.pop_front().map(|r| r.user), Some(UserId::from("carol")));
    assert!(queue.is_empty());
}

#[test]
fn push_front_moves_user_to_head_test() {
    use crate::types::Timestamp;
    use std::time::Duration;

    let request = |user: &str| PendingRequest {
        user: UserId::from(user),
        requested_at: Timestamp::from_secs(1.0),
        lease: Duration::from_secs(30),
    };

    let mut queue = PendingQueue::new();
    queue.push(request("bob"));
    queue.push(request("carol"));
    assert!(queue.push_front(request("carol")));
    assert!(!queue.push_front(request("carol")));
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.position(&UserId::from("carol")), Some(0));
    assert_eq!(queue.position(&UserId::from("bob")), Some(1));
}
