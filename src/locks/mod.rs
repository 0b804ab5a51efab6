//! Lease-based mutual exclusion over the elements of a shared document.
//!
//! # Protocol
//!
//! Every client runs a [`LockCoordinator`] holding its own view of "who owns what, right now". There
//! is no leader and no quorum: a client grants itself a lock as soon as its local view says the
//! element is free, then announces the grant to its peers, which apply it to their own views.
//!
//! ## Leases
//!
//! Every lock is a lease: it is granted for a fixed duration (30 seconds by default) and lapses on
//! its own unless its owner renews it. Leases are the only fault tolerance mechanism of the protocol.
//! A client that crashes or disconnects without releasing its locks stops renewing them, and every
//! other client reclaims them once their leases end.
//!
//! ## Contention
//!
//! A request for an element that another user holds is not an error. It joins the element's FIFO
//! [`PendingQueue`], and is granted when every request ahead of it has been served, either because
//! the owner released the element or because its lease ran out.
//!
//! ## Crossing requests
//!
//! Two users may request the same free element at nearly the same time, and each of their clients
//! grants the lock locally before hearing of the other. Every client that sees both grants keeps
//! the one with the earlier lease start (the smaller user id on a tie) and puts the other user at
//! the head of the queue, so all views agree once both announcements have arrived. Strict mutual
//! exclusion before then is not a goal of the protocol.
//!
//! A request queued behind an owner is announced as `Pending` rather than `Locked`, so that peers
//! never mistake it for a grant.
//!
//! ## Duplicates
//!
//! Lock messages may arrive more than once or late. Each view remembers the latest event every user
//! announced per element, and drops grants, requests and releases older than it.

pub mod coordinator;

pub mod pending;

pub use coordinator::{
    ChangeCause, LockCoordinator, LockOutcome, LockRequestError, LockStateChange, RemoteOutcome,
};

pub use pending::PendingQueue;
