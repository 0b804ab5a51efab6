/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Leaderless, lease-based lock coordination for collaborative node-graph editing.
//!
//! Several clients edit one shared document. Before changing an element, a client asks for a lease
//! on it; the lease is granted if nobody else holds the element, and queued otherwise. Each client
//! keeps its own copy of the lock table and broadcasts every change it makes, so there is no
//! central arbiter. Leases expire on their own, which is the only protection against a client that
//! stops responding while holding one.
//!
//! Alongside locks, clients exchange structural operations (add, move, connect...) and transient
//! wire previews. Previews are produced at interactive rates and are throttled per user.
//!
//! ## Modules
//!
//! - [`session`]: build and start a [`Session`](session::Session), the entry point for hosts.
//! - [`replication`]: the state machine that ties the lock table, the throttler, and the transport.
//! - [`locks`]: the lock table and its pending queues.
//! - [`throttle`]: per-user, per-kind rate limiting of outbound messages.
//! - [`messages`]: the wire envelope, payloads, their codec, and their validation rules.
//! - [`networking`]: the [`Transport`](networking::Transport) trait the host implements.
//! - [`events`] and [`logging`]: what observers are told, and how it is logged.
//! - [`metrics`]: traffic counters and latency.
//! - [`clock`]: the pluggable time source.

pub mod clock;

pub mod event_bus;

pub mod events;

pub mod locks;

pub mod logging;

pub mod messages;

pub mod metrics;

pub mod networking;

pub mod replication;

pub mod session;

pub mod throttle;

pub mod types;
