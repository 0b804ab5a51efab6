/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The trait that a message transport must implement to carry graphlock-rs traffic.

use crate::{messages::Message, types::UserId};

/// A handle to the message transport connecting the clients of one session.
///
/// # Contract
///
/// Implementations are expected to:
/// 1. Deliver messages of the same kind from the same sender in the order they were sent.
/// 2. Never block in [`broadcast`](Self::broadcast) or [`send`](Self::send).
///
/// They may deliver a message more than once, and may drop messages sent to or by a client that
/// disconnects. graphlock-rs tolerates both.
///
/// Clones of a `Transport` must share the same underlying connection: a session keeps one clone for
/// sending and hands another to its poller thread for receiving.
pub trait Transport: Clone + Send {
    /// Send a message to every other client in the session without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the client of `peer` without blocking.
    fn send(&mut self, peer: &UserId, message: Message);

    /// Receive a message from any client. Returns immediately with `None` if no message is available
    /// now.
    fn recv(&mut self) -> Option<Message>;
}

/// Where an outbound message goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Every other client in the session.
    Session,
    /// A single client.
    Peer(UserId),
}
