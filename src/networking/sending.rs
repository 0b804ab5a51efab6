//! Functions and types for sending messages through the [`Transport`].

use super::transport::{Destination, Transport};
use crate::{messages::Message, types::UserId};

/// Handle for sending and broadcasting [`Message`]s through the [`Transport`].
#[derive(Clone)]
pub(crate) struct SenderHandle<T: Transport> {
    transport: T,
}

impl<T: Transport> SenderHandle<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self { transport }
    }

    pub(crate) fn send(&mut self, peer: &UserId, message: Message) {
        self.transport.send(peer, message)
    }

    pub(crate) fn broadcast(&mut self, message: Message) {
        self.transport.broadcast(message)
    }

    pub(crate) fn deliver(&mut self, destination: &Destination, message: Message) {
        match destination {
            Destination::Session => self.broadcast(message),
            Destination::Peer(peer) => self.send(peer, message),
        }
    }
}
