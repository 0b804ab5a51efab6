//! Pluggable message transport.
//!
//! graphlock-rs does not implement networking itself. The host provides an implementation of
//! [`Transport`] over whatever reliable broadcast channel its collaboration session already has, and
//! graphlock-rs uses it to exchange [`Message`](crate::messages::Message)s with the other clients.

pub mod transport;

pub(crate) mod receiving;

pub(crate) mod sending;

pub use transport::{Destination, Transport};
