//! Functions for receiving messages from the [`Transport`].

use std::{
    sync::{
        mpsc::{Receiver, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use super::transport::Transport;
use crate::{
    clock::Clock,
    replication::{InboundError, Replicator},
};

/// Spawn the poller thread, which polls the [`Transport`] for messages and feeds each of them to the
/// [`Replicator`], under its mutex.
///
/// When the transport has nothing to deliver, the poller sleeps for `poll_interval` before polling
/// again.
pub(crate) fn start_polling<T: Transport + 'static>(
    mut transport: T,
    replicator: Arc<Mutex<Replicator<T>>>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match transport.recv() {
            Some(message) => {
                let mut replicator = replicator
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match replicator.handle_message(message, clock.now()) {
                    Ok(()) => (),
                    Err(InboundError::SelfEcho) | Err(InboundError::ForeignDocument(_)) => (),
                    Err(err) => log::debug!("Poller dropped inbound message: {}", err),
                }
            }
            None => thread::sleep(poll_interval),
        }
    })
}
