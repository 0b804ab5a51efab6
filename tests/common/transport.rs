use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
};

use graphlock_rs::{messages::Message, networking::Transport, types::UserId};

/// A mock transport stub which passes messages from and to threads using channels.
#[derive(Clone)]
pub(crate) struct TransportStub {
    me: UserId,
    all_peers: HashMap<UserId, Sender<Message>>,
    inbox: Arc<Mutex<Receiver<Message>>>,
}

impl TransportStub {
    /// Discard every message waiting in the inbox. Returns how many were discarded.
    pub(crate) fn drain(&self) -> usize {
        self.inbox.lock().unwrap().try_iter().count()
    }
}

impl Transport for TransportStub {
    fn broadcast(&mut self, message: Message) {
        for (peer, sender) in &self.all_peers {
            if *peer != self.me {
                let _ = sender.send(message.clone());
            }
        }
    }

    fn send(&mut self, peer: &UserId, message: Message) {
        if let Some(sender) = self.all_peers.get(peer) {
            let _ = sender.send(message);
        }
    }

    fn recv(&mut self) -> Option<Message> {
        self.inbox.lock().unwrap().try_recv().ok()
    }
}

pub(crate) fn mock_transport(users: impl Iterator<Item = UserId>) -> Vec<TransportStub> {
    let mut all_peers = HashMap::new();
    let user_and_inboxes: Vec<(UserId, Receiver<Message>)> = users
        .map(|user| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(user.clone(), sender);

            (user, receiver)
        })
        .collect();

    user_and_inboxes
        .into_iter()
        .map(|(me, inbox)| TransportStub {
            me,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
