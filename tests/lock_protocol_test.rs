//! Deterministic tests of the lock protocol between several replicators.
//!
//! Each test drives [`Replicator`]s directly, with explicit timestamps, and delivers messages between
//! them by pumping the mock transport until every inbox is empty.

mod common;

use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    time::Duration,
};

use graphlock_rs::{
    events::Event,
    locks::{ChangeCause, LockOutcome},
    messages::{
        codec, validation::ValidationError, LockPayload, Message, MessageKind, NodeOperation,
        NodeOperationKind, Position,
    },
    metrics::MetricsRecorder,
    networking::Transport,
    replication::{InboundError, Replicator, SendError, SendOutcome},
    session::Configuration,
    types::{DocumentId, ElementId, LockRecord, LockState, SubgraphId, Timestamp, UserId},
};
use log::LevelFilter;

use common::{
    logging::setup_logger,
    transport::{mock_transport, TransportStub},
};

const LEASE: Duration = Duration::from_secs(30);

// Timestamps must be positive to be valid on the wire.
fn at(secs: f64) -> Timestamp {
    Timestamp::from_secs(1000.0 + secs)
}

struct Client {
    replicator: Replicator<TransportStub>,
    transport: TransportStub,
    events: Receiver<Event>,
}

impl Client {
    fn events(&self) -> Vec<Event> {
        self.events.try_iter().collect()
    }
}

struct Cluster {
    document_id: DocumentId,
    subgraph_id: SubgraphId,
    clients: Vec<Client>,
}

impl Cluster {
    fn new(users: &[&str]) -> Cluster {
        setup_logger(LevelFilter::Debug);
        let document_id = DocumentId::random();
        let subgraph_id = SubgraphId::random();
        let transports = mock_transport(users.iter().map(|user| UserId::from(*user)));
        let clients = users
            .iter()
            .zip(transports)
            .map(|(user, transport)| {
                let configuration = Configuration::builder()
                    .me(*user)
                    .document_id(document_id)
                    .subgraph_id(subgraph_id)
                    .build();
                let (event_publisher, events) = mpsc::channel();
                Client {
                    replicator: Replicator::new(
                        &configuration,
                        transport.clone(),
                        Arc::new(MetricsRecorder::new()),
                        Some(event_publisher),
                    ),
                    transport,
                    events,
                }
            })
            .collect();

        Cluster {
            document_id,
            subgraph_id,
            clients,
        }
    }

    fn client(&mut self, index: usize) -> &mut Replicator<TransportStub> {
        &mut self.clients[index].replicator
    }

    // Deliver messages until every inbox is empty.
    fn pump(&mut self, now: Timestamp) {
        loop {
            let mut delivered = false;
            for client in &mut self.clients {
                while let Some(message) = client.transport.recv() {
                    delivered = true;
                    let _ = client.replicator.handle_message(message, now);
                }
            }
            if !delivered {
                return;
            }
        }
    }

    fn owners(&self, element: ElementId, now: Timestamp) -> Vec<Option<UserId>> {
        self.clients
            .iter()
            .map(|client| client.replicator.lock_owner(element, now))
            .collect()
    }

    fn message(&self, kind: MessageKind, sender: &str, payload: Vec<u8>, now: Timestamp) -> Message {
        Message {
            kind,
            document_id: self.document_id,
            subgraph_id: self.subgraph_id,
            sender: UserId::from(sender),
            timestamp: now,
            payload,
        }
    }
}

fn sent_messages(events: Vec<Event>) -> Vec<Message> {
    events
        .into_iter()
        .filter_map(|event| match event {
            Event::SendMessage(event) => Some(event.message),
            _ => None,
        })
        .collect()
}

fn changes(events: Vec<Event>) -> Vec<(ElementId, UserId, LockState, ChangeCause)> {
    events
        .into_iter()
        .filter_map(|event| match event {
            Event::LockStateChanged(event) => Some((
                event.element,
                event.record.owner,
                event.record.state,
                event.cause,
            )),
            _ => None,
        })
        .collect()
}

#[test]
fn release_promotes_queued_request_on_every_client_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");

    assert_eq!(
        cluster.client(0).request_lock(element, LEASE, at(0.0)),
        Ok(LockOutcome::Granted)
    );
    cluster.pump(at(0.0));
    assert_eq!(cluster.owners(element, at(0.0)), vec![Some(alice.clone()); 2]);

    assert_eq!(
        cluster.client(1).request_lock(element, LEASE, at(1.0)),
        Ok(LockOutcome::Queued)
    );
    cluster.pump(at(1.0));
    assert_eq!(cluster.client(0).queue_position(element, &bob), Some(0));
    assert_eq!(cluster.client(1).queue_position(element, &bob), Some(0));
    assert!(!cluster.client(1).can_modify(element, &bob, at(1.0)));

    assert!(cluster.client(0).release_lock(element, at(2.0)));
    cluster.pump(at(2.0));
    assert_eq!(cluster.owners(element, at(2.0)), vec![Some(bob.clone()); 2]);
    assert_eq!(
        cluster.client(0).lock_record(element, at(2.0)),
        cluster.client(1).lock_record(element, at(2.0))
    );
    assert!(cluster.client(1).can_modify(element, &bob, at(2.0)));
    assert!(!cluster.client(1).can_modify(element, &alice, at(2.0)));

    let bob_changes = changes(cluster.clients[1].events());
    assert!(bob_changes.contains(&(element, bob.clone(), LockState::Locked, ChangeCause::Promoted)));
}

#[test]
fn queued_request_is_queued_even_if_sent_twice_test() {
    let mut cluster = Cluster::new(&["alice", "bob", "carol"]);
    let element = ElementId::random();

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    cluster.client(1).request_lock(element, LEASE, at(1.0)).unwrap();
    cluster.pump(at(1.0));
    cluster.client(2).request_lock(element, LEASE, at(2.0)).unwrap();
    cluster.pump(at(2.0));
    assert_eq!(
        cluster.client(1).request_lock(element, LEASE, at(3.0)),
        Ok(LockOutcome::Queued)
    );
    cluster.pump(at(3.0));

    for client in 0..3 {
        let queue: Vec<UserId> = cluster
            .client(client)
            .pending_requests(element)
            .into_iter()
            .map(|request| request.user)
            .collect();
        assert_eq!(queue, vec![UserId::from("bob"), UserId::from("carol")]);
    }

    cluster.client(0).release_lock(element, at(4.0));
    cluster.pump(at(4.0));
    assert_eq!(cluster.owners(element, at(4.0)), vec![Some(UserId::from("bob")); 3]);
    cluster.client(1).release_lock(element, at(5.0));
    cluster.pump(at(5.0));
    assert_eq!(cluster.owners(element, at(5.0)), vec![Some(UserId::from("carol")); 3]);
}

#[test]
fn expired_lease_is_reclaimed_by_tick_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let bob = UserId::from("bob");

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    cluster.client(1).request_lock(element, LEASE, at(1.0)).unwrap();
    cluster.pump(at(1.0));

    // Exactly at expiry the lease still holds.
    assert_eq!(cluster.owners(element, at(30.0)), vec![Some(UserId::from("alice")); 2]);

    // Past expiry, before any sweep, the element reads as pending.
    let late = at(30.001);
    assert_eq!(cluster.client(0).lock_state(element, late), LockState::Pending);
    assert_eq!(cluster.client(0).lock_owner(element, late), None);

    assert_eq!(cluster.client(0).tick(late), 1);
    assert_eq!(cluster.client(1).tick(late), 1);
    cluster.pump(late);
    assert_eq!(cluster.owners(element, late), vec![Some(bob.clone()); 2]);
    assert!(cluster.client(1).time_remaining(element, late) > Duration::from_secs(29));

    let alice_changes = changes(cluster.clients[0].events());
    assert!(alice_changes.contains(&(
        element,
        UserId::from("alice"),
        LockState::Unlocked,
        ChangeCause::Expired
    )));
    assert!(alice_changes.contains(&(element, bob, LockState::Locked, ChangeCause::Promoted)));
}

#[test]
fn renewal_extends_lease_on_every_client_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let alice = UserId::from("alice");

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    assert_eq!(
        cluster.client(0).request_lock(element, LEASE, at(10.0)),
        Ok(LockOutcome::Granted)
    );
    cluster.pump(at(10.0));

    for client in 0..2 {
        let record = cluster.client(client).lock_record(element, at(10.0)).unwrap();
        assert_eq!(record.owner, alice);
        assert_eq!(record.expires_at, at(40.0));
    }
    assert_eq!(cluster.client(1).lock_owner(element, at(35.0)), Some(alice));
}

#[test]
fn renew_expiring_only_renews_leases_within_margin_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let short = ElementId::random();
    let long = ElementId::random();

    cluster.client(0).request_lock(short, LEASE, at(0.0)).unwrap();
    cluster
        .client(0)
        .request_lock(long, Duration::from_secs(60), at(0.0))
        .unwrap();
    cluster.pump(at(0.0));

    assert_eq!(
        cluster
            .client(0)
            .renew_expiring(Duration::from_secs(5), LEASE, at(26.0)),
        1
    );
    cluster.pump(at(26.0));

    assert_eq!(
        cluster.client(1).lock_record(short, at(26.0)).unwrap().expires_at,
        at(56.0)
    );
    assert_eq!(
        cluster.client(1).lock_record(long, at(26.0)).unwrap().expires_at,
        at(60.0)
    );
}

#[test]
fn release_by_non_owner_changes_nothing_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    let before = cluster.client(1).lock_record(element, at(1.0));

    assert!(!cluster.client(1).release_lock(element, at(1.0)));
    assert!(!cluster.client(1).withdraw_request(element, at(1.0)));
    cluster.pump(at(1.0));

    assert_eq!(cluster.client(1).lock_record(element, at(1.0)), before);
    assert_eq!(cluster.owners(element, at(1.0)), vec![Some(UserId::from("alice")); 2]);
}

#[test]
fn withdrawn_request_leaves_every_queue_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    cluster.client(1).request_lock(element, LEASE, at(1.0)).unwrap();
    cluster.pump(at(1.0));

    assert!(cluster.client(1).withdraw_request(element, at(2.0)));
    cluster.pump(at(2.0));
    assert!(cluster.client(0).pending_requests(element).is_empty());

    cluster.client(0).release_lock(element, at(3.0));
    cluster.pump(at(3.0));
    assert_eq!(cluster.owners(element, at(3.0)), vec![None, None]);
}

#[test]
fn wire_previews_are_throttled_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();

    // 20 previews within 50 ms.
    let outcomes: Vec<SendOutcome> = (0..20)
        .map(|i| {
            cluster
                .client(0)
                .send_wire_preview(
                    element,
                    "Exec",
                    Position::new(0.0, 0.0),
                    Position::new(i as f32, 10.0),
                    at(i as f64 * 0.0025),
                )
                .unwrap()
        })
        .collect();
    cluster.pump(at(0.05));

    assert_eq!(outcomes[0], SendOutcome::Sent);
    assert_eq!(
        outcomes.iter().filter(|outcome| **outcome == SendOutcome::Sent).count(),
        1
    );
    let stats = cluster
        .client(0)
        .throttle_stats(&UserId::from("alice"), MessageKind::WirePreview);
    assert_eq!((stats.sent, stats.suppressed), (1, 19));

    let previews = cluster.clients[1]
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::ReceiveWirePreview(_)))
        .count();
    assert_eq!(previews, 1);

    // Once the interval has passed, the next preview goes out.
    assert_eq!(
        cluster.client(0).send_wire_preview(
            element,
            "Exec",
            Position::default(),
            Position::default(),
            at(0.2)
        ),
        Ok(SendOutcome::Sent)
    );
}

#[test]
fn lock_messages_are_never_throttled_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let elements: Vec<ElementId> = (0..10).map(|_| ElementId::random()).collect();

    for element in &elements {
        cluster.client(0).request_lock(*element, LEASE, at(0.0)).unwrap();
        cluster.client(0).release_lock(*element, at(0.0));
    }

    let snapshot = cluster.client(0).metrics().snapshot();
    assert_eq!(snapshot.sent(MessageKind::LockRequest), 10);
    assert_eq!(snapshot.sent(MessageKind::LockRelease), 10);
    assert_eq!(snapshot.throttled, 0);

    // They still count in the throttle stats.
    let alice = UserId::from("alice");
    for kind in [MessageKind::LockRequest, MessageKind::LockRelease] {
        let stats = cluster.client(0).throttle_stats(&alice, kind);
        assert_eq!((stats.sent, stats.suppressed), (10, 0));
    }
}

#[test]
fn self_echo_and_foreign_documents_are_ignored_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let payload = codec::encode_lock_payload(&LockPayload::from_record(&LockRecord::locked(
        element,
        UserId::from("alice"),
        at(0.0),
        LEASE,
    )))
    .unwrap();

    let echo = cluster.message(MessageKind::LockRequest, "alice", payload.clone(), at(0.0));
    assert!(matches!(
        cluster.client(0).handle_message(echo, at(0.0)),
        Err(InboundError::SelfEcho)
    ));

    let mut foreign = cluster.message(MessageKind::LockRequest, "alice", payload, at(0.0));
    let other_document = DocumentId::random();
    foreign.document_id = other_document;
    assert!(matches!(
        cluster.client(1).handle_message(foreign, at(0.0)),
        Err(InboundError::ForeignDocument(document)) if document == other_document
    ));

    assert!(!cluster.client(0).is_locked(element, at(0.0)));
    assert!(!cluster.client(1).is_locked(element, at(0.0)));
    assert!(cluster.client(1).connected_users().is_empty());
    assert_eq!(cluster.client(1).metrics().snapshot().dropped_invalid, 0);
}

#[test]
fn lock_payload_must_be_owned_by_its_sender_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let payload = codec::encode_lock_payload(&LockPayload::from_record(&LockRecord::locked(
        element,
        UserId::from("mallory"),
        at(0.0),
        LEASE,
    )))
    .unwrap();
    let message = cluster.message(MessageKind::LockRequest, "bob", payload, at(0.0));

    assert!(matches!(
        cluster.client(0).handle_message(message, at(0.0)),
        Err(InboundError::Validation(ValidationError::OwnerMismatch { .. }))
    ));
    assert!(!cluster.client(0).is_locked(element, at(0.0)));
    assert_eq!(cluster.client(0).metrics().snapshot().dropped_invalid, 1);
    assert!(cluster.clients[0]
        .events()
        .iter()
        .any(|event| matches!(event, Event::DropMessage(dropped) if dropped.inbound)));
}

#[test]
fn undecodable_payload_is_dropped_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let message = cluster.message(MessageKind::WirePreview, "bob", vec![1, 2, 3], at(0.0));

    assert!(matches!(
        cluster.client(0).handle_message(message, at(0.0)),
        Err(InboundError::Codec(_))
    ));
    assert_eq!(cluster.client(0).metrics().snapshot().dropped_invalid, 1);
}

#[test]
fn stale_remote_lock_is_ignored_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let payload = codec::encode_lock_payload(&LockPayload::from_record(&LockRecord::locked(
        element,
        UserId::from("bob"),
        at(0.0),
        LEASE,
    )))
    .unwrap();
    let message = cluster.message(MessageKind::LockRequest, "bob", payload, at(0.0));

    assert!(cluster.client(0).handle_message(message, at(45.0)).is_ok());
    assert!(!cluster.client(0).is_locked(element, at(45.0)));
}

#[test]
fn node_operations_carry_lock_conflict_flag_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let bob = UserId::from("bob");

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));

    // Bob is refused locally.
    let mut operation = NodeOperation::new(NodeOperationKind::Move, element, bob.clone(), at(1.0));
    operation.position = Position::new(120.0, 40.0);
    assert_eq!(
        cluster.client(1).send_node_operation(operation.clone(), at(1.0)),
        Err(SendError::ElementLocked {
            element,
            owner: UserId::from("alice")
        })
    );

    // A misbehaving client sends anyway; Alice flags it.
    let payload = codec::encode_node_operation(&operation).unwrap();
    let message = cluster.message(MessageKind::NodeOperation, "bob", payload, at(1.0));
    cluster.clients[0].events();
    assert!(cluster.client(0).handle_message(message, at(1.0)).is_ok());
    let flags: Vec<bool> = cluster.clients[0]
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::ReceiveNodeOperation(event) => Some(event.lock_conflict),
            _ => None,
        })
        .collect();
    assert_eq!(flags, vec![true]);

    // Alice's own operations go through and reach Bob unflagged.
    assert_eq!(
        cluster.client(0).send_node_operation(
            NodeOperation::new(NodeOperationKind::Move, element, bob, at(2.0)),
            at(2.0)
        ),
        Ok(SendOutcome::Sent)
    );
    cluster.pump(at(2.0));
    let received: Vec<(UserId, bool)> = cluster.clients[1]
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::ReceiveNodeOperation(event) => {
                Some((event.operation.sender, event.lock_conflict))
            }
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![(UserId::from("alice"), false)]);
}

#[test]
fn invalid_node_operation_is_refused_test() {
    let mut cluster = Cluster::new(&["alice"]);
    let element = ElementId::random();
    let operation = NodeOperation::new(
        NodeOperationKind::Add,
        element,
        UserId::from("alice"),
        at(0.0),
    );

    assert_eq!(
        cluster.client(0).send_node_operation(operation, at(0.0)),
        Err(SendError::Invalid(ValidationError::MissingClassName))
    );
    assert_eq!(
        cluster.client(0).metrics().snapshot().sent(MessageKind::NodeOperation),
        0
    );
}

#[test]
fn late_joiner_learns_held_locks_test() {
    let mut cluster = Cluster::new(&["alice", "bob", "carol"]);
    let element = ElementId::random();

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.client(1).send_heartbeat(at(0.0));
    // Carol was not connected yet.
    cluster.clients[2].transport.drain();
    cluster.pump(at(0.0));
    assert!(!cluster.client(2).is_locked(element, at(1.0)));

    assert_eq!(cluster.client(2).send_heartbeat(at(1.0)), SendOutcome::Sent);
    cluster.pump(at(1.0));

    assert_eq!(cluster.client(2).lock_owner(element, at(1.0)), Some(UserId::from("alice")));
    // Bob holds nothing, so Carol has not heard from Bob.
    assert_eq!(cluster.client(2).connected_users(), vec![UserId::from("alice")]);
    assert_eq!(cluster.client(0).last_seen(&UserId::from("carol")), Some(at(1.0)));
}

#[test]
fn leave_releases_and_withdraws_test() {
    let mut cluster = Cluster::new(&["alice", "bob", "carol"]);
    let held = ElementId::random();
    let wanted = ElementId::random();

    cluster.client(0).request_lock(held, LEASE, at(0.0)).unwrap();
    cluster.client(1).request_lock(wanted, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    cluster.client(0).request_lock(wanted, LEASE, at(1.0)).unwrap();
    cluster.client(2).request_lock(held, LEASE, at(1.0)).unwrap();
    cluster.pump(at(1.0));

    cluster.client(0).leave(at(2.0));
    cluster.pump(at(2.0));

    assert_eq!(cluster.owners(held, at(2.0)), vec![Some(UserId::from("carol")); 3]);
    assert_eq!(cluster.client(1).queue_position(wanted, &UserId::from("alice")), None);
    assert_eq!(cluster.client(2).queue_position(wanted, &UserId::from("alice")), None);
}

#[test]
fn disconnect_user_releases_their_locks_locally_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let alice = UserId::from("alice");

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    assert_eq!(cluster.client(1).connected_users(), vec![alice.clone()]);

    assert_eq!(cluster.client(1).disconnect_user(&alice, at(1.0)), 1);
    assert!(!cluster.client(1).is_locked(element, at(1.0)));
    assert!(cluster.client(1).connected_users().is_empty());
    assert_eq!(cluster.client(1).active_lock_count(at(1.0)), 0);
}

#[test]
fn clear_all_and_reset_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let first = ElementId::random();
    let second = ElementId::random();

    cluster.client(0).request_lock(first, LEASE, at(0.0)).unwrap();
    cluster.client(0).request_lock(second, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    cluster.client(1).request_lock(first, LEASE, at(1.0)).unwrap();
    cluster.pump(at(1.0));

    // Clearing on Alice promotes Bob, and Bob hears about both releases.
    assert_eq!(cluster.client(0).clear_all(at(2.0)), 2);
    cluster.pump(at(2.0));
    assert_eq!(cluster.owners(first, at(2.0)), vec![Some(UserId::from("bob")); 2]);
    assert_eq!(cluster.owners(second, at(2.0)), vec![None, None]);

    // Resetting forgets everything locally and tells nobody.
    cluster.clients[1].events();
    cluster.client(1).reset(at(3.0));
    cluster.pump(at(3.0));
    assert!(!cluster.client(1).is_locked(first, at(3.0)));
    assert_eq!(cluster.client(0).lock_owner(first, at(3.0)), Some(UserId::from("bob")));
    assert_eq!(
        changes(cluster.clients[1].events()),
        vec![(first, UserId::from("bob"), LockState::Unlocked, ChangeCause::Reset)]
    );
}

#[test]
fn grant_redelivered_after_release_is_ignored_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let bob = UserId::from("bob");

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    let first_grant = sent_messages(cluster.clients[0].events())
        .into_iter()
        .find(|message| message.kind == MessageKind::LockRequest)
        .unwrap();
    cluster.client(1).request_lock(element, LEASE, at(1.0)).unwrap();
    cluster.pump(at(1.0));
    cluster.client(0).release_lock(element, at(2.0));
    cluster.pump(at(2.0));
    assert_eq!(cluster.owners(element, at(2.0)), vec![Some(bob.clone()); 2]);

    // Alice's first grant arrives again while its lease would still run.
    assert!(cluster.client(1).handle_message(first_grant, at(2.5)).is_ok());
    assert_eq!(cluster.client(1).queue_position(element, &UserId::from("alice")), None);

    cluster.client(1).release_lock(element, at(3.0));
    cluster.pump(at(3.0));
    assert_eq!(cluster.owners(element, at(3.0)), vec![None, None]);
}

#[test]
fn redelivered_lock_messages_change_nothing_test() {
    let mut cluster = Cluster::new(&["alice", "bob", "carol"]);
    let element = ElementId::random();

    cluster.client(0).request_lock(element, LEASE, at(0.0)).unwrap();
    cluster.pump(at(0.0));
    cluster.client(1).request_lock(element, LEASE, at(1.0)).unwrap();
    cluster.pump(at(1.0));
    cluster.client(0).release_lock(element, at(2.0));
    cluster.pump(at(2.0));
    cluster.client(1).release_lock(element, at(3.0));
    cluster.pump(at(3.0));
    cluster.client(0).request_lock(element, LEASE, at(4.0)).unwrap();
    cluster.pump(at(4.0));
    cluster.client(2).request_lock(element, LEASE, at(5.0)).unwrap();
    cluster.pump(at(5.0));

    let alice = UserId::from("alice");
    let carol = UserId::from("carol");
    assert_eq!(cluster.owners(element, at(5.0)), vec![Some(alice.clone()); 3]);
    let history: Vec<(usize, Message)> = (0..3)
        .flat_map(|sender| {
            sent_messages(cluster.clients[sender].events())
                .into_iter()
                .map(move |message| (sender, message))
        })
        .collect();
    assert!(history.len() >= 6);

    // Every message again, to every other client, after all of the above.
    for (sender, message) in history {
        for receiver in (0..3).filter(|receiver| *receiver != sender) {
            let _ = cluster.client(receiver).handle_message(message.clone(), at(6.0));
        }
    }
    cluster.pump(at(6.0));

    assert_eq!(cluster.owners(element, at(6.0)), vec![Some(alice.clone()); 3]);
    for client in 0..3 {
        let queue: Vec<UserId> = cluster
            .client(client)
            .pending_requests(element)
            .into_iter()
            .map(|request| request.user)
            .collect();
        assert_eq!(queue, vec![carol.clone()]);
        assert!(changes(cluster.clients[client].events()).is_empty());
    }
}

#[test]
fn crossing_grants_converge_test() {
    let mut cluster = Cluster::new(&["alice", "bob"]);
    let element = ElementId::random();
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");

    // Both ask before hearing of each other.
    assert_eq!(
        cluster.client(0).request_lock(element, LEASE, at(0.0)),
        Ok(LockOutcome::Granted)
    );
    assert_eq!(
        cluster.client(1).request_lock(element, LEASE, at(0.0)),
        Ok(LockOutcome::Granted)
    );
    cluster.pump(at(0.0));

    assert_eq!(cluster.owners(element, at(0.0)), vec![Some(alice.clone()); 2]);
    assert!(changes(cluster.clients[1].events()).contains(&(
        element,
        alice.clone(),
        LockState::Locked,
        ChangeCause::Superseded
    )));

    // Alice keeps renewing, and Bob's client must not go back to showing Bob as owner.
    for second in 1..=300 {
        let now = at(second as f64);
        for client in 0..2 {
            cluster.client(client).tick(now);
            cluster
                .client(client)
                .renew_expiring(Duration::from_secs(5), LEASE, now);
        }
        cluster.pump(now);
    }
    assert_eq!(cluster.owners(element, at(300.0)), vec![Some(alice.clone()); 2]);
    assert_eq!(cluster.client(0).queue_position(element, &bob), Some(0));
    assert_eq!(cluster.client(1).queue_position(element, &bob), Some(0));

    cluster.client(0).release_lock(element, at(301.0));
    cluster.pump(at(301.0));
    assert_eq!(cluster.owners(element, at(301.0)), vec![Some(bob); 2]);
}
