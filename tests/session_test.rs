//! Tests of running sessions that talk to each other through the mock transport from their own
//! background threads.

mod common;

use std::{
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use graphlock_rs::{
    clock::ManualClock,
    events::{LockStateChangedEvent, ReceiveWirePreviewEvent},
    locks::{ChangeCause, LockOutcome},
    messages::{MessageKind, Position},
    replication::SendOutcome,
    session::{Configuration, Session, SessionSpec},
    types::{DocumentId, ElementId, LockState, SubgraphId, Timestamp, UserId},
};
use log::LevelFilter;

use common::{
    logging::setup_logger,
    transport::{mock_transport, TransportStub},
    wait::wait_until,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_sessions(
    users: &[&str],
    clock: &ManualClock,
) -> (Vec<Session<TransportStub>>, Receiver<(UserId, ElementId, ChangeCause)>) {
    setup_logger(LevelFilter::Info);
    let document_id = DocumentId::random();
    let subgraph_id = SubgraphId::random();
    let (changes_sender, changes) = mpsc::channel();

    let sessions = users
        .iter()
        .zip(mock_transport(users.iter().map(|user| UserId::from(*user))))
        .map(|(user, transport)| {
            let configuration = Configuration::builder()
                .me(*user)
                .document_id(document_id)
                .subgraph_id(subgraph_id)
                .tick_interval(Duration::from_millis(10))
                .log_events(true)
                .build();
            let me = UserId::from(*user);
            let changes_sender = changes_sender.clone();
            SessionSpec::builder()
                .transport(transport)
                .configuration(configuration)
                .clock(clock.clone())
                .on_lock_state_changed(move |event: &LockStateChangedEvent| {
                    let _ = changes_sender.send((
                        me.clone(),
                        event.element,
                        event.cause,
                    ));
                })
                .build()
                .start()
        })
        .collect();

    (sessions, changes)
}

fn owners(sessions: &[Session<TransportStub>], element: ElementId) -> Vec<Option<UserId>> {
    sessions
        .iter()
        .map(|session| session.lock_owner(element))
        .collect()
}

#[test]
fn sessions_converge_on_lock_ownership_test() {
    let clock = ManualClock::new(Timestamp::from_secs(1000.0));
    let (sessions, changes) = start_sessions(&["alice", "bob", "carol"], &clock);
    let element = ElementId::random();
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");

    assert_eq!(sessions[0].request_lock(element), Ok(LockOutcome::Granted));
    wait_until("every session sees alice's lock", TIMEOUT, || {
        owners(&sessions, element) == vec![Some(alice.clone()); 3]
    });
    assert!(!sessions[1].can_modify(element));

    clock.advance(Duration::from_secs(1));
    assert_eq!(sessions[1].request_lock(element), Ok(LockOutcome::Queued));
    wait_until("every session queues bob", TIMEOUT, || {
        sessions
            .iter()
            .all(|session| session.queue_position(element, &bob) == Some(0))
    });

    clock.advance(Duration::from_secs(1));
    assert!(sessions[0].release_lock(element));
    wait_until("every session promotes bob", TIMEOUT, || {
        owners(&sessions, element) == vec![Some(bob.clone()); 3]
    });
    assert!(sessions[1].can_modify(element));

    wait_until("bob is told about the promotion", TIMEOUT, || {
        changes
            .try_iter()
            .any(|change| change == (bob.clone(), element, ChangeCause::Promoted))
    });

    let metrics = sessions[0].metrics();
    assert!(metrics.sent(MessageKind::LockRequest) >= 1);
    assert_eq!(metrics.sent(MessageKind::LockRelease), 1);
    // Carol holds nothing and never sent anything.
    assert_eq!(sessions[0].connected_users(), vec![bob]);
}

#[test]
fn ticker_expires_leases_test() {
    let clock = ManualClock::new(Timestamp::from_secs(1000.0));
    let (sessions, _changes) = start_sessions(&["alice", "bob"], &clock);
    let element = ElementId::random();
    let bob = UserId::from("bob");

    sessions[0]
        .request_lock_for(element, Duration::from_secs(10))
        .unwrap();
    wait_until("bob sees alice's lock", TIMEOUT, || {
        sessions[1].is_locked(element)
    });
    clock.advance(Duration::from_secs(1));
    sessions[1].request_lock(element).unwrap();
    wait_until("alice queues bob", TIMEOUT, || {
        sessions[0].queue_position(element, &bob) == Some(0)
    });

    // Nobody releases; the ticker reclaims the lease.
    clock.advance(Duration::from_secs(10));
    wait_until("the lease expires everywhere", TIMEOUT, || {
        owners(&sessions, element) == vec![Some(bob.clone()); 2]
    });
    assert_eq!(sessions[0].lock_state(element), LockState::Locked);
}

#[test]
fn dropping_a_session_releases_its_locks_test() {
    let clock = ManualClock::new(Timestamp::from_secs(1000.0));
    let (mut sessions, _changes) = start_sessions(&["alice", "bob"], &clock);
    let element = ElementId::random();

    sessions[1].request_lock(element).unwrap();
    wait_until("alice sees bob's lock", TIMEOUT, || {
        sessions[0].lock_owner(element) == Some(UserId::from("bob"))
    });

    drop(sessions.pop());
    wait_until("alice sees bob's release", TIMEOUT, || {
        !sessions[0].is_locked(element)
    });
    assert!(sessions[0].can_modify(element));
}

#[test]
fn previews_reach_subscribers_test() {
    let clock = ManualClock::new(Timestamp::from_secs(1000.0));
    let (sessions, _changes) = start_sessions(&["alice", "bob"], &clock);
    let element = ElementId::random();

    let (previews_sender, previews) = mpsc::channel();
    let subscription = sessions[1].subscribe(move |event: &ReceiveWirePreviewEvent| {
        let _ = previews_sender.send(event.preview.end);
    });

    let end = Position::new(64.0, 32.0);
    assert_eq!(
        sessions[0].send_wire_preview(element, "Then 0", Position::default(), end),
        Ok(SendOutcome::Sent)
    );
    assert_eq!(
        sessions[0].send_wire_preview(element, "Then 0", Position::default(), end),
        Ok(SendOutcome::Throttled)
    );
    assert_eq!(previews.recv_timeout(TIMEOUT), Ok(end));

    let stats = sessions[0].throttle_stats(MessageKind::WirePreview);
    assert_eq!((stats.sent, stats.suppressed), (1, 1));

    // With throttling off, every preview goes out.
    sessions[0].set_throttle_enabled(MessageKind::WirePreview, false);
    assert_eq!(
        sessions[0].send_wire_preview(element, "Then 0", Position::default(), end),
        Ok(SendOutcome::Sent)
    );
    assert_eq!(previews.recv_timeout(TIMEOUT), Ok(end));

    assert!(sessions[1].unsubscribe(subscription));
    assert!(!sessions[1].unsubscribe(subscription));
}
