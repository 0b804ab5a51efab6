/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The glue between the lock table, the throttler, and the transport.
//!
//! Main type: [`Replicator`].
//!
//! ## Outbound traffic
//!
//! Every outbound message is stamped with a timestamp that never decreases, even if the clock does.
//! Preview-class messages are offered to the [throttler](crate::throttle::MessageThrottler) first and
//! may be suppressed. A message whose payload cannot be built is logged, counted, and dropped; it
//! never blocks later traffic and never changes the lock table.
//!
//! ## Inbound traffic
//!
//! Inbound messages are processed in this order:
//! 1. Messages sent by the local user (echoed back by the transport) are discarded.
//! 2. The envelope is validated, and messages for another document are discarded.
//! 3. The payload is decoded and validated according to the message's kind.
//! 4. The sender is marked as seen, and observers are told a message was received.
//! 5. The message is dispatched: lock messages to the [`LockCoordinator`], structural operations and
//!    wire previews to observers.
//!
//! Applying a remote lock event never sends a message, with two exceptions that keep peers
//! converging: a promotion of the local user is announced to everyone, and a peer seen for the first
//! time is told about every lock the local user holds.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::{mpsc::Sender, Arc},
    time::{Duration, SystemTime},
};

use crate::{
    events::{
        DropMessageEvent, Event, LockStateChangedEvent, QueueLockRequestEvent,
        ReceiveMessageEvent, ReceiveNodeOperationEvent, ReceiveWirePreviewEvent,
        SendMessageEvent, ThrottleMessageEvent,
    },
    locks::{
        ChangeCause, LockCoordinator, LockOutcome, LockRequestError, LockStateChange,
        RemoteOutcome,
    },
    messages::{
        codec::{self, CodecError},
        validation::{self, ValidationError},
        LockPayload, Message, MessageKind, NodeOperation, Payload, Position, WirePreview,
    },
    metrics::MetricsRecorder,
    networking::{sending::SenderHandle, Destination, Transport},
    session::Configuration,
    throttle::{MessageThrottler, ThrottleStats},
    types::{
        DocumentId, ElementId, LockRecord, LockState, PendingRequest, SubgraphId, Timestamp,
        UserId,
    },
};

/// The replicated state of one client: its lock table, its throttler, and what it knows about its
/// peers. A session keeps its `Replicator` behind a single mutex shared by all of its threads.
pub struct Replicator<T: Transport> {
    me: UserId,
    document_id: DocumentId,
    subgraph_id: SubgraphId,
    default_lease: Duration,
    locks: LockCoordinator,
    throttler: MessageThrottler,
    peers: HashMap<UserId, Timestamp>,
    sender: SenderHandle<T>,
    metrics: Arc<MetricsRecorder>,
    event_publisher: Option<Sender<Event>>,
    last_timestamp: Timestamp,
}

impl<T: Transport> Replicator<T> {
    /// Create a replicator for `config`, sending through `transport`.
    ///
    /// Most hosts do not need this: [`SessionSpec::start`](crate::session::SessionSpec::start) creates
    /// one and drives it from background threads. Hosts that run their own event loop can instead
    /// feed it messages and ticks directly. Events are published into `event_publisher`, if given.
    pub fn new(
        config: &Configuration,
        transport: T,
        metrics: Arc<MetricsRecorder>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            me: config.me.clone(),
            document_id: config.document_id,
            subgraph_id: config.subgraph_id,
            default_lease: config.default_lease,
            locks: LockCoordinator::new(),
            throttler: MessageThrottler::new(config.throttle.clone()),
            peers: HashMap::new(),
            sender: SenderHandle::new(transport),
            metrics,
            event_publisher,
            last_timestamp: Timestamp::default(),
        }
    }

    /// The local user.
    pub fn me(&self) -> &UserId {
        &self.me
    }

    /// The lease used when a caller does not ask for a specific one.
    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    /// Request `element` for the local user for `lease`, and tell peers about the request.
    ///
    /// Peers are told in both outcomes: a grant is announced as `Locked`, and a queued request as
    /// `Pending` so that every client serves the same queue.
    pub fn request_lock(
        &mut self,
        element: ElementId,
        lease: Duration,
        now: Timestamp,
    ) -> Result<LockOutcome, LockRequestError> {
        let outcome = self.locks.request_lock(element, &self.me, lease, now)?;
        let announced = match outcome {
            LockOutcome::Granted => match self.locks.lock_record(element, now) {
                Some(record) => LockPayload::from_record(record),
                None => LockPayload::from_record(&LockRecord::locked(
                    element,
                    self.me.clone(),
                    now,
                    lease,
                )),
            },
            LockOutcome::Queued => {
                if let Some(owner) = self.locks.lock_owner(element, now) {
                    Event::publish(
                        &self.event_publisher,
                        Event::QueueLockRequest(QueueLockRequestEvent {
                            timestamp: SystemTime::now(),
                            element,
                            owner: owner.clone(),
                        }),
                    );
                }
                LockPayload::request(
                    element,
                    &PendingRequest {
                        user: self.me.clone(),
                        requested_at: now,
                        lease,
                    },
                )
            }
        };

        self.flush_changes(now);
        self.announce(&Destination::Session, announced, now);
        self.update_gauges(now);
        Ok(outcome)
    }

    /// Release `element` if the local user holds it, and tell peers. Returns `false` if the local
    /// user does not hold it.
    pub fn release_lock(&mut self, element: ElementId, now: Timestamp) -> bool {
        if !self.locks.release_lock(element, &self.me, now) {
            return false;
        }
        self.send_release(element, now);
        self.flush_changes(now);
        self.update_gauges(now);
        true
    }

    /// Withdraw the local user's queued request for `element`, and tell peers. Returns `false` if
    /// there was no such request.
    pub fn withdraw_request(&mut self, element: ElementId, now: Timestamp) -> bool {
        if !self.locks.withdraw_request(element, &self.me) {
            return false;
        }
        self.send_release(element, now);
        self.update_gauges(now);
        true
    }

    /// Expire lapsed leases and promote queued requests. Returns the number of leases that expired.
    pub fn tick(&mut self, now: Timestamp) -> usize {
        let expired = self.locks.tick(now);
        self.flush_changes(now);
        self.throttler.cleanup(now);
        self.update_gauges(now);
        expired
    }

    /// Renew, for `lease`, every lock the local user holds that has less than `margin` left. Returns
    /// the number of locks renewed.
    pub fn renew_expiring(&mut self, margin: Duration, lease: Duration, now: Timestamp) -> usize {
        let expiring = self.locks.expiring_within(&self.me, margin, now);
        for element in &expiring {
            if let Err(err) = self.request_lock(*element, lease, now) {
                log::warn!("Failed to renew lock on {}: {}", element, err);
            }
        }
        expiring.len()
    }

    /// Send a wire preview from the local user, unless the throttler suppresses it.
    pub fn send_wire_preview(
        &mut self,
        element: ElementId,
        pin_name: &str,
        start: Position,
        end: Position,
        now: Timestamp,
    ) -> Result<SendOutcome, SendError> {
        if element.is_nil() {
            return Err(SendError::Invalid(ValidationError::NilElementId));
        }
        if pin_name.is_empty() {
            return Err(SendError::Invalid(ValidationError::EmptyPinName));
        }

        let me = self.me.clone();
        let pin_name = pin_name.to_string();
        Ok(self.send(
            MessageKind::WirePreview,
            &Destination::Session,
            now,
            |timestamp| {
                codec::encode_wire_preview(&WirePreview {
                    element,
                    pin_name,
                    start,
                    end,
                    sender: me,
                    timestamp,
                })
            },
        ))
    }

    /// Send a structural operation from the local user.
    ///
    /// The operation's `sender` and `timestamp` are overwritten. It is refused if, in the local view,
    /// another user holds the element.
    pub fn send_node_operation(
        &mut self,
        mut operation: NodeOperation,
        now: Timestamp,
    ) -> Result<SendOutcome, SendError> {
        operation.sender = self.me.clone();
        validation::validate_node_operation(&operation).map_err(SendError::Invalid)?;
        if let Some(owner) = self.locks.lock_owner(operation.element, now) {
            if *owner != self.me {
                return Err(SendError::ElementLocked {
                    element: operation.element,
                    owner: owner.clone(),
                });
            }
        }

        Ok(self.send(
            MessageKind::NodeOperation,
            &Destination::Session,
            now,
            |timestamp| {
                operation.timestamp = timestamp;
                codec::encode_node_operation(&operation)
            },
        ))
    }

    /// Send a heartbeat, unless the throttler suppresses it.
    pub fn send_heartbeat(&mut self, now: Timestamp) -> SendOutcome {
        self.send(
            MessageKind::Heartbeat,
            &Destination::Session,
            now,
            |_| Ok(Vec::new()),
        )
    }

    /// Process a message received from the transport.
    ///
    /// Invalid messages are logged, counted, and dropped. Self-echoes and messages for another
    /// document are dropped silently. In every case the error is also returned to the caller.
    pub fn handle_message(&mut self, message: Message, now: Timestamp) -> Result<(), InboundError> {
        self.metrics
            .record_received(message.kind, message.payload.len());

        let kind = message.kind;
        let sender = message.sender.clone();
        let result = self.process_message(message, now);
        match &result {
            Ok(()) => (),
            Err(InboundError::SelfEcho) => {
                log::trace!("Discarded {} message echoed back by the transport", kind)
            }
            Err(InboundError::ForeignDocument(document)) => {
                log::debug!("Discarded {} message for document {}", kind, document)
            }
            Err(err) => {
                log::warn!("Dropped invalid {} message from {}: {}", kind, sender, err);
                self.metrics.record_dropped_invalid();
                Event::publish(
                    &self.event_publisher,
                    Event::DropMessage(DropMessageEvent {
                        timestamp: SystemTime::now(),
                        kind,
                        sender,
                        inbound: true,
                        reason: err.to_string(),
                    }),
                );
            }
        }
        self.update_gauges(now);
        result
    }

    /// Release every lock of `user` and withdraw their queued requests, for example after the host
    /// learns they left the session. Returns the number of locks released.
    pub fn disconnect_user(&mut self, user: &UserId, now: Timestamp) -> usize {
        let released = self.locks.clear_for_user(user, now);
        self.peers.remove(user);
        self.flush_changes(now);
        self.update_gauges(now);
        released
    }

    /// Release every lock, promoting queued requests. Releases of the local user's locks are sent to
    /// peers. Returns the number of locks released.
    pub fn clear_all(&mut self, now: Timestamp) -> usize {
        let mine = self.locks.locks_held_by(&self.me, now);
        let released = self.locks.clear_all(now);
        for record in mine {
            self.send_release(record.element, now);
        }
        self.flush_changes(now);
        self.update_gauges(now);
        released
    }

    /// Forget every lock and queue without promoting anyone and without telling peers.
    pub fn reset(&mut self, now: Timestamp) {
        self.locks.reset();
        self.flush_changes(now);
        self.update_gauges(now);
    }

    /// Release every lock the local user holds and withdraw every request it has queued, telling
    /// peers about each.
    pub fn leave(&mut self, now: Timestamp) {
        for record in self.locks.locks_held_by(&self.me, now) {
            self.release_lock(record.element, now);
        }
        for element in self.locks.queued_elements(&self.me) {
            self.withdraw_request(element, now);
        }
    }

    pub fn is_locked(&self, element: ElementId, now: Timestamp) -> bool {
        self.locks.is_locked(element, now)
    }

    pub fn is_locked_by(&self, element: ElementId, user: &UserId, now: Timestamp) -> bool {
        self.locks.is_locked_by(element, user, now)
    }

    pub fn can_modify(&self, element: ElementId, user: &UserId, now: Timestamp) -> bool {
        self.locks.can_modify(element, user, now)
    }

    pub fn lock_owner(&self, element: ElementId, now: Timestamp) -> Option<UserId> {
        self.locks.lock_owner(element, now).cloned()
    }

    pub fn lock_state(&self, element: ElementId, now: Timestamp) -> LockState {
        self.locks.lock_state(element, now)
    }

    pub fn lock_record(&self, element: ElementId, now: Timestamp) -> Option<LockRecord> {
        self.locks.lock_record(element, now).cloned()
    }

    pub fn time_remaining(&self, element: ElementId, now: Timestamp) -> Duration {
        self.locks.time_remaining(element, now)
    }

    pub fn locks_held_by(&self, user: &UserId, now: Timestamp) -> Vec<LockRecord> {
        self.locks.locks_held_by(user, now)
    }

    pub fn pending_requests(&self, element: ElementId) -> Vec<PendingRequest> {
        self.locks.pending_requests(element)
    }

    pub fn queue_position(&self, element: ElementId, user: &UserId) -> Option<usize> {
        self.locks.queue_position(element, user)
    }

    pub fn active_lock_count(&self, now: Timestamp) -> usize {
        self.locks.active_lock_count(now)
    }

    /// Remote users seen since the session started, ordered by id.
    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.peers.keys().cloned().collect();
        users.sort();
        users
    }

    /// When a message from `user` was last received.
    pub fn last_seen(&self, user: &UserId) -> Option<Timestamp> {
        self.peers.get(user).copied()
    }

    pub fn throttle_stats(&self, user: &UserId, kind: MessageKind) -> ThrottleStats {
        self.throttler.stats(user, kind)
    }

    pub fn throttler(&self) -> &MessageThrottler {
        &self.throttler
    }

    pub fn throttler_mut(&mut self) -> &mut MessageThrottler {
        &mut self.throttler
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    fn process_message(&mut self, message: Message, now: Timestamp) -> Result<(), InboundError> {
        if message.sender == self.me {
            return Err(InboundError::SelfEcho);
        }
        validation::validate_message(&message)?;
        if message.document_id != self.document_id {
            return Err(InboundError::ForeignDocument(message.document_id));
        }

        let payload = message.decode_payload()?;
        match &payload {
            Payload::WirePreview(preview) => validation::validate_wire_preview(preview)?,
            Payload::NodeOperation(operation) => validation::validate_node_operation(operation)?,
            Payload::Lock(lock) => validation::validate_lock_payload(lock, &message.sender)?,
            Payload::Heartbeat => (),
        }

        let first_contact = self.peers.insert(message.sender.clone(), now).is_none();
        self.metrics
            .record_latency(now.saturating_duration_since(message.timestamp));
        let kind = message.kind;
        let sender = message.sender.clone();
        let sent_at = message.timestamp;
        Event::publish(
            &self.event_publisher,
            Event::ReceiveMessage(ReceiveMessageEvent {
                timestamp: SystemTime::now(),
                message,
            }),
        );

        let result = self.dispatch(kind, &sender, sent_at, payload, now);
        self.flush_changes(now);

        if first_contact {
            self.announce_locks_to(&sender, now);
        }
        result
    }

    fn dispatch(
        &mut self,
        kind: MessageKind,
        sender: &UserId,
        sent_at: Timestamp,
        payload: Payload,
        now: Timestamp,
    ) -> Result<(), InboundError> {
        match payload {
            Payload::Lock(lock) => match (kind, lock.state) {
                (MessageKind::LockRequest, LockState::Locked) => {
                    let previous_owner = self.locks.lock_owner(lock.element, now).cloned();
                    let outcome = self.locks.apply_remote_lock(lock.to_record(), now)?;
                    self.resolve_crossing(&lock, outcome, previous_owner, now);
                }
                (MessageKind::LockRequest, LockState::Pending) => {
                    let outcome = self
                        .locks
                        .apply_remote_request(lock.element, lock.to_request(), now)?;
                    if outcome == RemoteOutcome::Outdated {
                        log::debug!("Ignored outdated request for {} from {}", lock.element, sender);
                    }
                }
                _ => {
                    // Releases from peers that leave the lease fields out are timed by the envelope.
                    let released_at = if lock.lease_start.secs() > 0.0 {
                        lock.lease_start
                    } else {
                        sent_at
                    };
                    self.locks
                        .apply_remote_release(lock.element, sender, released_at, now);
                }
            },
            Payload::NodeOperation(operation) => {
                let lock_conflict = !self.locks.can_modify(operation.element, sender, now);
                if lock_conflict {
                    log::debug!(
                        "{} sent a {} operation on {}, which it may not modify",
                        sender,
                        operation.operation,
                        operation.element
                    );
                }
                Event::publish(
                    &self.event_publisher,
                    Event::ReceiveNodeOperation(ReceiveNodeOperationEvent {
                        timestamp: SystemTime::now(),
                        operation,
                        lock_conflict,
                    }),
                );
            }
            Payload::WirePreview(preview) => Event::publish(
                &self.event_publisher,
                Event::ReceiveWirePreview(ReceiveWirePreviewEvent {
                    timestamp: SystemTime::now(),
                    preview,
                }),
            ),
            Payload::Heartbeat => (),
        }
        Ok(())
    }

    /// Follow up on a lock announced by a peer that met another owner here.
    ///
    /// If the local user's grant won, the announcer is told about it directly. If it lost, the host
    /// is told the local user now waits for the element.
    fn resolve_crossing(
        &mut self,
        lock: &LockPayload,
        outcome: RemoteOutcome,
        previous_owner: Option<UserId>,
        now: Timestamp,
    ) {
        match outcome {
            RemoteOutcome::Stale => log::debug!(
                "Ignored stale lock on {} from {}, lease ended at {}",
                lock.element,
                lock.owner,
                lock.lease_expiry
            ),
            RemoteOutcome::Outdated => log::debug!(
                "Ignored outdated lock on {} from {}",
                lock.element,
                lock.owner
            ),
            RemoteOutcome::Contested if previous_owner.as_ref() == Some(&self.me) => {
                if let Some(record) = self.locks.lock_record(lock.element, now) {
                    let payload = LockPayload::from_record(record);
                    self.announce(&Destination::Peer(lock.owner.clone()), payload, now);
                }
            }
            RemoteOutcome::Displaced if previous_owner.as_ref() == Some(&self.me) => {
                log::info!(
                    "Lock on {} went to {}, whose grant crossed ours",
                    lock.element,
                    lock.owner
                );
                Event::publish(
                    &self.event_publisher,
                    Event::QueueLockRequest(QueueLockRequestEvent {
                        timestamp: SystemTime::now(),
                        element: lock.element,
                        owner: lock.owner.clone(),
                    }),
                );
            }
            _ => (),
        }
    }

    /// Send a message of `kind` whose payload is built by `build` from the message's timestamp.
    fn send(
        &mut self,
        kind: MessageKind,
        destination: &Destination,
        now: Timestamp,
        build: impl FnOnce(Timestamp) -> Result<Vec<u8>, CodecError>,
    ) -> SendOutcome {
        if kind.is_throttleable() && self.throttler.should_throttle(kind, &self.me, now) {
            self.throttler.record_suppressed(kind, &self.me);
            self.metrics.record_throttled();
            log::trace!("Throttled {} message", kind);
            Event::publish(
                &self.event_publisher,
                Event::ThrottleMessage(ThrottleMessageEvent {
                    timestamp: SystemTime::now(),
                    kind,
                }),
            );
            return SendOutcome::Throttled;
        }

        let timestamp = self.stamp(now);
        let payload = match build(timestamp) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("Dropped outbound {} message: {}", kind, err);
                self.metrics.record_serialization_error();
                Event::publish(
                    &self.event_publisher,
                    Event::DropMessage(DropMessageEvent {
                        timestamp: SystemTime::now(),
                        kind,
                        sender: self.me.clone(),
                        inbound: false,
                        reason: err.to_string(),
                    }),
                );
                return SendOutcome::Dropped;
            }
        };

        let message = Message {
            kind,
            document_id: self.document_id,
            subgraph_id: self.subgraph_id,
            sender: self.me.clone(),
            timestamp,
            payload,
        };
        self.throttler.record_sent(kind, &self.me, now);
        self.metrics.record_sent(kind, message.payload.len());
        Event::publish(
            &self.event_publisher,
            Event::SendMessage(SendMessageEvent {
                timestamp: SystemTime::now(),
                destination: destination.clone(),
                message: message.clone(),
            }),
        );
        self.sender.deliver(destination, message);
        SendOutcome::Sent
    }

    fn announce(&mut self, destination: &Destination, payload: LockPayload, now: Timestamp) {
        self.send(MessageKind::LockRequest, destination, now, |_| {
            codec::encode_lock_payload(&payload)
        });
    }

    fn send_release(&mut self, element: ElementId, now: Timestamp) {
        let payload = LockPayload::release(element, self.me.clone(), now);
        self.send(MessageKind::LockRelease, &Destination::Session, now, |_| {
            codec::encode_lock_payload(&payload)
        });
    }

    fn announce_locks_to(&mut self, peer: &UserId, now: Timestamp) {
        let destination = Destination::Peer(peer.clone());
        for record in self.locks.locks_held_by(&self.me, now) {
            self.announce(&destination, LockPayload::from_record(&record), now);
        }
    }

    /// Publish the lock table's changes, and announce promotions of the local user.
    fn flush_changes(&mut self, now: Timestamp) {
        for LockStateChange {
            element,
            record,
            cause,
        } in self.locks.take_changes()
        {
            if cause == ChangeCause::Promoted && record.owner == self.me {
                log::debug!("Promoted to owner of {}", element);
                self.announce(&Destination::Session, LockPayload::from_record(&record), now);
            }
            Event::publish(
                &self.event_publisher,
                Event::LockStateChanged(LockStateChangedEvent {
                    timestamp: SystemTime::now(),
                    element,
                    record,
                    cause,
                }),
            );
        }
    }

    fn update_gauges(&self, now: Timestamp) {
        self.metrics
            .set_lock_gauges(self.locks.active_lock_count(now), self.locks.pending_count());
        self.metrics.set_known_peers(self.peers.len());
    }

    fn stamp(&mut self, now: Timestamp) -> Timestamp {
        self.last_timestamp = self.last_timestamp.max(now);
        self.last_timestamp
    }
}

/// What happened to an outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Suppressed by the throttler.
    Throttled,
    /// Dropped because its payload could not be built.
    Dropped,
}

/// Reasons why the local user may not send a message.
#[derive(Clone, Debug, PartialEq)]
pub enum SendError {
    Invalid(ValidationError),
    ElementLocked { element: ElementId, owner: UserId },
}

impl Display for SendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Invalid(err) => write!(f, "invalid message: {}", err),
            SendError::ElementLocked { element, owner } => {
                write!(f, "element {} is locked by {}", element, owner)
            }
        }
    }
}

impl std::error::Error for SendError {}

/// Reasons why an inbound message was not applied.
#[derive(Debug)]
pub enum InboundError {
    /// The message was sent by the local user.
    SelfEcho,
    /// The message belongs to another document.
    ForeignDocument(DocumentId),
    Codec(CodecError),
    Validation(ValidationError),
    Lock(LockRequestError),
}

impl Display for InboundError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            InboundError::SelfEcho => f.write_str("message sent by the local user"),
            InboundError::ForeignDocument(document) => {
                write!(f, "message for foreign document {}", document)
            }
            InboundError::Codec(err) => write!(f, "undecodable message: {}", err),
            InboundError::Validation(err) => write!(f, "invalid message: {}", err),
            InboundError::Lock(err) => write!(f, "invalid lock: {}", err),
        }
    }
}

impl std::error::Error for InboundError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InboundError::Codec(err) => Some(err),
            InboundError::Validation(err) => Some(err),
            InboundError::Lock(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for InboundError {
    fn from(value: CodecError) -> Self {
        InboundError::Codec(value)
    }
}

impl From<ValidationError> for InboundError {
    fn from(value: ValidationError) -> Self {
        InboundError::Validation(value)
    }
}

impl From<LockRequestError> for InboundError {
    fn from(value: LockRequestError) -> Self {
        InboundError::Lock(value)
    }
}
