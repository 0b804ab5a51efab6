/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a session emits, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are published by
//! the [replicator](crate::replication::Replicator) into a channel and delivered to handlers by the
//! [event bus](crate::event_bus) thread, so handlers never run while the lock table is held.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    locks::ChangeCause,
    messages::{Message, MessageKind, NodeOperation, WirePreview},
    networking::Destination,
    types::{ElementId, LockRecord, UserId},
};

pub enum Event {
    // Events that change the lock table.
    LockStateChanged(LockStateChangedEvent),
    QueueLockRequest(QueueLockRequestEvent),
    // Events that involve sending a message.
    SendMessage(SendMessageEvent),
    ThrottleMessage(ThrottleMessageEvent),
    DropMessage(DropMessageEvent),
    // Events that involve receiving a message.
    ReceiveMessage(ReceiveMessageEvent),
    ReceiveNodeOperation(ReceiveNodeOperationEvent),
    ReceiveWirePreview(ReceiveWirePreviewEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only hangs up while the session shuts down.
            let _ = event_publisher.send(event);
        }
    }
}

/// An element was granted, renewed, released, or expired in the local view. `record` is the record
/// after the change; its state is `Unlocked` if the element was given up.
pub struct LockStateChangedEvent {
    pub timestamp: SystemTime,
    pub element: ElementId,
    pub record: LockRecord,
    pub cause: ChangeCause,
}

/// The local user asked for an element that another user holds, and joined its queue.
pub struct QueueLockRequestEvent {
    pub timestamp: SystemTime,
    pub element: ElementId,
    pub owner: UserId,
}

pub struct SendMessageEvent {
    pub timestamp: SystemTime,
    pub destination: Destination,
    pub message: Message,
}

/// An outbound message was suppressed by the throttler.
pub struct ThrottleMessageEvent {
    pub timestamp: SystemTime,
    pub kind: MessageKind,
}

/// A message was dropped, either because its payload could not be built (`inbound == false`) or
/// because it failed to decode or validate on receipt (`inbound == true`).
pub struct DropMessageEvent {
    pub timestamp: SystemTime,
    pub kind: MessageKind,
    pub sender: UserId,
    pub inbound: bool,
    pub reason: String,
}

/// A valid message from another client of the same document was received.
pub struct ReceiveMessageEvent {
    pub timestamp: SystemTime,
    pub message: Message,
}

/// A structural change to the document was received.
///
/// `lock_conflict` is true if, in the local view, the sender was not allowed to modify the element
/// when the operation arrived. The host decides whether to apply such an operation.
pub struct ReceiveNodeOperationEvent {
    pub timestamp: SystemTime,
    pub operation: NodeOperation,
    pub lock_conflict: bool,
}

pub struct ReceiveWirePreviewEvent {
    pub timestamp: SystemTime,
    pub preview: WirePreview,
}
