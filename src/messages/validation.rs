/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structural checks on inbound envelopes and decoded payloads.
//!
//! Validation never looks at lock state. It only rejects messages that no well-behaved client
//! could have sent, so that the [replicator](crate::replication::Replicator) can drop them before
//! they touch the lock table.

use std::fmt::{self, Display, Formatter};

use super::{LockPayload, Message, MessageKind, NodeOperation, NodeOperationKind, WirePreview};
use crate::types::{LockState, UserId};

/// Check the envelope fields of `message`.
pub fn validate_message(message: &Message) -> Result<(), ValidationError> {
    if message.document_id.is_nil() {
        return Err(ValidationError::NilDocumentId);
    }
    if message.subgraph_id.is_nil() {
        return Err(ValidationError::NilSubgraphId);
    }
    if message.sender.is_empty() {
        return Err(ValidationError::EmptySender);
    }
    if !is_positive(message.timestamp.secs()) {
        return Err(ValidationError::InvalidTimestamp);
    }
    if message.kind.requires_payload() && message.payload.is_empty() {
        return Err(ValidationError::MissingPayload(message.kind));
    }
    Ok(())
}

/// Check the fields of a decoded wire preview.
pub fn validate_wire_preview(preview: &WirePreview) -> Result<(), ValidationError> {
    if preview.element.is_nil() {
        return Err(ValidationError::NilElementId);
    }
    if preview.pin_name.is_empty() {
        return Err(ValidationError::EmptyPinName);
    }
    if preview.sender.is_empty() {
        return Err(ValidationError::EmptySender);
    }
    if !is_positive(preview.timestamp.secs()) {
        return Err(ValidationError::InvalidTimestamp);
    }
    Ok(())
}

/// Check the fields of a decoded node operation, including the fields its kind requires.
pub fn validate_node_operation(operation: &NodeOperation) -> Result<(), ValidationError> {
    if operation.element.is_nil() {
        return Err(ValidationError::NilElementId);
    }
    if operation.sender.is_empty() {
        return Err(ValidationError::EmptySender);
    }
    match operation.operation {
        NodeOperationKind::Add if operation.class_name.is_empty() => {
            Err(ValidationError::MissingClassName)
        }
        NodeOperationKind::PinConnect | NodeOperationKind::PinDisconnect => {
            match operation.target_element {
                None => Err(ValidationError::MissingTargetElement),
                Some(target) if target.is_nil() => Err(ValidationError::MissingTargetElement),
                Some(_) if operation.pin_name.is_empty() => Err(ValidationError::EmptyPinName),
                Some(_) => Ok(()),
            }
        }
        NodeOperationKind::PropertyChange if operation.properties.is_empty() => {
            Err(ValidationError::MissingProperties)
        }
        _ => Ok(()),
    }
}

/// Check the fields of a decoded lock payload carried by a message from `sender`.
///
/// A client may only announce its own locks and releases, so the payload's owner must be the
/// envelope's sender.
pub fn validate_lock_payload(payload: &LockPayload, sender: &UserId) -> Result<(), ValidationError> {
    if payload.element.is_nil() {
        return Err(ValidationError::NilElementId);
    }
    if payload.owner.is_empty() {
        return Err(ValidationError::EmptyOwner);
    }
    if payload.owner != *sender {
        return Err(ValidationError::OwnerMismatch {
            owner: payload.owner.clone(),
            sender: sender.clone(),
        });
    }
    match payload.state {
        LockState::Locked | LockState::Pending => {
            if !payload.lease_start.is_finite()
                || !payload.lease_expiry.is_finite()
                || payload.lease_expiry <= payload.lease_start
            {
                Err(ValidationError::InvalidLease)
            } else {
                Ok(())
            }
        }
        LockState::Unlocked => Ok(()),
    }
}

fn is_positive(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0
}

/// A rule that an inbound message or payload broke.
#[derive(Clone, Debug, PartialEq)]
pub enum ValidationError {
    NilDocumentId,
    NilSubgraphId,
    NilElementId,
    EmptySender,
    EmptyOwner,
    EmptyPinName,
    /// The timestamp is not a finite, positive number of seconds.
    InvalidTimestamp,
    MissingPayload(MessageKind),
    MissingClassName,
    MissingTargetElement,
    MissingProperties,
    /// A `Locked` or `Pending` payload whose lease does not end after it starts.
    InvalidLease,
    OwnerMismatch {
        owner: UserId,
        sender: UserId,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NilDocumentId => f.write_str("nil document id"),
            ValidationError::NilSubgraphId => f.write_str("nil subgraph id"),
            ValidationError::NilElementId => f.write_str("nil element id"),
            ValidationError::EmptySender => f.write_str("empty sender id"),
            ValidationError::EmptyOwner => f.write_str("empty lock owner"),
            ValidationError::EmptyPinName => f.write_str("empty pin name"),
            ValidationError::InvalidTimestamp => f.write_str("timestamp is not positive"),
            ValidationError::MissingPayload(kind) => write!(f, "{} message without payload", kind),
            ValidationError::MissingClassName => f.write_str("add operation without class name"),
            ValidationError::MissingTargetElement => {
                f.write_str("pin operation without target element")
            }
            ValidationError::MissingProperties => {
                f.write_str("property change without property data")
            }
            ValidationError::InvalidLease => f.write_str("lease expiry is not after lease start"),
            ValidationError::OwnerMismatch { owner, sender } => write!(
                f,
                "lock payload owner {} does not match sender {}",
                owner, sender
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
use crate::types::{DocumentId, ElementId, SubgraphId, Timestamp};

#[test]
fn envelope_rules_test() {
    let valid = Message {
        kind: MessageKind::LockRequest,
        document_id: DocumentId::random(),
        subgraph_id: SubgraphId::random(),
        sender: UserId::from("alice"),
        timestamp: Timestamp::from_secs(1.0),
        payload: vec![0],
    };
    assert_eq!(validate_message(&valid), Ok(()));

    let mut message = valid.clone();
    message.sender = UserId::from("");
    assert_eq!(validate_message(&message), Err(ValidationError::EmptySender));

    let mut message = valid.clone();
    message.document_id = DocumentId::nil();
    assert_eq!(validate_message(&message), Err(ValidationError::NilDocumentId));

    let mut message = valid.clone();
    message.timestamp = Timestamp::from_secs(0.0);
    assert_eq!(validate_message(&message), Err(ValidationError::InvalidTimestamp));

    let mut message = valid.clone();
    message.payload.clear();
    assert_eq!(
        validate_message(&message),
        Err(ValidationError::MissingPayload(MessageKind::LockRequest))
    );

    message.kind = MessageKind::Heartbeat;
    assert_eq!(validate_message(&message), Ok(()));
}

#[test]
fn node_operation_rules_test() {
    let alice = UserId::from("alice");
    let now = Timestamp::from_secs(1.0);

    let add = NodeOperation::new(NodeOperationKind::Add, ElementId::random(), alice.clone(), now);
    assert_eq!(
        validate_node_operation(&add),
        Err(ValidationError::MissingClassName)
    );

    let mut connect = NodeOperation::new(
        NodeOperationKind::PinConnect,
        ElementId::random(),
        alice.clone(),
        now,
    );
    assert_eq!(
        validate_node_operation(&connect),
        Err(ValidationError::MissingTargetElement)
    );
    connect.target_element = Some(ElementId::random());
    assert_eq!(
        validate_node_operation(&connect),
        Err(ValidationError::EmptyPinName)
    );
    connect.pin_name = "Then 0".to_string();
    assert_eq!(validate_node_operation(&connect), Ok(()));

    let moved = NodeOperation::new(NodeOperationKind::Move, ElementId::random(), alice, now);
    assert_eq!(validate_node_operation(&moved), Ok(()));
}

#[test]
fn lock_payload_rules_test() {
    let alice = UserId::from("alice");
    let mut payload = LockPayload {
        element: ElementId::random(),
        state: LockState::Locked,
        owner: alice.clone(),
        lease_start: Timestamp::from_secs(10.0),
        lease_expiry: Timestamp::from_secs(40.0),
    };
    assert_eq!(validate_lock_payload(&payload, &alice), Ok(()));
    assert!(matches!(
        validate_lock_payload(&payload, &UserId::from("mallory")),
        Err(ValidationError::OwnerMismatch { .. })
    ));

    payload.lease_expiry = payload.lease_start;
    assert_eq!(
        validate_lock_payload(&payload, &alice),
        Err(ValidationError::InvalidLease)
    );

    payload.state = LockState::Pending;
    assert_eq!(
        validate_lock_payload(&payload, &alice),
        Err(ValidationError::InvalidLease)
    );

    payload.state = LockState::Unlocked;
    assert_eq!(validate_lock_payload(&payload, &alice), Ok(()));

    payload.state = LockState::Pending;
    payload.lease_expiry = Timestamp::from_secs(40.0);
    assert_eq!(validate_lock_payload(&payload, &alice), Ok(()));
}
