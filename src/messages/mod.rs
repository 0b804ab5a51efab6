/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The wire envelope exchanged between clients, and the typed payloads it carries.
//!
//! ## Payload encodings
//!
//! Two payload encodings are used, depending on the kind of the message:
//! 1. [`WirePreview`] payloads use a compact fixed-field binary layout (see [`codec`]). Previews are
//!    produced at interactive rates while the user drags a wire, so they need to be small and cheap.
//! 2. [`NodeOperation`] and [`LockPayload`] payloads use a self-describing key-value encoding. These
//!    messages are rare but must be read correctly by clients built from different versions, so
//!    unknown keys are ignored and missing optional keys take their defaults.
//!
//! [`Heartbeat`](MessageKind::Heartbeat) messages carry no payload.

pub mod codec;

pub mod validation;

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::types::{
    DocumentId, ElementId, LockRecord, LockState, PendingRequest, SubgraphId, Timestamp, UserId,
};

use self::codec::CodecError;

/// The kind of a [`Message`], which decides how its payload is encoded and how the receiving client
/// dispatches it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    WirePreview,
    NodeOperation,
    LockRequest,
    LockRelease,
    Heartbeat,
}

impl MessageKind {
    /// Every message kind, in tag order.
    pub const ALL: [MessageKind; 5] = [
        MessageKind::WirePreview,
        MessageKind::NodeOperation,
        MessageKind::LockRequest,
        MessageKind::LockRelease,
        MessageKind::Heartbeat,
    ];

    /// The byte that identifies this kind in the binary envelope.
    pub const fn tag(&self) -> u8 {
        match self {
            MessageKind::WirePreview => 0,
            MessageKind::NodeOperation => 1,
            MessageKind::LockRequest => 2,
            MessageKind::LockRelease => 3,
            MessageKind::Heartbeat => 4,
        }
    }

    /// Get the kind identified by `tag`, if any.
    pub const fn from_tag(tag: u8) -> Option<MessageKind> {
        match tag {
            0 => Some(MessageKind::WirePreview),
            1 => Some(MessageKind::NodeOperation),
            2 => Some(MessageKind::LockRequest),
            3 => Some(MessageKind::LockRelease),
            4 => Some(MessageKind::Heartbeat),
            _ => None,
        }
    }

    /// Whether messages of this kind are optional for correctness and may be suppressed by the
    /// [throttler](crate::throttle::MessageThrottler). Lock and structural messages never are.
    pub const fn is_throttleable(&self) -> bool {
        matches!(self, MessageKind::WirePreview | MessageKind::Heartbeat)
    }

    /// Whether a message of this kind must carry a non-empty payload.
    pub const fn requires_payload(&self) -> bool {
        !matches!(self, MessageKind::Heartbeat)
    }

    /// The name of this kind in PascalCase.
    pub const fn name(&self) -> &'static str {
        match self {
            MessageKind::WirePreview => "WirePreview",
            MessageKind::NodeOperation => "NodeOperation",
            MessageKind::LockRequest => "LockRequest",
            MessageKind::LockRelease => "LockRelease",
            MessageKind::Heartbeat => "Heartbeat",
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The wire envelope. Every message a client sends or receives through its
/// [`Transport`](crate::networking::Transport) is a `Message`.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub document_id: DocumentId,
    pub subgraph_id: SubgraphId,
    pub sender: UserId,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

impl Message {
    /// Serialize this message into its binary envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode_message(self)
    }

    /// Deserialize a message from its binary envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Message, CodecError> {
        codec::decode_message(bytes)
    }

    /// Decode the payload of this message according to its kind.
    pub fn decode_payload(&self) -> Result<Payload, CodecError> {
        codec::decode_payload(self)
    }
}

/// The decoded payload of a [`Message`].
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    WirePreview(WirePreview),
    NodeOperation(NodeOperation),
    Lock(LockPayload),
    Heartbeat,
}

/// A position on the graph editor's canvas.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A preview of a wire being dragged out of a pin, sent while the drag is in progress.
#[derive(Clone, Debug, PartialEq)]
pub struct WirePreview {
    pub element: ElementId,
    pub pin_name: String,
    pub start: Position,
    pub end: Position,
    pub sender: UserId,
    pub timestamp: Timestamp,
}

/// The kind of change a [`NodeOperation`] makes to the document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeOperationKind {
    Add,
    Delete,
    Move,
    PinConnect,
    PinDisconnect,
    PropertyChange,
}

impl Display for NodeOperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeOperationKind::Add => "Add",
            NodeOperationKind::Delete => "Delete",
            NodeOperationKind::Move => "Move",
            NodeOperationKind::PinConnect => "PinConnect",
            NodeOperationKind::PinDisconnect => "PinDisconnect",
            NodeOperationKind::PropertyChange => "PropertyChange",
        };
        f.write_str(name)
    }
}

/// A structural change to the document.
///
/// Which optional fields must be set depends on `operation`; see
/// [`validate_node_operation`](validation::validate_node_operation).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOperation {
    pub operation: NodeOperationKind,
    pub element: ElementId,
    #[serde(default)]
    pub target_element: Option<ElementId>,
    #[serde(default)]
    pub pin_name: String,
    #[serde(default)]
    pub target_pin_name: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub class_name: String,
    /// Free-form, host-defined property blob.
    #[serde(default)]
    pub properties: String,
    pub sender: UserId,
    pub timestamp: Timestamp,
}

impl NodeOperation {
    /// Create an operation of kind `operation` on `element` with every optional field empty.
    pub fn new(
        operation: NodeOperationKind,
        element: ElementId,
        sender: UserId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            operation,
            element,
            target_element: None,
            pin_name: String::new(),
            target_pin_name: String::new(),
            position: Position::default(),
            class_name: String::new(),
            properties: String::new(),
            sender,
            timestamp,
        }
    }
}

/// The payload of [`LockRequest`](MessageKind::LockRequest) and
/// [`LockRelease`](MessageKind::LockRelease) messages.
///
/// `state` says what the owner announces: `Locked` for a lease they hold, `Pending` for a request
/// queued behind another owner, and `Unlocked` for a release or withdrawal. For `Pending`, the
/// lease fields hold the request time and the end of the lease asked for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockPayload {
    pub element: ElementId,
    pub state: LockState,
    pub owner: UserId,
    #[serde(default)]
    pub lease_start: Timestamp,
    #[serde(default)]
    pub lease_expiry: Timestamp,
}

impl LockPayload {
    /// A payload announcing `record`.
    pub fn from_record(record: &LockRecord) -> Self {
        Self {
            element: record.element,
            state: record.state,
            owner: record.owner.clone(),
            lease_start: record.acquired_at,
            lease_expiry: record.expires_at,
        }
    }

    /// A payload announcing that `request` is queued for `element`.
    pub fn request(element: ElementId, request: &PendingRequest) -> Self {
        Self {
            element,
            state: LockState::Pending,
            owner: request.user.clone(),
            lease_start: request.requested_at,
            lease_expiry: request.requested_at + request.lease,
        }
    }

    /// A payload announcing that `owner` gives up `element`, whether it holds it or is queued for it.
    pub fn release(element: ElementId, owner: UserId, at: Timestamp) -> Self {
        Self {
            element,
            state: LockState::Unlocked,
            owner,
            lease_start: at,
            lease_expiry: at,
        }
    }

    /// The lock record this payload describes.
    pub fn to_record(&self) -> LockRecord {
        LockRecord {
            element: self.element,
            owner: self.owner.clone(),
            state: self.state,
            acquired_at: self.lease_start,
            expires_at: self.lease_expiry,
        }
    }

    /// The queued request this payload describes.
    pub fn to_request(&self) -> PendingRequest {
        PendingRequest {
            user: self.owner.clone(),
            requested_at: self.lease_start,
            lease: self.lease_expiry.saturating_duration_since(self.lease_start),
        }
    }
}

#[test]
fn message_kind_tags_are_stable_test() {
    for kind in MessageKind::ALL {
        assert_eq!(MessageKind::from_tag(kind.tag()), Some(kind));
    }
    assert_eq!(MessageKind::from_tag(5), None);
    assert!(MessageKind::WirePreview.is_throttleable());
    assert!(MessageKind::Heartbeat.is_throttleable());
    assert!(!MessageKind::LockRequest.is_throttleable());
    assert!(!MessageKind::LockRelease.is_throttleable());
    assert!(!MessageKind::NodeOperation.is_throttleable());
}

#[test]
fn pending_payload_carries_queued_request_test() {
    use std::time::Duration;

    let request = PendingRequest {
        user: UserId::from("bob"),
        requested_at: Timestamp::from_secs(1001.0),
        lease: Duration::from_secs(30),
    };
    let payload = LockPayload::request(ElementId::random(), &request);
    assert_eq!(payload.state, LockState::Pending);
    assert_eq!(payload.lease_expiry, Timestamp::from_secs(1031.0));
    assert_eq!(payload.to_request(), request);
}
