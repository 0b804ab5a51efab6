/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Hand-written, versioned encodings of [`Message`]s and their payloads.
//!
//! ## Binary layouts
//!
//! The envelope and the wire preview payload are serialized with Borsh through private "layout"
//! structs whose first field is a layout version byte. A decoder rejects any version it does not
//! know with [`CodecError::UnsupportedVersion`], so a layout can only be changed by bumping its
//! version constant.
//!
//! ## Key-value payloads
//!
//! Node operations and lock payloads are serialized as JSON objects carrying a `"v"` schema version
//! key next to the payload's own keys. Decoders ignore unknown keys and fill missing optional keys
//! with their defaults, so newer clients can add keys without breaking older ones.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use super::{
    LockPayload, Message, MessageKind, NodeOperation, Payload, Position, WirePreview,
};
use crate::types::{DocumentId, ElementId, SubgraphId, Timestamp, UserId};

/// Version of the binary envelope layout written by this crate.
pub const ENVELOPE_LAYOUT_VERSION: u8 = 1;

/// Version of the binary wire preview layout written by this crate.
pub const WIRE_PREVIEW_LAYOUT_VERSION: u8 = 1;

/// Schema version written into every key-value payload.
pub const KEY_VALUE_SCHEMA_VERSION: u32 = 1;

#[derive(BorshSerialize, BorshDeserialize)]
struct EnvelopeLayout {
    version: u8,
    kind: u8,
    document_id: [u8; 16],
    subgraph_id: [u8; 16],
    sender: String,
    timestamp: f64,
    payload: Vec<u8>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct WirePreviewLayout {
    version: u8,
    element: [u8; 16],
    pin_name: String,
    start_x: f32,
    start_y: f32,
    end_x: f32,
    end_y: f32,
    sender: String,
    timestamp: f64,
}

#[derive(Serialize)]
struct VersionedRef<'a, T> {
    v: u32,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Deserialize)]
struct Versioned<T> {
    #[serde(default)]
    #[allow(dead_code)]
    v: u32,
    #[serde(flatten)]
    body: T,
}

/// Serialize `message` into its binary envelope.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, CodecError> {
    ensure_finite("timestamp", message.timestamp.secs())?;
    let layout = EnvelopeLayout {
        version: ENVELOPE_LAYOUT_VERSION,
        kind: message.kind.tag(),
        document_id: message.document_id.bytes(),
        subgraph_id: message.subgraph_id.bytes(),
        sender: message.sender.as_str().to_string(),
        timestamp: message.timestamp.secs(),
        payload: message.payload.clone(),
    };
    Ok(layout.try_to_vec()?)
}

/// Deserialize a [`Message`] from its binary envelope.
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    check_version(bytes, ENVELOPE_LAYOUT_VERSION)?;
    let layout = EnvelopeLayout::try_from_slice(bytes)?;
    let kind = MessageKind::from_tag(layout.kind).ok_or(CodecError::UnknownKind(layout.kind))?;
    Ok(Message {
        kind,
        document_id: DocumentId::from_bytes(layout.document_id),
        subgraph_id: SubgraphId::from_bytes(layout.subgraph_id),
        sender: UserId::new(layout.sender),
        timestamp: Timestamp::from_secs(layout.timestamp),
        payload: layout.payload,
    })
}

/// Serialize a [`WirePreview`] into its fixed-field binary layout.
pub fn encode_wire_preview(preview: &WirePreview) -> Result<Vec<u8>, CodecError> {
    ensure_position_finite("start", preview.start)?;
    ensure_position_finite("end", preview.end)?;
    ensure_finite("timestamp", preview.timestamp.secs())?;
    let layout = WirePreviewLayout {
        version: WIRE_PREVIEW_LAYOUT_VERSION,
        element: preview.element.bytes(),
        pin_name: preview.pin_name.clone(),
        start_x: preview.start.x,
        start_y: preview.start.y,
        end_x: preview.end.x,
        end_y: preview.end.y,
        sender: preview.sender.as_str().to_string(),
        timestamp: preview.timestamp.secs(),
    };
    Ok(layout.try_to_vec()?)
}

/// Deserialize a [`WirePreview`] from its fixed-field binary layout.
pub fn decode_wire_preview(bytes: &[u8]) -> Result<WirePreview, CodecError> {
    check_version(bytes, WIRE_PREVIEW_LAYOUT_VERSION)?;
    let layout = WirePreviewLayout::try_from_slice(bytes)?;
    Ok(WirePreview {
        element: ElementId::from_bytes(layout.element),
        pin_name: layout.pin_name,
        start: Position::new(layout.start_x, layout.start_y),
        end: Position::new(layout.end_x, layout.end_y),
        sender: UserId::new(layout.sender),
        timestamp: Timestamp::from_secs(layout.timestamp),
    })
}

/// Serialize a [`NodeOperation`] into a key-value payload.
pub fn encode_node_operation(operation: &NodeOperation) -> Result<Vec<u8>, CodecError> {
    ensure_position_finite("position", operation.position)?;
    ensure_finite("timestamp", operation.timestamp.secs())?;
    encode_key_value(operation)
}

/// Deserialize a [`NodeOperation`] from a key-value payload.
pub fn decode_node_operation(bytes: &[u8]) -> Result<NodeOperation, CodecError> {
    decode_key_value(bytes)
}

/// Serialize a [`LockPayload`] into a key-value payload.
pub fn encode_lock_payload(payload: &LockPayload) -> Result<Vec<u8>, CodecError> {
    ensure_finite("leaseStart", payload.lease_start.secs())?;
    ensure_finite("leaseExpiry", payload.lease_expiry.secs())?;
    encode_key_value(payload)
}

/// Deserialize a [`LockPayload`] from a key-value payload.
pub fn decode_lock_payload(bytes: &[u8]) -> Result<LockPayload, CodecError> {
    decode_key_value(bytes)
}

/// Decode the payload of `message` according to its kind. The payload of a
/// [`Heartbeat`](MessageKind::Heartbeat) is ignored.
pub fn decode_payload(message: &Message) -> Result<Payload, CodecError> {
    match message.kind {
        MessageKind::WirePreview => Ok(Payload::WirePreview(decode_wire_preview(&message.payload)?)),
        MessageKind::NodeOperation => Ok(Payload::NodeOperation(decode_node_operation(
            &message.payload,
        )?)),
        MessageKind::LockRequest | MessageKind::LockRelease => {
            Ok(Payload::Lock(decode_lock_payload(&message.payload)?))
        }
        MessageKind::Heartbeat => Ok(Payload::Heartbeat),
    }
}

fn encode_key_value<T: Serialize>(body: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&VersionedRef {
        v: KEY_VALUE_SCHEMA_VERSION,
        body,
    })?)
}

fn decode_key_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CodecError> {
    let versioned: Versioned<T> = serde_json::from_slice(bytes)?;
    Ok(versioned.body)
}

fn check_version(bytes: &[u8], expected: u8) -> Result<(), CodecError> {
    match bytes.first() {
        Some(version) if *version == expected => Ok(()),
        Some(version) => Err(CodecError::UnsupportedVersion(*version)),
        None => Err(CodecError::Empty),
    }
}

// Borsh refuses to serialize NaN by panicking, so non-finite values are rejected up front.
fn ensure_finite(field: &'static str, value: f64) -> Result<(), CodecError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CodecError::NonFinite(field))
    }
}

fn ensure_position_finite(field: &'static str, position: Position) -> Result<(), CodecError> {
    if position.x.is_finite() && position.y.is_finite() {
        Ok(())
    } else {
        Err(CodecError::NonFinite(field))
    }
}

/// Reasons why a message or payload could not be encoded or decoded.
#[derive(Debug)]
pub enum CodecError {
    /// The bytes do not match the binary layout.
    Binary(std::io::Error),

    /// The bytes are not a well-formed key-value payload, or lack a required key.
    KeyValue(serde_json::Error),

    /// The binary layout version is not one this crate understands.
    UnsupportedVersion(u8),

    /// A float field is NaN or infinite.
    NonFinite(&'static str),

    /// The envelope's kind tag is not one of the known [`MessageKind`]s.
    UnknownKind(u8),

    /// There were no bytes to decode.
    Empty,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Binary(err) => write!(f, "malformed binary layout: {}", err),
            CodecError::KeyValue(err) => write!(f, "malformed key-value payload: {}", err),
            CodecError::UnsupportedVersion(version) => {
                write!(f, "unsupported layout version {}", version)
            }
            CodecError::NonFinite(field) => write!(f, "field `{}` is not finite", field),
            CodecError::UnknownKind(tag) => write!(f, "unknown message kind tag {}", tag),
            CodecError::Empty => f.write_str("empty input"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Binary(err) => Some(err),
            CodecError::KeyValue(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(value: std::io::Error) -> Self {
        CodecError::Binary(value)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(value: serde_json::Error) -> Self {
        CodecError::KeyValue(value)
    }
}

#[cfg(test)]
fn sample_preview() -> WirePreview {
    WirePreview {
        element: ElementId::random(),
        pin_name: "Exec".to_string(),
        start: Position::new(10.0, -4.5),
        end: Position::new(220.25, 80.0),
        sender: UserId::from("alice"),
        timestamp: Timestamp::from_secs(1_700_000_000.125),
    }
}

#[test]
fn envelope_rejects_unknown_layout_version_test() {
    let message = Message {
        kind: MessageKind::Heartbeat,
        document_id: DocumentId::random(),
        subgraph_id: SubgraphId::random(),
        sender: UserId::from("alice"),
        timestamp: Timestamp::from_secs(12.5),
        payload: Vec::new(),
    };
    let mut bytes = encode_message(&message).unwrap();
    assert_eq!(decode_message(&bytes).unwrap(), message);

    bytes[0] = ENVELOPE_LAYOUT_VERSION + 1;
    assert!(matches!(
        decode_message(&bytes),
        Err(CodecError::UnsupportedVersion(v)) if v == ENVELOPE_LAYOUT_VERSION + 1
    ));
    assert!(matches!(decode_message(&[]), Err(CodecError::Empty)));
}

#[test]
fn envelope_rejects_unknown_kind_and_truncation_test() {
    let message = Message {
        kind: MessageKind::LockRequest,
        document_id: DocumentId::random(),
        subgraph_id: SubgraphId::random(),
        sender: UserId::from("bob"),
        timestamp: Timestamp::from_secs(3.0),
        payload: vec![1, 2, 3],
    };
    let mut bytes = encode_message(&message).unwrap();
    let truncated = &bytes[..bytes.len() - 1];
    assert!(matches!(decode_message(truncated), Err(CodecError::Binary(_))));

    bytes[1] = 42;
    assert!(matches!(decode_message(&bytes), Err(CodecError::UnknownKind(42))));
}

#[test]
fn wire_preview_layout_test() {
    let preview = sample_preview();
    let bytes = encode_wire_preview(&preview).unwrap();
    assert_eq!(bytes[0], WIRE_PREVIEW_LAYOUT_VERSION);
    assert_eq!(decode_wire_preview(&bytes).unwrap(), preview);

    let mut bad = preview.clone();
    bad.end.x = f32::NAN;
    assert!(matches!(
        encode_wire_preview(&bad),
        Err(CodecError::NonFinite("end"))
    ));
}

#[test]
fn key_value_payloads_tolerate_unknown_and_missing_keys_test() {
    use super::NodeOperationKind;
    use crate::types::LockState;

    let element = ElementId::random();
    let json = format!(
        r#"{{"v":7,"operation":"Move","element":"{}","position":{{"x":1.5,"y":2.0}},"sender":"alice","timestamp":5.0,"addedInAFutureVersion":true}}"#,
        element
    );
    let operation = decode_node_operation(json.as_bytes()).unwrap();
    assert_eq!(operation.operation, NodeOperationKind::Move);
    assert_eq!(operation.element, element);
    assert_eq!(operation.position, Position::new(1.5, 2.0));
    assert_eq!(operation.target_element, None);
    assert!(operation.class_name.is_empty());

    let payload = LockPayload {
        element,
        state: LockState::Locked,
        owner: UserId::from("alice"),
        lease_start: Timestamp::from_secs(0.0),
        lease_expiry: Timestamp::from_secs(30.0),
    };
    let bytes = encode_lock_payload(&payload).unwrap();
    let text = std::str::from_utf8(&bytes).unwrap();
    assert!(text.contains("\"leaseExpiry\""));
    assert!(text.contains("\"v\":1"));
    assert_eq!(decode_lock_payload(&bytes).unwrap(), payload);

    assert!(matches!(
        decode_lock_payload(br#"{"state":"Locked"}"#),
        Err(CodecError::KeyValue(_))
    ));
}
