/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the session's
//! [configuration](crate::session::Configuration::log_events).
//!
//! graphlock-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [LockStateChanged](crate::events::LockStateChangedEvent) is printed:
//!
//! ```text
//! LockStateChanged, 1701329264, 3q2+7wA, alice, Locked, Promoted, 1701329294.112
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the element's id.
//! - The fourth value is the owner of the lock.
//! - The fifth and sixth values are the state of the lock after the change, and the cause of the
//!   change.
//! - The seventh value is the time the lease ends.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const LOCK_STATE_CHANGED: &str = "LockStateChanged";
pub const QUEUE_LOCK_REQUEST: &str = "QueueLockRequest";

pub const SEND_MESSAGE: &str = "SendMessage";
pub const THROTTLE_MESSAGE: &str = "ThrottleMessage";
pub const DROP_MESSAGE: &str = "DropMessage";

pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
pub const RECEIVE_NODE_OPERATION: &str = "ReceiveNodeOperation";
pub const RECEIVE_WIRE_PREVIEW: &str = "ReceiveWirePreview";

/// Implemented by event types. Used to get a closure that logs the event.
pub trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for LockStateChangedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |lock_state_changed_event: &LockStateChangedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                LOCK_STATE_CHANGED,
                secs_since_unix_epoch(lock_state_changed_event.timestamp),
                first_seven_base64_chars(&lock_state_changed_event.element.bytes()),
                lock_state_changed_event.record.owner,
                lock_state_changed_event.record.state,
                lock_state_changed_event.cause,
                lock_state_changed_event.record.expires_at
            )
        };
        Box::new(logger)
    }
}

impl Logger for QueueLockRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |queue_lock_request_event: &QueueLockRequestEvent| {
            log::info!(
                "{}, {}, {}, {}",
                QUEUE_LOCK_REQUEST,
                secs_since_unix_epoch(queue_lock_request_event.timestamp),
                first_seven_base64_chars(&queue_lock_request_event.element.bytes()),
                queue_lock_request_event.owner
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_message_event: &SendMessageEvent| {
            log::debug!(
                "{}, {}, {}, {:?}, {}",
                SEND_MESSAGE,
                secs_since_unix_epoch(send_message_event.timestamp),
                send_message_event.message.kind,
                send_message_event.destination,
                send_message_event.message.payload.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ThrottleMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |throttle_message_event: &ThrottleMessageEvent| {
            log::trace!(
                "{}, {}, {}",
                THROTTLE_MESSAGE,
                secs_since_unix_epoch(throttle_message_event.timestamp),
                throttle_message_event.kind
            )
        };
        Box::new(logger)
    }
}

impl Logger for DropMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |drop_message_event: &DropMessageEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}, {}",
                DROP_MESSAGE,
                secs_since_unix_epoch(drop_message_event.timestamp),
                drop_message_event.kind,
                drop_message_event.sender,
                if drop_message_event.inbound {
                    "inbound"
                } else {
                    "outbound"
                },
                drop_message_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_message_event: &ReceiveMessageEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}",
                RECEIVE_MESSAGE,
                secs_since_unix_epoch(receive_message_event.timestamp),
                receive_message_event.message.kind,
                receive_message_event.message.sender,
                receive_message_event.message.timestamp
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveNodeOperationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_node_operation_event: &ReceiveNodeOperationEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_NODE_OPERATION,
                secs_since_unix_epoch(receive_node_operation_event.timestamp),
                receive_node_operation_event.operation.operation,
                first_seven_base64_chars(&receive_node_operation_event.operation.element.bytes()),
                receive_node_operation_event.operation.sender,
                receive_node_operation_event.lock_conflict
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveWirePreviewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_wire_preview_event: &ReceiveWirePreviewEvent| {
            log::trace!(
                "{}, {}, {}, {}, {}",
                RECEIVE_WIRE_PREVIEW,
                secs_since_unix_epoch(receive_wire_preview_event.timestamp),
                first_seven_base64_chars(&receive_wire_preview_event.preview.element.bytes()),
                receive_wire_preview_event.preview.pin_name,
                receive_wire_preview_event.preview.sender
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_secs())
        .unwrap_or(0)
}

#[test]
fn first_seven_base64_chars_test() {
    assert_eq!(first_seven_base64_chars(&[0u8; 16]), "AAAAAAA");
    assert_eq!(first_seven_base64_chars(&[0xff]), "/w");
}
