/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The observer registry and the thread that delivers [`Event`]s to it.
//!
//! Handlers of each event type are kept in subscription order and are always invoked in that order.
//! A handler runs on the event bus thread while the registry is locked, so it must not subscribe or
//! unsubscribe handlers itself.

use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Identifies one registered handler, so that it can be
/// [unsubscribed](crate::session::Session::unsubscribe).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[doc(hidden)]
pub struct HandlerList<T> {
    handlers: Vec<(SubscriptionId, HandlerPtr<T>)>,
}

impl<T> HandlerList<T> {
    fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    fn fire(&self, event: &T) {
        self.handlers.iter().for_each(|(_, handler)| handler(event))
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _)| *handler_id != id);
        self.handlers.len() != before
    }
}

/// Implemented by every event type that handlers can subscribe to.
pub trait HandledEvent: Logger + Sized + 'static {
    #[doc(hidden)]
    fn handler_list(handlers: &mut EventHandlers) -> &mut HandlerList<Self>;
}

macro_rules! handled_event {
    ($event:ty, $field:ident) => {
        impl HandledEvent for $event {
            fn handler_list(handlers: &mut EventHandlers) -> &mut HandlerList<Self> {
                &mut handlers.$field
            }
        }
    };
}

handled_event!(LockStateChangedEvent, lock_state_changed_handlers);
handled_event!(QueueLockRequestEvent, queue_lock_request_handlers);
handled_event!(SendMessageEvent, send_message_handlers);
handled_event!(ThrottleMessageEvent, throttle_message_handlers);
handled_event!(DropMessageEvent, drop_message_handlers);
handled_event!(ReceiveMessageEvent, receive_message_handlers);
handled_event!(ReceiveNodeOperationEvent, receive_node_operation_handlers);
handled_event!(ReceiveWirePreviewEvent, receive_wire_preview_handlers);

/// Registered handlers of every event type.
pub struct EventHandlers {
    next_id: u64,
    pub(crate) lock_state_changed_handlers: HandlerList<LockStateChangedEvent>,
    pub(crate) queue_lock_request_handlers: HandlerList<QueueLockRequestEvent>,
    pub(crate) send_message_handlers: HandlerList<SendMessageEvent>,
    pub(crate) throttle_message_handlers: HandlerList<ThrottleMessageEvent>,
    pub(crate) drop_message_handlers: HandlerList<DropMessageEvent>,
    pub(crate) receive_message_handlers: HandlerList<ReceiveMessageEvent>,
    pub(crate) receive_node_operation_handlers: HandlerList<ReceiveNodeOperationEvent>,
    pub(crate) receive_wire_preview_handlers: HandlerList<ReceiveWirePreviewEvent>,
}

impl EventHandlers {
    /// Create a registry. If `log_events` is true, the default logging handler of every event type is
    /// subscribed first.
    pub(crate) fn new(log_events: bool) -> Self {
        let mut handlers = Self {
            next_id: 0,
            lock_state_changed_handlers: HandlerList::new(),
            queue_lock_request_handlers: HandlerList::new(),
            send_message_handlers: HandlerList::new(),
            throttle_message_handlers: HandlerList::new(),
            drop_message_handlers: HandlerList::new(),
            receive_message_handlers: HandlerList::new(),
            receive_node_operation_handlers: HandlerList::new(),
            receive_wire_preview_handlers: HandlerList::new(),
        };

        if log_events {
            handlers.subscribe_logger::<LockStateChangedEvent>();
            handlers.subscribe_logger::<QueueLockRequestEvent>();
            handlers.subscribe_logger::<SendMessageEvent>();
            handlers.subscribe_logger::<ThrottleMessageEvent>();
            handlers.subscribe_logger::<DropMessageEvent>();
            handlers.subscribe_logger::<ReceiveMessageEvent>();
            handlers.subscribe_logger::<ReceiveNodeOperationEvent>();
            handlers.subscribe_logger::<ReceiveWirePreviewEvent>();
        }

        handlers
    }

    pub(crate) fn subscribe<E: HandledEvent>(&mut self, handler: HandlerPtr<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        E::handler_list(self).handlers.push((id, handler));
        id
    }

    fn subscribe_logger<E: HandledEvent>(&mut self) {
        self.subscribe(E::get_logger());
    }

    /// Remove the handler registered as `id`. Returns whether it was registered.
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.lock_state_changed_handlers.remove(id)
            || self.queue_lock_request_handlers.remove(id)
            || self.send_message_handlers.remove(id)
            || self.throttle_message_handlers.remove(id)
            || self.drop_message_handlers.remove(id)
            || self.receive_message_handlers.remove(id)
            || self.receive_node_operation_handlers.remove(id)
            || self.receive_wire_preview_handlers.remove(id)
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::LockStateChanged(event) => self.lock_state_changed_handlers.fire(&event),
            Event::QueueLockRequest(event) => self.queue_lock_request_handlers.fire(&event),
            Event::SendMessage(event) => self.send_message_handlers.fire(&event),
            Event::ThrottleMessage(event) => self.throttle_message_handlers.fire(&event),
            Event::DropMessage(event) => self.drop_message_handlers.fire(&event),
            Event::ReceiveMessage(event) => self.receive_message_handlers.fire(&event),
            Event::ReceiveNodeOperation(event) => {
                self.receive_node_operation_handlers.fire(&event)
            }
            Event::ReceiveWirePreview(event) => self.receive_wire_preview_handlers.fire(&event),
        }
    }
}

/// Spawn the event bus thread, which delivers every published [`Event`] to the handlers in
/// `event_handlers`.
///
/// On shutdown, events already published are delivered before the thread exits.
pub(crate) fn start_event_bus(
    event_handlers: Arc<Mutex<EventHandlers>>,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    let fire = move |event: Event| {
        event_handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .fire_handlers(event)
    };

    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                while let Ok(event) = event_subscriber.try_recv() {
                    fire(event)
                }
                return;
            }
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => fire(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

#[test]
fn handlers_fire_in_subscription_order_and_unsubscribe_test() {
    use crate::{
        locks::ChangeCause,
        types::{ElementId, LockRecord, Timestamp, UserId},
    };
    use std::{sync::mpsc, time::SystemTime};

    let mut handlers = EventHandlers::new(false);
    let (calls, seen) = mpsc::channel();

    let first_calls = calls.clone();
    let first = handlers.subscribe::<LockStateChangedEvent>(Box::new(
        move |_: &LockStateChangedEvent| first_calls.send("first").unwrap(),
    ));
    handlers.subscribe::<LockStateChangedEvent>(Box::new(move |_: &LockStateChangedEvent| {
        calls.send("second").unwrap()
    }));

    let element = ElementId::random();
    let event = || {
        Event::LockStateChanged(LockStateChangedEvent {
            timestamp: SystemTime::now(),
            element,
            record: LockRecord::locked(
                element,
                UserId::from("alice"),
                Timestamp::from_secs(1.0),
                Duration::from_secs(30),
            ),
            cause: ChangeCause::Granted,
        })
    };

    handlers.fire_handlers(event());
    assert_eq!(seen.try_iter().collect::<Vec<_>>(), vec!["first", "second"]);

    assert!(handlers.unsubscribe(first));
    assert!(!handlers.unsubscribe(first));
    handlers.fire_handlers(event());
    assert_eq!(seen.try_iter().collect::<Vec<_>>(), vec!["second"]);
}
