/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and stop a session.
//!
//! graphlock-rs coordinates edits to one shared document between several clients. Every client runs
//! a 'session', identified by the [`UserId`] of its local user. Sessions do not elect a leader: each
//! keeps its own copy of the lock table and replicates changes to it by broadcasting messages through
//! the host's [transport](crate::networking::Transport).
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the session](SessionSpec) with:
//!   1. `SessionSpec::builder` to construct a `SessionSpecBuilder`,
//!   2. The setters of the `SessionSpecBuilder`, and
//!   3. The `SessionSpecBuilder::build` method to construct a [SessionSpec],
//! - The function to [start](SessionSpec::start) a [Session] given its specification,
//! - [The type](Session) which keeps the session alive.
//!
//! ## Starting a session
//!
//! ```ignore
//! let session =
//!     SessionSpec::builder()
//!     .transport(transport)
//!     .configuration(configuration)
//!     .on_lock_state_changed(lock_state_changed_handler)
//!     .on_receive_node_operation(node_operation_handler)
//!     .build()
//!     .start();
//! ```
//!
//! ### Required setters
//!
//! - `.transport(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.clock(...)`
//! - `.on_lock_state_changed(...)`
//! - `.on_queue_lock_request(...)`
//! - `.on_send_message(...)`
//! - `.on_throttle_message(...)`
//! - `.on_drop_message(...)`
//! - `.on_receive_message(...)`
//! - `.on_receive_node_operation(...)`
//! - `.on_receive_wire_preview(...)`
//!
//! The session's [configuration](Configuration) is also defined using the builder pattern:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(UserId::from("alice"))
//!     .document_id(document_id)
//!     .subgraph_id(subgraph_id)
//!     .auto_renew(true)
//!     .log_events(true)
//!     .build();
//! ```
//!
//! ## Threads
//!
//! A running session owns three threads, which share its [`Replicator`] behind a single mutex:
//! 1. The **poller** feeds every message received from the transport to the replicator.
//! 2. The **ticker** expires leases, renews the local user's leases if `auto_renew` is set, and sends
//!    heartbeats if `send_heartbeats` is set, once every `tick_interval`.
//! 3. The **event bus** delivers events to the registered handlers.
//!
//! Dropping the [`Session`] releases the local user's locks, tells peers, and then stops the threads.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    clock::{Clock, SystemClock},
    event_bus::{start_event_bus, EventHandlers, HandledEvent, HandlerPtr, SubscriptionId},
    events::*,
    locks::{LockOutcome, LockRequestError},
    messages::{Message, MessageKind, NodeOperation, Position},
    metrics::{MetricsRecorder, MetricsSnapshot},
    networking::{receiving::start_polling, Transport},
    replication::{InboundError, Replicator, SendError, SendOutcome},
    throttle::{ThrottleConfiguration, ThrottleStats},
    types::{DocumentId, ElementId, LockRecord, LockState, SubgraphId, UserId},
};

/// Stores the user-defined parameters required to start a session, that is:
/// 1. The local user's id.
/// 2. The id of the shared document, and of the subgraph being edited.
/// 3. The default lease length, and whether and when the local user's leases are renewed.
/// 4. How often the lock table is swept, and how often the transport is polled.
/// 5. Whether heartbeats are sent, and how outbound previews are throttled.
/// 6. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Clocks
///
/// Lease bounds travel between clients as absolute timestamps, so every session in a document should
/// read a [`Clock`] with the same epoch. Clock skew between clients shortens or lengthens leases as
/// seen by peers.
///
/// ## Log Events
///
/// graphlock-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.document_id(...)`
    - `.subgraph_id(...)`

    Optional:
    - `.default_lease(...)`
    - `.renewal_margin(...)`
    - `.auto_renew(...)`
    - `.tick_interval(...)`
    - `.poll_interval(...)`
    - `.send_heartbeats(...)`
    - `.throttle(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(into, doc = "Set the id of the local user. Required."))]
    pub me: UserId,
    #[builder(setter(doc = "Set the id of the shared document. Messages for other documents are discarded. Required."))]
    pub document_id: DocumentId,
    #[builder(setter(doc = "Set the id of the subgraph the local user is editing. Required."))]
    pub subgraph_id: SubgraphId,
    #[builder(default = Duration::from_secs(30), setter(doc = "Set the lease used when none is given. Defaults to 30 seconds."))]
    pub default_lease: Duration,
    #[builder(default = Duration::from_secs(5), setter(doc = "Set how long before expiry a lease is renewed when `auto_renew` is set. Defaults to 5 seconds."))]
    pub renewal_margin: Duration,
    #[builder(default = false, setter(doc = "Renew the local user's leases before they expire? Defaults to false."))]
    pub auto_renew: bool,
    #[builder(default = Duration::from_millis(100), setter(doc = "Set how often the lock table is swept for expired leases. Defaults to 100 milliseconds."))]
    pub tick_interval: Duration,
    #[builder(default = Duration::from_millis(1), setter(doc = "Set how long the poller sleeps when the transport has nothing to deliver. Defaults to 1 millisecond."))]
    pub poll_interval: Duration,
    #[builder(default = false, setter(doc = "Offer a heartbeat on every tick? Defaults to false."))]
    pub send_heartbeats: bool,
    #[builder(default, setter(doc = "Set how outbound messages are throttled. Defaults to `ThrottleConfiguration::default()`."))]
    pub throttle: ThrottleConfiguration,
    #[builder(default = false, setter(doc = "Enable logging? Defaults to false."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run a [Session].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [SessionSpec]. On the builder call the following methods to construct a valid [SessionSpec].

    Required:
    - `.transport(...)`
    - `.configuration(...)`

    Optional:
    - `.clock(...)`
    - `.on_lock_state_changed(...)`
    - `.on_queue_lock_request(...)`
    - `.on_send_message(...)`
    - `.on_throttle_message(...)`
    - `.on_drop_message(...)`
    - `.on_receive_message(...)`
    - `.on_receive_node_operation(...)`
    - `.on_receive_wire_preview(...)`
"))]
pub struct SessionSpec<T: Transport + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the transport used to talk to peers. The argument must implement the [Transport](crate::networking::Transport) trait. Required."))]
    transport: T,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a session. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>, setter(transform = |clock: impl Clock + 'static| Arc::new(clock) as Arc<dyn Clock>,
    doc = "Set the clock the session reads time from. Defaults to the [SystemClock](crate::clock::SystemClock). Optional."))]
    clock: Arc<dyn Clock>,
    #[builder(default, setter(transform = |handler: impl Fn(&LockStateChangedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<LockStateChangedEvent>),
    doc = "Register a handler closure to be invoked after an element is granted, renewed, released, or expires in the local view. Optional."))]
    on_lock_state_changed: Option<HandlerPtr<LockStateChangedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&QueueLockRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<QueueLockRequestEvent>),
    doc = "Register a handler closure to be invoked after a request of the local user is queued behind another user. Optional."))]
    on_queue_lock_request: Option<HandlerPtr<QueueLockRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SendMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SendMessageEvent>),
    doc = "Register a handler closure to be invoked after a message is handed to the transport. Optional."))]
    on_send_message: Option<HandlerPtr<SendMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ThrottleMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ThrottleMessageEvent>),
    doc = "Register a handler closure to be invoked after an outbound message is suppressed by the throttler. Optional."))]
    on_throttle_message: Option<HandlerPtr<ThrottleMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DropMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DropMessageEvent>),
    doc = "Register a handler closure to be invoked after an inbound or outbound message is dropped as invalid. Optional."))]
    on_drop_message: Option<HandlerPtr<DropMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveMessageEvent>),
    doc = "Register a handler closure to be invoked after a valid message is received from a peer. Optional."))]
    on_receive_message: Option<HandlerPtr<ReceiveMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveNodeOperationEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveNodeOperationEvent>),
    doc = "Register a handler closure to be invoked after a structural operation is received from a peer. Optional."))]
    on_receive_node_operation: Option<HandlerPtr<ReceiveNodeOperationEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveWirePreviewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveWirePreviewEvent>),
    doc = "Register a handler closure to be invoked after a wire preview is received from a peer. Optional."))]
    on_receive_wire_preview: Option<HandlerPtr<ReceiveWirePreviewEvent>>,
}

impl<T: Transport + 'static> SessionSpec<T> {
    /// Starts all threads and channels associated with running a session, and returns the handles to
    /// them in a [Session] struct.
    pub fn start(self) -> Session<T> {
        let config = self.configuration;
        let clock = self.clock;

        let mut event_handlers = EventHandlers::new(config.log_events);
        subscribe_initial(&mut event_handlers, self.on_lock_state_changed);
        subscribe_initial(&mut event_handlers, self.on_queue_lock_request);
        subscribe_initial(&mut event_handlers, self.on_send_message);
        subscribe_initial(&mut event_handlers, self.on_throttle_message);
        subscribe_initial(&mut event_handlers, self.on_drop_message);
        subscribe_initial(&mut event_handlers, self.on_receive_message);
        subscribe_initial(&mut event_handlers, self.on_receive_node_operation);
        subscribe_initial(&mut event_handlers, self.on_receive_wire_preview);
        let event_handlers = Arc::new(Mutex::new(event_handlers));

        let (event_publisher, event_subscriber) = mpsc::channel();
        let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
        let event_bus = start_event_bus(
            event_handlers.clone(),
            event_subscriber,
            event_bus_shutdown_receiver,
        );

        let metrics = Arc::new(MetricsRecorder::new());
        let replicator = Arc::new(Mutex::new(Replicator::new(
            &config,
            self.transport.clone(),
            metrics.clone(),
            Some(event_publisher),
        )));

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(
            self.transport,
            replicator.clone(),
            clock.clone(),
            config.poll_interval,
            poller_shutdown_receiver,
        );

        let (ticker_shutdown, ticker_shutdown_receiver) = mpsc::channel();
        let ticker = start_ticker(
            replicator.clone(),
            clock.clone(),
            &config,
            ticker_shutdown_receiver,
        );

        Session {
            replicator,
            event_handlers,
            metrics,
            clock,
            ticker: Some(ticker),
            ticker_shutdown,
            poller: Some(poller),
            poller_shutdown,
            event_bus: Some(event_bus),
            event_bus_shutdown,
        }
    }
}

fn subscribe_initial<E: HandledEvent>(
    event_handlers: &mut EventHandlers,
    handler: Option<HandlerPtr<E>>,
) {
    if let Some(handler) = handler {
        event_handlers.subscribe(handler);
    }
}

/// Spawn the ticker thread, which sweeps the lock table once every `tick_interval`.
fn start_ticker<T: Transport + 'static>(
    replicator: Arc<Mutex<Replicator<T>>>,
    clock: Arc<dyn Clock>,
    config: &Configuration,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    let tick_interval = config.tick_interval;
    let auto_renew = config.auto_renew;
    let renewal_margin = config.renewal_margin;
    let default_lease = config.default_lease;
    let send_heartbeats = config.send_heartbeats;

    thread::spawn(move || loop {
        match shutdown_signal.recv_timeout(tick_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => (),
        }

        let now = clock.now();
        let mut replicator = lock(&replicator);
        replicator.tick(now);
        if auto_renew {
            replicator.renew_expiring(renewal_margin, default_lease, now);
        }
        if send_heartbeats {
            replicator.send_heartbeat(now);
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A handle to the background threads of a running session. When this value is dropped, the local
/// user's locks are released and all background threads are gracefully shut down.
///
/// Every method reads the current time from the session's [`Clock`].
pub struct Session<T: Transport + 'static> {
    replicator: Arc<Mutex<Replicator<T>>>,
    event_handlers: Arc<Mutex<EventHandlers>>,
    metrics: Arc<MetricsRecorder>,
    clock: Arc<dyn Clock>,
    ticker: Option<JoinHandle<()>>,
    ticker_shutdown: Sender<()>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Sender<()>,
}

impl<T: Transport + 'static> Session<T> {
    /// Request `element` for the local user for the configured default lease.
    pub fn request_lock(&self, element: ElementId) -> Result<LockOutcome, LockRequestError> {
        let mut replicator = lock(&self.replicator);
        let lease = replicator.default_lease();
        replicator.request_lock(element, lease, self.clock.now())
    }

    /// Request `element` for the local user for `lease`.
    pub fn request_lock_for(
        &self,
        element: ElementId,
        lease: Duration,
    ) -> Result<LockOutcome, LockRequestError> {
        lock(&self.replicator).request_lock(element, lease, self.clock.now())
    }

    pub fn release_lock(&self, element: ElementId) -> bool {
        lock(&self.replicator).release_lock(element, self.clock.now())
    }

    pub fn withdraw_request(&self, element: ElementId) -> bool {
        lock(&self.replicator).withdraw_request(element, self.clock.now())
    }

    pub fn send_wire_preview(
        &self,
        element: ElementId,
        pin_name: &str,
        start: Position,
        end: Position,
    ) -> Result<SendOutcome, SendError> {
        lock(&self.replicator).send_wire_preview(element, pin_name, start, end, self.clock.now())
    }

    pub fn send_node_operation(&self, operation: NodeOperation) -> Result<SendOutcome, SendError> {
        lock(&self.replicator).send_node_operation(operation, self.clock.now())
    }

    pub fn send_heartbeat(&self) -> SendOutcome {
        lock(&self.replicator).send_heartbeat(self.clock.now())
    }

    /// Process a message the host received outside of the transport's `recv`.
    pub fn handle_message(&self, message: Message) -> Result<(), InboundError> {
        lock(&self.replicator).handle_message(message, self.clock.now())
    }

    /// Sweep the lock table now, without waiting for the ticker. Returns the number of leases that
    /// expired.
    pub fn tick(&self) -> usize {
        lock(&self.replicator).tick(self.clock.now())
    }

    pub fn is_locked(&self, element: ElementId) -> bool {
        lock(&self.replicator).is_locked(element, self.clock.now())
    }

    /// Whether the local user may modify `element`.
    pub fn can_modify(&self, element: ElementId) -> bool {
        let replicator = lock(&self.replicator);
        let me = replicator.me().clone();
        replicator.can_modify(element, &me, self.clock.now())
    }

    pub fn lock_owner(&self, element: ElementId) -> Option<UserId> {
        lock(&self.replicator).lock_owner(element, self.clock.now())
    }

    pub fn lock_state(&self, element: ElementId) -> LockState {
        lock(&self.replicator).lock_state(element, self.clock.now())
    }

    pub fn lock_record(&self, element: ElementId) -> Option<LockRecord> {
        lock(&self.replicator).lock_record(element, self.clock.now())
    }

    pub fn time_remaining(&self, element: ElementId) -> Duration {
        lock(&self.replicator).time_remaining(element, self.clock.now())
    }

    pub fn queue_position(&self, element: ElementId, user: &UserId) -> Option<usize> {
        lock(&self.replicator).queue_position(element, user)
    }

    pub fn locks_held_by(&self, user: &UserId) -> Vec<LockRecord> {
        lock(&self.replicator).locks_held_by(user, self.clock.now())
    }

    /// Release every lock of `user` and withdraw their queued requests.
    pub fn disconnect_user(&self, user: &UserId) -> usize {
        lock(&self.replicator).disconnect_user(user, self.clock.now())
    }

    pub fn clear_all(&self) -> usize {
        lock(&self.replicator).clear_all(self.clock.now())
    }

    /// Remote users seen since the session started, ordered by id.
    pub fn connected_users(&self) -> Vec<UserId> {
        lock(&self.replicator).connected_users()
    }

    pub fn throttle_stats(&self, kind: MessageKind) -> ThrottleStats {
        let replicator = lock(&self.replicator);
        replicator.throttle_stats(replicator.me(), kind)
    }

    pub fn set_throttle_interval(&self, kind: MessageKind, interval: Duration) {
        lock(&self.replicator)
            .throttler_mut()
            .set_interval(kind, interval)
    }

    pub fn set_throttle_enabled(&self, kind: MessageKind, enabled: bool) {
        lock(&self.replicator)
            .throttler_mut()
            .set_enabled(kind, enabled)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// A human-readable summary of the session's metrics.
    pub fn metrics_report(&self) -> String {
        self.metrics.report()
    }

    /// Run `f` on the session's [`Replicator`] while holding its mutex.
    pub fn with_replicator<R>(&self, f: impl FnOnce(&mut Replicator<T>) -> R) -> R {
        f(&mut lock(&self.replicator))
    }

    /// Register `handler` to be invoked after every event of type `E`, after the handlers that are
    /// already registered.
    ///
    /// Handlers run on the event bus thread and must not subscribe or unsubscribe handlers themselves.
    pub fn subscribe<E: HandledEvent>(
        &self,
        handler: impl Fn(&E) + Send + 'static,
    ) -> SubscriptionId {
        lock(&self.event_handlers).subscribe(Box::new(handler) as HandlerPtr<E>)
    }

    /// Remove the handler registered as `id`. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.event_handlers).unsubscribe(id)
    }
}

impl<T: Transport + 'static> Drop for Session<T> {
    fn drop(&mut self) {
        // The ticker and the poller publish events, so the event bus stops last to deliver them.
        lock(&self.replicator).leave(self.clock.now());

        let _ = self.ticker_shutdown.send(());
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }

        let _ = self.event_bus_shutdown.send(());
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
