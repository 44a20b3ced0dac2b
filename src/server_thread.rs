/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-partition dispatch loop.
//!
//! Every partition (shard) of the key space is served by exactly one [`ServerThread`]. The thread owns
//! the [consistency models](crate::consistency) of every table hosted on the partition, and is their
//! only user: there is no shared mutable state between partitions, and no locking inside the
//! consistency engine. The only synchronization point is the partition's inbound queue.
//!
//! The dispatch loop blocks on the inbound queue, routes every message to the model registered for its
//! table, and then by flag to Clock/Add/Get/ResetWorker. It stops on receiving a
//! [`Exit`](crate::messages::Flag::Exit) message. Arrival order on the queue need not match the
//! logical clock order of the messages: the models' own buffers impose the ordering they require.
//!
//! ## Starting a server thread
//!
//! ```ignore
//! let mut server_thread = ServerThread::new(
//!     ServerThreadSpec::builder()
//!         .server_id(ServerId::new(0))
//!         .log_events(true)
//!         .on_advance_min_clock(advance_min_clock_handler)
//!         .build()
//! );
//! server_thread.register_model(model)?;
//! server_thread.start()?;
//!
//! let inbound_queue = server_thread.inbound_queue();
//! inbound_queue.send(msg)?;
//!
//! server_thread.stop()?;
//! ```
//!
//! ## Errors
//!
//! Protocol violations are fatal to the partition: when a model returns an error, the dispatch loop
//! logs it, stops, and reports it as the result of [`ServerThread::stop`].

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use typed_builder::TypedBuilder;

use crate::{
    config::{ConfigError, TableConfiguration},
    consistency::{ConsistencyModel, ModelError, ReplyHandle},
    event_bus::{start_event_bus, EventHandlers, HandlerPtr},
    events::*,
    messages::{Flag, Message},
    storage::Value,
    types::{KeyRange, ServerId, TableId},
};

/// Stores the parameters and event handlers of a [`ServerThread`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [ServerThreadSpec]. On the builder call the following methods to construct a valid [ServerThreadSpec].

    Required:
    - `.server_id(...)`

    Optional:
    - `.log_events(...)`
    - `.on_receive_clock(...)`
    - `.on_advance_min_clock(...)`
    - `.on_reset_worker(...)`
    - `.on_reply_get(...)`
    - `.on_buffer_get(...)`
    - `.on_forward_get(...)`
    - `.on_park_get(...)`
    - `.on_park_clock(...)`
"
))]
pub struct ServerThreadSpec {
    #[builder(setter(doc = "Set the id of the partition served by the thread. Required."))]
    server_id: ServerId,
    #[builder(default = false, setter(doc = "Enable logging of events? Optional, defaults to false."))]
    log_events: bool,
    // Optional handlers
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveClockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveClockEvent>),
    doc = "Register a handler closure to be invoked after a worker's Clock is applied. Optional."))]
    on_receive_clock: Option<HandlerPtr<ReceiveClockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AdvanceMinClockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AdvanceMinClockEvent>),
    doc = "Register a handler closure to be invoked after the min clock of a table advances. Optional."))]
    on_advance_min_clock: Option<HandlerPtr<AdvanceMinClockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ResetWorkerEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ResetWorkerEvent>),
    doc = "Register a handler closure to be invoked after the workers of a table are reset. Optional."))]
    on_reset_worker: Option<HandlerPtr<ResetWorkerEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReplyGetEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReplyGetEvent>),
    doc = "Register a handler closure to be invoked after a Get reply is pushed onto the reply queue. Optional."))]
    on_reply_get: Option<HandlerPtr<ReplyGetEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BufferGetEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BufferGetEvent>),
    doc = "Register a handler closure to be invoked after a Get is buffered until a min clock. Optional."))]
    on_buffer_get: Option<HandlerPtr<BufferGetEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ForwardGetEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ForwardGetEvent>),
    doc = "Register a handler closure to be invoked after a speculative Get is forwarded onto a conflicting record. Optional."))]
    on_forward_get: Option<HandlerPtr<ForwardGetEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ParkGetEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ParkGetEvent>),
    doc = "Register a handler closure to be invoked after a too fast Get is parked. Optional."))]
    on_park_get: Option<HandlerPtr<ParkGetEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ParkClockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ParkClockEvent>),
    doc = "Register a handler closure to be invoked after an early Clock is parked. Optional."))]
    on_park_clock: Option<HandlerPtr<ParkClockEvent>>,
}

/// A handle to the dispatch loop of one partition. When this value is dropped, the dispatch loop and
/// its event bus are gracefully shut down.
pub struct ServerThread {
    server_id: ServerId,
    models: BTreeMap<TableId, Box<dyn ConsistencyModel>>,
    event_handlers: Option<EventHandlers>,
    inbound_sender: Sender<Message>,
    inbound_receiver: Option<Receiver<Message>>,
    dispatch_loop: Option<JoinHandle<Result<(), DispatchError>>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl ServerThread {
    pub fn new(spec: ServerThreadSpec) -> Self {
        let event_handlers = EventHandlers::new(
            spec.log_events,
            spec.on_receive_clock,
            spec.on_advance_min_clock,
            spec.on_reset_worker,
            spec.on_reply_get,
            spec.on_buffer_get,
            spec.on_forward_get,
            spec.on_park_get,
            spec.on_park_clock,
        );
        let (inbound_sender, inbound_receiver) = mpsc::channel();

        Self {
            server_id: spec.server_id,
            models: BTreeMap::new(),
            event_handlers: Some(event_handlers),
            inbound_sender,
            inbound_receiver: Some(inbound_receiver),
            dispatch_loop: None,
            event_bus: None,
            event_bus_shutdown: None,
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Register `model` to serve its table on this partition. Must be called before
    /// [`start`](Self::start).
    pub fn register_model(&mut self, model: Box<dyn ConsistencyModel>) -> Result<(), DispatchError> {
        if self.inbound_receiver.is_none() {
            return Err(DispatchError::AlreadyStarted { server_id: self.server_id });
        }
        let table_id = model.table_id();
        if self.models.contains_key(&table_id) {
            return Err(DispatchError::DuplicateTable { server_id: self.server_id, table_id });
        }
        self.models.insert(table_id, model);
        Ok(())
    }

    /// Get a handle for pushing messages onto this partition's inbound queue.
    pub fn inbound_queue(&self) -> Sender<Message> {
        self.inbound_sender.clone()
    }

    /// Start the dispatch loop, and the event bus if any event handler is registered.
    pub fn start(&mut self) -> Result<(), DispatchError> {
        let inbound_receiver = self
            .inbound_receiver
            .take()
            .ok_or(DispatchError::AlreadyStarted { server_id: self.server_id })?;
        let mut models = std::mem::take(&mut self.models);

        if let Some(event_handlers) = self.event_handlers.take().filter(|handlers| !handlers.is_empty()) {
            let (event_publisher, event_subscriber) = mpsc::channel();
            models
                .values_mut()
                .for_each(|model| model.set_event_publisher(Some(event_publisher.clone())));

            let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
            self.event_bus = Some(start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver));
            self.event_bus_shutdown = Some(event_bus_shutdown);
        }

        let server_id = self.server_id;
        log::debug!("Server thread {} starting with {} tables.", server_id, models.len());
        self.dispatch_loop = Some(thread::spawn(move || dispatch(server_id, models, inbound_receiver)));
        Ok(())
    }

    /// Check whether the dispatch loop is running (or has stopped on its own because of an error, but
    /// has not been joined yet).
    pub fn is_running(&self) -> bool {
        self.dispatch_loop.is_some()
    }

    /// Stop the dispatch loop and wait for it to exit.
    ///
    /// Returns the error that stopped the loop early, if any. Calling `stop` on a server thread that is
    /// not running is a no-op.
    pub fn stop(&mut self) -> Result<(), DispatchError> {
        let Some(dispatch_loop) = self.dispatch_loop.take() else {
            return Ok(());
        };

        // The loop may already have stopped on an error, in which case its receiver is gone.
        let _ = self.inbound_sender.send(Message::exit(self.server_id));
        let result = dispatch_loop
            .join()
            .unwrap_or(Err(DispatchError::Panicked { server_id: self.server_id }));

        if let Some(event_bus_shutdown) = self.event_bus_shutdown.take() {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("Event bus of server thread {} panicked.", self.server_id);
            }
        }

        log::debug!("Server thread {} stopped.", self.server_id);
        result
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            log::error!("Server thread {} stopped with error: {:?}", self.server_id, error);
        }
    }
}

/// Body of the dispatch loop thread.
fn dispatch(
    server_id: ServerId,
    mut models: BTreeMap<TableId, Box<dyn ConsistencyModel>>,
    inbound_receiver: Receiver<Message>,
) -> Result<(), DispatchError> {
    // The ServerThread holds a sender for as long as the loop can be stopped, so a disconnect only
    // happens once nothing can send to this partition anymore.
    while let Ok(msg) = inbound_receiver.recv() {
        if msg.flag() == Flag::Exit {
            log::trace!("Server thread {} received Exit.", server_id);
            return Ok(());
        }

        let table_id = msg.table_id();
        let Some(model) = models.get_mut(&table_id) else {
            log::error!("Server thread {} received a message for unknown table {}.", server_id, table_id);
            return Err(DispatchError::UnknownTable { server_id, table_id });
        };

        if let Err(error) = model.handle(msg) {
            log::error!("Server thread {}, table {}: {:?}", server_id, table_id, error);
            return Err(DispatchError::ModelError { server_id, table_id, error });
        }
    }
    Ok(())
}

/// A set of server threads that share one reply queue.
///
/// Tables created through the group are sharded across all of its partitions: each partition gets its
/// own model, bound to its own slice of the table's key range.
pub struct ServerThreadGroup {
    server_threads: Vec<ServerThread>,
    reply_sender: Sender<Message>,
    reply_receiver: Receiver<Message>,
}

impl ServerThreadGroup {
    /// Create one server thread, without event handlers, for every id in `server_ids`.
    pub fn new(server_ids: &[ServerId]) -> Self {
        Self::from_specs(
            server_ids
                .iter()
                .map(|server_id| ServerThreadSpec::builder().server_id(*server_id).build())
                .collect(),
        )
    }

    /// Create one server thread for every spec in `specs`.
    pub fn from_specs(specs: Vec<ServerThreadSpec>) -> Self {
        let (reply_sender, reply_receiver) = mpsc::channel();
        Self {
            server_threads: specs.into_iter().map(ServerThread::new).collect(),
            reply_sender,
            reply_receiver,
        }
    }

    /// Get a handle for pushing onto the reply queue shared by every partition in this group.
    pub fn reply_handle(&self) -> ReplyHandle {
        ReplyHandle::new(self.reply_sender.clone())
    }

    /// Get the receiving end of the shared reply queue.
    pub fn reply_receiver(&self) -> &Receiver<Message> {
        &self.reply_receiver
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.server_threads.iter().map(|server_thread| server_thread.server_id()).collect()
    }

    /// Get a handle for pushing onto the inbound queue of partition `server_id`.
    pub fn inbound_queue(&self, server_id: ServerId) -> Option<Sender<Message>> {
        self.server_threads
            .iter()
            .find(|server_thread| server_thread.server_id() == server_id)
            .map(|server_thread| server_thread.inbound_queue())
    }

    /// Create the table described by `config` on every partition of this group.
    ///
    /// If `key_range` is given, it is split into one contiguous slice per partition, in the order the
    /// partitions were given to the group. Returns the slice owned by each partition.
    pub fn create_table<V: Value>(
        &mut self,
        config: &TableConfiguration,
        key_range: Option<KeyRange>,
    ) -> Result<Vec<(ServerId, Option<KeyRange>)>, DispatchError> {
        let slices: Vec<Option<KeyRange>> = match key_range {
            Some(key_range) => key_range.split(self.server_threads.len()).into_iter().map(Some).collect(),
            None => vec![None; self.server_threads.len()],
        };

        let reply = self.reply_handle();
        let mut partitions = Vec::with_capacity(slices.len());
        for (server_thread, slice) in self.server_threads.iter_mut().zip(slices) {
            let model = config.build_model::<V>(slice, reply.clone())?;
            server_thread.register_model(model)?;
            partitions.push((server_thread.server_id(), slice));
        }
        Ok(partitions)
    }

    pub fn start_all(&mut self) -> Result<(), DispatchError> {
        self.server_threads.iter_mut().try_for_each(|server_thread| server_thread.start())
    }

    /// Stop every server thread. Returns the first error, after all threads have been stopped.
    pub fn stop_all(&mut self) -> Result<(), DispatchError> {
        let results: Vec<Result<(), DispatchError>> =
            self.server_threads.iter_mut().map(|server_thread| server_thread.stop()).collect();
        results.into_iter().collect()
    }
}

/// Enumerates the ways a [`ServerThread`] can fail.
#[derive(Debug)]
pub enum DispatchError {
    /// A second model was registered for `table_id` on the same partition.
    DuplicateTable { server_id: ServerId, table_id: TableId },

    /// A message arrived for a table that has no model on this partition.
    UnknownTable { server_id: ServerId, table_id: TableId },

    /// A model was registered, or the loop started, after the loop was already started.
    AlreadyStarted { server_id: ServerId },

    /// The model of `table_id` failed to handle a message.
    ModelError { server_id: ServerId, table_id: TableId, error: ModelError },

    /// See [`ConfigError`].
    ConfigError(ConfigError),

    /// The dispatch loop thread panicked.
    Panicked { server_id: ServerId },
}

impl From<ConfigError> for DispatchError {
    fn from(value: ConfigError) -> Self {
        DispatchError::ConfigError(value)
    }
}
