/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Consistency models: the rules that decide when an Add is applied and when a Get is answered.
//!
//! Every table hosted on a partition is served by one [`ConsistencyModel`]. A model composes a
//! [`Storage`], a [`ProgressTracker`], and whatever buffers its rules need, behind a uniform
//! Clock/Add/Get/ResetWorker interface:
//!
//! |Model|Add|Get|Clock|
//! |---|---|---|---|
//! |[BSP](bsp::BspModel)|buffered until the round ends|answered if the sender is at the min clock, otherwise buffered|on min clock advance, apply buffered Adds and answer buffered Gets|
//! |[ASP](asp::AspModel)|immediate|immediate|only advances the sender|
//! |[SSP](ssp::SspModel)|immediate|answered if the sender is at most `staleness` rounds ahead of the min clock, otherwise buffered|on min clock advance, answer the Gets buffered for the new min clock|
//! |[SparseSSP](sparse_ssp::SparseSspModel)|immediate|answered early when no conflicting update can still happen|see the module documentation|
//!
//! Every operation validates that the sender is registered on the table. Violations of the protocol
//! between workers and servers are reported as [`ModelError`]s rather than aborting the process, so
//! that callers can choose how to react.
//!
//! Completed Get replies, and the acknowledgements of ResetWorker requests, are pushed onto the
//! partition's shared reply queue through a [`ReplyHandle`].

pub mod asp;
pub mod bsp;
pub mod sparse_ssp;
pub mod ssp;

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::{
    conflict_recorder::ConflictError,
    events::{AdvanceMinClockEvent, Event, ReceiveClockEvent, ReplyGetEvent, ResetWorkerEvent},
    messages::{Flag, Message, MessageError},
    progress_tracker::{ProgressError, ProgressTracker},
    storage::{Storage, StorageError},
    types::{ClockValue, TableId, WorkerId},
};

/// The interface shared by every consistency model.
pub trait ConsistencyModel: Send {
    /// The table this model serves.
    fn table_id(&self) -> TableId;

    /// Handle a Clock: the sender finished its current round.
    fn clock(&mut self, msg: Message) -> Result<(), ModelError>;

    /// Handle an Add.
    fn add(&mut self, msg: Message) -> Result<(), ModelError>;

    /// Handle a Get. The reply may be pushed immediately or deferred.
    fn get(&mut self, msg: Message) -> Result<(), ModelError>;

    /// Replace the set of registered workers with the worker ids in `payload[0]`, and acknowledge.
    fn reset_worker(&mut self, msg: Message) -> Result<(), ModelError>;

    /// Get the current clock of `worker`.
    fn progress(&self, worker: WorkerId) -> Result<ClockValue, ModelError>;

    /// Get the current min clock of the table.
    fn min_clock(&self) -> ClockValue;

    /// Set the channel that this model publishes [events](crate::events) onto.
    fn set_event_publisher(&mut self, event_publisher: Option<Sender<Event>>);

    /// Route `msg` to the operation its flag names.
    fn handle(&mut self, msg: Message) -> Result<(), ModelError> {
        match msg.flag() {
            Flag::Clock => self.clock(msg),
            Flag::Add => self.add(msg),
            Flag::Get => self.get(msg),
            Flag::ResetWorker => self.reset_worker(msg),
            Flag::Exit => Err(ProtocolViolation::UnexpectedFlag { flag: Flag::Exit }.into()),
        }
    }
}

/// Handle for pushing replies onto the reply queue shared by every table on a partition.
#[derive(Clone)]
pub struct ReplyHandle {
    reply_queue: Sender<Message>,
}

impl ReplyHandle {
    pub fn new(reply_queue: Sender<Message>) -> Self {
        Self { reply_queue }
    }

    pub(crate) fn send(&self, reply: Message) -> Result<(), ModelError> {
        self.reply_queue.send(reply).map_err(|_| ModelError::ReplyQueueClosed)
    }
}

/// State that every consistency model owns, and the operations they perform on it in the same way.
pub(crate) struct ModelState {
    pub(crate) table_id: TableId,
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) progress_tracker: ProgressTracker,
    pub(crate) reply: ReplyHandle,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl ModelState {
    pub(crate) fn new(table_id: TableId, storage: Box<dyn Storage>, reply: ReplyHandle) -> Self {
        Self {
            table_id,
            storage,
            progress_tracker: ProgressTracker::new(),
            reply,
            event_publisher: None,
        }
    }

    /// Fail with [`ProgressError::InvalidWorker`] if `worker` is not registered.
    pub(crate) fn check_valid(&self, worker: WorkerId) -> Result<(), ModelError> {
        Ok(self.progress_tracker.check_valid(worker)?)
    }

    pub(crate) fn progress(&self, worker: WorkerId) -> Result<ClockValue, ModelError> {
        Ok(self.progress_tracker.progress(worker)?)
    }

    pub(crate) fn min_clock(&self) -> ClockValue {
        self.progress_tracker.min_clock()
    }

    /// Advance `worker`'s clock, publishing the resulting events. Returns the new min clock if it
    /// moved.
    pub(crate) fn advance(&mut self, worker: WorkerId) -> Result<Option<ClockValue>, ModelError> {
        let updated_min_clock = self.progress_tracker.advance(worker)?;
        let progress = self.progress_tracker.progress(worker)?;
        log::trace!("Table {}: worker {} advanced to {}.", self.table_id, worker, progress);
        Event::publish(
            &self.event_publisher,
            Event::ReceiveClock(ReceiveClockEvent {
                timestamp: SystemTime::now(),
                table: self.table_id,
                worker,
                progress,
            }),
        );

        if let Some(min_clock) = updated_min_clock {
            log::debug!("Table {}: min clock advanced to {}.", self.table_id, min_clock);
            Event::publish(
                &self.event_publisher,
                Event::AdvanceMinClock(AdvanceMinClockEvent {
                    timestamp: SystemTime::now(),
                    table: self.table_id,
                    min_clock,
                }),
            );
        }
        Ok(updated_min_clock)
    }

    /// Read the keys of `msg` from storage and push the reply.
    pub(crate) fn reply_get(&mut self, msg: &Message) -> Result<(), ModelError> {
        let reply = self.storage.get(msg)?;
        self.reply.send(reply)?;
        Event::publish(
            &self.event_publisher,
            Event::ReplyGet(ReplyGetEvent {
                timestamp: SystemTime::now(),
                table: self.table_id,
                recver: msg.sender(),
                version: msg.meta().version,
            }),
        );
        Ok(())
    }

    /// Re-register exactly the workers listed in `msg`, and push the acknowledgement.
    pub(crate) fn reset_worker(&mut self, msg: &Message) -> Result<(), ModelError> {
        msg.expect_payloads(1)?;
        let workers = msg.worker_ids()?;
        self.progress_tracker.init(&workers);
        log::debug!("Table {}: reset to {} workers.", self.table_id, self.progress_tracker.num_workers());

        self.reply.send(Message::reset_worker_ack(msg))?;
        Event::publish(
            &self.event_publisher,
            Event::ResetWorker(ResetWorkerEvent {
                timestamp: SystemTime::now(),
                table: self.table_id,
                workers,
            }),
        );
        Ok(())
    }
}

/// Enumerates the ways a [`ConsistencyModel`] operation can fail.
#[derive(Debug)]
pub enum ModelError {
    /// See [`ProtocolViolation`].
    ProtocolViolation(ProtocolViolation),

    /// See [`ProgressError`].
    ProgressError(ProgressError),

    /// See [`StorageError`].
    StorageError(StorageError),

    /// See [`ConflictError`].
    ConflictError(ConflictError),

    /// See [`MessageError`].
    MessageError(MessageError),

    /// The receiving end of the reply queue was dropped.
    ReplyQueueClosed,
}

/// A message that is well-formed, but that the sender was not allowed to send at its current
/// progress.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Under BSP, an Add must be sent in the round that is currently being synchronized. Under
    /// SparseSSP, an Add's version must equal the sender's progress.
    AddAtWrongProgress { worker: WorkerId, progress: ClockValue, expected: ClockValue },

    /// Under BSP, a Get must be sent at or after the min clock.
    GetAtWrongProgress { worker: WorkerId, progress: ClockValue, min_clock: ClockValue },

    /// A Clock arrived more than one round past the speculation window.
    ClockTooFarAhead { worker: WorkerId, version: ClockValue, min_clock: ClockValue },

    /// A Get arrived for a round that the sender has already finished.
    GetBehindProgress { worker: WorkerId, version: ClockValue, progress: ClockValue },

    /// A Get became due at a version that is outside of the window the model can serve.
    GetBeyondWindow { worker: WorkerId, version: ClockValue, min_clock: ClockValue },

    /// A message with `flag` was routed to a model.
    UnexpectedFlag { flag: Flag },
}

impl From<ProtocolViolation> for ModelError {
    fn from(value: ProtocolViolation) -> Self {
        ModelError::ProtocolViolation(value)
    }
}

impl From<ProgressError> for ModelError {
    fn from(value: ProgressError) -> Self {
        ModelError::ProgressError(value)
    }
}

impl From<StorageError> for ModelError {
    fn from(value: StorageError) -> Self {
        ModelError::StorageError(value)
    }
}

impl From<ConflictError> for ModelError {
    fn from(value: ConflictError) -> Self {
        ModelError::ConflictError(value)
    }
}

impl From<MessageError> for ModelError {
    fn from(value: MessageError) -> Self {
        ModelError::MessageError(value)
    }
}
