/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bulk Synchronous Parallel: every round is a barrier.
//!
//! Adds sent during the round currently being synchronized (the min clock) are held back, and only
//! applied once every worker has clocked out of that round. A Get from a worker that is still in the
//! min clock round is answered immediately, since no Add of that round has been applied yet. A Get
//! from a worker that already finished the round is deferred until the round closes, and then sees
//! every Add of the round.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use super::{ConsistencyModel, ModelError, ModelState, ProtocolViolation, ReplyHandle};
use crate::{
    events::{BufferGetEvent, Event},
    messages::Message,
    pending_buffer::PendingBuffer,
    storage::Storage,
    types::{ClockValue, TableId, WorkerId},
};

pub struct BspModel {
    state: ModelState,
    add_buffer: Vec<Message>,
    get_buffer: PendingBuffer,
}

impl BspModel {
    pub fn new(table_id: TableId, storage: Box<dyn Storage>, reply: ReplyHandle) -> Self {
        Self {
            state: ModelState::new(table_id, storage, reply),
            add_buffer: Vec::new(),
            get_buffer: PendingBuffer::new(),
        }
    }

    /// Number of Adds waiting for the current round to close.
    pub fn add_pending_size(&self) -> usize {
        self.add_buffer.len()
    }

    /// Number of Gets waiting for a round to close.
    pub fn get_pending_size(&self) -> usize {
        self.get_buffer.total_size()
    }
}

impl ConsistencyModel for BspModel {
    fn table_id(&self) -> TableId {
        self.state.table_id
    }

    fn clock(&mut self, msg: Message) -> Result<(), ModelError> {
        let Some(min_clock) = self.state.advance(msg.sender())? else {
            return Ok(());
        };

        for add in std::mem::take(&mut self.add_buffer) {
            self.state.storage.add(&add)?;
        }
        for get in self.get_buffer.pop(min_clock) {
            self.state.reply_get(&get)?;
        }
        self.state.storage.finish_iter();
        Ok(())
    }

    fn add(&mut self, msg: Message) -> Result<(), ModelError> {
        let worker = msg.sender();
        let progress = self.state.progress(worker)?;
        let min_clock = self.state.min_clock();
        if progress != min_clock {
            return Err(ProtocolViolation::AddAtWrongProgress { worker, progress, expected: min_clock }.into());
        }
        self.add_buffer.push(msg);
        Ok(())
    }

    fn get(&mut self, msg: Message) -> Result<(), ModelError> {
        let worker = msg.sender();
        let progress = self.state.progress(worker)?;
        let min_clock = self.state.min_clock();
        if progress == min_clock {
            return self.state.reply_get(&msg);
        }
        if progress < min_clock {
            return Err(ProtocolViolation::GetAtWrongProgress { worker, progress, min_clock }.into());
        }

        log::trace!("Table {}: buffering Get from worker {} until {}.", self.state.table_id, worker, progress);
        self.get_buffer.push(progress, msg);
        Event::publish(
            &self.state.event_publisher,
            Event::BufferGet(BufferGetEvent {
                timestamp: SystemTime::now(),
                table: self.state.table_id,
                worker,
                release_at: progress,
            }),
        );
        Ok(())
    }

    fn reset_worker(&mut self, msg: Message) -> Result<(), ModelError> {
        self.add_buffer.clear();
        self.get_buffer.clear();
        self.state.reset_worker(&msg)
    }

    fn progress(&self, worker: WorkerId) -> Result<ClockValue, ModelError> {
        self.state.progress(worker)
    }

    fn min_clock(&self) -> ClockValue {
        self.state.min_clock()
    }

    fn set_event_publisher(&mut self, event_publisher: Option<Sender<Event>>) {
        self.state.event_publisher = event_publisher
    }
}
