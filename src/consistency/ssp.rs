/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Stale Synchronous Parallel with staleness `s`.
//!
//! Adds are applied immediately. A Get from a worker at progress `p` is answered immediately if
//! `p - min_clock <= s`. Otherwise it is buffered, and answered exactly when the min clock first
//! reaches `p - s`.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use super::{ConsistencyModel, ModelError, ModelState, ReplyHandle};
use crate::{
    events::{BufferGetEvent, Event},
    messages::Message,
    pending_buffer::PendingBuffer,
    storage::Storage,
    types::{ClockValue, TableId, WorkerId},
};

pub struct SspModel {
    state: ModelState,
    staleness: u64,
    buffer: PendingBuffer,
}

impl SspModel {
    pub fn new(table_id: TableId, storage: Box<dyn Storage>, reply: ReplyHandle, staleness: u64) -> Self {
        Self {
            state: ModelState::new(table_id, storage, reply),
            staleness,
            buffer: PendingBuffer::new(),
        }
    }

    /// Number of Gets waiting for the min clock to reach `clock`.
    pub fn pending_size(&self, clock: ClockValue) -> usize {
        self.buffer.size(clock)
    }
}

impl ConsistencyModel for SspModel {
    fn table_id(&self) -> TableId {
        self.state.table_id
    }

    fn clock(&mut self, msg: Message) -> Result<(), ModelError> {
        if let Some(min_clock) = self.state.advance(msg.sender())? {
            for get in self.buffer.pop(min_clock) {
                self.state.reply_get(&get)?;
            }
            self.state.storage.finish_iter();
        }
        Ok(())
    }

    fn add(&mut self, msg: Message) -> Result<(), ModelError> {
        self.state.check_valid(msg.sender())?;
        Ok(self.state.storage.add(&msg)?)
    }

    fn get(&mut self, msg: Message) -> Result<(), ModelError> {
        let worker = msg.sender();
        let progress = self.state.progress(worker)?;
        if progress - self.state.min_clock() <= self.staleness {
            return self.state.reply_get(&msg);
        }

        let release_at = progress - self.staleness;
        log::trace!("Table {}: buffering Get from worker {} until {}.", self.state.table_id, worker, release_at);
        self.buffer.push(release_at, msg);
        Event::publish(
            &self.state.event_publisher,
            Event::BufferGet(BufferGetEvent {
                timestamp: SystemTime::now(),
                table: self.state.table_id,
                worker,
                release_at,
            }),
        );
        Ok(())
    }

    fn reset_worker(&mut self, msg: Message) -> Result<(), ModelError> {
        self.buffer.clear();
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
