/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Asynchronous Parallel: Adds are applied and Gets are answered as soon as they arrive.
//!
//! Clocks still advance the progress tracker, so that the min clock of an ASP table remains
//! observable, but they never block or release anything.

use std::sync::mpsc::Sender;

use super::{ConsistencyModel, ModelError, ModelState, ReplyHandle};
use crate::{
    events::Event,
    messages::Message,
    storage::Storage,
    types::{ClockValue, TableId, WorkerId},
};

pub struct AspModel {
    state: ModelState,
}

impl AspModel {
    pub fn new(table_id: TableId, storage: Box<dyn Storage>, reply: ReplyHandle) -> Self {
        Self { state: ModelState::new(table_id, storage, reply) }
    }
}

impl ConsistencyModel for AspModel {
    fn table_id(&self) -> TableId {
        self.state.table_id
    }

    fn clock(&mut self, msg: Message) -> Result<(), ModelError> {
        self.state.advance(msg.sender())?;
        Ok(())
    }

    fn add(&mut self, msg: Message) -> Result<(), ModelError> {
        self.state.check_valid(msg.sender())?;
        Ok(self.state.storage.add(&msg)?)
    }

    fn get(&mut self, msg: Message) -> Result<(), ModelError> {
        self.state.check_valid(msg.sender())?;
        self.state.reply_get(&msg)
    }

    fn reset_worker(&mut self, msg: Message) -> Result<(), ModelError> {
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
