//! A stand-in for the client side of a table: builds the messages a worker would send.

use borsh::BorshSerialize;
use paramserver_rs::{
    messages::Message,
    types::{ClockValue, Key, ServerId, TableId, WorkerId},
};

#[derive(Clone, Copy)]
pub(crate) struct Worker {
    id: WorkerId,
    server: ServerId,
    table: TableId,
}

impl Worker {
    pub(crate) fn new(id: u32, table: TableId) -> Self {
        Self::on_server(id, ServerId::new(0), table)
    }

    pub(crate) fn on_server(id: u32, server: ServerId, table: TableId) -> Self {
        Self { id: WorkerId::new(id), server, table }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn to_server(&self, server: ServerId) -> Self {
        Self { server, ..*self }
    }

    pub(crate) fn add<V: BorshSerialize>(&self, version: u64, keys: &[Key], values: &[V]) -> Message {
        Message::add(self.id, self.server, self.table, ClockValue::new(version), keys, values)
    }

    pub(crate) fn get(&self, version: u64, keys: &[Key]) -> Message {
        Message::get(self.id, self.server, self.table, ClockValue::new(version), keys)
    }

    pub(crate) fn clock(&self, version: u64) -> Message {
        Message::clock(self.id, self.server, self.table, ClockValue::new(version))
    }

    pub(crate) fn reset_worker(&self, workers: &[u32]) -> Message {
        let workers: Vec<WorkerId> = workers.iter().map(|id| WorkerId::new(*id)).collect();
        Message::reset_worker(self.id, self.server, self.table, &workers)
    }
}
