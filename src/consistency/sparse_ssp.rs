/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Stale Synchronous Parallel with sparse speculation: staleness `s`, speculation `k`.
//!
//! Plain SSP makes a Get at version `v` wait until `v - min_clock <= s`. SparseSSP lets Gets race up to
//! `k` further rounds ahead, as long as no data dependency would be violated.
//!
//! ## Registering Gets ahead of time
//!
//! Workers send their Gets *before* they are due: a Get at version `v` can arrive while the sender is
//! still at some progress `p <= v`. On arrival, the Get's key set is registered with the
//! [`ConflictRecorder`] at `(v, key)`, which announces that the sender may still write those keys
//! until it finishes round `v`. The Get itself is queued until the sender's progress reaches `v`.
//!
//! ## Deciding what to do with a due Get
//!
//! When the sender's progress reaches `v` (either on arrival, or when the sender clocks into round
//! `v`), the Get is classified against the current min clock `m`:
//! 1. `v <= m + s`: answered immediately, exactly like SSP.
//! 2. `m + s < v <= m + s + k`: the speculative zone. If some requested key still has a nonzero
//!    reference count at a version in `[m, v - s - 1]`, the Get is *forwarded*: parked on the newest
//!    such record, and reconsidered when that record's count drops to zero. Otherwise it is answered
//!    immediately.
//! 3. `v == m + s + k + 1`: too fast. Parked until the next min clock advance.
//!
//! ## Clocks
//!
//! A Clock retires the sender's registrations for every round it has now finished, which releases
//! forwarded Gets whose records dropped to zero. When the min clock advances, the records of the
//! round that just closed are evicted, the too-fast Gets are reconsidered, and Clocks that arrived too
//! early (at version `m + s + k + 1`) are replayed.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use super::{ConsistencyModel, ModelError, ModelState, ProtocolViolation, ReplyHandle};
use crate::{
    conflict_recorder::{ConflictRecorder, FutureKeySet},
    events::{Event, ForwardGetEvent, ParkClockEvent, ParkGetEvent},
    messages::Message,
    pending_buffer::SparsePendingBuffer,
    storage::Storage,
    types::{ClockValue, Key, TableId, WorkerId},
};

pub struct SparseSspModel {
    state: ModelState,
    staleness: u64,
    speculation: u64,
    recorder: Box<dyn ConflictRecorder>,
    future_keys: FutureKeySet,
    /// Gets registered ahead of time, keyed by their version and sender.
    future_msgs: SparsePendingBuffer,
    too_fast_buffer: Vec<Message>,
    parked_clocks: Vec<Message>,
}

impl SparseSspModel {
    pub fn new(
        table_id: TableId,
        storage: Box<dyn Storage>,
        recorder: Box<dyn ConflictRecorder>,
        reply: ReplyHandle,
        staleness: u64,
        speculation: u64,
    ) -> Self {
        Self {
            state: ModelState::new(table_id, storage, reply),
            staleness,
            speculation,
            recorder,
            future_keys: FutureKeySet::new(speculation),
            future_msgs: SparsePendingBuffer::new(),
            too_fast_buffer: Vec::new(),
            parked_clocks: Vec::new(),
        }
    }

    /// Number of Gets registered ahead of time that are not due yet.
    pub fn future_get_size(&self) -> usize {
        self.future_msgs.total_size()
    }

    /// Number of Gets parked for being too fast.
    pub fn too_fast_size(&self) -> usize {
        self.too_fast_buffer.len()
    }

    /// Number of Clocks parked for arriving too early.
    pub fn parked_clock_size(&self) -> usize {
        self.parked_clocks.len()
    }

    /// The reference count of `(version, key)` in this model's conflict recorder.
    pub fn reference_count(&self, version: ClockValue, key: Key) -> Result<u32, ModelError> {
        Ok(self.recorder.reference_count(version, key)?)
    }

    /// Decide what to do with a Get whose sender has reached its version. Returns the Get back if it
    /// can be answered now.
    fn schedule(&mut self, msg: Message, min_clock: ClockValue) -> Result<Option<Message>, ModelError> {
        let version = msg.version()?;
        let worker = msg.sender();

        if version <= min_clock + self.staleness {
            return Ok(Some(msg));
        }

        if version <= min_clock + (self.staleness + self.speculation) {
            let keys = msg.keys()?;
            let newest_unsafe = version - (self.staleness + 1);
            let Some(conflict) = self.recorder.find_conflict(&keys, min_clock, newest_unsafe)? else {
                return Ok(Some(msg));
            };

            log::trace!(
                "Table {}: forwarding Get@{} from worker {} onto ({}, {}).",
                self.state.table_id, version, worker, conflict.version, conflict.key
            );
            self.recorder.forward(conflict, msg)?;
            Event::publish(
                &self.state.event_publisher,
                Event::ForwardGet(ForwardGetEvent {
                    timestamp: SystemTime::now(),
                    table: self.state.table_id,
                    worker,
                    version,
                    conflict_version: conflict.version,
                    key: conflict.key,
                }),
            );
            return Ok(None);
        }

        if version == min_clock + (self.staleness + self.speculation + 1) {
            log::trace!("Table {}: parking too fast Get@{} from worker {}.", self.state.table_id, version, worker);
            self.too_fast_buffer.push(msg);
            Event::publish(
                &self.state.event_publisher,
                Event::ParkGet(ParkGetEvent {
                    timestamp: SystemTime::now(),
                    table: self.state.table_id,
                    worker,
                    version,
                }),
            );
            return Ok(None);
        }

        Err(ProtocolViolation::GetBeyondWindow { worker, version, min_clock }.into())
    }

    /// Retire the registrations of `worker` for every round before `progress`, and return the
    /// forwarded Gets that this made answerable.
    fn retire(&mut self, worker: WorkerId, progress: ClockValue, min_clock: ClockValue) -> Result<Vec<Message>, ModelError> {
        let mut ready = Vec::new();
        for (version, keys) in self.future_keys.retire(worker, progress) {
            for msg in self.recorder.remove_record(version, &keys)? {
                if let Some(msg) = self.schedule(msg, min_clock)? {
                    ready.push(msg);
                }
            }
        }
        Ok(ready)
    }

    fn reply_all(&mut self, msgs: Vec<Message>) -> Result<(), ModelError> {
        for msg in msgs {
            self.state.reply_get(&msg)?;
        }
        Ok(())
    }
}

impl ConsistencyModel for SparseSspModel {
    fn table_id(&self) -> TableId {
        self.state.table_id
    }

    fn clock(&mut self, msg: Message) -> Result<(), ModelError> {
        let worker = msg.sender();
        self.state.check_valid(worker)?;

        // 1. Park the Clock if it arrived before the window reaches it.
        let version = msg.version()?;
        let min_clock = self.state.min_clock();
        let window_end = min_clock + (self.staleness + self.speculation + 1);
        if version > window_end {
            return Err(ProtocolViolation::ClockTooFarAhead { worker, version, min_clock }.into());
        }
        if version == window_end {
            log::trace!("Table {}: parking Clock@{} from worker {}.", self.state.table_id, version, worker);
            self.parked_clocks.push(msg);
            Event::publish(
                &self.state.event_publisher,
                Event::ParkClock(ParkClockEvent {
                    timestamp: SystemTime::now(),
                    table: self.state.table_id,
                    worker,
                    version,
                }),
            );
            return Ok(());
        }

        let updated_min_clock = self.state.advance(worker)?;
        let progress = self.state.progress(worker)?;
        let min_clock = self.state.min_clock();

        // 2. Retire the sender's finished rounds, then handle the sender's own Gets that are now due.
        let mut ready = self.retire(worker, progress, min_clock)?;
        for msg in self.future_msgs.pop(progress, worker) {
            if let Some(msg) = self.schedule(msg, min_clock)? {
                ready.push(msg);
            }
        }
        self.reply_all(ready)?;

        // 3. Close the round that the min clock just moved past.
        if let Some(min_clock) = updated_min_clock {
            self.recorder.clock_remove_record(min_clock - 1)?;

            let mut ready = Vec::new();
            for msg in std::mem::take(&mut self.too_fast_buffer) {
                if let Some(msg) = self.schedule(msg, min_clock)? {
                    ready.push(msg);
                }
            }
            self.reply_all(ready)?;
            self.state.storage.finish_iter();

            for parked_clock in std::mem::take(&mut self.parked_clocks) {
                self.clock(parked_clock)?;
            }
        }
        Ok(())
    }

    fn add(&mut self, msg: Message) -> Result<(), ModelError> {
        let worker = msg.sender();
        let progress = self.state.progress(worker)?;
        let version = msg.version()?;
        if version != progress {
            return Err(ProtocolViolation::AddAtWrongProgress { worker, progress: version, expected: progress }.into());
        }
        Ok(self.state.storage.add(&msg)?)
    }

    fn get(&mut self, msg: Message) -> Result<(), ModelError> {
        let worker = msg.sender();
        let progress = self.state.progress(worker)?;
        msg.expect_payloads(1)?;
        let version = msg.version()?;
        if version < progress {
            return Err(ProtocolViolation::GetBehindProgress { worker, version, progress }.into());
        }

        // Register in the recorder and the future key set together, or not at all.
        self.future_keys.check_capacity(worker)?;
        let keys = msg.keys()?;
        self.recorder.add_record(version, &keys)?;
        self.future_keys.push(worker, version, keys)?;

        if version == progress {
            if let Some(msg) = self.schedule(msg, self.state.min_clock())? {
                self.state.reply_get(&msg)?;
            }
        } else {
            self.future_msgs.push(version, worker, msg);
        }
        Ok(())
    }

    fn reset_worker(&mut self, msg: Message) -> Result<(), ModelError> {
        self.recorder.clear();
        self.future_keys.clear();
        self.future_msgs.clear();
        self.too_fast_buffer.clear();
        self.parked_clocks.clear();
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
