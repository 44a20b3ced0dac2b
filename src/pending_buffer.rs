/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Buffers that defer messages until a release condition holds.
//!
//! A [`PendingBuffer`] keys deferred messages by the clock value at which they become releasable. A
//! [`SparsePendingBuffer`] additionally keys them by worker, so that the messages of one worker can
//! be released independently of (and out of arrival order with) the messages of others.
//!
//! Within a single key, messages are released in the order they were pushed.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    messages::Message,
    types::{ClockValue, WorkerId},
};

#[derive(Default)]
pub struct PendingBuffer {
    buffer: BTreeMap<ClockValue, VecDeque<Message>>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self { buffer: BTreeMap::new() }
    }

    /// Defer `msg` until `clock`.
    pub fn push(&mut self, clock: ClockValue, msg: Message) {
        self.buffer.entry(clock).or_default().push_back(msg)
    }

    /// Remove and return every message deferred until `clock`.
    pub fn pop(&mut self, clock: ClockValue) -> Vec<Message> {
        self.buffer
            .remove(&clock)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Number of messages deferred until `clock`.
    pub fn size(&self, clock: ClockValue) -> usize {
        self.buffer.get(&clock).map_or(0, |msgs| msgs.len())
    }

    pub fn total_size(&self) -> usize {
        self.buffer.values().map(|msgs| msgs.len()).sum()
    }

    pub fn clear(&mut self) {
        self.buffer.clear()
    }
}

#[derive(Default)]
pub struct SparsePendingBuffer {
    buffer: BTreeMap<ClockValue, BTreeMap<WorkerId, VecDeque<Message>>>,
}

impl SparsePendingBuffer {
    pub fn new() -> Self {
        Self { buffer: BTreeMap::new() }
    }

    /// Defer `msg` from `worker` until `clock`.
    pub fn push(&mut self, clock: ClockValue, worker: WorkerId, msg: Message) {
        self.buffer
            .entry(clock)
            .or_default()
            .entry(worker)
            .or_default()
            .push_back(msg)
    }

    /// Remove and return the messages of `worker` deferred until `clock`. Messages of other workers at
    /// the same clock stay buffered.
    pub fn pop(&mut self, clock: ClockValue, worker: WorkerId) -> Vec<Message> {
        let Some(workers) = self.buffer.get_mut(&clock) else {
            return Vec::new();
        };
        let msgs = workers.remove(&worker).map(Vec::from).unwrap_or_default();
        if workers.is_empty() {
            self.buffer.remove(&clock);
        }
        msgs
    }

    /// Number of messages of `worker` deferred until `clock`.
    pub fn size(&self, clock: ClockValue, worker: WorkerId) -> usize {
        self.buffer
            .get(&clock)
            .and_then(|workers| workers.get(&worker))
            .map_or(0, |msgs| msgs.len())
    }

    pub fn total_size(&self) -> usize {
        self.buffer
            .values()
            .flat_map(|workers| workers.values())
            .map(|msgs| msgs.len())
            .sum()
    }

    pub fn clear(&mut self) {
        self.buffer.clear()
    }
}

#[cfg(test)]
fn tagged(sender: u32, version: u64) -> Message {
    use crate::types::{TableId, ThreadId};
    Message::get(ThreadId::new(sender), ThreadId::new(0), TableId::new(0), ClockValue::new(version), &[])
}

#[test]
fn pending_buffer_test() {
    let mut buffer = PendingBuffer::new();
    buffer.push(ClockValue::new(1), tagged(2, 1));
    buffer.push(ClockValue::new(1), tagged(3, 1));
    buffer.push(ClockValue::new(2), tagged(2, 2));
    assert_eq!(buffer.size(ClockValue::new(1)), 2);
    assert_eq!(buffer.size(ClockValue::new(3)), 0);
    assert_eq!(buffer.total_size(), 3);

    let released = buffer.pop(ClockValue::new(1));
    assert_eq!(released, vec![tagged(2, 1), tagged(3, 1)]);
    assert!(buffer.pop(ClockValue::new(1)).is_empty());
    assert_eq!(buffer.total_size(), 1);

    buffer.clear();
    assert_eq!(buffer.total_size(), 0);
}

#[test]
fn sparse_pending_buffer_test() {
    let (w2, w3) = (WorkerId::new(2), WorkerId::new(3));
    let mut buffer = SparsePendingBuffer::new();
    buffer.push(ClockValue::new(1), w3, tagged(3, 1));
    buffer.push(ClockValue::new(1), w2, tagged(2, 1));
    buffer.push(ClockValue::new(2), w2, tagged(2, 2));
    assert_eq!(buffer.size(ClockValue::new(1), w2), 1);
    assert_eq!(buffer.total_size(), 3);

    // Releasing worker 3 leaves worker 2's message at the same clock in place.
    assert_eq!(buffer.pop(ClockValue::new(1), w3), vec![tagged(3, 1)]);
    assert_eq!(buffer.size(ClockValue::new(1), w2), 1);
    assert!(buffer.pop(ClockValue::new(1), w3).is_empty());

    assert_eq!(buffer.pop(ClockValue::new(1), w2), vec![tagged(2, 1)]);
    assert_eq!(buffer.total_size(), 1);
    buffer.clear();
    assert_eq!(buffer.total_size(), 0);
}
