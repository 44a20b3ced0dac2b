/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events emitted by consistency models, for event handling and logging.
//!
//! Note: an event for a given action indicates that the action has been completed.
//!
//! Events are published by the [dispatch loop](crate::server_thread) thread onto a channel, and
//! handled on a separate [event bus](crate::event_bus) thread, so that user-provided handlers never
//! block message processing.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::{ClockValue, Key, TableId, WorkerId};

pub enum Event {
    // Events that change the progress of a table.
    ReceiveClock(ReceiveClockEvent),
    AdvanceMinClock(AdvanceMinClockEvent),
    ResetWorker(ResetWorkerEvent),
    // Events that answer a Get.
    ReplyGet(ReplyGetEvent),
    // Events that defer a Get or a Clock.
    BufferGet(BufferGetEvent),
    ForwardGet(ForwardGetEvent),
    ParkGet(ParkGetEvent),
    ParkClock(ParkClockEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only goes away after the dispatch loop has stopped.
            let _ = event_publisher.send(event);
        }
    }
}

/// A worker's Clock was applied. `progress` is the worker's clock after the increment.
pub struct ReceiveClockEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub worker: WorkerId,
    pub progress: ClockValue,
}

/// The min clock of `table` moved forward to `min_clock`.
pub struct AdvanceMinClockEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub min_clock: ClockValue,
}

/// The set of workers registered on `table` was replaced with `workers`.
pub struct ResetWorkerEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub workers: Vec<WorkerId>,
}

/// A Get reply was pushed onto the reply queue.
pub struct ReplyGetEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub recver: WorkerId,
    pub version: Option<ClockValue>,
}

/// A Get was buffered until the min clock reaches `release_at`.
pub struct BufferGetEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub worker: WorkerId,
    pub release_at: ClockValue,
}

/// A speculative Get at `version` was forwarded onto the conflicting record
/// `(conflict_version, key)`.
pub struct ForwardGetEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub worker: WorkerId,
    pub version: ClockValue,
    pub conflict_version: ClockValue,
    pub key: Key,
}

/// A Get at `version` was too far ahead of the min clock to be speculated on, and was parked until
/// the next min clock advance.
pub struct ParkGetEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub worker: WorkerId,
    pub version: ClockValue,
}

/// A Clock at `version` arrived too far ahead of the min clock, and was parked until the next min
/// clock advance.
pub struct ParkClockEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub worker: WorkerId,
    pub version: ClockValue,
}
