/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the server thread's
//! [specification](crate::server_thread::ServerThreadSpec).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least three values. The first three values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//! 3. The id of the table the event happened on.
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ForwardGet](crate::events::ForwardGetEvent) is printed:
//!
//! ```text
//! ForwardGet, 1701329264, 0, 3, 4, 1, 17
//! ```
//!
//! In the snippet:
//! - The fourth value is the id of the worker that sent the Get.
//! - The fifth value is the version of the Get.
//! - The sixth and seventh values are the version and key of the record the Get was forwarded onto.

use crate::{events::*, types::ClockValue};
use log;
use std::time::SystemTime;

// Names of each event in PascalCase for printing:
pub const RECEIVE_CLOCK: &str = "ReceiveClock";
pub const ADVANCE_MIN_CLOCK: &str = "AdvanceMinClock";
pub const RESET_WORKER: &str = "ResetWorker";

pub const REPLY_GET: &str = "ReplyGet";

pub const BUFFER_GET: &str = "BufferGet";
pub const FORWARD_GET: &str = "ForwardGet";
pub const PARK_GET: &str = "ParkGet";
pub const PARK_CLOCK: &str = "ParkClock";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ReceiveClockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_clock_event: &ReceiveClockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_CLOCK,
                secs_since_unix_epoch(receive_clock_event.timestamp),
                receive_clock_event.table,
                receive_clock_event.worker,
                receive_clock_event.progress
            )
        };
        Box::new(logger)
    }
}

impl Logger for AdvanceMinClockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |advance_min_clock_event: &AdvanceMinClockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ADVANCE_MIN_CLOCK,
                secs_since_unix_epoch(advance_min_clock_event.timestamp),
                advance_min_clock_event.table,
                advance_min_clock_event.min_clock
            )
        };
        Box::new(logger)
    }
}

impl Logger for ResetWorkerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reset_worker_event: &ResetWorkerEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RESET_WORKER,
                secs_since_unix_epoch(reset_worker_event.timestamp),
                reset_worker_event.table,
                reset_worker_event.workers.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReplyGetEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reply_get_event: &ReplyGetEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REPLY_GET,
                secs_since_unix_epoch(reply_get_event.timestamp),
                reply_get_event.table,
                reply_get_event.recver,
                display_version(reply_get_event.version)
            )
        };
        Box::new(logger)
    }
}

impl Logger for BufferGetEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |buffer_get_event: &BufferGetEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                BUFFER_GET,
                secs_since_unix_epoch(buffer_get_event.timestamp),
                buffer_get_event.table,
                buffer_get_event.worker,
                buffer_get_event.release_at
            )
        };
        Box::new(logger)
    }
}

impl Logger for ForwardGetEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |forward_get_event: &ForwardGetEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                FORWARD_GET,
                secs_since_unix_epoch(forward_get_event.timestamp),
                forward_get_event.table,
                forward_get_event.worker,
                forward_get_event.version,
                forward_get_event.conflict_version,
                forward_get_event.key
            )
        };
        Box::new(logger)
    }
}

impl Logger for ParkGetEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |park_get_event: &ParkGetEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PARK_GET,
                secs_since_unix_epoch(park_get_event.timestamp),
                park_get_event.table,
                park_get_event.worker,
                park_get_event.version
            )
        };
        Box::new(logger)
    }
}

impl Logger for ParkClockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |park_clock_event: &ParkClockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PARK_CLOCK,
                secs_since_unix_epoch(park_clock_event.timestamp),
                park_clock_event.table,
                park_clock_event.worker,
                park_clock_event.version
            )
        };
        Box::new(logger)
    }
}

fn display_version(version: Option<ClockValue>) -> String {
    match version {
        Some(version) => version.to_string(),
        None => String::from("-"),
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
