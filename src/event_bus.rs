/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) from the dispatch loop and fires the
//! handlers registered for them.

use crate::events::*;
use crate::logging::Logger;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

/// Pointer to a handler closure, parametrised by the argument (for our use case, the event type).
pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// How long the event bus waits for an event before checking its shutdown signal again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct EventHandlers {
    pub(crate) receive_clock_handlers: Vec<HandlerPtr<ReceiveClockEvent>>,
    pub(crate) advance_min_clock_handlers: Vec<HandlerPtr<AdvanceMinClockEvent>>,
    pub(crate) reset_worker_handlers: Vec<HandlerPtr<ResetWorkerEvent>>,
    pub(crate) reply_get_handlers: Vec<HandlerPtr<ReplyGetEvent>>,
    pub(crate) buffer_get_handlers: Vec<HandlerPtr<BufferGetEvent>>,
    pub(crate) forward_get_handlers: Vec<HandlerPtr<ForwardGetEvent>>,
    pub(crate) park_get_handlers: Vec<HandlerPtr<ParkGetEvent>>,
    pub(crate) park_clock_handlers: Vec<HandlerPtr<ParkClockEvent>>,
}

impl EventHandlers {
    /// Collect the user-provided handlers, plus the default logging handler of every event type if
    /// `log_events` is true.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        receive_clock_handler: Option<HandlerPtr<ReceiveClockEvent>>,
        advance_min_clock_handler: Option<HandlerPtr<AdvanceMinClockEvent>>,
        reset_worker_handler: Option<HandlerPtr<ResetWorkerEvent>>,
        reply_get_handler: Option<HandlerPtr<ReplyGetEvent>>,
        buffer_get_handler: Option<HandlerPtr<BufferGetEvent>>,
        forward_get_handler: Option<HandlerPtr<ForwardGetEvent>>,
        park_get_handler: Option<HandlerPtr<ParkGetEvent>>,
        park_clock_handler: Option<HandlerPtr<ParkClockEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            receive_clock_handlers: handlers(log_events, receive_clock_handler),
            advance_min_clock_handlers: handlers(log_events, advance_min_clock_handler),
            reset_worker_handlers: handlers(log_events, reset_worker_handler),
            reply_get_handlers: handlers(log_events, reply_get_handler),
            buffer_get_handlers: handlers(log_events, buffer_get_handler),
            forward_get_handlers: handlers(log_events, forward_get_handler),
            park_get_handlers: handlers(log_events, park_get_handler),
            park_clock_handlers: handlers(log_events, park_clock_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.receive_clock_handlers.is_empty()
            && self.advance_min_clock_handlers.is_empty()
            && self.reset_worker_handlers.is_empty()
            && self.reply_get_handlers.is_empty()
            && self.buffer_get_handlers.is_empty()
            && self.forward_get_handlers.is_empty()
            && self.park_get_handlers.is_empty()
            && self.park_clock_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ReceiveClock(receive_clock_event) =>
                self.receive_clock_handlers.iter().for_each(|handler| handler(&receive_clock_event)),

            Event::AdvanceMinClock(advance_min_clock_event) =>
                self.advance_min_clock_handlers.iter().for_each(|handler| handler(&advance_min_clock_event)),

            Event::ResetWorker(reset_worker_event) =>
                self.reset_worker_handlers.iter().for_each(|handler| handler(&reset_worker_event)),

            Event::ReplyGet(reply_get_event) =>
                self.reply_get_handlers.iter().for_each(|handler| handler(&reply_get_event)),

            Event::BufferGet(buffer_get_event) =>
                self.buffer_get_handlers.iter().for_each(|handler| handler(&buffer_get_event)),

            Event::ForwardGet(forward_get_event) =>
                self.forward_get_handlers.iter().for_each(|handler| handler(&forward_get_event)),

            Event::ParkGet(park_get_event) =>
                self.park_get_handlers.iter().for_each(|handler| handler(&park_get_event)),

            Event::ParkClock(park_clock_event) =>
                self.park_clock_handlers.iter().for_each(|handler| handler(&park_clock_event)),
        }
    }
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger())
    }
    if let Some(handler) = user_handler {
        handlers.push(handler)
    }
    handlers
}

/// Start the event bus thread.
///
/// On receiving the shutdown signal, the thread fires the handlers of every event still in the channel
/// before returning.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => {
                event_subscriber.try_iter().for_each(|event| event_handlers.fire_handlers(event));
                return;
            }
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from the server thread")
            }
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
