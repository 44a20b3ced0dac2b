//! Helpers for inspecting the reply queue.

use std::{
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use borsh::BorshDeserialize;
use paramserver_rs::{
    consistency::ReplyHandle,
    messages::{Flag, Message},
    types::{ClockValue, Key, WorkerId},
};

pub(crate) fn reply_queue() -> (ReplyHandle, Receiver<Message>) {
    let (sender, receiver) = mpsc::channel();
    (ReplyHandle::new(sender), receiver)
}

/// A decoded Get reply.
#[derive(Debug, PartialEq)]
pub(crate) struct Reply<V> {
    pub(crate) recver: WorkerId,
    pub(crate) version: Option<ClockValue>,
    pub(crate) keys: Vec<Key>,
    pub(crate) values: Vec<V>,
}

pub(crate) fn decode<V: BorshDeserialize>(msg: Message) -> Reply<V> {
    assert_eq!(msg.flag(), Flag::Get);
    Reply {
        recver: msg.recver(),
        version: msg.meta().version,
        keys: msg.keys().unwrap(),
        values: msg.values::<V>().unwrap(),
    }
}

// Pop a Get reply that must already be in the queue.
pub(crate) fn pop_reply<V: BorshDeserialize>(replies: &Receiver<Message>) -> Reply<V> {
    decode(replies.try_recv().expect("expected a reply in the queue"))
}

// Wait for a Get reply pushed by another thread.
pub(crate) fn wait_reply<V: BorshDeserialize>(replies: &Receiver<Message>) -> Reply<V> {
    decode(
        replies
            .recv_timeout(Duration::from_secs(5))
            .expect("timed out waiting for a reply"),
    )
}

pub(crate) fn pop_reset_ack(replies: &Receiver<Message>) -> Message {
    let ack = replies.try_recv().expect("expected a ResetWorker acknowledgement");
    assert_eq!(ack.flag(), Flag::ResetWorker);
    assert!(ack.payload().is_empty());
    ack
}

pub(crate) fn assert_no_reply(replies: &Receiver<Message>) {
    if let Ok(msg) = replies.try_recv() {
        panic!("expected no reply, got {:?}", msg)
    }
}
