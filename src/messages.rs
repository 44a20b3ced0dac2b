/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The message type exchanged between workers and server partitions.
//!
//! A [`Message`] is a fixed header ([`Meta`]) followed by an ordered list of opaque byte buffers. The
//! meaning of the payload buffers depends on the message's [`Flag`]:
//!
//! |Flag|`payload[0]`|`payload[1]`|
//! |---|---|---|
//! |[`Add`](Flag::Add)|keys|values to add|
//! |[`Get`](Flag::Get) request|keys|-|
//! |[`Get`](Flag::Get) reply|keys|current values|
//! |[`ResetWorker`](Flag::ResetWorker) request|worker ids|-|
//! |[`Clock`](Flag::Clock), [`Exit`](Flag::Exit), [`ResetWorker`](Flag::ResetWorker) reply|-|-|
//!
//! Every buffer is a borsh-serialized `Vec`: `Vec<Key>` for keys, `Vec<V>` for values, and
//! `Vec<WorkerId>` for worker ids. The flag byte and the order of the payload buffers are the binary
//! contract with the transport layer.

use std::io;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{ClockValue, Key, ServerId, TableId, WorkerId};

/// What a [`Message`] asks the receiving partition to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum Flag {
    /// Stop the [dispatch loop](crate::server_thread) that receives this message.
    Exit,
    /// The sender finished its current round.
    Clock,
    /// Accumulate values into storage.
    Add,
    /// Read current values from storage.
    Get,
    /// Replace the set of workers registered on a table.
    ResetWorker,
}

/// Fixed header of every [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Meta {
    pub sender: WorkerId,
    pub recver: ServerId,
    pub table_id: TableId,
    pub flag: Flag,
    /// The clock value the sender attaches to the message. Required by models that reason about
    /// versions (BSP, SSP, SparseSSP), ignored by ASP.
    pub version: Option<ClockValue>,
}

/// A request or a reply. Immutable once constructed: build one with the constructors below and read it
/// through the accessors.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Message {
    meta: Meta,
    payload: Vec<Vec<u8>>,
}

impl Message {
    /// Create a Clock message sent by `sender` at round `version`.
    pub fn clock(sender: WorkerId, recver: ServerId, table_id: TableId, version: ClockValue) -> Self {
        Self {
            meta: Meta { sender, recver, table_id, flag: Flag::Clock, version: Some(version) },
            payload: Vec::new(),
        }
    }

    /// Create an Add message that accumulates `values` into `keys`.
    pub fn add<V: BorshSerialize>(
        sender: WorkerId,
        recver: ServerId,
        table_id: TableId,
        version: ClockValue,
        keys: &[Key],
        values: &[V],
    ) -> Self {
        Self {
            meta: Meta { sender, recver, table_id, flag: Flag::Add, version: Some(version) },
            payload: vec![encode(keys), encode(values)],
        }
    }

    /// Create a Get message that reads `keys` at round `version`.
    pub fn get(sender: WorkerId, recver: ServerId, table_id: TableId, version: ClockValue, keys: &[Key]) -> Self {
        Self {
            meta: Meta { sender, recver, table_id, flag: Flag::Get, version: Some(version) },
            payload: vec![encode(keys)],
        }
    }

    /// Create a ResetWorker message that registers exactly `workers` on the table.
    pub fn reset_worker(sender: WorkerId, recver: ServerId, table_id: TableId, workers: &[WorkerId]) -> Self {
        Self {
            meta: Meta { sender, recver, table_id, flag: Flag::ResetWorker, version: None },
            payload: vec![encode(workers)],
        }
    }

    /// Create the message that stops the dispatch loop of partition `recver`.
    pub fn exit(recver: ServerId) -> Self {
        Self {
            meta: Meta {
                sender: recver,
                recver,
                table_id: TableId::new(0),
                flag: Flag::Exit,
                version: None,
            },
            payload: Vec::new(),
        }
    }

    /// Create the reply to `request` carrying `keys` and their `values`.
    ///
    /// The reply is addressed back to the requester: sender and receiver are swapped, and the flag,
    /// table and version of the request are kept.
    pub fn reply_to<V: BorshSerialize>(request: &Message, keys: &[Key], values: &[V]) -> Self {
        Self {
            meta: Self::reply_meta(&request.meta),
            payload: vec![encode(keys), encode(values)],
        }
    }

    /// Create the acknowledgement of a ResetWorker `request`.
    pub fn reset_worker_ack(request: &Message) -> Self {
        Self {
            meta: Self::reply_meta(&request.meta),
            payload: Vec::new(),
        }
    }

    fn reply_meta(meta: &Meta) -> Meta {
        Meta {
            sender: meta.recver,
            recver: meta.sender,
            table_id: meta.table_id,
            flag: meta.flag,
            version: meta.version,
        }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn payload(&self) -> &[Vec<u8>] {
        &self.payload
    }

    pub fn flag(&self) -> Flag {
        self.meta.flag
    }

    pub fn sender(&self) -> WorkerId {
        self.meta.sender
    }

    pub fn recver(&self) -> ServerId {
        self.meta.recver
    }

    pub fn table_id(&self) -> TableId {
        self.meta.table_id
    }

    /// Get the version of this message, failing if it does not carry one.
    pub fn version(&self) -> Result<ClockValue, MessageError> {
        self.meta.version.ok_or(MessageError::MissingVersion)
    }

    /// Check that this message carries exactly `expected` payload buffers.
    pub fn expect_payloads(&self, expected: usize) -> Result<(), MessageError> {
        if self.payload.len() != expected {
            return Err(MessageError::UnexpectedPayloadCount { expected, found: self.payload.len() });
        }
        Ok(())
    }

    /// Decode `payload[0]` as keys.
    pub fn keys(&self) -> Result<Vec<Key>, MessageError> {
        self.decode(0)
    }

    /// Decode `payload[1]` as values of type `V`.
    pub fn values<V: BorshDeserialize>(&self) -> Result<Vec<V>, MessageError> {
        self.decode(1)
    }

    /// Decode `payload[0]` as worker ids.
    pub fn worker_ids(&self) -> Result<Vec<WorkerId>, MessageError> {
        self.decode(0)
    }

    fn decode<T: BorshDeserialize>(&self, index: usize) -> Result<Vec<T>, MessageError> {
        let buffer = self.payload.get(index).ok_or(MessageError::MissingPayload { index })?;
        Ok(Vec::<T>::try_from_slice(buffer)?)
    }

    /// Serialize this message into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_one(self)
    }

    /// Deserialize a message from its wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(Message::try_from_slice(bytes)?)
    }
}

fn encode<T: BorshSerialize>(items: &[T]) -> Vec<u8> {
    // Safety: borsh serialization into a `Vec<u8>` writer cannot fail.
    items.try_to_vec().unwrap()
}

fn encode_one<T: BorshSerialize>(item: &T) -> Vec<u8> {
    // Safety: borsh serialization into a `Vec<u8>` writer cannot fail.
    item.try_to_vec().unwrap()
}

/// Enumerates the ways a [`Message`] can fail to carry what its flag requires.
#[derive(Debug)]
pub enum MessageError {
    /// The payload buffer at `index` does not exist.
    MissingPayload { index: usize },

    /// The message carries `found` payload buffers where `expected` were required.
    UnexpectedPayloadCount { expected: usize, found: usize },

    /// A payload buffer could not be deserialized.
    Decode(io::Error),

    /// The message does not carry a version, but the receiving model requires one.
    MissingVersion,
}

impl From<io::Error> for MessageError {
    fn from(value: io::Error) -> Self {
        MessageError::Decode(value)
    }
}

#[test]
fn reply_is_addressed_back_to_requester_test() {
    let request = Message::get(WorkerId::new(3), ServerId::new(1), TableId::new(7), ClockValue::new(2), &[4, 5]);
    let reply = Message::reply_to(&request, &[4, 5], &[10i32, 20]);

    assert_eq!(reply.meta.recver, ServerId::new(3));
    assert_eq!(reply.meta.sender, WorkerId::new(1));
    assert_eq!(reply.flag(), Flag::Get);
    assert_eq!(reply.table_id(), TableId::new(7));
    assert_eq!(reply.version().unwrap(), ClockValue::new(2));
    assert_eq!(reply.keys().unwrap(), vec![4, 5]);
    assert_eq!(reply.values::<i32>().unwrap(), vec![10, 20]);
}

#[test]
fn wire_format_test() {
    let msg = Message::add(WorkerId::new(2), ServerId::new(0), TableId::new(1), ClockValue::new(0), &[1, 2], &[0.5f32, 1.5]);
    let bytes = msg.to_bytes();
    assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    assert!(Message::from_bytes(&bytes[..bytes.len() - 1]).is_err());

    let clock = Message::clock(WorkerId::new(2), ServerId::new(0), TableId::new(1), ClockValue::new(0));
    assert!(matches!(clock.keys(), Err(MessageError::MissingPayload { index: 0 })));
}
