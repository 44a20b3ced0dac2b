/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-shard key-value accumulators.
//!
//! A [`Storage`] holds the values of the keys owned by one table on one partition. Writes are
//! additive: [`add`](Storage::add) does `storage[key] += delta` for every key in an Add message, so
//! applying the Adds of one round in any order produces the same result. Reads
//! ([`get`](Storage::get)) return the current value of every requested key, and keys that were never
//! written read as `V::default()`.
//!
//! Two strategies are provided:
//! 1. [`MapStorage`]: sparse, accepts any key.
//! 2. [`VectorStorage`]: dense, preallocated for a contiguous [`KeyRange`], and fails with
//!    [`StorageError::OutOfRange`] for keys outside of it.
//!
//! Both strategies support a "chunk size": the number of contiguous value slots owned by every key,
//! used for vector-valued parameters. With a chunk size of `c`, an Add for `n` keys carries `n * c`
//! values, and a Get for `n` keys is answered with `n * c` values.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    ops::AddAssign,
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    messages::{Message, MessageError},
    types::{Key, KeyRange},
};

/// Types that can be stored as parameter values.
pub trait Value:
    Copy + Default + AddAssign + PartialEq + Debug + BorshSerialize + BorshDeserialize + Send + 'static
{
}

impl<T> Value for T where
    T: Copy + Default + AddAssign + PartialEq + Debug + BorshSerialize + BorshDeserialize + Send + 'static
{
}

/// Accumulator interface shared by every storage strategy.
pub trait Storage: Send {
    /// Add `payload[1]` (values) into `payload[0]` (keys).
    fn add(&mut self, msg: &Message) -> Result<(), StorageError>;

    /// Read the keys in `payload[0]` and build the reply to `msg`.
    fn get(&mut self, msg: &Message) -> Result<Message, StorageError>;

    /// Called by models at the boundary between two synchronization rounds.
    fn finish_iter(&mut self);

    /// Number of keys currently backed by this storage.
    fn size(&self) -> usize;
}

/// Sparse storage backed by an ordered map.
pub struct MapStorage<V: Value> {
    chunk_size: usize,
    storage: BTreeMap<Key, Vec<V>>,
}

impl<V: Value> MapStorage<V> {
    pub fn new() -> Self {
        Self::with_chunk_size(1)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self { chunk_size: chunk_size.max(1), storage: BTreeMap::new() }
    }

    fn find_or_create(&mut self, key: Key) -> &mut Vec<V> {
        let chunk_size = self.chunk_size;
        self.storage.entry(key).or_insert_with(|| vec![V::default(); chunk_size])
    }
}

impl<V: Value> Default for MapStorage<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Value> Storage for MapStorage<V> {
    fn add(&mut self, msg: &Message) -> Result<(), StorageError> {
        let (keys, values) = decode_add::<V>(msg, self.chunk_size)?;
        for (key, deltas) in keys.iter().zip(values.chunks(self.chunk_size)) {
            self.find_or_create(*key)
                .iter_mut()
                .zip(deltas)
                .for_each(|(slot, delta)| *slot += *delta);
        }
        Ok(())
    }

    fn get(&mut self, msg: &Message) -> Result<Message, StorageError> {
        let keys = decode_get(msg)?;
        let mut values = Vec::with_capacity(keys.len() * self.chunk_size);
        for key in &keys {
            values.extend_from_slice(self.find_or_create(*key));
        }
        Ok(Message::reply_to(msg, &keys, &values))
    }

    fn finish_iter(&mut self) {}

    fn size(&self) -> usize {
        self.storage.len()
    }
}

/// Dense storage preallocated for one [`KeyRange`].
pub struct VectorStorage<V: Value> {
    range: KeyRange,
    chunk_size: usize,
    storage: Vec<V>,
}

impl<V: Value> VectorStorage<V> {
    pub fn new(range: KeyRange) -> Self {
        Self::with_chunk_size(range, 1)
    }

    pub fn with_chunk_size(range: KeyRange, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            range,
            chunk_size,
            storage: vec![V::default(); range.len() * chunk_size],
        }
    }

    fn slots(&self, key: Key) -> Result<std::ops::Range<usize>, StorageError> {
        let offset = self
            .range
            .offset(key)
            .ok_or(StorageError::OutOfRange { key, range: self.range })?;
        let begin = offset * self.chunk_size;
        Ok(begin..begin + self.chunk_size)
    }
}

impl<V: Value> Storage for VectorStorage<V> {
    fn add(&mut self, msg: &Message) -> Result<(), StorageError> {
        let (keys, values) = decode_add::<V>(msg, self.chunk_size)?;

        // Validate every key before touching storage, so that a failed Add leaves no partial update.
        let slots = keys.iter().map(|key| self.slots(*key)).collect::<Result<Vec<_>, _>>()?;
        for (slots, deltas) in slots.into_iter().zip(values.chunks(self.chunk_size)) {
            self.storage[slots]
                .iter_mut()
                .zip(deltas)
                .for_each(|(slot, delta)| *slot += *delta);
        }
        Ok(())
    }

    fn get(&mut self, msg: &Message) -> Result<Message, StorageError> {
        let keys = decode_get(msg)?;
        let mut values = Vec::with_capacity(keys.len() * self.chunk_size);
        for key in &keys {
            let slots = self.slots(*key)?;
            values.extend_from_slice(&self.storage[slots]);
        }
        Ok(Message::reply_to(msg, &keys, &values))
    }

    fn finish_iter(&mut self) {}

    fn size(&self) -> usize {
        self.range.len()
    }
}

fn decode_add<V: Value>(msg: &Message, chunk_size: usize) -> Result<(Vec<Key>, Vec<V>), StorageError> {
    msg.expect_payloads(2)?;
    let keys = msg.keys()?;
    let values = msg.values::<V>()?;
    if keys.len() * chunk_size != values.len() {
        return Err(StorageError::LengthMismatch {
            keys: keys.len(),
            values: values.len(),
            chunk_size,
        });
    }
    Ok((keys, values))
}

fn decode_get(msg: &Message) -> Result<Vec<Key>, StorageError> {
    msg.expect_payloads(1)?;
    Ok(msg.keys()?)
}

/// Enumerates the ways a [`Storage`] operation can fail.
#[derive(Debug)]
pub enum StorageError {
    /// `key` lies outside of the `range` owned by a [`VectorStorage`].
    OutOfRange { key: Key, range: KeyRange },

    /// An Add message carried `values` values for `keys` keys, where `keys * chunk_size` were
    /// required.
    LengthMismatch { keys: usize, values: usize, chunk_size: usize },

    /// See [`MessageError`].
    MessageError(MessageError),
}

impl From<MessageError> for StorageError {
    fn from(value: MessageError) -> Self {
        StorageError::MessageError(value)
    }
}

#[cfg(test)]
use crate::types::{ClockValue, TableId, ThreadId};

#[cfg(test)]
fn add_msg<V: Value>(keys: &[Key], values: &[V]) -> Message {
    Message::add(ThreadId::new(2), ThreadId::new(0), TableId::new(0), ClockValue::init(), keys, values)
}

#[cfg(test)]
fn get_msg(keys: &[Key]) -> Message {
    Message::get(ThreadId::new(2), ThreadId::new(0), TableId::new(0), ClockValue::init(), keys)
}

#[test]
fn map_storage_add_get_test() {
    let mut storage = MapStorage::<i64>::new();

    // Unseen keys read as zero.
    let reply = storage.get(&get_msg(&[3, 5, 7])).unwrap();
    assert_eq!(reply.keys().unwrap(), vec![3, 5, 7]);
    assert_eq!(reply.values::<i64>().unwrap(), vec![0, 0, 0]);

    storage.add(&add_msg(&[3, 7], &[10i64, -4])).unwrap();
    storage.add(&add_msg(&[3], &[1i64])).unwrap();
    storage.add(&add_msg(&[5], &[0i64])).unwrap();
    let reply = storage.get(&get_msg(&[3, 5, 7])).unwrap();
    assert_eq!(reply.values::<i64>().unwrap(), vec![11, 0, -4]);
    assert_eq!(storage.size(), 3);
}

#[test]
fn map_storage_chunk_test() {
    let mut storage = MapStorage::<f32>::with_chunk_size(2);
    storage.add(&add_msg(&[13, 14, 15], &[0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6])).unwrap();
    let reply = storage.get(&get_msg(&[13, 14, 15])).unwrap();
    assert_eq!(reply.values::<f32>().unwrap(), vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);

    assert!(matches!(
        storage.add(&add_msg(&[13], &[1.0f32])),
        Err(StorageError::LengthMismatch { keys: 1, values: 1, chunk_size: 2 })
    ));
}

#[test]
fn vector_storage_range_test() {
    let range = KeyRange::new(10, 20).unwrap();
    let mut storage = VectorStorage::<i32>::new(range);
    assert_eq!(storage.size(), 10);

    storage.add(&add_msg(&[10, 19], &[1i32, 2])).unwrap();
    storage.add(&add_msg(&[19], &[3i32])).unwrap();
    let reply = storage.get(&get_msg(&[19, 10, 15])).unwrap();
    assert_eq!(reply.values::<i32>().unwrap(), vec![5, 1, 0]);

    // A failed Add applies nothing.
    assert!(matches!(
        storage.add(&add_msg(&[11, 20], &[1i32, 1])),
        Err(StorageError::OutOfRange { key: 20, .. })
    ));
    let reply = storage.get(&get_msg(&[11])).unwrap();
    assert_eq!(reply.values::<i32>().unwrap(), vec![0]);
    assert!(matches!(storage.get(&get_msg(&[9])), Err(StorageError::OutOfRange { key: 9, .. })));
}

#[test]
fn vector_storage_chunk_test() {
    let mut storage = VectorStorage::<i32>::with_chunk_size(KeyRange::new(0, 4).unwrap(), 3);
    assert_eq!(storage.size(), 4);

    storage.add(&add_msg(&[1, 3], &[1i32, 2, 3, 4, 5, 6])).unwrap();
    storage.add(&add_msg(&[1], &[1i32, 1, 1])).unwrap();
    let reply = storage.get(&get_msg(&[3, 1, 0])).unwrap();
    assert_eq!(reply.keys().unwrap(), vec![3, 1, 0]);
    assert_eq!(reply.values::<i32>().unwrap(), vec![4, 5, 6, 2, 3, 4, 0, 0, 0]);

    assert!(matches!(
        storage.add(&add_msg(&[2], &[1i32, 1])),
        Err(StorageError::LengthMismatch { keys: 1, values: 2, chunk_size: 3 })
    ));
    assert!(matches!(
        storage.add(&add_msg(&[4], &[1i32, 1, 1])),
        Err(StorageError::OutOfRange { key: 4, .. })
    ));
}
