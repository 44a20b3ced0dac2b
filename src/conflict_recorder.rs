/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Windowed per-key reference counts used to validate speculative reads.
//!
//! Under the [SparseSSP](crate::consistency::sparse_ssp) model, every worker registers the key set of
//! each of its upcoming Gets ahead of time. A *record* is the pair `(version, key)`, and its reference
//! count says how many still-outstanding claims exist on `key` at round `version`: as long as the count
//! is nonzero, some worker may still write `key` before finishing round `version`.
//!
//! A speculative read that would observe such a key is not answered. It is instead *forwarded*: parked
//! on the conflicting record, and reconsidered when that record's count drops to zero.
//!
//! ## Strategies
//!
//! Both implementations of [`ConflictRecorder`] provide the same semantics:
//! 1. [`MapConflictRecorder`]: sparse. Records live in hash maps and are created on demand. Suitable
//!    when the key domain is large or unknown.
//! 2. [`RingConflictRecorder`]: dense. A preallocated ring of `staleness + 2 * speculation + 3` version
//!    rows, each holding one slot per key of a contiguous [`KeyRange`], indexed by
//!    `(version % rows, key - range.begin())`.
//!
//! ## Eviction
//!
//! Once the min clock passes `version`, [`clock_remove_record`](ConflictRecorder::clock_remove_record)
//! drops that version's records. At that point every count at `version` must already be zero; a
//! nonzero count is reported as [`ConflictError::NonZeroReference`].

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::{
    messages::Message,
    types::{ClockValue, Key, KeyRange, WorkerId},
};

/// The `(version, key)` record that a speculative read conflicts with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Conflict {
    pub version: ClockValue,
    pub key: Key,
}

/// Interface shared by the sparse and dense record windows.
pub trait ConflictRecorder: Send {
    /// Increment the reference count of every `(version, key)` for `key` in `keys`.
    fn add_record(&mut self, version: ClockValue, keys: &[Key]) -> Result<(), ConflictError>;

    /// Decrement the reference count of every `(version, key)` for `key` in `keys`.
    ///
    /// Returns the messages that were forwarded onto records whose count reached zero, in the order
    /// they were forwarded. The caller is responsible for re-evaluating them. Fails without changing
    /// any count if one of the decrements would go below zero.
    fn remove_record(&mut self, version: ClockValue, keys: &[Key]) -> Result<Vec<Message>, ConflictError>;

    /// Find the newest record in versions `[begin, end]` with a nonzero reference count on one of
    /// `keys`.
    ///
    /// Versions are scanned from `end` down to `begin`, and keys in the order given. The span is empty
    /// if `end < begin`.
    fn find_conflict(
        &self,
        keys: &[Key],
        begin: ClockValue,
        end: ClockValue,
    ) -> Result<Option<Conflict>, ConflictError>;

    /// Check whether some key in `keys` has a nonzero reference count at some version in
    /// `[begin, end]`.
    fn has_conflict(&self, keys: &[Key], begin: ClockValue, end: ClockValue) -> Result<bool, ConflictError> {
        Ok(self.find_conflict(keys, begin, end)?.is_some())
    }

    /// Park `msg` on the record identified by `conflict` until that record's count drops to zero.
    fn forward(&mut self, conflict: Conflict, msg: Message) -> Result<(), ConflictError>;

    /// Drop the records of `version`. Fails if any of them still has a nonzero count.
    fn clock_remove_record(&mut self, version: ClockValue) -> Result<(), ConflictError>;

    /// Get the current reference count of `(version, key)`.
    fn reference_count(&self, version: ClockValue, key: Key) -> Result<u32, ConflictError>;

    /// Drop every record and every forwarded message.
    fn clear(&mut self);
}

/// A single `(version, key)` record.
#[derive(Default)]
struct Record {
    count: u32,
    forwarded: Vec<Message>,
}

impl Record {
    /// Decrement the count. Returns the forwarded messages if the count reached zero.
    fn release(&mut self, version: ClockValue, key: Key) -> Result<Option<Vec<Message>>, ConflictError> {
        if self.count == 0 {
            return Err(ConflictError::NegativeReference { version, key });
        }
        self.count -= 1;
        if self.count == 0 {
            Ok(Some(std::mem::take(&mut self.forwarded)))
        } else {
            Ok(None)
        }
    }
}

/// Count how many times each key occurs in `keys`.
fn decrements(keys: &[Key]) -> BTreeMap<Key, u32> {
    let mut decrements = BTreeMap::new();
    for key in keys {
        *decrements.entry(*key).or_insert(0) += 1;
    }
    decrements
}

/// Sparse [`ConflictRecorder`] backed by hash maps.
///
/// A key's record is erased as soon as its count returns to zero, so the maps only ever hold live
/// records.
#[derive(Default)]
pub struct MapConflictRecorder {
    records: HashMap<ClockValue, HashMap<Key, Record>>,
}

impl MapConflictRecorder {
    pub fn new() -> Self {
        Self { records: HashMap::new() }
    }
}

impl ConflictRecorder for MapConflictRecorder {
    fn add_record(&mut self, version: ClockValue, keys: &[Key]) -> Result<(), ConflictError> {
        let version_records = self.records.entry(version).or_default();
        for key in keys {
            version_records.entry(*key).or_default().count += 1;
        }
        Ok(())
    }

    fn remove_record(&mut self, version: ClockValue, keys: &[Key]) -> Result<Vec<Message>, ConflictError> {
        for (key, decrements) in decrements(keys) {
            if self.reference_count(version, key)? < decrements {
                return Err(ConflictError::NegativeReference { version, key });
            }
        }

        let mut released = Vec::new();
        let Some(version_records) = self.records.get_mut(&version) else {
            return Ok(released);
        };
        for key in keys {
            let Some(record) = version_records.get_mut(key) else {
                continue;
            };
            if let Some(msgs) = record.release(version, *key)? {
                released.extend(msgs);
                version_records.remove(key);
            }
        }
        Ok(released)
    }

    fn find_conflict(
        &self,
        keys: &[Key],
        begin: ClockValue,
        end: ClockValue,
    ) -> Result<Option<Conflict>, ConflictError> {
        for version in (begin.int()..=end.int()).rev().map(ClockValue::new) {
            let Some(version_records) = self.records.get(&version) else {
                continue;
            };
            let conflict = keys
                .iter()
                .find(|key| version_records.get(*key).map_or(false, |record| record.count > 0));
            if let Some(key) = conflict {
                return Ok(Some(Conflict { version, key: *key }));
            }
        }
        Ok(None)
    }

    fn forward(&mut self, conflict: Conflict, msg: Message) -> Result<(), ConflictError> {
        match self
            .records
            .get_mut(&conflict.version)
            .and_then(|version_records| version_records.get_mut(&conflict.key))
        {
            Some(record) if record.count > 0 => {
                record.forwarded.push(msg);
                Ok(())
            }
            _ => Err(ConflictError::NoReference { version: conflict.version, key: conflict.key }),
        }
    }

    fn clock_remove_record(&mut self, version: ClockValue) -> Result<(), ConflictError> {
        if let Some(version_records) = self.records.get(&version) {
            if let Some((key, _)) = version_records.iter().find(|(_, record)| record.count > 0) {
                return Err(ConflictError::NonZeroReference { version, key: *key });
            }
        }
        self.records.remove(&version);
        Ok(())
    }

    fn reference_count(&self, version: ClockValue, key: Key) -> Result<u32, ConflictError> {
        Ok(self
            .records
            .get(&version)
            .and_then(|version_records| version_records.get(&key))
            .map_or(0, |record| record.count))
    }

    fn clear(&mut self) {
        self.records.clear()
    }
}

/// One version row of a [`RingConflictRecorder`].
struct Row {
    /// The version currently occupying this row, if any.
    version: Option<ClockValue>,
    /// Sum of the counts of every slot in this row.
    live: u64,
    slots: Vec<Record>,
}

/// Dense [`ConflictRecorder`] backed by a preallocated ring of version rows.
pub struct RingConflictRecorder {
    range: KeyRange,
    rows: Vec<Row>,
}

impl RingConflictRecorder {
    /// Create a ring large enough for any window that a SparseSSP model with the given `staleness` and
    /// `speculation` can keep open.
    pub fn new(staleness: u64, speculation: u64, range: KeyRange) -> Self {
        let num_rows = (staleness + 2 * speculation + 3) as usize;
        let rows = (0..num_rows)
            .map(|_| Row {
                version: None,
                live: 0,
                slots: (0..range.len()).map(|_| Record::default()).collect(),
            })
            .collect();
        Self { range, rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn row_index(&self, version: ClockValue) -> usize {
        (version.int() % self.rows.len() as u64) as usize
    }

    fn offset(&self, key: Key) -> Result<usize, ConflictError> {
        self.range
            .offset(key)
            .ok_or(ConflictError::OutOfRange { key, range: self.range })
    }

    /// Get the row of `version`, or `None` if the row is occupied by another version or by nothing.
    fn row(&self, version: ClockValue) -> Option<&Row> {
        let row = &self.rows[self.row_index(version)];
        (row.version == Some(version)).then_some(row)
    }

    fn row_mut(&mut self, version: ClockValue) -> Option<&mut Row> {
        let index = self.row_index(version);
        let row = &mut self.rows[index];
        (row.version == Some(version)).then_some(row)
    }
}

impl ConflictRecorder for RingConflictRecorder {
    fn add_record(&mut self, version: ClockValue, keys: &[Key]) -> Result<(), ConflictError> {
        let offsets = keys.iter().map(|key| self.offset(*key)).collect::<Result<Vec<_>, _>>()?;
        let index = self.row_index(version);
        let row = &mut self.rows[index];
        match row.version {
            Some(occupant) if occupant != version && row.live > 0 => {
                return Err(ConflictError::WindowOverflow { version, occupant })
            }
            _ => row.version = Some(version),
        }
        for offset in offsets {
            row.slots[offset].count += 1;
            row.live += 1;
        }
        Ok(())
    }

    fn remove_record(&mut self, version: ClockValue, keys: &[Key]) -> Result<Vec<Message>, ConflictError> {
        let offsets = keys.iter().map(|key| self.offset(*key)).collect::<Result<Vec<_>, _>>()?;
        for (key, decrements) in decrements(keys) {
            if self.reference_count(version, key)? < decrements {
                return Err(ConflictError::NegativeReference { version, key });
            }
        }

        let mut released = Vec::new();
        for (key, offset) in keys.iter().zip(offsets) {
            let row = self
                .row_mut(version)
                .ok_or(ConflictError::NegativeReference { version, key: *key })?;
            if let Some(msgs) = row.slots[offset].release(version, *key)? {
                released.extend(msgs);
            }
            row.live -= 1;
        }
        Ok(released)
    }

    fn find_conflict(
        &self,
        keys: &[Key],
        begin: ClockValue,
        end: ClockValue,
    ) -> Result<Option<Conflict>, ConflictError> {
        let offsets = keys.iter().map(|key| self.offset(*key)).collect::<Result<Vec<_>, _>>()?;
        for version in (begin.int()..=end.int()).rev().map(ClockValue::new) {
            let Some(row) = self.row(version) else {
                continue;
            };
            if row.live == 0 {
                continue;
            }
            let conflict = keys
                .iter()
                .zip(&offsets)
                .find(|(_, offset)| row.slots[**offset].count > 0);
            if let Some((key, _)) = conflict {
                return Ok(Some(Conflict { version, key: *key }));
            }
        }
        Ok(None)
    }

    fn forward(&mut self, conflict: Conflict, msg: Message) -> Result<(), ConflictError> {
        let offset = self.offset(conflict.key)?;
        match self.row_mut(conflict.version) {
            Some(row) if row.slots[offset].count > 0 => {
                row.slots[offset].forwarded.push(msg);
                Ok(())
            }
            _ => Err(ConflictError::NoReference { version: conflict.version, key: conflict.key }),
        }
    }

    fn clock_remove_record(&mut self, version: ClockValue) -> Result<(), ConflictError> {
        let range = self.range;
        let Some(row) = self.row_mut(version) else {
            return Ok(());
        };
        if row.live > 0 {
            let offset = row.slots.iter().position(|record| record.count > 0).unwrap_or(0);
            return Err(ConflictError::NonZeroReference { version, key: range.begin() + offset as Key });
        }
        row.version = None;
        Ok(())
    }

    fn reference_count(&self, version: ClockValue, key: Key) -> Result<u32, ConflictError> {
        let offset = self.offset(key)?;
        Ok(self.row(version).map_or(0, |row| row.slots[offset].count))
    }

    fn clear(&mut self) {
        for row in &mut self.rows {
            row.version = None;
            row.live = 0;
            row.slots.iter_mut().for_each(|record| *record = Record::default());
        }
    }
}

/// Per-worker queues of the key sets that workers registered ahead of their Gets.
///
/// Each worker can have at most `speculation + 1` key sets outstanding.
pub struct FutureKeySet {
    capacity: usize,
    future_keys: HashMap<WorkerId, VecDeque<(ClockValue, Vec<Key>)>>,
}

impl FutureKeySet {
    pub fn new(speculation: u64) -> Self {
        Self { capacity: speculation as usize + 1, future_keys: HashMap::new() }
    }

    /// Fail with [`ConflictError::FutureKeysFull`] if `worker` cannot queue another key set.
    pub fn check_capacity(&self, worker: WorkerId) -> Result<(), ConflictError> {
        if self.len(worker) >= self.capacity {
            return Err(ConflictError::FutureKeysFull { worker, capacity: self.capacity });
        }
        Ok(())
    }

    /// Queue `keys`, registered by `worker` for round `version`.
    pub fn push(&mut self, worker: WorkerId, version: ClockValue, keys: Vec<Key>) -> Result<(), ConflictError> {
        self.check_capacity(worker)?;
        self.future_keys.entry(worker).or_default().push_back((version, keys));
        Ok(())
    }

    /// Remove and return every key set of `worker` registered for a round before `progress`.
    pub fn retire(&mut self, worker: WorkerId, progress: ClockValue) -> Vec<(ClockValue, Vec<Key>)> {
        let Some(queue) = self.future_keys.get_mut(&worker) else {
            return Vec::new();
        };
        let mut retired = Vec::new();
        while queue.front().map_or(false, |(version, _)| *version < progress) {
            if let Some(entry) = queue.pop_front() {
                retired.push(entry);
            }
        }
        retired
    }

    /// Number of key sets `worker` currently has outstanding.
    pub fn len(&self, worker: WorkerId) -> usize {
        self.future_keys.get(&worker).map_or(0, |queue| queue.len())
    }

    pub fn clear(&mut self) {
        self.future_keys.clear()
    }
}

/// Enumerates the ways a [`ConflictRecorder`] or [`FutureKeySet`] operation can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum ConflictError {
    /// `key` lies outside of the `range` covered by a [`RingConflictRecorder`].
    OutOfRange { key: Key, range: KeyRange },

    /// A record was removed more times than it was added.
    NegativeReference { version: ClockValue, key: Key },

    /// A version was evicted while one of its records still had a nonzero count.
    NonZeroReference { version: ClockValue, key: Key },

    /// A message was forwarded onto a record whose count is zero.
    NoReference { version: ClockValue, key: Key },

    /// A record for `version` was added while the ring row it maps to is still in use by `occupant`.
    WindowOverflow { version: ClockValue, occupant: ClockValue },

    /// `worker` registered more than `capacity` key sets ahead of its progress.
    FutureKeysFull { worker: WorkerId, capacity: usize },
}

#[cfg(test)]
fn recorders() -> Vec<Box<dyn ConflictRecorder>> {
    vec![
        Box::new(MapConflictRecorder::new()),
        Box::new(RingConflictRecorder::new(2, 2, KeyRange::new(0, 10).unwrap())),
    ]
}

#[cfg(test)]
fn v(version: u64) -> ClockValue {
    ClockValue::new(version)
}

#[test]
fn has_conflict_test() {
    for mut recorder in recorders() {
        recorder.add_record(v(1), &[3, 4]).unwrap();
        recorder.add_record(v(3), &[4]).unwrap();
        recorder.add_record(v(3), &[4]).unwrap();
        assert_eq!(recorder.reference_count(v(3), 4).unwrap(), 2);

        assert!(recorder.has_conflict(&[3], v(0), v(2)).unwrap());
        assert!(!recorder.has_conflict(&[3], v(2), v(5)).unwrap());
        assert!(!recorder.has_conflict(&[5, 6], v(0), v(5)).unwrap());

        // Newest version first, then keys in request order.
        assert_eq!(recorder.find_conflict(&[3, 4], v(0), v(4)).unwrap(), Some(Conflict { version: v(3), key: 4 }));
        assert_eq!(recorder.find_conflict(&[3, 4], v(0), v(2)).unwrap(), Some(Conflict { version: v(1), key: 3 }));

        // Empty span.
        assert!(!recorder.has_conflict(&[3, 4], v(2), v(1)).unwrap());

        recorder.remove_record(v(1), &[3, 4]).unwrap();
        assert!(!recorder.has_conflict(&[3, 4], v(0), v(2)).unwrap());
        assert!(recorder.has_conflict(&[3, 4], v(0), v(3)).unwrap());
        recorder.remove_record(v(3), &[4]).unwrap();
        recorder.remove_record(v(3), &[4]).unwrap();
        assert!(!recorder.has_conflict(&[3, 4], v(0), v(5)).unwrap());
        assert_eq!(
            recorder.remove_record(v(3), &[4]).unwrap_err(),
            ConflictError::NegativeReference { version: v(3), key: 4 }
        );
    }
}

#[test]
fn forwarded_messages_released_at_zero_test() {
    use crate::types::{TableId, ThreadId};

    let get = |sender: u32| Message::get(ThreadId::new(sender), ThreadId::new(0), TableId::new(0), v(4), &[2]);
    for mut recorder in recorders() {
        recorder.add_record(v(1), &[2]).unwrap();
        recorder.add_record(v(1), &[2]).unwrap();
        let conflict = recorder.find_conflict(&[2], v(0), v(1)).unwrap().unwrap();
        recorder.forward(conflict, get(5)).unwrap();
        recorder.forward(conflict, get(6)).unwrap();

        assert!(recorder.remove_record(v(1), &[2]).unwrap().is_empty());
        assert_eq!(recorder.remove_record(v(1), &[2]).unwrap(), vec![get(5), get(6)]);
        assert_eq!(
            recorder.forward(conflict, get(7)).unwrap_err(),
            ConflictError::NoReference { version: v(1), key: 2 }
        );
    }
}

#[test]
fn failed_remove_record_changes_nothing_test() {
    use crate::types::{TableId, ThreadId};

    let get = Message::get(ThreadId::new(5), ThreadId::new(0), TableId::new(0), v(3), &[2]);
    for mut recorder in recorders() {
        recorder.add_record(v(1), &[2, 3]).unwrap();
        recorder.forward(Conflict { version: v(1), key: 2 }, get.clone()).unwrap();

        // Key 3 was registered once, so removing it twice must fail before key 2 is released.
        assert_eq!(
            recorder.remove_record(v(1), &[2, 3, 3]).unwrap_err(),
            ConflictError::NegativeReference { version: v(1), key: 3 }
        );
        assert_eq!(recorder.reference_count(v(1), 2).unwrap(), 1);
        assert_eq!(recorder.reference_count(v(1), 3).unwrap(), 1);

        assert_eq!(recorder.remove_record(v(1), &[2, 3]).unwrap(), vec![get.clone()]);
        assert!(!recorder.has_conflict(&[2, 3], v(0), v(2)).unwrap());
    }
}

#[test]
fn clock_remove_record_test() {
    for mut recorder in recorders() {
        recorder.add_record(v(0), &[1, 2]).unwrap();
        assert_eq!(
            recorder.clock_remove_record(v(0)).unwrap_err(),
            ConflictError::NonZeroReference { version: v(0), key: 1 }
        );
        recorder.remove_record(v(0), &[1, 2]).unwrap();
        recorder.clock_remove_record(v(0)).unwrap();
        recorder.clock_remove_record(v(1)).unwrap();
        assert_eq!(recorder.reference_count(v(0), 1).unwrap(), 0);

        recorder.add_record(v(2), &[1]).unwrap();
        recorder.clear();
        assert!(!recorder.has_conflict(&[1], v(0), v(9)).unwrap());
    }
}

#[test]
fn ring_window_test() {
    let mut recorder = RingConflictRecorder::new(2, 2, KeyRange::new(100, 104).unwrap());
    assert_eq!(recorder.num_rows(), 9);

    recorder.add_record(v(1), &[100, 103]).unwrap();
    assert_eq!(
        recorder.add_record(v(10), &[100]).unwrap_err(),
        ConflictError::WindowOverflow { version: v(10), occupant: v(1) }
    );
    assert_eq!(
        recorder.add_record(v(2), &[104]).unwrap_err(),
        ConflictError::OutOfRange { key: 104, range: KeyRange::new(100, 104).unwrap() }
    );

    // Once version 1 is evicted its row can be reused by version 10.
    recorder.remove_record(v(1), &[100, 103]).unwrap();
    recorder.clock_remove_record(v(1)).unwrap();
    recorder.add_record(v(10), &[100]).unwrap();
    assert_eq!(recorder.reference_count(v(10), 100).unwrap(), 1);
    assert_eq!(recorder.reference_count(v(1), 100).unwrap(), 0);
}

#[test]
fn future_key_set_test() {
    let (w2, w3) = (WorkerId::new(2), WorkerId::new(3));
    let mut future_keys = FutureKeySet::new(1);
    future_keys.push(w2, v(0), vec![1]).unwrap();
    future_keys.push(w2, v(1), vec![2]).unwrap();
    assert_eq!(
        future_keys.push(w2, v(2), vec![3]).unwrap_err(),
        ConflictError::FutureKeysFull { worker: w2, capacity: 2 }
    );
    future_keys.push(w3, v(0), vec![1]).unwrap();

    assert!(future_keys.retire(w2, v(0)).is_empty());
    assert_eq!(future_keys.retire(w2, v(2)), vec![(v(0), vec![1]), (v(1), vec![2])]);
    assert_eq!(future_keys.len(w2), 0);
    assert_eq!(future_keys.len(w3), 1);
}
