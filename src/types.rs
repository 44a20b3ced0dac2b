/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that identify participants, tables, clocks and keys.
//!
//! These types exist mostly to carry integers around with a bit of type safety, and do not have any
//! major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, Sub},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Identifies a thread in the cluster: either a worker thread that pushes updates and pulls values, or
/// a server thread serving one partition.
///
/// Workers and servers share one id space, so that a reply can be addressed by swapping the sender
/// and receiver of its request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Create a new `ThreadId` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `ThreadId`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Id of a worker thread.
pub type WorkerId = ThreadId;

/// Id of a server thread. Every partition (shard) is served by exactly one
/// [`ServerThread`](crate::server_thread::ServerThread).
pub type ServerId = ThreadId;

/// Identifies a table. A table is a set of parameters sharing one consistency model, sharded over one
/// or more partitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct TableId(u32);

impl TableId {
    /// Create a new `TableId` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `TableId`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A worker's logical round counter.
///
/// Every worker starts at [`ClockValue::init`] and moves forward by exactly one each time it sends
/// a Clock message. The minimum of the clocks of all workers registered on a table is that table's
/// "min clock".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct ClockValue(u64);

impl ClockValue {
    /// Create a new `ClockValue` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The clock value every worker starts with.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the `u64` value of this `ClockValue`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ClockValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ClockValue {
    type Output = ClockValue;
    fn add(self, rhs: u64) -> Self::Output {
        ClockValue::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for ClockValue {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Saturates at zero.
impl Sub<u64> for ClockValue {
    type Output = ClockValue;
    fn sub(self, rhs: u64) -> Self::Output {
        ClockValue::new(self.0.saturating_sub(rhs))
    }
}

/// Distance between two clock values. Saturates at zero.
impl Sub<ClockValue> for ClockValue {
    type Output = u64;
    fn sub(self, rhs: ClockValue) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// Identifies one parameter slot.
pub type Key = u64;

/// Half-open range `[begin, end)` of keys owned by one shard.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct KeyRange {
    begin: Key,
    end: Key,
}

impl KeyRange {
    /// Create a new `KeyRange`. Fails if `begin > end`.
    pub fn new(begin: Key, end: Key) -> Result<Self, InvalidRangeError> {
        if begin > end {
            return Err(InvalidRangeError { begin, end });
        }
        Ok(Self { begin, end })
    }

    pub const fn begin(&self) -> Key {
        self.begin
    }

    pub const fn end(&self) -> Key {
        self.end
    }

    pub const fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub const fn contains(&self, key: Key) -> bool {
        key >= self.begin && key < self.end
    }

    /// Position of `key` relative to `begin`, or `None` if `key` is outside of this range.
    pub const fn offset(&self, key: Key) -> Option<usize> {
        if self.contains(key) {
            Some((key - self.begin) as usize)
        } else {
            None
        }
    }

    /// Split `[begin, end)` into `parts` contiguous ranges of (nearly) equal length. Earlier ranges
    /// get the remainder.
    pub fn split(&self, parts: usize) -> Vec<KeyRange> {
        if parts == 0 {
            return Vec::new();
        }
        let len = self.len() as u64;
        let parts_u64 = parts as u64;
        let (base, remainder) = (len / parts_u64, len % parts_u64);
        let mut begin = self.begin;
        (0..parts_u64)
            .map(|i| {
                let end = begin + base + if i < remainder { 1 } else { 0 };
                let range = KeyRange { begin, end };
                begin = end;
                range
            })
            .collect()
    }
}

impl Debug for KeyRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Returned by [`KeyRange::new`] when `begin > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRangeError {
    pub begin: Key,
    pub end: Key,
}

#[test]
fn clock_value_arithmetic_test() {
    let clock = ClockValue::new(3);
    assert_eq!(clock + 2, ClockValue::new(5));
    assert_eq!(clock - 5, ClockValue::init());
    assert_eq!(ClockValue::new(7) - clock, 4);
    assert_eq!(clock - ClockValue::new(7), 0);
}

#[test]
fn key_range_split_test() {
    let range = KeyRange::new(10, 21).unwrap();
    let parts = range.split(3);
    assert_eq!(parts.len(), 3);
    assert_eq!((parts[0].begin(), parts[0].end()), (10, 14));
    assert_eq!((parts[1].begin(), parts[1].end()), (14, 18));
    assert_eq!((parts[2].begin(), parts[2].end()), (18, 21));
    assert_eq!(parts[1].offset(15), Some(1));
    assert_eq!(parts[1].offset(18), None);
    assert!(KeyRange::new(5, 4).is_err());
}
