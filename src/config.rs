/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Builder-pattern configuration of tables, and the factory that turns a configuration into a
//! running [`ConsistencyModel`].
//!
//! ## Example
//!
//! ```ignore
//! let config = TableConfiguration::builder()
//!     .table_id(TableId::new(0))
//!     .consistency(ConsistencyKind::SparseSsp { staleness: 2, speculation: 2, recorder: RecorderKind::Ring })
//!     .storage(StorageKind::Vector)
//!     .build();
//!
//! let model = config.build_model::<f32>(Some(KeyRange::new(0, 1000)?), reply)?;
//! ```
//!
//! ## Dense strategies
//!
//! [`StorageKind::Vector`] and [`RecorderKind::Ring`] preallocate one slot per key, and therefore need
//! the contiguous [`KeyRange`] owned by the partition the model is built for. Building either of them
//! without a key range fails with [`ConfigError::MissingKeyRange`].

use typed_builder::TypedBuilder;

use crate::{
    conflict_recorder::{ConflictRecorder, MapConflictRecorder, RingConflictRecorder},
    consistency::{
        asp::AspModel, bsp::BspModel, sparse_ssp::SparseSspModel, ssp::SspModel, ConsistencyModel,
        ReplyHandle,
    },
    storage::{MapStorage, Storage, Value, VectorStorage},
    types::{KeyRange, TableId},
};

/// Which consistency model serves a table, and its parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsistencyKind {
    Bsp,
    Asp,
    Ssp { staleness: u64 },
    SparseSsp { staleness: u64, speculation: u64, recorder: RecorderKind },
}

/// Which [`ConflictRecorder`] strategy a SparseSSP table uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderKind {
    /// [`MapConflictRecorder`].
    Map,
    /// [`RingConflictRecorder`]. Requires a key range.
    Ring,
}

/// Which [`Storage`] strategy a table uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// [`MapStorage`].
    Map,
    /// [`VectorStorage`]. Requires a key range.
    Vector,
}

/// Parameters of one table.
#[derive(TypedBuilder, Clone, Debug)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [TableConfiguration]. On the builder call the following methods to construct a valid [TableConfiguration].

    Required:
    - `.table_id(...)`
    - `.consistency(...)`

    Optional:
    - `.storage(...)`
    - `.chunk_size(...)`
"
))]
pub struct TableConfiguration {
    #[builder(setter(doc = "Set the id of the table. Must be unique on every partition the table is created on. Required."))]
    pub table_id: TableId,
    #[builder(setter(doc = "Set the consistency model of the table and its parameters. Required."))]
    pub consistency: ConsistencyKind,
    #[builder(default = StorageKind::Map, setter(doc = "Set the storage strategy of the table. Optional, defaults to `StorageKind::Map`."))]
    pub storage: StorageKind,
    #[builder(default = 1, setter(doc = "Set the number of value slots owned by every key. Optional, defaults to 1."))]
    pub chunk_size: usize,
}

impl TableConfiguration {
    /// Build the model that serves this table on a partition owning `key_range`, replying through
    /// `reply`.
    pub fn build_model<V: Value>(
        &self,
        key_range: Option<KeyRange>,
        reply: ReplyHandle,
    ) -> Result<Box<dyn ConsistencyModel>, ConfigError> {
        let storage = self.build_storage::<V>(key_range)?;
        let model: Box<dyn ConsistencyModel> = match self.consistency {
            ConsistencyKind::Bsp => Box::new(BspModel::new(self.table_id, storage, reply)),
            ConsistencyKind::Asp => Box::new(AspModel::new(self.table_id, storage, reply)),
            ConsistencyKind::Ssp { staleness } => Box::new(SspModel::new(self.table_id, storage, reply, staleness)),
            ConsistencyKind::SparseSsp { staleness, speculation, recorder } => {
                let recorder: Box<dyn ConflictRecorder> = match recorder {
                    RecorderKind::Map => Box::new(MapConflictRecorder::new()),
                    RecorderKind::Ring => Box::new(RingConflictRecorder::new(
                        staleness,
                        speculation,
                        self.require_key_range(key_range)?,
                    )),
                };
                Box::new(SparseSspModel::new(self.table_id, storage, recorder, reply, staleness, speculation))
            }
        };
        log::debug!("Built {:?} model for table {} over {:?}.", self.consistency, self.table_id, key_range);
        Ok(model)
    }

    fn build_storage<V: Value>(&self, key_range: Option<KeyRange>) -> Result<Box<dyn Storage>, ConfigError> {
        Ok(match self.storage {
            StorageKind::Map => Box::new(MapStorage::<V>::with_chunk_size(self.chunk_size)),
            StorageKind::Vector => Box::new(VectorStorage::<V>::with_chunk_size(
                self.require_key_range(key_range)?,
                self.chunk_size,
            )),
        })
    }

    fn require_key_range(&self, key_range: Option<KeyRange>) -> Result<KeyRange, ConfigError> {
        key_range.ok_or(ConfigError::MissingKeyRange { table_id: self.table_id })
    }
}

/// Enumerates the ways building a model from a [`TableConfiguration`] can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A dense strategy was selected for `table_id`, but no key range was supplied.
    MissingKeyRange { table_id: TableId },
}

#[test]
fn dense_strategies_require_key_range_test() {
    use std::sync::mpsc;

    let (reply_sender, _reply_receiver) = mpsc::channel();
    let reply = ReplyHandle::new(reply_sender);

    let map_config = TableConfiguration::builder()
        .table_id(TableId::new(0))
        .consistency(ConsistencyKind::SparseSsp { staleness: 1, speculation: 1, recorder: RecorderKind::Map })
        .build();
    assert_eq!(map_config.storage, StorageKind::Map);
    assert_eq!(map_config.chunk_size, 1);
    assert!(map_config.build_model::<i32>(None, reply.clone()).is_ok());

    let ring_config = TableConfiguration::builder()
        .table_id(TableId::new(1))
        .consistency(ConsistencyKind::SparseSsp { staleness: 1, speculation: 1, recorder: RecorderKind::Ring })
        .build();
    assert_eq!(
        ring_config.build_model::<i32>(None, reply.clone()).err(),
        Some(ConfigError::MissingKeyRange { table_id: TableId::new(1) })
    );

    let vector_config = TableConfiguration::builder()
        .table_id(TableId::new(2))
        .consistency(ConsistencyKind::Bsp)
        .storage(StorageKind::Vector)
        .chunk_size(4)
        .build();
    let model = vector_config.build_model::<f64>(Some(KeyRange::new(0, 8).unwrap()), reply).unwrap();
    assert_eq!(model.table_id(), TableId::new(2));
}
