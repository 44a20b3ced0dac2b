/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The server-side consistency and storage engine of a parameter server.
//!
//! Workers push additive updates ("Add") and pull current values ("Get") for keys sharded across server
//! partitions. Every partition runs one [dispatch loop](server_thread) that routes inbound
//! [messages](messages) to the [consistency model](consistency) of the addressed table. The model
//! decides, based on the [progress](progress_tracker) of every worker, when an Add is applied to
//! [storage](storage) and when a Get is answered:
//! - [BSP](consistency::bsp): every round is a barrier.
//! - [ASP](consistency::asp): nothing ever waits.
//! - [SSP](consistency::ssp): Gets wait until their sender is at most `staleness` rounds ahead of the
//!   slowest worker.
//! - [SparseSSP](consistency::sparse_ssp): Gets may race up to `speculation` further rounds ahead, as
//!   long as the [conflict recorder](conflict_recorder) shows that no outstanding update can affect
//!   them.
//!
//! Completed replies are pushed onto a reply queue shared by every table of a partition. The transport
//! that delivers messages to the inbound queues and drains the reply queue is outside of this crate.

pub mod config;

pub mod conflict_recorder;

pub mod consistency;

pub(crate) mod event_bus;

pub mod events;

pub mod logging;

pub mod messages;

pub mod pending_buffer;

pub mod progress_tracker;

pub mod server_thread;

pub mod storage;

pub mod types;
