use std::sync::mpsc::Receiver;

use log::LevelFilter;
use paramserver_rs::{
    conflict_recorder::{ConflictError, ConflictRecorder, MapConflictRecorder, RingConflictRecorder},
    consistency::{sparse_ssp::SparseSspModel, ConsistencyModel, ModelError, ProtocolViolation},
    messages::Message,
    storage::MapStorage,
    types::{ClockValue, KeyRange, TableId},
};

mod common;

use crate::common::{
    logging::setup_logger,
    replies::{assert_no_reply, pop_reply, pop_reset_ack, reply_queue},
    worker::Worker,
};

const TABLE: TableId = TableId::new(3);

fn recorders(staleness: u64, speculation: u64) -> Vec<(&'static str, Box<dyn ConflictRecorder>)> {
    vec![
        ("map", Box::new(MapConflictRecorder::new())),
        (
            "ring",
            Box::new(RingConflictRecorder::new(staleness, speculation, KeyRange::new(0, 10).unwrap())),
        ),
    ]
}

// Build a SparseSSP table over workers 2 and 3, with its ResetWorker acknowledgement already consumed.
fn model_with_workers(
    recorder: Box<dyn ConflictRecorder>,
    staleness: u64,
    speculation: u64,
) -> (SparseSspModel, Receiver<Message>, Worker, Worker) {
    let (reply, replies) = reply_queue();
    let mut model = SparseSspModel::new(
        TABLE,
        Box::new(MapStorage::<i64>::new()),
        recorder,
        reply,
        staleness,
        speculation,
    );
    let (w2, w3) = (Worker::new(2, TABLE), Worker::new(3, TABLE));
    model.reset_worker(w2.reset_worker(&[2, 3])).unwrap();
    pop_reset_ack(&replies);
    (model, replies, w2, w3)
}

#[test]
fn sparse_ssp_get_and_add_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(2, 2) {
        log::debug!("Running with the {} recorder.", name);
        let (mut model, replies, w2, w3) = model_with_workers(recorder, 2, 2);

        // 1. Both workers register Gets for round 1 while still in round 0.
        model.get(w2.get(1, &[1])).unwrap();
        model.get(w3.get(1, &[1])).unwrap();
        assert_eq!(model.future_get_size(), 2);
        assert_eq!(model.reference_count(ClockValue::new(1), 1).unwrap(), 2);
        assert_no_reply(&replies);

        // 2. Both workers add to key 1 in round 0.
        model.add(w2.add(0, &[1], &[1i64])).unwrap();
        model.add(w3.add(0, &[1], &[1i64])).unwrap();

        // 3. Worker 3 finishes round 0, which makes its registered Get due.
        model.clock(w3.clock(0)).unwrap();
        let reply = pop_reply::<i64>(&replies);
        assert_eq!(reply.recver, w3.id());
        assert_eq!(reply.version, Some(ClockValue::new(1)));
        assert_eq!(reply.values, vec![2]);
        assert_eq!(model.future_get_size(), 1);

        // 4. Worker 2 follows.
        model.clock(w2.clock(0)).unwrap();
        assert_eq!(model.min_clock(), ClockValue::new(1));
        let reply = pop_reply::<i64>(&replies);
        assert_eq!(reply.recver, w2.id());
        assert_eq!(reply.values, vec![2]);
        assert_eq!(model.future_get_size(), 0);
        assert_no_reply(&replies);
    }
}

#[test]
fn sparse_ssp_speculation_without_conflict_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(2, 2) {
        log::debug!("Running with the {} recorder.", name);
        let (mut model, replies, w2, w3) = model_with_workers(recorder, 2, 2);

        // 1. Worker 2 writes key 0 in round 0.
        model.add(w2.add(0, &[0], &[1i64])).unwrap();

        // 2. Worker 3 races ahead on key 1, which only it reads and writes. Rounds up to m + s are
        //    answered like SSP, and rounds up to m + s + k are answered speculatively.
        for version in 0..4 {
            model.get(w3.get(version, &[1])).unwrap();
            let reply = pop_reply::<i64>(&replies);
            assert_eq!(reply.version, Some(ClockValue::new(version)));
            assert_eq!(reply.values, vec![version as i64]);
            model.add(w3.add(version, &[1], &[1i64])).unwrap();
            model.clock(w3.clock(version)).unwrap();
        }
        assert_eq!(model.progress(w3.id()).unwrap(), ClockValue::new(4));
        assert_eq!(model.min_clock(), ClockValue::new(0));

        // 3. Round 4 is m + s + k, still inside the window.
        model.get(w3.get(4, &[1])).unwrap();
        assert_eq!(pop_reply::<i64>(&replies).values, vec![4]);

        // 4. Worker 2 reads its own write.
        model.get(w2.get(0, &[0])).unwrap();
        assert_eq!(pop_reply::<i64>(&replies).values, vec![1]);
        assert_no_reply(&replies);
    }
}

#[test]
fn sparse_ssp_forwarding_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(1, 1) {
        log::debug!("Running with the {} recorder.", name);
        let (mut model, replies, w2, w3) = model_with_workers(recorder, 1, 1);

        // 1. Both workers read key 5 in round 0, and so may write it in round 0.
        model.get(w2.get(0, &[5])).unwrap();
        model.get(w3.get(0, &[5])).unwrap();
        assert_eq!(pop_reply::<i64>(&replies).recver, w2.id());
        assert_eq!(pop_reply::<i64>(&replies).recver, w3.id());
        assert_eq!(model.reference_count(ClockValue::new(0), 5).unwrap(), 2);

        // 2. Worker 2 moves to round 1, which is within the staleness bound.
        model.get(w2.get(1, &[5])).unwrap();
        model.clock(w2.clock(0)).unwrap();
        assert_eq!(pop_reply::<i64>(&replies).version, Some(ClockValue::new(1)));
        assert_eq!(model.reference_count(ClockValue::new(0), 5).unwrap(), 1);

        // 3. Worker 2 moves to round 2, which is speculative. Worker 3 may still write key 5 in round 0,
        //    so the Get is forwarded onto that record.
        model.get(w2.get(2, &[5])).unwrap();
        model.clock(w2.clock(1)).unwrap();
        assert_no_reply(&replies);

        // 4. Worker 3 writes key 5 and finishes round 0. The forwarded Get sees the write.
        model.add(w3.add(0, &[5], &[7i64])).unwrap();
        model.clock(w3.clock(0)).unwrap();
        assert_eq!(model.min_clock(), ClockValue::new(1));
        let reply = pop_reply::<i64>(&replies);
        assert_eq!(reply.recver, w2.id());
        assert_eq!(reply.version, Some(ClockValue::new(2)));
        assert_eq!(reply.values, vec![7]);
        assert_eq!(model.reference_count(ClockValue::new(0), 5).unwrap(), 0);
        assert_no_reply(&replies);
    }
}

#[test]
fn sparse_ssp_too_fast_get_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(1, 1) {
        log::debug!("Running with the {} recorder.", name);
        let (mut model, replies, w2, w3) = model_with_workers(recorder, 1, 1);

        // 1. Worker 2 registers a Get for round 3 and clocks its way there while worker 3 is in round 0.
        model.get(w2.get(3, &[1])).unwrap();
        for version in 0..3 {
            model.clock(w2.clock(version)).unwrap();
        }
        assert_eq!(model.progress(w2.id()).unwrap(), ClockValue::new(3));

        // 2. Round 3 is m + s + k + 1: the Get is parked.
        assert_eq!(model.too_fast_size(), 1);
        assert_no_reply(&replies);

        // 3. Worker 3 finishes round 0. The Get is reconsidered against the new min clock and answered.
        model.add(w3.add(0, &[1], &[4i64])).unwrap();
        model.clock(w3.clock(0)).unwrap();
        assert_eq!(model.too_fast_size(), 0);
        let reply = pop_reply::<i64>(&replies);
        assert_eq!(reply.recver, w2.id());
        assert_eq!(reply.values, vec![4]);
    }
}

#[test]
fn sparse_ssp_parked_clock_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(1, 1) {
        log::debug!("Running with the {} recorder.", name);
        let (mut model, _replies, w2, w3) = model_with_workers(recorder, 1, 1);

        // 1. Worker 2 reaches round 3 while worker 3 is in round 0.
        for version in 0..3 {
            model.clock(w2.clock(version)).unwrap();
        }

        // 2. A Clock for round 3 arrives at the edge of the window, and is parked.
        model.clock(w2.clock(3)).unwrap();
        assert_eq!(model.parked_clock_size(), 1);
        assert_eq!(model.progress(w2.id()).unwrap(), ClockValue::new(3));

        // 3. A Clock beyond the edge of the window is a violation.
        match model.clock(w2.clock(4)) {
            Err(ModelError::ProtocolViolation(ProtocolViolation::ClockTooFarAhead { version, min_clock, .. })) => {
                assert_eq!(version, ClockValue::new(4));
                assert_eq!(min_clock, ClockValue::new(0));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // 4. Worker 3 finishes round 0, and the parked Clock is replayed.
        model.clock(w3.clock(0)).unwrap();
        assert_eq!(model.parked_clock_size(), 0);
        assert_eq!(model.progress(w2.id()).unwrap(), ClockValue::new(4));
    }
}

#[test]
fn sparse_ssp_end_to_end_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(2, 2) {
        log::debug!("Running with the {} recorder.", name);
        let (mut model, replies, w2, w3) = model_with_workers(recorder, 2, 2);

        // 1. Both workers write and read in round 0.
        model.add(w2.add(0, &[0], &[0i64])).unwrap();
        model.add(w3.add(0, &[1], &[1i64])).unwrap();
        model.get(w2.get(0, &[0])).unwrap();
        let reply = pop_reply::<i64>(&replies);
        assert_eq!((reply.recver, reply.keys, reply.values), (w2.id(), vec![0], vec![0]));
        model.get(w3.get(0, &[1])).unwrap();
        let reply = pop_reply::<i64>(&replies);
        assert_eq!((reply.recver, reply.keys, reply.values), (w3.id(), vec![1], vec![1]));

        // 2. Worker 3 writes key 1 again and registers Gets for rounds 1 and 2. Neither is due yet.
        model.add(w3.add(0, &[1], &[1i64])).unwrap();
        model.get(w3.get(1, &[1])).unwrap();
        model.get(w3.get(2, &[1])).unwrap();
        assert_no_reply(&replies);
        assert_eq!(model.future_get_size(), 2);

        // 3. Worker 3 finishes round 0, which releases its round 1 Get only.
        model.clock(w3.clock(0)).unwrap();
        let reply = pop_reply::<i64>(&replies);
        assert_eq!(reply.recver, w3.id());
        assert_eq!(reply.version, Some(ClockValue::new(1)));
        assert_eq!((reply.keys, reply.values), (vec![1], vec![2]));
        assert_eq!(model.future_get_size(), 1);
        assert_no_reply(&replies);
    }
}

#[test]
fn sparse_ssp_reforwarding_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(0, 2) {
        log::debug!("Running with the {} recorder.", name);

        // 1. Initialize a table with staleness 0, speculation 2 and workers 1, 2 and 3.
        let (reply, replies) = reply_queue();
        let mut model =
            SparseSspModel::new(TABLE, Box::new(MapStorage::<i64>::new()), recorder, reply, 0, 2);
        let (w1, w2, w3) = (Worker::new(1, TABLE), Worker::new(2, TABLE), Worker::new(3, TABLE));
        model.reset_worker(w1.reset_worker(&[1, 2, 3])).unwrap();
        pop_reset_ack(&replies);

        // 2. Worker 2 reads key 5 in round 0, so it may still write key 5 in round 0.
        model.get(w2.get(0, &[5])).unwrap();
        assert_eq!(pop_reply::<i64>(&replies).recver, w2.id());

        // 3. Worker 3 registers a read of key 5 for round 1, and worker 1 for round 2.
        model.get(w3.get(1, &[5])).unwrap();
        model.get(w1.get(2, &[5])).unwrap();

        // 4. Worker 1 reaches round 2. Its Get is forwarded onto the newest conflicting record,
        //    worker 3's record at round 1.
        model.clock(w1.clock(0)).unwrap();
        model.clock(w1.clock(1)).unwrap();
        assert_no_reply(&replies);
        assert_eq!(model.reference_count(ClockValue::new(1), 5).unwrap(), 1);

        // 5. Worker 3 finishes rounds 0 and 1. Its own round 1 Get waits on worker 2's record, and
        //    retiring its round 1 record moves worker 1's Get onto worker 2's record as well.
        model.clock(w3.clock(0)).unwrap();
        model.clock(w3.clock(1)).unwrap();
        assert_no_reply(&replies);
        assert_eq!(model.reference_count(ClockValue::new(1), 5).unwrap(), 0);
        assert_eq!(model.reference_count(ClockValue::new(0), 5).unwrap(), 1);

        // 6. Worker 2 writes key 5 and finishes round 0. Both Gets see the write.
        model.add(w2.add(0, &[5], &[9i64])).unwrap();
        model.clock(w2.clock(0)).unwrap();
        assert_eq!(model.min_clock(), ClockValue::new(1));
        let mut released: Vec<_> = (0..2).map(|_| pop_reply::<i64>(&replies)).collect();
        released.sort_by_key(|reply| reply.recver);
        assert_eq!(released[0].recver, w1.id());
        assert_eq!(released[0].version, Some(ClockValue::new(2)));
        assert_eq!(released[0].values, vec![9]);
        assert_eq!(released[1].recver, w3.id());
        assert_eq!(released[1].version, Some(ClockValue::new(1)));
        assert_eq!(released[1].values, vec![9]);
        assert_no_reply(&replies);
    }
}

#[test]
fn sparse_ssp_rejected_get_leaves_no_registration_test() {
    setup_logger(LevelFilter::Trace);

    let recorder = Box::new(RingConflictRecorder::new(1, 1, KeyRange::new(0, 10).unwrap()));
    let (mut model, replies, w2, w3) = model_with_workers(recorder, 1, 1);

    // 1. Reads of keys outside of the recorder's range are rejected.
    assert!(matches!(
        model.get(w2.get(0, &[20])),
        Err(ModelError::ConflictError(ConflictError::OutOfRange { key: 20, .. }))
    ));
    assert!(matches!(
        model.get(w2.get(1, &[3, 20])),
        Err(ModelError::ConflictError(ConflictError::OutOfRange { key: 20, .. }))
    ));
    assert_eq!(model.reference_count(ClockValue::new(1), 3).unwrap(), 0);
    assert_eq!(model.future_get_size(), 0);

    // 2. The rejected reads left nothing behind, so worker 2 can still clock, and round 0 closes.
    model.clock(w2.clock(0)).unwrap();
    model.clock(w3.clock(0)).unwrap();
    assert_eq!(model.min_clock(), ClockValue::new(1));

    // 3. A read rejected for exceeding the registration limit does not leave a record either.
    model.get(w3.get(2, &[0])).unwrap();
    model.get(w3.get(3, &[0])).unwrap();
    assert!(matches!(
        model.get(w3.get(4, &[0])),
        Err(ModelError::ConflictError(ConflictError::FutureKeysFull { capacity: 2, .. }))
    ));
    assert_eq!(model.reference_count(ClockValue::new(4), 0).unwrap(), 0);

    // 4. Worker 3 keeps going, and its registered reads are answered.
    model.clock(w3.clock(1)).unwrap();
    model.clock(w3.clock(2)).unwrap();
    assert_eq!(pop_reply::<i64>(&replies).version, Some(ClockValue::new(2)));
    assert_eq!(pop_reply::<i64>(&replies).version, Some(ClockValue::new(3)));
    assert_no_reply(&replies);
}

#[test]
fn sparse_ssp_protocol_violations_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(1, 1) {
        log::debug!("Running with the {} recorder.", name);
        let (mut model, _replies, w2, w3) = model_with_workers(recorder, 1, 1);

        // Adds must carry the sender's progress.
        assert!(matches!(
            model.add(w2.add(1, &[0], &[1i64])),
            Err(ModelError::ProtocolViolation(ProtocolViolation::AddAtWrongProgress { .. }))
        ));

        // Gets cannot be registered for a round the sender has already finished.
        model.clock(w2.clock(0)).unwrap();
        assert!(matches!(
            model.get(w2.get(0, &[0])),
            Err(ModelError::ProtocolViolation(ProtocolViolation::GetBehindProgress { .. }))
        ));

        // At most speculation + 1 Gets can be registered ahead of time.
        model.get(w3.get(1, &[0])).unwrap();
        model.get(w3.get(2, &[0])).unwrap();
        assert!(matches!(
            model.get(w3.get(3, &[0])),
            Err(ModelError::ConflictError(ConflictError::FutureKeysFull { capacity: 2, .. }))
        ));

        // Unregistered workers are rejected.
        assert!(matches!(
            model.clock(Worker::new(9, TABLE).clock(0)),
            Err(ModelError::ProgressError(_))
        ));
    }
}

#[test]
fn sparse_ssp_reset_worker_clears_state_test() {
    setup_logger(LevelFilter::Trace);

    for (name, recorder) in recorders(1, 1) {
        log::debug!("Running with the {} recorder.", name);
        let (mut model, replies, w2, w3) = model_with_workers(recorder, 1, 1);

        // 1. Leave a registered Get, a too fast Get and a parked Clock behind.
        model.get(w3.get(1, &[2])).unwrap();
        model.get(w2.get(3, &[1])).unwrap();
        for version in 0..4 {
            model.clock(w2.clock(version)).unwrap();
        }
        assert_eq!(model.future_get_size(), 1);
        assert_eq!(model.too_fast_size(), 1);
        assert_eq!(model.parked_clock_size(), 1);

        // 2. Reset the table to worker 3 alone.
        model.reset_worker(w3.reset_worker(&[3])).unwrap();
        pop_reset_ack(&replies);
        assert_eq!(model.future_get_size(), 0);
        assert_eq!(model.too_fast_size(), 0);
        assert_eq!(model.parked_clock_size(), 0);
        assert_eq!(model.reference_count(ClockValue::new(1), 2).unwrap(), 0);
        assert_eq!(model.reference_count(ClockValue::new(3), 1).unwrap(), 0);
        assert_eq!(model.min_clock(), ClockValue::new(0));

        // 3. Worker 2 is gone, and worker 3 starts from scratch.
        assert!(matches!(model.get(w2.get(0, &[1])), Err(ModelError::ProgressError(_))));
        model.get(w3.get(0, &[1])).unwrap();
        assert_eq!(pop_reply::<i64>(&replies).recver, w3.id());
        assert_no_reply(&replies);
    }
}
