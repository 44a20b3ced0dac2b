use log::LevelFilter;
use paramserver_rs::{
    consistency::{bsp::BspModel, ConsistencyModel, ModelError, ProtocolViolation},
    progress_tracker::ProgressError,
    storage::MapStorage,
    types::{ClockValue, TableId, WorkerId},
};
use rand::{seq::SliceRandom, Rng};

mod common;

use crate::common::{
    logging::setup_logger,
    replies::{assert_no_reply, pop_reply, pop_reset_ack, reply_queue},
    worker::Worker,
};

const TABLE: TableId = TableId::new(0);

#[test]
fn bsp_get_waits_for_round_to_close_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Initialize a BSP table with workers 2 and 3.
    let (reply, replies) = reply_queue();
    let mut model = BspModel::new(TABLE, Box::new(MapStorage::<i32>::new()), reply);
    let (w2, w3) = (Worker::new(2, TABLE), Worker::new(3, TABLE));
    model.reset_worker(w2.reset_worker(&[2, 3])).unwrap();
    let ack = pop_reset_ack(&replies);
    assert_eq!(ack.recver(), WorkerId::new(2));

    // 2. Worker 2 reads in round 0 and is answered immediately.
    model.get(w2.get(0, &[0])).unwrap();
    let reply = pop_reply::<i32>(&replies);
    assert_eq!(reply.recver, w2.id());
    assert_eq!(reply.values, vec![0]);

    // 3. Worker 2 writes in round 0. The Add is held until the round closes.
    model.add(w2.add(0, &[0], &[100])).unwrap();
    assert_eq!(model.add_pending_size(), 1);

    // 4. Worker 2 finishes round 0 and reads again. Its Get waits for worker 3.
    model.clock(w2.clock(0)).unwrap();
    assert_eq!(model.progress(w2.id()).unwrap(), ClockValue::new(1));
    assert_eq!(model.min_clock(), ClockValue::new(0));
    model.get(w2.get(1, &[0])).unwrap();
    assert_no_reply(&replies);
    assert_eq!(model.get_pending_size(), 1);

    // 5. Worker 3 is still in round 0, and must not see worker 2's Add.
    model.get(w3.get(0, &[0])).unwrap();
    let reply = pop_reply::<i32>(&replies);
    assert_eq!(reply.recver, w3.id());
    assert_eq!(reply.values, vec![0]);

    // 6. Worker 3 finishes round 0: the Add is applied and worker 2's Get is answered.
    log::debug!("Closing round 0.");
    model.clock(w3.clock(0)).unwrap();
    assert_eq!(model.min_clock(), ClockValue::new(1));
    assert_eq!(model.add_pending_size(), 0);
    assert_eq!(model.get_pending_size(), 0);
    let reply = pop_reply::<i32>(&replies);
    assert_eq!(reply.recver, w2.id());
    assert_eq!(reply.values, vec![100]);

    // 7. Both workers now see the Add.
    model.get(w3.get(1, &[0])).unwrap();
    assert_eq!(pop_reply::<i32>(&replies).values, vec![100]);
    assert_no_reply(&replies);
}

#[test]
fn bsp_protocol_violations_test() {
    setup_logger(LevelFilter::Trace);

    let (reply, replies) = reply_queue();
    let mut model = BspModel::new(TABLE, Box::new(MapStorage::<i32>::new()), reply);
    let (w2, w3, stranger) = (Worker::new(2, TABLE), Worker::new(3, TABLE), Worker::new(9, TABLE));
    model.reset_worker(w2.reset_worker(&[2, 3])).unwrap();
    pop_reset_ack(&replies);

    // 1. Messages from unregistered workers are rejected.
    assert!(matches!(
        model.get(stranger.get(0, &[0])),
        Err(ModelError::ProgressError(ProgressError::InvalidWorker { .. }))
    ));
    assert!(matches!(
        model.clock(stranger.clock(0)),
        Err(ModelError::ProgressError(ProgressError::InvalidWorker { .. }))
    ));

    // 2. An Add from a worker that already finished the round being synchronized is rejected.
    model.clock(w2.clock(0)).unwrap();
    match model.add(w2.add(1, &[0], &[1])) {
        Err(ModelError::ProtocolViolation(ProtocolViolation::AddAtWrongProgress { worker, progress, expected })) => {
            assert_eq!(worker, w2.id());
            assert_eq!(progress, ClockValue::new(1));
            assert_eq!(expected, ClockValue::new(0));
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // 3. Worker 3 can still write in round 0.
    model.add(w3.add(0, &[0], &[1])).unwrap();
    assert_no_reply(&replies);
}

#[test]
fn bsp_apply_order_does_not_matter_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Every worker writes a random value to every key in round 0, in a random order.
    let mut rng = rand::thread_rng();
    let worker_ids: Vec<u32> = (0..4).collect();
    let workers: Vec<Worker> = worker_ids.iter().map(|id| Worker::new(*id, TABLE)).collect();
    let keys: Vec<u64> = (0..8).collect();

    let mut adds = Vec::new();
    let mut expected = vec![0i64; keys.len()];
    for worker in &workers {
        for key in &keys {
            let value: i64 = rng.gen_range(-1000, 1000);
            expected[*key as usize] += value;
            adds.push(worker.add(0, &[*key], &[value]));
        }
    }

    for _ in 0..3 {
        adds.shuffle(&mut rng);

        let (reply, replies) = reply_queue();
        let mut model = BspModel::new(TABLE, Box::new(MapStorage::<i64>::new()), reply);
        model.reset_worker(workers[0].reset_worker(&worker_ids)).unwrap();
        pop_reset_ack(&replies);

        for add in adds.iter().cloned() {
            model.add(add).unwrap();
        }

        // 2. Worker 0 finishes the round first and reads. It sees the sums only after everyone clocks.
        model.clock(workers[0].clock(0)).unwrap();
        model.get(workers[0].get(1, &keys)).unwrap();
        assert_no_reply(&replies);
        for worker in &workers[1..] {
            model.clock(worker.clock(0)).unwrap();
        }
        assert_eq!(pop_reply::<i64>(&replies).values, expected);
    }
}
