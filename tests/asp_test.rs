use log::LevelFilter;
use paramserver_rs::{
    consistency::{asp::AspModel, ConsistencyModel, ModelError},
    storage::MapStorage,
    types::{ClockValue, TableId},
};

mod common;

use crate::common::{
    logging::setup_logger,
    replies::{assert_no_reply, pop_reply, pop_reset_ack, reply_queue},
    worker::Worker,
};

const TABLE: TableId = TableId::new(2);

#[test]
fn asp_never_blocks_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Initialize an ASP table with workers 0 and 1.
    let (reply, replies) = reply_queue();
    let mut model = AspModel::new(TABLE, Box::new(MapStorage::<u64>::new()), reply);
    let (w0, w1) = (Worker::new(0, TABLE), Worker::new(1, TABLE));
    model.reset_worker(w0.reset_worker(&[0, 1])).unwrap();
    pop_reset_ack(&replies);

    // 2. Worker 0 runs far ahead of worker 1. Nothing waits.
    for round in 0..10 {
        model.add(w0.add(round, &[7, 8], &[1u64, 2])).unwrap();
        model.clock(w0.clock(round)).unwrap();
        assert_no_reply(&replies);
    }
    assert_eq!(model.progress(w0.id()).unwrap(), ClockValue::new(10));
    assert_eq!(model.min_clock(), ClockValue::new(0));

    // 3. Worker 1, still in round 0, sees every Add.
    model.get(w1.get(0, &[8, 7, 9])).unwrap();
    let reply = pop_reply::<u64>(&replies);
    assert_eq!(reply.keys, vec![8, 7, 9]);
    assert_eq!(reply.values, vec![20, 10, 0]);

    // 4. Clocks still move the min clock.
    model.clock(w1.clock(0)).unwrap();
    assert_eq!(model.min_clock(), ClockValue::new(1));
    assert_no_reply(&replies);

    // 5. After a reset, only the new worker set is accepted.
    model.reset_worker(w0.reset_worker(&[5])).unwrap();
    pop_reset_ack(&replies);
    assert!(matches!(model.get(w0.get(0, &[7])), Err(ModelError::ProgressError(_))));
    model.get(Worker::new(5, TABLE).get(0, &[7])).unwrap();
    assert_eq!(pop_reply::<u64>(&replies).values, vec![10]);
}
