use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::distributor::{DeliveryOutcome, Distributor, SinkId, SinkStatus, SinkSummary};
use crate::frame::{Frame, PixelFormat, StreamFormat};
use crate::sink::{DeliveryPolicy, SinkRegistration};
use crate::testutil::{frame, TestSink};

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn summary(dist: &Distributor, id: SinkId) -> SinkSummary {
    dist.summaries()
        .into_iter()
        .find(|s| s.id == id)
        .expect("sink summary")
}

#[test]
fn test_drop_oldest_keeps_latest() {
    let dist = Distributor::new(3, Duration::from_secs(1));
    let (sink, record) = TestSink::new("slow");
    let (sink, gate) = sink.gated();
    let id = dist
        .register(SinkRegistration::new(sink).policy(DeliveryPolicy::DropOldest))
        .unwrap();

    dist.distribute(frame(1, 1));
    // the worker now holds frame 1 and waits on the gate
    wait_until(|| summary(&dist, id).queued == 0);

    for seq in 2..=10 {
        let outcomes = dist.distribute(frame(seq, seq as u8));
        assert_eq!(outcomes, vec![(id, DeliveryOutcome::Delivered)]);
    }
    assert_eq!(summary(&dist, id).queued, 3);

    drop(gate);
    let summaries = dist.shutdown();
    assert_eq!(record.seqs(), vec![1, 8, 9, 10]);
    assert_eq!(summaries[0].dropped, 6);
    assert_eq!(summaries[0].delivered, 4);
    assert_eq!(summaries[0].status, SinkStatus::Finalized);
    assert!(record.finalized());
}

#[test]
fn test_block_and_drop_newest() {
    let dist = Distributor::new(2, Duration::from_secs(2));
    let (fast, fast_record) = TestSink::new("fast");
    let fast_id = dist
        .register(SinkRegistration::new(fast).policy(DeliveryPolicy::Block))
        .unwrap();
    let (slow, slow_record) = TestSink::new("slow");
    let (slow, gate) = slow.gated();
    let slow_id = dist
        .register(SinkRegistration::new(slow).policy(DeliveryPolicy::DropNewest))
        .unwrap();

    dist.distribute(frame(1, 1));
    wait_until(|| summary(&dist, slow_id).queued == 0);

    let mut slow_outcomes = Vec::new();
    for seq in 2..=10 {
        for (id, outcome) in dist.distribute(frame(seq, seq as u8)) {
            if id == fast_id {
                assert!(matches!(
                    outcome,
                    DeliveryOutcome::Delivered | DeliveryOutcome::BlockedThenDelivered
                ));
            } else {
                slow_outcomes.push(outcome);
            }
        }
    }
    assert_eq!(&slow_outcomes[..2], &[DeliveryOutcome::Delivered; 2]);
    assert!(slow_outcomes[2..].iter().all(|o| *o == DeliveryOutcome::Dropped));

    drop(gate);
    dist.shutdown();
    assert_eq!(fast_record.seqs(), (1..=10).collect::<Vec<_>>());
    assert_eq!(slow_record.seqs(), vec![1, 2, 3]);
}

#[test]
fn test_failed_sink_is_removed_others_continue() {
    let dist = Distributor::new(4, Duration::from_secs(1));
    let (bad, bad_record) = TestSink::new("bad");
    let bad_id = dist.register(SinkRegistration::new(bad.fail_at(3))).unwrap();
    let (good, good_record) = TestSink::new("good");
    dist.register(SinkRegistration::new(good).policy(DeliveryPolicy::Block))
        .unwrap();

    let mut seq = 0;
    let mut removed = false;
    while seq < 6 || dist.sink_count() > 1 {
        seq += 1;
        assert!(seq < 500, "failed sink never pruned");
        for (id, outcome) in dist.distribute(frame(seq, 1)) {
            if id == bad_id && outcome == DeliveryOutcome::Removed {
                removed = true;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(removed);
    assert_eq!(dist.sink_ids().len(), 1);

    let summaries = dist.shutdown();
    assert_eq!(bad_record.seqs(), vec![1, 2]);
    assert!(bad_record.finalized());
    assert!(matches!(summaries[0].status, SinkStatus::Failed(_)));
    assert_eq!(good_record.seqs(), (1..=seq).collect::<Vec<_>>());
    assert_eq!(summaries[1].status, SinkStatus::Finalized);
}

#[test]
fn test_blocking_sink_stall_is_removed() {
    let dist = Distributor::new(1, Duration::from_millis(50));
    let (stuck, _record) = TestSink::new("stuck");
    let (stuck, gate) = stuck.gated();
    let id = dist
        .register(SinkRegistration::new(stuck).policy(DeliveryPolicy::Block))
        .unwrap();
    let (other, other_record) = TestSink::new("other");
    dist.register(SinkRegistration::new(other).policy(DeliveryPolicy::Block))
        .unwrap();

    dist.distribute(frame(1, 1));
    wait_until(|| summary(&dist, id).queued == 0);
    assert_eq!(dist.distribute(frame(2, 2))[0], (id, DeliveryOutcome::Delivered));

    let started = Instant::now();
    let outcomes = dist.distribute(frame(3, 3));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(outcomes[0], (id, DeliveryOutcome::Stalled));
    assert_eq!(dist.sink_count(), 1);

    dist.distribute(frame(4, 4));
    let summaries = dist.shutdown();
    assert_eq!(summaries[0].status, SinkStatus::Stalled);
    assert_eq!(other_record.seqs(), vec![1, 2, 3, 4]);
    drop(gate);
}

#[test]
fn test_shutdown_detaches_hung_sink() {
    let dist = std::sync::Arc::new(Distributor::new(2, Duration::from_millis(100)));
    let (hung, hung_record) = TestSink::new("hung");
    let (hung, gate) = hung.gated();
    let hung_id = dist
        .register(SinkRegistration::new(hung).policy(DeliveryPolicy::DropOldest))
        .unwrap();
    let (good, good_record) = TestSink::new("good");
    dist.register(SinkRegistration::new(good).policy(DeliveryPolicy::Block))
        .unwrap();

    dist.distribute(frame(1, 1));
    wait_until(|| summary(&dist, hung_id).queued == 0);
    dist.distribute(frame(2, 2));

    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = {
        let dist = dist.clone();
        std::thread::spawn(move || {
            let _ = tx.send(dist.shutdown());
        })
    };
    let summaries = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("shutdown waited on a hung sink");
    handle.join().unwrap();

    assert_eq!(
        summaries[0].status,
        SinkStatus::Failed("finalize timeout".to_string())
    );
    assert_eq!(summaries[1].status, SinkStatus::Finalized);
    assert_eq!(good_record.seqs(), vec![1, 2]);

    // the released worker stops instead of consuming the rest of its queue
    drop(gate);
    wait_until(|| hung_record.finalized());
    assert_eq!(hung_record.seqs(), vec![1]);
}

#[test]
fn test_config_error_disables_sink() {
    let dist = Distributor::new(4, Duration::from_secs(1));
    let (picky, picky_record) = TestSink::new("picky");
    dist.register(SinkRegistration::new(picky.reject_config()))
        .unwrap();
    let (good, good_record) = TestSink::new("good");
    dist.register(SinkRegistration::new(good).policy(DeliveryPolicy::Block))
        .unwrap();

    let mut seq = 0;
    while dist.sink_count() > 1 {
        seq += 1;
        assert!(seq < 500, "disabled sink never pruned");
        dist.distribute(frame(seq, 1));
        std::thread::sleep(Duration::from_millis(2));
    }

    let summaries = dist.shutdown();
    assert!(picky_record.seqs().is_empty());
    assert!(picky_record.finalized());
    assert!(matches!(summaries[0].status, SinkStatus::Disabled(_)));
    assert_eq!(good_record.seqs().len(), seq as usize);
}

#[test]
fn test_shutdown_drains_queues() {
    let dist = Distributor::new(8, Duration::from_secs(1));
    let (sink, record) = TestSink::new("paced");
    dist.register(
        SinkRegistration::new(sink.paced(Duration::from_millis(10)))
            .policy(DeliveryPolicy::Block),
    )
    .unwrap();

    for seq in 1..=5 {
        dist.distribute(frame(seq, 1));
    }
    let summaries = dist.shutdown();

    assert_eq!(record.seqs(), vec![1, 2, 3, 4, 5]);
    assert_eq!(summaries[0].delivered, 5);
    assert_eq!(summaries[0].status, SinkStatus::Finalized);
    assert!(dist.distribute(frame(6, 1)).is_empty());
    assert!(dist.register(SinkRegistration::new(TestSink::new("late").0)).is_err());
}

#[test]
fn test_deregister() {
    let dist = Distributor::new(4, Duration::from_secs(1));
    let (sink, record) = TestSink::new("removable");
    let id = dist.register(SinkRegistration::new(sink)).unwrap();

    dist.distribute(frame(1, 1));
    wait_until(|| record.seqs() == vec![1]);

    assert!(dist.deregister(id));
    assert!(!dist.deregister(id));
    assert!(dist.distribute(frame(2, 2)).is_empty());

    let summaries = dist.shutdown();
    assert_eq!(summaries[0].status, SinkStatus::Removed);
    assert!(record.finalized());
}

#[test]
fn test_converts_and_reconfigures_on_format_change() {
    let dist = Distributor::new(4, Duration::from_secs(1));
    let (sink, record) = TestSink::new("rgb");
    dist.register(
        SinkRegistration::new(sink.requiring(PixelFormat::Rgb24)).policy(DeliveryPolicy::Block),
    )
    .unwrap();

    dist.distribute(frame(1, 128));
    dist.distribute(frame(2, 128));
    let bigger = StreamFormat::new(8, 4, PixelFormat::Yuv420p);
    dist.distribute(Frame::new(
        Bytes::from(vec![128; bigger.frame_size()]),
        bigger,
        3,
        1,
        None,
    ));
    dist.shutdown();

    assert_eq!(record.seqs(), vec![1, 2, 3]);
    assert_eq!(
        record.formats(),
        vec![
            StreamFormat::new(4, 2, PixelFormat::Rgb24),
            StreamFormat::new(8, 4, PixelFormat::Rgb24),
        ]
    );
}
