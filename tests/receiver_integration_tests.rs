//! End-to-end receiver scenarios over the in-memory consumer: delivery
//! modes, acknowledgement and commit semantics, demand-driven fetching,
//! rebalances and shutdown.

mod common;

use std::time::Duration;

use futures::StreamExt;
use kafka_receiver::test_utils::MockConsumer;
use kafka_receiver::{AckState, KafkaReceiver, Partition, ReceiverError};

use common::{fast_options, init_logging, wait_until};

#[tokio::test]
async fn acknowledged_prefix_is_committed_pending_tail_is_not() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 10..13);

    let receiver = KafkaReceiver::with_client(mock, fast_options());
    let mut stream = receiver.receive().unwrap();

    let mut records = Vec::new();
    for _ in 0..3 {
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for record")
            .expect("stream ended early")
            .expect("unexpected stream error");
        records.push(record);
    }
    assert_eq!(
        records.iter().map(|r| r.record().offset()).collect::<Vec<_>>(),
        vec![10, 11, 12]
    );

    // Acknowledge 10 and 11; leave 12 untouched.
    records[0].offset().acknowledge().unwrap();
    records[1].offset().acknowledge().unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            control.committed("events", 0) == Some(12)
        })
        .await,
        "expected the flush to commit next-offset 12, got {:?}",
        control.committed("events", 0)
    );
    assert_eq!(records[2].offset().state(), AckState::Pending);
    assert_eq!(records[0].offset().state(), AckState::Committed);
    assert_eq!(records[1].offset().state(), AckState::Committed);
}

#[tokio::test]
async fn immediate_commit_bypasses_batching() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 5..6);

    // Interval so long that only an explicit commit can move the offset.
    let options = fast_options().with_commit_interval(Duration::from_secs(3600));
    let receiver = KafkaReceiver::with_client(mock, options);
    let mut stream = receiver.receive().unwrap();

    let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    record.offset().commit().await.unwrap();
    assert_eq!(record.offset().state(), AckState::Committed);
    assert_eq!(control.committed("events", 0), Some(6));
}

#[tokio::test]
async fn fetching_stops_at_the_demand_bound() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..100);

    let options = fast_options().with_prefetch(4);
    let receiver = KafkaReceiver::with_client(mock, options);
    // Attach the stream but never draw from it: only the prefetch demand
    // is granted and fetching must stop there.
    let _stream = receiver.receive().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(control.fetched_count(), 4);
    assert!(control
        .paused_partitions()
        .contains(&Partition::new("events".to_string(), 0)));
}

#[tokio::test]
async fn drawing_from_the_stream_replenishes_demand() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..50);

    let options = fast_options().with_prefetch(4);
    let receiver = KafkaReceiver::with_client(mock, options);
    let mut stream = receiver.receive().unwrap();

    // Drawing records keeps granting demand, so far more than the initial
    // prefetch flows through.
    for expected in 0..20 {
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for record")
            .expect("stream ended early")
            .expect("unexpected stream error");
        assert_eq!(record.record().offset(), expected);
    }
    assert!(control.fetched_count() >= 20);
}

#[tokio::test]
async fn transient_commit_failure_is_retried_on_the_next_flush() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..1);
    control.fail_next_commits(1);

    let receiver = KafkaReceiver::with_client(mock, fast_options());
    let mut stream = receiver.receive().unwrap();

    let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    record.offset().acknowledge().unwrap();

    // First flush fails, the entry stays pending, the next flush lands it.
    assert!(
        wait_until(Duration::from_secs(2), || {
            control.committed("events", 0) == Some(1)
        })
        .await
    );
    assert_eq!(record.offset().state(), AckState::Committed);
}

#[tokio::test]
async fn at_most_once_commit_retry_exhaustion_is_terminal() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..2);
    // Exhaust all retries for the first record's pre-dispatch commit.
    control.fail_next_commits(3);

    let receiver = KafkaReceiver::with_client(mock, fast_options());
    let mut stream = receiver.receive_at_most_once().unwrap();

    // Offset 0 was never committed and must not be skipped past: the
    // failure surfaces instead of later offsets being delivered.
    let err = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for the failure")
        .expect("stream ended without surfacing the failure")
        .expect_err("expected a commit failure");
    assert!(matches!(err, ReceiverError::Commit(_)));
    assert_eq!(control.committed("events", 0), None);

    let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out");
    assert!(end.is_none());
}

#[tokio::test]
async fn at_most_once_loses_only_records_of_partitions_revoked_mid_commit() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..1);
    control.fail_next_commits(3);

    let receiver = KafkaReceiver::with_client(mock, fast_options());
    let mut stream = receiver.receive_at_most_once().unwrap();

    // Revoke while the pre-dispatch commit is still retrying (the retry
    // window spans well past this point).
    tokio::time::sleep(Duration::from_millis(60)).await;
    control.revoke("events", &[0]);

    // The record is dropped, not delivered, and the receiver stays healthy.
    let quiet = tokio::time::timeout(Duration::from_millis(500), stream.next()).await;
    assert!(quiet.is_err(), "nothing should be delivered or fail");
    assert_eq!(control.committed("events", 0), None);

    let assignment = receiver
        .run_on_loop(|client| client.assignment())
        .await
        .expect("receiver should still be running")
        .expect("assignment failed");
    assert!(assignment.is_empty());
}

#[tokio::test]
async fn committing_a_lower_offset_never_rewinds_the_partition() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..2);

    let options = fast_options().with_commit_interval(Duration::from_secs(3600));
    let receiver = KafkaReceiver::with_client(mock, options);
    let mut stream = receiver.receive().unwrap();

    let mut records = Vec::new();
    for _ in 0..2 {
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        records.push(record);
    }

    // Commit the higher offset first, then the lower one.
    records[1].offset().commit().await.unwrap();
    assert_eq!(control.committed("events", 0), Some(2));

    records[0].offset().commit().await.unwrap();
    assert_eq!(
        control.committed("events", 0),
        Some(2),
        "committing a lower offset must not rewind the committed offset"
    );
    // The lower offset is covered without another broker round trip.
    assert_eq!(control.commit_count(), 1);
    assert_eq!(records[0].offset().state(), AckState::Committed);
}

#[tokio::test]
async fn acks_for_revoked_partitions_are_dropped_not_committed() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0, 1]);
    control.add_records("events", 0, 0..2);

    let receiver = KafkaReceiver::with_client(mock, fast_options());
    let mut stream = receiver.receive().unwrap();

    let mut records = Vec::new();
    for _ in 0..2 {
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        records.push(record);
    }

    // Lose the partition with nothing acknowledged yet, then acknowledge.
    control.revoke("events", &[0]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    for record in &records {
        record.offset().acknowledge().unwrap();
    }

    // The flush drops the unowned entries instead of committing them.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(control.committed("events", 0), None);
    assert_eq!(control.commit_count(), 0);
    assert_eq!(records[0].offset().state(), AckState::Acknowledged);
}

#[tokio::test]
async fn revocation_commits_acknowledged_offsets_before_losing_partitions() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0, 1]);
    control.add_records("events", 0, 0..2);

    let options = fast_options().with_commit_interval(Duration::from_secs(3600));
    let receiver = KafkaReceiver::with_client(mock, options);
    let mut stream = receiver.receive().unwrap();

    for _ in 0..2 {
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        record.offset().acknowledge().unwrap();
    }
    assert_eq!(control.committed("events", 0), None);

    control.revoke("events", &[0]);

    assert!(
        wait_until(Duration::from_secs(2), || {
            control.committed("events", 0) == Some(2)
        })
        .await,
        "revocation must flush acknowledged offsets"
    );
}

#[tokio::test]
async fn fatal_client_error_terminates_the_stream() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);

    let receiver = KafkaReceiver::with_client(mock, fast_options());
    let mut stream = receiver.receive().unwrap();
    control.fail_next_poll_fatal();

    let err = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out")
        .expect("stream ended without surfacing the failure")
        .expect_err("expected a terminal error");
    assert!(matches!(err, ReceiverError::Client(_)));

    // The stream ends after the terminal error.
    let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out");
    assert!(end.is_none());
}

#[tokio::test]
async fn seek_through_run_on_loop_redelivers_from_the_new_position() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..10);

    let receiver = KafkaReceiver::with_client(mock, fast_options());

    // Let the subscription settle before touching the assignment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let partition = Partition::new("events".to_string(), 0);
    receiver
        .run_on_loop(move |client| client.seek(&partition, 7))
        .await
        .expect("receiver closed")
        .expect("seek failed");

    let mut stream = receiver.receive().unwrap();
    let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record.record().offset(), 7);
}

#[tokio::test]
async fn close_flushes_pending_commits_and_invalidates_handles() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..3);

    let options = fast_options().with_commit_interval(Duration::from_secs(3600));
    let receiver = KafkaReceiver::with_client(mock, options);
    let mut stream = receiver.receive().unwrap();

    let mut last = None;
    for _ in 0..3 {
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        record.offset().acknowledge().unwrap();
        last = Some(record);
    }

    receiver.close().await.unwrap();
    assert_eq!(control.committed("events", 0), Some(3));

    // Handles acknowledged before close observed their commit.
    let last = last.unwrap();
    assert_eq!(last.offset().state(), AckState::Committed);
}

#[tokio::test]
async fn auto_ack_redelivery_boundary_is_the_last_completed_batch() {
    init_logging();
    let (mock, control) = MockConsumer::new();
    control.assign_on_subscribe("events", &[0]);
    control.add_records("events", 0, 0..6);

    let receiver = KafkaReceiver::with_client(mock, fast_options());
    let mut stream = receiver.receive_auto_ack().unwrap();

    let mut completed_through = 0;
    while completed_through < 6 {
        let batch = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for batch")
            .expect("stream ended early")
            .expect("unexpected stream error");
        let high = batch.records().last().map(|r| r.offset()).unwrap_or(0);
        completed_through = high + 1;
        // Dropping the batch acknowledges it, same as complete().
        drop(batch);
    }

    assert!(
        wait_until(Duration::from_secs(2), || {
            control.committed("events", 0) == Some(6)
        })
        .await,
        "completed batches must be committed by the flush"
    );
}
