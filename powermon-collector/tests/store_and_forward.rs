use chrono::{DateTime, Utc};
use powermon_collector::DurableQueue;
use powermon_devkit::test_utils::{HarnessOptions, COLLECTOR_ID};
use powermon_devkit::{IngestMode, MeterFrameBuilder, TestHarness};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_offline_readings_are_queued_then_forwarded() {
    let harness = TestHarness::new().await.unwrap();
    harness.service.start().await.unwrap();

    harness.server.set_mode(IngestMode::ServerError);
    assert!(harness.wait_for_queue(WAIT, |s| s.unuploaded >= 3).await);
    assert!(!harness.service.health().is_online());

    harness.server.set_mode(IngestMode::Accept);
    assert!(harness.wait_for_queue(WAIT, |s| s.unuploaded == 0 && s.uploaded >= 3).await);
    assert!(harness.wait_until(WAIT, |h| h.service.health().is_online()).await);

    let batches = harness.server.requests_to("/collector/data/batch");
    let delivered = batches
        .iter()
        .find(|b| b.body["data"].as_array().is_some_and(|d| !d.is_empty()))
        .expect("at least one non-empty batch");
    assert_eq!(delivered.body["collector_id"], COLLECTOR_ID);

    let stamps: Vec<DateTime<Utc>> = delivered.body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["timestamp"].as_str().unwrap().parse().unwrap())
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "batch not oldest-first");

    harness.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_rejected_upload_falls_back_to_queue() {
    let harness = TestHarness::build(HarnessOptions {
        auto_upload: false,
        ..Default::default()
    })
    .await
    .unwrap();
    harness.service.start().await.unwrap();

    harness.server.set_mode(IngestMode::Reject);
    assert!(harness.wait_for_queue(WAIT, |s| s.unuploaded >= 2).await);
    harness.service.stop().await.unwrap();

    // without auto-upload nothing drains the queue
    assert!(harness.server.requests_to("/collector/data/batch").is_empty());

    let queue = DurableQueue::open(harness.db_path()).await.unwrap();
    let pending = queue.fetch_unuploaded(100).await.unwrap();
    assert!(pending.len() >= 2);
    assert!(pending.iter().all(|e| e.collector_id == COLLECTOR_ID && e.voltage == 230.0));
    queue.close().await;
}

#[tokio::test]
async fn test_silent_meter_counts_errors_and_uploads_nothing() {
    let harness = TestHarness::new().await.unwrap();
    harness.serial.set_default_frame(None);
    harness.service.start().await.unwrap();

    assert!(harness.wait_until(WAIT, |h| h.service.health().error_count() >= 2).await);
    assert!(harness.server.requests_to("/collector/data").is_empty());

    let status = harness.service.status().await;
    assert!(status.health.last_data_time.is_none());
    assert_eq!(status.queue.unwrap().total, 0);
    assert!(!harness.service.is_healthy());

    harness.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_reading_is_skipped() {
    let harness = TestHarness::new().await.unwrap();
    harness
        .serial
        .set_default_frame(Some(MeterFrameBuilder::new().frequency(70.0).build()));
    harness.service.start().await.unwrap();

    assert!(harness.wait_until(WAIT, |h| h.service.health().error_count() >= 1).await);
    harness.service.stop().await.unwrap();

    assert!(harness.server.requests_to("/collector/data").is_empty());
    assert!(harness.serial.request_count() >= 1);
}

#[tokio::test]
async fn test_healthy_once_data_flows() {
    let harness = TestHarness::new().await.unwrap();
    assert!(!harness.service.is_healthy());

    harness.service.start().await.unwrap();
    assert!(harness.wait_until(WAIT, |h| h.service.is_healthy()).await);

    // heartbeats report the verdict
    assert!(
        harness
            .wait_until(WAIT, |h| h
                .server
                .requests_to("/collector/heartbeat")
                .iter()
                .any(|r| r.body["status"] == "ok"))
            .await
    );
    harness.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_reading_dropped_when_upload_and_cache_both_fail() {
    let harness = TestHarness::new().await.unwrap();
    harness.service.start().await.unwrap();
    assert!(harness.wait_until(WAIT, |h| h.service.health().last_data_time().is_some()).await);

    harness.server.set_mode(IngestMode::ServerError);
    harness.service.queue().close().await;

    assert!(harness.wait_until(WAIT, |h| h.service.health().snapshot().dropped_readings > 0).await);
    let status = harness.service.status().await;
    assert!(status.health.dropped_readings > 0);
    assert!(status.health.error_count > 0);
    // stats cannot be read from a closed queue
    assert!(status.queue.is_none());

    harness.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_maintenance_resets_errors_once_recovered() {
    let harness = TestHarness::new().await.unwrap();
    harness.service.start().await.unwrap();
    assert!(harness.wait_until(WAIT, |h| h.service.health().is_online()).await);

    for _ in 0..8 {
        harness.service.health().record_error();
    }
    assert!(harness.service.health().error_count() >= 8);

    // online with fresh data: the next maintenance tick clears the count
    assert!(harness.wait_until(WAIT, |h| h.service.health().error_count() == 0).await);
    harness.service.stop().await.unwrap();
}
