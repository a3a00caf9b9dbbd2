// Recovery sweeper behavior: orphaned staged objects, stale spool
// entries, retention.

mod harness;

use std::time::Duration;

use gps2bq_core::{LoadError, StreamType};
use gps2bq_spool::BackupState;

use harness::{context, gps_raw, mobile_raw};

#[tokio::test]
async fn test_load_transient_then_recovery_sweep() {
    let ctx = context().await;
    ctx.queue.push(StreamType::Mobile, mobile_raw("u1"));
    ctx.loader
        .fail_next_load(LoadError::TransientJob("job backend".into()));

    // Cycle: stage succeeds, load fails, the staged object stays.
    let outcome = ctx.pipeline.run_cycle(&ctx.token).await;
    assert!(!outcome.success);
    let staged = ctx.staging.list(StreamType::Mobile).await.unwrap();
    assert_eq!(staged.len(), 1);
    let key = staged[0].key.clone();
    assert_eq!(ctx.spool.pending_count().await.unwrap(), 0);
    assert!(!ctx.ledger.has_load(&key));

    // Sweep: the load now succeeds and cleanup removes the object.
    let report = ctx.sweeper(Duration::ZERO, true).run().await;
    assert_eq!(report.orphans_found, 1);
    assert_eq!(report.orphans_loaded, 1);
    assert_eq!(report.orphan_failures, 0);

    assert!(ctx.ledger.has_load(&key));
    assert_eq!(ctx.loader.total_records_loaded(), 1);
    assert!(ctx.staging.list(StreamType::Mobile).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweeper_skips_objects_younger_than_min_age() {
    let ctx = context().await;
    ctx.queue.push(StreamType::Gps, gps_raw("A", 1.0, 2.0));
    ctx.loader
        .fail_next_load(LoadError::TransientJob("job backend".into()));
    ctx.pipeline.run_cycle(&ctx.token).await;

    let report = ctx.sweeper(Duration::from_secs(3600), true).run().await;
    assert_eq!(report.orphans_found, 0);
    assert_eq!(ctx.staging.list(StreamType::Gps).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sweeper_reclaims_loaded_but_uncleaned_objects() {
    // cleanup_processed=false leaves loaded objects behind on purpose;
    // a later sweep with cleanup enabled reclaims them without loading
    // twice.
    let ctx = context().await;
    ctx.queue.push(StreamType::Gps, gps_raw("A", 1.0, 2.0));
    let outcome = ctx.pipeline.run_cycle(&ctx.token).await;
    assert!(outcome.success);
    assert_eq!(ctx.staging.list(StreamType::Gps).await.unwrap().len(), 1);
    assert_eq!(ctx.loader.loaded_keys().len(), 1);

    let report = ctx.sweeper(Duration::ZERO, true).run().await;
    assert_eq!(report.orphans_found, 0);
    assert_eq!(report.already_loaded_reclaimed, 1);
    assert!(ctx.staging.list(StreamType::Gps).await.unwrap().is_empty());
    // No second load was submitted.
    assert_eq!(ctx.loader.loaded_keys().len(), 1);
}

#[tokio::test]
async fn test_sweeper_returns_stale_processing_entries_to_pending() {
    let ctx = context().await;
    let entry = ctx
        .spool
        .store(
            StreamType::Gps,
            &gps2bq_core::ProcessingId::from_string("gps_1700000000000_stale".into()),
            chrono::Utc::now(),
            vec![serde_json::json!({"deviceId": "A", "lat": 1.0, "lng": 2.0})],
        )
        .await
        .unwrap();
    ctx.spool.mark_processing(&entry.id).await.unwrap();

    let report = ctx.sweeper(Duration::ZERO, true).run().await;
    assert_eq!(report.stale_processing_recovered, 1);

    let recovered = ctx.spool.read_entry(&entry.id).await.unwrap();
    assert_eq!(recovered.state, BackupState::Pending);
}

#[tokio::test]
async fn test_sweeper_surfaces_pending_spool_depth() {
    let ctx = context().await;
    for i in 0..3 {
        ctx.spool
            .store(
                StreamType::Mobile,
                &gps2bq_core::ProcessingId::from_string(format!("mobile_1700000000000_p{}", i)),
                chrono::Utc::now(),
                vec![serde_json::json!({"userId": "u", "lat": 1.0})],
            )
            .await
            .unwrap();
    }

    let report = ctx.sweeper(Duration::ZERO, true).run().await;
    assert_eq!(report.spool_pending, 3);
}
