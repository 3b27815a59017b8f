//! Sync Protocol Contract Tests
//!
//! Idempotent uploads, halt-and-resume on failure, and deck wiring only
//! once every card holds a current asset.

mod common;

use std::sync::Arc;

use cardforge_core::sync::{sync_diff, CatalogRecord, SyncStage};
use cardforge_core::{ErrorClass, ItemFilter, Phase};

use common::{FakeCatalog, Harness};

async fn produced(n: usize, tweak: impl FnOnce(&mut cardforge_core::ForgeConfig)) -> Harness {
    let harness = Harness::with_config(tweak);
    let report = harness.runner().run(n).await.unwrap();
    assert_eq!(report.count(Phase::Done), n);
    harness
}

#[tokio::test]
async fn sync_rerun_after_success_uploads_nothing() {
    let harness = produced(5, |_| {}).await;
    let catalog = Arc::new(FakeCatalog::default());
    let sync = harness.sync(catalog.clone());

    let first = sync.run().await.unwrap();
    assert!(first.is_complete());
    assert_eq!(first.uploaded, vec![1, 2, 3, 4, 5]);
    let wired = first.wired.unwrap();
    assert_eq!(wired.cards, 5);
    assert_eq!(wired.batches, 1);

    for item in harness.ledger.list(&ItemFilter::phase(Phase::Done)) {
        assert!(item.remote.asset_id.is_some());
        assert!(item.remote.component_id.is_some());
        assert_eq!(item.remote.synced_hash, item.content_hash);
        assert!(!item.is_sync_dirty());
    }

    let second = sync.run().await.unwrap();
    assert!(second.diff.is_empty());
    assert!(second.uploaded.is_empty());
    assert!(second.wired.is_none());

    let state = catalog.state();
    assert_eq!(state.uploads.len(), 5);
    assert_eq!(state.decks_created.len(), 1);
    assert_eq!(state.batches.len(), 1);
}

#[tokio::test]
async fn sync_partial_failure_keeps_progress_and_resumes() {
    let harness = produced(5, |_| {}).await;
    let catalog = Arc::new(FakeCatalog::default());
    catalog.state().failing.insert("000004.png".to_string());
    let sync = harness.sync(catalog.clone());

    let report = sync.run().await.unwrap();
    assert_eq!(report.uploaded, vec![1, 2, 3]);
    let failure = report.failure.unwrap();
    assert_eq!(failure.stage, SyncStage::Upload);
    assert_eq!(failure.seq, Some(4));
    assert_eq!(failure.class, ErrorClass::Permanent);
    assert!(report.wired.is_none());

    for seq in 1..=3 {
        assert!(harness.ledger.get(seq).unwrap().remote.asset_id.is_some());
    }
    for seq in 4..=5 {
        assert!(harness.ledger.get(seq).unwrap().remote.asset_id.is_none());
    }
    {
        let state = catalog.state();
        assert!(state.decks_created.is_empty());
        assert!(state.batches.is_empty());
        assert_eq!(state.attempts, vec!["000001.png", "000002.png", "000003.png", "000004.png"]);
    }

    catalog.state().failing.clear();
    let report = sync.run().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.reused, vec![1, 2, 3]);
    assert_eq!(report.uploaded, vec![4, 5]);
    assert_eq!(report.wired.unwrap().cards, 5);

    let state = catalog.state();
    assert_eq!(state.uploads, vec!["000001.png", "000002.png", "000003.png", "000004.png", "000005.png"]);
    assert_eq!(state.decks_created.len(), 1);
}

#[tokio::test]
async fn sync_transient_upload_errors_are_retried() {
    let harness = produced(2, |_| {}).await;
    let catalog = Arc::new(FakeCatalog::default());
    catalog.state().transient_failures = 2;

    let report = harness.sync(catalog.clone()).run().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.uploaded, vec![1, 2]);
    assert_eq!(catalog.state().attempts.len(), 4);
}

#[tokio::test]
async fn sync_changed_item_is_reuploaded_and_deck_rewired() {
    let harness = produced(3, |_| {}).await;
    let catalog = Arc::new(FakeCatalog::default());
    let sync = harness.sync(catalog.clone());
    sync.run().await.unwrap();

    harness
        .ledger
        .update(2, |i| i.content_hash = Some("edited".to_string()))
        .unwrap();
    let diff = sync_diff(&harness.ledger.snapshot());
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].seq, 2);

    let report = sync.run().await.unwrap();
    assert_eq!(report.uploaded, vec![2]);
    assert_eq!(report.wired.unwrap().cards, 3);

    let state = catalog.state();
    assert_eq!(state.uploads.len(), 4);
    assert_eq!(state.decks_created.len(), 1);
    assert_eq!(state.cleared, 1);
    assert_eq!(state.batches.len(), 2);
    assert_eq!(state.batches[1].len(), 3);
}

#[tokio::test]
async fn sync_chunks_deck_wiring_by_batch_size() {
    let harness = produced(5, |c| c.sync.batch_size = 2).await;
    let catalog = Arc::new(FakeCatalog::default());

    let report = harness.sync(catalog.clone()).run().await.unwrap();
    assert_eq!(report.wired.unwrap().batches, 3);
    let sizes: Vec<usize> = catalog.state().batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn sync_uploads_card_back_once() {
    let back_dir = tempfile::tempdir().unwrap();
    let back = back_dir.path().join("back.png");
    std::fs::write(&back, common::png(1024, 1536)).unwrap();
    let back_path = back.clone();
    let harness = produced(1, move |c| c.sync.card_back = Some(back_path)).await;
    let catalog = Arc::new(FakeCatalog::default());
    let sync = harness.sync(catalog.clone());

    sync.run().await.unwrap();
    harness
        .ledger
        .update(1, |i| i.content_hash = Some("edited".to_string()))
        .unwrap();
    sync.run().await.unwrap();

    let state = catalog.state();
    let back_uploads = state.uploads.iter().filter(|f| *f == "card_back.png").count();
    assert_eq!(back_uploads, 1);
    assert!(state.decks_created[0].is_some());

    let record = CatalogRecord::load(&harness.config.catalog_path()).unwrap();
    assert!(record.back_asset_id.is_some());
    assert!(record.deck_id.is_some());
    assert!(record.wired_at.is_some());
}

#[tokio::test]
async fn sync_waits_for_the_lease() {
    let harness = produced(1, |_| {}).await;
    let catalog = Arc::new(FakeCatalog::default());
    let sync = harness.sync(catalog.clone());

    let lease = harness.ledger.acquire_sync_lease().await;
    let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), sync.run()).await;
    assert!(blocked.is_err(), "sync must not run while another holder has the lease");
    drop(lease);

    let report = sync.run().await.unwrap();
    assert_eq!(report.uploaded, vec![1]);
}
