mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use amipub::config::AccountsMap;
use amipub::delete::DeleteEngine;
use amipub::manifest::OutcomeState;

use common::{default_accounts, delete_config, delete_item, MockCatalog, MockProvider};

fn engine(
    provider: Arc<MockProvider>,
    catalog: Arc<MockCatalog>,
    accounts: AccountsMap,
    cfg: amipub::delete::DeleteConfig,
) -> DeleteEngine {
    DeleteEngine::new(provider, catalog, accounts, cfg)
}

#[tokio::test]
async fn dry_run_performs_no_destructive_calls() {
    let provider = Arc::new(MockProvider::default().with_snapshot_ids(&["snap-1"]));
    let catalog = Arc::new(
        MockCatalog::with_hourly_products(&["RHEL"]).with_known_id("ami-11111111"),
    );
    let mut cfg = delete_config();
    cfg.dry_run = true;

    let manifest = engine(provider.clone(), catalog.clone(), default_accounts(), cfg)
        .run(vec![delete_item("a.raw", "us-east-1", "ami-11111111")])
        .await
        .unwrap();

    assert_eq!(provider.delete_image_calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.delete_snapshot_calls.load(Ordering::SeqCst), 0);
    assert_eq!(catalog.visibility_calls.load(Ordering::SeqCst), 0);
    assert_eq!(catalog.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(catalog.create_calls.load(Ordering::SeqCst), 0);
    assert!(manifest.is_success());
    assert_eq!(manifest.items[0].images[0].state, OutcomeState::Skipped);
}

#[tokio::test]
async fn delete_removes_image_and_snapshots() {
    let provider = Arc::new(MockProvider::default().with_snapshot_ids(&["snap-1", "snap-2"]));
    let catalog = Arc::new(
        MockCatalog::with_hourly_products(&["RHEL"]).with_known_id("ami-11111111"),
    );

    let manifest = engine(
        provider.clone(),
        catalog.clone(),
        default_accounts(),
        delete_config(),
    )
    .run(vec![delete_item("a.raw", "us-east-1", "ami-11111111")])
    .await
    .unwrap();

    assert_eq!(catalog.visibility_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.delete_image_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.delete_snapshot_calls.load(Ordering::SeqCst), 2);
    let target = &manifest.items[0].images[0];
    assert_eq!(target.state, OutcomeState::Deleted);
    assert_eq!(target.snapshots, vec!["snap-1", "snap-2"]);
    assert!(manifest.is_success());
}

#[tokio::test]
async fn keep_snapshot_leaves_snapshots_in_place() {
    let provider = Arc::new(MockProvider::default().with_snapshot_ids(&["snap-1"]));
    let catalog = Arc::new(
        MockCatalog::with_hourly_products(&["RHEL"]).with_known_id("ami-11111111"),
    );
    let mut cfg = delete_config();
    cfg.keep_snapshot = true;

    let manifest = engine(provider.clone(), catalog, default_accounts(), cfg)
        .run(vec![delete_item("a.raw", "us-east-1", "ami-11111111")])
        .await
        .unwrap();

    assert_eq!(provider.delete_image_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.delete_snapshot_calls.load(Ordering::SeqCst), 0);
    assert_eq!(manifest.items[0].images[0].state, OutcomeState::Deleted);
}

#[tokio::test]
async fn image_unknown_to_the_catalog_is_still_deleted_on_aws() {
    let provider = Arc::new(MockProvider::default());
    let catalog = Arc::new(MockCatalog::with_hourly_products(&["RHEL"]));

    let manifest = engine(
        provider.clone(),
        catalog.clone(),
        default_accounts(),
        delete_config(),
    )
    .run(vec![delete_item("a.raw", "us-east-1", "ami-11111111")])
    .await
    .unwrap();

    assert_eq!(catalog.visibility_calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.delete_image_calls.load(Ordering::SeqCst), 1);
    assert!(manifest.is_success());
}

#[tokio::test]
async fn catalog_failure_still_attempts_the_provider_delete() {
    let provider = Arc::new(MockProvider::default());
    let catalog = Arc::new(MockCatalog {
        visibility_error: true,
        ..MockCatalog::with_hourly_products(&["RHEL"]).with_known_id("ami-11111111")
    });

    let manifest = engine(
        provider.clone(),
        catalog.clone(),
        default_accounts(),
        delete_config(),
    )
    .run(vec![delete_item("a.raw", "us-east-1", "ami-11111111")])
    .await
    .unwrap();

    assert_eq!(catalog.visibility_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.delete_image_calls.load(Ordering::SeqCst), 1);
    let target = &manifest.items[0].images[0];
    assert_eq!(target.state, OutcomeState::Notdeleted);
    assert!(target.error.as_deref().unwrap().contains("catalog"));
    assert!(!manifest.is_success());
}

#[tokio::test]
async fn limit_restricts_deletion_to_named_image_ids() {
    let provider = Arc::new(MockProvider::default());
    let catalog = Arc::new(MockCatalog::with_hourly_products(&["RHEL"]));
    let mut cfg = delete_config();
    cfg.limit = Some(vec!["ami-11111111".to_string()]);

    let manifest = engine(provider.clone(), catalog, default_accounts(), cfg)
        .run(vec![
            delete_item("a.raw", "us-east-1", "ami-11111111"),
            delete_item("b.raw", "us-east-1", "ami-22222222"),
        ])
        .await
        .unwrap();

    assert_eq!(provider.delete_image_calls.load(Ordering::SeqCst), 1);
    assert_eq!(manifest.items.len(), 1);
    assert!(manifest.items[0].src.contains("a.raw"));
}

#[tokio::test]
async fn image_absent_on_the_provider_is_missing_not_failed() {
    let provider = Arc::new(MockProvider::default().with_missing_image("ami-11111111"));
    let catalog = Arc::new(MockCatalog::with_hourly_products(&["RHEL"]));

    let manifest = engine(provider, catalog, default_accounts(), delete_config())
        .run(vec![delete_item("a.raw", "us-east-1", "ami-11111111")])
        .await
        .unwrap();

    let target = &manifest.items[0].images[0];
    assert_eq!(target.state, OutcomeState::Missing);
    assert_eq!(target.ami, None);
    assert!(manifest.is_success());
}

#[tokio::test]
async fn empty_selection_is_a_no_op() {
    let provider = Arc::new(MockProvider::default());
    let catalog = Arc::new(MockCatalog::with_hourly_products(&["RHEL"]));
    let mut cfg = delete_config();
    cfg.limit = Some(vec!["ami-99999999".to_string()]);

    let manifest = engine(provider.clone(), catalog, default_accounts(), cfg)
        .run(vec![delete_item("a.raw", "us-east-1", "ami-11111111")])
        .await
        .unwrap();

    assert_eq!(provider.delete_image_calls.load(Ordering::SeqCst), 0);
    assert!(manifest.items.is_empty());
    assert!(manifest.is_success());
}
