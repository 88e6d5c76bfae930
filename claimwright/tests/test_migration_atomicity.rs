use std::sync::Arc;

use serde_json::json;

use claimwright::migration::MigrationOutcome;
use claimwright::store::StoreError;
use claimwright::test_utils::{InMemoryClaimsStore, PageRequestRecord};
use claimwright::ClaimsError;

mod common;
use common::{manager, manager_with, payload, seeded, test_config, with_migration, FailFor, Sleepy};

#[tokio::test]
async fn test_pages_until_an_empty_page() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(251);
    let manager = manager(&store);

    let report = manager
        .define_schema_with_report(seeded(payload("tier", &json!("string")), &json!("basic")))
        .await?;

    assert_eq!(report.pages, 3);
    assert_eq!(report.identities, 251);
    assert_eq!(store.versioned_claim_count("tier"), 251);

    let record = |offset, returned| PageRequestRecord {
        offset,
        limit: 100,
        returned,
    };
    assert_eq!(
        store.page_requests(),
        vec![
            record(0, 100),
            record(100, 100),
            record(200, 51),
            record(251, 0)
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_page_size_is_configurable() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(10);
    let mut config = test_config();
    config.page_size = 4;
    let manager = manager_with(&store, config, vec![]);

    let report = manager
        .define_schema_with_report(seeded(payload("tier", &json!("string")), &json!("basic")))
        .await?;

    assert_eq!(report.pages, 3);
    assert_eq!(
        store
            .page_requests()
            .iter()
            .map(|r| r.offset)
            .collect::<Vec<_>>(),
        vec![0, 4, 8, 10]
    );
    Ok(())
}

async fn assert_single_failure_aborts_everything(poisoned: &str, index: u64) -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(250);
    let manager = manager_with(
        &store,
        test_config(),
        vec![Arc::new(FailFor {
            poisoned: poisoned.to_string(),
        })],
    );

    let v1 = manager
        .define_schema(seeded(payload("tier", &json!("string")), &json!("basic")))
        .await?;
    store.reset_records();

    let err = manager
        .define_schema(seeded(
            with_migration(payload("tier", &json!("string")), "fail_for"),
            &json!("gold"),
        ))
        .await
        .unwrap_err();

    match &err {
        ClaimsError::Validation { context, .. } => {
            assert_eq!(context["id"], json!(poisoned));
            assert_eq!(context["index"], json!(index));
            assert_eq!(context["oldClaim"], json!("basic"));
        }
        other => panic!("Expected Validation error, got: {other:?}"),
    }

    // The previous version stays active and no value of the new one survives.
    assert_eq!(store.active_schema("tier").map(|s| s.version), Some(v1.version));
    assert_eq!(store.schemata_of("tier").len(), 1);
    assert_eq!(store.versioned_claim_count("tier"), 250);
    assert_eq!(store.commits(), 0);
    assert_eq!(store.rollbacks(), 1);
    assert!(store.lock_holder("tier").is_none());
    Ok(())
}

#[tokio::test]
async fn test_failure_in_first_page_rolls_back() -> anyhow::Result<()> {
    assert_single_failure_aborts_everything("identity-036", 36).await
}

#[tokio::test]
async fn test_failure_in_later_page_rolls_back_earlier_pages() -> anyhow::Result<()> {
    assert_single_failure_aborts_everything("identity-180", 180).await
}

#[tokio::test]
async fn test_transform_timeout_aborts_the_migration() {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(3);
    let mut config = test_config();
    config.migration_timeout_ms = 50;
    let manager = manager_with(&store, config, vec![Arc::new(Sleepy)]);

    let err = manager
        .define_schema(with_migration(
            payload("tier", &json!({"type": "string", "optional": true})),
            "sleepy",
        ))
        .await
        .unwrap_err();

    assert!(err
        .failures()
        .iter()
        .any(|failure| failure.kind == "migrationTimeout"));
    assert!(store.active_schema("tier").is_none());
    assert_eq!(store.versioned_claim_count("tier"), 0);
    assert!(store.lock_holder("tier").is_none());
}

#[tokio::test]
async fn test_store_failure_is_not_wrapped() {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(3);
    store.fail_claims_for(Some("identity-001"));
    let manager = manager(&store);

    let err = manager
        .define_schema(seeded(payload("tier", &json!("string")), &json!("basic")))
        .await
        .unwrap_err();

    assert!(matches!(err, ClaimsError::Adapter(StoreError::Backend(_))));
    assert!(store.active_schema("tier").is_none());
    assert_eq!(store.rollbacks(), 1);
}

#[tokio::test]
async fn test_failed_commit_leaves_nothing_active() {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(3);
    store.fail_commits(true);
    let manager = manager(&store);

    let err = manager
        .define_schema(seeded(payload("tier", &json!("string")), &json!("basic")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClaimsError::Adapter(StoreError::TransactionFailed(_))
    ));
    assert!(store.schemata_of("tier").is_empty());
    assert!(store.lock_holder("tier").is_none());

    store.fail_commits(false);
    let report = manager
        .define_schema_with_report(seeded(payload("tier", &json!("string")), &json!("basic")))
        .await
        .unwrap();
    assert_eq!(report.outcome, MigrationOutcome::Migrated);
}
