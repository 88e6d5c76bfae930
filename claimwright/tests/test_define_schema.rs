use std::sync::Arc;

use serde_json::json;

use claimwright::migration::MigrationOutcome;
use claimwright::schema::ClaimsSchemaPayload;
use claimwright::test_utils::InMemoryClaimsStore;
use claimwright::ClaimsError;

mod common;
use common::{manager, manager_with, payload, seeded, test_config, with_migration, Lowercase};

#[tokio::test]
async fn test_first_definition_seeds_every_identity() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    let ids = store.seed_identities(3);
    let manager = manager(&store);

    let report = manager
        .define_schema_with_report(seeded(
            payload("nickname", &json!("string")),
            &json!("anonymous"),
        ))
        .await?;

    assert_eq!(report.outcome, MigrationOutcome::Migrated);
    assert!(report.schema.active);
    assert_eq!(report.schema.parent_version, None);
    assert_eq!(report.pages, 1);
    assert_eq!(report.identities, 3);
    assert_eq!(report.claims_changed, 3);

    for id in &ids {
        assert_eq!(
            store.versioned_claim(id, "nickname", &report.schema.version),
            Some(json!("anonymous"))
        );
    }
    // Identities of one page complete in any order.
    let mut notified = store.claims_changed();
    notified.sort();
    assert_eq!(notified, ids);
    assert_eq!(store.schema_changed_count(), 1);
    assert_eq!(store.commits(), 1);
    assert!(store.lock_holder("nickname").is_none());
    Ok(())
}

#[tokio::test]
async fn test_redefining_the_same_payload_is_a_noop() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(4);
    let manager = manager(&store);
    let definition = seeded(payload("nickname", &json!("string")), &json!("anonymous"));

    let first = manager.define_schema(definition.clone()).await?;
    store.reset_records();

    let report = manager.define_schema_with_report(definition).await?;
    assert_eq!(report.outcome, MigrationOutcome::Skipped);
    assert_eq!(report.schema, first);
    assert_eq!(report.identities, 0);

    // Only the distributed-cache hint; no transaction and no per-identity notification.
    assert_eq!(store.schema_changed_count(), 1);
    assert_eq!(store.commits(), 0);
    assert_eq!(store.put_calls(), 0);
    assert!(store.claims_changed().is_empty());
    assert_eq!(store.schemata_of("nickname").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_noop_notification_pass_is_configurable() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(2);
    let mut config = test_config();
    config.notify_claims_on_noop = true;
    let manager = manager_with(&store, config, vec![]);
    let definition = seeded(payload("nickname", &json!("string")), &json!("anonymous"));

    manager.define_schema(definition.clone()).await?;
    store.reset_records();

    let report = manager.define_schema_with_report(definition).await?;
    assert_eq!(report.outcome, MigrationOutcome::Skipped);
    assert_eq!(report.claims_changed, 2);
    assert_eq!(store.claims_changed().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_member_order_does_not_change_the_version() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    let manager = manager(&store);

    let first = manager
        .define_schema(payload(
            "gender",
            &json!({"type": "enum", "values": ["male", "female", "other"], "optional": true}),
        ))
        .await?;
    let permuted = manager
        .define_schema_with_report(payload(
            "gender",
            &json!({"optional": true, "values": ["other", "male", "female"], "type": "enum"}),
        ))
        .await?;

    assert_eq!(permuted.schema.version, first.version);
    assert_eq!(permuted.outcome, MigrationOutcome::Skipped);
    Ok(())
}

#[tokio::test]
async fn test_new_version_migrates_from_the_active_one() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    store.add_identity("alice", json!({"sub": "alice"}));
    store.add_identity("bob", json!({"sub": "bob"}));
    let manager = manager_with(&store, test_config(), vec![Arc::new(Lowercase)]);

    let v1 = manager
        .define_schema(payload("email", &json!({"type": "email", "optional": true})))
        .await?;
    store.insert_versioned_claim("alice", "email", &v1.version, &json!("Alice@Example.com"));

    let report = manager
        .define_schema_with_report(with_migration(
            payload("email", &json!({"type": "email", "optional": true})),
            "lowercase",
        ))
        .await?;

    let v2 = &report.schema;
    assert_ne!(v2.version, v1.version);
    assert_eq!(v2.parent_version.as_deref(), Some(v1.version.as_str()));
    assert_eq!(
        store.versioned_claim("alice", "email", &v2.version),
        Some(json!("alice@example.com"))
    );
    assert_eq!(store.versioned_claim("bob", "email", &v2.version), Some(json!(null)));
    // Only alice's value changed.
    assert_eq!(report.claims_changed, 1);

    let active = manager.get_active_schemata().await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].version, v2.version);
    assert!(!store
        .schemata_of("email")
        .iter()
        .any(|s| s.version == v1.version && s.active));
    Ok(())
}

#[tokio::test]
async fn test_keep_or_seed_keeps_existing_values() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    store.add_identity("alice", json!({"sub": "alice"}));
    store.add_identity("bob", json!({"sub": "bob"}));
    let manager = manager(&store);

    let v1 = manager
        .define_schema(payload("locale", &json!({"type": "string", "optional": true})))
        .await?;
    store.insert_versioned_claim("alice", "locale", &v1.version, &json!("ko-KR"));

    let v2 = manager
        .define_schema(seeded(
            payload("locale", &json!("string")),
            &json!("en-US"),
        ))
        .await?;

    assert_eq!(store.versioned_claim("alice", "locale", &v2.version), Some(json!("ko-KR")));
    assert_eq!(store.versioned_claim("bob", "locale", &v2.version), Some(json!("en-US")));
    Ok(())
}

#[tokio::test]
async fn test_invalid_migrated_value_aborts_with_identity_context() {
    let store = InMemoryClaimsStore::new();
    store.seed_identities(5);
    let manager = manager(&store);

    let err = manager
        .define_schema(seeded(
            payload("age", &json!({"type": "number", "integer": true})),
            &json!("forty-two"),
        ))
        .await
        .unwrap_err();

    match err {
        ClaimsError::Validation {
            failures, context, ..
        } => {
            assert_eq!(failures[0].field, "age");
            assert_eq!(failures[0].kind, "number");
            assert_eq!(context["newClaim"], json!("forty-two"));
            assert_eq!(context["oldClaim"], json!(null));
            assert!(context["id"].as_str().unwrap().starts_with("identity-"));
        }
        other => panic!("Expected Validation error, got: {other:?}"),
    }

    assert!(store.schemata_of("age").is_empty());
    assert_eq!(store.versioned_claim_count("age"), 0);
    assert_eq!(store.rollbacks(), 1);
    assert!(store.lock_holder("age").is_none());
}

#[tokio::test]
async fn test_malformed_payload_never_takes_the_lock() {
    let store = InMemoryClaimsStore::new();
    let manager = manager(&store);

    let bad_payloads = [
        ClaimsSchemaPayload {
            validation: "{not json".to_string(),
            ..payload("email", &json!("email"))
        },
        payload("email", &json!({"type": "rainbow"})),
        payload("", &json!("string")),
        with_migration(payload("email", &json!("email")), "does_not_exist"),
    ];

    for bad in bad_payloads {
        let err = manager.define_schema(bad).await.unwrap_err();
        assert!(err.is_validation(), "unexpected error: {err:?}");
        assert!(!err.failures().is_empty());
    }

    assert!(store.events().is_empty());
    assert!(store.page_requests().is_empty());
}

#[tokio::test]
async fn test_unknown_parent_version_is_rejected() {
    let store = InMemoryClaimsStore::new();
    let manager = manager(&store);

    let err = manager
        .define_schema(ClaimsSchemaPayload {
            parent_version: Some("ab".repeat(32)),
            ..payload("email", &json!("email"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.failures()[0].kind, "unknownParent");
    assert!(store.schemata_of("email").is_empty());
    assert!(store.lock_holder("email").is_none());
}

#[tokio::test]
async fn test_explicit_parent_selects_the_old_values() -> anyhow::Result<()> {
    let store = InMemoryClaimsStore::new();
    store.add_identity("alice", json!({"sub": "alice"}));
    let manager = manager(&store);

    let v1 = manager
        .define_schema(seeded(payload("plan", &json!("string")), &json!("free")))
        .await?;
    manager
        .define_schema(seeded(
            with_migration(payload("plan", &json!("string")), "seed"),
            &json!("pro"),
        ))
        .await?;

    let v3 = manager
        .define_schema(ClaimsSchemaPayload {
            parent_version: Some(v1.version.clone()),
            ..payload("plan", &json!({"type": "string", "min": 2}))
        })
        .await?;

    assert_eq!(v3.parent_version.as_deref(), Some(v1.version.as_str()));
    assert_eq!(store.versioned_claim("alice", "plan", &v3.version), Some(json!("free")));
    Ok(())
}
