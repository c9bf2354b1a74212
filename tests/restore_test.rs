//! Restore and verification against backups produced by the orchestrator.

mod test_helpers;

use observability_backup::backup::{
    BackupError, BackupSpec, BackupStatus, CatalogStore, CompressionConfig, EncryptionAlgorithm,
    EncryptionConfig, RetentionPolicy, StaticKeyResolver, StorageProvider,
};
use std::sync::Arc;
use test_helpers::*;
use tokio_util::sync::CancellationToken;

const METRICS: &str = "{\"series\":[\"up\",\"http_requests_total\"],\"samples\":1024}";
const DASHBOARDS: &str = "{\"dashboards\":[{\"uid\":\"k8s-overview\",\"panels\":12}]}";

fn components() -> Arc<FakeComponents> {
    FakeComponents::with_data(&[("metrics-store", METRICS), ("dashboard-store", DASHBOARDS)])
}

fn sealed_spec() -> BackupSpec {
    test_spec(
        "nightly",
        &["metrics-store", "dashboard-store"],
        RetentionPolicy::keep_last(5),
    )
    .with_encryption(EncryptionConfig {
        algorithm: EncryptionAlgorithm::Aes256Gcm,
        key_reference: TEST_KEY_REF.to_string(),
    })
    .with_compression(CompressionConfig::default())
}

async fn committed_backup(env: &TestEnv, spec: &BackupSpec) -> String {
    let outcome = env
        .orchestrator
        .run(spec, &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_committed());
    outcome.record.id
}

#[tokio::test]
async fn test_round_trip_restores_exact_bytes() {
    let env = TestEnv::new(components());
    let backup_id = committed_backup(&env, &sealed_spec()).await;

    // Live state drifts after the backup
    env.components.set("metrics-store", b"{\"series\":[]}");

    let report = env
        .restorer
        .restore(&backup_id, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.backup_id, backup_id);
    assert_eq!(report.restored, vec!["dashboard-store", "metrics-store"]);
    assert_eq!(report.bytes as usize, METRICS.len() + DASHBOARDS.len());

    let imported = env.components.imported();
    assert_eq!(imported.len(), 2);
    for (component, data) in imported {
        let expected = match component.as_str() {
            "metrics-store" => METRICS,
            "dashboard-store" => DASHBOARDS,
            other => panic!("unexpected component {other}"),
        };
        assert_eq!(data, expected.as_bytes());
    }
}

#[tokio::test]
async fn test_restore_of_absent_component_imports_nothing() {
    let env = TestEnv::new(components());
    let backup_id = committed_backup(&env, &sealed_spec()).await;

    let filter = vec!["log-store".to_string()];
    let result = env
        .restorer
        .restore(&backup_id, Some(filter.as_slice()), &CancellationToken::new())
        .await;

    match result {
        Err(BackupError::ComponentMissingFromBackup {
            backup_id: id,
            component,
        }) => {
            assert_eq!(id, backup_id);
            assert_eq!(component, "log-store");
        }
        other => panic!("expected ComponentMissingFromBackup, got {other:?}"),
    }
    assert!(env.components.imported().is_empty());
}

#[tokio::test]
async fn test_restore_subset() {
    let env = TestEnv::new(components());
    let backup_id = committed_backup(&env, &sealed_spec()).await;

    let filter = vec!["metrics-store".to_string()];
    let report = env
        .restorer
        .restore(&backup_id, Some(filter.as_slice()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.restored, vec!["metrics-store"]);
    let imported = env.components.imported();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].0, "metrics-store");
}

#[tokio::test]
async fn test_restore_is_idempotent() {
    let env = TestEnv::new(components());
    let backup_id = committed_backup(&env, &sealed_spec()).await;
    let before = env.catalog.get(&backup_id).await.unwrap();

    let first = env
        .restorer
        .restore(&backup_id, None, &CancellationToken::new())
        .await
        .unwrap();
    let second = env
        .restorer
        .restore(&backup_id, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first, second);
    let imported = env.components.imported();
    assert_eq!(imported.len(), 4);
    assert_eq!(imported[0..2], imported[2..4]);

    // Restore never writes to the catalog
    let after = env.catalog.get(&backup_id).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_restore_refuses_failed_backup() {
    let components = components();
    components.fail("dashboard-store");
    let env = TestEnv::new(components);
    let outcome = env
        .orchestrator
        .run(&sealed_spec(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.record.status, BackupStatus::Failed);

    let result = env
        .restorer
        .restore(&outcome.record.id, None, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(BackupError::NotRestorable { .. })));
}

#[tokio::test]
async fn test_unknown_backup_id() {
    let env = TestEnv::new(components());
    let result = env
        .restorer
        .restore("does-not-exist", None, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(BackupError::RecordNotFound { .. })));
}

#[tokio::test]
async fn test_wrong_key_is_a_decryption_failure() {
    let env = TestEnv::new(components());
    let backup_id = committed_backup(&env, &sealed_spec()).await;

    let other_keys = StaticKeyResolver::new().with_key(TEST_KEY_REF, b"not the key".to_vec());
    let restorer = env.restorer_with_keys(Arc::new(other_keys));

    let result = restorer
        .restore(&backup_id, None, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(BackupError::DecryptionFailed { .. })));
    assert!(env.components.imported().is_empty());
}

#[tokio::test]
async fn test_tampered_object_is_rejected_before_import() {
    let env = TestEnv::new(components());
    let spec = test_spec(
        "nightly",
        &["metrics-store", "dashboard-store"],
        RetentionPolicy::keep_last(5),
    );
    let backup_id = committed_backup(&env, &spec).await;
    let record = env.catalog.get(&backup_id).await.unwrap();

    // Swap the stored object for a different valid-looking payload
    let mut stored = env.provider.download(&record.storage_key).await.unwrap();
    let last = stored.len() - 1;
    stored[last] ^= 0xff;
    env.provider.delete(&record.storage_key).await.unwrap();
    env.provider
        .upload(&record.storage_key, &stored)
        .await
        .unwrap();

    let result = env
        .restorer
        .restore(&backup_id, None, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(BackupError::Corrupt { .. })));
    assert!(env.components.imported().is_empty());

    let verify = env
        .restorer
        .verify(&backup_id, &CancellationToken::new())
        .await;
    assert!(matches!(verify, Err(BackupError::Corrupt { .. })));
}

#[tokio::test]
async fn test_verify_reports_every_component() {
    let env = TestEnv::new(components());
    let backup_id = committed_backup(&env, &sealed_spec()).await;

    let report = env
        .restorer
        .verify(&backup_id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.backup_id, backup_id);
    let ids: Vec<_> = report
        .components
        .iter()
        .map(|c| c.component_id.as_str())
        .collect();
    assert_eq!(ids, vec!["dashboard-store", "metrics-store"]);
    assert!(env.components.imported().is_empty());
}

#[tokio::test]
async fn test_restore_after_deletion_reports_not_found() {
    let env = TestEnv::new(components());
    let backup_id = committed_backup(&env, &sealed_spec()).await;
    let record = env.catalog.get(&backup_id).await.unwrap();
    env.provider.delete(&record.storage_key).await.unwrap();

    let result = env
        .restorer
        .restore(&backup_id, None, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(BackupError::NotFound { .. })));
}
