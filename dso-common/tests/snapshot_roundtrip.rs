//! Capture, restore, list and prune against a mock device.

mod common;

use std::fs;

use common::{TestRig, full_artifacts, init_test_logging, relocated_device};
use dso_common::snapshot::MANIFEST_FILE;
use dso_common::{
    LogicalName, MutationStep, RestoreOutcome, SnapshotStore, SoftwareVersion, Variant,
    VersionPathResolver,
};

fn relocated_16() -> dso_common::PathSet {
    let version = SoftwareVersion::parse("16.3.1").unwrap();
    VersionPathResolver::new().resolve(version, Variant::Relocated)
}

#[tokio::test]
async fn test_capture_then_restore_reproduces_device_state() {
    init_test_logging();
    crate::test_log!("TEST START: test_capture_then_restore_reproduces_device_state");

    let paths = relocated_16();
    let record = paths.path(LogicalName::ActivationRecord).unwrap().to_string();
    let ark = paths.path(LogicalName::DataArk).unwrap().to_string();
    let prefs = paths.path(LogicalName::SetupPrefs).unwrap().to_string();

    let device = relocated_device("dev")
        .with_file(&record, b"original record")
        .with_file(&ark, b"original ark");
    let mut rig = TestRig::new(device);
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let store = SnapshotStore::new(rig.snapshots.path());

    let report = store
        .capture(session, &paths, &LogicalName::ALL)
        .await
        .unwrap();
    assert!(!report.is_partial());
    assert_eq!(report.snapshot.captured_count(), 2);
    assert_eq!(report.snapshot.absent_count(), 1);

    // Disturb the device, then put it back.
    rig.transport.put_file(&id, &record, b"forged record");
    rig.transport.put_file(&id, &prefs, b"forged prefs");
    rig.transport.remove_path(&id, &ark);

    let items = store
        .restore(session, &paths, &report.snapshot.id)
        .await
        .unwrap();
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| !i.outcome.is_failure()), "{items:?}");

    assert_eq!(rig.transport.file(&id, &record), Some(b"original record".to_vec()));
    assert_eq!(rig.transport.file(&id, &ark), Some(b"original ark".to_vec()));
    assert!(!rig.transport.path_exists(&id, &prefs), "absent path must stay absent");

    crate::test_log!("TEST PASS: test_capture_then_restore_reproduces_device_state");
}

#[tokio::test]
async fn test_restore_without_manifest_uses_stored_names() {
    init_test_logging();
    crate::test_log!("TEST START: test_restore_without_manifest_uses_stored_names");

    let paths = relocated_16();
    let record = paths.path(LogicalName::ActivationRecord).unwrap().to_string();

    let mut rig = TestRig::new(relocated_device("dev").with_file(&record, b"v1"));
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let store = SnapshotStore::new(rig.snapshots.path());

    let report = store
        .capture(session, &paths, &LogicalName::ALL)
        .await
        .unwrap();
    let dir = rig.snapshots.path().join(&report.snapshot.id);
    fs::remove_file(dir.join(MANIFEST_FILE)).unwrap();
    fs::write(dir.join("stray-notes.blob"), b"?").unwrap();

    rig.transport.put_file(&id, &record, b"v2");
    let items = store
        .restore(session, &paths, &report.snapshot.id)
        .await
        .unwrap();

    assert_eq!(rig.transport.file(&id, &record), Some(b"v1".to_vec()));
    let skipped: Vec<_> = items
        .iter()
        .filter(|i| matches!(i.outcome, RestoreOutcome::Skipped { .. }))
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].stored_name, "stray-notes.blob");
    assert!(skipped[0].logical.is_none());

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].has_manifest);

    crate::test_log!("TEST PASS: test_restore_without_manifest_uses_stored_names");
}

#[tokio::test]
async fn test_orchestrated_restore_undoes_install() {
    init_test_logging();
    crate::test_log!("TEST START: test_orchestrated_restore_undoes_install");

    let paths = relocated_16();
    let ark = paths.path(LogicalName::DataArk).unwrap().to_string();
    let record = paths.path(LogicalName::ActivationRecord).unwrap().to_string();

    let mut rig = TestRig::new(relocated_device("dev").with_file(&ark, b"factory ark"));
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let installed = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;
    assert!(installed.success, "{installed:?}");
    let before = installed.snapshot_id.unwrap();

    let report = rig.orchestrator.restore(session, &before).await;
    assert!(report.result.success, "{report:?}");
    assert_eq!(report.result.current_step, MutationStep::Complete);
    assert_eq!(report.restored_from, before);
    assert_eq!(rig.transport.file(&id, &ark), Some(b"factory ark".to_vec()));
    assert!(!rig.transport.path_exists(&id, &record));

    // The restore itself took a safety snapshot.
    let safety = report.result.snapshot_id.unwrap();
    assert_ne!(safety, before);
    assert!(rig.orchestrator.store().load(&safety).is_ok());

    crate::test_log!("TEST PASS: test_orchestrated_restore_undoes_install");
}

#[tokio::test]
async fn test_restore_unknown_snapshot_fails_cleanly() {
    init_test_logging();

    let mut rig = TestRig::new(relocated_device("dev"));
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();

    let report = rig.orchestrator.restore(session, "dev-20240101T000000000Z").await;
    assert!(!report.result.success);
    assert_eq!(
        report.result.cause,
        Some(dso_common::MutationCause::SnapshotNotFound)
    );
    assert_eq!(rig.transport.mutation_count(&id), 0);
}

#[test]
fn test_prune_five_of_eight_via_public_api() {
    init_test_logging();

    let tmp = tempfile::TempDir::new().unwrap();
    let store = SnapshotStore::new(tmp.path());
    let device = dso_common::DeviceId::new("dev");
    let base = chrono::Utc::now();

    let mut ids = Vec::new();
    for minutes in 0..8 {
        let at = base + chrono::Duration::minutes(minutes);
        let snapshot = dso_common::Snapshot {
            format: 1,
            id: store.allocate_id(&device, at),
            device_id: device.clone(),
            device_version: "16.3.1".to_string(),
            variant: Some(Variant::Relocated),
            created_at: at,
            entries: Vec::new(),
        };
        store
            .persist(&snapshot, &std::collections::BTreeMap::new())
            .unwrap();
        ids.push(snapshot.id);
    }

    let deleted = store.prune(5).unwrap();
    assert_eq!(deleted.len(), 3);
    for id in &ids[..3] {
        assert!(deleted.contains(id));
    }
    let remaining: Vec<String> = store.list().unwrap().into_iter().map(|s| s.id).collect();
    let expected: Vec<String> = ids[3..].iter().rev().cloned().collect();
    assert_eq!(remaining, expected);
}
