//! End-to-end orchestration runs against the in-memory transport.

mod common;

use common::{
    CANONICAL_RELOCATED_16, TestRig, full_artifacts, init_test_logging, relocated_device,
};
use dso_common::{
    DeviceEvent, Detection, EventBus, Evidence, LogicalName, MockDevice, MutationCause,
    MutationStep, OrchestratorOptions, RunHistory, Variant, VersionPathResolver,
};

#[tokio::test]
async fn test_narrow_only_unknown_device_is_never_touched() {
    init_test_logging();
    crate::test_log!("TEST START: test_narrow_only_unknown_device_is_never_touched");

    let mut rig = TestRig::new(MockDevice::new("narrow", "16.3.1").narrow_only());
    let id = rig.device("narrow");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let detection = rig.orchestrator.plan(session).await.detection;
    assert_eq!(
        detection,
        Detection::Unknown {
            evidence: Evidence::NarrowOnly
        }
    );

    let result = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;
    assert!(!result.success);
    assert_eq!(result.current_step, MutationStep::DetectingVariant);
    assert_eq!(result.failed_step, Some(MutationStep::DetectingVariant));
    assert_eq!(result.cause, Some(MutationCause::VariantIndeterminate));
    assert!(result.snapshot_id.is_none());
    assert_eq!(rig.transport.mutation_count(&id), 0);
    assert!(rig.orchestrator.store().list().unwrap().is_empty());

    crate::test_log!("TEST PASS: test_narrow_only_unknown_device_is_never_touched");
}

#[tokio::test]
async fn test_zero_capture_stops_before_transfer() {
    init_test_logging();
    crate::test_log!("TEST START: test_zero_capture_stops_before_transfer");

    let version = dso_common::SoftwareVersion::parse("16.3.1").unwrap();
    let paths = VersionPathResolver::new().resolve(version, Variant::Relocated);
    let device = paths
        .iter()
        .fold(relocated_device("flaky"), |d, (_, path)| d.fail_reads_for(path));

    let mut rig = TestRig::new(device);
    let id = rig.device("flaky");
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    rig.orchestrator = rig.orchestrator.with_events(bus);

    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();
    let result = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;

    assert!(!result.success);
    assert_eq!(result.current_step, MutationStep::CapturingSnapshot);
    assert_eq!(result.cause, Some(MutationCause::SnapshotUnavailable));
    assert!(result.transferred.is_empty());
    assert_eq!(rig.transport.mutation_count(&id), 0);

    while let Ok(envelope) = rx.try_recv() {
        if let DeviceEvent::StepChanged { step, .. } = envelope.event {
            assert!(step <= MutationStep::CapturingSnapshot || step == MutationStep::Failed);
        }
    }

    crate::test_log!("TEST PASS: test_zero_capture_stops_before_transfer");
}

#[tokio::test]
async fn test_one_failed_file_does_not_fail_verified_run() {
    init_test_logging();
    crate::test_log!("TEST START: test_one_failed_file_does_not_fail_verified_run");

    let version = dso_common::SoftwareVersion::parse("16.3.1").unwrap();
    let paths = VersionPathResolver::new().resolve(version, Variant::Relocated);
    let ark = paths.path(LogicalName::DataArk).unwrap().to_string();

    let mut rig = TestRig::new(relocated_device("dev").fail_writes_for(&ark));
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let result = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.current_step, MutationStep::Complete);
    assert_eq!(
        result.transferred,
        vec![LogicalName::ActivationRecord, LogicalName::SetupPrefs]
    );
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].name, LogicalName::DataArk);
    assert_eq!(result.failed[0].path, ark);
    assert_eq!(result.cause, Some(MutationCause::PartialTransferFailure));
    assert!(result.warnings.iter().any(|w| w.contains("DSO-E401")));

    crate::test_log!("TEST PASS: test_one_failed_file_does_not_fail_verified_run");
}

#[tokio::test]
async fn test_verification_decides_even_when_transfer_reports_success() {
    init_test_logging();
    crate::test_log!("TEST START: test_verification_decides_even_when_transfer_reports_success");

    let mut rig = TestRig::new(relocated_device("dev").fail_writes_for(CANONICAL_RELOCATED_16));
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let result = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;

    assert!(!result.success);
    assert_eq!(result.current_step, MutationStep::Verifying);
    assert_eq!(result.cause, Some(MutationCause::VerificationFailed));
    assert_eq!(result.transferred.len(), 2);
    assert!(result.snapshot_id.is_some(), "snapshot must survive a failed run");
    let snapshot_id = result.snapshot_id.unwrap();
    assert!(rig.orchestrator.store().load(&snapshot_id).is_ok());

    crate::test_log!("TEST PASS: test_verification_decides_even_when_transfer_reports_success");
}

#[tokio::test]
async fn test_sequential_and_parallel_transfers_agree() {
    init_test_logging();
    crate::test_log!("TEST START: test_sequential_and_parallel_transfers_agree");

    let version = dso_common::SoftwareVersion::parse("16.3.1").unwrap();
    let paths = VersionPathResolver::new().resolve(version, Variant::Relocated);
    let prefs = paths.path(LogicalName::SetupPrefs).unwrap().to_string();

    let mut outcomes = Vec::new();
    for parallel in [true, false] {
        let options = OrchestratorOptions {
            parallel,
            ..OrchestratorOptions::default()
        };
        let mut rig =
            TestRig::with_options(relocated_device("dev").fail_writes_for(&prefs), options);
        let id = rig.device("dev");
        let session = rig.manager.connect(&id).await.unwrap();
        let descriptor = session.descriptor().clone();
        let result = rig
            .orchestrator
            .run(session, &descriptor, &full_artifacts())
            .await;
        outcomes.push((result.transferred.clone(), result.failed.clone()));
    }

    assert_eq!(outcomes[0], outcomes[1]);

    crate::test_log!("TEST PASS: test_sequential_and_parallel_transfers_agree");
}

#[tokio::test]
async fn test_runs_are_recorded_in_history() {
    init_test_logging();
    crate::test_log!("TEST START: test_runs_are_recorded_in_history");

    let history_dir = tempfile::TempDir::new().unwrap();
    let history = RunHistory::new(history_dir.path().join("history.jsonl"));

    let mut rig = TestRig::new(relocated_device("dev"));
    rig.orchestrator = rig.orchestrator.with_history(history.clone());
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let installed = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;
    assert!(installed.success, "{installed:?}");
    let removed = rig.orchestrator.decommission(session, &descriptor).await;
    assert!(removed.success, "{removed:?}");

    let entries = history.recent(10, Some(&id)).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.success));
    assert!(entries.iter().all(|e| e.snapshot_id.is_some()));
    assert_eq!(entries.iter().map(|e| e.transferred).sum::<usize>(), 5);

    crate::test_log!("TEST PASS: test_runs_are_recorded_in_history");
}

#[tokio::test]
async fn test_auto_prune_keeps_configured_snapshots() {
    init_test_logging();
    crate::test_log!("TEST START: test_auto_prune_keeps_configured_snapshots");

    let options = OrchestratorOptions {
        keep_snapshots: 2,
        ..OrchestratorOptions::default()
    };
    let mut rig = TestRig::with_options(relocated_device("dev"), options);
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let mut last = None;
    for _ in 0..4 {
        let result = rig
            .orchestrator
            .run(session, &descriptor, &full_artifacts())
            .await;
        assert!(result.success, "{result:?}");
        last = result.snapshot_id;
    }

    let listed = rig.orchestrator.store().list().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(Some(listed[0].id.clone()), last);

    crate::test_log!("TEST PASS: test_auto_prune_keeps_configured_snapshots");
}

#[tokio::test]
async fn test_decommission_leaves_uncatalogued_entries() {
    init_test_logging();
    crate::test_log!("TEST START: test_decommission_leaves_uncatalogued_entries");

    let version = dso_common::SoftwareVersion::parse("16.3.1").unwrap();
    let paths = VersionPathResolver::new().resolve(version, Variant::Relocated);
    let ark = paths.path(LogicalName::DataArk).unwrap().to_string();
    let prefs = paths.path(LogicalName::SetupPrefs).unwrap().to_string();

    let device = relocated_device("dev")
        .with_file(CANONICAL_RELOCATED_16, b"record")
        .with_file(&ark, b"lockdown ark")
        .with_file(&prefs, b"prefs");
    let mut rig = TestRig::new(device);
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let result = rig.orchestrator.decommission(session, &descriptor).await;

    assert!(result.success, "{result:?}");
    assert_eq!(
        result.transferred,
        vec![LogicalName::ActivationRecord, LogicalName::SetupPrefs]
    );
    assert!(!rig.transport.path_exists(&id, CANONICAL_RELOCATED_16));
    assert!(!rig.transport.path_exists(&id, &prefs));
    assert_eq!(rig.transport.file(&id, &ark), Some(b"lockdown ark".to_vec()));

    // The snapshot still covers every resolved entry.
    let snapshot = rig
        .orchestrator
        .store()
        .load(result.snapshot_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(snapshot.captured_count(), 3);

    crate::test_log!("TEST PASS: test_decommission_leaves_uncatalogued_entries");
}

#[tokio::test]
async fn test_second_install_is_idempotent() {
    init_test_logging();
    crate::test_log!("TEST START: test_second_install_is_idempotent");

    let mut rig = TestRig::new(relocated_device("dev"));
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let first = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;
    assert!(first.success, "{first:?}");
    let tree_after_first = rig.transport.tree(&id);

    let second = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;
    assert!(second.success, "{second:?}");
    assert_eq!(second.cause, None);
    assert!(second.failed.is_empty());
    assert_eq!(second.transferred, first.transferred);
    assert!(
        second.warnings.iter().all(|w| !w.contains("DSO-E405")),
        "{:?}",
        second.warnings
    );
    assert_eq!(rig.transport.tree(&id), tree_after_first);

    crate::test_log!("TEST PASS: test_second_install_is_idempotent");
}

#[tokio::test]
async fn test_restore_rejects_snapshot_from_other_device() {
    init_test_logging();
    crate::test_log!("TEST START: test_restore_rejects_snapshot_from_other_device");

    let mut rig = TestRig::new(relocated_device("dev"));
    rig.transport.add_device(relocated_device("other"));
    let id = rig.device("dev");
    let other = rig.device("other");

    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();
    let installed = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;
    let snapshot_id = installed.snapshot_id.unwrap();

    let session = rig.manager.connect(&other).await.unwrap();
    let report = rig.orchestrator.restore(session, &snapshot_id).await;

    assert!(!report.result.success);
    assert_eq!(report.result.current_step, MutationStep::DetectingVariant);
    assert_eq!(report.result.cause, Some(MutationCause::SnapshotUnavailable));
    assert!(report.result.snapshot_id.is_none(), "no safety snapshot taken");
    assert!(report.items.is_empty());
    assert_eq!(rig.transport.mutation_count(&other), 0);
    assert_eq!(rig.orchestrator.store().list().unwrap().len(), 1);

    crate::test_log!("TEST PASS: test_restore_rejects_snapshot_from_other_device");
}

#[tokio::test]
async fn test_all_writes_failing_is_not_partial() {
    init_test_logging();
    crate::test_log!("TEST START: test_all_writes_failing_is_not_partial");

    let version = dso_common::SoftwareVersion::parse("16.3.1").unwrap();
    let paths = VersionPathResolver::new().resolve(version, Variant::Relocated);
    // The canonical marker is already present, so verification alone would pass.
    let device = paths.iter().fold(
        relocated_device("dev").with_file(CANONICAL_RELOCATED_16, b"old record"),
        |d, (_, path)| d.fail_writes_for(path),
    );
    let mut rig = TestRig::new(device);
    let id = rig.device("dev");
    let session = rig.manager.connect(&id).await.unwrap();
    let descriptor = session.descriptor().clone();

    let result = rig
        .orchestrator
        .run(session, &descriptor, &full_artifacts())
        .await;

    assert!(!result.success, "{result:?}");
    assert_eq!(result.current_step, MutationStep::Transferring);
    assert_eq!(result.cause, Some(MutationCause::TransferFailed));
    assert!(result.transferred.is_empty());
    assert_eq!(result.failed.len(), 3);
    assert!(result.snapshot_id.is_some());
    assert_eq!(
        rig.transport.file(&id, CANONICAL_RELOCATED_16),
        Some(b"old record".to_vec())
    );

    crate::test_log!("TEST PASS: test_all_writes_failing_is_not_partial");
}
