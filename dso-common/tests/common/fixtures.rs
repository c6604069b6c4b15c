use std::time::Duration;

use dso_common::{
    DeviceId, LogicalName, MapArtifactSource, MockDevice, MockTransport, MutationOrchestrator,
    OrchestratorOptions, RetryPolicy, SessionManager, SessionOptions, SnapshotStore,
};
use tempfile::TempDir;

pub const CANONICAL_RELOCATED_16: &str = "/var/jb/var/containers/Data/System/com.apple.mobileactivationd/Library/internal/activation_records/activation_record.plist";

/// No retry delay and a short command timeout.
pub fn quick_options() -> SessionOptions {
    SessionOptions {
        retry: RetryPolicy::fixed(3, Duration::ZERO),
        command_timeout: Duration::from_secs(2),
    }
}

/// A 16.3.1 device carrying the first relocated marker.
pub fn relocated_device(id: &str) -> MockDevice {
    MockDevice::new(id, "16.3.1").with_dir("/var/jb")
}

/// One artifact per logical name; bytes are the name itself.
pub fn full_artifacts() -> MapArtifactSource {
    LogicalName::ALL.into_iter().fold(MapArtifactSource::new(), |source, name| {
        source.with(name, format!("new {name}").into_bytes())
    })
}

/// Transport, session manager and orchestrator over a temporary snapshot root.
pub struct TestRig {
    pub snapshots: TempDir,
    pub transport: MockTransport,
    pub manager: SessionManager<MockTransport>,
    pub orchestrator: MutationOrchestrator,
}

impl TestRig {
    pub fn new(device: MockDevice) -> Self {
        Self::with_options(device, OrchestratorOptions::default())
    }

    pub fn with_options(device: MockDevice, options: OrchestratorOptions) -> Self {
        crate::test_log!("FIXTURE: rig for device {}", device.id());
        let snapshots = TempDir::new().expect("Failed to create snapshot dir");
        let transport = MockTransport::new().with_device(device);
        let manager = SessionManager::new(transport.clone(), quick_options());
        let orchestrator =
            MutationOrchestrator::new(SnapshotStore::new(snapshots.path()), options);
        Self {
            snapshots,
            transport,
            manager,
            orchestrator,
        }
    }

    pub fn device(&self, id: &str) -> DeviceId {
        DeviceId::new(id)
    }
}
