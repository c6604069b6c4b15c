//! Device State Orchestrator - shared core.
//!
//! This crate holds everything that decides *what* happens to a device:
//! version-aware path resolution, variant detection, pre-mutation snapshots,
//! session lifecycle and the mutation state machine. Concrete transports and
//! the operator CLI live in the `dso` crate; tests drive the same code through
//! the in-memory [`mock`] transport.
//!
//! # Flow
//!
//! 1. [`session::SessionManager`] opens (and retries) a session.
//! 2. [`detect::VariantDetector`] classifies the device layout.
//! 3. [`paths::VersionPathResolver`] resolves the [`types::PathSet`].
//! 4. [`snapshot::SnapshotStore`] captures the affected files.
//! 5. [`orchestrator::MutationOrchestrator`] transfers, restarts, verifies.

pub mod artifact;
pub mod commands;
pub mod config;
pub mod detect;
pub mod errors;
pub mod events;
pub mod history;
pub mod logging;
pub mod mock;
pub mod orchestrator;
pub mod paths;
pub mod retry;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod types;
pub mod util;

pub use artifact::{ArtifactError, ArtifactSource, DirArtifactSource, MapArtifactSource};
pub use config::{ConfigError, DeviceConfig, DsoConfig, LoadedConfig, load_config};
pub use detect::{Detection, Evidence, ProbeChannel, VariantDetector};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use events::{DeviceEvent, EventBus, EventEnvelope, ProgressReporter};
pub use history::{HistoryEntry, RunHistory};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use mock::{MockDevice, MockTransport};
pub use orchestrator::{
    CancelFlag, MutationOrchestrator, MutationPlan, OrchestratorOptions, PlannedEntry,
    RestoreReport,
};
pub use paths::{MarkerCatalogue, VersionPathResolver};
pub use retry::{RetryPolicy, RetryableError, connect_with_retry};
pub use session::{Session, SessionError, SessionManager, SessionOptions};
pub use snapshot::{
    CaptureReport, EntryState, RestoreItem, RestoreOutcome, Snapshot, SnapshotEntry,
    SnapshotError, SnapshotStore, SnapshotSummary,
};
pub use transport::{
    AttributeValue, ChannelKind, CommandOutput, DeviceTransport, FileMeta, TransportError,
};
pub use types::{
    DeviceDescriptor, DeviceId, FailedArtifact, LogicalName, MutationCause, MutationResult,
    MutationStep, Operation, PathSet, SoftwareVersion, Variant, VersionParseError,
};
