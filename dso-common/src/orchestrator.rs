//! Mutation orchestration.
//!
//! [`MutationOrchestrator`] drives one device through the step sequence
//!
//! ```text
//! Idle -> DetectingVariant -> Connecting -> CapturingSnapshot -> AcquiringArtifacts
//!      -> Transferring -> SettingPermissions -> RestartingServices -> Verifying -> Complete
//! ```
//!
//! with `Failed` reachable from any non-terminal step. Every entry point
//! returns a structured result; no transport or storage error escapes as
//! `Err`. A snapshot is always persisted before the first destructive
//! write and is never removed by an error path.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactSource;
use crate::commands;
use crate::detect::{Detection, Evidence, VariantDetector};
use crate::errors::ErrorCode;
use crate::events::{DeviceEvent, EventBus, ProgressReporter, percent_of};
use crate::history::{HistoryEntry, RunHistory};
use crate::paths::{VersionPathResolver, parent_dir};
use crate::session::Session;
use crate::snapshot::{RestoreItem, RestoreOutcome, SnapshotError, SnapshotStore};
use crate::transport::{DeviceTransport, TransportError};
use crate::types::{
    DeviceDescriptor, DeviceId, FailedArtifact, LogicalName, MutationCause, MutationResult,
    MutationStep, Operation, PathSet, Variant,
};

/// Cooperative cancellation, checked at every step boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Mode applied to written files and their owning trees.
    pub file_mode: u32,
    /// Run per-file transfers concurrently.
    pub parallel: bool,
    /// Processes terminated after a mutation, in order.
    pub restart_services: Vec<String>,
    /// Snapshots kept per device by auto-pruning.
    pub keep_snapshots: usize,
    pub auto_prune: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            file_mode: 0o755,
            parallel: true,
            restart_services: vec![
                "mobileactivationd".to_string(),
                "backboardd".to_string(),
                "SpringBoard".to_string(),
            ],
            keep_snapshots: 5,
            auto_prune: true,
        }
    }
}

/// One path a run would touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedEntry {
    pub logical: LogicalName,
    pub path: String,
    /// Whether the path exists now; `None` if the probe failed.
    pub exists: Option<bool>,
}

/// Dry-run description of what `run` would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationPlan {
    pub device_id: DeviceId,
    pub software_version: String,
    pub detection: Detection,
    pub entries: Vec<PlannedEntry>,
    pub permission_roots: Vec<String>,
    pub canonical_path: Option<String>,
    pub restart_services: Vec<String>,
    pub shell_available: bool,
    /// Why `run` would stop before mutating, if it would.
    pub blocked_by: Option<String>,
}

impl MutationPlan {
    pub fn can_proceed(&self) -> bool {
        self.blocked_by.is_none()
    }
}

/// Result of an orchestrated restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restored_from: String,
    pub items: Vec<RestoreItem>,
    pub result: MutationResult,
}

/// Why a run stopped.
#[derive(Debug)]
struct Failure {
    cause: MutationCause,
    message: String,
    detail: Option<String>,
}

impl Failure {
    fn new(cause: MutationCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl ToString) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    fn transport(context: &str, err: &TransportError) -> Self {
        let cause = match err {
            TransportError::DeviceNotFound(_) => MutationCause::DeviceNotFound,
            TransportError::HandshakeRejected(_) => MutationCause::HandshakeRejected,
            TransportError::TransientIo(_) => MutationCause::TransientIoFailure,
            TransportError::Unsupported { .. } => MutationCause::ChannelUnavailable,
            TransportError::NotFound(_) | TransportError::CommandFailed { .. } => {
                MutationCause::Internal
            }
        };
        Self::new(cause, context).with_detail(err)
    }

    fn snapshot(context: &str, err: &SnapshotError) -> Self {
        Self::new(err.cause(), context).with_detail(err)
    }
}

/// Bookkeeping for one run.
struct RunTracker {
    operation: Operation,
    device_id: DeviceId,
    started: Instant,
    step: MutationStep,
    events: Option<EventBus>,
    variant: Option<Variant>,
    transferred: Vec<LogicalName>,
    failed: Vec<FailedArtifact>,
    warnings: Vec<String>,
    snapshot_id: Option<String>,
}

impl RunTracker {
    fn new(operation: Operation, device_id: DeviceId, events: Option<EventBus>) -> Self {
        Self {
            operation,
            device_id,
            started: Instant::now(),
            step: MutationStep::Idle,
            events,
            variant: None,
            transferred: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
            snapshot_id: None,
        }
    }

    fn enter(&mut self, step: MutationStep) {
        debug_assert_eq!(self.step.next(), Some(step), "steps advance one at a time");
        self.step = step;
        info!(device = %self.device_id, operation = %self.operation, step = %step, "Entering step");
        self.emit_step(step);
    }

    fn emit_step(&self, step: MutationStep) {
        if let Some(bus) = &self.events {
            bus.emit(DeviceEvent::StepChanged {
                device_id: self.device_id.clone(),
                step,
            });
        }
    }

    fn warn(&mut self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        warn!(device = %self.device_id, step = %self.step, code = %code.code_string(), "{}", message);
        self.warnings.push(format!("{}: {message}", code.code_string()));
    }

    /// Fail the run when files were attempted and none of them landed.
    fn check_any_landed(&self) -> Result<(), Failure> {
        if self.failed.is_empty() || !self.transferred.is_empty() {
            return Ok(());
        }
        let first = &self.failed[0];
        Err(Failure::new(
            MutationCause::TransferFailed,
            format!("none of {} artifacts landed", self.failed.len()),
        )
        .with_detail(format!("{}: {}", first.name, first.error)))
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn fail(self, failure: Failure) -> MutationResult {
        warn!(
            device = %self.device_id,
            operation = %self.operation,
            step = %self.step,
            code = %failure.cause.error_code().code_string(),
            detail = failure.detail.as_deref().unwrap_or(""),
            "Run failed: {}",
            failure.message
        );
        self.emit_step(MutationStep::Failed);
        let elapsed_ms = self.elapsed_ms();
        MutationResult {
            operation: self.operation,
            device_id: self.device_id,
            success: false,
            current_step: self.step,
            failed_step: Some(self.step),
            cause: Some(failure.cause),
            message: failure.message,
            detail: failure.detail,
            variant: self.variant,
            transferred: self.transferred,
            failed: self.failed,
            warnings: self.warnings,
            snapshot_id: self.snapshot_id,
            elapsed_ms,
            requires_reboot: false,
        }
    }

    fn complete(mut self, message: String) -> MutationResult {
        self.step = MutationStep::Complete;
        self.emit_step(MutationStep::Complete);
        let cause = if self.failed.is_empty() {
            None
        } else {
            let code = MutationCause::PartialTransferFailure.error_code();
            let summary = format!(
                "{} of {} artifacts did not land: {}",
                self.failed.len(),
                self.failed.len() + self.transferred.len(),
                self.failed
                    .iter()
                    .map(|f| f.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            self.warn(code, summary);
            Some(MutationCause::PartialTransferFailure)
        };
        let elapsed_ms = self.elapsed_ms();
        info!(
            device = %self.device_id,
            operation = %self.operation,
            transferred = self.transferred.len(),
            failed = self.failed.len(),
            elapsed_ms,
            "Run complete"
        );
        MutationResult {
            operation: self.operation,
            device_id: self.device_id,
            success: true,
            current_step: MutationStep::Complete,
            failed_step: None,
            cause,
            message,
            detail: None,
            variant: self.variant,
            transferred: self.transferred,
            failed: self.failed,
            warnings: self.warnings,
            snapshot_id: self.snapshot_id,
            elapsed_ms,
            requires_reboot: true,
        }
    }
}

/// What the transfer step does with each path.
enum TransferKind<'a> {
    Write(&'a BTreeMap<LogicalName, Vec<u8>>),
    Delete,
}

/// Sequences detection, snapshot, transfer, restart and verification.
pub struct MutationOrchestrator {
    resolver: VersionPathResolver,
    detector: VariantDetector,
    store: SnapshotStore,
    options: OrchestratorOptions,
    events: Option<EventBus>,
    history: Option<RunHistory>,
    cancel: CancelFlag,
}

impl MutationOrchestrator {
    pub fn new(store: SnapshotStore, options: OrchestratorOptions) -> Self {
        Self {
            resolver: VersionPathResolver::new(),
            detector: VariantDetector::new(),
            store,
            options,
            events: None,
            history: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_detector(mut self, detector: VariantDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_history(mut self, history: RunHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Install replacement artifacts on the device behind `session`.
    pub async fn run<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        descriptor: &DeviceDescriptor,
        source: &impl ArtifactSource,
    ) -> MutationResult {
        let mut tracker = RunTracker::new(
            Operation::Install,
            descriptor.id.clone(),
            self.events.clone(),
        );
        let result = match self.install(session, descriptor, source, &mut tracker).await {
            Ok(()) => tracker.complete(format!("installed artifacts on {}", descriptor.id)),
            Err(failure) => tracker.fail(failure),
        };
        self.record(&result, descriptor);
        result
    }

    /// Remove the installed markers from the device behind `session`.
    pub async fn decommission<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        descriptor: &DeviceDescriptor,
    ) -> MutationResult {
        let mut tracker = RunTracker::new(
            Operation::Decommission,
            descriptor.id.clone(),
            self.events.clone(),
        );
        let result = match self.remove_markers(session, descriptor, &mut tracker).await {
            Ok(()) => tracker.complete(format!("removed markers from {}", descriptor.id)),
            Err(failure) => tracker.fail(failure),
        };
        self.record(&result, descriptor);
        result
    }

    /// Write a stored snapshot back to the device.
    ///
    /// The current state is captured first, so a restore can itself be
    /// undone.
    pub async fn restore<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        snapshot_id: &str,
    ) -> RestoreReport {
        let descriptor = session.descriptor().clone();
        let mut tracker = RunTracker::new(
            Operation::Restore,
            descriptor.id.clone(),
            self.events.clone(),
        );
        let mut items = Vec::new();
        let result = match self
            .restore_steps(session, &descriptor, snapshot_id, &mut tracker, &mut items)
            .await
        {
            Ok(()) => tracker.complete(format!("restored snapshot {snapshot_id}")),
            Err(failure) => tracker.fail(failure),
        };
        self.record(&result, &descriptor);
        RestoreReport {
            restored_from: snapshot_id.to_string(),
            items,
            result,
        }
    }

    /// Detect and resolve without touching the device.
    pub async fn plan<T: DeviceTransport>(&self, session: &Session<T>) -> MutationPlan {
        let descriptor = session.descriptor();
        let detection = self.detector.detect(session).await;
        let shell_available = session.has_shell();

        let mut plan = MutationPlan {
            device_id: descriptor.id.clone(),
            software_version: descriptor.software_version.clone(),
            detection: detection.clone(),
            entries: Vec::new(),
            permission_roots: Vec::new(),
            canonical_path: None,
            restart_services: self.options.restart_services.clone(),
            shell_available,
            blocked_by: None,
        };

        let Some(variant) = detection.variant() else {
            plan.blocked_by = Some(indeterminate_message(&detection));
            return plan;
        };

        let paths = self.resolver.resolve(descriptor.version, variant);
        for (logical, path) in paths.iter() {
            let exists = session.exists(path).await.ok();
            plan.entries.push(PlannedEntry {
                logical,
                path: path.to_string(),
                exists,
            });
        }
        plan.permission_roots = paths.permission_roots.clone();
        plan.canonical_path = paths.canonical_path().map(str::to_string);
        if !shell_available {
            plan.blocked_by = Some("device exposes no shell channel".to_string());
        }
        plan
    }

    fn record(&self, result: &MutationResult, descriptor: &DeviceDescriptor) {
        let Some(history) = &self.history else {
            return;
        };
        if let Err(err) = history.record(&HistoryEntry::from_result(result, descriptor)) {
            warn!(
                code = %ErrorCode::InternalHistoryError.code_string(),
                error = %err,
                "Failed to record run history"
            );
        }
    }

    fn checkpoint(&self) -> Result<(), Failure> {
        if self.cancel.is_cancelled() {
            Err(Failure::new(
                MutationCause::Cancelled,
                "run cancelled before the next step",
            ))
        } else {
            Ok(())
        }
    }

    async fn step_detect<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        descriptor: &DeviceDescriptor,
        tracker: &mut RunTracker,
    ) -> Result<PathSet, Failure> {
        tracker.enter(MutationStep::DetectingVariant);
        self.checkpoint()?;
        let detection = self.detector.detect(session).await;
        let variant = detection.variant().ok_or_else(|| {
            Failure::new(
                MutationCause::VariantIndeterminate,
                indeterminate_message(&detection),
            )
        })?;
        tracker.variant = Some(variant);
        Ok(self.resolver.resolve(descriptor.version, variant))
    }

    async fn step_connect<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        tracker: &mut RunTracker,
    ) -> Result<(), Failure> {
        tracker.enter(MutationStep::Connecting);
        self.checkpoint()?;
        if !session.has_shell() {
            return Err(Failure::new(
                MutationCause::ChannelUnavailable,
                "device exposes no shell channel; cannot mutate",
            ));
        }
        let output = session
            .exec(commands::LIVENESS)
            .await
            .map_err(|e| Failure::transport("shell channel did not respond", &e))?;
        if output.stdout.trim() != commands::LIVENESS_REPLY {
            return Err(Failure::new(
                MutationCause::ChannelUnavailable,
                "shell channel returned an unexpected liveness reply",
            )
            .with_detail(format!("status {}: {}", output.status, output.stdout.trim())));
        }
        Ok(())
    }

    async fn step_capture<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        paths: &PathSet,
        tracker: &mut RunTracker,
        prune: bool,
    ) -> Result<(), Failure> {
        tracker.enter(MutationStep::CapturingSnapshot);
        self.checkpoint()?;
        let names = paths.logical_names();
        let report = self
            .store
            .capture(session, paths, &names)
            .await
            .map_err(|e| Failure::snapshot("no snapshot could be taken; refusing to mutate", &e))?;

        tracker.snapshot_id = Some(report.snapshot.id.clone());
        if report.is_partial() {
            for warning in &report.warnings {
                tracker.warn(ErrorCode::SnapshotPartial, warning.clone());
            }
        }

        if prune && self.options.auto_prune {
            let keep = self.options.keep_snapshots.max(1);
            if let Err(err) = self.store.prune_device(&tracker.device_id, keep) {
                tracker.warn(ErrorCode::SnapshotPruneFailed, err.to_string());
            }
        }
        Ok(())
    }

    async fn install<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        descriptor: &DeviceDescriptor,
        source: &impl ArtifactSource,
        tracker: &mut RunTracker,
    ) -> Result<(), Failure> {
        let paths = self.step_detect(session, descriptor, tracker).await?;
        self.step_connect(session, tracker).await?;
        self.step_capture(session, &paths, tracker, true).await?;

        tracker.enter(MutationStep::AcquiringArtifacts);
        self.checkpoint()?;
        let names = paths.logical_names();
        let artifacts = source.for_artifacts(descriptor, &names);
        if let Some(missing) = names.iter().find(|n| !artifacts.contains_key(*n)) {
            return Err(Failure::new(
                MutationCause::ArtifactMissing,
                format!("artifact source did not provide {missing}"),
            ));
        }

        tracker.enter(MutationStep::Transferring);
        self.checkpoint()?;
        let items = paths
            .iter()
            .map(|(name, path)| (name, path.to_string()))
            .collect();
        self.transfer(session, items, TransferKind::Write(&artifacts), tracker)
            .await?;

        tracker.enter(MutationStep::SettingPermissions);
        self.checkpoint()?;
        let written: Vec<String> = tracker
            .transferred
            .iter()
            .filter_map(|n| paths.path(*n).map(str::to_string))
            .collect();
        self.set_permissions(session, &written, &paths.permission_roots, tracker)
            .await;

        tracker.enter(MutationStep::RestartingServices);
        self.checkpoint()?;
        self.restart_services(session, tracker).await;

        tracker.enter(MutationStep::Verifying);
        self.checkpoint()?;
        self.verify_canonical(session, &paths, true).await
    }

    async fn remove_markers<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        descriptor: &DeviceDescriptor,
        tracker: &mut RunTracker,
    ) -> Result<(), Failure> {
        let paths = self.step_detect(session, descriptor, tracker).await?;
        self.step_connect(session, tracker).await?;
        self.step_capture(session, &paths, tracker, true).await?;

        tracker.enter(MutationStep::AcquiringArtifacts);
        self.checkpoint()?;
        debug!(device = %descriptor.id, "Decommission needs no artifacts");

        tracker.enter(MutationStep::Transferring);
        self.checkpoint()?;
        let targets = self.resolver.decommission_targets(&paths);
        debug!(device = %descriptor.id, targets = targets.len(), "Removing catalogued entries");
        self.transfer(session, targets, TransferKind::Delete, tracker)
            .await?;

        tracker.enter(MutationStep::SettingPermissions);
        self.checkpoint()?;
        debug!(device = %descriptor.id, "No files written; permissions unchanged");

        tracker.enter(MutationStep::RestartingServices);
        self.checkpoint()?;
        self.restart_services(session, tracker).await;

        tracker.enter(MutationStep::Verifying);
        self.checkpoint()?;
        self.verify_canonical(session, &paths, false).await
    }

    async fn restore_steps<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        descriptor: &DeviceDescriptor,
        snapshot_id: &str,
        tracker: &mut RunTracker,
        items: &mut Vec<RestoreItem>,
    ) -> Result<(), Failure> {
        tracker.enter(MutationStep::DetectingVariant);
        self.checkpoint()?;
        let manifest = match self.store.load(snapshot_id) {
            Ok(snapshot) => Some(snapshot),
            Err(SnapshotError::ManifestMissing(_)) | Err(SnapshotError::Manifest { .. }) => {
                tracker.warn(
                    ErrorCode::SnapshotManifestMissing,
                    format!("snapshot {snapshot_id} has no readable manifest; restoring by file name"),
                );
                None
            }
            Err(err) => return Err(Failure::snapshot("snapshot cannot be restored", &err)),
        };
        if let Some(snapshot) = &manifest
            && snapshot.device_id != descriptor.id
        {
            let err = SnapshotError::DeviceMismatch {
                snapshot: snapshot_id.to_string(),
                expected: snapshot.device_id.clone(),
                actual: descriptor.id.clone(),
            };
            return Err(Failure::snapshot("snapshot was taken from another device", &err));
        }
        let detection = self.detector.detect(session).await;
        let variant = detection
            .variant()
            .or_else(|| manifest.as_ref().and_then(|m| m.variant))
            .ok_or_else(|| {
                Failure::new(
                    MutationCause::VariantIndeterminate,
                    indeterminate_message(&detection),
                )
            })?;
        tracker.variant = Some(variant);
        let paths = self.resolver.resolve(descriptor.version, variant);

        self.step_connect(session, tracker).await?;
        self.step_capture(session, &paths, tracker, false).await?;

        tracker.enter(MutationStep::AcquiringArtifacts);
        self.checkpoint()?;
        debug!(snapshot = snapshot_id, "Using stored snapshot files as artifacts");

        tracker.enter(MutationStep::Transferring);
        self.checkpoint()?;
        let restored = self
            .store
            .restore(session, &paths, snapshot_id)
            .await
            .map_err(|e| Failure::snapshot("snapshot cannot be restored", &e))?;

        let mut written = Vec::new();
        let mut expectations = Vec::new();
        for item in &restored {
            match (&item.outcome, item.logical) {
                (RestoreOutcome::Restored { path }, Some(name)) => {
                    tracker.transferred.push(name);
                    written.push(path.clone());
                    expectations.push((path.clone(), true));
                }
                (RestoreOutcome::RemovedAbsent { path }, Some(name)) => {
                    tracker.transferred.push(name);
                    expectations.push((path.clone(), false));
                }
                (RestoreOutcome::Failed { reason }, Some(name)) => {
                    tracker.failed.push(FailedArtifact {
                        name,
                        path: paths.path(name).unwrap_or_default().to_string(),
                        error: reason.clone(),
                    });
                }
                (RestoreOutcome::Skipped { reason }, _) | (RestoreOutcome::Failed { reason }, None) => {
                    tracker.warn(ErrorCode::SnapshotRestoreFailed, reason.clone());
                }
                (RestoreOutcome::Restored { .. } | RestoreOutcome::RemovedAbsent { .. }, None) => {}
            }
        }
        *items = restored;
        tracker.check_any_landed()?;

        tracker.enter(MutationStep::SettingPermissions);
        self.checkpoint()?;
        self.set_permissions(session, &written, &[], tracker).await;

        tracker.enter(MutationStep::RestartingServices);
        self.checkpoint()?;
        self.restart_services(session, tracker).await;

        tracker.enter(MutationStep::Verifying);
        self.checkpoint()?;
        for (path, should_exist) in expectations {
            let exists = session
                .exists(&path)
                .await
                .map_err(|e| Failure::transport("could not verify restored state", &e))?;
            if exists != should_exist {
                return Err(Failure::new(
                    MutationCause::VerificationFailed,
                    format!(
                        "{path} is {} after restore",
                        if exists { "present" } else { "missing" }
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Write or delete every item, recording per-file outcomes in request
    /// order.
    async fn transfer<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        items: Vec<(LogicalName, String)>,
        kind: TransferKind<'_>,
        tracker: &mut RunTracker,
    ) -> Result<(), Failure> {
        let reporter = ProgressReporter::new(self.events.clone(), tracker.device_id.clone());
        reporter.report(0, format!("starting transfer of {} files", items.len()));

        let kind = &kind;
        let outcomes = self
            .for_each_file(items, &reporter, |name, path| async move {
                match kind {
                    TransferKind::Write(artifacts) => match artifacts.get(&name) {
                        Some(bytes) => write_one(session, &path, bytes).await,
                        None => Err(format!("no bytes for {name}")),
                    },
                    TransferKind::Delete => delete_one(session, &path).await,
                }
            })
            .await;

        for (name, path, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    debug!(logical_name = %name, path, "Transferred");
                    tracker.transferred.push(name);
                }
                Err(error) => {
                    warn!(
                        logical_name = %name,
                        path,
                        code = %ErrorCode::TransferWriteFailed.code_string(),
                        error,
                        "Transfer failed"
                    );
                    tracker.failed.push(FailedArtifact { name, path, error });
                }
            }
        }
        reporter.report(100, "transfer finished");
        tracker.check_any_landed()
    }

    async fn for_each_file<F, Fut>(
        &self,
        items: Vec<(LogicalName, String)>,
        reporter: &ProgressReporter,
        op: F,
    ) -> Vec<(LogicalName, String, Result<(), String>)>
    where
        F: Fn(LogicalName, String) -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let total = items.len();
        let done = AtomicUsize::new(0);
        let done = &done;
        let op = &op;
        let run_one = |name: LogicalName, path: String| async move {
            let outcome = op(name, path.clone()).await;
            let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
            reporter.report(percent_of(finished, total), format!("{name} ({finished}/{total})"));
            (name, path, outcome)
        };

        if self.options.parallel {
            join_all(items.into_iter().map(|(name, path)| run_one(name, path))).await
        } else {
            let mut outcomes = Vec::with_capacity(total);
            for (name, path) in items {
                outcomes.push(run_one(name, path).await);
            }
            outcomes
        }
    }

    async fn set_permissions<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        files: &[String],
        trees: &[String],
        tracker: &mut RunTracker,
    ) {
        let mode = self.options.file_mode;
        for path in files {
            if let Err(err) = session.set_mode(path, mode, false).await {
                tracker.warn(
                    ErrorCode::TransferPermissionFailed,
                    format!("chmod {mode:o} {path}: {err}"),
                );
            }
        }
        for tree in trees {
            if let Err(err) = session.set_mode(tree, mode, true).await {
                tracker.warn(
                    ErrorCode::TransferPermissionFailed,
                    format!("chmod -R {mode:o} {tree}: {err}"),
                );
            }
        }
    }

    async fn restart_services<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        tracker: &mut RunTracker,
    ) {
        for service in &self.options.restart_services {
            match session.exec(&commands::terminate_process(service)).await {
                Ok(output) if output.success() => debug!(service, "Service signalled"),
                Ok(output) => tracker.warn(
                    ErrorCode::TransferRestartFailed,
                    format!("restarting {service} exited {}: {}", output.status, output.stderr.trim()),
                ),
                Err(err) => tracker.warn(
                    ErrorCode::TransferRestartFailed,
                    format!("restarting {service}: {err}"),
                ),
            }
        }
    }

    async fn verify_canonical<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        paths: &PathSet,
        expect_present: bool,
    ) -> Result<(), Failure> {
        let Some(canonical) = paths.canonical_path() else {
            return Err(Failure::new(
                MutationCause::VerificationFailed,
                "no canonical marker path for this device",
            ));
        };
        let exists = session
            .exists(canonical)
            .await
            .map_err(|e| {
                Failure::new(
                    MutationCause::VerificationFailed,
                    format!("could not probe {canonical}"),
                )
                .with_detail(e)
            })?;
        match (expect_present, exists) {
            (true, false) => Err(Failure::new(
                MutationCause::VerificationFailed,
                format!("canonical marker {canonical} is missing after transfer"),
            )),
            (false, true) => Err(Failure::new(
                MutationCause::VerificationFailed,
                format!("canonical marker {canonical} is still present after removal"),
            )),
            _ => {
                info!(path = canonical, expect_present, "Verification passed");
                Ok(())
            }
        }
    }
}

fn indeterminate_message(detection: &Detection) -> String {
    match detection {
        Detection::Unknown {
            evidence: Evidence::NarrowOnly,
        } => format!(
            "device layout unknown; only the narrow channel was available ({})",
            ErrorCode::DetectNarrowOnly.code_string()
        ),
        _ => "device layout unknown; no variant marker found".to_string(),
    }
}

async fn write_one<T: DeviceTransport>(
    session: &Session<T>,
    path: &str,
    bytes: &[u8],
) -> Result<(), String> {
    if let Some(parent) = parent_dir(path) {
        session
            .create_dir_all(parent)
            .await
            .map_err(|e| format!("creating {parent}: {e}"))?;
    }
    session
        .write_file(path, bytes)
        .await
        .map_err(|e| format!("writing {path}: {e}"))
}

async fn delete_one<T: DeviceTransport>(session: &Session<T>, path: &str) -> Result<(), String> {
    match session.remove(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => {
            debug!(path, "Already absent");
            Ok(())
        }
        Err(err) => Err(format!("removing {path}: {err}")),
    }
}
