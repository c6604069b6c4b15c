//! Common types used across DSO components.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

use crate::errors::ErrorCode;

/// Unique identifier for a device reachable through a transport.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a software-version string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unparsable software version '{raw}'")]
pub struct VersionParseError {
    pub raw: String,
}

/// Numeric (major, minor, patch) device software version.
///
/// Ordering is lexicographic on the triple. Any trailing build suffix
/// (`16.3.1b2`, `17.0 (21A329)`) is ignored by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SoftwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("version pattern is valid")
    })
}

impl SoftwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version string, rejecting anything without a leading number.
    pub fn parse(raw: &str) -> Result<Self, VersionParseError> {
        let err = || VersionParseError {
            raw: raw.to_string(),
        };
        let caps = version_pattern().captures(raw).ok_or_else(err)?;
        let component = |idx: usize| -> Result<u32, VersionParseError> {
            match caps.get(idx) {
                Some(m) => m.as_str().parse::<u32>().map_err(|_| err()),
                None => Ok(0),
            }
        };
        Ok(Self {
            major: component(1)?,
            minor: component(2)?,
            patch: component(3)?,
        })
    }
}

impl FromStr for SoftwareVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identifying attributes of a connected device.
///
/// Produced once per session and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    /// Raw software-version string as reported by the device.
    pub software_version: String,
    /// Parsed form of `software_version`.
    pub version: SoftwareVersion,
    pub hardware_class: String,
    pub serial: String,
    pub chip_id: String,
}

impl DeviceDescriptor {
    /// Build a descriptor, parsing the version string.
    pub fn new(
        id: DeviceId,
        software_version: impl Into<String>,
        hardware_class: impl Into<String>,
        serial: impl Into<String>,
        chip_id: impl Into<String>,
    ) -> Result<Self, VersionParseError> {
        let software_version = software_version.into();
        let version = SoftwareVersion::parse(&software_version)?;
        Ok(Self {
            id,
            software_version,
            version,
            hardware_class: hardware_class.into(),
            serial: serial.into(),
            chip_id: chip_id.into(),
        })
    }
}

/// Mutually-exclusive on-device filesystem layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Canonical paths rooted at the privileged home directory.
    Legacy,
    /// Paths rooted under the alternate namespace prefix.
    Relocated,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::Legacy, Variant::Relocated];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Relocated => "relocated",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "relocated" => Ok(Self::Relocated),
            other => Err(format!("unknown variant '{other}'")),
        }
    }
}

/// Stable identifier for a remote artifact, independent of where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalName {
    ActivationRecord,
    DataArk,
    SetupPrefs,
}

impl LogicalName {
    pub const ALL: [LogicalName; 3] = [
        LogicalName::ActivationRecord,
        LogicalName::DataArk,
        LogicalName::SetupPrefs,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ActivationRecord => "activation-record",
            Self::DataArk => "data-ark",
            Self::SetupPrefs => "setup-prefs",
        }
    }
}

impl fmt::Display for LogicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("unknown logical name '{s}'"))
    }
}

/// Logical name to absolute remote path mapping for one (version, variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSet {
    pub variant: Variant,
    pub version: SoftwareVersion,
    pub entries: BTreeMap<LogicalName, String>,
    /// Directory trees whose permissions are normalised after a transfer.
    pub permission_roots: Vec<String>,
    /// Entry whose presence proves the mutation landed.
    pub canonical_marker: LogicalName,
}

impl PathSet {
    pub fn path(&self, name: LogicalName) -> Option<&str> {
        self.entries.get(&name).map(String::as_str)
    }

    pub fn logical_names(&self) -> Vec<LogicalName> {
        self.entries.keys().copied().collect()
    }

    pub fn canonical_path(&self) -> Option<&str> {
        self.path(self.canonical_marker)
    }

    /// Reverse lookup of an absolute path.
    pub fn logical_for_path(&self, path: &str) -> Option<LogicalName> {
        self.entries
            .iter()
            .find(|(_, p)| p.as_str() == path)
            .map(|(name, _)| *name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LogicalName, &str)> {
        self.entries.iter().map(|(name, path)| (*name, path.as_str()))
    }
}

/// Ordered orchestration steps. `Failed` is reachable from any non-terminal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStep {
    Idle,
    DetectingVariant,
    Connecting,
    CapturingSnapshot,
    AcquiringArtifacts,
    Transferring,
    SettingPermissions,
    RestartingServices,
    Verifying,
    Complete,
    Failed,
}

impl MutationStep {
    /// The step that must follow this one on the success path.
    pub const fn next(&self) -> Option<MutationStep> {
        match self {
            Self::Idle => Some(Self::DetectingVariant),
            Self::DetectingVariant => Some(Self::Connecting),
            Self::Connecting => Some(Self::CapturingSnapshot),
            Self::CapturingSnapshot => Some(Self::AcquiringArtifacts),
            Self::AcquiringArtifacts => Some(Self::Transferring),
            Self::Transferring => Some(Self::SettingPermissions),
            Self::SettingPermissions => Some(Self::RestartingServices),
            Self::RestartingServices => Some(Self::Verifying),
            Self::Verifying => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::DetectingVariant => "detecting_variant",
            Self::Connecting => "connecting",
            Self::CapturingSnapshot => "capturing_snapshot",
            Self::AcquiringArtifacts => "acquiring_artifacts",
            Self::Transferring => "transferring",
            Self::SettingPermissions => "setting_permissions",
            Self::RestartingServices => "restarting_services",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MutationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable cause attached to a failed (or partially failed) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationCause {
    DeviceNotFound,
    HandshakeRejected,
    TransientIoFailure,
    SessionInvalid,
    ChannelUnavailable,
    VariantIndeterminate,
    ArtifactMissing,
    PartialTransferFailure,
    TransferFailed,
    VerificationFailed,
    SnapshotUnavailable,
    SnapshotNotFound,
    Cancelled,
    Internal,
}

impl MutationCause {
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::DeviceNotFound => ErrorCode::SessionDeviceNotFound,
            Self::HandshakeRejected => ErrorCode::SessionHandshakeRejected,
            Self::TransientIoFailure => ErrorCode::SessionTransientIo,
            Self::SessionInvalid => ErrorCode::SessionInvalid,
            Self::ChannelUnavailable => ErrorCode::SessionChannelUnavailable,
            Self::VariantIndeterminate => ErrorCode::DetectVariantIndeterminate,
            Self::ArtifactMissing => ErrorCode::TransferArtifactMissing,
            Self::PartialTransferFailure => ErrorCode::TransferPartialFailure,
            Self::TransferFailed => ErrorCode::TransferWriteFailed,
            Self::VerificationFailed => ErrorCode::TransferVerificationFailed,
            Self::SnapshotUnavailable => ErrorCode::SnapshotUnavailable,
            Self::SnapshotNotFound => ErrorCode::SnapshotNotFound,
            Self::Cancelled => ErrorCode::InternalCancelled,
            Self::Internal => ErrorCode::InternalUnexpected,
        }
    }
}

impl fmt::Display for MutationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_code().code_string())
    }
}

/// Which orchestration produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Install,
    Decommission,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Decommission => "decommission",
            Self::Restore => "restore",
        })
    }
}

/// One artifact that could not be written (or deleted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedArtifact {
    pub name: LogicalName,
    pub path: String,
    pub error: String,
}

/// Outcome record of one orchestration run. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    pub operation: Operation,
    pub device_id: DeviceId,
    pub success: bool,
    /// Step in progress when the run stopped, or `Complete`.
    pub current_step: MutationStep,
    pub failed_step: Option<MutationStep>,
    pub cause: Option<MutationCause>,
    /// Human-readable summary.
    pub message: String,
    /// Original low-level error text, when one exists.
    pub detail: Option<String>,
    pub variant: Option<Variant>,
    /// Logical names actually written (or deleted, for decommission).
    pub transferred: Vec<LogicalName>,
    pub failed: Vec<FailedArtifact>,
    pub warnings: Vec<String>,
    pub snapshot_id: Option<String>,
    pub elapsed_ms: u64,
    pub requires_reboot: bool,
}

impl MutationResult {
    /// True when at least one attempted file did not land.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}
