//! Error Catalog for the Device State Orchestrator
//!
//! Every user-visible failure maps to a code in the `DSO-Exxx` format with a
//! message template and remediation steps. Orchestration results carry a
//! [`crate::types::MutationCause`], which resolves to one of these codes.
//!
//! # Example
//!
//! ```rust
//! use dso_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::SnapshotUnavailable.entry();
//! println!("{}", entry.format_full());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all DSO error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file contains invalid TOML
    ConfigParseError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Configuration contains invalid values
    ConfigValidationError,

    // =========================================================================
    // Session Errors (E100-E199)
    // =========================================================================
    /// Device is not attached or not listed by the transport
    SessionDeviceNotFound,
    /// Device refused the pairing handshake
    SessionHandshakeRejected,
    /// Transport failed in a way that may succeed on retry
    SessionTransientIo,
    /// Session opened but is unusable
    SessionInvalid,
    /// Remote command exceeded its timeout
    SessionTimeout,
    /// Shell channel required for writes is not available
    SessionChannelUnavailable,

    // =========================================================================
    // Detection Errors (E200-E299)
    // =========================================================================
    /// No variant catalogue matched
    DetectVariantIndeterminate,
    /// Only the narrow channel was available for detection
    DetectNarrowOnly,
    /// A marker probe failed with a transport error
    DetectProbeFailed,

    // =========================================================================
    // Snapshot Errors (E300-E399)
    // =========================================================================
    /// Zero files could be captured
    SnapshotUnavailable,
    /// Some files could not be captured
    SnapshotPartial,
    /// Snapshot id does not exist
    SnapshotNotFound,
    /// Snapshot manifest missing or unreadable
    SnapshotManifestMissing,
    /// Snapshot could not be written to local storage
    SnapshotPersistFailed,
    /// One or more files could not be restored
    SnapshotRestoreFailed,
    /// Retention pruning could not delete a snapshot
    SnapshotPruneFailed,

    // =========================================================================
    // Transfer Errors (E400-E499)
    // =========================================================================
    /// Artifact source did not supply a required entry
    TransferArtifactMissing,
    /// Some but not all files were written
    TransferPartialFailure,
    /// Canonical marker not observed after transfer
    TransferVerificationFailed,
    /// Permission change failed
    TransferPermissionFailed,
    /// Service restart command failed
    TransferRestartFailed,
    /// A single file write failed
    TransferWriteFailed,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Unexpected internal error
    InternalUnexpected,
    /// Run cancelled at a phase boundary
    InternalCancelled,
    /// Run history could not be recorded
    InternalHistoryError,
    /// Logging system error
    InternalLoggingError,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            // Config (001-099)
            Self::ConfigNotFound => 1,
            Self::ConfigParseError => 2,
            Self::ConfigEnvError => 3,
            Self::ConfigValidationError => 4,

            // Session (100-199)
            Self::SessionDeviceNotFound => 100,
            Self::SessionHandshakeRejected => 101,
            Self::SessionTransientIo => 102,
            Self::SessionInvalid => 103,
            Self::SessionTimeout => 104,
            Self::SessionChannelUnavailable => 105,

            // Detection (200-299)
            Self::DetectVariantIndeterminate => 200,
            Self::DetectNarrowOnly => 201,
            Self::DetectProbeFailed => 202,

            // Snapshot (300-399)
            Self::SnapshotUnavailable => 300,
            Self::SnapshotPartial => 301,
            Self::SnapshotNotFound => 302,
            Self::SnapshotManifestMissing => 303,
            Self::SnapshotPersistFailed => 304,
            Self::SnapshotRestoreFailed => 305,
            Self::SnapshotPruneFailed => 306,

            // Transfer (400-499)
            Self::TransferArtifactMissing => 400,
            Self::TransferPartialFailure => 401,
            Self::TransferVerificationFailed => 402,
            Self::TransferPermissionFailed => 403,
            Self::TransferRestartFailed => 404,
            Self::TransferWriteFailed => 405,

            // Internal (500-599)
            Self::InternalUnexpected => 500,
            Self::InternalCancelled => 501,
            Self::InternalHistoryError => 502,
            Self::InternalLoggingError => 503,
        }
    }

    /// Returns the formatted error code string (e.g., "DSO-E100").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("DSO-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Session,
            200..=299 => ErrorCategory::Detection,
            300..=399 => ErrorCategory::Snapshot,
            400..=499 => ErrorCategory::Transfer,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigParseError => "Configuration file contains invalid TOML",
            Self::ConfigEnvError => "Environment variable has an invalid value",
            Self::ConfigValidationError => "Configuration contains invalid values",

            Self::SessionDeviceNotFound => "Device not found",
            Self::SessionHandshakeRejected => "Device rejected the pairing handshake",
            Self::SessionTransientIo => "Transient transport failure",
            Self::SessionInvalid => "Session opened but is unusable",
            Self::SessionTimeout => "Remote command timed out",
            Self::SessionChannelUnavailable => "Shell channel unavailable on this session",

            Self::DetectVariantIndeterminate => "Device variant could not be determined",
            Self::DetectNarrowOnly => "Variant detection limited to the narrow channel",
            Self::DetectProbeFailed => "Marker probe failed",

            Self::SnapshotUnavailable => "No files could be captured before mutation",
            Self::SnapshotPartial => "Snapshot captured only some files",
            Self::SnapshotNotFound => "Snapshot not found",
            Self::SnapshotManifestMissing => "Snapshot manifest missing or unreadable",
            Self::SnapshotPersistFailed => "Snapshot could not be written to local storage",
            Self::SnapshotRestoreFailed => "Snapshot restore failed for one or more files",
            Self::SnapshotPruneFailed => "Snapshot retention pruning failed",

            Self::TransferArtifactMissing => "Artifact source did not supply a required artifact",
            Self::TransferPartialFailure => "Some artifacts failed to transfer",
            Self::TransferVerificationFailed => "Verification marker not present after transfer",
            Self::TransferPermissionFailed => "Permission change failed",
            Self::TransferRestartFailed => "Service restart failed",
            Self::TransferWriteFailed => "Artifact write failed",

            Self::InternalUnexpected => "Unexpected internal error",
            Self::InternalCancelled => "Run cancelled",
            Self::InternalHistoryError => "Run history could not be recorded",
            Self::InternalLoggingError => "Logging initialization failed",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Check the path passed with --config",
                "Omit --config to use built-in defaults",
            ],
            Self::ConfigParseError => &[
                "Validate the file with a TOML linter",
                "Run `dso config show` to inspect the effective configuration",
            ],
            Self::ConfigEnvError => &[
                "Check DSO_* environment variables for typos",
                "Unset the variable to fall back to the configured value",
            ],
            Self::ConfigValidationError => &[
                "Review the values reported by `dso config show`",
            ],

            Self::SessionDeviceNotFound => &[
                "Run `dso devices` to list reachable devices",
                "Check the cable or network path to the device",
            ],
            Self::SessionHandshakeRejected => &[
                "Unlock the device and accept the trust prompt",
                "Verify the host key or pairing record for this device",
            ],
            Self::SessionTransientIo => &[
                "Retry the operation",
                "Check that the device is not sleeping or rebooting",
            ],
            Self::SessionInvalid => &[
                "Reconnect the device",
                "Check that the device reports a numeric software version",
            ],
            Self::SessionTimeout => &[
                "Increase session.command_timeout_secs",
                "Check device load and connectivity",
            ],
            Self::SessionChannelUnavailable => &[
                "Enable the shell channel on the device",
                "Run `dso detect` to confirm which channels are available",
            ],

            Self::DetectVariantIndeterminate => &[
                "Run `dso detect` with a shell channel available",
                "Do not proceed with mutation until the layout is known",
            ],
            Self::DetectNarrowOnly => &[
                "Treat the result as weak evidence",
                "Retry once the shell channel is reachable",
            ],
            Self::DetectProbeFailed => &["Retry detection", "Check transport logs"],

            Self::SnapshotUnavailable => &[
                "Check that the shell channel can read the target paths",
                "No changes were made to the device",
            ],
            Self::SnapshotPartial => &[
                "Review the per-file warnings in the result",
                "Missing files cannot be restored from this snapshot",
            ],
            Self::SnapshotNotFound => &["Run `dso snapshots list` to see available snapshots"],
            Self::SnapshotManifestMissing => &[
                "Restore falls back to file names; verify the result afterwards",
            ],
            Self::SnapshotPersistFailed => &[
                "Check free space and permissions of snapshot.root",
            ],
            Self::SnapshotRestoreFailed => &[
                "Review per-file outcomes in the restore report",
                "Retry the restore once the device is reachable",
            ],
            Self::SnapshotPruneFailed => &["Remove the snapshot directory manually"],

            Self::TransferArtifactMissing => &[
                "Check that the artifact directory contains every logical name",
                "No changes were made beyond the snapshot",
            ],
            Self::TransferPartialFailure => &[
                "Review the failed list in the result",
                "Re-run or restore from the snapshot",
            ],
            Self::TransferVerificationFailed => &[
                "Restore the snapshot with `dso restore`",
                "Re-run detection to confirm the device layout",
            ],
            Self::TransferPermissionFailed => &["Check ownership of the target directories"],
            Self::TransferRestartFailed => &["Reboot the device manually"],
            Self::TransferWriteFailed => &["Check free space on the device"],

            Self::InternalUnexpected => &[
                "Re-run with DSO_LOG_LEVEL=debug and report the log",
            ],
            Self::InternalCancelled => &[
                "Re-run the operation",
                "The snapshot taken before cancellation is retained",
            ],
            Self::InternalHistoryError => &["Check permissions of history.path"],
            Self::InternalLoggingError => &["Check DSO_LOG_FILE and DSO_LOG_LEVEL"],
        }
    }

    /// Returns all error codes.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigParseError,
            Self::ConfigEnvError,
            Self::ConfigValidationError,
            Self::SessionDeviceNotFound,
            Self::SessionHandshakeRejected,
            Self::SessionTransientIo,
            Self::SessionInvalid,
            Self::SessionTimeout,
            Self::SessionChannelUnavailable,
            Self::DetectVariantIndeterminate,
            Self::DetectNarrowOnly,
            Self::DetectProbeFailed,
            Self::SnapshotUnavailable,
            Self::SnapshotPartial,
            Self::SnapshotNotFound,
            Self::SnapshotManifestMissing,
            Self::SnapshotPersistFailed,
            Self::SnapshotRestoreFailed,
            Self::SnapshotPruneFailed,
            Self::TransferArtifactMissing,
            Self::TransferPartialFailure,
            Self::TransferVerificationFailed,
            Self::TransferPermissionFailed,
            Self::TransferRestartFailed,
            Self::TransferWriteFailed,
            Self::InternalUnexpected,
            Self::InternalCancelled,
            Self::InternalHistoryError,
            Self::InternalLoggingError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and environment errors (E001-E099)
    Config,
    /// Device session and transport errors (E100-E199)
    Session,
    /// Variant detection errors (E200-E299)
    Detection,
    /// Snapshot errors (E300-E399)
    Snapshot,
    /// Transfer and verification errors (E400-E499)
    Transfer,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Session => "Session",
            Self::Detection => "Detection",
            Self::Snapshot => "Snapshot",
            Self::Transfer => "Transfer",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "DSO-E100")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
