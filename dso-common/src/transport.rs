//! Device transport interface.
//!
//! A transport exposes two channels over one opened handle: a narrow
//! file-attribute channel that is always present (existence and metadata
//! only) and an optional shell channel that can execute commands and move
//! bytes. Shell operations on a handle without a shell channel return
//! [`TransportError::Unsupported`].
//!
//! Core components never touch a transport directly; they go through
//! [`crate::session::Session`], which owns the handle and applies timeouts.

#![allow(async_fn_in_trait)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::retry::RetryableError;
use crate::types::DeviceId;

/// Which channel an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Narrow,
    Shell,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Narrow => "narrow",
            Self::Shell => "shell",
        })
    }
}

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("{operation} is not available without a {channel} channel")]
    Unsupported {
        operation: &'static str,
        channel: ChannelKind,
    },

    #[error("remote command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl RetryableError for TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

/// Metadata returned by a narrow-channel probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub is_dir: bool,
    pub size: u64,
    pub mode: Option<u32>,
}

/// Captured output of a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Typed value of a named device attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(i64),
    String(String),
}

impl AttributeValue {
    /// Render the value as a string regardless of its type.
    pub fn as_string(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

/// Low-level device transport consumed by the core.
///
/// `open_channel` and `handshake` are separate so a failed handshake can be
/// torn down with [`DeviceTransport::close`] before the next attempt.
pub trait DeviceTransport {
    type Handle;

    async fn list_devices(&self) -> Result<Vec<DeviceId>, TransportError>;

    async fn open_channel(&self, device: &DeviceId) -> Result<Self::Handle, TransportError>;

    async fn handshake(&self, handle: &mut Self::Handle) -> Result<(), TransportError>;

    async fn close(&self, handle: Self::Handle);

    async fn read_attribute(
        &self,
        handle: &Self::Handle,
        key: &str,
        domain: Option<&str>,
    ) -> Result<Option<AttributeValue>, TransportError>;

    /// Narrow-channel existence/metadata probe. `Ok(None)` means absent.
    async fn probe(&self, handle: &Self::Handle, path: &str)
    -> Result<Option<FileMeta>, TransportError>;

    fn has_shell(&self, handle: &Self::Handle) -> bool;

    async fn exec(&self, handle: &Self::Handle, command: &str)
    -> Result<CommandOutput, TransportError>;

    async fn download(&self, handle: &Self::Handle, path: &str) -> Result<Vec<u8>, TransportError>;

    async fn upload(
        &self,
        handle: &Self::Handle,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError>;

    /// Delete a file. Deleting a missing file reports `NotFound`.
    async fn delete(&self, handle: &Self::Handle, path: &str) -> Result<(), TransportError>;

    /// Create a directory and its parents. Existing directories are not an error.
    async fn mkdir_all(&self, handle: &Self::Handle, path: &str) -> Result<(), TransportError>;

    async fn chmod(
        &self,
        handle: &Self::Handle,
        path: &str,
        mode: u32,
        recursive: bool,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(TransportError::TransientIo("reset".into()).is_retryable());
        assert!(!TransportError::DeviceNotFound("x".into()).is_retryable());
        assert!(!TransportError::NotFound("/a".into()).is_retryable());
    }

    #[test]
    fn test_unsupported_message_names_channel() {
        let err = TransportError::Unsupported {
            operation: "upload",
            channel: ChannelKind::Shell,
        };
        assert_eq!(
            err.to_string(),
            "upload is not available without a shell channel"
        );
    }

    #[test]
    fn test_attribute_value_untagged_json() {
        let v: AttributeValue = serde_json::from_str("\"16.3.1\"").unwrap();
        assert_eq!(v.as_string(), "16.3.1");
        let b: AttributeValue = serde_json::from_str("true").unwrap();
        assert_eq!(b, AttributeValue::Bool(true));
        let n: AttributeValue = serde_json::from_str("42").unwrap();
        assert_eq!(n.as_string(), "42");
    }
}
