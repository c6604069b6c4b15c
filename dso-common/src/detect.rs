//! Empirical variant detection.
//!
//! The detector walks the marker catalogues in order, first over the narrow
//! attribute channel and then, when the session has one, over the shell
//! channel. The first marker that exists decides the variant. The shell pass
//! ends with a scan of the system identification string for known
//! signatures.
//!
//! Detection never mutates the device. Probe failures count as "not seen"
//! and are logged.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::commands;
use crate::errors::ErrorCode;
use crate::paths::{MARKER_CATALOGUES, MarkerCatalogue};
use crate::session::Session;
use crate::transport::{DeviceTransport, TransportError};
use crate::types::Variant;

/// How a positive detection was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeChannel {
    Narrow,
    Shell,
    Signature,
}

/// Strength of a negative detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    /// Only the narrow channel was consulted. A shell could still find a marker.
    NarrowOnly,
    /// Both channels were consulted and nothing matched.
    Exhaustive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Detection {
    Found {
        variant: Variant,
        marker: String,
        channel: ProbeChannel,
    },
    Unknown {
        evidence: Evidence,
    },
}

impl Detection {
    pub fn variant(&self) -> Option<Variant> {
        match self {
            Self::Found { variant, .. } => Some(*variant),
            Self::Unknown { .. } => None,
        }
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found {
                variant,
                marker,
                channel,
            } => write!(f, "{variant} (marker {marker} via {channel:?})"),
            Self::Unknown {
                evidence: Evidence::NarrowOnly,
            } => f.write_str("unknown (narrow channel only)"),
            Self::Unknown {
                evidence: Evidence::Exhaustive,
            } => f.write_str("unknown (all channels probed)"),
        }
    }
}

/// Classifies a device by marker presence.
#[derive(Debug, Clone)]
pub struct VariantDetector {
    catalogues: Vec<MarkerCatalogue>,
}

impl Default for VariantDetector {
    fn default() -> Self {
        Self {
            catalogues: MARKER_CATALOGUES.to_vec(),
        }
    }
}

impl VariantDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalogues(catalogues: Vec<MarkerCatalogue>) -> Self {
        Self { catalogues }
    }

    pub async fn detect<T: DeviceTransport>(&self, session: &Session<T>) -> Detection {
        let device = session.device_id();

        if let Some(found) = self.probe_narrow(session).await {
            info!(device = %device, detection = %found, "Variant detected");
            return found;
        }

        if !session.has_shell() {
            info!(device = %device, "No marker visible over narrow channel and no shell available");
            return Detection::Unknown {
                evidence: Evidence::NarrowOnly,
            };
        }

        if let Some(found) = self.probe_shell(session).await {
            info!(device = %device, detection = %found, "Variant detected");
            return found;
        }

        info!(device = %device, "No variant marker found on any channel");
        Detection::Unknown {
            evidence: Evidence::Exhaustive,
        }
    }

    async fn probe_narrow<T: DeviceTransport>(&self, session: &Session<T>) -> Option<Detection> {
        for catalogue in &self.catalogues {
            for marker in catalogue.markers {
                match session.probe(marker).await {
                    Ok(Some(_)) => {
                        return Some(Detection::Found {
                            variant: catalogue.variant,
                            marker: (*marker).to_string(),
                            channel: ProbeChannel::Narrow,
                        });
                    }
                    Ok(None) => debug!(marker, "absent (narrow)"),
                    Err(TransportError::Unsupported { .. }) => {
                        debug!("Narrow probe unsupported on this session");
                        return None;
                    }
                    Err(err) => warn!(
                        marker,
                        code = %ErrorCode::DetectProbeFailed.code_string(),
                        error = %err,
                        "Narrow probe failed; treating as absent"
                    ),
                }
            }
        }
        None
    }

    async fn probe_shell<T: DeviceTransport>(&self, session: &Session<T>) -> Option<Detection> {
        for catalogue in &self.catalogues {
            for marker in catalogue.markers {
                match session.shell_exists(marker).await {
                    Ok(true) => {
                        return Some(Detection::Found {
                            variant: catalogue.variant,
                            marker: (*marker).to_string(),
                            channel: ProbeChannel::Shell,
                        });
                    }
                    Ok(false) => debug!(marker, "absent (shell)"),
                    Err(err) => warn!(
                        marker,
                        code = %ErrorCode::DetectProbeFailed.code_string(),
                        error = %err,
                        "Shell probe failed; treating as absent"
                    ),
                }
            }
        }

        let identity = match session.exec(commands::SYSTEM_IDENTITY).await {
            Ok(output) if output.success() => output.stdout.to_lowercase(),
            Ok(output) => {
                warn!(status = output.status, "System identification command failed");
                return None;
            }
            Err(err) => {
                warn!(error = %err, "System identification unavailable");
                return None;
            }
        };

        self.catalogues.iter().find_map(|catalogue| {
            catalogue
                .signatures
                .iter()
                .find(|sig| identity.contains(&sig.to_lowercase()))
                .map(|sig| Detection::Found {
                    variant: catalogue.variant,
                    marker: (*sig).to_string(),
                    channel: ProbeChannel::Signature,
                })
        })
    }
}
