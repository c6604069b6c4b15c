//! Event broadcast for session and orchestration notifications.
//!
//! Front ends subscribe to an [`EventBus`] and receive typed
//! [`EventEnvelope`]s: connect/disconnect notifications carrying the device
//! descriptor, step transitions, and transfer progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::types::{DeviceDescriptor, DeviceId, MutationStep};

const DEFAULT_BUFFER: usize = 256;

/// A notification emitted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    Connected {
        descriptor: DeviceDescriptor,
    },
    Disconnected {
        descriptor: DeviceDescriptor,
    },
    StepChanged {
        device_id: DeviceId,
        step: MutationStep,
    },
    Progress {
        device_id: DeviceId,
        percent: u8,
        status: String,
    },
}

/// Timestamped event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DeviceEvent,
}

impl EventEnvelope {
    /// Serialize as a single JSON line.
    pub fn to_json_line(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(line) => Some(line),
            Err(err) => {
                warn!("Failed to serialize event: {}", err);
                None
            }
        }
    }
}

/// Broadcast channel for device events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// The effective buffer is clamped to at least `DEFAULT_BUFFER` so bursty
    /// progress streams do not lag slow subscribers.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: DeviceEvent) {
        trace!(?event, "emit");
        let _ = self.sender.send(EventEnvelope {
            timestamp: Utc::now(),
            event,
        });
    }
}

/// Progress emitter for one orchestration run.
///
/// Percent values are clamped to 100 and never go backwards, even when
/// concurrent transfers report out of order.
pub struct ProgressReporter {
    bus: Option<EventBus>,
    device_id: DeviceId,
    last: AtomicU8,
}

impl ProgressReporter {
    pub fn new(bus: Option<EventBus>, device_id: DeviceId) -> Self {
        Self {
            bus,
            device_id,
            last: AtomicU8::new(0),
        }
    }

    /// Report progress; returns the percent actually emitted.
    pub fn report(&self, percent: u8, status: impl Into<String>) -> u8 {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        let effective = previous.max(percent);
        if let Some(bus) = &self.bus {
            bus.emit(DeviceEvent::Progress {
                device_id: self.device_id.clone(),
                percent: effective,
                status: status.into(),
            });
        }
        effective
    }

    pub fn last(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Percent of `done` out of `total`, rounded down. Zero total counts as done.
pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}
