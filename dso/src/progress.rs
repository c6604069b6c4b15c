//! Terminal progress display fed from the event bus.

use std::time::Duration;

use dso_common::{DeviceEvent, EventBus};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub struct ProgressView {
    bar: ProgressBar,
    task: JoinHandle<()>,
}

impl ProgressView {
    /// Start rendering events from `bus`. Returns `None` in JSON mode.
    pub fn attach(bus: &EventBus, enabled: bool) -> Option<Self> {
        if !enabled {
            return None;
        }
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {prefix:.bold} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));

        let mut rx = bus.subscribe();
        let view = bar.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => match envelope.event {
                        DeviceEvent::Connected { descriptor } => {
                            view.set_message(format!(
                                "connected to {} ({})",
                                descriptor.id, descriptor.software_version
                            ));
                        }
                        DeviceEvent::StepChanged { step, .. } => {
                            view.set_prefix(step.to_string());
                        }
                        DeviceEvent::Progress {
                            percent, status, ..
                        } => {
                            view.set_position(u64::from(percent));
                            view.set_message(status);
                        }
                        DeviceEvent::Disconnected { .. } => {}
                    },
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Some(Self { bar, task })
    }

    pub fn finish(self) {
        self.task.abort();
        self.bar.finish_and_clear();
    }
}
