//! Connect retries.
//!
//! A device that was just plugged in or rebooted often refuses the first
//! lockdown handshake. [`connect_with_retry`] keeps dialing until the device
//! answers, reports a failure that another dial cannot fix (wrong pairing,
//! unknown device), or the configured number of attempts is used up.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Errors that may clear up if the device is dialed again.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

/// How often and how patiently to dial a device.
///
/// Built from `session.connect_attempts` and `session.retry_delay_ms`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Dials including the first one; zero is treated as one.
    pub max_attempts: u32,
    /// Pause after the first refused dial.
    pub delay: Duration,
    /// Growth of the pause per further refusal. 1.0 keeps it fixed.
    pub backoff: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1500),
            backoff: 1.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..Self::default()
        }
    }

    /// Pause before redialing after dial number `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let refusals = attempt.max(1) - 1;
        let growth = self.backoff.max(1.0).powi(refusals as i32);
        let secs = (self.delay.as_secs_f64() * growth)
            .min(self.max_delay.as_secs_f64())
            .max(0.0);
        Duration::from_secs_f64(secs)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Dial `device` until `dial` succeeds or the policy gives up.
///
/// `dial` receives the 1-based attempt number so the transport can log it.
pub async fn connect_with_retry<F, Fut, T, E>(
    device: &str,
    policy: &RetryPolicy,
    mut dial: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        debug!(device, attempt, max_attempts, "Dialing device");

        let err = match dial(attempt).await {
            Ok(session) => {
                if attempt > 1 {
                    info!(device, attempt, "Device answered after redial");
                }
                return Ok(session);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            warn!(device, attempt, error = %err, "Connect refused, not redialing");
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(device, attempt, error = %err, "Connect attempts exhausted");
            return Err(err);
        }

        let delay = policy.delay_after(attempt);
        warn!(
            device,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Device did not answer, redialing"
        );
        sleep(delay).await;
        attempt += 1;
    }
}
