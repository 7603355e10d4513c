use core::time::Duration;

use serde::Serialize;
use tokio::time::{self, Instant};

use crate::client::ReplicaClient;
use crate::environment::ReplicaHandle;
use crate::error::{EnvironmentError, HarnessError};

#[derive(Clone, Copy, Debug)]
pub struct ProbeSettings {
    /// Upper bound on the whole wait.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Upper bound on a single health request.
    pub attempt_timeout: Duration,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Readiness {
    Ready {
        attempts: u32,
        #[serde(serialize_with = "crate::report::serialize_millis")]
        elapsed: Duration,
    },
    TimedOut {
        attempts: u32,
        #[serde(serialize_with = "crate::report::serialize_millis")]
        elapsed: Duration,
        last_error: Option<String>,
    },
    /// The process ended before it ever answered.
    Exited {
        code: Option<i32>,
        #[serde(serialize_with = "crate::report::serialize_millis")]
        elapsed: Duration,
    },
}

impl Readiness {
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub const fn elapsed(&self) -> Duration {
        match self {
            Self::Ready { elapsed, .. }
            | Self::TimedOut { elapsed, .. }
            | Self::Exited { elapsed, .. } => *elapsed,
        }
    }

    /// The error that aborts the run, if this replica never became ready.
    pub fn into_error(self, node: &str, timeout: Duration) -> Option<HarnessError> {
        match self {
            Self::Ready { .. } => None,
            Self::TimedOut {
                attempts,
                last_error,
                ..
            } => Some(HarnessError::ReadinessTimeout {
                node: node.to_owned(),
                timeout,
                attempts,
                last_error,
            }),
            Self::Exited { code, .. } => Some(HarnessError::ReplicaExited {
                node: node.to_owned(),
                code,
            }),
        }
    }
}

/// Polls the replica's health endpoint until it answers positively, its
/// process exits, or `settings.timeout` has elapsed.
///
/// Moves the handle to `Ready` or `Failed` accordingly.
pub async fn wait_until_ready(
    client: &ReplicaClient,
    handle: &mut ReplicaHandle,
    settings: ProbeSettings,
) -> Result<Readiness, EnvironmentError> {
    let started = Instant::now();
    let deadline = started + settings.timeout;

    let mut attempts = 0_u32;
    let mut last_error = None;

    loop {
        if let Some(exit) = handle.exited() {
            tracing::warn!(node = handle.node_id(), code = ?exit.code, "replica exited during startup");
            handle.mark_failed()?;

            return Ok(Readiness::Exited {
                code: exit.code,
                elapsed: started.elapsed(),
            });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::warn!(node = handle.node_id(), attempts, "replica not ready in time");
            handle.mark_failed()?;

            return Ok(Readiness::TimedOut {
                attempts,
                elapsed: started.elapsed(),
                last_error,
            });
        }

        attempts = attempts.saturating_add(1);

        match client
            .health(handle, settings.attempt_timeout.min(remaining))
            .await
        {
            Ok(()) => {
                handle.mark_ready()?;

                let elapsed = started.elapsed();
                tracing::info!(node = handle.node_id(), attempts, ?elapsed, "replica ready");

                return Ok(Readiness::Ready { attempts, elapsed });
            }
            Err(err) => {
                tracing::debug!(node = handle.node_id(), attempts, %err, "replica not ready yet");
                last_error = Some(err.kind.to_string());
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        time::sleep(settings.poll_interval.min(remaining)).await;
    }
}
