use core::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};

use crate::client::ReplicaClient;
use crate::environment::ReplicaHandle;

/// How long to wait for asynchronous replication before trusting fingerprints.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SettleStrategy {
    /// Sleep for a fixed window.
    Fixed { delay_ms: u64 },
    /// Poll every replica's fingerprint until two consecutive rounds are
    /// identical, or until `timeout_ms` has passed.
    ///
    /// A round where any replica fails to answer never counts as stable.
    Stable { interval_ms: u64, timeout_ms: u64 },
}

impl Default for SettleStrategy {
    fn default() -> Self {
        Self::Fixed { delay_ms: 2_000 }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleOutcome {
    #[serde(serialize_with = "crate::report::serialize_millis")]
    pub waited: Duration,
    pub polls: u32,
    /// `None` for a fixed delay, which never observes the replicas.
    pub stabilized: Option<bool>,
}

impl SettleStrategy {
    pub async fn settle(&self, client: &ReplicaClient, handles: &[ReplicaHandle]) -> SettleOutcome {
        let started = Instant::now();

        match *self {
            Self::Fixed { delay_ms } => {
                time::sleep(Duration::from_millis(delay_ms)).await;

                SettleOutcome {
                    waited: started.elapsed(),
                    polls: 0,
                    stabilized: None,
                }
            }
            Self::Stable {
                interval_ms,
                timeout_ms,
            } => {
                let interval = Duration::from_millis(interval_ms);
                let deadline = started + Duration::from_millis(timeout_ms);

                let mut previous = poll_hashes(client, handles).await;
                let mut polls = 1_u32;
                let mut stabilized = false;

                while Instant::now() < deadline {
                    time::sleep(interval.min(deadline.saturating_duration_since(Instant::now())))
                        .await;

                    let current = poll_hashes(client, handles).await;
                    polls = polls.saturating_add(1);

                    if previous.is_some() && current == previous {
                        stabilized = true;
                        break;
                    }

                    previous = current;
                }

                if !stabilized {
                    tracing::warn!(
                        timeout_ms,
                        polls,
                        "replica fingerprints did not stabilize before the settle timeout"
                    );
                }

                SettleOutcome {
                    waited: started.elapsed(),
                    polls,
                    stabilized: Some(stabilized),
                }
            }
        }
    }
}

/// One round of fingerprints in replica order, or `None` if any call failed.
async fn poll_hashes(client: &ReplicaClient, handles: &[ReplicaHandle]) -> Option<Vec<String>> {
    let results = join_all(handles.iter().map(|handle| client.state_hash(handle))).await;

    results
        .into_iter()
        .map(|result| {
            result
                .map_err(|err| tracing::debug!(%err, "settle poll failed"))
                .ok()
        })
        .collect()
}
