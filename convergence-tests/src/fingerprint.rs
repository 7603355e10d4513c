use std::borrow::Cow;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{create_dir_all, write};

use crate::client::ReplicaClient;
use crate::environment::ReplicaHandle;
use crate::error::HarnessError;

/// A named point in the run at which fingerprints are captured.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Checkpoint {
    label: Cow<'static, str>,
    repeatable: bool,
}

impl Checkpoint {
    pub const PRE_SYNC: Self = Self::once("pre-sync");
    pub const POST_SYNC: Self = Self::once("post-sync");
    pub const POST_REVERSE_SYNC: Self = Self::once("post-reverse-sync");
    /// Captured before and after re-triggering a sync edge.
    pub const REPEAT_SYNC: Self = Self {
        label: Cow::Borrowed("repeat-sync"),
        repeatable: true,
    };

    const fn once(label: &'static str) -> Self {
        Self {
            label: Cow::Borrowed(label),
            repeatable: false,
        }
    }

    pub fn commutativity(ordering: usize) -> Self {
        Self {
            label: Cow::Owned(format!("commutativity-{ordering}")),
            repeatable: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub const fn is_repeatable(&self) -> bool {
        self.repeatable
    }
}

/// A replica's state hash at one checkpoint.
///
/// Equality looks at the hash alone; everything else is diagnostic.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub node_id: String,
    pub hash: String,
    pub checkpoint: String,
    /// Position among captures of a repeatable checkpoint, 0 otherwise.
    pub sequence: u32,
    pub captured_at: DateTime<Utc>,
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Fingerprint {}

/// Every fingerprint captured during a run, in capture order.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct FingerprintLog {
    entries: Vec<Fingerprint>,
}

impl FingerprintLog {
    #[cfg(test)]
    pub(crate) const fn from_entries(entries: Vec<Fingerprint>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Fingerprint] {
        &self.entries
    }

    pub fn at<'a>(
        &'a self,
        label: &'a str,
    ) -> impl Iterator<Item = &'a Fingerprint> + Clone + 'a {
        self.entries
            .iter()
            .filter(move |fingerprint| fingerprint.checkpoint == label)
    }

    pub fn get(&self, node_id: &str, label: &str, sequence: u32) -> Option<&Fingerprint> {
        self.entries.iter().find(|fingerprint| {
            fingerprint.node_id == node_id
                && fingerprint.checkpoint == label
                && fingerprint.sequence == sequence
        })
    }

    /// The sequence number the next capture of `checkpoint` on `node_id`
    /// would get, or an error if the checkpoint only allows one.
    fn next_sequence(&self, node_id: &str, checkpoint: &Checkpoint) -> Result<u32, HarnessError> {
        let taken = self
            .entries
            .iter()
            .filter(|fingerprint| {
                fingerprint.node_id == node_id && fingerprint.checkpoint == checkpoint.label()
            })
            .count();

        if taken > 0 && !checkpoint.is_repeatable() {
            return Err(HarnessError::DuplicateCheckpoint {
                node: node_id.to_owned(),
                label: checkpoint.label().to_owned(),
            });
        }

        Ok(u32::try_from(taken).unwrap_or(u32::MAX))
    }
}

/// Reads fingerprints and state snapshots. Never mutates a replica.
#[derive(Clone, Copy, Debug)]
pub struct FingerprintCollector<'a> {
    client: &'a ReplicaClient,
}

impl<'a> FingerprintCollector<'a> {
    pub const fn new(client: &'a ReplicaClient) -> Self {
        Self { client }
    }

    pub async fn capture(
        &self,
        handle: &ReplicaHandle,
        checkpoint: &Checkpoint,
        log: &mut FingerprintLog,
    ) -> Result<Fingerprint, HarnessError> {
        let sequence = log.next_sequence(handle.node_id(), checkpoint)?;

        let hash = self.client.state_hash(handle).await?;

        let fingerprint = Fingerprint {
            node_id: handle.node_id().to_owned(),
            hash,
            checkpoint: checkpoint.label().to_owned(),
            sequence,
            captured_at: Utc::now(),
        };

        tracing::debug!(
            node = %fingerprint.node_id,
            checkpoint = %fingerprint.checkpoint,
            hash = %fingerprint.hash,
            "captured fingerprint"
        );

        log.entries.push(fingerprint.clone());

        Ok(fingerprint)
    }

    /// Captures every replica in order, stopping at the first failure.
    pub async fn capture_all(
        &self,
        handles: &[ReplicaHandle],
        checkpoint: &Checkpoint,
        log: &mut FingerprintLog,
    ) -> Result<Vec<Fingerprint>, HarnessError> {
        let mut captured = Vec::with_capacity(handles.len());

        for handle in handles {
            captured.push(self.capture(handle, checkpoint, log).await?);
        }

        Ok(captured)
    }

    /// Writes `GET /state` of every replica to `<dir>/<node>-<label>.json`.
    ///
    /// Snapshots are diagnostics, so one replica failing does not stop the rest.
    pub async fn snapshot_all(
        &self,
        handles: &[ReplicaHandle],
        label: &str,
        dir: &Utf8Path,
    ) -> Vec<Result<Snapshot, String>> {
        if let Err(err) = create_dir_all(dir).await {
            return vec![Err(format!("failed to create {dir}: {err}"))];
        }

        let mut snapshots = Vec::with_capacity(handles.len());

        for handle in handles {
            snapshots.push(self.snapshot(handle, label, dir).await);
        }

        snapshots
    }

    async fn snapshot(
        &self,
        handle: &ReplicaHandle,
        label: &str,
        dir: &Utf8Path,
    ) -> Result<Snapshot, String> {
        let state = self
            .client
            .state(handle)
            .await
            .map_err(|err| err.to_string())?;

        let path = dir.join(format!("{}-{label}.json", handle.node_id()));

        let contents = serde_json::to_vec_pretty(&state).map_err(|err| err.to_string())?;
        write(&path, contents)
            .await
            .map_err(|err| format!("failed to write {path}: {err}"))?;

        Ok(Snapshot {
            node_id: handle.node_id().to_owned(),
            checkpoint: label.to_owned(),
            path,
        })
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub node_id: String,
    pub checkpoint: String,
    pub path: Utf8PathBuf,
}
