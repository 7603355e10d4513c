use core::fmt::Write;
use core::time::Duration;
use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use eyre::Result as EyreResult;
use serde::{Serialize, Serializer};
use tokio::fs::{create_dir_all, write};

use crate::environment::{ReleaseReport, ReplicaHandle, ReplicaState};
use crate::error::HarnessError;
use crate::fingerprint::{FingerprintLog, Snapshot};
use crate::operation::{SubmitReport, Submission};
use crate::probe::Readiness;
use crate::settle::SettleOutcome;
use crate::sync::{SyncEdge, SyncOutcome};
use crate::verifier::{OrderingResult, Property, Verdict};

pub(crate) fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Acquire,
    Launch,
    Readiness,
    Submit,
    Settle,
    Capture,
    Sync,
    Verify,
    Snapshot,
    Release,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub phase: Phase,
    /// What the phase acted on, e.g. a checkpoint label or a sync direction.
    pub label: String,
    /// The isolated environment the phase ran in.
    pub scope: String,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRecord {
    pub node_id: String,
    pub scope: String,
    pub port: u16,
    pub data_dir: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub state: ReplicaState,
}

impl ReplicaRecord {
    pub fn new(handle: &ReplicaHandle, scope: &str) -> Self {
        Self {
            node_id: handle.node_id().to_owned(),
            scope: scope.to_owned(),
            port: handle.port(),
            data_dir: handle.data_dir().to_owned(),
            log_file: handle.log_file().to_owned(),
            state: handle.state(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessRecord {
    pub node_id: String,
    pub scope: String,
    pub readiness: Readiness,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRecord {
    pub after: String,
    pub scope: String,
    pub outcome: SettleOutcome,
}

/// Everything observed during one run. Finalized exactly once into a
/// [`Report`], after which it can only be read.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub replicas: Vec<ReplicaRecord>,
    pub phases: Vec<PhaseRecord>,
    pub readiness: Vec<ReadinessRecord>,
    pub submissions: Vec<SubmitReport>,
    pub sync_edges: Vec<SyncEdge>,
    pub settles: Vec<SettleRecord>,
    pub fingerprints: FingerprintLog,
    pub orderings: Vec<OrderingResult>,
    pub warnings: Vec<String>,
    pub verdicts: BTreeMap<Property, Verdict>,
    pub snapshots: Vec<Snapshot>,
    pub releases: Vec<ReleaseReport>,
}

impl VerificationRun {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            replicas: Vec::new(),
            phases: Vec::new(),
            readiness: Vec::new(),
            submissions: Vec::new(),
            sync_edges: Vec::new(),
            settles: Vec::new(),
            fingerprints: FingerprintLog::default(),
            orderings: Vec::new(),
            warnings: Vec::new(),
            verdicts: BTreeMap::new(),
            snapshots: Vec::new(),
            releases: Vec::new(),
        }
    }

    pub fn record_verdict(&mut self, property: Property, verdict: Verdict) {
        drop(self.verdicts.insert(property, verdict));
    }

    pub fn warn(&mut self, warning: String) {
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Seals the run. Properties that never got a verdict are marked skipped.
    pub fn finalize(mut self, error: Option<&HarnessError>, interrupted: bool) -> Report {
        let reason = if interrupted {
            "not reached: run was interrupted"
        } else {
            "not reached: run aborted"
        };

        for property in Property::ALL {
            let _verdict = self
                .verdicts
                .entry(property)
                .or_insert_with(|| Verdict::skipped(reason));
        }

        let status = if interrupted {
            RunStatus::Interrupted
        } else if self.verdicts.values().any(Verdict::is_fail) {
            RunStatus::Fail
        } else if error.is_some() {
            RunStatus::Error
        } else {
            RunStatus::Pass
        };

        Report {
            run: self,
            status,
            finished_at: Utc::now(),
            error: error.map(ToString::to_string),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pass,
    /// At least one property was checked and failed.
    Fail,
    /// The run aborted before every enabled property could be checked.
    Error,
    Interrupted,
}

impl RunStatus {
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Error => 2,
            Self::Interrupted => 130,
        }
    }

    const fn emoji(self) -> &'static str {
        match self {
            Self::Pass => ":white_check_mark:",
            Self::Fail => ":x:",
            Self::Error => ":bug:",
            Self::Interrupted => ":stop_sign:",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(flatten)]
    run: VerificationRun,
    status: RunStatus,
    finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ReportFiles {
    pub json: Utf8PathBuf,
    pub markdown: Utf8PathBuf,
}

impl Report {
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    pub const fn run(&self) -> &VerificationRun {
        &self.run
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn verdict(&self, property: Property) -> Option<&Verdict> {
        self.run.verdicts.get(&property)
    }

    pub async fn store_to_dir(&self, dir: &Utf8Path) -> EyreResult<ReportFiles> {
        create_dir_all(dir).await?;

        let json = dir.join("report.json");
        write(&json, serde_json::to_vec_pretty(self)?).await?;

        let markdown = dir.join("report.md");
        write(&markdown, self.to_markdown()?).await?;

        Ok(ReportFiles { json, markdown })
    }

    pub fn to_markdown(&self) -> EyreResult<String> {
        let mut markdown = String::new();
        let run = &self.run;

        writeln!(&mut markdown, "## Convergence report")?;
        writeln!(&mut markdown)?;
        writeln!(&mut markdown, "- Run: `{}`", run.run_id)?;
        writeln!(
            &mut markdown,
            "- Status: {} {:?}",
            self.status.emoji(),
            self.status
        )?;
        writeln!(
            &mut markdown,
            "- Duration: {} ms",
            (self.finished_at - run.started_at).num_milliseconds()
        )?;
        if let Some(error) = &self.error {
            writeln!(&mut markdown, "- Error: {error}")?;
        }
        writeln!(&mut markdown)?;

        writeln!(&mut markdown, "### Verdicts")?;
        writeln!(&mut markdown, "| Property | Result | Detail |")?;
        writeln!(&mut markdown, "| :--- | :---: | :--- |")?;
        for (property, verdict) in &run.verdicts {
            let (icon, detail) = match verdict {
                Verdict::Pass => (":white_check_mark:", String::new()),
                Verdict::Fail(evidence) => (":x:", evidence.summary.clone()),
                Verdict::Skipped { reason } => (":fast_forward:", reason.clone()),
            };
            writeln!(&mut markdown, "| {property} | {icon} | {detail} |")?;
        }
        writeln!(&mut markdown)?;

        for (property, verdict) in &run.verdicts {
            let Some(evidence) = verdict.evidence() else {
                continue;
            };

            writeln!(&mut markdown, "#### {property} mismatches")?;
            for mismatch in &evidence.mismatches {
                writeln!(&mut markdown, "- `{mismatch}`")?;
            }
            writeln!(&mut markdown)?;
        }

        if !run.warnings.is_empty() {
            writeln!(&mut markdown, "### Warnings")?;
            for warning in &run.warnings {
                writeln!(&mut markdown, "- {warning}")?;
            }
            writeln!(&mut markdown)?;
        }

        writeln!(&mut markdown, "### Phases")?;
        writeln!(&mut markdown, "| Scope | Phase | Label | Elapsed (ms) | Result |")?;
        writeln!(&mut markdown, "| :--- | :--- | :--- | ---: | :---: |")?;
        for record in &run.phases {
            writeln!(
                &mut markdown,
                "| {} | {:?} | {} | {} | {} |",
                record.scope,
                record.phase,
                record.label,
                record.elapsed.as_millis(),
                record.error.as_ref().map_or(":white_check_mark:", |_| ":x:"),
            )?;
        }
        writeln!(&mut markdown)?;

        if !run.submissions.is_empty() {
            writeln!(&mut markdown, "### Submissions")?;
            writeln!(&mut markdown, "| Replica | Batch | Outcome | Latency (ms) |")?;
            writeln!(&mut markdown, "| :--- | :--- | :--- | ---: |")?;
            for submit in &run.submissions {
                let outcome = match &submit.submission {
                    Submission::Accepted { .. } => "accepted".to_owned(),
                    Submission::Rejected { reason } => format!("rejected: {reason}"),
                };
                writeln!(
                    &mut markdown,
                    "| {} | {} | {outcome} | {} |",
                    submit.node_id,
                    submit.batch,
                    submit.latency.as_millis()
                )?;
            }
            writeln!(&mut markdown)?;
        }

        if !run.sync_edges.is_empty() {
            writeln!(&mut markdown, "### Sync edges")?;
            writeln!(&mut markdown, "| Edge | Direction | Latency (ms) | Result |")?;
            writeln!(&mut markdown, "| :--- | :--- | ---: | :--- |")?;
            for edge in &run.sync_edges {
                let result = match &edge.outcome {
                    SyncOutcome::Acknowledged { .. } => "acknowledged".to_owned(),
                    SyncOutcome::Failed { error } => format!("failed: {error}"),
                };
                writeln!(
                    &mut markdown,
                    "| {} -> {} | {} | {} | {result} |",
                    edge.source,
                    edge.target,
                    edge.direction,
                    edge.latency.as_millis()
                )?;
            }
            writeln!(&mut markdown)?;
        }

        if !run.fingerprints.entries().is_empty() {
            writeln!(&mut markdown, "### Fingerprints")?;
            writeln!(&mut markdown, "| Checkpoint | Replica | Sequence | Hash |")?;
            writeln!(&mut markdown, "| :--- | :--- | ---: | :--- |")?;
            for fingerprint in run.fingerprints.entries() {
                writeln!(
                    &mut markdown,
                    "| {} | {} | {} | `{}` |",
                    fingerprint.checkpoint,
                    fingerprint.node_id,
                    fingerprint.sequence,
                    fingerprint.hash
                )?;
            }
            writeln!(&mut markdown)?;
        }

        if !run.snapshots.is_empty() {
            writeln!(&mut markdown, "### Snapshots")?;
            for snapshot in &run.snapshots {
                writeln!(
                    &mut markdown,
                    "- {} at {}: `{}`",
                    snapshot.node_id, snapshot.checkpoint, snapshot.path
                )?;
            }
            writeln!(&mut markdown)?;
        }

        Ok(markdown)
    }
}
