//! Runs one verification scenario end to end.
//!
//! Phases run strictly one after another. Every environment that was
//! acquired is released before [`Driver::run`] returns, whether the run
//! passed, failed, errored or was interrupted.

use core::fmt;
use core::future::Future;
use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::time::Instant;

use crate::client::ReplicaClient;
use crate::config::{Config, SnapshotPolicy, Workload};
use crate::environment::{Environment, EnvironmentConfig};
use crate::error::HarnessError;
use crate::fingerprint::{Checkpoint, Fingerprint, FingerprintCollector};
use crate::launcher::Launcher;
use crate::operation::{submit, Operation, OperationBatch, Submission};
use crate::output::{OutputWriter, Status};
use crate::probe::{wait_until_ready, ProbeSettings};
use crate::report::{
    Phase, PhaseRecord, ReadinessRecord, ReplicaRecord, Report, SettleRecord, VerificationRun,
};
use crate::sync::{endpoints, trigger_sync, EdgeSpec, SyncDirection, SyncTopology};
use crate::verifier::{
    pre_sync_warnings, verify_commutativity, verify_convergence, verify_idempotence,
    OrderingResult, Property, Verdict,
};

const MAIN_SCOPE: &str = "main";

/// Where a run puts its files.
///
/// Reports land in `<output>/<run-id>/`, replica logs in
/// `<output>/logs/<run-id>/` and snapshots in `<output>/snapshots/<run-id>/`.
/// Data directories live under `data_root` and are removed on release.
#[derive(Clone, Debug)]
pub struct RunLayout {
    run_id: String,
    output_dir: Utf8PathBuf,
    data_root: Utf8PathBuf,
}

impl RunLayout {
    pub fn new(run_id: String, output_dir: Utf8PathBuf, data_root: Utf8PathBuf) -> Self {
        Self {
            run_id,
            output_dir,
            data_root,
        }
    }

    /// A timestamp plus a random suffix, unique enough for parallel runs.
    pub fn generate_run_id() -> String {
        format!(
            "{}-{:06x}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            rand::random::<u32>() & 0x00ff_ffff
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn report_dir(&self) -> Utf8PathBuf {
        self.output_dir.join(&self.run_id)
    }

    pub fn logs_dir(&self, scope: &str) -> Utf8PathBuf {
        let logs = self.output_dir.join("logs").join(&self.run_id);

        if scope == MAIN_SCOPE {
            logs
        } else {
            logs.join(scope)
        }
    }

    pub fn snapshots_dir(&self) -> Utf8PathBuf {
        self.output_dir.join("snapshots").join(&self.run_id)
    }

    pub fn data_dir(&self, scope: &str) -> Utf8PathBuf {
        self.data_root
            .join(format!("convergence-{}-{scope}", self.run_id))
    }
}

/// An acquired environment and the last checkpoint captured in it.
#[derive(Debug)]
struct ActiveScope {
    name: String,
    environment: Environment,
    last_checkpoint: Option<String>,
    failed: bool,
}

impl ActiveScope {
    fn snapshot_label(&self) -> String {
        format!(
            "{}-{}",
            self.name,
            self.last_checkpoint.as_deref().unwrap_or("startup")
        )
    }
}

struct PhaseTimer {
    phase: Phase,
    label: String,
    scope: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl PhaseTimer {
    fn start(phase: Phase, label: impl Into<String>, scope: &str) -> Self {
        Self {
            phase,
            label: label.into(),
            scope: scope.to_owned(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn finish<T, E: fmt::Display>(self, run: &mut VerificationRun, result: &Result<T, E>) {
        let elapsed = self.started.elapsed();

        if let Err(err) = result {
            tracing::warn!(phase = ?self.phase, label = %self.label, scope = %self.scope, %err, "phase failed");
        } else {
            tracing::debug!(phase = ?self.phase, label = %self.label, scope = %self.scope, ?elapsed, "phase done");
        }

        run.phases.push(PhaseRecord {
            phase: self.phase,
            label: self.label,
            scope: self.scope,
            started_at: self.started_at,
            elapsed,
            error: result.as_ref().err().map(ToString::to_string),
        });
    }
}

pub struct Driver {
    config: Config,
    layout: RunLayout,
    launcher: Arc<dyn Launcher>,
    client: ReplicaClient,
    output: OutputWriter,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("layout", &self.layout)
            .field("client", &self.client)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl Driver {
    pub fn new(
        config: Config,
        layout: RunLayout,
        launcher: Arc<dyn Launcher>,
        client: ReplicaClient,
        output: OutputWriter,
    ) -> Self {
        Self {
            config,
            layout,
            launcher,
            client,
            output,
        }
    }

    pub const fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Runs the scenario until it finishes or `shutdown` resolves.
    ///
    /// Whatever happens, the active environment is released before the
    /// report is sealed.
    pub async fn run<F>(&self, shutdown: F) -> Report
    where
        F: Future<Output = ()>,
    {
        let mut run = VerificationRun::new(self.layout.run_id());
        let mut slot = None;

        for property in Property::ALL {
            if !self.config.properties.enabled(property) {
                run.record_verdict(property, Verdict::skipped("disabled"));
            }
        }

        self.output
            .write_header(&format!("Verification run {}", self.layout.run_id()), 1);

        let outcome = tokio::select! {
            result = self.execute(&mut run, &mut slot) => Some(result),
            () = shutdown => None,
        };

        let (error, interrupted) = match outcome {
            Some(Ok(())) => (None, false),
            Some(Err(err)) => {
                self.output.write_status(Status::Fail, &err.to_string());
                (Some(err), false)
            }
            None => {
                self.output
                    .write_status(Status::Warn, "interrupted, releasing replicas");
                (None, true)
            }
        };

        if let Some(scope) = slot.as_mut() {
            scope.failed |= error.is_some();
            self.close_scope(&mut run, &mut slot, !interrupted).await;
        }

        run.finalize(error.as_ref(), interrupted)
    }

    async fn execute(
        &self,
        run: &mut VerificationRun,
        slot: &mut Option<ActiveScope>,
    ) -> Result<(), HarnessError> {
        self.config.validate()?;

        self.run_main(run, slot).await?;
        self.close_scope(run, slot, true).await;

        if self.config.properties.commutativity {
            self.run_commutativity(run, slot).await?;
        }

        Ok(())
    }

    async fn run_main(
        &self,
        run: &mut VerificationRun,
        slot: &mut Option<ActiveScope>,
    ) -> Result<(), HarnessError> {
        let scenario = &self.config.scenario;
        let scope = self.bring_up(run, slot, MAIN_SCOPE).await?;

        self.output.write_header("Forward phase", 2);

        self.submit_workload(run, scope, &scenario.workload).await?;
        self.settle(run, scope, "submit").await;
        let _pre_sync = self.capture(run, scope, &Checkpoint::PRE_SYNC).await?;

        let mut received: BTreeMap<&str, Vec<&Operation>> = self
            .config
            .network
            .replicas
            .iter()
            .map(|replica| (replica.node_id.as_str(), Vec::new()))
            .collect();
        for workload in &scenario.workload {
            received
                .entry(workload.node_id.as_str())
                .or_default()
                .extend(workload.batch.changes.iter());
        }
        for warning in pre_sync_warnings(&run.fingerprints, Checkpoint::PRE_SYNC.label(), &received)
        {
            self.output.write_status(Status::Warn, &warning);
            run.warn(warning);
        }

        let forward = scenario
            .topology
            .edges(&scope.environment.node_ids())?;
        self.sync_all(run, scope, &forward, SyncDirection::Forward)
            .await?;
        self.settle(run, scope, "forward-sync").await;
        let _post_sync = self.capture(run, scope, &Checkpoint::POST_SYNC).await?;

        let mut checkpoints = Vec::new();
        if !scenario.forward_partial {
            checkpoints.push(Checkpoint::POST_SYNC);
        }

        if let Some(reverse) = &scenario.reverse {
            self.output.write_header("Reverse phase", 2);

            self.submit_workload(run, scope, &reverse.workload).await?;
            self.settle(run, scope, "reverse-submit").await;

            let edges = reverse.edges.clone().unwrap_or_else(|| {
                forward.iter().rev().map(EdgeSpec::reversed).collect()
            });
            self.sync_all(run, scope, &edges, SyncDirection::Reverse)
                .await?;
            self.settle(run, scope, "reverse-sync").await;
            let _post_reverse = self
                .capture(run, scope, &Checkpoint::POST_REVERSE_SYNC)
                .await?;

            checkpoints.push(Checkpoint::POST_REVERSE_SYNC);
        }

        if self.config.properties.convergence {
            let labels: Vec<&str> = checkpoints.iter().map(Checkpoint::label).collect();

            let timer = PhaseTimer::start(Phase::Verify, "convergence", MAIN_SCOPE);
            let verdict = verify_convergence(&run.fingerprints, &labels);
            timer.finish(run, &Ok::<_, HarnessError>(()));
            self.record(run, scope, Property::Convergence, verdict);
        }

        if self.config.properties.idempotence {
            self.output.write_header("Idempotence phase", 2);

            let edge = scenario
                .idempotence_edge
                .clone()
                .or_else(|| forward.first().cloned());

            let verdict = match edge {
                Some(edge) => self.repeat_sync(run, scope, &edge).await?,
                None => Verdict::skipped("no sync edge to repeat"),
            };
            self.record(run, scope, Property::Idempotence, verdict);
        }

        Ok(())
    }

    /// Captures, re-triggers `edge`, settles and captures again.
    async fn repeat_sync(
        &self,
        run: &mut VerificationRun,
        scope: &mut ActiveScope,
        edge: &EdgeSpec,
    ) -> Result<Verdict, HarnessError> {
        let before = self.capture(run, scope, &Checkpoint::REPEAT_SYNC).await?;

        self.sync_all(run, scope, core::slice::from_ref(edge), SyncDirection::Repeat)
            .await?;
        self.settle(run, scope, "repeat-sync").await;

        let after = self.capture(run, scope, &Checkpoint::REPEAT_SYNC).await?;

        let timer = PhaseTimer::start(Phase::Verify, "idempotence", &scope.name);
        let verdict = verify_idempotence(&before, &after);
        timer.finish(run, &Ok::<_, HarnessError>(()));

        Ok(verdict)
    }

    /// Applies the same operations in every configured ordering, each on a
    /// fresh environment, then compares the final fingerprints.
    async fn run_commutativity(
        &self,
        run: &mut VerificationRun,
        slot: &mut Option<ActiveScope>,
    ) -> Result<(), HarnessError> {
        let operations = self.config.commutativity_operations();
        let orderings = self.config.commutativity_orderings();
        let topology = self
            .config
            .commutativity
            .topology
            .clone()
            .unwrap_or_else(SyncTopology::pairwise);

        for (index, ordering) in orderings.iter().enumerate() {
            let name = format!("ordering-{index}");
            self.output
                .write_header(&format!("Commutativity {name} {ordering:?}"), 2);

            let scope = self.bring_up(run, slot, &name).await?;

            let workload = distribute(&operations, ordering, &scope.environment.node_ids(), &name);
            self.submit_workload(run, scope, &workload).await?;

            let edges = topology.edges(&scope.environment.node_ids())?;
            self.sync_all(run, scope, &edges, SyncDirection::Forward)
                .await?;
            self.settle(run, scope, "commutativity-sync").await;

            let fingerprints = self
                .capture(run, scope, &Checkpoint::commutativity(index))
                .await?;

            run.orderings.push(OrderingResult {
                ordering: ordering.clone(),
                fingerprints,
            });

            self.close_scope(run, slot, true).await;
        }

        let timer = PhaseTimer::start(Phase::Verify, "commutativity", "commutativity");
        let verdict = verify_commutativity(&run.orderings);
        timer.finish(run, &Ok::<_, HarnessError>(()));

        self.output
            .write_status(Status::from(&verdict), &format!("commutativity: {verdict}"));
        run.record_verdict(Property::Commutativity, verdict);

        Ok(())
    }

    /// Acquires a fresh environment, launches every replica and waits until
    /// all of them are ready.
    async fn bring_up<'s>(
        &self,
        run: &mut VerificationRun,
        slot: &'s mut Option<ActiveScope>,
        name: &str,
    ) -> Result<&'s mut ActiveScope, HarnessError> {
        let network = &self.config.network;

        let config = EnvironmentConfig {
            host: network.host.clone(),
            base_port: network.base_port,
            data_dir: self.layout.data_dir(name),
            logs_dir: self.layout.logs_dir(name),
            shutdown_grace: self.config.timeouts.shutdown_grace(),
        };

        let timer = PhaseTimer::start(Phase::Acquire, name, name);
        let acquired =
            Environment::acquire(config, &network.replicas, Arc::clone(&self.launcher)).await;
        timer.finish(run, &acquired);

        let scope = slot.insert(ActiveScope {
            name: name.to_owned(),
            environment: acquired?,
            last_checkpoint: None,
            failed: false,
        });

        let timer = PhaseTimer::start(Phase::Launch, "replicas", name);
        let launched = scope.environment.launch_all().await;
        timer.finish(run, &launched);
        launched?;

        for handle in scope.environment.handles() {
            self.output.write_status(
                Status::Ok,
                &format!(
                    "launched {} on port {} (log: {})",
                    handle.node_id(),
                    handle.port(),
                    handle.log_file()
                ),
            );
        }

        let timeouts = &self.config.timeouts;
        let settings = ProbeSettings {
            timeout: timeouts.readiness(),
            poll_interval: timeouts.poll_interval(),
            attempt_timeout: timeouts.probe_attempt(),
        };

        let timer = PhaseTimer::start(Phase::Readiness, "replicas", name);
        let client = &self.client;
        let results = join_all(
            scope
                .environment
                .handles_mut()
                .iter_mut()
                .map(|handle| wait_until_ready(client, handle, settings)),
        )
        .await;

        let mut first_error = None;
        for (handle, result) in scope.environment.handles().iter().zip(results) {
            let readiness = match result {
                Ok(readiness) => readiness,
                Err(err) => {
                    let _ignored = first_error.get_or_insert(HarnessError::from(err));
                    continue;
                }
            };

            if readiness.is_ready() {
                self.output.write_status(
                    Status::Ok,
                    &format!(
                        "{} ready after {} ms",
                        handle.node_id(),
                        readiness.elapsed().as_millis()
                    ),
                );
            }

            run.readiness.push(ReadinessRecord {
                node_id: handle.node_id().to_owned(),
                scope: name.to_owned(),
                readiness: readiness.clone(),
            });

            if let Some(err) = readiness.into_error(handle.node_id(), settings.timeout) {
                let _ignored = first_error.get_or_insert(err);
            }
        }

        let ready = first_error.map_or(Ok(()), Err);
        timer.finish(run, &ready);
        ready?;

        Ok(scope)
    }

    async fn submit_workload(
        &self,
        run: &mut VerificationRun,
        scope: &ActiveScope,
        workload: &[Workload],
    ) -> Result<(), HarnessError> {
        for entry in workload {
            if entry.batch.is_empty() {
                continue;
            }

            let timer = PhaseTimer::start(
                Phase::Submit,
                format!("{} -> {}", entry.batch.name, entry.node_id),
                &scope.name,
            );

            let submitted = match scope.environment.handle(&entry.node_id) {
                Some(handle) => submit(&self.client, handle, &entry.batch)
                    .await
                    .map_err(HarnessError::from),
                None => Err(HarnessError::UnknownReplica(entry.node_id.clone())),
            };

            let report = match submitted {
                Ok(report) => report,
                Err(err) => {
                    timer.finish(run, &Err::<(), _>(&err));
                    return Err(err);
                }
            };

            let accepted = match &report.submission {
                Submission::Accepted { .. } => Ok(()),
                Submission::Rejected { reason } => Err(HarnessError::Rejected {
                    node: entry.node_id.clone(),
                    batch: entry.batch.name.clone(),
                    reason: reason.clone(),
                }),
            };
            timer.finish(run, &accepted);

            self.output.write_status(
                if accepted.is_ok() {
                    Status::Ok
                } else {
                    Status::Fail
                },
                &format!(
                    "submitted {} ({} operations) to {} in {} ms",
                    entry.batch.name,
                    entry.batch.changes.len(),
                    entry.node_id,
                    report.latency.as_millis()
                ),
            );
            run.submissions.push(report);

            accepted?;
        }

        Ok(())
    }

    /// Triggers every edge in order. Stops at the first edge that failed.
    async fn sync_all(
        &self,
        run: &mut VerificationRun,
        scope: &ActiveScope,
        edges: &[EdgeSpec],
        direction: SyncDirection,
    ) -> Result<(), HarnessError> {
        for edge in edges {
            let timer = PhaseTimer::start(Phase::Sync, format!("{edge} ({direction})"), &scope.name);

            let (source, target) = match endpoints(scope.environment.handles(), edge) {
                Ok(ends) => ends,
                Err(err) => {
                    timer.finish(run, &Err::<(), _>(&err));
                    return Err(err);
                }
            };

            let synced = trigger_sync(&self.client, source, target, direction).await;
            let result = synced.error().map_or(Ok(()), |err| Err(err.clone()));
            timer.finish(run, &result);

            self.output.write_status(
                if result.is_ok() {
                    Status::Ok
                } else {
                    Status::Fail
                },
                &format!("sync {synced} in {} ms", synced.latency.as_millis()),
            );
            run.sync_edges.push(synced);

            result?;
        }

        Ok(())
    }

    async fn settle(&self, run: &mut VerificationRun, scope: &ActiveScope, after: &str) {
        let timer = PhaseTimer::start(Phase::Settle, after, &scope.name);
        let outcome = self
            .config
            .settle
            .settle(&self.client, scope.environment.handles())
            .await;
        timer.finish(run, &Ok::<_, HarnessError>(()));

        if outcome.stabilized == Some(false) {
            let warning = format!(
                "fingerprints in {} were still changing {} ms after {after}",
                scope.name,
                outcome.waited.as_millis()
            );
            self.output.write_status(Status::Warn, &warning);
            run.warn(warning);
        }

        run.settles.push(SettleRecord {
            after: after.to_owned(),
            scope: scope.name.clone(),
            outcome,
        });
    }

    async fn capture(
        &self,
        run: &mut VerificationRun,
        scope: &mut ActiveScope,
        checkpoint: &Checkpoint,
    ) -> Result<Vec<Fingerprint>, HarnessError> {
        let timer = PhaseTimer::start(Phase::Capture, checkpoint.label(), &scope.name);
        let captured = FingerprintCollector::new(&self.client)
            .capture_all(scope.environment.handles(), checkpoint, &mut run.fingerprints)
            .await;
        timer.finish(run, &captured);
        let fingerprints = captured?;

        for fingerprint in &fingerprints {
            self.output.write_str(&format!(
                "{}@{}: {}",
                fingerprint.node_id, fingerprint.checkpoint, fingerprint.hash
            ));
        }
        scope.last_checkpoint = Some(checkpoint.label().to_owned());

        Ok(fingerprints)
    }

    fn record(
        &self,
        run: &mut VerificationRun,
        scope: &mut ActiveScope,
        property: Property,
        verdict: Verdict,
    ) {
        self.output
            .write_status(Status::from(&verdict), &format!("{property}: {verdict}"));

        if verdict.is_fail() {
            scope.failed = true;
        }

        run.record_verdict(property, verdict);
    }

    /// Snapshots the replicas if the policy asks for it, then releases the
    /// environment in `slot`.
    async fn close_scope(
        &self,
        run: &mut VerificationRun,
        slot: &mut Option<ActiveScope>,
        allow_snapshots: bool,
    ) {
        let Some(mut scope) = slot.take() else {
            return;
        };

        let wanted = match self.config.snapshots {
            SnapshotPolicy::Never => false,
            SnapshotPolicy::OnFailure => scope.failed,
            SnapshotPolicy::Always => true,
        };

        if allow_snapshots && wanted {
            self.snapshot(run, &scope).await;
        }

        for handle in scope.environment.handles() {
            run.replicas.push(ReplicaRecord::new(handle, &scope.name));
        }

        let timer = PhaseTimer::start(Phase::Release, "replicas", &scope.name);
        let released = scope.environment.release().await;
        let result = if released.is_clean() {
            Ok(())
        } else {
            Err(released.errors.join("; "))
        };
        timer.finish(run, &result);

        if let Err(errors) = result {
            run.warn(format!("release of {} was not clean: {errors}", scope.name));
        }

        self.output.write_status(
            if released.is_clean() {
                Status::Ok
            } else {
                Status::Warn
            },
            &format!(
                "released {} ({} replicas stopped, removed {})",
                scope.name,
                released.terminated.len(),
                released
                    .removed
                    .iter()
                    .map(|path| path.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );

        run.releases.push(released);
    }

    async fn snapshot(&self, run: &mut VerificationRun, scope: &ActiveScope) {
        let label = scope.snapshot_label();
        let dir = self.layout.snapshots_dir();

        let timer = PhaseTimer::start(Phase::Snapshot, label.as_str(), &scope.name);
        let results = FingerprintCollector::new(&self.client)
            .snapshot_all(scope.environment.handles(), &label, &dir)
            .await;

        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(snapshot) => run.snapshots.push(snapshot),
                Err(err) => errors.push(err),
            }
        }

        let result = if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        };
        timer.finish(run, &result);

        if let Err(errors) = result {
            run.warn(format!("snapshots of {} incomplete: {errors}", scope.name));
        }
    }
}

/// Deals the ordered operations round-robin over `nodes`: the operation at
/// position `k` goes to replica `k % nodes.len()`.
fn distribute(
    operations: &[Operation],
    ordering: &[usize],
    nodes: &[&str],
    name: &str,
) -> Vec<Workload> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let mut batches: Vec<Vec<Operation>> = vec![Vec::new(); nodes.len()];

    for (position, index) in ordering.iter().enumerate() {
        if let Some(operation) = operations.get(*index) {
            batches[position % nodes.len()].push(operation.clone());
        }
    }

    nodes
        .iter()
        .zip(batches)
        .map(|(node, changes)| Workload::new(*node, OperationBatch::new(name, changes)))
        .collect()
}

/// The default data root when none is configured.
pub fn default_data_root() -> Result<Utf8PathBuf, HarnessError> {
    Utf8PathBuf::from_path_buf(std::env::temp_dir()).map_err(|path| {
        HarnessError::InvalidScenario(format!(
            "temporary directory {} is not valid UTF-8; set replica.dataRoot",
            path.display()
        ))
    })
}
