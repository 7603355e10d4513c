use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};
use serde_json::from_slice;
use tokio::fs::read;

use crate::error::HarnessError;
use crate::operation::{Operation, OperationBatch};
use crate::settle::SettleStrategy;
use crate::sync::{EdgeSpec, SyncTopology};
use crate::verifier::Property;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub network: Network,
    pub replica: ReplicaCommandConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub settle: SettleStrategy,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub scenario: Scenario,
    #[serde(default)]
    pub commutativity: Commutativity,
    #[serde(default)]
    pub snapshots: SnapshotPolicy,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default = "default_host")]
    pub host: String,
    /// Replicas without an explicit port get `base_port + index`, or an
    /// ephemeral port when this is unset.
    #[serde(default)]
    pub base_port: Option<u16>,
    pub replicas: Vec<ReplicaSpec>,
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    pub node_id: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// How to start one replica. `args` and `env` values may reference
/// `${port}`, `${nodeId}`, `${dataDir}`, `${host}` and `${logFile}`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaCommandConfig {
    pub binary: Utf8PathBuf,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Parent of every run's data directories. Defaults to the system
    /// temporary directory.
    #[serde(default)]
    pub data_root: Option<Utf8PathBuf>,
}

fn default_args() -> Vec<String> {
    [
        "--port",
        "${port}",
        "--node-id",
        "${nodeId}",
        "--data-path",
        "${dataDir}",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

impl ReplicaCommandConfig {
    pub fn new(binary: Utf8PathBuf) -> Self {
        Self {
            binary,
            args: default_args(),
            env: BTreeMap::new(),
            data_root: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    pub readiness_ms: u64,
    pub poll_interval_ms: u64,
    pub probe_attempt_ms: u64,
    pub request_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            readiness_ms: 30_000,
            poll_interval_ms: 250,
            probe_attempt_ms: 1_000,
            request_ms: 10_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl Timeouts {
    pub const fn readiness(&self) -> Duration {
        Duration::from_millis(self.readiness_ms)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn probe_attempt(&self) -> Duration {
        Duration::from_millis(self.probe_attempt_ms)
    }

    pub const fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Properties {
    pub convergence: bool,
    pub idempotence: bool,
    pub commutativity: bool,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            convergence: true,
            idempotence: true,
            commutativity: false,
        }
    }
}

impl Properties {
    pub fn only(selected: &[Property]) -> Self {
        Self {
            convergence: selected.contains(&Property::Convergence),
            idempotence: selected.contains(&Property::Idempotence),
            commutativity: selected.contains(&Property::Commutativity),
        }
    }

    pub const fn enabled(&self, property: Property) -> bool {
        match property {
            Property::Convergence => self.convergence,
            Property::Idempotence => self.idempotence,
            Property::Commutativity => self.commutativity,
        }
    }
}

/// A batch submitted to one replica.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub node_id: String,
    pub batch: OperationBatch,
}

impl Workload {
    pub fn new(node_id: impl Into<String>, batch: OperationBatch) -> Self {
        Self {
            node_id: node_id.into(),
            batch,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub workload: Vec<Workload>,
    #[serde(default)]
    pub topology: SyncTopology,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<ReversePhase>,
    /// The edge re-triggered by the idempotence check. Defaults to the first
    /// forward edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotence_edge: Option<EdgeSpec>,
    /// The forward edges alone do not carry every write to every replica, so
    /// only the checkpoint after the reverse phase must converge.
    #[serde(default)]
    pub forward_partial: bool,
}

impl Scenario {
    /// Every operation of the scenario in submission order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        let reverse = self
            .reverse
            .iter()
            .flat_map(|reverse| reverse.workload.iter());

        self.workload
            .iter()
            .chain(reverse)
            .flat_map(|workload| workload.batch.changes.iter())
    }
}

/// Mutations and syncs that run after the forward phase.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversePhase {
    #[serde(default)]
    pub workload: Vec<Workload>,
    /// Defaults to the forward edges, each reversed, in reverse order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<EdgeSpec>>,
}

/// Applies one operation set in several orderings, each on fresh replicas.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Commutativity {
    /// Defaults to every operation of the scenario.
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// Permutations of operation indexes. Defaults to the identity and its
    /// reverse.
    #[serde(default)]
    pub orderings: Vec<Vec<usize>>,
    /// Defaults to pairwise with two rounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<SyncTopology>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotPolicy {
    Never,
    #[default]
    OnFailure,
    Always,
}

impl Config {
    pub async fn load(path: &Utf8Path) -> EyreResult<Self> {
        let bytes = read(path)
            .await
            .wrap_err_with(|| format!("failed to read config file {path}"))?;

        from_slice(&bytes).wrap_err_with(|| format!("failed to parse config file {path}"))
    }

    /// Two replicas: node1 receives three operations and pushes them to
    /// node2, node2 adds one of its own and syncs back, then the first edge
    /// is repeated.
    pub fn two_replica(binary: Utf8PathBuf) -> Self {
        let replicas = ["node1", "node2"]
            .into_iter()
            .map(|node_id| ReplicaSpec {
                node_id: node_id.to_owned(),
                port: None,
            })
            .collect();

        Self {
            network: Network {
                host: default_host(),
                base_port: None,
                replicas,
            },
            replica: ReplicaCommandConfig::new(binary),
            timeouts: Timeouts::default(),
            settle: SettleStrategy::default(),
            properties: Properties::default(),
            scenario: Scenario {
                workload: vec![Workload::new(
                    "node1",
                    OperationBatch::new(
                        "initial",
                        vec![
                            Operation::add("user", "Alice"),
                            Operation::increment("counter", 5),
                            Operation::set("status", "active"),
                        ],
                    ),
                )],
                topology: SyncTopology::default(),
                reverse: Some(ReversePhase {
                    workload: vec![Workload::new(
                        "node2",
                        OperationBatch::new("follow-up", vec![Operation::add("user", "Bob")]),
                    )],
                    edges: None,
                }),
                idempotence_edge: None,
                forward_partial: false,
            },
            commutativity: Commutativity::default(),
            snapshots: SnapshotPolicy::default(),
        }
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.network
            .replicas
            .iter()
            .map(|replica| replica.node_id.as_str())
            .collect()
    }

    /// Operations used by the commutativity phase.
    pub fn commutativity_operations(&self) -> Vec<Operation> {
        if self.commutativity.operations.is_empty() {
            self.scenario.operations().cloned().collect()
        } else {
            self.commutativity.operations.clone()
        }
    }

    /// Orderings used by the commutativity phase, as indexes into
    /// [`Config::commutativity_operations`].
    pub fn commutativity_orderings(&self) -> Vec<Vec<usize>> {
        if !self.commutativity.orderings.is_empty() {
            return self.commutativity.orderings.clone();
        }

        let count = self.commutativity_operations().len();
        let identity: Vec<usize> = (0..count).collect();
        let reversed: Vec<usize> = identity.iter().rev().copied().collect();

        if identity == reversed {
            vec![identity]
        } else {
            vec![identity, reversed]
        }
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        let invalid = |message: String| Err(HarnessError::InvalidScenario(message));

        if self.network.replicas.is_empty() {
            return invalid("at least one replica is required".to_owned());
        }

        let mut nodes = BTreeSet::new();
        for replica in &self.network.replicas {
            if replica.node_id.is_empty() {
                return invalid("node identifiers must not be empty".to_owned());
            }
            if !nodes.insert(replica.node_id.as_str()) {
                return invalid(format!(
                    "node identifier '{}' is used more than once",
                    replica.node_id
                ));
            }
            if replica.port == Some(0) {
                return invalid(format!(
                    "replica '{}' has port 0; omit the port for an ephemeral one",
                    replica.node_id
                ));
            }
        }

        let known = |node: &str| -> Result<(), HarnessError> {
            if nodes.contains(node) {
                Ok(())
            } else {
                Err(HarnessError::UnknownReplica(node.to_owned()))
            }
        };

        let check_edges = |edges: &[EdgeSpec]| -> Result<(), HarnessError> {
            for edge in edges {
                known(&edge.source)?;
                known(&edge.target)?;
                if edge.source == edge.target {
                    return Err(HarnessError::InvalidScenario(format!(
                        "sync edge {edge} connects a replica to itself"
                    )));
                }
            }
            Ok(())
        };

        let check_topology = |topology: &SyncTopology| -> Result<(), HarnessError> {
            match topology {
                SyncTopology::Star { hub: Some(hub) } => known(hub),
                SyncTopology::Star { hub: None } | SyncTopology::Chain => Ok(()),
                SyncTopology::Pairwise { rounds: 0 } => Err(HarnessError::InvalidScenario(
                    "pairwise topology needs at least one round".to_owned(),
                )),
                SyncTopology::Pairwise { .. } => Ok(()),
                SyncTopology::Edges { edges } => check_edges(edges),
            }
        };

        let timeouts = &self.timeouts;
        for (name, value) in [
            ("timeouts.readinessMs", timeouts.readiness_ms),
            ("timeouts.pollIntervalMs", timeouts.poll_interval_ms),
            ("timeouts.probeAttemptMs", timeouts.probe_attempt_ms),
            ("timeouts.requestMs", timeouts.request_ms),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
        }

        if let SettleStrategy::Stable {
            interval_ms,
            timeout_ms,
        } = self.settle
        {
            if interval_ms == 0 || timeout_ms == 0 {
                return invalid("stable settle needs a non-zero interval and timeout".to_owned());
            }
        }

        let reverse_workload = self
            .scenario
            .reverse
            .iter()
            .flat_map(|reverse| reverse.workload.iter());
        for workload in self.scenario.workload.iter().chain(reverse_workload) {
            known(&workload.node_id)?;
        }

        check_topology(&self.scenario.topology)?;

        if self.scenario.forward_partial && self.scenario.reverse.is_none() {
            return invalid("forwardPartial needs a reverse phase to converge on".to_owned());
        }

        if let Some(edges) = self
            .scenario
            .reverse
            .as_ref()
            .and_then(|reverse| reverse.edges.as_deref())
        {
            check_edges(edges)?;
        }

        if let Some(edge) = &self.scenario.idempotence_edge {
            check_edges(core::slice::from_ref(edge))?;
        }

        if let Some(topology) = &self.commutativity.topology {
            check_topology(topology)?;
        }

        if self.properties.commutativity {
            let count = self.commutativity_operations().len();

            for ordering in &self.commutativity.orderings {
                let mut sorted = ordering.clone();
                sorted.sort_unstable();

                if !sorted.iter().copied().eq(0..count) {
                    return invalid(format!(
                        "ordering {ordering:?} is not a permutation of the {count} commutativity operations"
                    ));
                }
            }
        }

        Ok(())
    }
}
