//! Directed peer synchronization and the topologies that order it.

use core::fmt;
use core::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tokio::time::Instant;

use crate::client::ReplicaClient;
use crate::environment::ReplicaHandle;
use crate::error::{HarnessError, RequestError};

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
}

impl EdgeSpec {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    #[must_use]
    pub fn reversed(&self) -> Self {
        Self::new(self.target.clone(), self.source.clone())
    }
}

impl fmt::Display for EdgeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

/// The order in which synchronization is triggered across replicas.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncTopology {
    /// `hub -> every other replica`. The hub defaults to the first replica.
    Star {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hub: Option<String>,
    },
    /// Each replica syncs with the next one in declaration order.
    Chain,
    /// Every ordered pair, repeated `rounds` times.
    Pairwise {
        #[serde(default = "default_rounds")]
        rounds: u32,
    },
    Edges { edges: Vec<EdgeSpec> },
}

const fn default_rounds() -> u32 {
    2
}

impl Default for SyncTopology {
    fn default() -> Self {
        Self::Star { hub: None }
    }
}

impl SyncTopology {
    pub const fn pairwise() -> Self {
        Self::Pairwise {
            rounds: default_rounds(),
        }
    }

    /// Expands the topology over `nodes` into the exact trigger order.
    pub fn edges(&self, nodes: &[&str]) -> Result<Vec<EdgeSpec>, HarnessError> {
        let known = |id: &str| -> Result<(), HarnessError> {
            if nodes.contains(&id) {
                Ok(())
            } else {
                Err(HarnessError::UnknownReplica(id.to_owned()))
            }
        };

        match self {
            Self::Star { hub } => {
                let Some(hub) = hub.as_deref().or_else(|| nodes.first().copied()) else {
                    return Ok(Vec::new());
                };
                known(hub)?;

                Ok(nodes
                    .iter()
                    .filter(|node| **node != hub)
                    .map(|node| EdgeSpec::new(hub, *node))
                    .collect())
            }
            Self::Chain => Ok(nodes
                .iter()
                .tuple_windows()
                .map(|(source, target)| EdgeSpec::new(*source, *target))
                .collect()),
            Self::Pairwise { rounds } => {
                let round: Vec<EdgeSpec> = nodes
                    .iter()
                    .permutations(2)
                    .map(|pair| EdgeSpec::new(*pair[0], *pair[1]))
                    .collect();

                Ok((0..*rounds).flat_map(|_| round.iter().cloned()).collect())
            }
            Self::Edges { edges } => {
                for edge in edges {
                    known(&edge.source)?;
                    known(&edge.target)?;
                }

                Ok(edges.clone())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    Forward,
    Reverse,
    Repeat,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
            Self::Repeat => "repeat",
        })
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncOutcome {
    Acknowledged {
        ack: Value,
    },
    Failed {
        #[serde(serialize_with = "serialize_display")]
        error: RequestError,
    },
}

fn serialize_display<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: fmt::Display,
{
    serializer.collect_str(value)
}

/// One directed synchronization request and what the source answered.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEdge {
    pub source: String,
    pub target: String,
    pub direction: SyncDirection,
    pub initiated_at: DateTime<Utc>,
    #[serde(serialize_with = "crate::report::serialize_millis")]
    pub latency: Duration,
    pub outcome: SyncOutcome,
}

impl SyncEdge {
    pub fn error(&self) -> Option<&RequestError> {
        match &self.outcome {
            SyncOutcome::Acknowledged { .. } => None,
            SyncOutcome::Failed { error } => Some(error),
        }
    }
}

impl fmt::Display for SyncEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.source, self.target, self.direction)
    }
}

/// Asks `source` to synchronize with `target`.
///
/// Returns as soon as the source answers; the caller settles before reading
/// fingerprints. A failed request is recorded on the edge, never retried.
pub async fn trigger_sync(
    client: &ReplicaClient,
    source: &ReplicaHandle,
    target: &ReplicaHandle,
    direction: SyncDirection,
) -> SyncEdge {
    let initiated_at = Utc::now();
    let started = Instant::now();

    let outcome = match client.sync_peer(source, target).await {
        Ok(ack) => SyncOutcome::Acknowledged { ack },
        Err(error) => SyncOutcome::Failed { error },
    };

    SyncEdge {
        source: source.node_id().to_owned(),
        target: target.node_id().to_owned(),
        direction,
        initiated_at,
        latency: started.elapsed(),
        outcome,
    }
}

/// Resolves both ends of `edge` against the running replicas.
pub fn endpoints<'a>(
    handles: &'a [ReplicaHandle],
    edge: &EdgeSpec,
) -> Result<(&'a ReplicaHandle, &'a ReplicaHandle), HarnessError> {
    let find = |id: &str| {
        handles
            .iter()
            .find(|handle| handle.node_id() == id)
            .ok_or_else(|| HarnessError::UnknownReplica(id.to_owned()))
    };

    Ok((find(&edge.source)?, find(&edge.target)?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const NODES: [&str; 3] = ["a", "b", "c"];

    fn pairs(edges: &[EdgeSpec]) -> Vec<(&str, &str)> {
        edges
            .iter()
            .map(|edge| (edge.source.as_str(), edge.target.as_str()))
            .collect()
    }

    #[test]
    fn star_defaults_to_first_replica_as_hub() {
        let edges = SyncTopology::default().edges(&NODES).unwrap();
        assert_eq!(pairs(&edges), [("a", "b"), ("a", "c")], "hub is a");

        let edges = SyncTopology::Star {
            hub: Some("c".to_owned()),
        }
        .edges(&NODES)
        .unwrap();
        assert_eq!(pairs(&edges), [("c", "a"), ("c", "b")], "explicit hub");
    }

    #[test]
    fn chain_and_pairwise_orders() {
        let edges = SyncTopology::Chain.edges(&NODES).unwrap();
        assert_eq!(pairs(&edges), [("a", "b"), ("b", "c")], "chain");

        let edges = SyncTopology::Pairwise { rounds: 1 }
            .edges(&["a", "b"])
            .unwrap();
        assert_eq!(pairs(&edges), [("a", "b"), ("b", "a")], "one pairwise round");

        let edges = SyncTopology::pairwise().edges(&NODES).unwrap();
        assert_eq!(edges.len(), 12, "six ordered pairs, two rounds");
    }

    #[test]
    fn explicit_edges_must_name_known_replicas() {
        let topology = SyncTopology::Edges {
            edges: vec![EdgeSpec::new("a", "z")],
        };

        let err = topology.edges(&NODES).unwrap_err();
        assert!(
            matches!(err, HarnessError::UnknownReplica(ref id) if id == "z"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn parses_topologies() {
        let topology: SyncTopology =
            serde_json::from_value(json!({ "kind": "pairwise" })).unwrap();
        assert_eq!(topology, SyncTopology::pairwise(), "rounds default to two");

        let topology: SyncTopology = serde_json::from_value(json!({
            "kind": "edges",
            "edges": [{ "source": "a", "target": "b" }]
        }))
        .unwrap();
        assert_eq!(
            topology,
            SyncTopology::Edges {
                edges: vec![EdgeSpec::new("a", "b")]
            },
            "explicit edges"
        );
    }

    #[tokio::test]
    async fn trigger_records_ack_and_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync-peer"))
            .and(body_json(json!({ "peer": "127.0.0.1:7002" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sync-peer"))
            .respond_with(ResponseTemplate::new(502).set_body_string("peer unreachable"))
            .mount(&server)
            .await;

        let client = ReplicaClient::new(Duration::from_millis(500)).unwrap();
        let source = ReplicaHandle::attached("a", "127.0.0.1", server.address().port());

        let reachable = ReplicaHandle::attached("b", "127.0.0.1", 7002);
        let edge = trigger_sync(&client, &source, &reachable, SyncDirection::Forward).await;
        assert!(edge.error().is_none(), "acknowledged: {edge:?}");
        assert_eq!(edge.to_string(), "a -> b (forward)", "display");

        let unreachable = ReplicaHandle::attached("c", "127.0.0.1", 7003);
        let edge = trigger_sync(&client, &source, &unreachable, SyncDirection::Reverse).await;
        let error = edge.error().expect("502 is a failed sync");
        assert_eq!(error.node, "a", "the source is blamed");

        let recorded = serde_json::to_value(&edge).unwrap();
        assert_eq!(recorded["outcome"]["status"], "failed", "outcome tag");
    }
}
