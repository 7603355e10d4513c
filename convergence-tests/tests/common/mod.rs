//! In-process fake replicas.
//!
//! Each replica is an axum server holding a small state-based CRDT: two-phase
//! sets, per-node PN counters and last-writer-wins registers. Peer sync
//! merges both ways, so a correct replica converges after any edge.

use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{write, OpenOptions};
use std::io::{self, Write as _};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use convergence_tests::error::EnvironmentError;
use convergence_tests::launcher::{
    LaunchContext, Launcher, ProcessExit, ReplicaProcess, Termination,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Behavior {
    #[default]
    Correct,
    /// Acknowledges sync requests without merging anything.
    IgnoresSync,
    /// Records every sync it initiates in replicated state, so a repeated
    /// sync changes the fingerprint of both ends.
    CountsSyncs,
    /// Answers the health check with 503 forever.
    NeverReady,
    /// Rejects every mutation batch with 400.
    RejectsWrites,
    /// Exits right after launch.
    Crashes,
}

#[derive(Deserialize)]
struct ChangeBody {
    changes: Vec<Change>,
}

#[derive(Deserialize)]
struct Change {
    op: String,
    key: String,
    value: Option<String>,
    delta: Option<u64>,
}

#[derive(Deserialize)]
struct SyncPeerBody {
    peer: String,
}

#[derive(Clone, Debug, Default)]
struct CrdtState {
    added: BTreeMap<String, BTreeSet<String>>,
    removed: BTreeMap<String, BTreeSet<String>>,
    counters: BTreeMap<String, BTreeMap<String, (u64, u64)>>,
    registers: BTreeMap<String, (u64, String, String)>,
    clock: u64,
    syncs: BTreeMap<String, u64>,
}

impl CrdtState {
    fn apply(&mut self, node: &str, change: Change) -> Result<(), String> {
        let value = || {
            change
                .value
                .clone()
                .ok_or_else(|| format!("'{}' on '{}' needs a value", change.op, change.key))
        };

        match change.op.as_str() {
            "add" => {
                let value = value()?;
                let _added = self.added.entry(change.key).or_default().insert(value);
            }
            "remove" => {
                let value = value()?;
                let _removed = self.removed.entry(change.key).or_default().insert(value);
            }
            "increment" | "decrement" => {
                let delta = change.delta.unwrap_or(1);
                let entry = self
                    .counters
                    .entry(change.key)
                    .or_default()
                    .entry(node.to_owned())
                    .or_default();

                if change.op == "increment" {
                    entry.0 += delta;
                } else {
                    entry.1 += delta;
                }
            }
            "set" => {
                let value = value()?;
                self.clock += 1;
                let stamp = (self.clock, node.to_owned(), value);

                let newer = self
                    .registers
                    .get(&change.key)
                    .map_or(true, |current| *current < stamp);
                if newer {
                    drop(self.registers.insert(change.key, stamp));
                }
            }
            other => return Err(format!("unsupported operation '{other}'")),
        }

        Ok(())
    }

    fn merge(&mut self, other: &Self) {
        for (key, values) in &other.added {
            self.added
                .entry(key.clone())
                .or_default()
                .extend(values.iter().cloned());
        }

        for (key, values) in &other.removed {
            self.removed
                .entry(key.clone())
                .or_default()
                .extend(values.iter().cloned());
        }

        for (key, per_node) in &other.counters {
            let mine = self.counters.entry(key.clone()).or_default();
            for (node, (inc, dec)) in per_node {
                let entry = mine.entry(node.clone()).or_default();
                entry.0 = entry.0.max(*inc);
                entry.1 = entry.1.max(*dec);
            }
        }

        for (key, stamp) in &other.registers {
            let newer = self
                .registers
                .get(key)
                .map_or(true, |current| current < stamp);
            if newer {
                drop(self.registers.insert(key.clone(), stamp.clone()));
            }
        }

        for (node, count) in &other.syncs {
            let entry = self.syncs.entry(node.clone()).or_default();
            *entry = (*entry).max(*count);
        }

        self.clock = self.clock.max(other.clock);
    }

    /// What the replica exposes. Internal bookkeeping such as tombstones and
    /// clocks is folded away, so equal views mean equal fingerprints.
    fn view(&self) -> Value {
        let sets: BTreeMap<&str, Vec<&str>> = self
            .added
            .iter()
            .filter_map(|(key, values)| {
                let removed = self.removed.get(key);
                let live: Vec<&str> = values
                    .iter()
                    .filter(|value| removed.map_or(true, |removed| !removed.contains(*value)))
                    .map(String::as_str)
                    .collect();

                (!live.is_empty()).then_some((key.as_str(), live))
            })
            .collect();

        let counters: BTreeMap<&str, i64> = self
            .counters
            .iter()
            .map(|(key, per_node)| {
                let (inc, dec) = per_node
                    .values()
                    .fold((0_u64, 0_u64), |(inc, dec), (i, d)| (inc + i, dec + d));
                let net = i64::try_from(inc)
                    .unwrap_or(i64::MAX)
                    .saturating_sub(i64::try_from(dec).unwrap_or(i64::MAX));

                (key.as_str(), net)
            })
            .collect();

        let registers: BTreeMap<&str, &str> = self
            .registers
            .iter()
            .map(|(key, (_, _, value))| (key.as_str(), value.as_str()))
            .collect();

        json!({
            "sets": sets,
            "counters": counters,
            "registers": registers,
            "syncs": self.syncs,
        })
    }

    fn hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.view()).unwrap_or_default();
        format!("{:x}", Sha256::digest(bytes))
    }
}

type Peers = Arc<Mutex<BTreeMap<String, Arc<Mutex<CrdtState>>>>>;

#[derive(Clone)]
struct Replica {
    node_id: String,
    behavior: Behavior,
    crdt: Arc<Mutex<CrdtState>>,
    peers: Peers,
}

async fn health(State(replica): State<Replica>) -> Result<Json<Value>, (StatusCode, String)> {
    if replica.behavior == Behavior::NeverReady {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "booting".to_owned()));
    }

    Ok(Json(json!({ "status": "ok" })))
}

async fn mutate(
    State(replica): State<Replica>,
    Json(body): Json<ChangeBody>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if replica.behavior == Behavior::RejectsWrites {
        return Err((StatusCode::BAD_REQUEST, "replica is read-only".to_owned()));
    }

    let count = body.changes.len();
    let mut crdt = replica.crdt.lock().unwrap();
    for change in body.changes {
        crdt.apply(&replica.node_id, change)
            .map_err(|reason| (StatusCode::BAD_REQUEST, reason))?;
    }

    Ok(Json(json!({ "success": true, "applied": count })))
}

async fn sync_peer(
    State(replica): State<Replica>,
    Json(body): Json<SyncPeerBody>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if replica.behavior == Behavior::IgnoresSync {
        return Ok(Json(json!({ "success": true, "merged": false })));
    }

    let peer = replica
        .peers
        .lock()
        .unwrap()
        .get(&body.peer)
        .cloned()
        .ok_or_else(|| (StatusCode::BAD_GATEWAY, format!("unknown peer {}", body.peer)))?;

    if replica.behavior == Behavior::CountsSyncs {
        *replica
            .crdt
            .lock()
            .unwrap()
            .syncs
            .entry(replica.node_id.clone())
            .or_default() += 1;
    }

    let ours = replica.crdt.lock().unwrap().clone();
    let theirs = {
        let mut peer = peer.lock().unwrap();
        peer.merge(&ours);
        peer.clone()
    };
    replica.crdt.lock().unwrap().merge(&theirs);

    Ok(Json(json!({ "success": true, "merged": true, "peer": body.peer })))
}

async fn state_hash(State(replica): State<Replica>) -> Json<Value> {
    Json(json!({ "hash": replica.crdt.lock().unwrap().hash() }))
}

async fn state(State(replica): State<Replica>) -> Json<Value> {
    Json(replica.crdt.lock().unwrap().view())
}

/// Starts fake replicas inside the test's runtime.
#[derive(Clone, Debug, Default)]
pub struct InProcessLauncher {
    behaviors: BTreeMap<String, Behavior>,
    peers: Peers,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, node_id: &str, behavior: Behavior) -> Self {
        drop(self.behaviors.insert(node_id.to_owned(), behavior));
        self
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(
        &self,
        ctx: &LaunchContext<'_>,
    ) -> Result<Box<dyn ReplicaProcess>, EnvironmentError> {
        let behavior = self
            .behaviors
            .get(ctx.node_id)
            .copied()
            .unwrap_or_default();

        let spawn_err = |source| EnvironmentError::Spawn {
            node: ctx.node_id.to_owned(),
            source,
        };

        write(ctx.data_dir.join("replica.db"), b"fake").map_err(spawn_err)?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(ctx.log_file)
            .map_err(spawn_err)?;

        if behavior == Behavior::Crashes {
            writeln!(log, "{} crashed on startup", ctx.node_id).map_err(spawn_err)?;

            return Ok(Box::new(FakeProcess {
                task: tokio::spawn(async {}),
                exit_code: 1,
            }));
        }

        let listener = TcpListener::bind((ctx.host, ctx.port))
            .await
            .map_err(spawn_err)?;
        writeln!(log, "{} listening on {}:{}", ctx.node_id, ctx.host, ctx.port)
            .map_err(spawn_err)?;

        let crdt = Arc::new(Mutex::new(CrdtState::default()));
        drop(
            self.peers
                .lock()
                .unwrap()
                .insert(format!("{}:{}", ctx.host, ctx.port), Arc::clone(&crdt)),
        );

        let app = Router::new()
            .route("/health", get(health))
            .route("/sync", post(mutate))
            .route("/sync-peer", post(sync_peer))
            .route("/state-hash", get(state_hash))
            .route("/state", get(state))
            .with_state(Replica {
                node_id: ctx.node_id.to_owned(),
                behavior,
                crdt,
                peers: Arc::clone(&self.peers),
            });

        let task = tokio::spawn(async move {
            let _served = axum::serve(listener, app).await;
        });

        Ok(Box::new(FakeProcess { task, exit_code: 0 }))
    }
}

#[derive(Debug)]
struct FakeProcess {
    task: JoinHandle<()>,
    exit_code: i32,
}

#[async_trait]
impl ReplicaProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.task.is_finished().then_some(ProcessExit {
            code: Some(self.exit_code),
        }))
    }

    async fn terminate(&mut self, _grace: Duration) -> io::Result<Termination> {
        if self.task.is_finished() {
            return Ok(Termination::AlreadyExited);
        }

        self.task.abort();
        let _joined = (&mut self.task).await;

        Ok(Termination::Graceful)
    }

    fn kill_now(&mut self) {
        self.task.abort();
    }
}
