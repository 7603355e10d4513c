use core::fmt;
use core::time::Duration;
use std::io;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::environment::ReplicaState;
use crate::template::TemplateError;

/// Failures while preparing, launching or tearing down replicas.
///
/// All of these abort a run before any replica work is trusted.
#[derive(Debug, ThisError)]
pub enum EnvironmentError {
    #[error("port {port} is already in use{}", occupant_suffix(.occupant.as_deref()))]
    PortInUse { port: u16, occupant: Option<String> },

    #[error("port {port} is assigned to both '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("cannot assign {count} ports starting at {base}")]
    PortRange { base: u16, count: usize },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("node identifier '{0}' is used more than once")]
    DuplicateNode(String),

    #[error("data directory {0} already exists")]
    DataDirExists(Utf8PathBuf),

    #[error("failed to spawn replica '{node}': {source}")]
    Spawn {
        node: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid replica command: {0}")]
    Template(#[from] TemplateError),

    #[error("replica '{node}' cannot move from {from} to {to}")]
    InvalidTransition {
        node: String,
        from: ReplicaState,
        to: ReplicaState,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

fn occupant_suffix(occupant: Option<&str>) -> String {
    occupant.map_or_else(String::new, |occupant| format!(" by {occupant}"))
}

/// The replica API calls the harness makes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicaCall {
    Health,
    Mutate,
    SyncPeer,
    StateHash,
    State,
}

impl ReplicaCall {
    pub const fn path(self) -> &'static str {
        match self {
            Self::Health => "/health",
            Self::Mutate => "/sync",
            Self::SyncPeer => "/sync-peer",
            Self::StateHash => "/state-hash",
            Self::State => "/state",
        }
    }

    pub const fn method(self) -> &'static str {
        match self {
            Self::Health | Self::StateHash | Self::State => "GET",
            Self::Mutate | Self::SyncPeer => "POST",
        }
    }
}

impl fmt::Display for ReplicaCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method(), self.path())
    }
}

#[derive(Clone, Debug, ThisError)]
pub enum RequestErrorKind {
    #[error("timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A failed call against a replica. Never retried by the harness.
#[derive(Clone, Debug, ThisError)]
#[error("{call} on replica '{node}' failed: {kind}")]
pub struct RequestError {
    pub node: String,
    pub call: ReplicaCall,
    pub kind: RequestErrorKind,
}

impl RequestError {
    pub fn new(node: &str, call: ReplicaCall, kind: RequestErrorKind) -> Self {
        Self {
            node: node.to_owned(),
            call,
            kind,
        }
    }

    pub(crate) fn from_reqwest(node: &str, call: ReplicaCall, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            RequestErrorKind::Timeout
        } else if err.is_decode() {
            RequestErrorKind::Malformed(err.to_string())
        } else {
            RequestErrorKind::Transport(err.to_string())
        };

        Self::new(node, call, kind)
    }
}

/// Everything that aborts a verification run.
#[derive(Debug, ThisError)]
pub enum HarnessError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(
        "replica '{node}' did not become ready within {timeout:?} after {attempts} probes{}",
        last_error_suffix(.last_error.as_deref())
    )]
    ReadinessTimeout {
        node: String,
        timeout: Duration,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("replica '{node}' exited during startup (exit code {code:?})")]
    ReplicaExited { node: String, code: Option<i32> },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("replica '{node}' rejected batch '{batch}': {reason}")]
    Rejected {
        node: String,
        batch: String,
        reason: String,
    },

    #[error("checkpoint '{label}' was already captured for replica '{node}'")]
    DuplicateCheckpoint { node: String, label: String },

    #[error("unknown replica '{0}'")]
    UnknownReplica(String),

    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
}

fn last_error_suffix(last_error: Option<&str>) -> String {
    last_error.map_or_else(String::new, |err| format!(" (last error: {err})"))
}
