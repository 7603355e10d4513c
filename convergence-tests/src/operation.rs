//! Data-mutation operations and the driver that submits them.

use core::fmt;
use core::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::client::ReplicaClient;
use crate::environment::ReplicaHandle;
use crate::error::{RequestError, RequestErrorKind};

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum OperationKind {
    Add,
    Remove,
    Increment,
    Decrement,
    Set,
    /// A kind the replica API supports but this harness has no shorthand for.
    Other(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Increment => "increment",
            Self::Decrement => "decrement",
            Self::Set => "set",
            Self::Other(kind) => kind,
        }
    }

    const fn takes_delta(&self) -> bool {
        matches!(self, Self::Increment | Self::Decrement)
    }
}

impl From<&str> for OperationKind {
    fn from(kind: &str) -> Self {
        match kind {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "increment" => Self::Increment,
            "decrement" => Self::Decrement,
            "set" => Self::Set,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Payload {
    Value(String),
    Delta(u64),
}

/// A single mutation. Immutable once constructed.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "Change", into = "Change")]
pub struct Operation {
    kind: OperationKind,
    key: String,
    payload: Payload,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        key: impl Into<String>,
        payload: Payload,
    ) -> Result<Self, InvalidOperation> {
        let key = key.into();

        let consistent = matches!(
            (&kind, &payload),
            (OperationKind::Other(_), _)
                | (
                    OperationKind::Increment | OperationKind::Decrement,
                    Payload::Delta(_)
                )
                | (
                    OperationKind::Add | OperationKind::Remove | OperationKind::Set,
                    Payload::Value(_)
                )
        );

        if !consistent {
            return Err(InvalidOperation::PayloadMismatch { kind, key });
        }

        Ok(Self { kind, key, payload })
    }

    pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::value(OperationKind::Add, key, value)
    }

    pub fn remove(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::value(OperationKind::Remove, key, value)
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::value(OperationKind::Set, key, value)
    }

    pub fn increment(key: impl Into<String>, delta: u64) -> Self {
        Self::delta(OperationKind::Increment, key, delta)
    }

    pub fn decrement(key: impl Into<String>, delta: u64) -> Self {
        Self::delta(OperationKind::Decrement, key, delta)
    }

    fn value(kind: OperationKind, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            payload: Payload::Value(value.into()),
        }
    }

    fn delta(kind: OperationKind, key: impl Into<String>, delta: u64) -> Self {
        Self {
            kind,
            key: key.into(),
            payload: Payload::Delta(delta),
        }
    }

    pub const fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub const fn payload(&self) -> &Payload {
        &self.payload
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Value(value) => write!(f, "{} {}={}", self.kind, self.key, value),
            Payload::Delta(delta) => write!(f, "{} {} +{}", self.kind, self.key, delta),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InvalidOperation {
    #[error("operation '{kind}' on key '{key}' has the wrong payload type")]
    PayloadMismatch { kind: OperationKind, key: String },

    #[error("operation '{kind}' on key '{key}' needs a value or a delta")]
    MissingPayload { kind: OperationKind, key: String },
}

/// Wire form of an operation inside a `POST /sync` request.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct Change {
    op: String,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<u64>,
}

impl TryFrom<Change> for Operation {
    type Error = InvalidOperation;

    fn try_from(change: Change) -> Result<Self, Self::Error> {
        let kind = OperationKind::from(change.op.as_str());

        let payload = if kind.takes_delta() {
            // Replicas treat a missing delta as one.
            Payload::Delta(change.delta.unwrap_or(1))
        } else if let Some(value) = change.value {
            Payload::Value(value)
        } else if let (OperationKind::Other(_), Some(delta)) = (&kind, change.delta) {
            Payload::Delta(delta)
        } else {
            return Err(InvalidOperation::MissingPayload {
                kind,
                key: change.key,
            });
        };

        Self::new(kind, change.key, payload)
    }
}

impl From<Operation> for Change {
    fn from(operation: Operation) -> Self {
        let (value, delta) = match operation.payload {
            Payload::Value(value) => (Some(value), None),
            Payload::Delta(delta) => (None, Some(delta)),
        };

        Self {
            op: operation.kind.as_str().to_owned(),
            key: operation.key,
            value,
            delta,
        }
    }
}

/// An ordered batch of operations submitted as one request.
///
/// The order only shapes the request body; it carries no causal guarantee.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationBatch {
    pub name: String,
    pub changes: Vec<Operation>,
}

impl OperationBatch {
    pub fn new(name: impl Into<String>, changes: Vec<Operation>) -> Self {
        Self {
            name: name.into(),
            changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Serialize)]
pub(crate) struct ChangeRequest<'a> {
    pub changes: &'a [Operation],
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Submission {
    Accepted { ack: Value },
    Rejected { reason: String },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReport {
    pub node_id: String,
    pub batch: String,
    pub submission: Submission,
    #[serde(serialize_with = "crate::report::serialize_millis")]
    pub latency: Duration,
}

/// Sends `batch` to the replica's mutation endpoint as a single request.
///
/// Transport failures and timeouts come back as `Err`; a replica that
/// answers with a client error or `success: false` yields `Rejected`.
/// Either way the batch is never resent.
pub async fn submit(
    client: &ReplicaClient,
    handle: &ReplicaHandle,
    batch: &OperationBatch,
) -> Result<SubmitReport, RequestError> {
    let started = Instant::now();

    let submission = match client.submit_changes(handle, &batch.changes).await {
        Ok(ack) => match ack.get("success").and_then(Value::as_bool) {
            Some(false) => Submission::Rejected {
                reason: ack
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("replica reported success=false")
                    .to_owned(),
            },
            _ => Submission::Accepted { ack },
        },
        Err(RequestError {
            kind: RequestErrorKind::Status { status, body },
            ..
        }) if (400..500).contains(&status) => Submission::Rejected {
            reason: format!("status {status}: {body}"),
        },
        Err(err) => return Err(err),
    };

    Ok(SubmitReport {
        node_id: handle.node_id().to_owned(),
        batch: batch.name.clone(),
        submission,
        latency: started.elapsed(),
    })
}
