//! Judges convergence, idempotence and commutativity from fingerprints.
//!
//! Nothing here talks to a replica; every check is a pure function of what
//! the collector already recorded.

use core::fmt;
use std::collections::BTreeMap;

use clap::ValueEnum;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::fingerprint::{Fingerprint, FingerprintLog};
use crate::operation::Operation;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Property {
    Convergence,
    Idempotence,
    Commutativity,
}

impl Property {
    pub const ALL: [Self; 3] = [Self::Convergence, Self::Idempotence, Self::Commutativity];
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Convergence => "convergence",
            Self::Idempotence => "idempotence",
            Self::Commutativity => "commutativity",
        })
    }
}

/// Two fingerprints that were expected to agree and did not.
#[derive(Clone, Debug, Serialize)]
pub struct Mismatch {
    pub left: Fingerprint,
    pub right: Fingerprint,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{} = {} vs {}@{}#{} = {}",
            self.left.node_id,
            self.left.checkpoint,
            self.left.sequence,
            self.left.hash,
            self.right.node_id,
            self.right.checkpoint,
            self.right.sequence,
            self.right.hash,
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Evidence {
    pub summary: String,
    pub mismatches: Vec<Mismatch>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "verdict", rename_all = "camelCase")]
pub enum Verdict {
    Pass,
    Fail(Evidence),
    Skipped { reason: String },
}

impl Verdict {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub const fn is_fail(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub const fn evidence(&self) -> Option<&Evidence> {
        match self {
            Self::Fail(evidence) => Some(evidence),
            Self::Pass | Self::Skipped { .. } => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Fail(evidence) => write!(f, "fail: {}", evidence.summary),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// Every pair in `fingerprints` whose hashes differ.
fn disagreements<'a, I>(fingerprints: I) -> Vec<Mismatch>
where
    I: IntoIterator<Item = &'a Fingerprint>,
    I::IntoIter: Clone,
{
    fingerprints
        .into_iter()
        .tuple_combinations()
        .filter(|(left, right)| left != right)
        .map(|(left, right)| Mismatch {
            left: left.clone(),
            right: right.clone(),
        })
        .collect()
}

/// All replicas must agree at each of `checkpoints`.
pub fn verify_convergence(log: &FingerprintLog, checkpoints: &[&str]) -> Verdict {
    let mut mismatches = Vec::new();
    let mut compared = 0_usize;

    for label in checkpoints {
        let at: Vec<_> = log.at(label).collect();
        if at.len() < 2 {
            continue;
        }

        compared = compared.saturating_add(1);
        mismatches.extend(disagreements(at));
    }

    if compared == 0 {
        return Verdict::skipped("fewer than two replicas to compare");
    }

    if mismatches.is_empty() {
        return Verdict::Pass;
    }

    let nodes: Vec<_> = mismatches
        .iter()
        .flat_map(|mismatch| [&mismatch.left.node_id, &mismatch.right.node_id])
        .unique()
        .collect();

    Verdict::Fail(Evidence {
        summary: format!(
            "{} replica pair(s) disagree after settling ({})",
            mismatches.len(),
            nodes.iter().join(", ")
        ),
        mismatches,
    })
}

/// Pairs of replicas that received different operations but already report
/// the same fingerprint before any synchronization.
///
/// These do not fail the run; they usually point at a scenario that cannot
/// tell replicas apart.
pub fn pre_sync_warnings(
    log: &FingerprintLog,
    label: &str,
    workloads: &BTreeMap<&str, Vec<&Operation>>,
) -> Vec<String> {
    let received = |node: &str| -> Vec<&Operation> {
        let mut ops = workloads.get(node).cloned().unwrap_or_default();
        ops.sort();
        ops
    };

    log.at(label)
        .tuple_combinations()
        .filter(|(left, right)| left == right)
        .filter(|(left, right)| received(left.node_id.as_str()) != received(right.node_id.as_str()))
        .map(|(left, right)| {
            format!(
                "replicas '{}' and '{}' received different operations but share fingerprint {} before sync",
                left.node_id, right.node_id, left.hash
            )
        })
        .collect()
}

/// Every replica must report the same fingerprint before and after the
/// repeated action.
pub fn verify_idempotence(before: &[Fingerprint], after: &[Fingerprint]) -> Verdict {
    let mut mismatches = Vec::new();
    let mut compared = 0_usize;

    for first in before {
        let Some(second) = after.iter().find(|second| second.node_id == first.node_id) else {
            continue;
        };

        compared = compared.saturating_add(1);

        if first != second {
            mismatches.push(Mismatch {
                left: first.clone(),
                right: second.clone(),
            });
        }
    }

    if compared == 0 {
        return Verdict::skipped("no replica was captured on both sides of the repeat");
    }

    if mismatches.is_empty() {
        return Verdict::Pass;
    }

    Verdict::Fail(Evidence {
        summary: format!(
            "repeating an applied sync changed {} replica(s): {}",
            mismatches.len(),
            mismatches
                .iter()
                .map(|mismatch| &mismatch.left.node_id)
                .join(", ")
        ),
        mismatches,
    })
}

/// Final fingerprints of one operation ordering.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderingResult {
    pub ordering: Vec<usize>,
    pub fingerprints: Vec<Fingerprint>,
}

/// Each ordering must converge on its own, and all orderings must end in the
/// same state.
pub fn verify_commutativity(results: &[OrderingResult]) -> Verdict {
    if results.len() < 2 {
        return Verdict::skipped("needs at least two orderings");
    }

    for result in results {
        let mismatches = disagreements(&result.fingerprints);
        if !mismatches.is_empty() {
            return Verdict::Fail(Evidence {
                summary: format!(
                    "ordering {:?} did not converge, so orderings cannot be compared",
                    result.ordering
                ),
                mismatches,
            });
        }
    }

    let finals: Vec<_> = results
        .iter()
        .filter_map(|result| result.fingerprints.first())
        .collect();

    if finals.len() < 2 {
        return Verdict::skipped("orderings produced no fingerprints");
    }

    let mismatches = disagreements(finals);
    if mismatches.is_empty() {
        return Verdict::Pass;
    }

    Verdict::Fail(Evidence {
        summary: format!(
            "{} pair(s) of orderings ended in different states",
            mismatches.len()
        ),
        mismatches,
    })
}
