//! Conflict detection between a local and a remote snapshot.
//!
//! Only a differing `points.total` is a conflict worth asking a human about.
//! Weekly totals are reported for visibility but never raise the flag.

use crate::{Document, Points, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single differing field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail {
    /// Dotted path of the field, e.g. `points.user77.total`
    pub field: String,
    pub local: i64,
    pub remote: i64,
    /// `local - remote`
    pub diff: i64,
}

/// Outcome of comparing two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    /// True iff any user's total differs
    pub has_conflict: bool,
    /// Per-user conflict flag
    pub per_user: BTreeMap<UserId, bool>,
    /// Every differing total and weekly value
    pub details: Vec<ConflictDetail>,
}

impl ConflictReport {
    /// Details that caused the conflict flag.
    pub fn conflicting(&self) -> impl Iterator<Item = &ConflictDetail> {
        self.details.iter().filter(|d| d.field.ends_with(".total"))
    }
}

/// Compare point totals of two snapshots.
pub fn detect(local: &Document, remote: &Document) -> ConflictReport {
    let mut report = ConflictReport::default();

    let users: std::collections::BTreeSet<&str> = local
        .points
        .keys()
        .chain(remote.points.keys())
        .map(String::as_str)
        .collect();

    for user in users {
        let l = local.points_of(user);
        let r = remote.points_of(user);

        let total_differs = l.total != r.total;
        if total_differs {
            report.details.push(ConflictDetail {
                field: format!("points.{user}.total"),
                local: saturate(l.total),
                remote: saturate(r.total),
                diff: signed_diff(l.total, r.total),
            });
        }
        if l.weekly != r.weekly {
            report.details.push(ConflictDetail {
                field: format!("points.{user}.weekly"),
                local: l.weekly,
                remote: r.weekly,
                diff: l.weekly.saturating_sub(r.weekly),
            });
        }

        report.per_user.insert(user.to_string(), total_differs);
        report.has_conflict |= total_differs;
    }

    report
}

fn saturate(total: u64) -> i64 {
    i64::try_from(total).unwrap_or(i64::MAX)
}

/// `local - remote`, clamped to the `i64` range.
fn signed_diff(local: u64, remote: u64) -> i64 {
    let magnitude = saturate(local.abs_diff(remote));
    if local >= remote {
        magnitude
    } else {
        -magnitude
    }
}

/// How the user chose to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Push the local snapshot, overwriting the remote
    KeepLocal,
    /// Replace the local snapshot with the remote
    KeepRemote,
    /// Run the field reconciler
    Merge,
    /// Abandon this attempt, local stays dirty
    Cancel,
}

/// Short description of one side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub points: BTreeMap<UserId, Points>,
    pub history_len: usize,
    pub last_sync: Option<Timestamp>,
}

impl From<&Document> for DocumentSummary {
    fn from(doc: &Document) -> Self {
        Self {
            points: doc.points.clone(),
            history_len: doc.history.len(),
            last_sync: doc.system.last_sync.clone(),
        }
    }
}

/// Everything a decision maker needs to pick a [`Resolution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPrompt {
    pub local: DocumentSummary,
    pub remote: DocumentSummary,
    pub details: Vec<ConflictDetail>,
}

impl ConflictPrompt {
    pub fn new(local: &Document, remote: &Document, report: ConflictReport) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            details: report.details,
        }
    }
}
