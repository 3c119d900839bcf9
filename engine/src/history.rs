//! History log merging.
//!
//! Every writer appends entries with a globally unique `id`. Merging two
//! logs keeps each id once, orders newest first and keeps at most
//! [`MAX_HISTORY`] entries.
//!
//! # Algorithm
//!
//! 1. Insert remote entries whose id has not been seen (remote may carry
//!    entries written by the batch worker that the local side never saw)
//! 2. Insert local entries whose id has not been seen
//! 3. Sort by `time` descending, ties broken by id
//! 4. Truncate to the cap

use crate::{document::lenient, Timestamp, UserId};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Maximum number of retained history entries.
pub const MAX_HISTORY: usize = 500;

/// One entry of the shared history log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryEntry {
    /// Globally unique identifier
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
    /// RFC 3339 timestamp
    #[serde(deserialize_with = "lenient::string")]
    pub time: Timestamp,
    /// Entry category (`penalty`, `bounty`, `system`, ...)
    #[serde(rename = "type", deserialize_with = "lenient::string")]
    pub kind: String,
    /// Signed point change
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::optional_signed"
    )]
    pub points: Option<i64>,
    /// Affected user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserId>,
    /// Presentation fields (`title`, `detail`, `action`, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl HistoryEntry {
    /// Create an entry with the given id, time and kind.
    pub fn new(id: impl Into<String>, time: impl Into<Timestamp>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            time: time.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Attach a point change for a user.
    pub fn with_points(mut self, user: impl Into<UserId>, points: i64) -> Self {
        self.user = Some(user.into());
        self.points = Some(points);
        self
    }

    /// Attach a presentation field.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Milliseconds since the epoch for an RFC 3339 timestamp.
pub fn timestamp_millis(ts: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.timestamp_millis())
}

/// True if `candidate` is strictly later than `than`.
///
/// Parsed instants are compared when both sides parse, raw strings otherwise.
pub fn is_newer(candidate: &str, than: Option<&str>) -> bool {
    let Some(than) = than else {
        return true;
    };
    match (timestamp_millis(candidate), timestamp_millis(than)) {
        (Some(a), Some(b)) => a > b,
        _ => candidate > than,
    }
}

/// Merge two history logs, capped at [`MAX_HISTORY`].
pub fn merge_history(local: &[HistoryEntry], remote: &[HistoryEntry]) -> Vec<HistoryEntry> {
    merge_history_capped(local, remote, MAX_HISTORY)
}

/// Merge two history logs with an explicit cap.
///
/// Entries without an id cannot be deduplicated and are dropped.
pub fn merge_history_capped(
    local: &[HistoryEntry],
    remote: &[HistoryEntry],
    cap: usize,
) -> Vec<HistoryEntry> {
    let mut seen = HashSet::with_capacity(local.len() + remote.len());
    let mut merged = Vec::with_capacity(local.len() + remote.len());
    for entry in remote.iter().chain(local) {
        if !entry.id.is_empty() && seen.insert(entry.id.as_str()) {
            merged.push(entry.clone());
        }
    }

    sort_newest_first(&mut merged);
    merged.truncate(cap);
    merged
}

/// Put fresh entries in front of an existing log and enforce the cap.
pub fn prepend(history: &mut Vec<HistoryEntry>, fresh: Vec<HistoryEntry>, cap: usize) {
    if fresh.is_empty() {
        return;
    }
    let mut combined = fresh;
    combined.append(history);
    combined.truncate(cap);
    *history = combined;
}

fn sort_newest_first(entries: &mut [HistoryEntry]) {
    // Unparseable times sort as oldest
    entries.sort_by_cached_key(|entry| {
        (
            std::cmp::Reverse(timestamp_millis(&entry.time)),
            entry.id.clone(),
        )
    });
}
