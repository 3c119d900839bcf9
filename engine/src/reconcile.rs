//! Field-level reconciliation of a local and a remote snapshot.
//!
//! This is the core of determinism. Given the same two snapshots and merge
//! time, the merged document is always the same.
//!
//! # Rules
//!
//! 1. Points per user: a remote penalty record with a later `lastCheckDate`
//!    describes a deduction the local side has not seen, so the remote total
//!    and penalty record are adopted even when the total is lower. Without
//!    such an ordering, or without a remote total, both totals only ever
//!    grow, so the larger one wins.
//! 2. Structural fields: shallow first-writer-wins. Local keeps a field it
//!    already has; an empty local field takes the remote value.
//! 3. History: [`merge_history`].
//! 4. Periodic penalty keys: union, remote value on collision.
//! 5. `system.lastSync` is stamped with the merge time.

use crate::{
    document::is_empty_value, merge_history, Document, PenaltyRecord, Points, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How penalty markers are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    /// Remote wins only with a strictly later marker (default)
    #[default]
    StrictlyNewer,
    /// Remote also wins when markers are equal
    NewerOrEqual,
}

impl MergeStrategy {
    /// Whether the remote penalty marker takes precedence over the local one.
    ///
    /// A missing marker is older than any date.
    pub fn remote_takes_precedence(self, local: Option<&str>, remote: Option<&str>) -> bool {
        match self {
            MergeStrategy::StrictlyNewer => remote > local,
            MergeStrategy::NewerOrEqual => remote.is_some() && remote >= local,
        }
    }
}

/// Which side supplied a merged value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Local,
    Remote,
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    /// The merged snapshot
    pub document: Document,
    /// Users whose totals came from a later remote penalty record
    pub penalty_precedence: Vec<UserId>,
    /// Structural fields taken from the remote side
    pub remote_fields: Vec<String>,
}

/// Merges two snapshots of the shared document.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    strategy: MergeStrategy,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(strategy: MergeStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Merge `local` and `remote`, stamping `system.lastSync` with `now`.
    pub fn merge(&self, local: &Document, remote: &Document, now: &str) -> MergeResult {
        let mut merged = local.clone();
        let mut penalty_precedence = Vec::new();

        // 1. Points and penalty records
        let users: BTreeSet<&str> = local.users().into_iter().chain(remote.users()).collect();
        for user in users {
            if self.merge_user(user, local, remote, &mut merged) == Side::Remote {
                penalty_precedence.push(user.to_string());
            }
        }

        // 2. Structural fields
        let remote_fields = merge_structural(&mut merged, remote);

        // 3. History
        merged.history = merge_history(&local.history, &remote.history);

        // 4. Periodic penalty keys
        for (key, applied) in &remote.periodic_penalty {
            merged
                .periodic_penalty
                .insert(key.clone(), applied.clone());
        }

        // 5. System metadata
        for (key, value) in &remote.system.extra {
            merged
                .system
                .extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged.stamp_sync(now);

        MergeResult {
            document: merged,
            penalty_precedence,
            remote_fields,
        }
    }

    /// Merge one user's points and penalty record into `merged`.
    ///
    /// Returns which side decided the total.
    fn merge_user(
        &self,
        user: &str,
        local: &Document,
        remote: &Document,
        merged: &mut Document,
    ) -> Side {
        let local_penalty = local.penalty.get(user);
        let remote_penalty = remote.penalty.get(user);
        let local_points = local.points.get(user);
        let remote_points = remote.points.get(user);

        let local_marker = local_penalty.and_then(|p| p.last_check_date.as_deref());
        let remote_marker = remote_penalty.and_then(|p| p.last_check_date.as_deref());

        // A newer marker without a remote total settled nothing to adopt
        let settled_total = remote_points
            .filter(|_| {
                self.strategy
                    .remote_takes_precedence(local_marker, remote_marker)
            })
            .map(|p| p.total);

        if let Some(remote_total) = settled_total {
            let weekly = max_weekly(local_points, remote_points);
            merged
                .points
                .insert(user.to_string(), Points::new(remote_total, weekly));
            if let Some(record) = remote_penalty {
                merged.penalty.insert(user.to_string(), record.clone());
            }
            return Side::Remote;
        }

        if local_points.is_some() || remote_points.is_some() {
            let total = local_points
                .map(|p| p.total)
                .max(remote_points.map(|p| p.total))
                .unwrap_or_default();
            let weekly = max_weekly(local_points, remote_points);
            merged
                .points
                .insert(user.to_string(), Points::new(total, weekly));
        }

        let record = match (local_penalty, remote_penalty) {
            (Some(l), Some(r)) => Some(later_settlement(l, r)),
            (l, r) => l.or(r),
        };
        if let Some(record) = record.cloned() {
            merged.penalty.insert(user.to_string(), record);
        }

        Side::Local
    }
}

fn max_weekly(local: Option<&Points>, remote: Option<&Points>) -> i64 {
    match (local, remote) {
        (Some(l), Some(r)) => l.weekly.max(r.weekly),
        (Some(p), None) | (None, Some(p)) => p.weekly,
        (None, None) => 0,
    }
}

/// Shallow first-writer-wins over every opaque top-level field.
///
/// Nested structures (task pools, streaks) are never merged field by field.
fn merge_structural(merged: &mut Document, remote: &Document) -> Vec<String> {
    let mut taken = Vec::new();
    for (name, value) in &remote.fields {
        let local_has_value = merged.fields.get(name).is_some_and(|v| !is_empty_value(v));
        if !local_has_value && !is_empty_value(value) {
            merged.fields.insert(name.clone(), value.clone());
            taken.push(name.clone());
        }
    }
    taken
}

/// The record with the later settlement date; `a` wins ties.
fn later_settlement<'a>(a: &'a PenaltyRecord, b: &'a PenaltyRecord) -> &'a PenaltyRecord {
    if b.last_check_date > a.last_check_date {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HistoryEntry;
    use serde_json::json;

    const NOW: &str = "2024-01-03T00:00:00.000Z";

    fn doc(user: &str, total: u64, weekly: i64, checked: Option<&str>) -> Document {
        let mut doc = Document::default();
        doc.points.insert(user.into(), Points::new(total, weekly));
        doc.penalty
            .insert(user.into(), PenaltyRecord::new(0, checked));
        doc
    }

    #[test]
    fn newer_remote_penalty_wins_even_when_lower() {
        let local = doc("user77", 100, 10, Some("2024-01-01"));
        let mut remote = doc("user77", 97, 10, Some("2024-01-02"));
        remote.penalty.get_mut("user77").unwrap().streak = 1;

        let result = Reconciler::default().merge(&local, &remote, NOW);
        assert_eq!(result.document.points_of("user77").total, 97);
        assert_eq!(result.document.penalty["user77"].streak, 1);
        assert_eq!(result.penalty_precedence, vec!["user77".to_string()]);
    }

    #[test]
    fn newer_marker_without_remote_total_keeps_local_total() {
        let local = doc("user77", 100, 10, Some("2024-01-01"));
        let mut remote = Document::default();
        remote
            .penalty
            .insert("user77".into(), PenaltyRecord::new(1, Some("2024-01-02")));

        let result = Reconciler::default().merge(&local, &remote, NOW);
        assert_eq!(result.document.points_of("user77"), Points::new(100, 10));
        // The newer record is still carried over
        assert_eq!(result.document.penalty["user77"].streak, 1);
        assert!(result.penalty_precedence.is_empty());
    }

    #[test]
    fn equal_markers_take_the_maximum() {
        let local = doc("user77", 100, 10, Some("2024-01-02"));
        let remote = doc("user77", 97, 12, Some("2024-01-02"));

        let result = Reconciler::default().merge(&local, &remote, NOW);
        assert_eq!(result.document.points_of("user77"), Points::new(100, 12));
        assert!(result.penalty_precedence.is_empty());
    }

    #[test]
    fn newer_or_equal_strategy_prefers_remote_on_ties() {
        let local = doc("user77", 100, 10, Some("2024-01-02"));
        let remote = doc("user77", 97, 10, Some("2024-01-02"));

        let result = Reconciler::new(MergeStrategy::NewerOrEqual).merge(&local, &remote, NOW);
        assert_eq!(result.document.points_of("user77").total, 97);
    }

    #[test]
    fn older_remote_penalty_does_not_lower_total() {
        let local = doc("user77", 80, 0, Some("2024-01-02"));
        let remote = doc("user77", 90, 0, Some("2024-01-01"));

        let result = Reconciler::default().merge(&local, &remote, NOW);
        assert_eq!(result.document.points_of("user77").total, 90);
        assert_eq!(
            result.document.penalty["user77"].last_check_date.as_deref(),
            Some("2024-01-02")
        );
    }

    #[test]
    fn missing_local_marker_is_older_than_any_date() {
        let local = doc("user77", 100, 0, None);
        let remote = doc("user77", 91, 0, Some("2024-01-01"));

        let result = Reconciler::default().merge(&local, &remote, NOW);
        assert_eq!(result.document.points_of("user77").total, 91);
    }

    #[test]
    fn remote_only_user_is_added() {
        let local = doc("user77", 10, 0, None);
        let remote = doc("user11", 20, 5, None);

        let result = Reconciler::default().merge(&local, &remote, NOW);
        assert_eq!(result.document.points_of("user11"), Points::new(20, 5));
        assert_eq!(result.document.points_of("user77"), Points::new(10, 0));
    }

    #[test]
    fn structural_fields_first_writer_wins() {
        let mut local = Document::default();
        local.set_field("bounties", json!([{"id": "local"}]));
        local.set_field("taskPool", json!([]));

        let mut remote = Document::default();
        remote.set_field("bounties", json!([{"id": "remote"}]));
        remote.set_field("taskPool", json!([{"id": "t1"}]));
        remote.set_field("stats", json!({"user77": {"weeklyTasks": 2}}));

        let result = Reconciler::default().merge(&local, &remote, NOW);
        assert_eq!(result.document.field("bounties"), Some(&json!([{"id": "local"}])));
        assert_eq!(result.document.field("taskPool"), Some(&json!([{"id": "t1"}])));
        assert!(result.document.field("stats").is_some());
        assert_eq!(result.remote_fields, vec!["stats".to_string(), "taskPool".to_string()]);
    }

    #[test]
    fn history_and_keys_are_unioned() {
        let mut local = Document::default();
        local.history = vec![HistoryEntry::new("a", "2024-01-01T10:00:00Z", "bounty")];
        local
            .periodic_penalty
            .insert("week_b1_2024-W1".into(), "2024-01-07".into());

        let mut remote = Document::default();
        remote.history = vec![
            HistoryEntry::new("a", "2024-01-01T10:00:00Z", "bounty"),
            HistoryEntry::new("b", "2024-01-01T11:00:00Z", "penalty"),
        ];
        remote
            .periodic_penalty
            .insert("month_b2_2024-01".into(), "2024-01-31".into());

        let result = Reconciler::default().merge(&local, &remote, NOW);
        let ids: Vec<_> = result.document.history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(result.document.periodic_penalty.len(), 2);
    }

    #[test]
    fn merge_stamps_last_sync() {
        let local = Document::default();
        let mut remote = Document::default();
        remote.stamp_sync("2024-01-01T00:00:00Z");
        remote
            .system
            .extra
            .insert("version".into(), json!("3.0.0"));

        let result = Reconciler::default().merge(&local, &remote, NOW);
        assert_eq!(result.document.last_sync(), Some(NOW));
        assert_eq!(result.document.system.extra["version"], json!("3.0.0"));
    }

    #[test]
    fn merge_is_deterministic() {
        let local = doc("user77", 40, 3, Some("2024-01-01"));
        let remote = doc("user77", 45, 1, Some("2024-01-01"));

        let results: Vec<_> = (0..10)
            .map(|_| Reconciler::default().merge(&local, &remote, NOW).document)
            .collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn later_settlement_prefers_first_on_tie() {
        let a = PenaltyRecord::new(1, Some("2024-01-01"));
        let b = PenaltyRecord::new(2, Some("2024-01-01"));
        assert_eq!(later_settlement(&a, &b).streak, 1);
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        fn arb_points() -> impl Strategy<Value = BTreeMap<UserId, Points>> {
            prop::collection::btree_map(
                prop_oneof![Just("user77".to_string()), Just("user11".to_string())],
                (0u64..1000, -50i64..200).prop_map(|(total, weekly)| Points::new(total, weekly)),
                0..3,
            )
        }

        fn arb_history() -> impl Strategy<Value = Vec<HistoryEntry>> {
            prop::collection::btree_map(0u32..20, 0u32..60, 0..12).prop_map(|entries| {
                entries
                    .into_iter()
                    .map(|(id, minute)| {
                        HistoryEntry::new(
                            format!("h{id}"),
                            format!("2024-01-01T10:{minute:02}:00Z"),
                            "bounty",
                        )
                    })
                    .collect()
            })
        }

        fn with_points(points: BTreeMap<UserId, Points>) -> Document {
            let mut doc = Document::default();
            doc.points = points;
            doc
        }

        proptest! {
            #[test]
            fn prop_points_merge_commutative(a in arb_points(), b in arb_points()) {
                let a = with_points(a);
                let b = with_points(b);

                let ab = Reconciler::default().merge(&a, &b, NOW).document;
                let ba = Reconciler::default().merge(&b, &a, NOW).document;
                prop_assert_eq!(ab.points, ba.points);
            }

            #[test]
            fn prop_newer_penalty_total_wins(
                local_total in 0u64..1000,
                remote_total in 0u64..1000,
                local_day in 1u32..15,
                gap in 1u32..15,
            ) {
                let local = doc("user77", local_total, 0, Some(&format!("2024-01-{local_day:02}")));
                let remote = doc(
                    "user77",
                    remote_total,
                    0,
                    Some(&format!("2024-01-{:02}", local_day + gap)),
                );

                let merged = Reconciler::default().merge(&local, &remote, NOW).document;
                prop_assert_eq!(merged.points_of("user77").total, remote_total);
            }

            #[test]
            fn prop_merge_idempotent(
                a in arb_history(),
                b in arb_history(),
                pa in arb_points(),
                pb in arb_points(),
            ) {
                let mut local = with_points(pa);
                local.history = a;
                let mut remote = with_points(pb);
                remote.history = b;

                let reconciler = Reconciler::default();
                let once = reconciler.merge(&local, &remote, NOW).document;
                let twice = reconciler.merge(&once, &remote, NOW).document;
                prop_assert_eq!(&once, &twice);

                let mut ids: Vec<_> = once.history.iter().map(|e| e.id.as_str()).collect();
                let len = ids.len();
                ids.sort_unstable();
                ids.dedup();
                prop_assert_eq!(ids.len(), len);
            }
        }
    }
}
