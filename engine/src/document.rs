//! The shared document.
//!
//! One JSON object shared by every writer. Fields the engine reasons about
//! (points, penalty records, periodic penalty keys, history, sync metadata)
//! are typed; task and bounty state is carried as opaque JSON so unknown
//! shapes survive a round trip untouched.

use crate::{error::Result, Error, HistoryEntry, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Top-level fields merged with the shallow first-writer-wins strategy.
pub const STRUCTURAL_FIELDS: [&str; 8] = [
    "bounties",
    "taskPool",
    "dailyTasks",
    "taskStreaks",
    "stats",
    "starLevels",
    "taskSlots",
    "systemBountyWeekly",
];

/// Users present in a freshly created document.
pub const DEFAULT_USERS: [&str; 2] = ["user77", "user11"];

/// Task slots every user starts with.
const DEFAULT_TASK_SLOTS: u64 = 3;

/// Point totals for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Points {
    /// All-time total, never below zero
    #[serde(deserialize_with = "lenient::non_negative")]
    pub total: u64,
    /// Points earned this week (reset outside the engine)
    #[serde(deserialize_with = "lenient::signed")]
    pub weekly: i64,
}

impl Points {
    pub fn new(total: u64, weekly: i64) -> Self {
        Self { total, weekly }
    }
}

/// Daily penalty bookkeeping for one user.
///
/// `last_check_date` is the causality marker used during merges: a record
/// with a strictly later date describes a later settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PenaltyRecord {
    /// Consecutive days below target
    #[serde(deserialize_with = "lenient::count")]
    pub streak: u32,
    /// Date (`YYYY-MM-DD`) of the last settlement
    pub last_check_date: Option<String>,
}

impl PenaltyRecord {
    pub fn new(streak: u32, last_check_date: Option<&str>) -> Self {
        Self {
            streak,
            last_check_date: last_check_date.map(str::to_string),
        }
    }
}

/// Sync metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemInfo {
    /// Timestamp of the last successful write-back
    pub last_sync: Option<String>,
    /// Anything else clients keep here (version, week start, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The shared document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Document {
    pub points: BTreeMap<UserId, Points>,
    pub penalty: BTreeMap<UserId, PenaltyRecord>,
    /// Applied periodic penalties: `{scope}_{taskId}_{periodId}` -> date applied
    pub periodic_penalty: BTreeMap<String, String>,
    #[serde(deserialize_with = "lenient::sequence")]
    pub history: Vec<HistoryEntry>,
    pub system: SystemInfo,
    /// Structural and unknown top-level fields, kept as raw JSON
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    /// Create the default document for the given users.
    pub fn with_users<S: AsRef<str>>(users: &[S]) -> Self {
        let mut doc = Self::default();

        let mut daily_tasks = Map::new();
        let mut task_streaks = Map::new();
        let mut stats = Map::new();
        let mut star_levels = Map::new();
        let mut task_slots = Map::new();
        let mut bounty_weekly = Map::new();

        for user in users {
            let user = user.as_ref();
            doc.points.insert(user.to_string(), Points::default());
            doc.penalty.insert(user.to_string(), PenaltyRecord::default());

            daily_tasks.insert(
                user.to_string(),
                json!({"slots": [], "completed": 0, "lastDate": null}),
            );
            task_streaks.insert(user.to_string(), json!({}));
            stats.insert(
                user.to_string(),
                json!({"weeklyTasks": 0, "weeklyBounties": 0, "weekStart": null}),
            );
            star_levels.insert(user.to_string(), json!(0));
            task_slots.insert(user.to_string(), json!(DEFAULT_TASK_SLOTS));
            bounty_weekly.insert(user.to_string(), json!({"count": 0, "weekStart": null}));
        }

        doc.set_field("bounties", json!([]));
        doc.set_field("taskPool", json!([]));
        doc.set_field("dailyTasks", Value::Object(daily_tasks));
        doc.set_field("taskStreaks", Value::Object(task_streaks));
        doc.set_field("stats", Value::Object(stats));
        doc.set_field("starLevels", Value::Object(star_levels));
        doc.set_field("taskSlots", Value::Object(task_slots));
        doc.set_field("systemBountyWeekly", Value::Object(bounty_weekly));

        doc
    }

    /// Decode a document from raw JSON.
    ///
    /// Anything but a JSON object is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidDocument("expected a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidDocument(e.to_string()))
    }

    /// Decode a possibly partial document, filling gaps from the default
    /// document for `users`.
    ///
    /// Objects are merged recursively; arrays and scalars from `value` win.
    pub fn from_value_with_defaults<S: AsRef<str>>(value: Value, users: &[S]) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidDocument("expected a JSON object".into()));
        }
        let mut base = Self::with_users(users).to_value()?;
        deep_merge(&mut base, value);
        Self::from_value(base)
    }

    /// Fill any fields missing from this document with defaults.
    pub fn normalized<S: AsRef<str>>(self, users: &[S]) -> Result<Self> {
        Self::from_value_with_defaults(self.to_value()?, users)
    }

    /// Encode as raw JSON.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::InvalidDocument(e.to_string()))
    }

    /// Get an opaque top-level field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set an opaque top-level field.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Points for a user, zero if the user has none yet.
    pub fn points_of(&self, user: &str) -> Points {
        self.points.get(user).copied().unwrap_or_default()
    }

    /// Timestamp of the last write-back.
    pub fn last_sync(&self) -> Option<&str> {
        self.system.last_sync.as_deref()
    }

    /// Record a write-back.
    pub fn stamp_sync(&mut self, at: impl Into<String>) {
        self.system.last_sync = Some(at.into());
    }

    /// Every user that has points or a penalty record.
    pub fn users(&self) -> BTreeSet<&str> {
        self.points
            .keys()
            .chain(self.penalty.keys())
            .map(String::as_str)
            .collect()
    }
}

/// True when a JSON value carries no information.
pub(crate) fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Merge `overlay` into `base`: objects recursively, everything else replaced.
pub(crate) fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Tolerant decoders for data written by loosely typed clients.
///
/// Totals may arrive as floats, lists may arrive as index-keyed objects,
/// and ids may arrive as numbers.
pub(crate) mod lenient {
    use serde::{de::DeserializeOwned, Deserialize, Deserializer};
    use serde_json::Value;

    fn integer(value: &Value) -> Option<i64> {
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f.round() as i64))
    }

    pub fn non_negative<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value
            .as_u64()
            .or_else(|| integer(&value).map(|n| n.max(0) as u64))
            .unwrap_or(0))
    }

    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(integer(&value).map_or(0, |n| n.clamp(0, i64::from(u32::MAX)) as u32))
    }

    pub fn signed<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(integer(&value).unwrap_or(0))
    }

    pub fn optional_signed<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(integer(&value))
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        })
    }

    /// Decode a list, skipping items that do not fit `T`.
    pub fn sequence<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let items = match Value::deserialize(d)? {
            Value::Array(items) => items,
            Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
            _ => Vec::new(),
        };
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }
}
