//! Penalty planning for the scheduled batch worker.
//!
//! The planner is pure: it takes the document as read from the remote side,
//! the run parameters and an id generator, and returns the updated document
//! together with the minimal set of sub-path writes. The worker performs the
//! single read and the single partial write around it.
//!
//! Idempotency comes from markers stored in the document itself:
//! `penalty[user].lastCheckDate` for the daily check and a key in
//! `periodicPenalty` for every `(scope, task, period)` already settled.

use crate::{
    document::lenient, error::Result, history::prepend, Document, Error, HistoryEntry,
    PenaltyRecord, Timestamp, UserId, MAX_HISTORY,
};
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Sub-path writes, `/`-separated and relative to the document root.
pub type PathPatch = BTreeMap<String, Value>;

/// Penalty constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PenaltyRules {
    /// Tasks a user must complete per day
    pub min_tasks: u32,
    /// Points per missing task before the streak multiplier
    pub points_per_miss: u64,
    /// Upper bound for one daily deduction
    pub max_daily_penalty: u64,
    pub week_penalty: u64,
    pub month_penalty: u64,
    pub year_penalty: u64,
    pub history_cap: usize,
}

impl Default for PenaltyRules {
    fn default() -> Self {
        Self {
            min_tasks: 3,
            points_per_miss: 3,
            max_daily_penalty: 100,
            week_penalty: 10,
            month_penalty: 30,
            year_penalty: 70,
            history_cap: MAX_HISTORY,
        }
    }
}

impl PenaltyRules {
    /// Daily deduction for `completed` tasks after `streak` failed days.
    ///
    /// `min(missed * points_per_miss * 2^streak, max_daily_penalty)`
    pub fn daily_penalty(&self, completed: u32, streak: u32) -> u64 {
        if completed >= self.min_tasks {
            return 0;
        }
        let missed = u64::from(self.min_tasks - completed);
        let base = missed.saturating_mul(self.points_per_miss);
        let multiplier = 2u64.checked_pow(streak).unwrap_or(u64::MAX);
        base.saturating_mul(multiplier).min(self.max_daily_penalty)
    }

    /// Deduction for an unfinished task of the given scope.
    pub fn periodic_penalty(&self, scope: PeriodScope) -> u64 {
        match scope {
            PeriodScope::Week => self.week_penalty,
            PeriodScope::Month => self.month_penalty,
            PeriodScope::Year => self.year_penalty,
        }
    }
}

/// Period of a recurring bounty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodScope {
    Week,
    Month,
    Year,
}

impl PeriodScope {
    pub const ALL: [PeriodScope; 3] = [PeriodScope::Week, PeriodScope::Month, PeriodScope::Year];

    pub fn as_str(self) -> &'static str {
        match self {
            PeriodScope::Week => "week",
            PeriodScope::Month => "month",
            PeriodScope::Year => "year",
        }
    }

    /// Whether `date` is the last day of its period.
    ///
    /// Weeks end on Sunday.
    pub fn is_boundary(self, date: NaiveDate) -> bool {
        match self {
            PeriodScope::Week => date.weekday() == Weekday::Sun,
            PeriodScope::Month => date.succ_opt().is_some_and(|next| next.day() == 1),
            PeriodScope::Year => date.month() == 12 && date.day() == 31,
        }
    }

    /// Identifier of the period containing `date`.
    ///
    /// Weeks are counted from January 1st shifted by its weekday, so the id
    /// matches what the web clients compute (`2024-W2`). Months are
    /// `YYYY-MM`, years `YYYY`.
    pub fn period_id(self, date: NaiveDate) -> String {
        match self {
            PeriodScope::Week => {
                let jan1_offset = NaiveDate::from_ymd_opt(date.year(), 1, 1)
                    .map_or(0, |jan1| jan1.weekday().num_days_from_sunday());
                let week = (date.ordinal0() + jan1_offset + 1) / 7 + 1;
                format!("{}-W{}", date.year(), week)
            }
            PeriodScope::Month => format!("{}-{:02}", date.year(), date.month()),
            PeriodScope::Year => date.year().to_string(),
        }
    }

    /// Key recording that `task` was settled for `period`.
    pub fn key(self, task: &str, period: &str) -> String {
        format!("{}_{}_{}", self.as_str(), task, period)
    }

    fn title(self) -> &'static str {
        match self {
            PeriodScope::Week => "Weekly task missed",
            PeriodScope::Month => "Monthly task missed",
            PeriodScope::Year => "Yearly task missed",
        }
    }
}

impl fmt::Display for PeriodScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyRun {
    /// Calendar date in the configured time zone
    pub today: NaiveDate,
    /// Wall clock time for history entries and `system.lastSync`
    pub now: Timestamp,
    /// Ignore the already-settled markers and every period boundary
    pub force: bool,
}

impl PenaltyRun {
    pub fn new(today: NaiveDate, now: impl Into<Timestamp>) -> Self {
        Self {
            today,
            now: now.into(),
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    fn today_str(&self) -> String {
        self.today.format("%Y-%m-%d").to_string()
    }
}

/// Result of the daily check for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum DailyOutcome {
    /// Already checked today
    AlreadySettled,
    /// Target met, streak reset
    Safe,
    /// Target missed, `points` is what was actually deducted
    Penalized { points: u64, streak: u32 },
}

/// Why a deduction was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PenaltyKind {
    Daily { completed: u32, streak: u32 },
    Periodic { scope: PeriodScope, task: String, key: String },
}

/// One deduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedPenalty {
    pub user: UserId,
    pub points: u64,
    pub kind: PenaltyKind,
}

/// Planned changes of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyPlan {
    /// The document after the run
    pub document: Document,
    /// Sub-path writes to send; empty when nothing changed
    pub patch: PathPatch,
    pub daily: BTreeMap<UserId, DailyOutcome>,
    pub applied: Vec<AppliedPenalty>,
}

impl PenaltyPlan {
    pub fn is_empty(&self) -> bool {
        self.patch.is_empty()
    }

    /// Sum of every deduction.
    pub fn total_deducted(&self) -> u64 {
        self.applied.iter().map(|p| p.points).sum()
    }
}

/// Lenient view of one bounty.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Bounty {
    #[serde(deserialize_with = "lenient::string")]
    id: String,
    #[serde(deserialize_with = "lenient::string")]
    title: String,
    #[serde(deserialize_with = "lenient::string")]
    period: String,
    #[serde(deserialize_with = "lenient::string")]
    status: String,
    #[serde(deserialize_with = "lenient::string")]
    assignee: String,
}

impl Bounty {
    fn is_open(&self, scope: PeriodScope) -> bool {
        !self.id.is_empty() && self.period == scope.as_str() && self.status != "settled"
    }
}

/// Plans daily and periodic penalties.
#[derive(Debug, Clone)]
pub struct PenaltyPlanner {
    rules: PenaltyRules,
    users: Vec<UserId>,
}

impl PenaltyPlanner {
    pub fn new(rules: PenaltyRules, users: Vec<UserId>) -> Self {
        Self { rules, users }
    }

    pub fn rules(&self) -> &PenaltyRules {
        &self.rules
    }

    pub fn users(&self) -> &[UserId] {
        &self.users
    }

    /// Plan one run against `document`.
    ///
    /// `next_id` is called with a prefix (`penalty`, `periodic`) for every
    /// new history entry and must return a unique id.
    ///
    /// Fails only if a patched value cannot be encoded; nothing is half
    /// planned in that case.
    pub fn plan(
        &self,
        document: &Document,
        run: &PenaltyRun,
        next_id: &mut dyn FnMut(&str) -> String,
    ) -> Result<PenaltyPlan> {
        let mut doc = document.clone();
        let mut patch = PathPatch::new();
        let mut daily = BTreeMap::new();
        let mut applied = Vec::new();
        let mut fresh = Vec::new();
        let today = run.today_str();

        for user in &self.users {
            let outcome = self.check_daily(&mut doc, user, run, &today);
            match outcome {
                DailyOutcome::AlreadySettled => {}
                DailyOutcome::Safe => {
                    patch_penalty(&mut patch, &doc, user)?;
                }
                DailyOutcome::Penalized { points, streak } => {
                    patch_penalty(&mut patch, &doc, user)?;
                    patch_points(&mut patch, &doc, user)?;
                    let completed = self.completed_today(document, user, &today);
                    fresh.push(
                        HistoryEntry::new(next_id("penalty"), run.now.clone(), "penalty")
                            .with_points(user.clone(), -signed(points))
                            .with_extra("action", "deduct")
                            .with_extra("title", "Daily penalty (auto)")
                            .with_extra(
                                "detail",
                                format!(
                                    "{user} completed {completed}/{} tasks, day {streak} below target",
                                    self.rules.min_tasks
                                ),
                            ),
                    );
                    applied.push(AppliedPenalty {
                        user: user.clone(),
                        points,
                        kind: PenaltyKind::Daily { completed, streak },
                    });
                }
            }
            daily.insert(user.clone(), outcome);
        }

        let bounties = open_bounties(document);
        for scope in PeriodScope::ALL {
            if !(run.force || scope.is_boundary(run.today)) {
                continue;
            }
            let period = scope.period_id(run.today);
            let penalty = self.rules.periodic_penalty(scope);

            for bounty in bounties.iter().filter(|b| b.is_open(scope)) {
                let key = scope.key(&bounty.id, &period);
                if !run.force && doc.periodic_penalty.contains_key(&key) {
                    continue;
                }

                let targets: Vec<UserId> = if bounty.assignee.is_empty() {
                    self.users.clone()
                } else {
                    vec![bounty.assignee.clone()]
                };
                for user in targets {
                    let deducted = deduct(&mut doc, &user, penalty);
                    patch_points(&mut patch, &doc, &user)?;
                    let detail = if bounty.assignee.is_empty() {
                        format!("\"{}\" was unassigned, {user} penalized", bounty.title)
                    } else {
                        format!("{user} did not finish \"{}\"", bounty.title)
                    };
                    fresh.push(
                        HistoryEntry::new(next_id("periodic"), run.now.clone(), "penalty")
                            .with_points(user.clone(), -signed(deducted))
                            .with_extra("action", "periodic")
                            .with_extra("title", scope.title())
                            .with_extra("detail", detail),
                    );
                    applied.push(AppliedPenalty {
                        user,
                        points: deducted,
                        kind: PenaltyKind::Periodic {
                            scope,
                            task: bounty.id.clone(),
                            key: key.clone(),
                        },
                    });
                }

                doc.periodic_penalty.insert(key.clone(), today.clone());
                patch.insert(format!("periodicPenalty/{key}"), Value::String(today.clone()));
            }
        }

        if !fresh.is_empty() {
            // Latest entry first
            fresh.reverse();
            prepend(&mut doc.history, fresh, self.rules.history_cap);
            patch.insert("history".into(), encode(&doc.history)?);
        }

        // Every write advances the remote lastSync
        if !patch.is_empty() {
            doc.stamp_sync(run.now.clone());
            patch.insert("system/lastSync".into(), Value::String(run.now.clone()));
        }

        Ok(PenaltyPlan {
            document: doc,
            patch,
            daily,
            applied,
        })
    }

    fn check_daily(
        &self,
        doc: &mut Document,
        user: &str,
        run: &PenaltyRun,
        today: &str,
    ) -> DailyOutcome {
        let record = doc.penalty.get(user).cloned().unwrap_or_default();
        if !run.force && record.last_check_date.as_deref() == Some(today) {
            return DailyOutcome::AlreadySettled;
        }

        let completed = self.completed_today(doc, user, today);
        if completed >= self.rules.min_tasks {
            doc.penalty
                .insert(user.to_string(), PenaltyRecord::new(0, Some(today)));
            return DailyOutcome::Safe;
        }

        let penalty = self.rules.daily_penalty(completed, record.streak);
        let streak = record.streak.saturating_add(1);
        let points = deduct(doc, user, penalty);
        doc.penalty
            .insert(user.to_string(), PenaltyRecord::new(streak, Some(today)));
        DailyOutcome::Penalized { points, streak }
    }

    /// Completed slots in `dailyTasks[user]`, zero unless they are today's.
    fn completed_today(&self, doc: &Document, user: &str, today: &str) -> u32 {
        let Some(tasks) = doc.field("dailyTasks").and_then(|t| t.get(user)) else {
            return 0;
        };
        if tasks.get("lastDate").and_then(Value::as_str) != Some(today) {
            return 0;
        }
        let slots: Vec<&Value> = match tasks.get("slots") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(Value::Object(map)) => map.values().collect(),
            _ => Vec::new(),
        };
        let done = slots
            .into_iter()
            .filter(|slot| slot.get("completed").is_some_and(truthy))
            .count();
        u32::try_from(done).unwrap_or(u32::MAX)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn open_bounties(doc: &Document) -> Vec<Bounty> {
    doc.field("bounties")
        .cloned()
        .map(|value| lenient::sequence::<_, Bounty>(value).unwrap_or_default())
        .unwrap_or_default()
}

/// Deduct up to `points`, flooring the total at zero.
///
/// Returns the amount actually taken.
fn deduct(doc: &mut Document, user: &str, points: u64) -> u64 {
    let entry = doc.points.entry(user.to_string()).or_default();
    let before = entry.total;
    entry.total = before.saturating_sub(points);
    before - entry.total
}

fn signed(points: u64) -> i64 {
    i64::try_from(points).unwrap_or(i64::MAX)
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::InvalidDocument(e.to_string()))
}

fn patch_points(patch: &mut PathPatch, doc: &Document, user: &str) -> Result<()> {
    patch.insert(format!("points/{user}"), encode(&doc.points_of(user))?);
    Ok(())
}

fn patch_penalty(patch: &mut PathPatch, doc: &Document, user: &str) -> Result<()> {
    let record = doc.penalty.get(user).cloned().unwrap_or_default();
    patch.insert(format!("penalty/{user}"), encode(&record)?);
    Ok(())
}
