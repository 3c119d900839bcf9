//! # Tally Engine
//!
//! Deterministic replication and conflict resolution for one shared points
//! document.
//!
//! Two interactive clients and one scheduled batch worker read and write the
//! same JSON document without any locking. This crate holds every rule that
//! decides what survives when their copies diverge; the same inputs always
//! produce the same merged document.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, network or the clock
//! - **Deterministic**: timestamps and dates are always arguments
//! - **Testable**: pure logic, persistence is injected
//!
//! ## Core Concepts
//!
//! ### Document
//!
//! [`Document`] types the fields the engine reasons about (points, penalty
//! records, periodic penalty keys, history, sync metadata) and keeps every
//! other field as raw JSON.
//!
//! ### Local Replica
//!
//! [`LocalReplica`] is a client's copy: path based reads and writes, a
//! modified flag, a revision counter and change notification. Storage is
//! injected through [`LocalPersistence`].
//!
//! ### Merging
//!
//! - [`detect`] compares point totals and builds a [`ConflictReport`]
//! - [`Reconciler`] merges two snapshots field by field
//! - [`merge_history`] unions history logs by entry id
//!
//! A penalty record with a later `lastCheckDate` is causally newer: its point
//! total wins even when it is lower, so deductions are never undone by a
//! stale client.
//!
//! ### Penalties
//!
//! [`PenaltyPlanner`] computes daily and periodic penalties and the minimal
//! sub-path patch to write back. Markers stored in the document make every
//! run idempotent.
//!
//! ## Quick Start
//!
//! ```rust
//! use tally_engine::{Document, Points, PenaltyRecord, Reconciler};
//!
//! let mut local = Document::with_users(&["user77"]);
//! local.points.insert("user77".into(), Points::new(100, 0));
//! local.penalty.insert("user77".into(), PenaltyRecord::new(0, Some("2024-01-01")));
//!
//! // The batch worker deducted 3 points the next day
//! let mut remote = local.clone();
//! remote.points.insert("user77".into(), Points::new(97, 0));
//! remote.penalty.insert("user77".into(), PenaltyRecord::new(1, Some("2024-01-02")));
//!
//! let merged = Reconciler::default().merge(&local, &remote, "2024-01-02T16:00:00.000Z");
//! assert_eq!(merged.document.points_of("user77").total, 97);
//! ```

pub mod conflict;
pub mod document;
pub mod error;
pub mod history;
pub mod penalty;
pub mod reconcile;
pub mod replica;

// Re-export main types at crate root
pub use conflict::{
    detect, ConflictDetail, ConflictPrompt, ConflictReport, DocumentSummary, Resolution,
};
pub use document::{Document, PenaltyRecord, Points, SystemInfo, DEFAULT_USERS, STRUCTURAL_FIELDS};
pub use error::Error;
pub use history::{
    is_newer, merge_history, merge_history_capped, timestamp_millis, HistoryEntry, MAX_HISTORY,
};
pub use penalty::{
    AppliedPenalty, DailyOutcome, PathPatch, PenaltyKind, PenaltyPlan, PenaltyPlanner,
    PenaltyRules, PenaltyRun, PeriodScope,
};
pub use reconcile::{MergeResult, MergeStrategy, Reconciler, Side};
pub use replica::{ChangeKind, LocalPersistence, LocalReplica, MemoryPersistence};

/// Type aliases for clarity
pub type UserId = String;
pub type Timestamp = String;
