//! The sync coordinator.
//!
//! Drives the push/pull cycle of one client: debounces local changes, pulls
//! the remote copy, detects conflicts, asks the decider when needed, merges
//! and pushes. At most one attempt runs at a time.

use super::{ConflictDecider, SyncConfig, SyncOutcome, SyncState};
use crate::error::{Result, SyncError};
use crate::remote::{with_timeout, RemoteStore};
use crate::time::now_timestamp;
use serde_json::Value;
use std::sync::Arc;
use tally_engine::{
    detect, is_newer, ConflictPrompt, Document, Error as EngineError, LocalReplica, Reconciler,
    Resolution, Timestamp,
};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};

/// A replica shared between the coordinator and the front end.
pub type SharedReplica = Arc<Mutex<LocalReplica>>;

/// What happened to a remote snapshot delivered outside a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// Echo of our own last upload
    OwnUpload,
    /// Not newer than the local copy
    Stale,
    /// Local replica replaced
    Applied,
    /// Local edits pending, a sync was scheduled instead
    Deferred,
}

/// Coordinates one local replica with the remote store.
pub struct SyncCoordinator<R, D> {
    replica: SharedReplica,
    remote: Arc<R>,
    decider: D,
    config: SyncConfig,
    reconciler: Reconciler,
    changes: Arc<Notify>,
    attempt: Mutex<()>,
    state: watch::Sender<SyncState>,
    last_upload: Mutex<Option<Timestamp>>,
}

impl<R: RemoteStore, D: ConflictDecider> SyncCoordinator<R, D> {
    /// Create a coordinator for `replica`.
    ///
    /// Every local change of the replica from now on schedules a sync.
    pub fn new(mut replica: LocalReplica, remote: R, decider: D, config: SyncConfig) -> Self {
        let changes = Arc::new(Notify::new());
        let notify = changes.clone();
        replica.subscribe(move |kind| {
            if kind.needs_push() {
                notify.notify_one();
            }
        });

        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            replica: Arc::new(Mutex::new(replica)),
            remote: Arc::new(remote),
            decider,
            reconciler: Reconciler::new(config.strategy),
            config,
            changes,
            attempt: Mutex::new(()),
            state,
            last_upload: Mutex::new(None),
        }
    }

    /// The replica, for reads and local writes.
    pub fn replica(&self) -> SharedReplica {
        self.replica.clone()
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Watch the coordinator state.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Run one sync attempt now.
    ///
    /// Fails with [`SyncError::InProgress`] if an attempt is already running.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        let Ok(_guard) = self.attempt.try_lock() else {
            return Err(SyncError::InProgress);
        };

        self.state.send_replace(SyncState::Syncing);
        let result = self.attempt().await;

        match &result {
            Ok(outcome) => {
                tracing::info!(?outcome, "Sync finished");
                self.state.send_replace(SyncState::Merged);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sync failed");
                self.state.send_replace(SyncState::Failed);
            }
        }
        result
    }

    async fn attempt(&self) -> Result<SyncOutcome> {
        let (local, revision, dirty, observed) = {
            let replica = self.replica.lock().await;
            (
                replica.snapshot(),
                replica.revision(),
                replica.is_locally_modified(),
                replica.last_observed_remote_sync().map(str::to_string),
            )
        };

        let Some(remote) = self.pull().await? else {
            tracing::info!("Remote document absent, pushing local copy");
            self.push_snapshot(local, revision).await?;
            return Ok(SyncOutcome::FirstPush);
        };

        let advanced = remote.last_sync() != observed.as_deref();

        if !dirty {
            if !advanced {
                return Ok(SyncOutcome::UpToDate);
            }
            return self.adopt_remote(remote, revision).await;
        }

        if !advanced {
            // Nobody wrote since our last sync
            self.push_snapshot(local, revision).await?;
            return Ok(SyncOutcome::FastForward);
        }

        let report = detect(&local, &remote);
        if report.has_conflict {
            tracing::info!(
                fields = ?report.conflicting().map(|d| d.field.as_str()).collect::<Vec<_>>(),
                "Conflicting point totals"
            );
            self.state.send_replace(SyncState::ConflictPending);

            let resolution = self
                .decider
                .decide(ConflictPrompt::new(&local, &remote, report))
                .await;
            tracing::info!(?resolution, "Conflict decided");

            match resolution {
                Resolution::Merge => {}
                Resolution::KeepLocal => {
                    self.push_snapshot(local, revision).await?;
                    return Ok(SyncOutcome::KeptLocal);
                }
                Resolution::KeepRemote => {
                    self.adopt_remote(remote, revision).await?;
                    return Ok(SyncOutcome::KeptRemote);
                }
                Resolution::Cancel => {
                    self.replica.lock().await.mark_dirty();
                    return Err(SyncError::ConflictUnresolved);
                }
            }
        }

        self.merge_and_push(&local, &remote, revision).await
    }

    async fn merge_and_push(
        &self,
        local: &Document,
        remote: &Document,
        revision: u64,
    ) -> Result<SyncOutcome> {
        let now = now_timestamp();
        let merged = self.reconciler.merge(local, remote, &now);
        if !merged.penalty_precedence.is_empty() {
            tracing::info!(users = ?merged.penalty_precedence, "Remote penalty took precedence");
        }

        let mut unsaved = None;
        let replaced = {
            let mut replica = self.replica.lock().await;
            match replica.replace_if_unchanged(merged.document.clone(), revision) {
                Ok(replaced) => replaced,
                // Replaced in memory; the upload still goes out
                Err(e @ EngineError::Persistence(_)) => {
                    tracing::warn!(error = %e, "Merged document not persisted locally");
                    unsaved = Some(e);
                    true
                }
                Err(e) => {
                    replica.mark_dirty();
                    return Err(e.into());
                }
            }
        };
        if !replaced {
            tracing::debug!("Local changes during sync, keeping them for the next cycle");
        }

        *self.last_upload.lock().await = Some(now.clone());
        let pushed = with_timeout(
            self.config.remote_timeout,
            self.remote.write_document(&merged.document),
        )
        .await;

        let mut replica = self.replica.lock().await;
        if let Err(e) = pushed {
            if replaced {
                replica.mark_dirty();
            }
            return Err(e.into());
        }
        if replaced {
            if let Err(e) = replica.record_push(revision, now) {
                unsaved.get_or_insert(e);
            }
        }
        if let Some(e) = unsaved {
            return Err(e.into());
        }

        Ok(SyncOutcome::Merged {
            penalty_precedence: merged.penalty_precedence,
            local_deferred: !replaced,
        })
    }

    /// Replace the local copy with `remote` unless local edits landed since
    /// `revision`.
    async fn adopt_remote(&self, remote: Document, revision: u64) -> Result<SyncOutcome> {
        let remote_sync = remote.system.last_sync.clone();
        let mut replica = self.replica.lock().await;
        match replica.replace_if_unchanged(remote, revision) {
            Ok(true) => replica.observe_remote_sync(remote_sync),
            Ok(false) => {}
            Err(e) => {
                if matches!(e, EngineError::Persistence(_)) {
                    replica.observe_remote_sync(remote_sync);
                }
                return Err(e.into());
            }
        }
        Ok(SyncOutcome::Pulled)
    }

    /// Push `document` verbatim, stamped with the current time.
    async fn push_snapshot(&self, mut document: Document, revision: u64) -> Result<()> {
        let now = now_timestamp();
        document.stamp_sync(now.clone());
        *self.last_upload.lock().await = Some(now.clone());

        with_timeout(
            self.config.remote_timeout,
            self.remote.write_document(&document),
        )
        .await?;

        self.replica.lock().await.record_push(revision, now)?;
        Ok(())
    }

    /// Read the remote copy. Malformed data is treated as absent.
    async fn pull(&self) -> Result<Option<Document>> {
        let value = with_timeout(self.config.remote_timeout, self.remote.read_document()).await?;
        Ok(value.and_then(|value| decode(value).ok()))
    }

    /// Handle a remote snapshot pushed to us by a change listener.
    pub async fn apply_remote_update(&self, value: Value) -> Result<RemoteUpdate> {
        let remote = decode(value)?;
        let Some(remote_sync) = remote.last_sync().map(str::to_string) else {
            return Ok(RemoteUpdate::Stale);
        };

        if self.last_upload.lock().await.as_deref() == Some(remote_sync.as_str()) {
            return Ok(RemoteUpdate::OwnUpload);
        }

        let Ok(_guard) = self.attempt.try_lock() else {
            // The running attempt may already hold older data
            self.changes.notify_one();
            return Ok(RemoteUpdate::Deferred);
        };

        let mut replica = self.replica.lock().await;
        if !is_newer(&remote_sync, replica.document().last_sync()) {
            return Ok(RemoteUpdate::Stale);
        }
        if replica.is_locally_modified() {
            self.changes.notify_one();
            return Ok(RemoteUpdate::Deferred);
        }

        replace_observed(&mut replica, remote, Some(remote_sync))?;
        tracing::info!("Applied remote update");
        Ok(RemoteUpdate::Applied)
    }

    /// Replace the local copy with the remote one, whatever is pending.
    pub async fn force_download(&self) -> Result<()> {
        let Ok(_guard) = self.attempt.try_lock() else {
            return Err(SyncError::InProgress);
        };

        let remote = self.pull().await?.ok_or(SyncError::RemoteAbsent)?;
        let remote_sync = remote.system.last_sync.clone();

        let mut replica = self.replica.lock().await;
        replace_observed(&mut replica, remote, remote_sync)?;
        tracing::info!("Forced download");
        Ok(())
    }

    /// Push the local copy verbatim, overwriting the remote one.
    ///
    /// Used after destructive admin actions such as clearing the history.
    pub async fn force_upload(&self) -> Result<()> {
        let Ok(_guard) = self.attempt.try_lock() else {
            return Err(SyncError::InProgress);
        };

        let (local, revision) = {
            let replica = self.replica.lock().await;
            (replica.snapshot(), replica.revision())
        };
        self.push_snapshot(local, revision).await?;
        tracing::info!("Forced upload");
        Ok(())
    }

    /// Best-effort write of pending local changes at teardown.
    ///
    /// The write is spawned and not awaited; there is no conflict detection.
    pub async fn flush_on_shutdown(&self) -> Option<JoinHandle<()>> {
        let mut document = {
            let replica = self.replica.lock().await;
            if !replica.is_locally_modified() {
                return None;
            }
            replica.snapshot()
        };
        document.stamp_sync(now_timestamp());

        let remote = self.remote.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = remote.write_document(&document).await {
                tracing::warn!(error = %e, "Shutdown flush failed");
            }
        }))
    }

    /// Sync loop: debounced local changes plus the periodic tick.
    ///
    /// Returns when `shutdown` changes or its sender is dropped, after
    /// spawning the teardown flush.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = self.config.auto_sync.map(|period| {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.changes.notified() => {
                    if !self.debounce(&mut shutdown).await {
                        break;
                    }
                    let _ = self.sync_now().await;
                }
                _ = tick(&mut ticker) => {
                    let _ = self.sync_now().await;
                }
            }
        }

        self.flush_on_shutdown().await;
    }

    /// Wait until no change arrived for the debounce period.
    ///
    /// Returns false on shutdown.
    async fn debounce(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            tokio::select! {
                _ = time::sleep(self.config.debounce) => return true,
                _ = self.changes.notified() => continue,
                _ = shutdown.changed() => return false,
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Replace the replica with a remote copy and remember its `lastSync`.
///
/// A failed local save still leaves the remote copy in memory, so it counts
/// as observed; the error is returned afterwards.
fn replace_observed(
    replica: &mut LocalReplica,
    remote: Document,
    remote_sync: Option<Timestamp>,
) -> Result<()> {
    let replaced = replica.replace(remote);
    if replaced.is_ok() || matches!(replaced, Err(EngineError::Persistence(_))) {
        replica.observe_remote_sync(remote_sync);
    }
    replaced.map_err(SyncError::from)
}

fn decode(value: Value) -> Result<Document> {
    Document::from_value(value).map_err(|e| {
        tracing::warn!(error = %e, "Malformed remote document");
        SyncError::MalformedRemoteData(e.to_string())
    })
}
