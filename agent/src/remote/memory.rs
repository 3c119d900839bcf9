//! In-process remote store with failure injection.

use super::{RemoteError, RemoteStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tally_engine::{Document, PathPatch};
use tokio::sync::Mutex;

/// Failure applied to the next remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Fail immediately
    Unavailable,
    /// Never complete
    Hang,
}

#[derive(Debug, Default)]
struct State {
    document: Option<Value>,
    fail_read: Option<FailureMode>,
    fail_write: Option<FailureMode>,
    read_delay: Option<Duration>,
    reads: usize,
    writes: usize,
    patches: usize,
}

/// Remote store keeping the document as a JSON tree in memory.
///
/// Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a stored document.
    pub fn with_document(document: Value) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                document: Some(document),
                ..State::default()
            })),
        }
    }

    pub async fn set_document(&self, document: Option<Value>) {
        self.state.lock().await.document = document;
    }

    pub async fn document(&self) -> Option<Value> {
        self.state.lock().await.document.clone()
    }

    /// The stored document decoded, if it decodes.
    pub async fn decoded(&self) -> Option<Document> {
        Document::from_value(self.document().await?).ok()
    }

    /// Fail the next read.
    pub async fn fail_next_read(&self, mode: FailureMode) {
        self.state.lock().await.fail_read = Some(mode);
    }

    /// Fail the next write, whole-document or multi-path.
    pub async fn fail_next_write(&self, mode: FailureMode) {
        self.state.lock().await.fail_write = Some(mode);
    }

    /// Delay every read, so that concurrent readers overlap.
    pub async fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.read_delay = delay;
    }

    pub async fn read_count(&self) -> usize {
        self.state.lock().await.reads
    }

    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn patch_count(&self) -> usize {
        self.state.lock().await.patches
    }

    async fn injected_failure(&self, write: bool) -> Result<(), RemoteError> {
        let mode = {
            let mut state = self.state.lock().await;
            if write {
                state.fail_write.take()
            } else {
                state.fail_read.take()
            }
        };
        match mode {
            None => Ok(()),
            Some(FailureMode::Unavailable) => {
                Err(RemoteError::Unavailable("injected failure".into()))
            }
            Some(FailureMode::Hang) => std::future::pending().await,
        }
    }
}

impl RemoteStore for MemoryRemote {
    async fn read_document(&self) -> Result<Option<Value>, RemoteError> {
        self.injected_failure(false).await?;

        let (document, delay) = {
            let mut state = self.state.lock().await;
            state.reads += 1;
            (state.document.clone(), state.read_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(document.filter(|v| !v.is_null()))
    }

    async fn write_document(&self, document: &Document) -> Result<(), RemoteError> {
        self.injected_failure(true).await?;

        let value = serde_json::to_value(document)?;
        let mut state = self.state.lock().await;
        state.document = Some(value);
        state.writes += 1;
        Ok(())
    }

    async fn write_paths(&self, patch: &PathPatch) -> Result<(), RemoteError> {
        self.injected_failure(true).await?;

        let mut state = self.state.lock().await;
        let root = state
            .document
            .get_or_insert_with(|| Value::Object(Map::new()));
        for (path, value) in patch {
            apply_path(root, path, value.clone());
        }
        state.patches += 1;
        Ok(())
    }
}

/// Write `value` at a `/`-separated path; `null` deletes.
fn apply_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        if value.is_null() {
            map.remove(*last);
        } else {
            map.insert(last.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn patch_writes_and_deletes_paths() {
        let remote = MemoryRemote::with_document(json!({
            "points": {"user77": {"total": 5, "weekly": 1}},
            "periodicPenalty": {"old": "2024-01-01"}
        }));

        let mut patch = PathPatch::new();
        patch.insert("points/user77".into(), json!({"total": 2, "weekly": 1}));
        patch.insert("periodicPenalty/old".into(), Value::Null);
        patch.insert("system/lastSync".into(), json!("2024-01-02T00:00:00Z"));
        remote.write_paths(&patch).await.unwrap();

        let stored = remote.document().await.unwrap();
        assert_eq!(stored["points"]["user77"]["total"], json!(2));
        assert_eq!(stored["periodicPenalty"], json!({}));
        assert_eq!(stored["system"]["lastSync"], json!("2024-01-02T00:00:00Z"));
        assert_eq!(remote.patch_count().await, 1);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let remote = MemoryRemote::new();
        remote.fail_next_read(FailureMode::Unavailable).await;

        assert!(matches!(
            remote.read_document().await,
            Err(RemoteError::Unavailable(_))
        ));
        assert_eq!(remote.read_document().await.unwrap(), None);
    }
}
