//! LocalReplica - the client's copy of the shared document.
//!
//! The replica owns the in-memory document, writes it through to durable
//! storage on every change and tracks whether anything still needs to be
//! pushed. Durable storage is injected through [`LocalPersistence`], so each
//! replica is an isolated instance.

use crate::{error::Result, Document, Error, Timestamp, UserId};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// Durable storage for the local replica.
pub trait LocalPersistence: Send {
    /// Load the stored document, if any.
    fn load(&self) -> Result<Option<Document>>;

    /// Store the document, replacing what was there.
    fn save(&self, document: &Document) -> Result<()>;
}

/// In-memory persistence, mainly for tests.
///
/// Clones share the same storage, so a test can keep a handle and inspect
/// what the replica wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    stored: Option<String>,
    failing: bool,
    saves: usize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a stored document.
    pub fn with_document(document: &Document) -> Result<Self> {
        let persistence = Self::new();
        persistence.save(document)?;
        Ok(persistence)
    }

    /// Make every following save fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing = failing;
        }
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.saves).unwrap_or_default()
    }

    /// The last stored document.
    pub fn stored(&self) -> Option<Document> {
        let inner = self.inner.lock().ok()?;
        serde_json::from_str(inner.stored.as_deref()?).ok()
    }
}

impl LocalPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<Document>> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        inner
            .stored
            .as_deref()
            .map(|json| serde_json::from_str(json).map_err(|e| Error::Persistence(e.to_string())))
            .transpose()
    }

    fn save(&self, document: &Document) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if inner.failing {
            return Err(Error::Persistence("storage unavailable".into()));
        }
        inner.stored =
            Some(serde_json::to_string(document).map_err(|e| Error::Persistence(e.to_string()))?);
        inner.saves += 1;
        Ok(())
    }
}

/// What kind of change a subscriber is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// `set` / `update`
    Local,
    /// `replace` from a pull or merge
    Replaced,
    /// `import` of an external document
    Imported,
    /// `reset` to defaults
    Reset,
}

impl ChangeKind {
    /// Whether this change has to be pushed.
    pub fn needs_push(self) -> bool {
        !matches!(self, ChangeKind::Replaced)
    }
}

type Listener = Box<dyn Fn(ChangeKind) + Send + Sync>;

/// The client's local copy of the shared document.
pub struct LocalReplica {
    document: Document,
    users: Vec<UserId>,
    persistence: Box<dyn LocalPersistence>,
    /// Changed since the last confirmed push
    locally_modified: bool,
    /// `system.lastSync` of the remote as last seen
    last_observed_remote_sync: Option<Timestamp>,
    /// Bumped by every local mutation
    revision: u64,
    listeners: Vec<Listener>,
}

impl std::fmt::Debug for LocalReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalReplica")
            .field("users", &self.users)
            .field("locally_modified", &self.locally_modified)
            .field("last_observed_remote_sync", &self.last_observed_remote_sync)
            .field("revision", &self.revision)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl LocalReplica {
    /// Open a replica, loading the stored document or starting from defaults.
    pub fn open(persistence: impl LocalPersistence + 'static, users: Vec<UserId>) -> Result<Self> {
        let document = match persistence.load()? {
            Some(stored) => stored.normalized(&users)?,
            None => Document::with_users(&users),
        };
        let last_observed_remote_sync = document.system.last_sync.clone();

        Ok(Self {
            document,
            users,
            persistence: Box::new(persistence),
            locally_modified: false,
            last_observed_remote_sync,
            revision: 0,
            listeners: Vec::new(),
        })
    }

    /// The current document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// A copy of the current document.
    pub fn snapshot(&self) -> Document {
        self.document.clone()
    }

    /// Users this replica was opened for.
    pub fn users(&self) -> &[UserId] {
        &self.users
    }

    pub fn is_locally_modified(&self) -> bool {
        self.locally_modified
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn last_observed_remote_sync(&self) -> Option<&str> {
        self.last_observed_remote_sync.as_deref()
    }

    /// Remember the remote `system.lastSync` that was just observed.
    pub fn observe_remote_sync(&mut self, at: Option<Timestamp>) {
        self.last_observed_remote_sync = at;
    }

    /// Register a change listener.
    pub fn subscribe(&mut self, listener: impl Fn(ChangeKind) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Read the value at a dotted path (`points.user77.total`).
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        let root = self.document.to_value()?;
        let mut current = &root;
        for segment in split_path(path)? {
            current = match current {
                Value::Object(map) => match map.get(segment) {
                    Some(next) => next,
                    None => return Ok(None),
                },
                Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(next) => next,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            };
        }
        Ok(Some(current.clone()))
    }

    /// Write a value at a dotted path, creating intermediate objects.
    ///
    /// A write that would break the document shape is rejected and leaves
    /// the replica untouched. A persistence failure is returned after the
    /// in-memory change has been kept.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let mut root = self.document.to_value()?;
        set_path(&mut root, path, value)?;
        self.document = Document::from_value(root)?;
        self.local_change(ChangeKind::Local)
    }

    /// Shallow-merge `partial` into the object at `path`.
    ///
    /// If the current value is not an object it is replaced by `partial`.
    pub fn update(&mut self, path: &str, partial: Map<String, Value>) -> Result<()> {
        let value = match self.get(path)? {
            Some(Value::Object(mut current)) => {
                current.extend(partial);
                Value::Object(current)
            }
            _ => Value::Object(partial),
        };
        self.set(path, value)
    }

    /// Replace the whole document with one that came from the remote side.
    ///
    /// Clears the modified flag.
    pub fn replace(&mut self, document: Document) -> Result<()> {
        self.document = document.normalized(&self.users)?;
        self.locally_modified = false;
        let saved = self.persistence.save(&self.document);
        self.notify(ChangeKind::Replaced);
        saved
    }

    /// Replace the document only if no local mutation happened since
    /// `revision` was read.
    ///
    /// Returns whether the replacement happened.
    pub fn replace_if_unchanged(&mut self, document: Document, revision: u64) -> Result<bool> {
        if self.revision != revision {
            return Ok(false);
        }
        self.replace(document)?;
        Ok(true)
    }

    /// Record a confirmed push of the snapshot taken at `revision`.
    ///
    /// The modified flag is only cleared when nothing changed since.
    pub fn record_push(&mut self, revision: u64, at: Timestamp) -> Result<()> {
        self.document.stamp_sync(at.clone());
        self.last_observed_remote_sync = Some(at);
        if self.revision == revision {
            self.locally_modified = false;
        }
        self.persistence.save(&self.document)
    }

    /// Mark the replica as needing a push.
    pub fn mark_dirty(&mut self) {
        self.locally_modified = true;
    }

    /// Serialize the document as pretty JSON.
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.document).map_err(|e| Error::InvalidDocument(e.to_string()))
    }

    /// Replace the document with an exported one.
    ///
    /// Malformed input is rejected without touching the replica.
    pub fn import(&mut self, text: &str) -> Result<()> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::InvalidImport(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::InvalidImport("expected a JSON object".into()));
        }
        let document = Document::from_value_with_defaults(value, &self.users)
            .map_err(|e| Error::InvalidImport(e.to_string()))?;

        self.document = document;
        self.local_change(ChangeKind::Imported)
    }

    /// Reset to the default document.
    pub fn reset(&mut self) -> Result<()> {
        self.document = Document::with_users(&self.users);
        self.local_change(ChangeKind::Reset)
    }

    fn local_change(&mut self, kind: ChangeKind) -> Result<()> {
        self.locally_modified = true;
        self.revision += 1;
        let saved = self.persistence.save(&self.document);
        self.notify(kind);
        saved
    }

    fn notify(&self, kind: ChangeKind) {
        for listener in &self.listeners {
            listener(kind);
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn set_path(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments = split_path(path)?;
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| Error::InvalidPath(path.to_string()))?;

    let mut current = root;
    for segment in parents {
        current = child_mut(current, segment, path)?;
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        Value::Array(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| Error::InvalidPath(path.to_string()))?;
            *slot = value;
        }
        _ => return Err(Error::InvalidPath(path.to_string())),
    }
    Ok(())
}

fn child_mut<'a>(current: &'a mut Value, segment: &str, path: &str) -> Result<&'a mut Value> {
    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => Ok(map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get_mut(i))
            .ok_or_else(|| Error::InvalidPath(path.to_string())),
        _ => Err(Error::InvalidPath(path.to_string())),
    }
}
