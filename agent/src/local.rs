//! File-backed local persistence.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tally_engine::{Document, Error, LocalPersistence};

/// Stores the replica as a JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl LocalPersistence for FilePersistence {
    fn load(&self) -> tally_engine::error::Result<Option<Document>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Persistence(e.to_string())),
        };

        match serde_json::from_str(&text) {
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable local state");
                Ok(None)
            }
        }
    }

    fn save(&self, document: &Document) -> tally_engine::error::Result<()> {
        let json =
            serde_json::to_vec_pretty(document).map_err(|e| Error::Persistence(e.to_string()))?;
        let temp = self.temp_path();
        fs::write(&temp, json).map_err(|e| Error::Persistence(e.to_string()))?;
        fs::rename(&temp, &self.path).map_err(|e| Error::Persistence(e.to_string()))
    }
}
