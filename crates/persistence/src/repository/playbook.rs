//! Playbook store: rolling history of playbook snapshots

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::atomic::write_atomic;
use crate::{StoreError, StoreResult};

/// Document persisted at the playbook path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDocument {
    pub history: Vec<Value>,
    pub latest: Value,
}

/// Keeps the last `max_history` playbook snapshots in one JSON file.
///
/// Saves are serialized by a write lock so concurrent reflections in one
/// process cannot drop each other's history entries.
pub struct PlaybookStore {
    path: PathBuf,
    max_history: usize,
    write_lock: Mutex<()>,
}

impl PlaybookStore {
    pub fn new(path: impl AsRef<Path>, max_history: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_history: max_history.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `snapshot` to the history and commit `{history, latest}`.
    ///
    /// An unreadable existing file is moved aside and history restarts from
    /// this snapshot. On any write failure the previously committed file is
    /// left byte-for-byte intact.
    pub fn save(&self, snapshot: Value) -> StoreResult<PathBuf> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut history = match self.load() {
            Ok(doc) => doc.map(|doc| doc.history).unwrap_or_default(),
            Err(StoreError::Corrupt { path, reason }) => {
                self.set_aside_corrupt(&path, &reason);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        history.push(snapshot.clone());
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }

        let document = PlaybookDocument {
            history,
            latest: snapshot,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        write_atomic(&self.path, &bytes)?;

        info!(
            path = %self.path.display(),
            history = document.history.len(),
            "Playbook saved"
        );
        Ok(self.path.clone())
    }

    fn set_aside_corrupt(&self, path: &Path, reason: &str) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "playbook".to_string());
        let aside = path.with_file_name(format!(
            "{}.corrupt-{}",
            name,
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        match fs::rename(path, &aside) {
            Ok(()) => warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                reason,
                "Unreadable playbook moved aside, starting a fresh history"
            ),
            Err(e) => warn!(
                path = %path.display(),
                reason,
                error = %e,
                "Unreadable playbook will be replaced, starting a fresh history"
            ),
        }
    }

    /// The committed document, or `None` if nothing has been saved yet.
    pub fn load(&self) -> StoreResult<Option<PlaybookDocument>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    pub fn latest(&self) -> StoreResult<Option<Value>> {
        Ok(self.load()?.map(|doc| doc.latest))
    }

    pub fn history(&self) -> StoreResult<Vec<Value>> {
        Ok(self.load()?.map(|doc| doc.history).unwrap_or_default())
    }
}
