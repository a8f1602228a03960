//! Whole-file commits via temp file + rename.
//!
//! A file is first written next to its target under a hidden `.tmp` name,
//! synced, and only then renamed over the committed name. If the process dies
//! (or the staged file is dropped) before the rename, the committed file is
//! exactly what it was before.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{StoreError, StoreResult};

/// Suffix shared by every staged file; readers skip anything carrying it.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Per-process sequence so concurrent stagings of one target never share a temp file.
static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A fully written but not yet committed file.
///
/// Dropping it without calling [`StagedFile::commit`] removes the temp file
/// and leaves the target untouched.
#[derive(Debug)]
pub struct StagedFile {
    target: PathBuf,
    temp: PathBuf,
    committed: bool,
}

impl StagedFile {
    /// Write `bytes` to a temp file in the target's directory and sync it.
    pub fn stage(target: &Path, bytes: &[u8]) -> StoreResult<Self> {
        let parent = target.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let seq = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        let temp = parent.join(format!(
            ".{}.{}-{}{}",
            file_name,
            std::process::id(),
            seq,
            TEMP_SUFFIX
        ));

        let staged = StagedFile {
            target: target.to_path_buf(),
            temp,
            committed: false,
        };

        // `staged` is dropped on any error below, which removes the partial temp file.
        {
            let mut file =
                File::create(&staged.temp).map_err(|e| StoreError::io(&staged.temp, e))?;
            file.write_all(bytes)
                .map_err(|e| StoreError::io(&staged.temp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&staged.temp, e))?;
        }

        Ok(staged)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Atomically replace the target with the staged content.
    pub fn commit(mut self) -> StoreResult<()> {
        fs::rename(&self.temp, &self.target).map_err(|e| StoreError::io(&self.target, e))?;
        self.committed = true;
        sync_parent_dir(&self.target);
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// Stage and commit in one step.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> StoreResult<()> {
    StagedFile::stage(target, bytes)?.commit()
}

/// True for names produced by [`StagedFile::stage`].
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(TEMP_SUFFIX)
}

#[cfg(unix)]
fn sync_parent_dir(target: &Path) {
    if let Some(parent) = target.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_target: &Path) {}
