//! Experience store: append-only, partitioned log of simulated decisions

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::atomic::{is_temp_name, write_atomic};
use crate::schema::{partition_bounds, ExperienceRecord, PartitionFile, PartitionScheme, RecordKey};
use crate::{StoreError, StoreResult};

const FILE_PREFIX: &str = "experiences_";
const FILE_SUFFIX: &str = ".json";

/// Inclusive range of event dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> StoreResult<Self> {
        if start > end {
            return Err(StoreError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start <= end && start <= self.end
    }
}

/// What a call to [`ExperienceStore::write`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub partitions_written: usize,
    pub partitions_unchanged: usize,
    pub rows_inserted: usize,
    pub rows_replaced: usize,
}

/// Experience log stored as one columnar file per partition key.
///
/// Files are never edited in place: a write merges the incoming rows with the
/// committed partition and replaces the whole file atomically. Readers need
/// no lock because a committed file is always complete.
pub struct ExperienceStore {
    root: PathBuf,
    scheme: PartitionScheme,
    write_lock: Mutex<()>,
}

impl ExperienceStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>, scheme: PartitionScheme) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self {
            root,
            scheme,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scheme(&self) -> PartitionScheme {
        self.scheme
    }

    fn partition_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{FILE_PREFIX}{key}{FILE_SUFFIX}"))
    }

    /// Append records. Rows whose `(strategy_id, race_id, runner_id)` already
    /// exist replace the stored row; identical rows leave the file untouched.
    pub fn write(&self, records: &[ExperienceRecord]) -> StoreResult<WriteSummary> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut by_partition: BTreeMap<String, Vec<&ExperienceRecord>> = BTreeMap::new();
        for record in records {
            by_partition
                .entry(self.scheme.key(record.event_date))
                .or_default()
                .push(record);
        }

        let mut summary = WriteSummary::default();

        for (key, incoming) in by_partition {
            let path = self.partition_path(&key);
            let existed = path.exists();
            let mut rows: BTreeMap<RecordKey, ExperienceRecord> = if existed {
                load_partition(&path)?
                    .into_iter()
                    .map(|r| (r.key(), r))
                    .collect()
            } else {
                BTreeMap::new()
            };

            let mut inserted = 0usize;
            let mut replaced = 0usize;
            for record in incoming {
                match rows.insert(record.key(), record.clone()) {
                    None => inserted += 1,
                    Some(previous) if previous != *record => replaced += 1,
                    Some(_) => {}
                }
            }

            if existed && inserted == 0 && replaced == 0 {
                debug!(partition = %key, "Partition unchanged, skipping rewrite");
                summary.partitions_unchanged += 1;
                continue;
            }

            let ordered: Vec<ExperienceRecord> = rows.into_values().collect();
            let bytes = serde_json::to_vec(&PartitionFile::new(&key, &ordered))?;
            write_atomic(&path, &bytes)?;

            debug!(
                partition = %key,
                rows = ordered.len(),
                inserted,
                replaced,
                "Committed experience partition"
            );

            summary.partitions_written += 1;
            summary.rows_inserted += inserted;
            summary.rows_replaced += replaced;
        }

        info!(
            written = summary.partitions_written,
            unchanged = summary.partitions_unchanged,
            inserted = summary.rows_inserted,
            replaced = summary.rows_replaced,
            "Experience write complete"
        );

        Ok(summary)
    }

    /// Union of every partition overlapping `range`, restricted to the range,
    /// deduplicated by key and ordered by key.
    ///
    /// Replacement by key happens within a partition only. If a row's
    /// `event_date` is later corrected so that it lands in another partition,
    /// the old row stays where it was. When both copies fall inside `range`,
    /// the copy from the later partition key is returned, whichever was
    /// written last.
    pub fn read(&self, range: &DateRange) -> StoreResult<Vec<ExperienceRecord>> {
        let mut rows: BTreeMap<RecordKey, ExperienceRecord> = BTreeMap::new();

        for key in self.partitions()? {
            let Some((start, end)) = partition_bounds(&key) else {
                continue;
            };
            if !range.overlaps(start, end) {
                continue;
            }
            for record in load_partition(&self.partition_path(&key))? {
                if range.contains(record.event_date) {
                    rows.insert(record.key(), record);
                }
            }
        }

        debug!(
            start = %range.start,
            end = %range.end,
            rows = rows.len(),
            "Read experience range"
        );

        Ok(rows.into_values().collect())
    }

    /// Committed partition keys, sorted
    pub fn partitions(&self) -> StoreResult<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_temp_name(&name) {
                continue;
            }
            if let Some(key) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                if partition_bounds(key).is_some() {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn load_partition(path: &Path) -> StoreResult<Vec<ExperienceRecord>> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let file: PartitionFile = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    file.into_records().map_err(|reason| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    })
}
