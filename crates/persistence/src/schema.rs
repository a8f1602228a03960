//! On-disk schema for experience partitions
//!
//! A partition file is a columnar JSON document: one array per field, all of
//! equal length, rows sorted by `(strategy_id, race_id, runner_id)`. Sorting
//! makes the bytes a pure function of the row set, so rewriting identical
//! experience produces an identical file.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Bump when the column set changes; older files are rejected as corrupt.
pub const SCHEMA_VERSION: u32 = 1;

/// What the strategy did with a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Bet,
    Skip,
}

/// One simulated decision for one runner under one strategy. Never mutated
/// once written; a later write with the same key supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceRecord {
    pub event_date: NaiveDate,
    pub strategy_id: String,
    pub race_id: String,
    pub runner_id: String,
    pub selection_id: u64,
    pub track: String,
    pub race_no: u32,
    pub action: Action,
    pub stake: f64,
    /// `None` while the race is unresolved.
    pub profit: Option<f64>,
    pub model_prob: f64,
    pub win_odds: f64,
    pub edge: f64,
    pub won_flag: Option<bool>,
    pub context_hash: String,
    pub distance: Option<u32>,
    pub racing_type: Option<String>,
    pub race_type: Option<String>,
    pub state: Option<String>,
    /// Canonical JSON of the strategy parameters that produced this row
    pub params: String,
}

/// Deduplication key
pub type RecordKey = (String, String, String);

impl ExperienceRecord {
    pub fn key(&self) -> RecordKey {
        (
            self.strategy_id.clone(),
            self.race_id.clone(),
            self.runner_id.clone(),
        )
    }

    pub fn is_bet(&self) -> bool {
        self.action == Action::Bet
    }
}

/// Coarse time key used to split the experience log into files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    #[default]
    Month,
    Day,
}

impl PartitionScheme {
    pub fn key(&self, date: NaiveDate) -> String {
        match self {
            PartitionScheme::Month => format!("{:04}-{:02}", date.year(), date.month()),
            PartitionScheme::Day => date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Inclusive date span covered by a partition key of either scheme.
pub fn partition_bounds(key: &str) -> Option<(NaiveDate, NaiveDate)> {
    if let Ok(day) = NaiveDate::parse_from_str(key, "%Y-%m-%d") {
        return Some((day, day));
    }
    let first = NaiveDate::parse_from_str(&format!("{key}-01"), "%Y-%m-%d").ok()?;
    let next_month = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)?
    };
    Some((first, next_month.pred_opt()?))
}

/// Serialized partition document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionFile {
    pub schema_version: u32,
    pub partition: String,
    pub rows: usize,
    pub columns: ExperienceColumns,
}

/// Column-per-field layout of a batch of experience records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperienceColumns {
    pub event_date: Vec<NaiveDate>,
    pub strategy_id: Vec<String>,
    pub race_id: Vec<String>,
    pub runner_id: Vec<String>,
    pub selection_id: Vec<u64>,
    pub track: Vec<String>,
    pub race_no: Vec<u32>,
    pub action: Vec<Action>,
    pub stake: Vec<f64>,
    pub profit: Vec<Option<f64>>,
    pub model_prob: Vec<f64>,
    pub win_odds: Vec<f64>,
    pub edge: Vec<f64>,
    pub won_flag: Vec<Option<bool>>,
    pub context_hash: Vec<String>,
    pub distance: Vec<Option<u32>>,
    pub racing_type: Vec<Option<String>>,
    pub race_type: Vec<Option<String>>,
    pub state: Vec<Option<String>>,
    pub params: Vec<String>,
}

impl PartitionFile {
    pub fn new(partition: &str, records: &[ExperienceRecord]) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            partition: partition.to_string(),
            rows: records.len(),
            columns: ExperienceColumns::from_records(records),
        }
    }

    /// Validate the header and column lengths, then rebuild rows.
    pub fn into_records(self) -> Result<Vec<ExperienceRecord>, String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema_version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        self.columns.into_records(self.rows)
    }
}

impl ExperienceColumns {
    pub fn from_records(records: &[ExperienceRecord]) -> Self {
        let mut cols = ExperienceColumns::default();
        for r in records {
            cols.event_date.push(r.event_date);
            cols.strategy_id.push(r.strategy_id.clone());
            cols.race_id.push(r.race_id.clone());
            cols.runner_id.push(r.runner_id.clone());
            cols.selection_id.push(r.selection_id);
            cols.track.push(r.track.clone());
            cols.race_no.push(r.race_no);
            cols.action.push(r.action);
            cols.stake.push(r.stake);
            cols.profit.push(r.profit);
            cols.model_prob.push(r.model_prob);
            cols.win_odds.push(r.win_odds);
            cols.edge.push(r.edge);
            cols.won_flag.push(r.won_flag);
            cols.context_hash.push(r.context_hash.clone());
            cols.distance.push(r.distance);
            cols.racing_type.push(r.racing_type.clone());
            cols.race_type.push(r.race_type.clone());
            cols.state.push(r.state.clone());
            cols.params.push(r.params.clone());
        }
        cols
    }

    fn lengths(&self) -> [usize; 20] {
        [
            self.event_date.len(),
            self.strategy_id.len(),
            self.race_id.len(),
            self.runner_id.len(),
            self.selection_id.len(),
            self.track.len(),
            self.race_no.len(),
            self.action.len(),
            self.stake.len(),
            self.profit.len(),
            self.model_prob.len(),
            self.win_odds.len(),
            self.edge.len(),
            self.won_flag.len(),
            self.context_hash.len(),
            self.distance.len(),
            self.racing_type.len(),
            self.race_type.len(),
            self.state.len(),
            self.params.len(),
        ]
    }

    pub fn into_records(mut self, expected_rows: usize) -> Result<Vec<ExperienceRecord>, String> {
        if let Some(bad) = self.lengths().iter().find(|&&len| len != expected_rows) {
            return Err(format!(
                "column length {} does not match row count {}",
                bad, expected_rows
            ));
        }

        let take = std::mem::take::<String>;
        let mut records = Vec::with_capacity(expected_rows);
        for i in 0..expected_rows {
            records.push(ExperienceRecord {
                event_date: self.event_date[i],
                strategy_id: take(&mut self.strategy_id[i]),
                race_id: take(&mut self.race_id[i]),
                runner_id: take(&mut self.runner_id[i]),
                selection_id: self.selection_id[i],
                track: take(&mut self.track[i]),
                race_no: self.race_no[i],
                action: self.action[i],
                stake: self.stake[i],
                profit: self.profit[i],
                model_prob: self.model_prob[i],
                win_odds: self.win_odds[i],
                edge: self.edge[i],
                won_flag: self.won_flag[i],
                context_hash: take(&mut self.context_hash[i]),
                distance: self.distance[i],
                racing_type: self.racing_type[i].take(),
                race_type: self.race_type[i].take(),
                state: self.state[i].take(),
                params: take(&mut self.params[i]),
            });
        }

        Ok(records)
    }
}
