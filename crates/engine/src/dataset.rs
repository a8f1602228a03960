//! Scored runner dataset grouped by race
//!
//! Validation is split in two tiers: structural problems (no rows, a column
//! that is null everywhere, duplicate runners) reject the whole dataset, while
//! individual rows with unusable odds or probabilities are dropped and counted.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::RunnerObservation;

/// Rows dropped while building a dataset. Non-fatal; surfaced in every
/// simulation result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQuality {
    pub rows_total: usize,
    pub rows_dropped: usize,
    pub missing_prob: usize,
    pub invalid_prob: usize,
    pub missing_odds: usize,
    pub invalid_odds: usize,
}

impl DataQuality {
    pub fn has_drops(&self) -> bool {
        self.rows_dropped > 0
    }
}

/// A runner that survived validation: probability in (0, 1], odds > 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Runner {
    /// Position in the input, used as the final ranking tie-break
    pub index: usize,
    pub event_date: NaiveDate,
    pub race_id: String,
    pub runner_id: String,
    pub selection_id: u64,
    pub track: String,
    pub race_no: u32,
    pub model_prob: f64,
    pub win_odds: f64,
    pub won_flag: Option<bool>,
    pub distance: Option<u32>,
    pub racing_type: Option<String>,
    pub race_type: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Race {
    pub race_id: String,
    pub runners: Vec<Runner>,
}

/// Validated runners grouped by race in first-appearance order
#[derive(Debug, Clone)]
pub struct RaceDataset {
    races: Vec<Race>,
    quality: DataQuality,
    has_outcomes: bool,
}

enum RowIssue {
    MissingProb,
    InvalidProb,
    MissingOdds,
    InvalidOdds,
}

fn check_row(row: &RunnerObservation) -> Result<(f64, f64), RowIssue> {
    let prob = match row.model_prob {
        None => return Err(RowIssue::MissingProb),
        Some(p) if !p.is_finite() || p <= 0.0 || p > 1.0 => return Err(RowIssue::InvalidProb),
        Some(p) => p,
    };
    let odds = match row.win_odds {
        None => return Err(RowIssue::MissingOdds),
        Some(o) if !o.is_finite() || o <= 0.0 => return Err(RowIssue::InvalidOdds),
        Some(o) => o,
    };
    Ok((prob, odds))
}

impl RaceDataset {
    pub fn from_rows(rows: Vec<RunnerObservation>) -> EngineResult<Self> {
        if rows.is_empty() {
            return Err(EngineError::validation("Runner dataset is empty"));
        }
        if rows.iter().all(|r| r.win_odds.is_none()) {
            return Err(EngineError::validation(
                "All win_odds values are null - cannot compute edge",
            ));
        }
        if rows.iter().all(|r| r.model_prob.is_none()) {
            return Err(EngineError::validation(
                "All model_prob values are null - cannot evaluate strategy",
            ));
        }

        let mut seen: HashSet<(String, String)> = HashSet::with_capacity(rows.len());
        for row in &rows {
            if row.race_id.trim().is_empty() || row.runner_id.trim().is_empty() {
                return Err(EngineError::validation(format!(
                    "Row with empty race_id or runner_id (selection {})",
                    row.selection_id
                )));
            }
            if !seen.insert((row.race_id.clone(), row.runner_id.clone())) {
                return Err(EngineError::validation(format!(
                    "Duplicate runner {} in race {}",
                    row.runner_id, row.race_id
                )));
            }
        }

        let mut quality = DataQuality {
            rows_total: rows.len(),
            ..DataQuality::default()
        };
        let mut races: Vec<Race> = Vec::new();
        let mut race_index: HashMap<String, usize> = HashMap::new();
        let mut has_outcomes = false;

        for (index, row) in rows.into_iter().enumerate() {
            let (model_prob, win_odds) = match check_row(&row) {
                Ok(values) => values,
                Err(issue) => {
                    quality.rows_dropped += 1;
                    match issue {
                        RowIssue::MissingProb => quality.missing_prob += 1,
                        RowIssue::InvalidProb => quality.invalid_prob += 1,
                        RowIssue::MissingOdds => quality.missing_odds += 1,
                        RowIssue::InvalidOdds => quality.invalid_odds += 1,
                    }
                    continue;
                }
            };

            has_outcomes |= row.won_flag.is_some();

            let runner = Runner {
                index,
                event_date: row.event_date,
                race_id: row.race_id,
                runner_id: row.runner_id,
                selection_id: row.selection_id,
                track: row.track,
                race_no: row.race_no,
                model_prob,
                win_odds,
                won_flag: row.won_flag,
                distance: row.distance,
                racing_type: row.racing_type,
                race_type: row.race_type,
                state: row.state,
            };

            let slot = *race_index.entry(runner.race_id.clone()).or_insert_with(|| {
                races.push(Race {
                    race_id: runner.race_id.clone(),
                    runners: Vec::new(),
                });
                races.len() - 1
            });
            races[slot].runners.push(runner);
        }

        if quality.has_drops() {
            warn!(
                dropped = quality.rows_dropped,
                total = quality.rows_total,
                missing_prob = quality.missing_prob,
                invalid_prob = quality.invalid_prob,
                missing_odds = quality.missing_odds,
                invalid_odds = quality.invalid_odds,
                "Dropped runner rows with unusable odds or probability"
            );
        }

        if races.is_empty() {
            return Err(EngineError::validation(format!(
                "No usable runners: all {} rows dropped",
                quality.rows_total
            )));
        }

        Ok(Self {
            races,
            quality,
            has_outcomes,
        })
    }

    /// Parse JSON Lines `RunnerObservation` rows. Blank lines are skipped.
    pub fn from_jsonl<R: BufRead>(reader: R) -> EngineResult<Self> {
        let mut rows = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| EngineError::validation(format!("line {}: {}", n + 1, e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: RunnerObservation = serde_json::from_str(&line)
                .map_err(|e| EngineError::validation(format!("line {}: {}", n + 1, e)))?;
            rows.push(row);
        }

        let dataset = Self::from_rows(rows)?;
        info!(
            races = dataset.races.len(),
            runners = dataset.runner_count(),
            dropped = dataset.quality.rows_dropped,
            "Loaded scored dataset"
        );
        Ok(dataset)
    }

    pub fn races(&self) -> &[Race] {
        &self.races
    }

    pub fn quality(&self) -> &DataQuality {
        &self.quality
    }

    /// False when no surviving row carries a known result (unresolved races).
    pub fn has_outcomes(&self) -> bool {
        self.has_outcomes
    }

    pub fn runner_count(&self) -> usize {
        self.races.iter().map(|r| r.runners.len()).sum()
    }

    /// Earliest and latest event date among surviving runners
    pub fn date_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut dates = self
            .races
            .iter()
            .flat_map(|race| race.runners.iter().map(|r| r.event_date));
        let first = dates.next()?;
        Some(dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
    }
}
