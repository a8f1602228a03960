//! Concurrent experience generation over a strategy grid
//!
//! Strategies are evaluated on blocking worker threads, at most
//! `AceConfig::concurrency` at a time, and merged in `strategy_id` order so
//! the output never depends on completion order.

use persistence::{ExperienceRecord, ExperienceStore, WriteSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, RwLock,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::AceConfig;
use crate::dataset::RaceDataset;
use crate::error::{EngineError, EngineResult};
use crate::simulator::{Evaluation, SimulationResult, Simulator};
use crate::strategy::StrategyConfig;

/// Experience loop status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Shared progress tracker between the loop and whoever started it
pub struct SimulationProgress {
    pub status: RwLock<LoopStatus>,
    pub total: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
}

impl SimulationProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(LoopStatus::Idle),
            total: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    fn start(&self, total: usize) {
        self.set_status(LoopStatus::Running);
        self.total.store(total as u32, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
    }

    fn set_status(&self, status: LoopStatus) {
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = status;
    }

    pub fn status(&self) -> LoopStatus {
        *self.status.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Request cancellation; in-flight evaluations finish, nothing new starts.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn progress_pct(&self) -> f32 {
        let total = self.total.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == LoopStatus::Running
    }
}

impl Default for SimulationProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of one experience loop, ordered by strategy_id
#[derive(Debug, Clone)]
pub struct ExperienceBatch {
    pub results: Vec<SimulationResult>,
    pub records: Vec<ExperienceRecord>,
}

impl ExperienceBatch {
    fn from_evaluations(mut evaluations: Vec<Evaluation>) -> Self {
        evaluations.sort_by(|a, b| a.result.strategy_id.cmp(&b.result.strategy_id));
        let mut results = Vec::with_capacity(evaluations.len());
        let mut records = Vec::new();
        for eval in evaluations {
            results.push(eval.result);
            records.extend(eval.records);
        }
        Self { results, records }
    }

    /// Append the batch to the experience store
    pub fn commit(&self, store: &ExperienceStore) -> EngineResult<WriteSummary> {
        let summary = store.write(&self.records)?;
        info!(
            strategies = self.results.len(),
            rows = self.records.len(),
            inserted = summary.rows_inserted,
            replaced = summary.rows_replaced,
            partitions_written = summary.partitions_written,
            "Experience committed"
        );
        Ok(summary)
    }
}

/// Evaluate every strategy against the dataset.
///
/// Returns [`EngineError::Cancelled`] if cancellation was requested before
/// all strategies finished; nothing is written in either case.
pub async fn run_experience_loop(
    dataset: Arc<RaceDataset>,
    strategies: Vec<StrategyConfig>,
    config: &AceConfig,
    progress: Arc<SimulationProgress>,
) -> EngineResult<ExperienceBatch> {
    if strategies.is_empty() {
        return Err(EngineError::validation("No strategies to evaluate"));
    }
    let mut seen = HashSet::with_capacity(strategies.len());
    for s in &strategies {
        if !seen.insert(s.strategy_id.as_str()) {
            return Err(EngineError::validation(format!(
                "Duplicate strategy {}",
                s.strategy_id
            )));
        }
    }

    let total = strategies.len();
    let workers = config.concurrency.max(1);
    progress.start(total);

    info!(
        strategies = total,
        races = dataset.races().len(),
        runners = dataset.runner_count(),
        workers,
        "Starting experience loop"
    );

    let outcome = drive(dataset, strategies, workers, &progress).await;

    match &outcome {
        Ok(batch) => {
            progress.set_status(LoopStatus::Complete);
            info!(
                strategies = batch.results.len(),
                records = batch.records.len(),
                "Experience loop complete"
            );
        }
        Err(EngineError::Cancelled) => {
            progress.set_status(LoopStatus::Cancelled);
            warn!(
                completed = progress.completed.load(Ordering::Relaxed),
                total, "Experience loop cancelled"
            );
        }
        Err(e) => {
            progress.set_status(LoopStatus::Error);
            warn!(error = %e, "Experience loop failed");
        }
    }

    outcome
}

async fn drive(
    dataset: Arc<RaceDataset>,
    strategies: Vec<StrategyConfig>,
    workers: usize,
    progress: &Arc<SimulationProgress>,
) -> EngineResult<ExperienceBatch> {
    let total = strategies.len();
    let mut pending = strategies.into_iter();
    let mut tasks: JoinSet<EngineResult<Evaluation>> = JoinSet::new();
    let mut evaluations = Vec::with_capacity(total);

    loop {
        while tasks.len() < workers && !progress.is_cancelled() {
            let Some(strategy) = pending.next() else {
                break;
            };
            let dataset = Arc::clone(&dataset);
            tasks.spawn_blocking(move || Simulator::evaluate(&dataset, &strategy));
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let evaluation = joined.map_err(|e| EngineError::Task(e.to_string()))??;
        debug!(strategy_id = %evaluation.result.strategy_id, "Strategy finished");
        evaluations.push(evaluation);
        progress.completed.fetch_add(1, Ordering::Relaxed);
    }

    if evaluations.len() < total {
        return Err(EngineError::Cancelled);
    }
    Ok(ExperienceBatch::from_evaluations(evaluations))
}
