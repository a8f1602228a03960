//! Race-ace engine: strategy backtesting and reflection
//!
//! Provides:
//! - Scored runner datasets with row-level quality reporting
//! - Hash-identified strategy configurations and a bounded strategy grid
//! - A deterministic simulator producing per-runner experience records
//! - A concurrent experience loop with progress and cancellation
//! - Significance-filtered playbooks built from accumulated experience

pub mod config;
pub mod dataset;
pub mod error;
pub mod experience;
pub mod playbook;
pub mod simulator;
pub mod stats;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use config::{AceConfig, ReflectionConfig};
pub use dataset::{DataQuality, Race, RaceDataset, Runner};
pub use error::{EngineError, EngineResult};
pub use experience::{run_experience_loop, ExperienceBatch, LoopStatus, SimulationProgress};
pub use playbook::{
    ContextInsight, GlobalMetrics, Playbook, PlaybookBuilder, PlaybookMetadata, Reflection,
    Reflector, SignificanceSummary, StrategyMetrics, TrackInsight,
};
pub use simulator::{compute_edge, settle_profit, Evaluation, Settlement, SimulationResult, Simulator};
pub use stats::{binomial_two_sided_p, effective_threshold, wilson_interval, NullHypothesis};
pub use strategy::{
    evaluation_code_hash, GridSpec, StrategyConfig, StrategyFilter, StrategyGrid, MAX_GRID_SIZE,
    STRATEGY_VERSION,
};
pub use types::{DistanceBand, RunnerObservation};
