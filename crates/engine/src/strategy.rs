//! Strategy configurations and the bounded parameter grid
//!
//! A strategy is identified by a SHA-256 hash of its canonical parameters, so
//! the same margin/top_n/stake/filters always map to the same `strategy_id`
//! regardless of how the filters were written down.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::info;

use crate::dataset::Runner;
use crate::error::{EngineError, EngineResult};
use crate::types::DistanceBand;

/// Bumped whenever the meaning of a strategy's parameters changes.
pub const STRATEGY_VERSION: &str = "2.0.0";

/// Upper bound on grid size; keeps the multiple-comparisons correction meaningful.
pub const MAX_GRID_SIZE: usize = 64;

/// Supported runner filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyFilter {
    /// Never bet at these tracks
    ExcludeTracks { tracks: Vec<String> },
    /// Only bet on these racing types (e.g. thoroughbred, harness)
    RacingTypes { racing_types: Vec<String> },
    DistanceBand { band: DistanceBand },
    States { states: Vec<String> },
    MinModelProb { min: Decimal },
    MaxWinOdds { max: Decimal },
}

fn normalise_list(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Unicode case-insensitive membership, matching how `normalise_list` folds case.
fn contains_ci(list: &[String], value: &str) -> bool {
    let value = value.trim().to_lowercase();
    list.iter().any(|v| v.trim().to_lowercase() == value)
}

impl StrategyFilter {
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            StrategyFilter::ExcludeTracks { tracks } if normalise_list(tracks).is_empty() => {
                Err(EngineError::validation("exclude_tracks filter needs at least one track"))
            }
            StrategyFilter::RacingTypes { racing_types } if normalise_list(racing_types).is_empty() => {
                Err(EngineError::validation("racing_types filter needs at least one racing type"))
            }
            StrategyFilter::States { states } if normalise_list(states).is_empty() => {
                Err(EngineError::validation("states filter needs at least one state"))
            }
            StrategyFilter::MinModelProb { min } if *min <= Decimal::ZERO || *min > Decimal::ONE => {
                Err(EngineError::validation(format!(
                    "min_model_prob must be in (0, 1], got {min}"
                )))
            }
            StrategyFilter::MaxWinOdds { max } if *max <= Decimal::ONE => Err(
                EngineError::validation(format!("max_win_odds must be > 1, got {max}")),
            ),
            _ => Ok(()),
        }
    }

    /// Same filter with lists lower-cased, sorted and de-duplicated and
    /// decimals normalised, so equivalent filters serialize identically.
    pub fn canonical(&self) -> Self {
        match self {
            StrategyFilter::ExcludeTracks { tracks } => StrategyFilter::ExcludeTracks {
                tracks: normalise_list(tracks),
            },
            StrategyFilter::RacingTypes { racing_types } => StrategyFilter::RacingTypes {
                racing_types: normalise_list(racing_types),
            },
            StrategyFilter::DistanceBand { band } => StrategyFilter::DistanceBand { band: *band },
            StrategyFilter::States { states } => StrategyFilter::States {
                states: normalise_list(states),
            },
            StrategyFilter::MinModelProb { min } => StrategyFilter::MinModelProb {
                min: min.normalize(),
            },
            StrategyFilter::MaxWinOdds { max } => StrategyFilter::MaxWinOdds {
                max: max.normalize(),
            },
        }
    }

    /// Whether a runner stays in the candidate set
    pub fn matches(&self, runner: &Runner) -> bool {
        match self {
            StrategyFilter::ExcludeTracks { tracks } => !contains_ci(tracks, &runner.track),
            StrategyFilter::RacingTypes { racing_types } => runner
                .racing_type
                .as_deref()
                .is_some_and(|rt| contains_ci(racing_types, rt)),
            StrategyFilter::DistanceBand { band } => runner
                .distance
                .and_then(DistanceBand::from_distance)
                .is_some_and(|b| b == *band),
            StrategyFilter::States { states } => runner
                .state
                .as_deref()
                .is_some_and(|s| contains_ci(states, s)),
            StrategyFilter::MinModelProb { min } => {
                runner.model_prob >= min.to_f64().unwrap_or(f64::INFINITY)
            }
            StrategyFilter::MaxWinOdds { max } => {
                runner.win_odds <= max.to_f64().unwrap_or(f64::NEG_INFINITY)
            }
        }
    }
}

fn canonical_filters(filters: &[StrategyFilter]) -> Vec<StrategyFilter> {
    let mut keyed: Vec<(String, StrategyFilter)> = filters
        .iter()
        .map(|f| {
            let c = f.canonical();
            (serde_json::to_string(&c).unwrap_or_default(), c)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    keyed.into_iter().map(|(_, f)| f).collect()
}

/// Parameter tuple that determines the strategy id
#[derive(Serialize)]
struct IdentityParams<'a> {
    margin: Decimal,
    top_n: usize,
    stake: Decimal,
    filters: &'a [StrategyFilter],
}

fn compute_strategy_id(margin: Decimal, top_n: usize, stake: Decimal, filters: &[StrategyFilter]) -> String {
    // serde_json::Value objects are BTreeMap-backed, so keys come out sorted.
    let value = serde_json::to_value(IdentityParams {
        margin,
        top_n,
        stake,
        filters,
    })
    .unwrap_or_default();
    let hash = Sha256::digest(value.to_string().as_bytes());
    let hex = format!("{:x}", hash);
    format!("strat_{}", &hex[..16])
}

/// Hash of the simulator's evaluation source, recorded on every strategy so
/// experience can be traced back to the logic that produced it.
pub fn evaluation_code_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| {
        let hash = Sha256::digest(include_str!("simulator.rs").as_bytes());
        format!("{:x}", hash)[..16].to_string()
    })
}

/// Immutable description of one betting strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    /// Divisor applied to fair odds; 1.0 means no margin
    pub margin: Decimal,
    /// Number of runners bet per race, by model_prob rank
    pub top_n: usize,
    /// Fixed stake per bet
    pub stake: Decimal,
    pub filters: Vec<StrategyFilter>,
    pub version: String,
    pub code_hash: String,
}

impl StrategyConfig {
    /// Build a validated, canonicalised config. The margin must be above 1.
    pub fn new(
        margin: Decimal,
        top_n: usize,
        stake: Decimal,
        filters: Vec<StrategyFilter>,
    ) -> EngineResult<Self> {
        validate_params(margin, top_n, stake, &filters)?;
        Ok(Self::assemble(margin, top_n, stake, filters))
    }

    /// Fair-odds config (margin exactly 1) for checking edge arithmetic.
    #[cfg(test)]
    pub(crate) fn fair_odds(top_n: usize, stake: Decimal, filters: Vec<StrategyFilter>) -> Self {
        Self::assemble(Decimal::ONE, top_n, stake, filters)
    }

    fn assemble(margin: Decimal, top_n: usize, stake: Decimal, filters: Vec<StrategyFilter>) -> Self {
        let margin = margin.normalize();
        let stake = stake.normalize();
        let filters = canonical_filters(&filters);

        Self {
            strategy_id: compute_strategy_id(margin, top_n, stake, &filters),
            margin,
            top_n,
            stake,
            filters,
            version: STRATEGY_VERSION.to_string(),
            code_hash: evaluation_code_hash().to_string(),
        }
    }

    /// Re-check a config that may have been deserialized rather than built.
    pub fn validate(&self) -> EngineResult<()> {
        validate_params(self.margin, self.top_n, self.stake, &self.filters)
    }

    /// Looser check used by the simulator: the edge formula is defined for
    /// any margin >= 1, so fair-odds configs can still be evaluated.
    pub(crate) fn validate_for_evaluation(&self) -> EngineResult<()> {
        if self.margin < Decimal::ONE {
            return Err(EngineError::validation(format!(
                "margin must be >= 1, got {}",
                self.margin
            )));
        }
        validate_shape(self.top_n, self.stake, &self.filters)
    }

    pub fn margin_f64(&self) -> f64 {
        self.margin.to_f64().unwrap_or(1.0)
    }

    pub fn stake_f64(&self) -> f64 {
        self.stake.to_f64().unwrap_or(0.0)
    }

    /// Canonical JSON of the full parameter set (sorted keys)
    pub fn params_json(&self) -> String {
        serde_json::to_value(self)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    /// Whether a runner passes every filter
    pub fn admits(&self, runner: &Runner) -> bool {
        self.filters.iter().all(|f| f.matches(runner))
    }
}

fn validate_params(
    margin: Decimal,
    top_n: usize,
    stake: Decimal,
    filters: &[StrategyFilter],
) -> EngineResult<()> {
    if margin <= Decimal::ONE {
        return Err(EngineError::validation(format!(
            "margin must be > 1, got {margin}"
        )));
    }
    validate_shape(top_n, stake, filters)
}

fn validate_shape(top_n: usize, stake: Decimal, filters: &[StrategyFilter]) -> EngineResult<()> {
    if top_n < 1 {
        return Err(EngineError::validation("top_n must be >= 1"));
    }
    if stake <= Decimal::ZERO {
        return Err(EngineError::validation(format!(
            "stake must be > 0, got {stake}"
        )));
    }
    for filter in filters {
        filter.validate()?;
    }
    Ok(())
}

/// Axes of the strategy grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSpec {
    pub margins: Vec<Decimal>,
    pub top_ns: Vec<usize>,
    pub stakes: Vec<Decimal>,
    /// Each entry is one filter combination; `[[]]` means unfiltered.
    pub filter_sets: Vec<Vec<StrategyFilter>>,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            margins: vec![dec!(1.02), dec!(1.05), dec!(1.08)],
            top_ns: vec![1, 2],
            stakes: vec![dec!(1)],
            filter_sets: vec![Vec::new()],
        }
    }
}

impl GridSpec {
    pub fn size(&self) -> usize {
        self.margins.len() * self.top_ns.len() * self.stakes.len() * self.filter_sets.len()
    }
}

/// Generates the deterministic strategy set
pub struct StrategyGrid;

impl StrategyGrid {
    /// Cross product of the grid axes in declaration order, de-duplicated by id.
    pub fn build(spec: &GridSpec) -> EngineResult<Vec<StrategyConfig>> {
        if spec.margins.is_empty()
            || spec.top_ns.is_empty()
            || spec.stakes.is_empty()
            || spec.filter_sets.is_empty()
        {
            return Err(EngineError::validation(
                "grid axes must each have at least one value",
            ));
        }
        if spec.size() > MAX_GRID_SIZE {
            return Err(EngineError::validation(format!(
                "grid has {} combinations, maximum is {}",
                spec.size(),
                MAX_GRID_SIZE
            )));
        }
        if let Some(bad) = spec.margins.iter().find(|m| **m <= Decimal::ONE) {
            return Err(EngineError::validation(format!(
                "grid margins must be > 1, got {bad}"
            )));
        }

        let mut seen = HashSet::new();
        let mut grid = Vec::with_capacity(spec.size());
        for &margin in &spec.margins {
            for &top_n in &spec.top_ns {
                for &stake in &spec.stakes {
                    for filters in &spec.filter_sets {
                        let config = StrategyConfig::new(margin, top_n, stake, filters.clone())?;
                        if seen.insert(config.strategy_id.clone()) {
                            grid.push(config);
                        }
                    }
                }
            }
        }

        info!(strategies = grid.len(), "Strategy grid generated");
        Ok(grid)
    }

    pub fn default_grid() -> EngineResult<Vec<StrategyConfig>> {
        Self::build(&GridSpec::default())
    }
}
