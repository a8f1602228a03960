//! Reflection over accumulated experience and playbook assembly
//!
//! Every pass recomputes all metrics from the raw experience records; nothing
//! is carried forward incrementally from an earlier playbook. Only settled bets
//! (known result, known profit) count toward metrics and significance.

use chrono::{DateTime, NaiveDate, Utc};
use persistence::{DateRange, ExperienceRecord, ExperienceStore, PlaybookStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::{AceConfig, ReflectionConfig};
use crate::error::EngineResult;
use crate::stats::{binomial_two_sided_p, effective_threshold, wilson_interval, NullHypothesis};
use crate::strategy::STRATEGY_VERSION;
use crate::types::{nan_as_null, DistanceBand};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookMetadata {
    pub generated_at: DateTime<Utc>,
    pub experience_rows: usize,
    pub strategies_evaluated: usize,
    pub strategy_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_bets: usize,
    #[serde(default)]
    pub pending_bets: usize,
    pub total_profit: f64,
    pub total_staked: f64,
    #[serde(with = "nan_as_null")]
    pub pot_pct: f64,
    #[serde(with = "nan_as_null")]
    pub hit_rate: f64,
}

/// Full statistics for one strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub strategy_id: String,
    /// Settled bets
    pub bets: usize,
    /// Bets on races without a known result; excluded from every other field
    #[serde(default)]
    pub pending_bets: usize,
    pub wins: usize,
    #[serde(with = "nan_as_null")]
    pub hit_rate: f64,
    #[serde(with = "nan_as_null")]
    pub mean_edge: f64,
    pub total_staked: f64,
    pub total_profit: f64,
    #[serde(with = "nan_as_null")]
    pub pot_pct: f64,
    #[serde(with = "nan_as_null")]
    pub roi_pct: f64,
    #[serde(with = "nan_as_null")]
    pub null_rate: f64,
    #[serde(with = "nan_as_null")]
    pub p_value: f64,
    #[serde(with = "nan_as_null")]
    pub hit_rate_ci_low: f64,
    #[serde(with = "nan_as_null")]
    pub hit_rate_ci_high: f64,
    #[serde(default)]
    pub significant: bool,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInsight {
    pub track: String,
    pub bets: usize,
    pub profit: f64,
    #[serde(with = "nan_as_null")]
    pub pot_pct: f64,
    #[serde(with = "nan_as_null")]
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInsight {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_band: Option<DistanceBand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub racing_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub race_type: Option<String>,
    pub bets: usize,
    pub profit: f64,
    #[serde(with = "nan_as_null")]
    pub pot_pct: f64,
}

/// How the ranked list was filtered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceSummary {
    pub null_hypothesis: NullHypothesis,
    pub min_bets: usize,
    pub max_pvalue: f64,
    pub apply_correction: bool,
    /// Strategies with at least `min_bets` settled bets
    pub qualifying: usize,
    pub effective_threshold: f64,
    pub significant: usize,
    pub confidence_level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub metadata: PlaybookMetadata,
    pub global: GlobalMetrics,
    /// Significant strategies ranked by pot_pct
    pub strategies: Vec<StrategyMetrics>,
    pub tracks: Vec<TrackInsight>,
    pub contexts: Vec<ContextInsight>,
    pub significance: SignificanceSummary,
    /// Every strategy, significant or not, ordered by strategy_id
    pub all_strategies: Vec<StrategyMetrics>,
}

/// Outcome of a reflection pass
#[derive(Debug, Clone)]
pub enum Reflection {
    /// No experience in scope; nothing to learn and nothing persisted
    Empty,
    Ready(Box<Playbook>),
}

impl Reflection {
    pub fn playbook(&self) -> Option<&Playbook> {
        match self {
            Reflection::Empty => None,
            Reflection::Ready(playbook) => Some(playbook.as_ref()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Reflection::Empty)
    }
}

/// Running totals over settled bets
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    bets: usize,
    wins: usize,
    staked: f64,
    profit: f64,
    edge: f64,
    /// Sum of per-bet profit / stake
    returns: f64,
}

impl Tally {
    fn add(&mut self, record: &ExperienceRecord, profit: f64) {
        self.bets += 1;
        if record.won_flag == Some(true) {
            self.wins += 1;
        }
        self.staked += record.stake;
        self.profit += profit;
        self.edge += record.edge;
        if record.stake > 0.0 {
            self.returns += profit / record.stake;
        }
    }

    fn pot_pct(&self) -> f64 {
        if self.staked > 0.0 {
            self.profit / self.staked * 100.0
        } else {
            f64::NAN
        }
    }

    fn roi_pct(&self) -> f64 {
        per_bet(self.returns, self.bets) * 100.0
    }

    fn hit_rate(&self) -> f64 {
        per_bet(self.wins as f64, self.bets)
    }

    fn mean_edge(&self) -> f64 {
        per_bet(self.edge, self.bets)
    }
}

fn per_bet(total: f64, bets: usize) -> f64 {
    if bets > 0 {
        total / bets as f64
    } else {
        f64::NAN
    }
}

/// A bet with a known outcome and its profit
fn settled(record: &ExperienceRecord) -> Option<f64> {
    if !record.is_bet() || record.won_flag.is_none() {
        return None;
    }
    record.profit
}

fn parse_params(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn by_pot_desc(a: f64, b: f64) -> std::cmp::Ordering {
    b.total_cmp(&a)
}

#[derive(Default)]
struct StrategyAccumulator<'a> {
    tally: Tally,
    pending: usize,
    settled_odds: Vec<f64>,
    params: Option<&'a str>,
}

type ContextKey = (String, Option<DistanceBand>, Option<String>, Option<String>);

/// Turns raw experience into a playbook
pub struct Reflector {
    config: ReflectionConfig,
}

impl Reflector {
    pub fn new(config: ReflectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReflectionConfig {
        &self.config
    }

    pub fn reflect(&self, experience: &[ExperienceRecord], generated_at: DateTime<Utc>) -> Reflection {
        if experience.is_empty() {
            info!("No experience in range, playbook not generated");
            return Reflection::Empty;
        }

        let cfg = &self.config;
        let mut per_strategy: BTreeMap<&str, StrategyAccumulator> = BTreeMap::new();
        let mut per_track: BTreeMap<&str, Tally> = BTreeMap::new();
        let mut per_context: BTreeMap<ContextKey, Tally> = BTreeMap::new();
        let mut global = Tally::default();
        let mut global_pending = 0usize;

        for record in experience {
            let acc = per_strategy.entry(record.strategy_id.as_str()).or_default();
            acc.params.get_or_insert(record.params.as_str());

            if !record.is_bet() {
                continue;
            }
            let Some(profit) = settled(record) else {
                acc.pending += 1;
                global_pending += 1;
                continue;
            };

            acc.tally.add(record, profit);
            acc.settled_odds.push(record.win_odds);
            global.add(record, profit);
            per_track.entry(record.track.as_str()).or_default().add(record, profit);

            let key = (
                record.track.clone(),
                record.distance.and_then(DistanceBand::from_distance),
                record.racing_type.clone(),
                record.race_type.clone(),
            );
            per_context.entry(key).or_default().add(record, profit);
        }

        let mut all_strategies: Vec<StrategyMetrics> = per_strategy
            .into_iter()
            .map(|(id, acc)| self.strategy_metrics(id, acc))
            .collect();

        let qualifying = all_strategies
            .iter()
            .filter(|m| m.bets >= cfg.min_bets)
            .count();
        let threshold = effective_threshold(cfg.max_pvalue, qualifying, cfg.apply_correction);

        for m in all_strategies.iter_mut() {
            m.significant = m.bets >= cfg.min_bets && m.p_value < threshold;
        }

        let mut strategies: Vec<StrategyMetrics> =
            all_strategies.iter().filter(|m| m.significant).cloned().collect();
        let significant = strategies.len();
        strategies.sort_by(|a, b| {
            by_pot_desc(a.pot_pct, b.pot_pct).then_with(|| a.strategy_id.cmp(&b.strategy_id))
        });
        strategies.truncate(cfg.top_strategies);

        let mut tracks: Vec<TrackInsight> = per_track
            .into_iter()
            .filter(|(_, t)| t.bets >= cfg.min_bets)
            .map(|(track, t)| TrackInsight {
                track: track.to_string(),
                bets: t.bets,
                profit: t.profit,
                pot_pct: t.pot_pct(),
                hit_rate: t.hit_rate(),
            })
            .collect();
        tracks.sort_by(|a, b| by_pot_desc(a.pot_pct, b.pot_pct).then_with(|| a.track.cmp(&b.track)));

        let mut contexts: Vec<ContextInsight> = per_context
            .into_iter()
            .filter(|(_, t)| t.bets >= cfg.min_bets)
            .map(|((track, distance_band, racing_type, race_type), t)| ContextInsight {
                track: Some(track),
                distance_band,
                racing_type,
                race_type,
                bets: t.bets,
                profit: t.profit,
                pot_pct: t.pot_pct(),
            })
            .collect();
        // Stable sort keeps key order among equal pot
        contexts.sort_by(|a, b| by_pot_desc(a.pot_pct, b.pot_pct));
        contexts.truncate(cfg.max_context_insights);

        let date_range = date_span(experience).map(|(start, end)| DateRange { start, end });

        let playbook = Playbook {
            metadata: PlaybookMetadata {
                generated_at,
                experience_rows: experience.len(),
                strategies_evaluated: all_strategies.len(),
                strategy_version: STRATEGY_VERSION.to_string(),
                date_range,
            },
            global: GlobalMetrics {
                total_bets: global.bets,
                pending_bets: global_pending,
                total_profit: global.profit,
                total_staked: global.staked,
                pot_pct: global.pot_pct(),
                hit_rate: global.hit_rate(),
            },
            strategies,
            tracks,
            contexts,
            significance: SignificanceSummary {
                null_hypothesis: cfg.null_hypothesis,
                min_bets: cfg.min_bets,
                max_pvalue: cfg.max_pvalue,
                apply_correction: cfg.apply_correction,
                qualifying,
                effective_threshold: threshold,
                significant,
                confidence_level: cfg.confidence_level,
            },
            all_strategies,
        };

        info!(
            rows = playbook.metadata.experience_rows,
            strategies = playbook.metadata.strategies_evaluated,
            qualifying,
            significant,
            threshold,
            tracks = playbook.tracks.len(),
            contexts = playbook.contexts.len(),
            "Reflection complete"
        );

        Reflection::Ready(Box::new(playbook))
    }

    fn strategy_metrics(&self, strategy_id: &str, acc: StrategyAccumulator) -> StrategyMetrics {
        let t = acc.tally;
        let null_rate = self.config.null_hypothesis.rate(acc.settled_odds);
        let (p_value, ci_low, ci_high) = if t.bets > 0 {
            let (low, high) =
                wilson_interval(t.wins as u64, t.bets as u64, self.config.confidence_level);
            let p = if null_rate.is_finite() {
                binomial_two_sided_p(t.wins as u64, t.bets as u64, null_rate)
            } else {
                f64::NAN
            };
            (p, low, high)
        } else {
            (f64::NAN, f64::NAN, f64::NAN)
        };

        debug!(
            strategy_id,
            bets = t.bets,
            wins = t.wins,
            p_value,
            "Strategy metrics"
        );

        StrategyMetrics {
            strategy_id: strategy_id.to_string(),
            bets: t.bets,
            pending_bets: acc.pending,
            wins: t.wins,
            hit_rate: t.hit_rate(),
            mean_edge: t.mean_edge(),
            total_staked: t.staked,
            total_profit: t.profit,
            pot_pct: t.pot_pct(),
            roi_pct: t.roi_pct(),
            null_rate,
            p_value,
            hit_rate_ci_low: ci_low,
            hit_rate_ci_high: ci_high,
            significant: false,
            params: acc.params.map(parse_params).unwrap_or(Value::Null),
        }
    }
}

fn date_span(experience: &[ExperienceRecord]) -> Option<(NaiveDate, NaiveDate)> {
    let mut dates = experience.iter().map(|r| r.event_date);
    let first = dates.next()?;
    Some(dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
}

/// Reads experience, reflects and persists the playbook
pub struct PlaybookBuilder {
    experience: ExperienceStore,
    playbooks: PlaybookStore,
    reflector: Reflector,
}

impl PlaybookBuilder {
    pub fn new(experience: ExperienceStore, playbooks: PlaybookStore, reflector: Reflector) -> Self {
        Self {
            experience,
            playbooks,
            reflector,
        }
    }

    pub fn from_config(config: &AceConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self::new(
            config.experience_store()?,
            config.playbook_store(),
            Reflector::new(config.reflection.clone()),
        ))
    }

    /// One reflection pass over `range`. An empty range yields
    /// [`Reflection::Empty`] and leaves the playbook file untouched.
    pub fn build(&self, range: &DateRange, generated_at: DateTime<Utc>) -> EngineResult<Reflection> {
        let experience = self.experience.read(range)?;
        let reflection = self.reflector.reflect(&experience, generated_at);
        if let Reflection::Ready(playbook) = &reflection {
            self.persist(playbook)?;
        }
        Ok(reflection)
    }

    fn persist(&self, playbook: &Playbook) -> EngineResult<PathBuf> {
        let snapshot = serde_json::to_value(playbook).map_err(persistence::StoreError::from)?;
        Ok(self.playbooks.save(snapshot)?)
    }

    /// Most recently committed playbook
    pub fn latest(&self) -> EngineResult<Option<Playbook>> {
        let Some(value) = self.playbooks.latest()? else {
            return Ok(None);
        };
        let playbook = serde_json::from_value(value).map_err(|e| persistence::StoreError::Corrupt {
            path: self.playbooks.path().to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Some(playbook))
    }

    pub fn history_len(&self) -> EngineResult<usize> {
        Ok(self.playbooks.history()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::{Action, PartitionScheme};
    use tempfile::tempdir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 18).unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-07-19T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// `total` settled even-money bets, the first `wins` of which won
    fn bets(strategy: &str, total: usize, wins: usize, track: &str) -> Vec<ExperienceRecord> {
        (0..total)
            .map(|i| {
                let won = i < wins;
                ExperienceRecord {
                    event_date: day(),
                    strategy_id: strategy.to_string(),
                    race_id: format!("{track}-R{i}"),
                    runner_id: "A".to_string(),
                    selection_id: i as u64,
                    track: track.to_string(),
                    race_no: 1,
                    action: Action::Bet,
                    stake: 1.0,
                    profit: Some(if won { 1.0 } else { -1.0 }),
                    model_prob: 0.55,
                    win_odds: 2.0,
                    edge: 0.2,
                    won_flag: Some(won),
                    context_hash: "ctx".to_string(),
                    distance: Some(1400),
                    racing_type: Some("Thoroughbred".to_string()),
                    race_type: Some("Maiden".to_string()),
                    state: Some("VIC".to_string()),
                    params: format!(r#"{{"strategy_id":"{strategy}"}}"#),
                }
            })
            .collect()
    }

    fn graded_experience() -> Vec<ExperienceRecord> {
        let mut rows = Vec::new();
        rows.extend(bets("s_strong", 40, 35, "Flemington"));
        rows.extend(bets("s_borderline", 40, 27, "Flemington"));
        rows.extend(bets("s_flat", 40, 20, "Flemington"));
        // Perfect record but too few bets to qualify
        rows.extend(bets("s_small", 10, 10, "Flemington"));
        rows
    }

    fn reflect(config: ReflectionConfig, rows: &[ExperienceRecord]) -> Playbook {
        match Reflector::new(config).reflect(rows, now()) {
            Reflection::Ready(p) => *p,
            Reflection::Empty => panic!("expected a playbook"),
        }
    }

    fn ids(metrics: &[StrategyMetrics]) -> Vec<&str> {
        metrics.iter().map(|m| m.strategy_id.as_str()).collect()
    }

    #[test]
    fn test_empty_experience_is_explicit() {
        let reflection = Reflector::new(ReflectionConfig::default()).reflect(&[], now());
        assert!(reflection.is_empty());
        assert!(reflection.playbook().is_none());
    }

    #[test]
    fn test_bonferroni_filters_borderline_strategy() {
        let playbook = reflect(ReflectionConfig::default(), &graded_experience());

        assert_eq!(playbook.significance.qualifying, 3);
        assert!((playbook.significance.effective_threshold - 0.05 / 3.0).abs() < 1e-12);
        assert_eq!(ids(&playbook.strategies), vec!["s_strong"]);

        let borderline = playbook
            .all_strategies
            .iter()
            .find(|m| m.strategy_id == "s_borderline")
            .unwrap();
        assert!(borderline.p_value < 0.05);
        assert!(borderline.p_value >= playbook.significance.effective_threshold);
        assert!(!borderline.significant);

        for m in &playbook.strategies {
            assert!(m.p_value < playbook.significance.effective_threshold);
        }
    }

    #[test]
    fn test_without_correction_ranks_by_pot() {
        let config = ReflectionConfig {
            apply_correction: false,
            ..ReflectionConfig::default()
        };
        let playbook = reflect(config, &graded_experience());
        assert_eq!(playbook.significance.effective_threshold, 0.05);
        assert_eq!(ids(&playbook.strategies), vec!["s_strong", "s_borderline"]);
        assert!((playbook.strategies[0].pot_pct - 75.0).abs() < 1e-9);
        assert!((playbook.strategies[1].pot_pct - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_samples_stay_out_of_ranking() {
        let playbook = reflect(ReflectionConfig::default(), &graded_experience());
        let small = playbook
            .all_strategies
            .iter()
            .find(|m| m.strategy_id == "s_small")
            .unwrap();
        assert!(small.p_value < 0.01);
        assert!(!small.significant);
        assert!(!ids(&playbook.strategies).contains(&"s_small"));
        assert_eq!(playbook.all_strategies.len(), 4);
        assert_eq!(playbook.metadata.strategies_evaluated, 4);
    }

    #[test]
    fn test_top_strategies_limit() {
        let config = ReflectionConfig {
            apply_correction: false,
            top_strategies: 1,
            ..ReflectionConfig::default()
        };
        let playbook = reflect(config, &graded_experience());
        assert_eq!(ids(&playbook.strategies), vec!["s_strong"]);
        assert_eq!(playbook.significance.significant, 2);
    }

    #[test]
    fn test_ci_contains_hit_rate() {
        let playbook = reflect(ReflectionConfig::default(), &graded_experience());
        for m in &playbook.all_strategies {
            assert!(m.hit_rate_ci_low <= m.hit_rate && m.hit_rate <= m.hit_rate_ci_high);
        }
    }

    #[test]
    fn test_metrics_and_global_conservation() {
        let rows = graded_experience();
        let playbook = reflect(ReflectionConfig::default(), &rows);

        let strong = &playbook.strategies[0];
        assert_eq!(strong.bets, 40);
        assert_eq!(strong.wins, 35);
        assert_eq!(strong.total_staked, 40.0);
        assert_eq!(strong.total_profit, 30.0);
        assert_eq!(strong.roi_pct, strong.pot_pct);
        assert_eq!(strong.params["strategy_id"], "s_strong");

        let expected_profit: f64 = rows.iter().filter_map(|r| r.profit).sum();
        assert_eq!(playbook.global.total_bets, 130);
        assert_eq!(playbook.global.total_staked, 130.0);
        assert!((playbook.global.total_profit - expected_profit).abs() < 1e-9);
        assert_eq!(playbook.metadata.experience_rows, 130);
    }

    #[test]
    fn test_skips_and_pending_bets_do_not_count() {
        let mut rows = bets("s1", 3, 1, "Randwick");
        let mut skip = rows[0].clone();
        skip.runner_id = "B".to_string();
        skip.action = Action::Skip;
        skip.stake = 0.0;
        skip.profit = Some(0.0);
        let mut pending = rows[0].clone();
        pending.race_id = "Randwick-R99".to_string();
        pending.won_flag = None;
        pending.profit = None;
        rows.push(skip);
        rows.push(pending);

        let playbook = reflect(ReflectionConfig::default(), &rows);
        let m = &playbook.all_strategies[0];
        assert_eq!(m.bets, 3);
        assert_eq!(m.pending_bets, 1);
        assert_eq!(m.wins, 1);
        assert_eq!(playbook.global.pending_bets, 1);
    }

    #[test]
    fn test_no_settled_bets_gives_nan_not_zero() {
        let mut rows = bets("s1", 2, 0, "Randwick");
        for r in rows.iter_mut() {
            r.won_flag = None;
            r.profit = None;
        }
        let playbook = reflect(ReflectionConfig::default(), &rows);
        let m = &playbook.all_strategies[0];
        assert_eq!(m.bets, 0);
        assert!(m.pot_pct.is_nan());
        assert!(m.hit_rate.is_nan());
        assert!(m.p_value.is_nan());
        assert!(playbook.global.pot_pct.is_nan());

        let json = serde_json::to_value(&playbook).unwrap();
        assert!(json["global"]["pot_pct"].is_null());
        assert!(json["all_strategies"][0]["p_value"].is_null());
    }

    #[test]
    fn test_track_and_context_groups_need_min_bets() {
        let mut rows = bets("s1", 40, 22, "Flemington");
        rows.extend(bets("s1", 10, 9, "Randwick"));
        let playbook = reflect(ReflectionConfig::default(), &rows);

        let tracks: Vec<&str> = playbook.tracks.iter().map(|t| t.track.as_str()).collect();
        assert_eq!(tracks, vec!["Flemington"]);
        assert_eq!(playbook.tracks[0].bets, 40);

        assert_eq!(playbook.contexts.len(), 1);
        let ctx = &playbook.contexts[0];
        assert_eq!(ctx.track.as_deref(), Some("Flemington"));
        assert_eq!(ctx.distance_band, Some(DistanceBand::From1201To1600));
        assert_eq!(ctx.bets, 40);
    }

    #[test]
    fn test_market_implied_null() {
        let config = ReflectionConfig {
            null_hypothesis: NullHypothesis::MarketImplied,
            ..ReflectionConfig::default()
        };
        let playbook = reflect(config, &bets("s1", 40, 20, "Flemington"));
        let m = &playbook.all_strategies[0];
        // Even-money odds imply 0.5
        assert!((m.null_rate - 0.5).abs() < 1e-12);
        assert!(m.p_value > 0.9);
    }

    #[test]
    fn test_contract_field_names() {
        let playbook = reflect(ReflectionConfig::default(), &graded_experience());
        let json = serde_json::to_value(&playbook).unwrap();

        for key in ["generated_at", "experience_rows", "strategies_evaluated"] {
            assert!(json["metadata"].get(key).is_some(), "metadata.{key}");
        }
        for key in ["total_bets", "total_profit", "total_staked", "pot_pct", "hit_rate"] {
            assert!(json["global"].get(key).is_some(), "global.{key}");
        }
        let strategy = &json["strategies"][0];
        for key in [
            "strategy_id",
            "bets",
            "wins",
            "hit_rate",
            "mean_edge",
            "total_staked",
            "total_profit",
            "pot_pct",
            "roi_pct",
            "p_value",
            "hit_rate_ci_low",
            "hit_rate_ci_high",
            "params",
        ] {
            assert!(strategy.get(key).is_some(), "strategies[0].{key}");
        }
        assert_eq!(json["contexts"][0]["distance_band"], "1201-1600");
    }

    #[test]
    fn test_builder_persists_and_reads_back() {
        let dir = tempdir().unwrap();
        let config = AceConfig {
            experience_dir: dir.path().join("exp"),
            playbook_path: dir.path().join("playbook.json"),
            max_history: 2,
            ..AceConfig::default()
        };
        let store = ExperienceStore::open(&config.experience_dir, PartitionScheme::Month).unwrap();
        store.write(&graded_experience()).unwrap();

        let builder = PlaybookBuilder::from_config(&config).unwrap();
        let range = DateRange::single(day());
        for _ in 0..3 {
            assert!(!builder.build(&range, now()).unwrap().is_empty());
        }
        assert_eq!(builder.history_len().unwrap(), 2);

        let latest = builder.latest().unwrap().unwrap();
        assert_eq!(ids(&latest.strategies), vec!["s_strong"]);
        assert_eq!(latest.metadata.generated_at, now());
        assert_eq!(latest.metadata.experience_rows, 130);
    }

    #[test]
    fn test_builder_empty_range_does_not_persist() {
        let dir = tempdir().unwrap();
        let config = AceConfig {
            experience_dir: dir.path().join("exp"),
            playbook_path: dir.path().join("playbook.json"),
            ..AceConfig::default()
        };
        let builder = PlaybookBuilder::from_config(&config).unwrap();
        let reflection = builder.build(&DateRange::single(day()), now()).unwrap();

        assert!(reflection.is_empty());
        assert!(!config.playbook_path.exists());
        assert!(builder.latest().unwrap().is_none());
    }

    #[test]
    fn test_builder_reports_failed_commit_and_keeps_previous_playbook() {
        let dir = tempdir().unwrap();
        let config = AceConfig {
            experience_dir: dir.path().join("exp"),
            // Fits the filesystem name limit, but its staged temp sibling does not.
            playbook_path: dir.path().join(format!("{}.json", "p".repeat(250))),
            ..AceConfig::default()
        };
        let store = ExperienceStore::open(&config.experience_dir, PartitionScheme::Month).unwrap();
        store.write(&graded_experience()).unwrap();
        std::fs::write(&config.playbook_path, br#"{"history":[],"latest":null}"#).unwrap();

        let builder = PlaybookBuilder::from_config(&config).unwrap();
        let err = builder.build(&DateRange::single(day()), now()).unwrap_err();

        assert!(matches!(
            err,
            crate::error::EngineError::Store(persistence::StoreError::Io { .. })
        ));
        assert_eq!(
            std::fs::read(&config.playbook_path).unwrap(),
            br#"{"history":[],"latest":null}"#
        );
    }
}
