//! Strategy evaluation over a scored race dataset
//!
//! Selection is purely by model probability rank: within each race the
//! `top_n` admitted runners with the highest `model_prob` are bet, everything
//! else admitted is skipped. Edge is recorded per runner for diagnostics only.

use persistence::{Action, ExperienceRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use tracing::debug;

use crate::dataset::{DataQuality, RaceDataset, Runner};
use crate::error::EngineResult;
use crate::strategy::StrategyConfig;
use crate::types::nan_as_null;

/// Market odds minus margin-adjusted fair odds
pub fn compute_edge(win_odds: f64, model_prob: f64, margin: f64) -> f64 {
    win_odds - (1.0 / model_prob) / margin
}

/// Profit of one decision. Skips always return zero; bets on unresolved
/// races return `None`.
pub fn settle_profit(action: Action, stake: f64, win_odds: f64, won: Option<bool>) -> Option<f64> {
    match (action, won) {
        (Action::Skip, _) => Some(0.0),
        (Action::Bet, Some(true)) => Some(stake * (win_odds - 1.0)),
        (Action::Bet, Some(false)) => Some(-stake),
        (Action::Bet, None) => None,
    }
}

/// Short hash of the runner's racing context
pub fn context_hash(runner: &Runner) -> String {
    let context = serde_json::json!({
        "track": runner.track,
        "state": runner.state,
        "distance": runner.distance,
        "racing_type": runner.racing_type,
        "race_type": runner.race_type,
    });
    let hash = Sha256::digest(context.to_string().as_bytes());
    format!("{:x}", hash)[..16].to_string()
}

/// Whether outcome-dependent metrics are available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    /// Every bet has a known result
    Settled,
    /// Some bets are still pending; metrics cover settled bets only
    Partial,
    /// No result is known anywhere in the dataset
    Unsettled,
}

/// Aggregate outcome of one strategy over one dataset.
///
/// Outcome fields are `None` when the dataset is unsettled. Ratios are NaN
/// (serialized as `null`) when their denominator is zero.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub strategy_id: String,
    pub settlement: Settlement,
    pub races_evaluated: usize,
    pub runners_evaluated: usize,
    pub total_bets: usize,
    pub settled_bets: usize,
    pub pending_bets: usize,
    pub wins: Option<usize>,
    pub hit_rate: Option<f64>,
    pub total_staked: f64,
    pub total_profit: Option<f64>,
    pub pot_pct: Option<f64>,
    pub roi_pct: Option<f64>,
    #[serde(with = "nan_as_null")]
    pub mean_edge: f64,
    pub data_quality: DataQuality,
}

/// Result plus the per-runner experience it was computed from
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub result: SimulationResult,
    pub records: Vec<ExperienceRecord>,
}

fn rank_order(a: &Runner, b: &Runner) -> Ordering {
    b.model_prob
        .total_cmp(&a.model_prob)
        .then_with(|| a.win_odds.total_cmp(&b.win_odds))
        .then_with(|| a.index.cmp(&b.index))
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        f64::NAN
    }
}

pub struct Simulator;

impl Simulator {
    /// Evaluate one strategy. Deterministic: the same dataset and config always
    /// produce identical records in identical order.
    pub fn evaluate(dataset: &RaceDataset, config: &StrategyConfig) -> EngineResult<Evaluation> {
        config.validate_for_evaluation()?;

        let margin = config.margin_f64();
        let stake = config.stake_f64();
        let params = config.params_json();

        let mut records = Vec::new();
        let mut races_evaluated = 0;
        let mut total_bets = 0usize;
        let mut settled_bets = 0usize;
        let mut wins = 0usize;
        let mut profit_sum = 0.0;
        let mut edge_sum = 0.0;

        for race in dataset.races() {
            let mut admitted: Vec<&Runner> = race.runners.iter().filter(|r| config.admits(r)).collect();
            if admitted.is_empty() {
                continue;
            }
            races_evaluated += 1;

            let mut ranked = admitted.clone();
            ranked.sort_by(|a, b| rank_order(a, b));
            let selected: Vec<usize> = ranked.iter().take(config.top_n).map(|r| r.index).collect();

            // Emit in input order
            admitted.sort_by_key(|r| r.index);
            for runner in admitted {
                let edge = compute_edge(runner.win_odds, runner.model_prob, margin);
                let (action, runner_stake) = if selected.contains(&runner.index) {
                    (Action::Bet, stake)
                } else {
                    (Action::Skip, 0.0)
                };
                let profit = settle_profit(action, runner_stake, runner.win_odds, runner.won_flag);

                if action == Action::Bet {
                    total_bets += 1;
                    edge_sum += edge;
                    if let Some(p) = profit {
                        settled_bets += 1;
                        profit_sum += p;
                    }
                    if runner.won_flag == Some(true) {
                        wins += 1;
                    }
                }

                records.push(ExperienceRecord {
                    event_date: runner.event_date,
                    strategy_id: config.strategy_id.clone(),
                    race_id: runner.race_id.clone(),
                    runner_id: runner.runner_id.clone(),
                    selection_id: runner.selection_id,
                    track: runner.track.clone(),
                    race_no: runner.race_no,
                    action,
                    stake: runner_stake,
                    profit,
                    model_prob: runner.model_prob,
                    win_odds: runner.win_odds,
                    edge,
                    won_flag: runner.won_flag,
                    context_hash: context_hash(runner),
                    distance: runner.distance,
                    racing_type: runner.racing_type.clone(),
                    race_type: runner.race_type.clone(),
                    state: runner.state.clone(),
                    params: params.clone(),
                });
            }
        }

        let pending_bets = total_bets - settled_bets;
        let settlement = if !dataset.has_outcomes() {
            Settlement::Unsettled
        } else if pending_bets > 0 {
            Settlement::Partial
        } else {
            Settlement::Settled
        };

        let settled_staked = stake * settled_bets as f64;
        let (wins, hit_rate, total_profit, pot_pct, roi_pct) = match settlement {
            Settlement::Unsettled => (None, None, None, None, None),
            Settlement::Settled | Settlement::Partial => {
                let pot = ratio(profit_sum, settled_staked) * 100.0;
                (
                    Some(wins),
                    Some(ratio(wins as f64, settled_bets as f64)),
                    Some(profit_sum),
                    Some(pot),
                    // Fixed stake: mean per-bet return equals pot
                    Some(pot),
                )
            }
        };

        let result = SimulationResult {
            strategy_id: config.strategy_id.clone(),
            settlement,
            races_evaluated,
            runners_evaluated: records.len(),
            total_bets,
            settled_bets,
            pending_bets,
            wins,
            hit_rate,
            total_staked: stake * total_bets as f64,
            total_profit,
            pot_pct,
            roi_pct,
            mean_edge: ratio(edge_sum, total_bets as f64),
            data_quality: dataset.quality().clone(),
        };

        debug!(
            strategy_id = %result.strategy_id,
            bets = result.total_bets,
            settled = result.settled_bets,
            profit = ?result.total_profit,
            "Strategy evaluated"
        );

        Ok(Evaluation { result, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::obs;
    use crate::strategy::StrategyFilter;
    use rust_decimal_macros::dec;

    fn r1(won_a: Option<bool>) -> RaceDataset {
        let lost = won_a.map(|_| false);
        RaceDataset::from_rows(vec![
            obs("R1", "A", 0.5, 2.5, won_a),
            obs("R1", "B", 0.3, 4.0, lost),
            obs("R1", "C", 0.2, 6.0, lost),
        ])
        .unwrap()
    }

    fn fair_baseline() -> StrategyConfig {
        StrategyConfig::fair_odds(1, dec!(1), vec![])
    }

    #[test]
    fn test_edge_formula() {
        assert!((compute_edge(2.5, 0.5, 1.0) - 0.5).abs() < 1e-12);
        assert!((compute_edge(4.0, 0.3, 1.0) - (4.0 - 1.0 / 0.3)).abs() < 1e-12);
        assert!((compute_edge(2.5, 0.5, 1.05) - (2.5 - 2.0 / 1.05)).abs() < 1e-12);
    }

    #[test]
    fn test_settle_profit() {
        assert_eq!(settle_profit(Action::Bet, 2.0, 3.0, Some(true)), Some(4.0));
        assert_eq!(settle_profit(Action::Bet, 2.0, 3.0, Some(false)), Some(-2.0));
        assert_eq!(settle_profit(Action::Bet, 2.0, 3.0, None), None);
        assert_eq!(settle_profit(Action::Skip, 0.0, 3.0, Some(true)), Some(0.0));
    }

    #[test]
    fn test_selects_favourite_over_higher_edge() {
        let eval = Simulator::evaluate(&r1(Some(true)), &fair_baseline()).unwrap();

        let by_runner = |id: &str| eval.records.iter().find(|r| r.runner_id == id).unwrap();
        assert!((by_runner("A").edge - 0.5).abs() < 1e-9);
        assert!((by_runner("B").edge - 0.6667).abs() < 1e-3);
        assert!((by_runner("C").edge - 1.0).abs() < 1e-9);

        assert_eq!(by_runner("A").action, Action::Bet);
        assert_eq!(by_runner("B").action, Action::Skip);
        assert_eq!(by_runner("C").action, Action::Skip);
        assert_eq!(by_runner("B").stake, 0.0);
        assert_eq!(by_runner("B").profit, Some(0.0));

        let result = eval.result;
        assert_eq!(result.settlement, Settlement::Settled);
        assert_eq!(result.total_bets, 1);
        assert_eq!(result.wins, Some(1));
        assert_eq!(result.total_profit, Some(1.5));
        assert_eq!(result.pot_pct, Some(150.0));
        assert_eq!(result.hit_rate, Some(1.0));
    }

    #[test]
    fn test_losing_bet_costs_stake() {
        let eval = Simulator::evaluate(&r1(Some(false)), &fair_baseline()).unwrap();
        assert_eq!(eval.result.total_profit, Some(-1.0));
        assert_eq!(eval.result.pot_pct, Some(-100.0));
        assert_eq!(eval.result.hit_rate, Some(0.0));
    }

    #[test]
    fn test_unsettled_dataset_withholds_outcomes() {
        let eval = Simulator::evaluate(&r1(None), &fair_baseline()).unwrap();
        let result = eval.result;
        assert_eq!(result.settlement, Settlement::Unsettled);
        assert_eq!(result.total_bets, 1);
        assert_eq!(result.pending_bets, 1);
        assert_eq!(result.total_staked, 1.0);
        assert_eq!(result.wins, None);
        assert_eq!(result.hit_rate, None);
        assert_eq!(result.total_profit, None);
        assert_eq!(result.pot_pct, None);

        let bet = eval.records.iter().find(|r| r.is_bet()).unwrap();
        assert_eq!(bet.profit, None);
        assert_eq!(bet.won_flag, None);
    }

    #[test]
    fn test_tie_break_on_lower_odds_then_input_order() {
        let dataset = RaceDataset::from_rows(vec![
            obs("R1", "A", 0.4, 3.0, Some(false)),
            obs("R1", "B", 0.4, 2.5, Some(true)),
            obs("R1", "C", 0.2, 5.0, Some(false)),
            obs("R2", "D", 0.3, 3.0, Some(false)),
            obs("R2", "E", 0.3, 3.0, Some(true)),
        ])
        .unwrap();
        let eval = Simulator::evaluate(&dataset, &fair_baseline()).unwrap();
        let bets: Vec<&str> = eval
            .records
            .iter()
            .filter(|r| r.is_bet())
            .map(|r| r.runner_id.as_str())
            .collect();
        assert_eq!(bets, vec!["B", "D"]);
    }

    #[test]
    fn test_top_n_larger_than_field_bets_everyone() {
        let config = StrategyConfig::new(dec!(1.05), 5, dec!(2), vec![]).unwrap();
        let eval = Simulator::evaluate(&r1(Some(true)), &config).unwrap();
        assert_eq!(eval.result.total_bets, 3);
        assert_eq!(eval.result.total_staked, 6.0);
        // 2*(2.5-1) - 2 - 2
        assert_eq!(eval.result.total_profit, Some(-1.0));
    }

    #[test]
    fn test_conservation() {
        let dataset = RaceDataset::from_rows(vec![
            obs("R1", "A", 0.5, 2.5, Some(true)),
            obs("R1", "B", 0.3, 4.0, Some(false)),
            obs("R2", "C", 0.6, 1.8, Some(false)),
            obs("R2", "D", 0.25, 5.0, Some(true)),
            obs("R3", "E", 0.35, 3.2, Some(false)),
            obs("R3", "F", 0.33, 3.4, Some(true)),
        ])
        .unwrap();
        let config = StrategyConfig::new(dec!(1.05), 2, dec!(1.5), vec![]).unwrap();
        let eval = Simulator::evaluate(&dataset, &config).unwrap();

        let bets: Vec<&ExperienceRecord> = eval.records.iter().filter(|r| r.is_bet()).collect();
        let profit: f64 = bets.iter().filter_map(|r| r.profit).sum();
        assert_eq!(eval.result.total_bets, bets.len());
        assert!((eval.result.total_profit.unwrap() - profit).abs() < 1e-12);
        assert_eq!(eval.result.total_staked, 1.5 * bets.len() as f64);
        assert!(eval
            .records
            .iter()
            .filter(|r| !r.is_bet())
            .all(|r| r.stake == 0.0 && r.profit == Some(0.0)));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let config = StrategyConfig::new(dec!(1.08), 2, dec!(1), vec![]).unwrap();
        let a = Simulator::evaluate(&r1(Some(true)), &config).unwrap();
        let b = Simulator::evaluate(&r1(Some(true)), &config).unwrap();
        assert_eq!(a.records, b.records);
    }

    #[test]
    fn test_filters_exclude_runners_before_ranking() {
        let config = StrategyConfig::new(
            dec!(1.05),
            1,
            dec!(1),
            vec![StrategyFilter::MaxWinOdds { max: dec!(5) }],
        )
        .unwrap();
        let eval = Simulator::evaluate(&r1(Some(true)), &config).unwrap();
        assert_eq!(eval.records.len(), 2);
        assert!(eval.records.iter().all(|r| r.runner_id != "C"));

        let excluded = StrategyConfig::new(
            dec!(1.05),
            1,
            dec!(1),
            vec![StrategyFilter::ExcludeTracks {
                tracks: vec!["Flemington".into()],
            }],
        )
        .unwrap();
        let eval = Simulator::evaluate(&r1(Some(true)), &excluded).unwrap();
        assert!(eval.records.is_empty());
        assert_eq!(eval.result.total_bets, 0);
        assert!(eval.result.hit_rate.unwrap().is_nan());
        assert!(eval.result.pot_pct.unwrap().is_nan());
        assert!(eval.result.mean_edge.is_nan());
    }

    #[test]
    fn test_partial_settlement_uses_settled_bets() {
        let dataset = RaceDataset::from_rows(vec![
            obs("R1", "A", 0.5, 2.5, Some(true)),
            obs("R2", "B", 0.5, 3.0, None),
        ])
        .unwrap();
        let eval = Simulator::evaluate(&dataset, &fair_baseline()).unwrap();
        let result = eval.result;
        assert_eq!(result.settlement, Settlement::Partial);
        assert_eq!(result.settled_bets, 1);
        assert_eq!(result.pending_bets, 1);
        assert_eq!(result.total_staked, 2.0);
        assert_eq!(result.pot_pct, Some(150.0));
    }

    #[test]
    fn test_records_carry_params_and_context() {
        let config = fair_baseline();
        let eval = Simulator::evaluate(&r1(Some(true)), &config).unwrap();
        let first = &eval.records[0];
        assert_eq!(first.params, config.params_json());
        assert_eq!(first.context_hash.len(), 16);
        // Same context for every runner in the race
        assert!(eval.records.iter().all(|r| r.context_hash == first.context_hash));
    }

    #[test]
    fn test_dropped_rows_reported_in_result() {
        let mut bad = obs("R1", "D", 0.1, 9.0, Some(false));
        bad.win_odds = None;
        let dataset = RaceDataset::from_rows(vec![obs("R1", "A", 0.5, 2.5, Some(true)), bad]).unwrap();
        let eval = Simulator::evaluate(&dataset, &fair_baseline()).unwrap();
        assert_eq!(eval.result.data_quality.rows_dropped, 1);
        assert_eq!(eval.result.data_quality.missing_odds, 1);
    }
}
