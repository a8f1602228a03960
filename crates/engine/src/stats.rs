//! Significance statistics for strategy hit rates

use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, ContinuousCDF, Discrete, Normal};

use crate::error::{EngineError, EngineResult};

/// Relative tolerance when comparing pmf values in the two-sided test
const PMF_RELATIVE_TOLERANCE: f64 = 1e-7;

/// Baseline hit rate the binomial test compares against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NullHypothesis {
    /// A flat win probability for every bet
    Fixed { rate: f64 },
    /// Mean market-implied probability (1 / win_odds) of the strategy's own bets
    MarketImplied,
}

impl Default for NullHypothesis {
    fn default() -> Self {
        NullHypothesis::Fixed { rate: 0.5 }
    }
}

impl NullHypothesis {
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            NullHypothesis::Fixed { rate } if !(*rate > 0.0 && *rate < 1.0) => Err(
                EngineError::Config(format!("null hypothesis rate must be in (0, 1), got {rate}")),
            ),
            _ => Ok(()),
        }
    }

    /// Null rate for a set of bets given their decimal odds. NaN when the
    /// market-implied baseline has no bets to average.
    pub fn rate<I>(&self, win_odds: I) -> f64
    where
        I: IntoIterator<Item = f64>,
    {
        match self {
            NullHypothesis::Fixed { rate } => *rate,
            NullHypothesis::MarketImplied => {
                let (sum, count) = win_odds
                    .into_iter()
                    .filter(|o| *o > 0.0)
                    .fold((0.0, 0usize), |(s, c), o| (s + 1.0 / o, c + 1));
                if count == 0 {
                    f64::NAN
                } else {
                    (sum / count as f64).clamp(1e-6, 1.0 - 1e-6)
                }
            }
        }
    }
}

/// Exact two-sided binomial test p-value.
///
/// Sums the probability of every outcome no more likely than the observed one
/// (the "minimum likelihood" definition). NaN when there are no trials.
pub fn binomial_two_sided_p(successes: u64, trials: u64, null_rate: f64) -> f64 {
    if trials == 0 || successes > trials || !(0.0..=1.0).contains(&null_rate) {
        return f64::NAN;
    }
    let Ok(dist) = Binomial::new(null_rate, trials) else {
        return f64::NAN;
    };

    let observed = dist.pmf(successes) * (1.0 + PMF_RELATIVE_TOLERANCE);
    let p: f64 = (0..=trials)
        .map(|k| dist.pmf(k))
        .filter(|&pk| pk <= observed)
        .sum();
    p.min(1.0)
}

/// Wilson score interval for a binomial proportion.
///
/// Returns `(NaN, NaN)` when there are no trials. The bounds always contain
/// the observed proportion.
pub fn wilson_interval(successes: u64, trials: u64, confidence: f64) -> (f64, f64) {
    if trials == 0 || successes > trials {
        return (f64::NAN, f64::NAN);
    }
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return (f64::NAN, f64::NAN);
    };
    let z = normal.inverse_cdf(1.0 - (1.0 - confidence) / 2.0);

    let n = trials as f64;
    let phat = successes as f64 / n;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let centre = (phat + z2 / (2.0 * n)) / denom;
    let half = z * (phat * (1.0 - phat) / n + z2 / (4.0 * n * n)).sqrt() / denom;

    let low = if successes == 0 { 0.0 } else { (centre - half).clamp(0.0, phat) };
    let high = if successes == trials { 1.0 } else { (centre + half).clamp(phat, 1.0) };
    (low, high)
}

/// Per-test threshold after the optional Bonferroni correction
pub fn effective_threshold(max_pvalue: f64, qualifying: usize, apply_correction: bool) -> f64 {
    if apply_correction && qualifying > 0 {
        max_pvalue / qualifying as f64
    } else {
        max_pvalue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binomial_six_of_ten() {
        let p = binomial_two_sided_p(6, 10, 0.5);
        assert!((p - 0.75390625).abs() < 1e-9, "p = {p}");
    }

    #[test]
    fn test_binomial_symmetric_extremes() {
        let p = binomial_two_sided_p(0, 10, 0.5);
        assert!((p - 2.0 / 1024.0).abs() < 1e-12);
        let p = binomial_two_sided_p(10, 10, 0.5);
        assert!((p - 2.0 / 1024.0).abs() < 1e-12);
        assert!((binomial_two_sided_p(5, 10, 0.5) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_binomial_asymmetric_null() {
        // 30 wins from 40 bets against a 0.3 baseline is highly significant
        assert!(binomial_two_sided_p(30, 40, 0.3) < 1e-6);
        // near the expectation it is not
        assert!(binomial_two_sided_p(12, 40, 0.3) > 0.5);
    }

    #[test]
    fn test_binomial_no_trials_is_nan() {
        assert!(binomial_two_sided_p(0, 0, 0.5).is_nan());
    }

    #[test]
    fn test_wilson_six_of_ten() {
        let (low, high) = wilson_interval(6, 10, 0.95);
        assert!((low - 0.313).abs() < 0.01, "low = {low}");
        assert!((high - 0.832).abs() < 0.01, "high = {high}");
    }

    #[test]
    fn test_wilson_extremes() {
        let (low, high) = wilson_interval(0, 20, 0.95);
        assert_eq!(low, 0.0);
        assert!(high > 0.0 && high < 0.25);

        let (low, high) = wilson_interval(20, 20, 0.95);
        assert_eq!(high, 1.0);
        assert!(low > 0.75 && low < 1.0);

        let (low, high) = wilson_interval(0, 0, 0.95);
        assert!(low.is_nan() && high.is_nan());
    }

    #[test]
    fn test_wilson_contains_observed_rate() {
        for trials in [1u64, 2, 7, 30, 113, 1000] {
            for successes in 0..=trials {
                let (low, high) = wilson_interval(successes, trials, 0.95);
                let phat = successes as f64 / trials as f64;
                assert!(low <= phat && phat <= high, "{successes}/{trials}");
            }
        }
    }

    #[test]
    fn test_wider_confidence_gives_wider_interval() {
        let (l95, h95) = wilson_interval(40, 100, 0.95);
        let (l99, h99) = wilson_interval(40, 100, 0.99);
        assert!(l99 < l95 && h99 > h95);
    }

    #[test]
    fn test_effective_threshold() {
        assert_eq!(effective_threshold(0.05, 5, true), 0.01);
        assert_eq!(effective_threshold(0.05, 5, false), 0.05);
        assert_eq!(effective_threshold(0.05, 0, true), 0.05);
    }

    #[test]
    fn test_null_hypothesis_rates() {
        assert_eq!(NullHypothesis::default().rate(vec![2.0, 4.0]), 0.5);
        let implied = NullHypothesis::MarketImplied.rate(vec![2.0, 4.0]);
        assert!((implied - 0.375).abs() < 1e-12);
        assert!(NullHypothesis::MarketImplied.rate(Vec::new()).is_nan());
    }

    #[test]
    fn test_null_hypothesis_validation_and_json() {
        assert!(NullHypothesis::Fixed { rate: 1.0 }.validate().is_err());
        assert!(NullHypothesis::Fixed { rate: 0.25 }.validate().is_ok());
        let parsed: NullHypothesis = serde_json::from_str(r#"{"kind":"market_implied"}"#).unwrap();
        assert_eq!(parsed, NullHypothesis::MarketImplied);
    }
}
