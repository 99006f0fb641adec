//! Confidence of the overall score.
//!
//! The overall score is an average of per-matchup means, optionally averaged within groups
//! first, so its spread is estimated by resampling: each iteration draws one mean per matchup
//! from `Normal(mean, standard error)` clamped to the score range, combines the draws like the
//! real score, and the 95% half-width is 1.96 times the deviation of those combined scores.
//!
//! Draws use the standard error of each mean, not the per-battle deviation: the overall score is
//! built from means, so its interval has to narrow as battles accumulate for a target half-width
//! to ever be reached.

use std::collections::BTreeMap;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::trace;

use crate::{
    score::{MAX_SCORE, MIN_SCORE},
    selector::ScoreError,
};

/// Fewest resamplings, whatever the number of battles.
pub const MIN_ITERATIONS: usize = 1_000;
/// Most resamplings, used while battles are few.
pub const MAX_ITERATIONS: usize = 100_000;
const Z_95: f64 = 1.96;

/// What is known about one matchup's relative score.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchupEstimate {
    /// Mean relative score.
    pub mean: f64,
    /// Standard error of that mean.
    pub std_error: f64,
    /// Group of the opponent list, for grouped aggregation.
    pub group: Option<String>,
}

impl MatchupEstimate {
    /// Estimate of a matchup from its [`ScoreError`].
    pub fn from_error(error: &ScoreError, group: Option<String>) -> Self {
        MatchupEstimate {
            mean: error.average,
            std_error: error.standard_error(),
            group,
        }
    }
}

/// How matchup scores are combined into the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregation {
    /// Mean over all matchups.
    #[default]
    Simple,
    /// Mean within each group, then mean over groups. Ungrouped matchups count as a group each.
    Grouped,
}

impl Aggregation {
    /// Combines one value per estimate, paired by index, into an overall score.
    pub fn combine(&self, values: &[f64], estimates: &[MatchupEstimate]) -> f64 {
        match self {
            Aggregation::Simple => mean(values),
            Aggregation::Grouped => {
                let mut groups: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
                let mut averages = Vec::new();
                for (value, estimate) in values.iter().zip(estimates) {
                    match &estimate.group {
                        Some(group) => {
                            let entry = groups.entry(group.as_str()).or_insert((0.0, 0));
                            entry.0 += value;
                            entry.1 += 1;
                        }
                        None => averages.push(*value),
                    }
                }
                averages.extend(groups.values().map(|(sum, n)| sum / *n as f64));
                mean(&averages)
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Overall score and its 95% confidence half-width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confidence {
    /// Overall score from the matchup means.
    pub score: f64,
    /// Half-width of the 95% interval around `score`.
    pub half_width: f64,
}

/// Fewer iterations are needed as battles accumulate.
pub fn iterations_for(total_battles: usize) -> usize {
    (1_000_000 / total_battles.max(1)).clamp(MIN_ITERATIONS, MAX_ITERATIONS)
}

/// Overall score of the estimates' means.
pub fn overall_score(estimates: &[MatchupEstimate], aggregation: Aggregation) -> f64 {
    let means = estimates.iter().map(|e| e.mean).collect::<Vec<_>>();
    aggregation.combine(&means, estimates)
}

/// Estimates the confidence of the overall score with `iterations` resamplings.
pub fn monte_carlo_confidence<R: Rng + ?Sized>(
    estimates: &[MatchupEstimate],
    aggregation: Aggregation,
    iterations: usize,
    rng: &mut R,
) -> Confidence {
    let score = overall_score(estimates, aggregation);
    if estimates.is_empty() || iterations < 2 {
        return Confidence {
            score,
            half_width: 0.0,
        };
    }

    let distributions = estimates
        .iter()
        .map(|e| {
            let std_error = if e.std_error.is_finite() { e.std_error } else { 0.0 };
            Normal::new(e.mean, std_error).ok()
        })
        .collect::<Vec<_>>();

    let mut draws = vec![0.0; estimates.len()];
    let mut sum = 0.0;
    let mut square_sum = 0.0;
    for _ in 0..iterations {
        for ((draw, estimate), distribution) in draws.iter_mut().zip(estimates).zip(&distributions) {
            let value = distribution
                .as_ref()
                .map_or(estimate.mean, |d| d.sample(rng));
            *draw = value.clamp(MIN_SCORE, MAX_SCORE);
        }
        let overall = aggregation.combine(&draws, estimates);
        sum += overall;
        square_sum += overall * overall;
    }

    let n = iterations as f64;
    let variance = ((square_sum - sum * sum / n) / (n - 1.0)).max(0.0);
    let half_width = Z_95 * variance.sqrt();
    trace!(iterations, score, half_width);
    Confidence { score, half_width }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn estimate(mean: f64, std_error: f64, group: Option<&str>) -> MatchupEstimate {
        MatchupEstimate {
            mean,
            std_error,
            group: group.map(str::to_string),
        }
    }

    #[test]
    fn iterations_are_bounded() {
        assert_eq!(iterations_for(0), MAX_ITERATIONS);
        assert_eq!(iterations_for(5), MAX_ITERATIONS);
        assert_eq!(iterations_for(100), 10_000);
        assert_eq!(iterations_for(5_000_000), MIN_ITERATIONS);
    }

    #[test]
    fn grouped_average_weights_groups_equally() {
        let estimates = vec![
            estimate(10.0, 0.0, Some("g")),
            estimate(30.0, 0.0, Some("g")),
            estimate(80.0, 0.0, None),
        ];
        assert_eq!(overall_score(&estimates, Aggregation::Simple), 40.0);
        // (20 + 80) / 2
        assert_eq!(overall_score(&estimates, Aggregation::Grouped), 50.0);
    }

    #[test]
    fn exact_estimates_have_no_spread() {
        let estimates = vec![estimate(60.0, 0.0, None), estimate(70.0, 0.0, None)];
        let mut rng = StdRng::seed_from_u64(1);
        let confidence = monte_carlo_confidence(&estimates, Aggregation::Simple, 1_000, &mut rng);
        assert_eq!(confidence.score, 65.0);
        assert!(confidence.half_width < 1e-9);
    }

    #[test]
    fn half_width_matches_normal_spread() {
        // mean of two independent N(50, 2): deviation 2 / sqrt(2)
        let estimates = vec![estimate(50.0, 2.0, None), estimate(50.0, 2.0, None)];
        let mut rng = StdRng::seed_from_u64(42);
        let confidence = monte_carlo_confidence(&estimates, Aggregation::Simple, 50_000, &mut rng);
        let expected = 1.96 * 2.0 / 2f64.sqrt();
        assert!(
            (confidence.half_width - expected).abs() < 0.05 * expected,
            "{} vs {expected}",
            confidence.half_width
        );
    }

    #[test]
    fn draws_are_clamped() {
        let estimates = vec![estimate(100.0, 30.0, None)];
        let mut rng = StdRng::seed_from_u64(3);
        let confidence = monte_carlo_confidence(&estimates, Aggregation::Simple, 10_000, &mut rng);
        // half of the draws are clamped to 100, shrinking the spread well below 1.96 * 30
        assert!(confidence.half_width < 1.96 * 30.0 * 0.7);
    }
}
