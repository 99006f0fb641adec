//! Raw per-participant scores, their weighted merge, and the scoring styles that turn them into
//! a single challenger-relative number.

use std::{str::FromStr, time::Duration};

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Lowest valid relative score.
pub const MIN_SCORE: f64 = 0.0;
/// Highest valid relative score.
pub const MAX_SCORE: f64 = 100.0;

/// Engine-native metrics of one participant, for one battle or averaged over several.
///
/// Values are not normalized against opponents; see [`ScoringStyle`] for that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotScore {
    /// Participant name, as sent in the request.
    pub name: String,
    /// Total score.
    pub score: f64,
    /// Rounds survived to the end.
    pub survival_firsts: f64,
    /// Points earned by outliving opponents.
    pub survival_score: f64,
    /// Damage dealt by bullets.
    pub bullet_damage: f64,
    /// Energy left at the end of rounds; zero when the engine does not report it.
    #[serde(default)]
    pub energy_conserved: f64,
}

impl RobotScore {
    /// Creates a score without energy information (engines that only report four metrics).
    pub fn new(
        name: impl Into<String>,
        score: f64,
        survival_firsts: f64,
        survival_score: f64,
        bullet_damage: f64,
    ) -> RobotScore {
        RobotScore {
            name: name.into(),
            score,
            survival_firsts,
            survival_score,
            bullet_damage,
            energy_conserved: 0.0,
        }
    }

    /// Sets the optional fifth metric.
    pub fn with_energy_conserved(self, energy_conserved: f64) -> RobotScore {
        RobotScore {
            energy_conserved,
            ..self
        }
    }
}

/// Everything one executed battle produced. Never modified once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBattleResult {
    /// One entry per participant, in the order the engine reported them.
    pub scores: Vec<RobotScore>,
    /// Rounds the battle was configured for.
    pub num_rounds: u32,
    /// Wall-clock time from request to result.
    pub elapsed: Duration,
}

impl RawBattleResult {
    /// Scores of participant `name`, if it took part.
    pub fn score_of(&self, name: &str) -> Option<&RobotScore> {
        self.scores.iter().find(|s| s.name == name)
    }

    /// Relative score of `challenger` in this battle, `None` if it did not take part.
    pub fn relative_score(&self, challenger: &str, style: ScoringStyle) -> Option<f64> {
        let index = self.scores.iter().position(|s| s.name == challenger)?;
        let enemies = self
            .scores
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, s)| s)
            .collect::<Vec<_>>();
        Some(style.relative_score(&self.scores[index], &enemies, self.num_rounds as f64))
    }
}

/// Running mean of a participant's metrics over `num_battles` battles.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedScore {
    /// Mean of every metric.
    pub mean: RobotScore,
    /// Battles the mean is taken over.
    pub num_battles: u32,
}

impl From<&RobotScore> for AggregatedScore {
    fn from(score: &RobotScore) -> Self {
        AggregatedScore {
            mean: score.clone(),
            num_battles: 1,
        }
    }
}

impl AggregatedScore {
    /// Weighted merge: counts add up, each field becomes `(v1·n1 + v2·n2) / (n1 + n2)`.
    ///
    /// Commutative, and associative up to floating point rounding. Merging with an empty
    /// aggregate (`num_battles == 0`) returns the other side unchanged.
    pub fn merge(&self, other: &AggregatedScore) -> AggregatedScore {
        if other.num_battles == 0 {
            return self.clone();
        }
        if self.num_battles == 0 {
            return other.clone();
        }
        let n1 = self.num_battles as f64;
        let n2 = other.num_battles as f64;
        let total = self.num_battles + other.num_battles;
        let weighted = |v1: f64, v2: f64| (v1 * n1 + v2 * n2) / (n1 + n2);
        let (a, b) = (&self.mean, &other.mean);
        AggregatedScore {
            mean: RobotScore {
                name: a.name.clone(),
                score: weighted(a.score, b.score),
                survival_firsts: weighted(a.survival_firsts, b.survival_firsts),
                survival_score: weighted(a.survival_score, b.survival_score),
                bullet_damage: weighted(a.bullet_damage, b.bullet_damage),
                energy_conserved: weighted(a.energy_conserved, b.energy_conserved),
            },
            num_battles: total,
        }
    }
}

/// How a challenger's raw metrics are turned into one comparable number in `[0, 100]`.
///
/// Selected once when the challenge is loaded and passed explicitly wherever a scalar score is
/// derived; the score history itself never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScoringStyle {
    /// Share of the total score against each opponent ("APS").
    #[default]
    PercentScore,
    /// Percentage of rounds the challenger survived to the end.
    SurvivalFirsts,
    /// Share of the survival score against each opponent.
    SurvivalScore,
    /// Bullet damage dealt per round (targeting challenges).
    BulletDamage,
    /// Energy conserved per round (movement challenges).
    MovementChallenge,
}

impl ScoringStyle {
    /// Human readable name used in reports.
    pub fn description(&self) -> &'static str {
        match self {
            ScoringStyle::PercentScore => "Average Percent Score",
            ScoringStyle::SurvivalFirsts => "Survival Firsts",
            ScoringStyle::SurvivalScore => "Survival Score",
            ScoringStyle::BulletDamage => "Bullet Damage",
            ScoringStyle::MovementChallenge => "Movement Challenge",
        }
    }

    /// The raw metric this style is built on.
    pub fn raw_metric(&self, score: &RobotScore) -> f64 {
        match self {
            ScoringStyle::PercentScore => score.score,
            ScoringStyle::SurvivalFirsts => score.survival_firsts,
            ScoringStyle::SurvivalScore => score.survival_score,
            ScoringStyle::BulletDamage => score.bullet_damage,
            ScoringStyle::MovementChallenge => score.energy_conserved,
        }
    }

    /// Challenger score relative to its `enemies`, clamped to `[MIN_SCORE, MAX_SCORE]`.
    ///
    /// `num_rounds` is the number of rounds the metrics were collected over (per battle).
    pub fn relative_score(
        &self,
        challenger: &RobotScore,
        enemies: &[&RobotScore],
        num_rounds: f64,
    ) -> f64 {
        let value = match self {
            ScoringStyle::PercentScore | ScoringStyle::SurvivalScore => {
                let mine = self.raw_metric(challenger);
                if enemies.is_empty() {
                    MAX_SCORE
                } else {
                    enemies
                        .iter()
                        .map(|enemy| percent_share(mine, self.raw_metric(enemy)))
                        .sum::<f64>()
                        / enemies.len() as f64
                }
            }
            ScoringStyle::SurvivalFirsts => 100.0 * per_round(challenger.survival_firsts, num_rounds),
            ScoringStyle::BulletDamage => per_round(challenger.bullet_damage, num_rounds),
            ScoringStyle::MovementChallenge => per_round(challenger.energy_conserved, num_rounds),
        };
        value.clamp(MIN_SCORE, MAX_SCORE)
    }
}

fn percent_share(mine: f64, theirs: f64) -> f64 {
    let total = mine + theirs;
    if total <= 0.0 {
        50.0
    } else {
        100.0 * mine / total
    }
}

fn per_round(value: f64, num_rounds: f64) -> f64 {
    if num_rounds <= 0.0 {
        0.0
    } else {
        value / num_rounds
    }
}

impl FromStr for ScoringStyle {
    type Err = anyhow::Error;

    /// Recognizes the style token anywhere in the line, e.g. `"PERCENT_SCORE"` or
    /// `"scoring: BULLET_DAMAGE"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains("PERCENT_SCORE") {
            Ok(ScoringStyle::PercentScore)
        } else if s.contains("BULLET_DAMAGE") {
            Ok(ScoringStyle::BulletDamage)
        } else if s.contains("SURVIVAL_FIRSTS") {
            Ok(ScoringStyle::SurvivalFirsts)
        } else if s.contains("SURVIVAL_SCORE") {
            Ok(ScoringStyle::SurvivalScore)
        } else if s.contains("MOVEMENT_CHALLENGE") || s.contains("ENERGY_CONSERVED") {
            Ok(ScoringStyle::MovementChallenge)
        } else {
            bail!("unrecognized scoring style: '{s}'")
        }
    }
}
