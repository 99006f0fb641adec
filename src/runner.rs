//! Runs a challenge for one challenger, end to end.
//!
//! [`RoboRunner`] owns the worker pool and the challenger's persistent score log. Two modes:
//!
//! - [`run_seasons`](RoboRunner::run_seasons): every opponent list `seasons` times, skipping the
//!   battles the log already holds.
//! - [`run_adaptive`](RoboRunner::run_adaptive): battles go wherever they reduce uncertainty
//!   fastest, until a battle budget, a time budget, or a target confidence is reached.
//!
//! # Example
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//! use battle_runner::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let challenge = ChallengeConfig::load("challenges/tcrm.txt")?;
//!     let config = Configuration::from_env();
//!     let limits = WorkerLimitsBuilder::from_env().build(2)?;
//!     let launcher = ProcessLauncher::new(
//!         WorkerCommand::new("java").with_args(["-cp", "lib/*", "BattleProcess"]),
//!         vec![PathBuf::from("/opt/engine1"), PathBuf::from("/opt/engine2")],
//!         config,
//!     );
//!
//!     let mut runner = RoboRunner::new(
//!         "me.Bot 1.0",
//!         challenge,
//!         Arc::new(launcher),
//!         limits,
//!         config,
//!         "data",
//!     )?;
//!     runner.run_adaptive(&AdaptiveBudget::battles(500).with_target_half_width(0.5))?;
//!     println!("{}", runner.report());
//!     runner.shutdown()
//! }
//! ```

use std::{
    collections::HashMap,
    fmt::Display,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tracing::{info, instrument, trace, warn};

use crate::{
    challenge::ChallengeConfig,
    configuration::Configuration,
    confidence::{
        iterations_for, monte_carlo_confidence, Aggregation, Confidence, MatchupEstimate,
    },
    constraints::WorkerLimits,
    dispatcher::{BattleOutcome, RunSummary, WorkerPool},
    logger::init_logger,
    matchup::{Matchup, MatchupKey},
    score::ScoringStyle,
    score_log::{log_path, PersistentScoreLog, ScoreLog},
    selector::{AdaptiveSelector, Budgeted},
    worker::WorkerLauncher,
};

/// Stop conditions of an adaptive run. The battle count is always bounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveBudget {
    /// Most battles to run.
    pub max_battles: usize,
    /// Wall-clock time after which nothing more is dispatched.
    pub time: Option<Duration>,
    /// Stop once the 95% half-width of the overall score is at most this.
    pub target_half_width: Option<f64>,
}

impl AdaptiveBudget {
    /// A budget of `max_battles` battles and nothing else.
    pub fn battles(max_battles: usize) -> Self {
        AdaptiveBudget {
            max_battles,
            time: None,
            target_half_width: None,
        }
    }

    /// Also stop dispatching after `time`.
    pub fn with_time(self, time: Duration) -> Self {
        AdaptiveBudget {
            time: Some(time),
            ..self
        }
    }

    /// Also stop once the overall half-width reaches `target`.
    pub fn with_target_half_width(self, target: f64) -> Self {
        AdaptiveBudget {
            target_half_width: Some(target),
            ..self
        }
    }
}

/// One line of a [`Report`].
#[derive(Debug, Clone, PartialEq)]
pub struct MatchupReport {
    /// The opponent list.
    pub key: MatchupKey,
    /// Its group in the challenge file.
    pub group: Option<String>,
    /// Battles logged.
    pub battles: usize,
    /// `None` until the matchup has a battle.
    pub score: Option<f64>,
    /// Standard error of `score`.
    pub std_error: Option<f64>,
}

/// Scores of the challenger over the whole challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// Whose scores these are.
    pub challenger: String,
    /// Scoring style of the challenge.
    pub style: ScoringStyle,
    /// Overall score with its 95% half-width.
    pub overall: Confidence,
    /// Battles logged over the challenge's opponent lists.
    pub total_battles: usize,
    /// One line per distinct opponent list, in challenge order.
    pub matchups: Vec<MatchupReport>,
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} ({}): {:.2} +- {:.2} over {} battles",
            self.challenger,
            self.style.description(),
            self.overall.score,
            self.overall.half_width,
            self.total_battles
        )?;
        for m in &self.matchups {
            let group = m.group.as_deref().map(|g| format!("[{g}] ")).unwrap_or_default();
            match (m.score, m.std_error) {
                (Some(score), Some(error)) => writeln!(
                    f,
                    "  {group}{}: {score:.2} +- {error:.2} ({} battles)",
                    m.key, m.battles
                )?,
                _ => writeln!(f, "  {group}{}: no battles", m.key)?,
            }
        }
        Ok(())
    }
}

/// A challenge being run for one challenger.
pub struct RoboRunner {
    challenger: String,
    challenge: ChallengeConfig,
    groups: HashMap<MatchupKey, Option<String>>,
    pool: WorkerPool,
    log: PersistentScoreLog,
    config: Configuration,
}

impl RoboRunner {
    /// Starts the workers and loads the challenger's log from `data_dir`, if there is one.
    ///
    /// # Errors
    ///
    /// Fails if the log exists but cannot be read, or if a worker does not start.
    #[instrument(skip_all, fields(challenger = %challenger.as_ref(), challenge = %challenge.name))]
    pub fn new(
        challenger: impl AsRef<str>,
        challenge: ChallengeConfig,
        launcher: Arc<dyn WorkerLauncher>,
        limits: WorkerLimits,
        config: Configuration,
        data_dir: impl AsRef<Path>,
    ) -> anyhow::Result<RoboRunner> {
        if config.log {
            init_logger()?;
        }
        trace!(?config, ?limits);

        let challenger = challenger.as_ref().to_string();
        let path = log_path(data_dir.as_ref(), &challenger);
        let log = PersistentScoreLog::open(path, &challenger).context("could not open score log")?;
        let pool = WorkerPool::initialize(launcher, challenge.battle_settings(), limits, config)?;

        let groups = challenge
            .opponents
            .iter()
            .map(|list| {
                (
                    MatchupKey::from_opponents(&list.opponents),
                    list.group.clone(),
                )
            })
            .collect();

        Ok(RoboRunner {
            challenger,
            challenge,
            groups,
            pool,
            log,
            config,
        })
    }

    /// Writes the log every `persist_every` battles instead of after each one.
    pub fn with_persist_every(mut self, persist_every: usize) -> Self {
        self.log.set_persist_every(persist_every);
        self
    }

    /// Every battle logged for the challenger so far.
    pub fn score_log(&self) -> &ScoreLog {
        &self.log
    }

    /// The challenge being run.
    pub fn challenge(&self) -> &ChallengeConfig {
        &self.challenge
    }

    /// One matchup per distinct opponent list, in challenge order.
    fn matchups(&self) -> Vec<Matchup> {
        let mut matchups: Vec<Matchup> = Vec::new();
        for matchup in self.challenge.matchups(&self.challenger) {
            if matchups.iter().all(|m| m.key() != matchup.key()) {
                matchups.push(matchup);
            }
        }
        matchups
    }

    /// Runs every opponent list until it has `seasons` battles, one season after the other.
    pub fn run_seasons(&mut self, seasons: usize) -> anyhow::Result<RunSummary> {
        let matchups = self.matchups();
        let mut battles = Vec::new();
        for season in 0..seasons {
            for matchup in &matchups {
                if season >= self.log.battles(matchup.key()).len() {
                    battles.push(matchup.clone());
                }
            }
        }
        info!(
            "{} battles to run, {} already logged",
            battles.len(),
            self.log.battle_count(matchups.iter().map(Matchup::key))
        );

        let style = self.challenge.scoring_style;
        let verbose = self.config.verbose;
        let estimator = Estimator::new(self);
        let log = &mut self.log;
        self.pool.run_fixed(battles, |outcome| {
            record(log, outcome);
            if verbose {
                print_overall(style, &estimator.confidence(log));
            }
        })
    }

    /// Runs battles where they reduce the uncertainty of the overall score fastest.
    pub fn run_adaptive(&mut self, budget: &AdaptiveBudget) -> anyhow::Result<RunSummary> {
        let style = self.challenge.scoring_style;
        let mut selector =
            AdaptiveSelector::new(self.matchups()).with_workers(self.pool.worker_count());
        selector.observe_log(&self.log, style);

        let mut budgeted = Budgeted::new(selector).with_max_battles(budget.max_battles);
        if let Some(time) = budget.time {
            budgeted = budgeted.with_time_budget(time);
        }
        info!(?budget, "adaptive run");

        let verbose = self.config.verbose;
        let target = budget.target_half_width;
        let estimator = Estimator::new(self);
        let log = &mut self.log;
        self.pool
            .run_adaptive(&mut budgeted, budget.max_battles, |selector, outcome| {
                let key = outcome.matchup.key().clone();
                record(log, outcome);
                if let Some(error) = log.score_error(&key, style) {
                    selector.inner_mut().observe(&key, error);
                }

                if target.is_none() && !verbose {
                    return;
                }
                let confidence = estimator.confidence(log);
                if verbose {
                    print_overall(style, &confidence);
                }
                let sampled = selector.inner().min_battles() >= 2;
                if sampled && target.is_some_and(|t| confidence.half_width <= t) {
                    info!(?confidence, "target confidence reached");
                    selector.stop();
                }
            })
    }

    /// Current scores for every opponent list of the challenge.
    pub fn report(&self) -> Report {
        let estimator = Estimator::new(self);
        let style = self.challenge.scoring_style;
        let matchups = estimator
            .keys
            .iter()
            .map(|(key, group)| {
                let error = self.log.score_error(key, style);
                MatchupReport {
                    key: key.clone(),
                    group: group.clone(),
                    battles: self.log.battles(key).len(),
                    score: error.map(|e| e.average),
                    std_error: error.map(|e| e.standard_error()),
                }
            })
            .collect();
        Report {
            challenger: self.challenger.clone(),
            style,
            overall: estimator.confidence(&self.log),
            total_battles: self.log.battle_count(estimator.keys.iter().map(|(k, _)| k)),
            matchups,
        }
    }

    /// Kills the workers and writes the log.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        self.pool.shutdown();
        self.log.save().context("could not save score log")
    }
}

fn record(log: &mut PersistentScoreLog, outcome: BattleOutcome) {
    match outcome.result {
        Ok(result) => log.add_battle(outcome.matchup.key(), result),
        Err(fault) => warn!(matchup = %outcome.matchup, "no result recorded: {fault}"),
    }
}

/// Computes the overall confidence from a log, for the challenge's matchups.
struct Estimator {
    keys: Vec<(MatchupKey, Option<String>)>,
    style: ScoringStyle,
    aggregation: Aggregation,
}

impl Estimator {
    fn new(runner: &RoboRunner) -> Self {
        let keys = runner
            .matchups()
            .into_iter()
            .map(|matchup| {
                let group = runner.groups.get(matchup.key()).cloned().flatten();
                (matchup.key().clone(), group)
            })
            .collect();
        Estimator {
            keys,
            style: runner.challenge.scoring_style,
            aggregation: runner.challenge.aggregation(),
        }
    }

    fn confidence(&self, log: &ScoreLog) -> Confidence {
        let estimates = self
            .keys
            .iter()
            .filter_map(|(key, group)| {
                let error = log.score_error(key, self.style)?;
                Some(MatchupEstimate::from_error(&error, group.clone()))
            })
            .collect::<Vec<_>>();
        let iterations = iterations_for(log.total_battles());
        monte_carlo_confidence(&estimates, self.aggregation, iterations, &mut rand::rng())
    }
}

fn print_overall(style: ScoringStyle, confidence: &Confidence) {
    // clear line, cyan score, default, start of line
    println!(
        "\x1b[2K\x1b[36m{}: {:.2} +- {:.2}\x1b[39m\x1b[0G",
        style.description(),
        confidence.score,
        confidence.half_width
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_builder() {
        let budget = AdaptiveBudget::battles(50)
            .with_time(Duration::from_secs(60))
            .with_target_half_width(0.25);
        assert_eq!(budget.max_battles, 50);
        assert_eq!(budget.time, Some(Duration::from_secs(60)));
        assert_eq!(budget.target_half_width, Some(0.25));
        assert_eq!(AdaptiveBudget::battles(3).time, None);
    }

    #[test]
    fn report_lists_every_matchup() {
        let report = Report {
            challenger: "me.Bot 1.0".into(),
            style: ScoringStyle::PercentScore,
            overall: Confidence {
                score: 62.5,
                half_width: 1.25,
            },
            total_battles: 7,
            matchups: vec![
                MatchupReport {
                    key: MatchupKey::from("a.A 1"),
                    group: Some("Easy".into()),
                    battles: 7,
                    score: Some(62.5),
                    std_error: Some(0.5),
                },
                MatchupReport {
                    key: MatchupKey::from("b.B 1"),
                    group: None,
                    battles: 0,
                    score: None,
                    std_error: None,
                },
            ],
        };
        let text = report.to_string();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "me.Bot 1.0 (Average Percent Score): 62.50 +- 1.25 over 7 battles",
                "  [Easy] a.A 1: 62.50 +- 0.50 (7 battles)",
                "  b.B 1: no battles",
            ]
        );
    }
}
