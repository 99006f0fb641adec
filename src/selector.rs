//! Choosing which matchup a free worker runs next.
//!
//! [`AdaptiveSelector`] treats every matchup as a noisy arm and spends each battle where the
//! standard error of its relative score is expected to shrink fastest per second of battle time.
//! Early estimates are rough: a geometrically decaying exploration branch keeps under-sampled
//! matchups in play until every matchup has a few battles.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, seq::IndexedRandom, Rng, SeedableRng};
use tracing::trace;

use crate::{
    error::SchedulingFault,
    matchup::{Matchup, MatchupKey},
    score::ScoringStyle,
    score_log::ScoreLog,
};

/// Exploration probability once every matchup has two battles.
pub const DEFAULT_EXPLORATION: f64 = 0.2;

/// Source of the next battle for [`WorkerPool::run_adaptive`](crate::dispatcher::WorkerPool::run_adaptive).
///
/// Both methods are only ever called from the pool's callback lane.
pub trait BattleSelector {
    /// Matchup for the next free worker, `None` once there is nothing left to run.
    fn next(&mut self) -> Result<Option<Matchup>, SchedulingFault>;

    /// The battle of `key` finished (successfully or not) and is no longer in flight.
    fn complete(&mut self, key: &MatchupKey);

    /// Battles still to run, when known.
    fn remaining(&self) -> Option<usize> {
        None
    }
}

/// Uncertainty of one matchup's relative score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreError {
    /// Mean relative score.
    pub average: f64,
    /// Sample standard deviation of the per-battle relative scores.
    pub std_dev: f64,
    /// Battles the deviation is taken over.
    pub num_battles: u32,
    /// Mean battle duration.
    pub avg_time: Duration,
}

impl ScoreError {
    /// Error of a matchup from its per-battle relative scores.
    pub fn from_samples(scores: &[f64], avg_time: Duration) -> ScoreError {
        let n = scores.len();
        let average = if n == 0 {
            0.0
        } else {
            scores.iter().sum::<f64>() / n as f64
        };
        let std_dev = if n < 2 {
            0.0
        } else {
            let square_sum = scores.iter().map(|s| (s - average).powi(2)).sum::<f64>();
            (square_sum / (n - 1) as f64).sqrt()
        };
        ScoreError {
            average,
            std_dev,
            num_battles: n as u32,
            avg_time,
        }
    }

    /// Standard error of the mean, `std_dev / sqrt(num_battles)`.
    pub fn standard_error(&self) -> f64 {
        self.standard_error_at(self.num_battles)
    }

    fn standard_error_at(&self, num_battles: u32) -> f64 {
        self.std_dev / (num_battles as f64).sqrt()
    }

    /// Expected reduction of the standard error per second from one more battle.
    ///
    /// Infinite while fewer than two battles make the deviation meaningless, or when battles
    /// take no measurable time.
    pub fn accuracy_gain_rate(&self) -> f64 {
        let seconds = self.avg_time.as_secs_f64();
        if self.num_battles < 2 || seconds <= 0.0 {
            return f64::INFINITY;
        }
        (self.standard_error_at(self.num_battles) - self.standard_error_at(self.num_battles + 1))
            / seconds
    }
}

/// Which rule picked a matchup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Random among the least-sampled matchups.
    Explore,
    /// Highest accuracy gain rate, among matchups not in flight when there are enough workers.
    Exploit,
    /// Everything was in flight: random among the least-sampled matchups.
    Fallback,
}

/// A matchup picked by [`AdaptiveSelector::choose`].
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    /// The picked matchup.
    pub matchup: Matchup,
    /// The rule that picked it.
    pub branch: Branch,
}

/// Greedy variance-reduction allocator.
///
/// Its view of each matchup comes from [`observe`](Self::observe), which the result callback
/// calls with the fresh [`ScoreError`] after every battle.
#[derive(Debug)]
pub struct AdaptiveSelector<R = StdRng> {
    matchups: Vec<Matchup>,
    errors: HashMap<MatchupKey, ScoreError>,
    in_flight: HashMap<MatchupKey, usize>,
    exploration: f64,
    workers: usize,
    rng: R,
}

impl AdaptiveSelector<StdRng> {
    /// A selector over `matchups`, seeded from the OS.
    pub fn new(matchups: Vec<Matchup>) -> Self {
        AdaptiveSelector::with_rng(matchups, StdRng::from_os_rng())
    }
}

impl<R: Rng> AdaptiveSelector<R> {
    /// A selector drawing its randomness from `rng`.
    pub fn with_rng(matchups: Vec<Matchup>, rng: R) -> Self {
        AdaptiveSelector {
            matchups,
            errors: HashMap::new(),
            in_flight: HashMap::new(),
            exploration: DEFAULT_EXPLORATION,
            workers: usize::MAX,
            rng,
        }
    }

    /// Overrides the exploration probability at two battles per matchup.
    pub fn with_exploration(self, exploration: f64) -> Self {
        AdaptiveSelector {
            exploration,
            ..self
        }
    }

    /// Number of workers battles run on. Unbounded by default.
    ///
    /// Exploitation only avoids matchups already in flight when there are no more matchups
    /// than workers; with fewer workers, the best matchup may run on several of them at once.
    pub fn with_workers(self, workers: usize) -> Self {
        AdaptiveSelector { workers, ..self }
    }

    /// Seeds every matchup's error from a log, e.g. one loaded from disk.
    pub fn observe_log(&mut self, log: &ScoreLog, style: ScoringStyle) {
        for matchup in &self.matchups {
            if let Some(error) = log.score_error(matchup.key(), style) {
                self.errors.insert(matchup.key().clone(), error);
            }
        }
    }

    /// Replaces what is known about `key`.
    pub fn observe(&mut self, key: &MatchupKey, error: ScoreError) {
        self.errors.insert(key.clone(), error);
    }

    /// Matchups to choose from.
    pub fn matchups(&self) -> &[Matchup] {
        &self.matchups
    }

    /// True while a battle of `key` runs.
    pub fn is_in_flight(&self, key: &MatchupKey) -> bool {
        self.in_flight.contains_key(key)
    }

    fn num_battles(&self, key: &MatchupKey) -> u32 {
        self.errors.get(key).map_or(0, |e| e.num_battles)
    }

    fn gain_rate(&self, key: &MatchupKey) -> f64 {
        self.errors
            .get(key)
            .map_or(f64::INFINITY, ScoreError::accuracy_gain_rate)
    }

    /// Fewest battles any matchup has.
    pub fn min_battles(&self) -> u32 {
        self.matchups
            .iter()
            .map(|m| self.num_battles(m.key()))
            .min()
            .unwrap_or(0)
    }

    /// `p0 / 2^(min_battles - 2)`, capped at one.
    pub fn exploration_probability(&self, min_battles: u32) -> f64 {
        let exponent = min_battles as i32 - 2;
        (self.exploration / 2f64.powi(exponent)).min(1.0)
    }

    fn pick_least_sampled(&mut self, min_battles: u32) -> Result<Matchup, SchedulingFault> {
        let errors = &self.errors;
        let candidates = self
            .matchups
            .iter()
            .filter(|m| errors.get(m.key()).map_or(0, |e| e.num_battles) == min_battles)
            .collect::<Vec<_>>();
        candidates
            .choose(&mut self.rng)
            .map(|m| (*m).clone())
            .ok_or(SchedulingFault::NoEligibleMatchup(self.matchups.len()))
    }

    fn best_gain(&self) -> Option<&Matchup> {
        let skip_in_flight = self.matchups.len() <= self.workers;
        let mut best: Option<(&Matchup, f64)> = None;
        for matchup in &self.matchups {
            if skip_in_flight && self.is_in_flight(matchup.key()) {
                continue;
            }
            let gain = self.gain_rate(matchup.key());
            if best.map_or(true, |(_, best_gain)| gain > best_gain) {
                best = Some((matchup, gain));
            }
        }
        best.map(|(m, _)| m)
    }

    /// Picks a matchup without marking it in flight.
    pub fn choose(&mut self) -> Result<Choice, SchedulingFault> {
        if self.matchups.is_empty() {
            return Err(SchedulingFault::NoMatchups);
        }
        let min_battles = self.min_battles();
        let explore = self.rng.random::<f64>() < self.exploration_probability(min_battles);

        let choice = if explore {
            Choice {
                matchup: self.pick_least_sampled(min_battles)?,
                branch: Branch::Explore,
            }
        } else if let Some(matchup) = self.best_gain() {
            Choice {
                matchup: matchup.clone(),
                branch: Branch::Exploit,
            }
        } else {
            Choice {
                matchup: self.pick_least_sampled(min_battles)?,
                branch: Branch::Fallback,
            }
        };
        trace!(matchup = %choice.matchup, branch = ?choice.branch, min_battles);
        Ok(choice)
    }
}

impl<R: Rng> BattleSelector for AdaptiveSelector<R> {
    fn next(&mut self) -> Result<Option<Matchup>, SchedulingFault> {
        let choice = self.choose()?;
        *self
            .in_flight
            .entry(choice.matchup.key().clone())
            .or_default() += 1;
        Ok(Some(choice.matchup))
    }

    fn complete(&mut self, key: &MatchupKey) {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(key);
            }
        }
    }
}

/// Stops an inner selector once a battle count or a deadline is reached, or on request.
#[derive(Debug)]
pub struct Budgeted<S> {
    inner: S,
    max_battles: Option<usize>,
    deadline: Option<Instant>,
    dispatched: usize,
    stopped: bool,
}

impl<S: BattleSelector> Budgeted<S> {
    /// Wraps `inner` without any limit.
    pub fn new(inner: S) -> Self {
        Budgeted {
            inner,
            max_battles: None,
            deadline: None,
            dispatched: 0,
            stopped: false,
        }
    }

    /// No battle is dispatched once `max_battles` have been.
    pub fn with_max_battles(self, max_battles: usize) -> Self {
        Budgeted {
            max_battles: Some(max_battles),
            ..self
        }
    }

    /// No battle is dispatched once `budget` has elapsed from now.
    pub fn with_time_budget(self, budget: Duration) -> Self {
        Budgeted {
            deadline: Some(Instant::now() + budget),
            ..self
        }
    }

    /// Dispatch nothing more. Battles in flight still complete.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// True once [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Battles dispatched so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// The wrapped selector.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The wrapped selector, mutably.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn exhausted(&self) -> bool {
        self.stopped
            || self.max_battles.is_some_and(|max| self.dispatched >= max)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl<S: BattleSelector> BattleSelector for Budgeted<S> {
    fn next(&mut self) -> Result<Option<Matchup>, SchedulingFault> {
        if self.exhausted() {
            return Ok(None);
        }
        let next = self.inner.next()?;
        if next.is_some() {
            self.dispatched += 1;
        }
        Ok(next)
    }

    fn complete(&mut self, key: &MatchupKey) {
        self.inner.complete(key);
    }

    fn remaining(&self) -> Option<usize> {
        if self.exhausted() {
            return Some(0);
        }
        self.max_battles.map(|max| max - self.dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matchups(opponents: &[&str]) -> Vec<Matchup> {
        opponents
            .iter()
            .map(|o| Matchup::new("me", &[o.to_string()]))
            .collect()
    }

    fn error(std_dev: f64, num_battles: u32, secs: u64) -> ScoreError {
        ScoreError {
            average: 50.0,
            std_dev,
            num_battles,
            avg_time: Duration::from_secs(secs),
        }
    }

    fn seeded(opponents: &[&str]) -> AdaptiveSelector<StdRng> {
        AdaptiveSelector::with_rng(matchups(opponents), StdRng::seed_from_u64(7))
    }

    #[test]
    fn sample_standard_deviation() {
        let e = ScoreError::from_samples(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], Duration::ZERO);
        assert!((e.average - 5.0).abs() < 1e-12);
        assert!((e.std_dev - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(ScoreError::from_samples(&[3.0], Duration::ZERO).std_dev, 0.0);
    }

    #[test]
    fn gain_rate_diminishes_with_battles() {
        let (a, b) = (error(10.0, 2, 1), error(10.0, 4, 1));
        assert!(a.accuracy_gain_rate() > b.accuracy_gain_rate());
        assert_eq!(error(10.0, 1, 1).accuracy_gain_rate(), f64::INFINITY);
        assert_eq!(error(10.0, 5, 0).accuracy_gain_rate(), f64::INFINITY);
    }

    #[test]
    fn exploration_probability_decays() {
        let s = seeded(&["a"]);
        assert!((s.exploration_probability(2) - 0.2).abs() < 1e-12);
        assert!((s.exploration_probability(3) - 0.1).abs() < 1e-12);
        assert!((s.exploration_probability(5) - 0.025).abs() < 1e-12);
        assert_eq!(s.exploration_probability(0), 0.8);
        assert_eq!(s.with_exploration(0.9).exploration_probability(0), 1.0);
    }

    #[test]
    fn unseen_matchups_count_as_zero_battles() {
        let mut s = seeded(&["a", "b"]);
        s.observe(&MatchupKey::from("a"), error(5.0, 6, 1));
        assert_eq!(s.min_battles(), 0);
        for _ in 0..20 {
            assert_eq!(s.choose().unwrap().matchup.key().as_str(), "b");
        }
    }

    #[test]
    fn in_flight_matchups_are_skipped_by_exploitation() {
        let mut s = seeded(&["a", "b"]).with_exploration(0.0);
        s.observe(&MatchupKey::from("a"), error(10.0, 2, 1));
        s.observe(&MatchupKey::from("b"), error(10.0, 8, 1));
        assert_eq!(s.next().unwrap().unwrap().key().as_str(), "a");
        assert_eq!(s.next().unwrap().unwrap().key().as_str(), "b");
        // both in flight: fall back to the least sampled
        let choice = s.choose().unwrap();
        assert_eq!(choice.branch, Branch::Fallback);
        assert_eq!(choice.matchup.key().as_str(), "a");

        s.complete(&MatchupKey::from("a"));
        assert!(!s.is_in_flight(&MatchupKey::from("a")));
        assert!(s.is_in_flight(&MatchupKey::from("b")));
    }

    #[test]
    fn in_flight_matchups_stay_eligible_with_fewer_workers() {
        let observed = |workers| {
            let mut s = seeded(&["a", "b", "c"])
                .with_exploration(0.0)
                .with_workers(workers);
            s.observe(&MatchupKey::from("a"), error(10.0, 2, 1));
            s.observe(&MatchupKey::from("b"), error(10.0, 8, 1));
            s.observe(&MatchupKey::from("c"), error(10.0, 8, 1));
            s
        };

        let mut two = observed(2);
        assert_eq!(two.next().unwrap().unwrap().key().as_str(), "a");
        let choice = two.choose().unwrap();
        assert_eq!(choice.branch, Branch::Exploit);
        assert_eq!(choice.matchup.key().as_str(), "a");

        let mut three = observed(3);
        assert_eq!(three.next().unwrap().unwrap().key().as_str(), "a");
        assert_eq!(three.next().unwrap().unwrap().key().as_str(), "b");
    }

    #[test]
    fn no_matchups_is_a_scheduling_fault() {
        let mut s = seeded(&[]);
        assert_eq!(s.next(), Err(SchedulingFault::NoMatchups));
    }

    #[test]
    fn budget_caps_dispatches() {
        let mut s = Budgeted::new(seeded(&["a", "b"])).with_max_battles(3);
        for _ in 0..3 {
            assert!(s.next().unwrap().is_some());
        }
        assert_eq!(s.next().unwrap(), None);
        assert_eq!(s.remaining(), Some(0));
    }

    #[test]
    fn stop_ends_dispatching() {
        let mut s = Budgeted::new(seeded(&["a"]));
        assert!(s.next().unwrap().is_some());
        assert_eq!(s.remaining(), None);
        s.stop();
        assert_eq!(s.next().unwrap(), None);
    }

    #[test]
    fn spent_time_budget_ends_dispatching() {
        let mut s = Budgeted::new(seeded(&["a"])).with_time_budget(Duration::ZERO);
        assert_eq!(s.next().unwrap(), None);
    }
}
