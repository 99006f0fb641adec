//! The worker pool: K engine workers, one battle each at a time.
//!
//! Each dispatched battle runs on its own thread, with the worker moved into it. Results come
//! back over a channel to the thread that called [`WorkerPool::run_fixed`] or
//! [`WorkerPool::run_adaptive`]. That thread is the callback lane: it alone calls the selector
//! and the result callback, so score bookkeeping needs no locking.
//!
//! # Faults
//!
//! - A worker that fails a battle (malformed output, timeout, exit, panic) is killed. Depending
//!   on [`WorkerRecovery`] it is then dropped from the pool or replaced by a fresh worker on the
//!   same install. The failed battle is handed to the callback as a failed [`BattleOutcome`].
//! - Losing every worker while battles remain ends the run with a [`PoolFault`].
//! - A [`SchedulingFault`] from the selector ends the run.
//!
//! In every case the run waits for the battles already in flight before returning.

use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc},
    time::Instant,
};

use anyhow::{bail, Context};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    configuration::Configuration,
    constraints::{WorkerLimits, WorkerRecovery},
    error::{PoolFault, ProtocolFault, SchedulingFault, StartupFault},
    matchup::{Matchup, MatchupKey},
    protocol::ExchangeLimits,
    score::RawBattleResult,
    selector::BattleSelector,
    worker::{BattleSettings, BattleWorker, WorkerLauncher},
};

/// A finished battle, successful or not.
#[derive(Debug)]
pub struct BattleOutcome {
    /// What was run.
    pub matchup: Matchup,
    /// Label of the worker that ran it.
    pub worker: String,
    /// The scores, or why there are none.
    pub result: Result<RawBattleResult, ProtocolFault>,
}

/// Counters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Battles that produced scores.
    pub completed: usize,
    /// Battles that ended in a [`ProtocolFault`].
    pub failed: usize,
    /// Workers discarded, or not replaced, after a failed battle.
    pub workers_lost: usize,
}

struct Finished {
    worker: Option<Box<dyn BattleWorker>>,
    respawned: bool,
    outcome: BattleOutcome,
}

/// Everything a battle thread needs besides its worker.
#[derive(Clone)]
struct BattleContext {
    launcher: Arc<dyn WorkerLauncher>,
    settings: BattleSettings,
    limits: WorkerLimits,
    exchange: ExchangeLimits,
}

/// Runs a fixed list of matchups in order.
struct FixedQueue(VecDeque<Matchup>);

impl BattleSelector for FixedQueue {
    fn next(&mut self) -> Result<Option<Matchup>, SchedulingFault> {
        Ok(self.0.pop_front())
    }

    fn complete(&mut self, _key: &MatchupKey) {}

    fn remaining(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

/// A fixed set of battle workers.
pub struct WorkerPool {
    context: BattleContext,
    config: Configuration,
    idle: Vec<Box<dyn BattleWorker>>,
    closed: bool,
}

impl WorkerPool {
    /// Starts one worker per install of `launcher` and waits until all of them are ready.
    ///
    /// # Errors
    ///
    /// A worker that never becomes ready aborts the whole pool with its [`StartupFault`]; the
    /// workers already started are killed.
    #[instrument(skip_all)]
    pub fn initialize(
        launcher: Arc<dyn WorkerLauncher>,
        settings: BattleSettings,
        limits: WorkerLimits,
        config: Configuration,
    ) -> anyhow::Result<WorkerPool> {
        let count = launcher.install_count();
        if count == 0 {
            bail!("no engine installs to start workers on");
        }
        info!(count, ?settings, "starting workers");

        let launched = std::thread::scope(|scope| {
            let handles = (0..count)
                .map(|install| {
                    let (launcher, settings, limits) = (&launcher, &settings, &limits);
                    scope.spawn(move || launcher.launch(install, settings, limits))
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .enumerate()
                .map(|(install, handle)| {
                    handle.join().unwrap_or_else(|payload| {
                        Err(StartupFault::Launch {
                            install: format!("#{install}"),
                            reason: panic_message(payload.as_ref()),
                        })
                    })
                })
                .collect::<Vec<_>>()
        });

        let mut idle = Vec::with_capacity(count);
        for result in launched {
            match result {
                Ok(worker) => idle.push(worker),
                Err(fault) => {
                    for mut worker in idle {
                        worker.terminate();
                    }
                    return Err(anyhow::Error::new(fault).context("worker pool startup failed"));
                }
            }
        }
        info!("{count} workers ready");

        Ok(WorkerPool {
            context: BattleContext {
                exchange: *limits.exchange(),
                launcher,
                settings,
                limits,
            },
            config,
            idle,
            closed: false,
        })
    }

    /// Number of idle workers (all of them between runs).
    pub fn worker_count(&self) -> usize {
        self.idle.len()
    }

    /// Engine arguments every worker was started with.
    pub fn settings(&self) -> &BattleSettings {
        &self.context.settings
    }

    /// Runs every matchup once, at most K at a time. `on_result` sees each battle exactly once.
    pub fn run_fixed<I, F>(&mut self, matchups: I, mut on_result: F) -> anyhow::Result<RunSummary>
    where
        I: IntoIterator<Item = Matchup>,
        F: FnMut(BattleOutcome),
    {
        let mut queue = FixedQueue(matchups.into_iter().collect());
        self.drive(&mut queue, None, |_, outcome| on_result(outcome))
    }

    /// Runs up to `total_battles` battles, asking `selector` for each matchup when a worker is
    /// free.
    ///
    /// `selector.complete` is called for every finished battle before `on_result`, which gets
    /// the selector back to feed it fresh statistics.
    pub fn run_adaptive<S, F>(
        &mut self,
        selector: &mut S,
        total_battles: usize,
        on_result: F,
    ) -> anyhow::Result<RunSummary>
    where
        S: BattleSelector,
        F: FnMut(&mut S, BattleOutcome),
    {
        self.drive(selector, Some(total_battles), on_result)
    }

    fn drive<S, F>(
        &mut self,
        selector: &mut S,
        limit: Option<usize>,
        mut on_result: F,
    ) -> anyhow::Result<RunSummary>
    where
        S: BattleSelector,
        F: FnMut(&mut S, BattleOutcome),
    {
        if self.closed {
            bail!("worker pool has been shut down");
        }
        if self.config.verbose {
            disable_line_wrap();
        }

        let (tx, rx) = mpsc::channel::<Finished>();
        // dropped once nothing more will be dispatched, so only battle threads hold senders
        let mut tx = Some(tx);
        let mut summary = RunSummary::default();
        let mut running: Vec<Matchup> = Vec::new();
        let mut dispatched = 0usize;
        let mut exhausted = false;
        let mut fatal: Option<anyhow::Error> = None;

        loop {
            while fatal.is_none() && !exhausted && !self.idle.is_empty() {
                if limit.is_some_and(|l| dispatched >= l) {
                    exhausted = true;
                    break;
                }
                let Some(sender) = &tx else { break };
                match selector.next() {
                    Ok(Some(matchup)) => {
                        let Some(worker) = self.idle.pop() else { break };
                        running.push(matchup.clone());
                        if self.config.verbose {
                            print_running_battles(&running);
                        }
                        self.launch_battle(worker, matchup, sender.clone());
                        dispatched += 1;
                    }
                    Ok(None) => exhausted = true,
                    Err(fault) => {
                        error!("{fault}");
                        fatal = Some(anyhow::Error::new(fault).context("battle selection failed"));
                    }
                }
            }

            if exhausted || fatal.is_some() {
                tx = None;
            }
            if running.is_empty() {
                break;
            }

            // not empty <=> battle running <=> result to receive
            let Ok(finished) = rx.recv() else {
                if self.config.verbose {
                    enable_line_wrap();
                }
                error!(running = running.len(), "battle threads stopped reporting");
                bail!("battle threads stopped reporting");
            };
            let outcome = finished.outcome;
            if let Some(pos) = running.iter().position(|m| *m == outcome.matchup) {
                running.remove(pos);
            }

            match finished.worker {
                Some(worker) => self.idle.push(worker),
                None => summary.workers_lost += 1,
            }
            if finished.respawned {
                info!("replaced worker {}", outcome.worker);
            }

            match &outcome.result {
                Ok(_) => summary.completed += 1,
                Err(fault) => {
                    summary.failed += 1;
                    warn!(matchup = %outcome.matchup, worker = %outcome.worker, "battle failed: {fault}");
                }
            }
            if self.config.verbose {
                print_outcome(&outcome);
                print_running_battles(&running);
            }

            selector.complete(outcome.matchup.key());
            on_result(selector, outcome);

            if fatal.is_none() && !exhausted && self.idle.is_empty() && running.is_empty() {
                let unfinished = limit
                    .map(|l| l.saturating_sub(dispatched))
                    .or_else(|| selector.remaining())
                    .unwrap_or(0);
                if unfinished > 0 {
                    error!("every worker has been lost");
                    fatal = Some(PoolFault { unfinished }.into());
                }
            }
        }

        if self.config.verbose {
            enable_line_wrap();
        }
        debug!(?summary, "run finished");
        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn launch_battle(
        &self,
        mut worker: Box<dyn BattleWorker>,
        matchup: Matchup,
        tx: mpsc::Sender<Finished>,
    ) {
        let context = self.context.clone();
        std::thread::spawn(move || {
            let label = worker.label().to_string();
            let played = panic::catch_unwind(AssertUnwindSafe(|| {
                play(worker.as_mut(), &matchup, &context)
            }));
            let result = played.unwrap_or_else(|payload| {
                Err(ProtocolFault::WorkerPanicked(panic_message(payload.as_ref())))
            });

            let recovered = panic::catch_unwind(AssertUnwindSafe(|| match &result {
                Ok(_) => (Some(worker), false),
                Err(_) => recover(worker, &context),
            }));
            let (worker, respawned) = recovered.unwrap_or_else(|payload| {
                error!(
                    "could not recover worker {label}: {}",
                    panic_message(payload.as_ref())
                );
                (None, false)
            });

            // the pool only stops listening when nothing is running
            let _ = tx.send(Finished {
                worker,
                respawned,
                outcome: BattleOutcome {
                    matchup,
                    worker: label,
                    result,
                },
            });
        });
    }

    /// Kills the idle workers. The pool cannot run battles afterwards.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for mut worker in self.idle.drain(..) {
            worker.terminate();
        }
        info!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn play(
    worker: &mut dyn BattleWorker,
    matchup: &Matchup,
    context: &BattleContext,
) -> Result<RawBattleResult, ProtocolFault> {
    let start = Instant::now();
    let scores = worker.run_battle(matchup.participants(), &context.exchange)?;
    let elapsed = start.elapsed();
    if !scores.iter().any(|s| s.name == matchup.challenger()) {
        return Err(ProtocolFault::MissingChallenger(
            matchup.challenger().to_string(),
        ));
    }
    Ok(RawBattleResult {
        scores,
        num_rounds: context.settings.num_rounds,
        elapsed,
    })
}

/// Disposes of a faulted worker. Returns its replacement, if any.
fn recover(
    mut worker: Box<dyn BattleWorker>,
    context: &BattleContext,
) -> (Option<Box<dyn BattleWorker>>, bool) {
    let install = worker.install();
    worker.terminate();
    let label = worker.label().to_string();
    drop(worker);

    match context.limits.recovery() {
        WorkerRecovery::Discard => {
            warn!("discarding worker {label}");
            (None, false)
        }
        WorkerRecovery::Respawn => {
            match context
                .launcher
                .launch(install, &context.settings, &context.limits)
                .context("could not respawn worker")
            {
                Ok(fresh) => (Some(fresh), true),
                Err(e) => {
                    warn!("{e:#}");
                    (None, false)
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn print_outcome(outcome: &BattleOutcome) {
    // clear line, green matchup, scores or red error, start of line
    match &outcome.result {
        Ok(result) => {
            let scores = result
                .scores
                .iter()
                .map(|s| format!("{:.0}", s.score))
                .collect::<Vec<_>>()
                .join("-");
            println!(
                "\x1b[2K\x1b[32m{}: \x1b[39m{scores} ({:.1}s)\x1b[0G",
                outcome.matchup,
                result.elapsed.as_secs_f64()
            );
        }
        Err(fault) => println!(
            "\x1b[2K\x1b[32m{}: \x1b[31m{fault}\x1b[39m\x1b[0G",
            outcome.matchup
        ),
    }
}

fn print_running_battles(running: &[Matchup]) {
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(Matchup::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn disable_line_wrap() {
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    print!("\x1b[?7h");
}
