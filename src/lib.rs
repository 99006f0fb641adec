//! # Battle Runner
//!
//! Runs a challenger robot against lists of opponents on a pool of simulation engine workers,
//! records every battle, and converges the challenger's overall score.
//!
//! It provides:
//! - A pool of worker processes, one battle each at a time, with resource limits through Linux
//!   cgroups v2 (`WorkerPool`)
//! - A line protocol to talk to the engine workers ([`protocol`])
//! - A persistent, replayable log of every battle result ([`score_log`])
//! - Adaptive battle selection that spends battles where the score is least certain
//!   ([`selector`])
//! - A Monte Carlo estimate of the overall score's 95% confidence interval ([`confidence`])
//!
//! # Documentation Overview
//!
//! - To run a whole challenge, see [`RoboRunner`](crate::runner::RoboRunner).
//! - For the engine side of the protocol, see [`protocol`].
//! - For resource limits and timeouts, see [`constraints`] and
//!   [`Configuration`](crate::configuration::Configuration).
//! - To plug in another kind of worker, implement [`WorkerLauncher`](crate::worker::WorkerLauncher)
//!   and [`BattleWorker`](crate::worker::BattleWorker).
//!
//! # Usage Example
//!
//! Running five seasons of a challenge on two engine installs:
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//! use battle_runner::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let challenge = ChallengeConfig::load("challenges/mini.txt")?;
//!
//!     // run without cgroups if they are not available
//!     let config = Configuration::new().with_allow_uncontained(true);
//!     let limits = WorkerLimitsBuilder::new()
//!         .with_ram_per_worker(1000) // in MB
//!         .build(2)?;
//!
//!     let launcher = ProcessLauncher::new(
//!         WorkerCommand::new("java").with_args(["-cp", "lib/*", "BattleProcess"]),
//!         vec![PathBuf::from("engines/1"), PathBuf::from("engines/2")],
//!         config,
//!     );
//!
//!     let mut runner =
//!         RoboRunner::new("me.Bot 1.0", challenge, Arc::new(launcher), limits, config, "data")?;
//!     let summary = runner.run_seasons(5)?;
//!     println!("{summary:?}");
//!     println!("{}", runner.report());
//!     runner.shutdown()
//! }
//! ```
//!
//! ## Worker Requirements
//!
//! A worker is started with `-rounds n -width w -height h -path install` after its own arguments
//! and talks over stdin/stdout, one message per line:
//!  * Worker -> Runner : `BattleProcess ready` once the engine is loaded
//!  * Runner -> Worker : comma-separated participants, challenger first
//!  * Worker -> Runner : `BATTLE RESULT: ` followed by one score tuple per participant
//!
//! Any other line the worker prints is ignored. See [`protocol`] for the tuple format.
#![warn(missing_docs)]

mod cgroup_manager;
pub use anyhow;
pub mod challenge;
pub mod confidence;
pub mod configuration;
pub mod constraints;
pub mod dispatcher;
pub mod error;
mod logger;
pub mod matchup;
pub mod protocol;
pub mod runner;
pub mod score;
pub mod score_log;
pub mod selector;
pub mod worker;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use battle_runner::prelude::*;
/// ```
pub mod prelude {
    pub use crate::challenge::ChallengeConfig;
    pub use crate::configuration::Configuration;
    pub use crate::constraints::{WorkerLimits, WorkerLimitsBuilder, WorkerRecovery};
    pub use crate::dispatcher::{BattleOutcome, RunSummary, WorkerPool};
    pub use crate::matchup::{Matchup, MatchupKey};
    pub use crate::runner::{AdaptiveBudget, Report, RoboRunner};
    pub use crate::score::ScoringStyle;
    pub use crate::score_log::{PersistentScoreLog, ScoreLog};
    pub use crate::selector::{AdaptiveSelector, BattleSelector, Budgeted};
    pub use crate::worker::{BattleSettings, ProcessLauncher, WorkerCommand, WorkerLauncher};
}
