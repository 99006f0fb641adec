//! Faults raised while running battles.
//!
//! Per-battle faults ([`ProtocolFault`]) end up in the failed [`BattleOutcome`] handed to the
//! result callback. Pool level faults ([`StartupFault`], [`PoolFault`], [`SchedulingFault`])
//! abort the whole run and are returned wrapped in [`anyhow::Error`]; they can be recovered with
//! `downcast_ref`.
//!
//! [`BattleOutcome`]: crate::dispatcher::BattleOutcome

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// A worker never became ready.
#[derive(Debug, Error)]
pub enum StartupFault {
    /// The process could not be spawned.
    #[error("could not launch worker for '{install}': {reason}")]
    Launch {
        /// Engine install the worker was meant for.
        install: String,
        /// Why the launch failed.
        reason: String,
    },
    /// Its output ended before the ready signal.
    #[error("worker for '{install}' exited before sending the ready signal")]
    Exited {
        /// Engine install of the worker.
        install: String,
    },
    /// The ready timeout elapsed.
    #[error("worker for '{install}' sent no ready signal within {timeout:?}")]
    Timeout {
        /// Engine install of the worker.
        install: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

/// One battle failed on the wire. The worker that produced it is not reused.
#[derive(Debug, Error)]
pub enum ProtocolFault {
    /// The battle timeout elapsed.
    #[error("no result within {0:?}")]
    Timeout(Duration),
    /// Too many lines without a result marker.
    #[error("no result marker after {0} lines of output")]
    TooMuchNoise(usize),
    /// The worker's output ended.
    #[error("worker exited mid-battle")]
    WorkerExited,
    /// The result line could not be parsed.
    #[error("malformed result line '{line}': {reason}")]
    Malformed {
        /// The offending line.
        line: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The challenger has no score tuple in the result.
    #[error("result does not contain challenger '{0}'")]
    MissingChallenger(String),
    /// Reading or writing the worker's pipes failed.
    #[error("I/O error talking to worker: {0}")]
    Io(#[from] std::io::Error),
    /// Running the battle panicked.
    #[error("battle thread panicked: {0}")]
    WorkerPanicked(String),
}

impl ProtocolFault {
    pub(crate) fn malformed(line: &str, reason: impl Into<String>) -> ProtocolFault {
        ProtocolFault::Malformed {
            line: line.to_owned(),
            reason: reason.into(),
        }
    }
}

/// The score log could not be written or read.
#[derive(Debug, Error)]
pub enum PersistenceFault {
    /// Writing the file failed.
    #[error("could not write score log {path}: {source}")]
    Write {
        /// The log file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Reading the file failed.
    #[error("could not read score log {path}: {source}")]
    Read {
        /// The log file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The document could not be encoded or decoded.
    #[error("score log {path} is not a valid document: {source}")]
    Format {
        /// The log file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The document was written by an incompatible version.
    #[error("score log {path} has unsupported format version {version}")]
    Version {
        /// The log file.
        path: PathBuf,
        /// Version found in the document.
        version: u32,
    },
    /// The file holds another challenger's battles.
    #[error("score log {path} belongs to '{found}', not '{expected}'")]
    ChallengerMismatch {
        /// The log file.
        path: PathBuf,
        /// Challenger the log was opened for.
        expected: String,
        /// Challenger recorded in the file.
        found: String,
    },
}

/// The selector found nothing to run. Never happens while its invariants hold.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulingFault {
    /// The selector was given no matchups.
    #[error("no matchups to choose from")]
    NoMatchups,
    /// No matchup qualified under any rule.
    #[error("no eligible matchup among {0} candidates")]
    NoEligibleMatchup(usize),
}

/// Every worker of the pool has been lost.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("all workers lost, {unfinished} battle(s) could not be run")]
pub struct PoolFault {
    /// Battles left to run when the last worker was lost.
    pub unfinished: usize,
}
