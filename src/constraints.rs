//! Resource and timing limits applied to battle workers.
//!
//! The main entry point is [`WorkerLimitsBuilder`], which configures:
//!
//! - **Memory**: RAM hard limit per worker process (Linux cgroups v2)
//! - **CPU**: a CPU list shared out between workers, `cpus_per_worker` each
//! - **Timing**:
//!   * how long a worker may take to send its ready signal
//!   * an optional per-battle timeout
//!   * how many diagnostic lines a worker may print before its result
//! - **Recovery**: what happens to a worker after a failed battle
//!
//! Without a memory limit or CPU list, workers are started as plain child processes.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use battle_runner::constraints::WorkerLimitsBuilder;
//!
//! let limits = WorkerLimitsBuilder::new()
//!     .with_ram_per_worker(512)
//!     .with_cpu_list("0-3")
//!     .with_battle_timeout(Duration::from_secs(600))
//!     .build(4)
//!     .unwrap();
//! ```

use std::{collections::BTreeSet, env, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

use crate::protocol::ExchangeLimits;

/// What happens to a worker whose battle failed (protocol error, timeout, exit).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerRecovery {
    /// Kill it and shrink the pool.
    #[default]
    Discard,
    /// Kill it and launch a fresh worker on the same engine install.
    Respawn,
}

impl FromStr for WorkerRecovery {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(WorkerRecovery::Discard),
            "respawn" => Ok(WorkerRecovery::Respawn),
            other => bail!("unknown worker recovery policy '{other}' (expected discard or respawn)"),
        }
    }
}

/// A builder for the limits applied to every worker of a pool.
///
/// By default nothing is limited except the ready timeout (two minutes) and the number of
/// diagnostic lines per battle.
#[derive(Debug, Default)]
pub struct WorkerLimitsBuilder {
    ram_per_worker: Option<usize>,
    cpu_list: Option<String>,
    cpus_per_worker: Option<usize>,
    ready_timeout: Option<Duration>,
    battle_timeout: Option<Duration>,
    max_noise_lines: Option<usize>,
    recovery: WorkerRecovery,
}

impl WorkerLimitsBuilder {
    /// Creates a builder with every limit at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder from environment variables.
    ///
    /// Read environment variables are:
    /// - `RAM_PER_WORKER` (usize): maximum RAM per worker in MB
    /// - `CPU_LIST` (string): comma-separated list or ranges of CPUs, e.g. "0-3,6"
    /// - `CPUS_PER_WORKER` (usize): number of CPUs given to each worker
    /// - `READY_TIMEOUT_SECS` (u64): time allowed for a worker to become ready
    /// - `BATTLE_TIMEOUT_SECS` (u64): time allowed for one battle
    /// - `MAX_NOISE_LINES` (usize): diagnostic lines tolerated before a result
    /// - `WORKER_RECOVERY` (`discard` | `respawn`)
    ///
    /// Unset or unparsable variables keep their default.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: FromStr>(var: &str) -> Option<T> {
            env::var(var).ok()?.parse().ok()
        }

        fn parse_duration_secs(var: &str) -> Option<Duration> {
            parse::<u64>(var).map(Duration::from_secs)
        }

        WorkerLimitsBuilder {
            ram_per_worker: parse("RAM_PER_WORKER"),
            cpu_list: env::var("CPU_LIST").ok(),
            cpus_per_worker: parse("CPUS_PER_WORKER"),
            ready_timeout: parse_duration_secs("READY_TIMEOUT_SECS"),
            battle_timeout: parse_duration_secs("BATTLE_TIMEOUT_SECS"),
            max_noise_lines: parse("MAX_NOISE_LINES"),
            recovery: parse("WORKER_RECOVERY").unwrap_or_default(),
        }
    }

    /// Sets the maximum RAM available per worker (in MB).
    #[must_use]
    pub fn with_ram_per_worker(self, max: usize) -> Self {
        Self {
            ram_per_worker: Some(max),
            ..self
        }
    }

    /// Sets the CPUs workers are pinned to.
    ///
    /// Format follows the pattern: `"0-3,6,8"` (inclusive ranges and individual IDs).
    #[must_use]
    pub fn with_cpu_list(self, cpus: &str) -> Self {
        Self {
            cpu_list: Some(cpus.to_string()),
            ..self
        }
    }

    /// Sets the number of CPUs of the list given to each worker. Default is one.
    #[must_use]
    pub fn with_cpus_per_worker(self, count: usize) -> Self {
        Self {
            cpus_per_worker: Some(count),
            ..self
        }
    }

    /// A worker that sends no ready signal within `duration` fails to start.
    #[must_use]
    pub fn with_ready_timeout(self, duration: Duration) -> Self {
        Self {
            ready_timeout: Some(duration),
            ..self
        }
    }

    /// A battle that produces no result within `duration` fails with a timeout.
    #[must_use]
    pub fn with_battle_timeout(self, duration: Duration) -> Self {
        Self {
            battle_timeout: Some(duration),
            ..self
        }
    }

    /// Sets how many non-result lines a worker may print during one battle.
    #[must_use]
    pub fn with_max_noise_lines(self, lines: usize) -> Self {
        Self {
            max_noise_lines: Some(lines),
            ..self
        }
    }

    /// Sets what happens to a worker after a failed battle.
    #[must_use]
    pub fn with_recovery(self, recovery: WorkerRecovery) -> Self {
        Self { recovery, ..self }
    }

    /// Builds the limits for a pool of `worker_count` workers.
    ///
    /// # Errors
    ///
    /// Returns an error when the limits cannot be honoured on this host, e.g. the CPU list is
    /// too short for the number of workers or their RAM exceeds the available memory.
    pub fn build(self, worker_count: usize) -> anyhow::Result<WorkerLimits> {
        let cpus_per_worker = self.cpus_per_worker.unwrap_or(1);
        if cpus_per_worker == 0 {
            bail!("workers need at least one CPU");
        }

        let cpus = match &self.cpu_list {
            Some(list) => {
                let cpus = cpu_list_to_set(list).context("error parsing cpu list")?;
                if cpus.len() < worker_count * cpus_per_worker {
                    bail!(
                        "cpu list '{list}' has {} CPUs, {worker_count} workers need {}",
                        cpus.len(),
                        worker_count * cpus_per_worker
                    );
                }
                Some(cpus)
            }
            None => None,
        };

        let physical = num_cpus::get_physical();
        if worker_count > physical {
            warn!("{worker_count} workers on {physical} physical CPUs: battles will compete for CPU time");
        }

        let ram_per_worker = self.ram_per_worker.map(|mb| mb * 1_000_000);
        if let Some(ram) = ram_per_worker {
            let mut sys = sysinfo::System::new();
            sys.refresh_memory();
            let available = sys.available_memory() as usize;
            if ram * worker_count > available {
                bail!(
                    "{worker_count} workers of {}MB exceed the available memory ({}MB)",
                    ram / 1_000_000,
                    available / 1_000_000
                );
            }
        }

        Ok(WorkerLimits {
            ram_per_worker,
            cpus,
            cpus_per_worker,
            ready_timeout: self.ready_timeout.unwrap_or(Duration::from_secs(120)),
            exchange: ExchangeLimits {
                battle_timeout: self.battle_timeout,
                max_noise_lines: self
                    .max_noise_lines
                    .unwrap_or(ExchangeLimits::default().max_noise_lines),
            },
            recovery: self.recovery,
        })
    }
}

fn cpu_list_to_set(s: &str) -> anyhow::Result<BTreeSet<u8>> {
    if s.is_empty() {
        bail!("Empty string");
    }
    let mut set = BTreeSet::new();
    for item in s.split(',') {
        let bounds = item
            .split('-')
            .map(|v| {
                v.trim()
                    .parse::<u8>()
                    .with_context(|| format!("could not parse {v}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        match bounds[..] {
            [cpu] => {
                set.insert(cpu);
            }
            [start, end] => set.extend(start.min(end)..=start.max(end)),
            _ => bail!(
                "each comma-separated item must be a number or a range (e.g. '0-3'), got '{item}'"
            ),
        }
    }
    Ok(set)
}

/// Obtained using [`WorkerLimitsBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerLimits {
    /// In bytes.
    pub(crate) ram_per_worker: Option<usize>,
    pub(crate) cpus: Option<BTreeSet<u8>>,
    pub(crate) cpus_per_worker: usize,
    pub(crate) ready_timeout: Duration,
    pub(crate) exchange: ExchangeLimits,
    pub(crate) recovery: WorkerRecovery,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        WorkerLimits {
            ram_per_worker: None,
            cpus: None,
            cpus_per_worker: 1,
            ready_timeout: Duration::from_secs(120),
            exchange: ExchangeLimits::default(),
            recovery: WorkerRecovery::Discard,
        }
    }
}

impl WorkerLimits {
    /// Same as [`WorkerLimitsBuilder::new`].
    pub fn builder() -> WorkerLimitsBuilder {
        WorkerLimitsBuilder::new()
    }

    /// True when workers must be started inside a cgroup.
    pub fn is_contained(&self) -> bool {
        self.ram_per_worker.is_some() || self.cpus.is_some()
    }

    /// CPU list (cgroup `cpuset` syntax) for worker number `index`; empty when unpinned.
    pub fn cpus_for_worker(&self, index: usize) -> String {
        match &self.cpus {
            None => String::new(),
            Some(cpus) => cpus
                .iter()
                .skip(index * self.cpus_per_worker)
                .take(self.cpus_per_worker)
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Time allowed for a worker to send its ready signal.
    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Limits of one request/result exchange.
    pub fn exchange(&self) -> &ExchangeLimits {
        &self.exchange
    }

    /// Policy for workers whose battle failed.
    pub fn recovery(&self) -> WorkerRecovery {
        self.recovery
    }
}
