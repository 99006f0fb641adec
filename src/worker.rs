//! Battle workers: long-lived engine processes driven through the line protocol.
//!
//! A [`WorkerLauncher`] starts one [`BattleWorker`] per engine install. The pool only ever talks
//! to workers through the [`BattleWorker`] trait, so tests can swap the process for an in-memory
//! double.

use std::{
    path::{Path, PathBuf},
    process::ChildStdin,
    time::Duration,
};

use tracing::{debug, instrument, warn};

use crate::{
    cgroup_manager::LimitedProcess,
    configuration::Configuration,
    constraints::WorkerLimits,
    error::{ProtocolFault, StartupFault},
    protocol::{spawn_line_reader, ExchangeLimits, ProtocolClient},
    score::RobotScore,
};

const KILL_DURATION: Duration = Duration::from_secs(1);

/// Battle parameters every worker of a pool is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BattleSettings {
    /// Rounds per battle.
    pub num_rounds: u32,
    /// Battlefield width.
    pub width: u32,
    /// Battlefield height.
    pub height: u32,
}

impl BattleSettings {
    /// `num_rounds` rounds on the default 800x600 battlefield.
    pub fn new(num_rounds: u32) -> Self {
        BattleSettings {
            num_rounds,
            width: 800,
            height: 600,
        }
    }

    /// Sets the battlefield size.
    pub fn with_field(self, width: u32, height: u32) -> Self {
        BattleSettings {
            width,
            height,
            ..self
        }
    }

    /// Install-specific arguments appended to the worker command line.
    pub fn worker_args(&self, install: &Path) -> Vec<String> {
        vec![
            "-rounds".to_string(),
            self.num_rounds.to_string(),
            "-width".to_string(),
            self.width.to_string(),
            "-height".to_string(),
            self.height.to_string(),
            "-path".to_string(),
            install.display().to_string(),
        ]
    }
}

/// One simulation engine instance. Runs at most one battle at a time.
pub trait BattleWorker: Send {
    /// Name used in logs and [`BattleOutcome`](crate::dispatcher::BattleOutcome)s.
    fn label(&self) -> &str;

    /// Index of the engine install this worker is bound to.
    fn install(&self) -> usize;

    /// Runs one battle. `participants` starts with the challenger.
    fn run_battle(
        &mut self,
        participants: &[String],
        limits: &ExchangeLimits,
    ) -> Result<Vec<RobotScore>, ProtocolFault>;

    /// Stops the worker for good. Called before a faulted worker is dropped and at shutdown.
    fn terminate(&mut self) {}
}

/// Starts workers, one per engine install.
pub trait WorkerLauncher: Send + Sync {
    /// Number of engine installs, hence of workers in a pool.
    fn install_count(&self) -> usize;

    /// Starts the worker of `install` and blocks until it is ready.
    fn launch(
        &self,
        install: usize,
        settings: &BattleSettings,
        limits: &WorkerLimits,
    ) -> Result<Box<dyn BattleWorker>, StartupFault>;
}

/// Program (and leading arguments) that starts one worker, e.g. `java -cp ... BattleProcess`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before the battle settings.
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// A command running `program` without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        WorkerCommand {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Replaces the arguments.
    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WorkerCommand {
            args: args.into_iter().map(Into::into).collect(),
            ..self
        }
    }
}

/// Launches [`ProcessWorker`]s, one per engine install directory.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: WorkerCommand,
    installs: Vec<PathBuf>,
    config: Configuration,
}

impl ProcessLauncher {
    /// Runs `command` once per install directory of `installs`.
    pub fn new(command: WorkerCommand, installs: Vec<PathBuf>, config: Configuration) -> Self {
        ProcessLauncher {
            command,
            installs,
            config,
        }
    }

    fn spawn(
        &self,
        install: usize,
        label: &str,
        args: &[String],
        limits: &WorkerLimits,
    ) -> Result<LimitedProcess, StartupFault> {
        let program = &self.command.program;
        let allow_stderr = self.config.debug_worker_stderr;
        let launch_fault = |e: anyhow::Error| StartupFault::Launch {
            install: label.to_string(),
            reason: format!("{e:#}"),
        };

        if !limits.is_contained() {
            return LimitedProcess::launch_without_container(program, args, allow_stderr)
                .map_err(launch_fault);
        }

        let max_memory = limits.ram_per_worker.map_or(0, |ram| ram as i64);
        let cpus = limits.cpus_for_worker(install);
        match LimitedProcess::launch(program, args, max_memory, &cpus, allow_stderr) {
            Ok(process) => Ok(process),
            Err(e) if self.config.allow_uncontained => {
                warn!("could not contain worker for {label}, running it without limits: {e:#}");
                LimitedProcess::launch_without_container(program, args, allow_stderr)
                    .map_err(launch_fault)
            }
            Err(e) => Err(launch_fault(e)),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn install_count(&self) -> usize {
        self.installs.len()
    }

    #[instrument(skip(self, settings, limits))]
    fn launch(
        &self,
        install: usize,
        settings: &BattleSettings,
        limits: &WorkerLimits,
    ) -> Result<Box<dyn BattleWorker>, StartupFault> {
        let path = self
            .installs
            .get(install)
            .ok_or_else(|| StartupFault::Launch {
                install: format!("#{install}"),
                reason: format!("only {} engine installs configured", self.installs.len()),
            })?;
        let label = path.display().to_string();

        let mut args = self.command.args.clone();
        args.extend(settings.worker_args(path));
        debug!(program = %self.command.program, ?args, "starting worker");

        let mut process = self.spawn(install, &label, &args, limits)?;
        let missing_pipe = || StartupFault::Launch {
            install: label.clone(),
            reason: "worker pipes are not available".to_string(),
        };
        let stdin = process.child.stdin.take().ok_or_else(missing_pipe)?;
        let stdout = process.child.stdout.take().ok_or_else(missing_pipe)?;

        let lines = spawn_line_reader(stdout, label.clone());
        let mut client = ProtocolClient::new(stdin, lines, label);
        client.wait_ready(limits.ready_timeout())?;

        Ok(Box::new(ProcessWorker {
            process,
            client,
            install,
        }))
    }
}

/// A worker backed by an engine child process. The process is killed when dropped.
#[derive(Debug)]
pub struct ProcessWorker {
    process: LimitedProcess,
    client: ProtocolClient<ChildStdin>,
    install: usize,
}

impl BattleWorker for ProcessWorker {
    fn label(&self) -> &str {
        self.client.label()
    }

    fn install(&self) -> usize {
        self.install
    }

    fn run_battle(
        &mut self,
        participants: &[String],
        limits: &ExchangeLimits,
    ) -> Result<Vec<RobotScore>, ProtocolFault> {
        self.client.exchange(participants, limits)
    }

    fn terminate(&mut self) {
        if let Err(e) = self.process.try_kill(KILL_DURATION) {
            warn!("could not stop worker {}: {e:#}", self.client.label());
        }
    }
}
