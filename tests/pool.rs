use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use battle_runner::{
    error::{PersistenceFault, PoolFault, ProtocolFault, StartupFault},
    prelude::*,
    score::{RawBattleResult, RobotScore},
    score_log::log_path,
};
use tempfile::TempDir;

const CHALLENGER: &str = "me.Bot 1.0";

const CHALLENGE: &str = "\
Mini Challenge
PERCENT_SCORE
10
a.A 1
b.B 1
c.C 1
";

/// Challenger always scores 3000 against 1000.
const ENGINE: &str = r#"
echo "Loading robots"
echo "BattleProcess ready"
while IFS= read -r line; do
  echo "Processing $line"
  challenger=${line%%,*}
  opponent=${line#*,}
  echo "BATTLE RESULT: $challenger::3000::20::1000::1500:::$opponent::1000::5::250::500"
done
"#;

const MALFORMED_ENGINE: &str = r#"
echo "BattleProcess ready"
while IFS= read -r line; do
  echo "BATTLE RESULT: this is not a score"
done
"#;

const SILENT_ENGINE: &str = r#"
echo "BattleProcess ready"
while IFS= read -r line; do
  sleep 30
done
"#;

const CRASHING_ENGINE: &str = r#"
echo "Could not load robots"
exit 1
"#;

fn engine(dir: &Path, script: &str) -> WorkerCommand {
    let path = dir.join("engine.sh");
    fs::write(&path, script).unwrap();
    WorkerCommand::new("sh").with_args([path.display().to_string()])
}

fn installs(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("engine{i}"));
            fs::create_dir_all(&path).unwrap();
            path
        })
        .collect()
}

fn config() -> Configuration {
    Configuration::new()
        .with_verbose(false)
        .with_allow_uncontained(true)
}

fn runner(dir: &TempDir, script: &str, workers: usize, limits: WorkerLimits) -> RoboRunner {
    challenge_runner(dir, CHALLENGE, script, workers, limits)
}

fn challenge_runner(
    dir: &TempDir,
    challenge: &str,
    script: &str,
    workers: usize,
    limits: WorkerLimits,
) -> RoboRunner {
    let launcher = ProcessLauncher::new(
        engine(dir.path(), script),
        installs(dir.path(), workers),
        config(),
    );
    RoboRunner::new(
        CHALLENGER,
        ChallengeConfig::parse(challenge).unwrap(),
        Arc::new(launcher),
        limits,
        config(),
        dir.path().join("data"),
    )
    .unwrap()
}

#[test]
fn seasons_fill_every_opponent_list() {
    let dir = TempDir::new().unwrap();
    let mut runner = runner(&dir, ENGINE, 2, WorkerLimits::default());

    let summary = runner.run_seasons(5).unwrap();
    assert_eq!(
        summary,
        RunSummary {
            completed: 15,
            failed: 0,
            workers_lost: 0
        }
    );

    let log = runner.score_log();
    for key in ["a.A 1", "b.B 1", "c.C 1"] {
        let key = MatchupKey::from(key);
        assert_eq!(log.battles(&key).len(), 5, "{key}");
        let score = log.relative_score(&key, ScoringStyle::PercentScore).unwrap();
        assert!((score - 75.0).abs() < 1e-9);
    }

    let report = runner.report();
    assert_eq!(report.total_battles, 15);
    assert!((report.overall.score - 75.0).abs() < 1e-9);
    assert!(report.overall.half_width < 1e-9);
}

#[test]
fn logged_battles_are_not_run_again() {
    let dir = TempDir::new().unwrap();
    {
        let mut runner = runner(&dir, ENGINE, 2, WorkerLimits::default());
        runner.run_seasons(2).unwrap();
        runner.shutdown().unwrap();
    }

    let log = ScoreLog::load(&log_path(&dir.path().join("data"), CHALLENGER)).unwrap();
    assert_eq!(log.total_battles(), 6);

    let mut runner = runner(&dir, ENGINE, 2, WorkerLimits::default());
    assert_eq!(runner.score_log().total_battles(), 6);
    assert_eq!(runner.run_seasons(2).unwrap().completed, 0);
    assert_eq!(runner.run_seasons(3).unwrap().completed, 3);
    assert_eq!(runner.score_log().total_battles(), 9);
}

#[test]
fn repeated_opponent_list_runs_once_per_season() {
    let dir = TempDir::new().unwrap();
    let challenge = "\
Repeats
PERCENT_SCORE
10
a.A 1
b.B 1,c.C 1
a.A 1
c.C 1, b.B 1
";
    let mut runner = challenge_runner(&dir, challenge, ENGINE, 2, WorkerLimits::default());

    assert_eq!(runner.run_seasons(3).unwrap().completed, 6);
    let log = runner.score_log();
    assert_eq!(log.battles(&MatchupKey::from("a.A 1")).len(), 3);
    assert_eq!(log.battles(&MatchupKey::from("b.B 1,c.C 1")).len(), 3);
    assert_eq!(runner.report().matchups.len(), 2);
}

#[test]
fn log_of_another_challenger_is_refused() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    let mut other = ScoreLog::new("someone.Else 1.0");
    other.add_battle(
        &MatchupKey::from("a.A 1"),
        RawBattleResult {
            scores: vec![RobotScore::new("someone.Else 1.0", 1.0, 0.0, 0.0, 0.0)],
            num_rounds: 10,
            elapsed: Duration::from_secs(1),
        },
    );
    other.persist(&log_path(&data, CHALLENGER)).unwrap();

    let launcher = ProcessLauncher::new(
        engine(dir.path(), ENGINE),
        installs(dir.path(), 1),
        config(),
    );
    let err = RoboRunner::new(
        CHALLENGER,
        ChallengeConfig::parse(CHALLENGE).unwrap(),
        Arc::new(launcher),
        WorkerLimits::default(),
        config(),
        &data,
    )
    .err()
    .unwrap();
    assert!(
        matches!(
            err.downcast_ref::<PersistenceFault>(),
            Some(PersistenceFault::ChallengerMismatch { .. })
        ),
        "{err:#}"
    );
}

#[test]
fn adaptive_run_respects_battle_budget() {
    let dir = TempDir::new().unwrap();
    let mut runner = runner(&dir, ENGINE, 2, WorkerLimits::default());

    let summary = runner.run_adaptive(&AdaptiveBudget::battles(12)).unwrap();
    assert_eq!(summary.completed, 12);
    let log = runner.score_log();
    assert_eq!(log.total_battles(), 12);
    for key in ["a.A 1", "b.B 1", "c.C 1"] {
        assert!(log.has_matchup(&MatchupKey::from(key)), "{key}");
    }
}

#[test]
fn adaptive_run_stops_at_target_confidence() {
    let dir = TempDir::new().unwrap();
    let mut runner = runner(&dir, ENGINE, 1, WorkerLimits::default());

    // identical results: the interval collapses as soon as every list has two battles
    let budget = AdaptiveBudget::battles(100).with_target_half_width(0.5);
    let summary = runner.run_adaptive(&budget).unwrap();
    assert_eq!(summary.completed, 6);
}

#[test]
fn malformed_result_is_not_recorded() {
    let dir = TempDir::new().unwrap();
    let mut runner = runner(&dir, MALFORMED_ENGINE, 1, WorkerLimits::default());

    // the only worker is discarded after its first battle
    let err = runner.run_seasons(1).unwrap_err();
    assert_eq!(
        err.downcast_ref::<PoolFault>(),
        Some(&PoolFault { unfinished: 2 }),
        "{err:#}"
    );
    assert_eq!(runner.score_log().total_battles(), 0);
}

#[test]
fn malformed_results_with_respawn() {
    let dir = TempDir::new().unwrap();
    let limits = WorkerLimitsBuilder::new()
        .with_recovery(WorkerRecovery::Respawn)
        .build(1)
        .unwrap();
    let mut runner = runner(&dir, MALFORMED_ENGINE, 1, limits);

    let summary = runner.run_seasons(1).unwrap();
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.workers_lost, 0);
    assert_eq!(runner.score_log().total_battles(), 0);
}

#[test]
fn malformed_outcome_carries_protocol_fault() {
    let dir = TempDir::new().unwrap();
    let launcher = ProcessLauncher::new(
        engine(dir.path(), MALFORMED_ENGINE),
        installs(dir.path(), 1),
        config(),
    );
    let mut pool = WorkerPool::initialize(
        Arc::new(launcher),
        BattleSettings::new(10),
        WorkerLimits::default(),
        config(),
    )
    .unwrap();

    let mut outcomes = Vec::new();
    let matchup = Matchup::new(CHALLENGER, &["a.A 1".to_string()]);
    let summary = pool.run_fixed([matchup], |o| outcomes.push(o)).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.workers_lost, 1);
    assert!(matches!(
        outcomes[0].result,
        Err(ProtocolFault::Malformed { .. })
    ));
}

#[test]
fn silent_worker_times_out() {
    let dir = TempDir::new().unwrap();
    let limits = WorkerLimitsBuilder::new()
        .with_battle_timeout(Duration::from_millis(300))
        .build(1)
        .unwrap();
    let launcher = ProcessLauncher::new(
        engine(dir.path(), SILENT_ENGINE),
        installs(dir.path(), 1),
        config(),
    );
    let mut pool =
        WorkerPool::initialize(Arc::new(launcher), BattleSettings::new(10), limits, config())
            .unwrap();

    let mut outcomes = Vec::new();
    let matchup = Matchup::new(CHALLENGER, &["a.A 1".to_string()]);
    pool.run_fixed([matchup], |o| outcomes.push(o)).unwrap();
    assert!(matches!(outcomes[0].result, Err(ProtocolFault::Timeout(_))));
}

#[test]
fn crashing_worker_fails_startup() {
    let dir = TempDir::new().unwrap();
    let launcher = ProcessLauncher::new(
        engine(dir.path(), CRASHING_ENGINE),
        installs(dir.path(), 2),
        config(),
    );
    let err = WorkerPool::initialize(
        Arc::new(launcher),
        BattleSettings::new(10),
        WorkerLimits::default(),
        config(),
    )
    .err()
    .unwrap();
    assert!(
        matches!(err.downcast_ref::<StartupFault>(), Some(StartupFault::Exited { .. })),
        "{err:#}"
    );
}
