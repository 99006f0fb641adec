//! Per-challenger battle history, running averages, and durable storage.
//!
//! The [`ScoreLog`] keeps every battle ever recorded, grouped by matchup key, so that
//! deviations can be recomputed and relative scores re-derived under any [`ScoringStyle`].
//! It is mutated from the pool's callback lane only.
//!
//! On disk a log is one zstd-compressed JSON document:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "challenger": "me.Bot 1.0",
//!   "matchups": [
//!     { "key": "you.Bot 2.0", "battles": [
//!       { "scores": [{ "name": "me.Bot 1.0", "score": 3520.0, ... }],
//!         "num_rounds": 35, "elapsed": { "secs": 41, "nanos": 0 } } ] }
//!   ]
//! }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{BufWriter, Write},
    ops::Deref,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::{
    error::PersistenceFault,
    matchup::MatchupKey,
    score::{AggregatedScore, RawBattleResult, ScoringStyle},
    selector::ScoreError,
};

const FORMAT_VERSION: u32 = 1;
const COMPRESSION_LEVEL: i32 = 3;
/// Extension of persisted logs.
pub const LOG_EXTENSION: &str = "json.zst";

/// The average battle of a matchup.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleScore {
    /// One running mean per participant, in order of first appearance.
    pub scores: Vec<AggregatedScore>,
    /// Mean rounds per battle.
    pub num_rounds: f64,
    /// Battles averaged.
    pub num_battles: u32,
    total_elapsed: Duration,
}

impl BattleScore {
    fn empty() -> Self {
        BattleScore {
            scores: Vec::new(),
            num_rounds: 0.0,
            num_battles: 0,
            total_elapsed: Duration::ZERO,
        }
    }

    fn add(&mut self, battle: &RawBattleResult) {
        for robot in &battle.scores {
            let single = AggregatedScore::from(robot);
            match self.scores.iter_mut().find(|s| s.mean.name == robot.name) {
                Some(aggregate) => *aggregate = aggregate.merge(&single),
                None => self.scores.push(single),
            }
        }
        let n = self.num_battles as f64;
        self.num_rounds = (self.num_rounds * n + battle.num_rounds as f64) / (n + 1.0);
        self.num_battles += 1;
        self.total_elapsed += battle.elapsed;
    }

    /// Running mean of participant `name`.
    pub fn score_of(&self, name: &str) -> Option<&AggregatedScore> {
        self.scores.iter().find(|s| s.mean.name == name)
    }

    /// Mean wall-clock duration of a battle.
    pub fn avg_elapsed(&self) -> Duration {
        if self.num_battles == 0 {
            Duration::ZERO
        } else {
            self.total_elapsed / self.num_battles
        }
    }

    /// Relative score of `challenger`'s averages against everyone else's.
    pub fn relative_score(&self, challenger: &str, style: ScoringStyle) -> Option<f64> {
        let mine = self.score_of(challenger)?;
        let enemies = self
            .scores
            .iter()
            .filter(|s| s.mean.name != challenger)
            .map(|s| &s.mean)
            .collect::<Vec<_>>();
        Some(style.relative_score(&mine.mean, &enemies, self.num_rounds))
    }
}

/// Every battle of one challenger, by matchup.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreLog {
    challenger: String,
    battles: BTreeMap<MatchupKey, Vec<RawBattleResult>>,
    averages: HashMap<MatchupKey, BattleScore>,
    order: Vec<MatchupKey>,
}

impl ScoreLog {
    /// An empty log for `challenger`.
    pub fn new(challenger: impl Into<String>) -> Self {
        ScoreLog {
            challenger: challenger.into(),
            battles: BTreeMap::new(),
            averages: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Whose battles these are.
    pub fn challenger(&self) -> &str {
        &self.challenger
    }

    /// Appends a battle to the history of `key`.
    pub fn add_battle(&mut self, key: &MatchupKey, result: RawBattleResult) {
        if !self.battles.contains_key(key) {
            self.order.push(key.clone());
        }
        self.averages
            .entry(key.clone())
            .or_insert_with(BattleScore::empty)
            .add(&result);
        self.battles.entry(key.clone()).or_default().push(result);
    }

    /// Matchup keys in the order their first battle was recorded.
    pub fn matchup_keys(&self) -> &[MatchupKey] {
        &self.order
    }

    /// True once `key` has a battle.
    pub fn has_matchup(&self, key: &MatchupKey) -> bool {
        self.battles.contains_key(key)
    }

    /// Every battle of `key`, in completion order.
    pub fn battles(&self, key: &MatchupKey) -> &[RawBattleResult] {
        self.battles.get(key).map_or(&[], Vec::as_slice)
    }

    /// Most recent battle of `key`.
    pub fn last_battle(&self, key: &MatchupKey) -> Option<&RawBattleResult> {
        self.battles(key).last()
    }

    /// Battles recorded over the given matchups.
    pub fn battle_count<'a>(&self, keys: impl IntoIterator<Item = &'a MatchupKey>) -> usize {
        keys.into_iter().map(|k| self.battles(k).len()).sum()
    }

    /// Battles over every matchup.
    pub fn total_battles(&self) -> usize {
        self.battles.values().map(Vec::len).sum()
    }

    /// Average battle over the whole history of `key`.
    pub fn average_for(&self, key: &MatchupKey) -> Option<&BattleScore> {
        self.averages.get(key)
    }

    /// Challenger score of the averaged matchup.
    pub fn relative_score(&self, key: &MatchupKey, style: ScoringStyle) -> Option<f64> {
        self.average_for(key)?
            .relative_score(&self.challenger, style)
    }

    /// Challenger score of every battle of `key`, in completion order.
    pub fn battle_relative_scores(&self, key: &MatchupKey, style: ScoringStyle) -> Vec<f64> {
        self.battles(key)
            .iter()
            .filter_map(|b| b.relative_score(&self.challenger, style))
            .collect()
    }

    /// Spread of the per-battle relative scores of `key`, `None` before its first battle.
    pub fn score_error(&self, key: &MatchupKey, style: ScoringStyle) -> Option<ScoreError> {
        let average = self.average_for(key)?;
        let scores = self.battle_relative_scores(key, style);
        if scores.is_empty() {
            return None;
        }
        Some(ScoreError::from_samples(&scores, average.avg_elapsed()))
    }

    /// Writes the whole history to `path`, replacing any previous file atomically.
    #[instrument(skip(self), fields(challenger = %self.challenger))]
    pub fn persist(&self, path: &Path) -> Result<(), PersistenceFault> {
        let write_fault = |source| PersistenceFault::Write {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_fault)?;

        let document = LogDocumentRef {
            format_version: FORMAT_VERSION,
            challenger: &self.challenger,
            matchups: self
                .battles
                .iter()
                .map(|(key, battles)| MatchupRef { key, battles })
                .collect(),
        };

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_fault)?;
        {
            let mut encoder =
                zstd::Encoder::new(BufWriter::new(temp.as_file_mut()), COMPRESSION_LEVEL)
                    .map_err(write_fault)?;
            serde_json::to_writer(&mut encoder, &document).map_err(|source| {
                PersistenceFault::Format {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            let mut buffered = encoder.finish().map_err(write_fault)?;
            buffered.flush().map_err(write_fault)?;
        }
        temp.as_file().sync_all().map_err(write_fault)?;
        temp.persist(path).map_err(|e| write_fault(e.error))?;
        debug!(battles = self.total_battles(), ?path, "score log written");
        Ok(())
    }

    /// Reads a log written by [`persist`](Self::persist) and replays it battle by battle.
    #[instrument]
    pub fn load(path: &Path) -> Result<ScoreLog, PersistenceFault> {
        let read_fault = |source| PersistenceFault::Read {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(read_fault)?;
        let decoder = zstd::Decoder::new(file).map_err(read_fault)?;
        let document: LogDocument =
            serde_json::from_reader(decoder).map_err(|source| PersistenceFault::Format {
                path: path.to_path_buf(),
                source,
            })?;
        if document.format_version != FORMAT_VERSION {
            return Err(PersistenceFault::Version {
                path: path.to_path_buf(),
                version: document.format_version,
            });
        }

        let mut log = ScoreLog::new(document.challenger);
        for matchup in document.matchups {
            for battle in matchup.battles {
                log.add_battle(&matchup.key, battle);
            }
        }
        debug!(battles = log.total_battles(), "score log loaded");
        Ok(log)
    }
}

#[derive(Serialize)]
struct LogDocumentRef<'a> {
    format_version: u32,
    challenger: &'a str,
    matchups: Vec<MatchupRef<'a>>,
}

#[derive(Serialize)]
struct MatchupRef<'a> {
    key: &'a MatchupKey,
    battles: &'a [RawBattleResult],
}

#[derive(Deserialize)]
struct LogDocument {
    format_version: u32,
    challenger: String,
    matchups: Vec<MatchupDocument>,
}

#[derive(Deserialize)]
struct MatchupDocument {
    key: MatchupKey,
    battles: Vec<RawBattleResult>,
}

/// Default location of a challenger's log inside `data_dir`.
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-escaped, so distinct challengers never share a file.
pub fn log_path(data_dir: &Path, challenger: &str) -> PathBuf {
    let mut file_name = String::with_capacity(challenger.len());
    for byte in challenger.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'_') {
            file_name.push(byte as char);
        } else {
            file_name.push_str(&format!("%{byte:02X}"));
        }
    }
    data_dir.join(format!("{file_name}.{LOG_EXTENSION}"))
}

/// A [`ScoreLog`] bound to its file.
///
/// Written every `persist_every` recorded battles and once more when dropped, so an early
/// return or a panic unwinding through the owner still saves the latest results.
#[derive(Debug)]
pub struct PersistentScoreLog {
    log: ScoreLog,
    path: PathBuf,
    persist_every: usize,
    unsaved: usize,
}

impl PersistentScoreLog {
    /// Loads the log at `path`, or starts an empty one for `challenger` if there is none.
    ///
    /// # Errors
    ///
    /// Besides read faults, a file holding another challenger's battles is refused with
    /// [`PersistenceFault::ChallengerMismatch`].
    pub fn open(path: impl Into<PathBuf>, challenger: &str) -> Result<Self, PersistenceFault> {
        let path = path.into();
        let log = if path.exists() {
            let log = ScoreLog::load(&path)?;
            if log.challenger() != challenger {
                return Err(PersistenceFault::ChallengerMismatch {
                    path,
                    expected: challenger.to_owned(),
                    found: log.challenger().to_owned(),
                });
            }
            info!(battles = log.total_battles(), "resuming from {}", path.display());
            log
        } else {
            ScoreLog::new(challenger)
        };
        Ok(PersistentScoreLog {
            log,
            path,
            persist_every: 1,
            unsaved: 0,
        })
    }

    /// Writes the file every `persist_every` battles instead of after each one.
    pub fn with_persist_every(mut self, persist_every: usize) -> Self {
        self.set_persist_every(persist_every);
        self
    }

    /// Same as [`with_persist_every`](Self::with_persist_every), in place. Zero counts as one.
    pub fn set_persist_every(&mut self, persist_every: usize) {
        self.persist_every = persist_every.max(1);
    }

    /// The file the log is written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a battle and writes the file when enough battles are unsaved.
    ///
    /// A failed write is logged and retried with the next battle; nothing is lost from memory.
    pub fn add_battle(&mut self, key: &MatchupKey, result: RawBattleResult) {
        self.log.add_battle(key, result);
        self.unsaved += 1;
        if self.unsaved >= self.persist_every {
            if let Err(e) = self.save() {
                error!("{e}");
            }
        }
    }

    /// Writes the log now.
    pub fn save(&mut self) -> Result<(), PersistenceFault> {
        self.log.persist(&self.path)?;
        self.unsaved = 0;
        Ok(())
    }
}

impl Deref for PersistentScoreLog {
    type Target = ScoreLog;

    fn deref(&self) -> &ScoreLog {
        &self.log
    }
}

impl Drop for PersistentScoreLog {
    fn drop(&mut self) {
        if self.unsaved > 0 {
            if let Err(e) = self.save() {
                error!("results since the last save are lost: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::score::RobotScore;

    use super::*;

    fn battle(mine: f64, theirs: f64, secs: u64) -> RawBattleResult {
        RawBattleResult {
            scores: vec![
                RobotScore::new("me", mine, 10.0, mine / 2.0, mine / 3.0),
                RobotScore::new("you", theirs, 5.0, theirs / 2.0, theirs / 3.0),
            ],
            num_rounds: 10,
            elapsed: Duration::from_secs(secs),
        }
    }

    fn key() -> MatchupKey {
        MatchupKey::from("you")
    }

    #[test]
    fn history_and_average() {
        let mut log = ScoreLog::new("me");
        log.add_battle(&key(), battle(300.0, 100.0, 2));
        log.add_battle(&key(), battle(100.0, 100.0, 4));

        assert_eq!(log.battles(&key()).len(), 2);
        assert_eq!(log.last_battle(&key()), Some(&battle(100.0, 100.0, 4)));
        let avg = log.average_for(&key()).unwrap();
        assert_eq!(avg.num_battles, 2);
        assert_eq!(avg.score_of("me").unwrap().mean.score, 200.0);
        assert_eq!(avg.avg_elapsed(), Duration::from_secs(3));
        // 200 / (200 + 100)
        let relative = log.relative_score(&key(), ScoringStyle::PercentScore).unwrap();
        assert!((relative - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn per_battle_scores_and_error() {
        let mut log = ScoreLog::new("me");
        log.add_battle(&key(), battle(300.0, 100.0, 1));
        log.add_battle(&key(), battle(100.0, 100.0, 3));
        assert_eq!(
            log.battle_relative_scores(&key(), ScoringStyle::PercentScore),
            vec![75.0, 50.0]
        );
        let error = log.score_error(&key(), ScoringStyle::PercentScore).unwrap();
        assert_eq!(error.num_battles, 2);
        assert!((error.average - 62.5).abs() < 1e-12);
        assert!((error.std_dev - (312.5f64).sqrt()).abs() < 1e-9);
        assert_eq!(error.avg_time, Duration::from_secs(2));
        assert!(log.score_error(&MatchupKey::from("nobody"), ScoringStyle::PercentScore).is_none());
    }

    #[test]
    fn counts_and_order() {
        let mut log = ScoreLog::new("me");
        let (b, a) = (MatchupKey::from("b"), MatchupKey::from("a"));
        log.add_battle(&b, battle(1.0, 1.0, 1));
        log.add_battle(&a, battle(1.0, 1.0, 1));
        log.add_battle(&b, battle(1.0, 1.0, 1));
        assert_eq!(log.matchup_keys(), &[b.clone(), a.clone()]);
        assert_eq!(log.battle_count([&a, &b]), 3);
        assert_eq!(log.battle_count([&MatchupKey::from("c")]), 0);
        assert_eq!(log.total_battles(), 3);
    }

    #[test]
    fn persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path(), "me");
        let mut log = ScoreLog::new("me");
        log.add_battle(&key(), battle(317.3, 101.9, 2));
        log.add_battle(&key(), battle(0.1, 0.2, 3));
        log.persist(&path).unwrap();

        let loaded = ScoreLog::load(&path).unwrap();
        assert_eq!(loaded.challenger(), "me");
        assert_eq!(loaded.average_for(&key()), log.average_for(&key()));
        assert_eq!(loaded.battles(&key()), log.battles(&key()));
    }

    #[test]
    fn load_missing_file_is_a_read_fault() {
        let dir = tempfile::tempdir().unwrap();
        let err = ScoreLog::load(&dir.path().join("missing.json.zst")).unwrap_err();
        assert!(matches!(err, PersistenceFault::Read { .. }), "{err}");
    }

    #[test]
    fn log_file_name_is_escaped() {
        let path = log_path(Path::new("data"), "me.Bot 1.0/x");
        assert_eq!(path, Path::new("data/me.Bot%201.0%2Fx.json.zst"));
        assert_ne!(
            log_path(Path::new("data"), "me.Bot 1.0"),
            log_path(Path::new("data"), "me.Bot_1.0")
        );
        assert_ne!(
            log_path(Path::new("data"), "a%20b"),
            log_path(Path::new("data"), "a b")
        );
    }

    #[test]
    fn foreign_log_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json.zst");
        let mut other = ScoreLog::new("me.Bot_1.0");
        other.add_battle(&key(), battle(3.0, 1.0, 1));
        other.persist(&path).unwrap();

        let err = PersistentScoreLog::open(&path, "me.Bot 1.0").unwrap_err();
        assert!(
            matches!(
                &err,
                PersistenceFault::ChallengerMismatch { expected, found, .. }
                    if expected == "me.Bot 1.0" && found == "me.Bot_1.0"
            ),
            "{err}"
        );
        // the other challenger's file is left alone
        assert_eq!(ScoreLog::load(&path).unwrap().total_battles(), 1);
    }

    #[test]
    fn guard_persists_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path(), "me");
        {
            let mut log = PersistentScoreLog::open(&path, "me")
                .unwrap()
                .with_persist_every(100);
            log.add_battle(&key(), battle(1.0, 2.0, 1));
            assert!(!path.exists());
        }
        let reopened = PersistentScoreLog::open(&path, "me").unwrap();
        assert_eq!(reopened.total_battles(), 1);
    }
}
