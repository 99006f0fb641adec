//! Challenge files: which opponents to fight, for how many rounds, and how to score.
//!
//! ```text
//! Targeting Challenge 2K7          <- name
//! BULLET_DAMAGE                    <- scoring style
//! 35                               <- rounds per battle
//! 1000                             <- optional field width
//! 1000                             <- optional field height
//! # comment
//! Easy {
//!   apv.AspidMovement 1.0
//!   dummy.MicroAspid 1.2, emp.Yngwie 1.0
//! }
//! cx.mini.Cigaret 1.31
//! ```
//!
//! Each remaining non-empty line is one opponent list (a melee battle when it holds several
//! comma-separated names). Lists between `Name {` and `}` belong to group `Name`.

use std::{fs, path::Path};

use anyhow::{bail, Context};

use crate::{
    confidence::Aggregation,
    matchup::Matchup,
    score::ScoringStyle,
    worker::BattleSettings,
};

/// One line of opponents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpponentList {
    /// Opponent names, as written.
    pub opponents: Vec<String>,
    /// Enclosing group, if any.
    pub group: Option<String>,
}

/// A parsed challenge file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeConfig {
    /// Display name, first line of the file.
    pub name: String,
    /// How battles are scored for the challenger.
    pub scoring_style: ScoringStyle,
    /// Rounds per battle.
    pub rounds: u32,
    /// Battlefield width, 800 unless given.
    pub width: u32,
    /// Battlefield height, 600 unless given.
    pub height: u32,
    /// Opponent lists in file order.
    pub opponents: Vec<OpponentList>,
}

impl ChallengeConfig {
    /// Reads and parses the challenge file at `path`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<ChallengeConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("could not read challenge file {}", path.display()))?;
        ChallengeConfig::parse(&content)
            .with_context(|| format!("invalid challenge file {}", path.display()))
    }

    /// Parses the content of a challenge file.
    ///
    /// # Errors
    ///
    /// Fails on a missing header line, an unknown scoring style, a non-numeric round count or an
    /// unbalanced group.
    pub fn parse(content: &str) -> anyhow::Result<ChallengeConfig> {
        let mut lines = content.lines();
        let mut header = |what: &str| {
            lines
                .next()
                .map(str::trim)
                .with_context(|| format!("missing {what} line"))
        };
        let name = header("name")?.to_string();
        let scoring_style = header("scoring style")?.parse::<ScoringStyle>()?;
        let rounds_line = header("rounds")?;
        let rounds = rounds_line
            .parse::<u32>()
            .with_context(|| format!("rounds must be a number, got '{rounds_line}'"))?;

        let mut width = None;
        let mut height = None;
        let mut group: Option<String> = None;
        let mut opponents = Vec::new();
        for (index, raw) in lines.enumerate() {
            let line = raw.trim();
            let number = index + 4;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.bytes().all(|b| b.is_ascii_digit()) {
                let value = line
                    .parse::<u32>()
                    .with_context(|| format!("line {number}: field size out of range"))?;
                if width.is_none() {
                    width = Some(value);
                } else if height.is_none() {
                    height = Some(value);
                }
            } else if let Some(group_name) = line.strip_suffix('{') {
                if let Some(open) = &group {
                    bail!("line {number}: group '{open}' is not closed");
                }
                group = Some(group_name.trim().to_string());
            } else if line == "}" {
                if group.take().is_none() {
                    bail!("line {number}: '}}' without an open group");
                }
            } else {
                let list = line
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                if list.is_empty() {
                    continue;
                }
                opponents.push(OpponentList {
                    opponents: list,
                    group: group.clone(),
                });
            }
        }
        if let Some(open) = group {
            bail!("group '{open}' is not closed");
        }

        Ok(ChallengeConfig {
            name,
            scoring_style,
            rounds,
            width: width.unwrap_or(800),
            height: height.unwrap_or(600),
            opponents,
        })
    }

    /// Engine arguments of every battle of this challenge.
    pub fn battle_settings(&self) -> BattleSettings {
        BattleSettings::new(self.rounds).with_field(self.width, self.height)
    }

    /// One matchup per opponent list, in file order.
    pub fn matchups(&self, challenger: &str) -> Vec<Matchup> {
        self.opponents
            .iter()
            .map(|list| Matchup::new(challenger, &list.opponents))
            .collect()
    }

    /// Grouped averaging as soon as the file declares a group.
    pub fn aggregation(&self) -> Aggregation {
        if self.opponents.iter().any(|o| o.group.is_some()) {
            Aggregation::Grouped
        } else {
            Aggregation::Simple
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCRM: &str = "\
Twin Duel Challenge
PERCENT_SCORE
35
1000
1000
# easy ones first
Easy {
  apv.AspidMovement 1.0
  dummy.MicroAspid 1.2 , emp.Yngwie 1.0
}

cx.mini.Cigaret 1.31
";

    #[test]
    fn parse_full_file() {
        let config = ChallengeConfig::parse(TCRM).unwrap();
        assert_eq!(config.name, "Twin Duel Challenge");
        assert_eq!(config.scoring_style, ScoringStyle::PercentScore);
        assert_eq!(config.rounds, 35);
        assert_eq!((config.width, config.height), (1000, 1000));
        assert_eq!(config.opponents.len(), 3);
        assert_eq!(
            config.opponents[1],
            OpponentList {
                opponents: vec!["dummy.MicroAspid 1.2".into(), "emp.Yngwie 1.0".into()],
                group: Some("Easy".into()),
            }
        );
        assert_eq!(config.opponents[2].group, None);
        assert_eq!(config.aggregation(), Aggregation::Grouped);
    }

    #[test]
    fn defaults_to_800_by_600() {
        let config = ChallengeConfig::parse("Mini\nSURVIVAL_FIRSTS\n10\na.B 1\n").unwrap();
        assert_eq!(config.battle_settings(), BattleSettings::new(10));
        assert_eq!(config.aggregation(), Aggregation::Simple);
    }

    #[test]
    fn matchups_put_challenger_first() {
        let config = ChallengeConfig::parse(TCRM).unwrap();
        let matchups = config.matchups("me.Bot 1.0");
        assert_eq!(matchups.len(), 3);
        assert_eq!(matchups[1].challenger(), "me.Bot 1.0");
        assert_eq!(matchups[1].key().as_str(), "dummy.MicroAspid 1.2,emp.Yngwie 1.0");
    }

    #[test]
    fn invalid_files() {
        assert!(ChallengeConfig::parse("Name\nPERCENT_SCORE\n").is_err());
        assert!(ChallengeConfig::parse("Name\nFASTEST\n35\n").is_err());
        assert!(ChallengeConfig::parse("Name\nPERCENT_SCORE\nmany\n").is_err());
        assert!(ChallengeConfig::parse("Name\nPERCENT_SCORE\n35\nG {\na.B 1\n").is_err());
        assert!(ChallengeConfig::parse("Name\nPERCENT_SCORE\n35\n}\n").is_err());
    }
}
