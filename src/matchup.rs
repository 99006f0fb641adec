//! Matchups: a challenger plus a fixed set of opponents.
//!
//! Every matchup is identified by its [`MatchupKey`], the comma-joined, sorted list of opponent
//! names. Two matchups with the same opponents map to the same key no matter the order the
//! opponents were listed in.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Canonical identifier of a matchup: sorted opponent names joined by `,`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchupKey(String);

impl MatchupKey {
    /// Builds the key of an opponent set. The challenger must not be part of `opponents`.
    pub fn from_opponents<S: AsRef<str>>(opponents: &[S]) -> MatchupKey {
        let mut sorted = opponents.iter().map(AsRef::as_ref).collect::<Vec<_>>();
        sorted.sort_unstable();
        MatchupKey(sorted.join(","))
    }

    /// The key as stored on disk and printed in reports.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MatchupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MatchupKey {
    /// Wraps an already canonical key (e.g. read back from a score log).
    fn from(value: &str) -> Self {
        MatchupKey(value.to_owned())
    }
}

/// An ordered list of participants, challenger first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Matchup {
    participants: Vec<String>,
    key: MatchupKey,
}

impl Matchup {
    /// Creates a matchup of `challenger` against `opponents`.
    pub fn new(challenger: impl Into<String>, opponents: &[String]) -> Matchup {
        let mut participants = Vec::with_capacity(opponents.len() + 1);
        participants.push(challenger.into());
        participants.extend(opponents.iter().cloned());
        let key = MatchupKey::from_opponents(opponents);
        Matchup { participants, key }
    }

    /// All participants, challenger first, opponents in the order they were given.
    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    /// Name of the challenger.
    pub fn challenger(&self) -> &str {
        &self.participants[0]
    }

    /// Opponents in the order they were given.
    pub fn opponents(&self) -> &[String] {
        &self.participants[1..]
    }

    /// Key of the opponent set, shared by every ordering of it.
    pub fn key(&self) -> &MatchupKey {
        &self.key
    }
}

impl Display for Matchup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.participants.join(" VS "))
    }
}
