//! osu! rulesets and mania submode disambiguation.
//!
//! The osu! API reports mania without the key-count variant for games and
//! scores. The tournament a match belongs to declares which variant it plays,
//! so [`resolve_ruleset`] uses that to pin down the ambiguous value.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ruleset {
    Osu,
    Taiko,
    Catch,
    /// Mania with the key count not reported upstream.
    ManiaOther,
    Mania4k,
    Mania7k,
}

impl Ruleset {
    /// Numeric code stored by downstream stages.
    pub fn code(&self) -> i32 {
        match self {
            Ruleset::Osu => 0,
            Ruleset::Taiko => 1,
            Ruleset::Catch => 2,
            Ruleset::ManiaOther => 3,
            Ruleset::Mania4k => 4,
            Ruleset::Mania7k => 5,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, CoreError> {
        match code {
            0 => Ok(Ruleset::Osu),
            1 => Ok(Ruleset::Taiko),
            2 => Ok(Ruleset::Catch),
            3 => Ok(Ruleset::ManiaOther),
            4 => Ok(Ruleset::Mania4k),
            5 => Ok(Ruleset::Mania7k),
            other => Err(CoreError::UnknownRuleset(other.to_string())),
        }
    }

    /// Map an osu! API v2 `mode` string. Beatmaps carry their key count in
    /// `cs`, which is the only place the API exposes the mania variant.
    pub fn from_api_mode(mode: &str, key_count: Option<f64>) -> Result<Self, CoreError> {
        match mode {
            "osu" => Ok(Ruleset::Osu),
            "taiko" => Ok(Ruleset::Taiko),
            "fruits" => Ok(Ruleset::Catch),
            "mania" => Ok(match key_count {
                Some(k) if k == 4.0 => Ruleset::Mania4k,
                Some(k) if k == 7.0 => Ruleset::Mania7k,
                _ => Ruleset::ManiaOther,
            }),
            other => Err(CoreError::UnknownRuleset(other.to_string())),
        }
    }

    /// Mode name understood by osu! and osu!track endpoints.
    pub fn api_mode(&self) -> &'static str {
        match self {
            Ruleset::Osu => "osu",
            Ruleset::Taiko => "taiko",
            Ruleset::Catch => "fruits",
            Ruleset::ManiaOther | Ruleset::Mania4k | Ruleset::Mania7k => "mania",
        }
    }

    pub fn is_concrete_mania(&self) -> bool {
        matches!(self, Ruleset::Mania4k | Ruleset::Mania7k)
    }
}

impl std::fmt::Display for Ruleset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ruleset::Osu => write!(f, "osu"),
            Ruleset::Taiko => write!(f, "taiko"),
            Ruleset::Catch => write!(f, "catch"),
            Ruleset::ManiaOther => write!(f, "mania_other"),
            Ruleset::Mania4k => write!(f, "mania_4k"),
            Ruleset::Mania7k => write!(f, "mania_7k"),
        }
    }
}

impl FromStr for Ruleset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "osu" => Ok(Ruleset::Osu),
            "taiko" => Ok(Ruleset::Taiko),
            "catch" => Ok(Ruleset::Catch),
            "mania_other" => Ok(Ruleset::ManiaOther),
            "mania_4k" => Ok(Ruleset::Mania4k),
            "mania_7k" => Ok(Ruleset::Mania7k),
            other => Err(CoreError::UnknownRuleset(other.to_string())),
        }
    }
}

/// The reported ruleset of a game or score, paired with its tournament's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RulesetContext {
    pub raw: Ruleset,
    pub tournament: Ruleset,
}

impl RulesetContext {
    pub fn resolve(&self) -> Ruleset {
        resolve_ruleset(self.raw, self.tournament)
    }
}

/// Replace an unspecified mania submode with the tournament's concrete one.
/// Every other combination passes `raw` through unchanged.
pub fn resolve_ruleset(raw: Ruleset, tournament: Ruleset) -> Ruleset {
    if raw == Ruleset::ManiaOther && tournament.is_concrete_mania() {
        tournament
    } else {
        raw
    }
}
