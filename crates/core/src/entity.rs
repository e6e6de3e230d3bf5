use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// osu! ids are 64-bit on the upstream API.
pub type ExternalId = i64;

/// The kinds of entity the ingestion pipeline fetches from upstream APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Match,
    Beatmap,
    OsuTrackSnapshot,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Player,
        EntityKind::Match,
        EntityKind::Beatmap,
        EntityKind::OsuTrackSnapshot,
    ];

    /// Stable storage name, used as the `entity_kind` column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Match => "match",
            EntityKind::Beatmap => "beatmap",
            EntityKind::OsuTrackSnapshot => "osutrack_snapshot",
        }
    }

    /// The upstream API that serves this kind.
    pub fn api(&self) -> ExternalApi {
        match self {
            EntityKind::Player | EntityKind::Match | EntityKind::Beatmap => ExternalApi::Osu,
            EntityKind::OsuTrackSnapshot => ExternalApi::OsuTrack,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "player" => Ok(EntityKind::Player),
            "match" => Ok(EntityKind::Match),
            "beatmap" => Ok(EntityKind::Beatmap),
            "osutrack_snapshot" => Ok(EntityKind::OsuTrackSnapshot),
            other => Err(CoreError::UnknownEntityKind(other.to_string())),
        }
    }
}

/// Upstream APIs with their own rate budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalApi {
    Osu,
    OsuTrack,
}

impl ExternalApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalApi::Osu => "osu",
            ExternalApi::OsuTrack => "osutrack",
        }
    }
}

impl std::fmt::Display for ExternalApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one fetchable entity: exactly one status record exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub external_id: ExternalId,
}

impl EntityKey {
    pub fn new(kind: EntityKind, external_id: ExternalId) -> Self {
        Self { kind, external_id }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.external_id)
    }
}

/// Lifecycle state of one entity's ingestion.
///
/// `NotFetched -> Fetching -> Fetched | NotFound | Error`, and `Error -> Fetching`
/// on retry. `Fetched` and `NotFound` are terminal unless a fetch is forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    NotFetched,
    Fetching,
    Fetched,
    NotFound,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::NotFetched => "not_fetched",
            FetchStatus::Fetching => "fetching",
            FetchStatus::Fetched => "fetched",
            FetchStatus::NotFound => "not_found",
            FetchStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchStatus::Fetched | FetchStatus::NotFound)
    }

    /// Whether `try_begin_fetch` may move a record in this state to `Fetching`.
    pub fn admits_fetch(&self, force: bool) -> bool {
        match self {
            FetchStatus::NotFetched | FetchStatus::Error => true,
            FetchStatus::Fetched | FetchStatus::NotFound => force,
            FetchStatus::Fetching => false,
        }
    }
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_fetched" => Ok(FetchStatus::NotFetched),
            "fetching" => Ok(FetchStatus::Fetching),
            "fetched" => Ok(FetchStatus::Fetched),
            "not_found" => Ok(FetchStatus::NotFound),
            "error" => Ok(FetchStatus::Error),
            other => Err(CoreError::UnknownFetchStatus(other.to_string())),
        }
    }
}
