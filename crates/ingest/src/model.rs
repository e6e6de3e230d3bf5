//! Message payloads and fetched entity shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use otr_core::{resolve_ruleset, EntityKind, ExternalId, Ruleset};
use otr_eisenbahn::QueueRoute;

/// Tournament a fetch was requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub tournament_id: i64,
    /// Disambiguates mania submodes in the fetched data.
    pub tournament_ruleset: Ruleset,
}

/// Payload on the `data.*` request queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub kind: EntityKind,
    pub external_id: ExternalId,
    #[serde(default)]
    pub context: Option<FetchContext>,
    /// Re-fetch even if the entity is already `fetched` or `not_found`.
    #[serde(default)]
    pub force: bool,
}

impl FetchRequest {
    pub fn new(kind: EntityKind, external_id: ExternalId) -> Self {
        Self {
            kind,
            external_id,
            context: None,
            force: false,
        }
    }

    pub fn with_context(mut self, tournament_id: i64, tournament_ruleset: Ruleset) -> Self {
        self.context = Some(FetchContext {
            tournament_id,
            tournament_ruleset,
        });
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Payload on the downstream `processing.*` queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchCompleted {
    pub kind: EntityKind,
    pub external_id: ExternalId,
    pub tournament_id: Option<i64>,
    pub resolved_data: FetchedEntity,
}

/// Queue that carries fetch requests for `kind`.
pub fn request_route(kind: EntityKind) -> QueueRoute {
    match kind {
        EntityKind::Player => QueueRoute::OsuPlayers,
        EntityKind::Match => QueueRoute::OsuMatches,
        EntityKind::Beatmap => QueueRoute::OsuBeatmaps,
        EntityKind::OsuTrackSnapshot => QueueRoute::OsuTrackPlayers,
    }
}

/// Downstream stage that receives completed fetches of `kind`.
pub fn completion_route(kind: EntityKind) -> QueueRoute {
    match kind {
        EntityKind::Player | EntityKind::Match | EntityKind::Beatmap => {
            QueueRoute::AutomatedChecksTournaments
        }
        EntityKind::OsuTrackSnapshot => QueueRoute::StatsTournaments,
    }
}

// ── Fetched data ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum FetchedEntity {
    Player(PlayerData),
    Match(MatchData),
    Beatmap(BeatmapData),
    OsuTrackSnapshot(OsuTrackSnapshotData),
}

impl FetchedEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            FetchedEntity::Player(_) => EntityKind::Player,
            FetchedEntity::Match(_) => EntityKind::Match,
            FetchedEntity::Beatmap(_) => EntityKind::Beatmap,
            FetchedEntity::OsuTrackSnapshot(_) => EntityKind::OsuTrackSnapshot,
        }
    }

    /// Pin unspecified mania submodes on games, scores and beatmaps to the
    /// tournament's ruleset. Players and osu!track snapshots are left alone.
    pub fn resolve_rulesets(&mut self, tournament: Ruleset) {
        match self {
            FetchedEntity::Match(m) => {
                for game in &mut m.games {
                    game.ruleset = resolve_ruleset(game.ruleset, tournament);
                    for score in &mut game.scores {
                        score.ruleset = resolve_ruleset(score.ruleset, tournament);
                    }
                }
            }
            FetchedEntity::Beatmap(b) => b.ruleset = resolve_ruleset(b.ruleset, tournament),
            FetchedEntity::Player(_) | FetchedEntity::OsuTrackSnapshot(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerData {
    pub id: ExternalId,
    pub username: String,
    pub country_code: String,
    pub default_ruleset: Ruleset,
    /// Statistics for the ruleset the player was fetched in.
    pub ruleset: Ruleset,
    pub global_rank: Option<i64>,
    pub country_rank: Option<i64>,
    pub pp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchData {
    pub id: ExternalId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub games: Vec<GameData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameData {
    pub id: ExternalId,
    pub beatmap_id: ExternalId,
    pub ruleset: Ruleset,
    pub scoring_type: String,
    pub team_type: String,
    pub mods: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub scores: Vec<ScoreData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreData {
    pub player_id: ExternalId,
    pub ruleset: Ruleset,
    pub score: i64,
    pub accuracy: f64,
    pub max_combo: i64,
    pub mods: Vec<String>,
    pub passed: bool,
    pub slot: Option<i32>,
    pub team: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatmapData {
    pub id: ExternalId,
    pub beatmapset_id: ExternalId,
    pub artist: String,
    pub title: String,
    pub difficulty_name: String,
    pub creator: String,
    pub ruleset: Ruleset,
    pub star_rating: f64,
    pub circle_size: f64,
    pub bpm: Option<f64>,
    pub total_length_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsuTrackSnapshotData {
    pub player_id: ExternalId,
    pub ruleset: Ruleset,
    pub history: Vec<OsuTrackStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsuTrackStat {
    pub timestamp: DateTime<Utc>,
    pub pp: f64,
    pub global_rank: Option<i64>,
    pub accuracy: f64,
    pub playcount: i64,
    pub level: f64,
}
