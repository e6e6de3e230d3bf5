//! osu!track stat-history client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use otr_core::config::OsuTrackConfig;
use otr_core::{EntityKind, ExternalId, Ruleset};

use super::{into_outcome, send_json, Attempt, FetchClient, FetchOutcome};
use crate::error::ClientError;
use crate::model::{FetchContext, FetchedEntity, OsuTrackSnapshotData, OsuTrackStat};

pub struct OsuTrackClient {
    http: reqwest::Client,
    base_url: String,
}

impl OsuTrackClient {
    pub fn new(config: &OsuTrackConfig, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_history(&self, player_id: ExternalId, ruleset: Ruleset) -> Attempt<FetchedEntity> {
        let mode = track_mode(ruleset);
        debug!(player_id, mode, "fetching osu!track history");
        let rows: Vec<TrackRow> = send_json(
            self.http
                .get(format!("{}/stats_history", self.base_url))
                .query(&[("user", player_id.to_string()), ("mode", mode.to_string())]),
        )
        .await?;

        // A player osu!track has never seen has an empty history.
        Ok(FetchedEntity::OsuTrackSnapshot(OsuTrackSnapshotData {
            player_id,
            ruleset,
            history: rows.into_iter().map(OsuTrackStat::from).collect(),
        }))
    }
}

#[async_trait]
impl FetchClient for OsuTrackClient {
    async fn fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        context: Option<&FetchContext>,
    ) -> FetchOutcome {
        if kind != EntityKind::OsuTrackSnapshot {
            return FetchOutcome::PermanentError(format!("{kind} is not served by osu!track"));
        }
        let ruleset = context.map_or(Ruleset::Osu, |c| c.tournament_ruleset);
        into_outcome(self.fetch_history(external_id, ruleset).await)
    }
}

/// osu!track only knows the four legacy game modes.
fn track_mode(ruleset: Ruleset) -> u8 {
    match ruleset {
        Ruleset::Osu => 0,
        Ruleset::Taiko => 1,
        Ruleset::Catch => 2,
        Ruleset::ManiaOther | Ruleset::Mania4k | Ruleset::Mania7k => 3,
    }
}

#[derive(Debug, Deserialize)]
struct TrackRow {
    timestamp: DateTime<Utc>,
    pp_raw: f64,
    pp_rank: Option<i64>,
    accuracy: f64,
    playcount: i64,
    level: f64,
}

impl From<TrackRow> for OsuTrackStat {
    fn from(row: TrackRow) -> Self {
        OsuTrackStat {
            timestamp: row.timestamp,
            pp: row.pp_raw,
            // osu!track reports 0 for unranked
            global_rank: row.pp_rank.filter(|r| *r > 0),
            accuracy: row.accuracy,
            playcount: row.playcount,
            level: row.level,
        }
    }
}
