//! osu! API v2 client.
//!
//! Authenticates with the client-credentials grant and caches the token
//! until shortly before it expires. Match histories longer than one page
//! are followed with `after` cursors; each follow-up page takes its own
//! permit from the shared limiter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use otr_core::config::OsuApiConfig;
use otr_core::{EntityKind, ExternalApi, ExternalId, Ruleset};

use super::{check_status, classify_error, decode_json, into_outcome, send_json, Attempt, FetchClient, FetchOutcome};
use crate::error::ClientError;
use crate::model::{BeatmapData, FetchContext, FetchedEntity, GameData, MatchData, PlayerData, ScoreData};
use crate::rate_limit::RateLimiter;

/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const MATCH_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct OsuApiClient {
    http: reqwest::Client,
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl OsuApiClient {
    pub fn new(config: &OsuApiConfig, timeout: Duration) -> Result<Self, ClientError> {
        let (Some(client_id), Some(client_secret)) = (&config.client_id, &config.client_secret) else {
            return Err(ClientError::Config(
                "OSU_CLIENT_ID and OSU_CLIENT_SECRET must be set".to_string(),
            ));
        };
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            token: Mutex::new(None),
            limiter: None,
        })
    }

    /// Charge follow-up requests (match pages) against `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn access_token(&self) -> Attempt<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let body = serde_json::json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "grant_type": "client_credentials",
            "scope": "public",
        });
        let response: TokenResponse = send_json(self.http.post(&self.token_url).json(&body)).await?;
        info!(expires_in = response.expires_in, "osu! API token refreshed");

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            access_token: response.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Attempt<T> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| classify_error(&e))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            // Revoked or expired early; the retry fetches a new one.
            warn!(path, "osu! API rejected the access token");
            *self.token.lock().await = None;
            return Err(FetchOutcome::TransientError("access token rejected".to_string()));
        }
        decode_json(check_status(response)?).await
    }

    async fn fetch_player(&self, id: ExternalId, context: Option<&FetchContext>) -> Attempt<FetchedEntity> {
        let mode = context.map_or("osu", |c| c.tournament_ruleset.api_mode());
        let user: ApiUser = self
            .get(&format!("/users/{id}/{mode}"), &[("key", "id".to_string())])
            .await?;
        Ok(FetchedEntity::Player(user.into_player(mode)?))
    }

    async fn fetch_match(&self, id: ExternalId) -> Attempt<FetchedEntity> {
        let path = &format!("/matches/{id}");
        let (info, events) =
            collect_match_events(self.limiter.as_deref(), move |after| self.match_page(path, after)).await?;
        Ok(FetchedEntity::Match(info.into_match(events)?))
    }

    async fn match_page(&self, path: &str, after: i64) -> Attempt<ApiMatchPage> {
        self.get(
            path,
            &[("after", after.to_string()), ("limit", MATCH_PAGE_LIMIT.to_string())],
        )
        .await
    }

    async fn fetch_beatmap(&self, id: ExternalId) -> Attempt<FetchedEntity> {
        let beatmap: ApiBeatmap = self.get(&format!("/beatmaps/{id}"), &[]).await?;
        Ok(FetchedEntity::Beatmap(beatmap.try_into()?))
    }
}

#[async_trait]
impl FetchClient for OsuApiClient {
    async fn fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        context: Option<&FetchContext>,
    ) -> FetchOutcome {
        let attempt = match kind {
            EntityKind::Player => self.fetch_player(external_id, context).await,
            EntityKind::Match => self.fetch_match(external_id).await,
            EntityKind::Beatmap => self.fetch_beatmap(external_id).await,
            EntityKind::OsuTrackSnapshot => Err(FetchOutcome::PermanentError(format!(
                "{kind} is not served by the osu! API"
            ))),
        };
        into_outcome(attempt)
    }
}

// ── API responses ────────────────────────────────────────────────────

fn ruleset(mode: &str, key_count: Option<f64>) -> Attempt<Ruleset> {
    Ruleset::from_api_mode(mode, key_count).map_err(|e| FetchOutcome::PermanentError(e.to_string()))
}

/// Page forward through a match from its first event. Without a cursor the
/// API answers with the newest events only, so every page, the first
/// included, passes `after`. Follow-up pages take a permit of their own.
async fn collect_match_events<F, Fut>(
    limiter: Option<&RateLimiter>,
    mut fetch_page: F,
) -> Attempt<(ApiMatchInfo, Vec<ApiMatchEvent>)>
where
    F: FnMut(i64) -> Fut,
    Fut: std::future::Future<Output = Attempt<ApiMatchPage>>,
{
    let first = fetch_page(0).await?;
    let info = first.r#match;
    let latest = first.latest_event_id;
    let mut events = first.events;

    while let Some(last) = events.last().map(|e| e.id) {
        if !has_more_pages(latest, last) {
            break;
        }
        if let Some(limiter) = limiter {
            limiter.acquire(ExternalApi::Osu).await;
        }
        debug!(match_id = info.id, after = last, "fetching next match page");
        let next = fetch_page(last).await?;
        // A page that does not move the cursor would loop forever.
        if next.events.last().map_or(true, |e| e.id <= last) {
            warn!(match_id = info.id, after = last, "match page did not advance, stopping");
            break;
        }
        events.extend(next.events);
    }
    Ok((info, events))
}

/// Whether events after `last_seen` remain to be fetched.
fn has_more_pages(latest_event_id: Option<i64>, last_seen: i64) -> bool {
    latest_event_id.is_some_and(|latest| latest > last_seen)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: ExternalId,
    username: String,
    country_code: String,
    playmode: String,
    #[serde(default)]
    statistics: Option<ApiUserStatistics>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUserStatistics {
    global_rank: Option<i64>,
    country_rank: Option<i64>,
    pp: Option<f64>,
}

impl ApiUser {
    fn into_player(self, mode: &str) -> Attempt<PlayerData> {
        let stats = self.statistics.unwrap_or_default();
        Ok(PlayerData {
            id: self.id,
            username: self.username,
            country_code: self.country_code,
            default_ruleset: ruleset(&self.playmode, None)?,
            ruleset: ruleset(mode, None)?,
            global_rank: stats.global_rank,
            country_rank: stats.country_rank,
            pp: stats.pp,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiMatchPage {
    r#match: ApiMatchInfo,
    #[serde(default)]
    events: Vec<ApiMatchEvent>,
    latest_event_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiMatchInfo {
    id: ExternalId,
    name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiMatchEvent {
    id: i64,
    #[serde(default)]
    game: Option<ApiGame>,
}

#[derive(Debug, Deserialize)]
struct ApiGame {
    id: ExternalId,
    beatmap_id: ExternalId,
    mode: String,
    scoring_type: String,
    team_type: String,
    #[serde(default)]
    mods: Vec<String>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    scores: Vec<ApiScore>,
}

#[derive(Debug, Deserialize)]
struct ApiScore {
    user_id: ExternalId,
    mode: String,
    score: i64,
    accuracy: f64,
    max_combo: i64,
    #[serde(default)]
    mods: Vec<String>,
    #[serde(default)]
    passed: bool,
    #[serde(default)]
    r#match: Option<ApiScoreSlot>,
}

#[derive(Debug, Deserialize)]
struct ApiScoreSlot {
    slot: Option<i32>,
    team: Option<String>,
}

impl ApiMatchInfo {
    /// Games appear once per event that mentions them; the last mention
    /// is the most complete. Game ids grow with time.
    fn into_match(self, events: Vec<ApiMatchEvent>) -> Attempt<MatchData> {
        let mut games = BTreeMap::new();
        for game in events.into_iter().filter_map(|e| e.game) {
            games.insert(game.id, game);
        }
        let games = games
            .into_values()
            .map(ApiGame::into_game)
            .collect::<Attempt<Vec<_>>>()?;

        Ok(MatchData {
            id: self.id,
            name: self.name,
            start_time: self.start_time,
            end_time: self.end_time,
            games,
        })
    }
}

impl ApiGame {
    fn into_game(self) -> Attempt<GameData> {
        let scores = self
            .scores
            .into_iter()
            .map(|s| {
                let (slot, team) = s.r#match.map_or((None, None), |m| (m.slot, m.team));
                Ok(ScoreData {
                    player_id: s.user_id,
                    ruleset: ruleset(&s.mode, None)?,
                    score: s.score,
                    accuracy: s.accuracy,
                    max_combo: s.max_combo,
                    mods: s.mods,
                    passed: s.passed,
                    slot,
                    team,
                })
            })
            .collect::<Attempt<Vec<_>>>()?;

        Ok(GameData {
            id: self.id,
            beatmap_id: self.beatmap_id,
            ruleset: ruleset(&self.mode, None)?,
            scoring_type: self.scoring_type,
            team_type: self.team_type,
            mods: self.mods,
            start_time: self.start_time,
            end_time: self.end_time,
            scores,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiBeatmap {
    id: ExternalId,
    beatmapset_id: ExternalId,
    mode: String,
    version: String,
    difficulty_rating: f64,
    cs: f64,
    bpm: Option<f64>,
    total_length: i64,
    beatmapset: ApiBeatmapset,
}

#[derive(Debug, Deserialize)]
struct ApiBeatmapset {
    artist: String,
    title: String,
    creator: String,
}

impl TryFrom<ApiBeatmap> for BeatmapData {
    type Error = FetchOutcome;

    fn try_from(b: ApiBeatmap) -> Result<Self, Self::Error> {
        Ok(BeatmapData {
            id: b.id,
            beatmapset_id: b.beatmapset_id,
            artist: b.beatmapset.artist,
            title: b.beatmapset.title,
            difficulty_name: b.version,
            creator: b.beatmapset.creator,
            ruleset: ruleset(&b.mode, Some(b.cs))?,
            star_rating: b.difficulty_rating,
            circle_size: b.cs,
            bpm: b.bpm,
            total_length_secs: b.total_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_maps_to_player() {
        let user: ApiUser = serde_json::from_str(
            r#"{
                "id": 2,
                "username": "peppy",
                "country_code": "AU",
                "playmode": "osu",
                "statistics": {"global_rank": 120000, "country_rank": 3100, "pp": 1200.5}
            }"#,
        )
        .unwrap();
        let player = user.into_player("mania").unwrap();
        assert_eq!(player.default_ruleset, Ruleset::Osu);
        assert_eq!(player.ruleset, Ruleset::ManiaOther);
        assert_eq!(player.global_rank, Some(120000));
    }

    #[test]
    fn match_events_collapse_into_games() {
        let page: ApiMatchPage = serde_json::from_str(
            r#"{
                "match": {"id": 111, "name": "MWC4K: (GER) vs (KOR)", "start_time": "2024-05-01T12:00:00Z", "end_time": null},
                "events": [
                    {"id": 1, "detail": {"type": "match-created"}},
                    {"id": 2, "game": {
                        "id": 900, "beatmap_id": 75, "mode": "mania", "scoring_type": "scorev2",
                        "team_type": "team-vs", "mods": [], "start_time": "2024-05-01T12:05:00Z",
                        "end_time": null, "scores": []
                    }},
                    {"id": 3, "game": {
                        "id": 900, "beatmap_id": 75, "mode": "mania", "scoring_type": "scorev2",
                        "team_type": "team-vs", "mods": ["NF"], "start_time": "2024-05-01T12:05:00Z",
                        "end_time": "2024-05-01T12:09:00Z",
                        "scores": [{
                            "user_id": 7, "mode": "mania", "score": 912345, "accuracy": 0.9712,
                            "max_combo": 1800, "mods": ["NF"], "passed": true,
                            "match": {"slot": 0, "team": "red", "pass": true}
                        }]
                    }}
                ],
                "latest_event_id": 3
            }"#,
        )
        .unwrap();

        let data = page.r#match.into_match(page.events).unwrap();
        assert_eq!(data.games.len(), 1);
        let game = &data.games[0];
        assert_eq!(game.ruleset, Ruleset::ManiaOther);
        assert!(game.end_time.is_some());
        assert_eq!(game.scores[0].team.as_deref(), Some("red"));
        assert_eq!(game.scores[0].slot, Some(0));
    }

    #[test]
    fn beatmap_key_count_comes_from_cs() {
        let beatmap: ApiBeatmap = serde_json::from_str(
            r#"{
                "id": 75, "beatmapset_id": 1, "mode": "mania", "version": "4K Hard",
                "difficulty_rating": 3.4, "cs": 4.0, "bpm": 180.0, "total_length": 142,
                "beatmapset": {"artist": "Kenji Ninuma", "title": "DISCO PRINCE", "creator": "peppy"}
            }"#,
        )
        .unwrap();
        let data = BeatmapData::try_from(beatmap).unwrap();
        assert_eq!(data.ruleset, Ruleset::Mania4k);
        assert_eq!(data.difficulty_name, "4K Hard");
    }

    #[test]
    fn unknown_mode_is_permanent() {
        assert!(matches!(ruleset("lazer", None), Err(FetchOutcome::PermanentError(_))));
    }

    #[test]
    fn pagination_stops_at_latest_event() {
        assert!(!has_more_pages(Some(10), 10));
        assert!(has_more_pages(Some(10), 9));
        assert!(!has_more_pages(None, 1));
    }

    fn match_info() -> ApiMatchInfo {
        ApiMatchInfo {
            id: 111,
            name: "MWC4K: (GER) vs (KOR)".into(),
            start_time: "2024-05-01T12:00:00Z".parse().unwrap(),
            end_time: None,
        }
    }

    /// Events `after + 1 ..= min(after + 100, total)`.
    fn events_page(after: i64, total: i64) -> ApiMatchPage {
        ApiMatchPage {
            r#match: match_info(),
            events: (after + 1..=(after + 100).min(total))
                .map(|id| ApiMatchEvent { id, game: None })
                .collect(),
            latest_event_id: Some(total),
        }
    }

    #[tokio::test]
    async fn long_match_is_read_from_the_first_event() {
        let mut cursors = Vec::new();
        let (info, events) = collect_match_events(None, |after| {
            cursors.push(after);
            std::future::ready(Ok(events_page(after, 250)))
        })
        .await
        .unwrap();

        assert_eq!(info.id, 111);
        assert_eq!(cursors, vec![0, 100, 200]);
        assert_eq!(events.len(), 250);
        assert_eq!(events.first().map(|e| e.id), Some(1));
        assert_eq!(events.last().map(|e| e.id), Some(250));
    }

    #[tokio::test]
    async fn short_match_takes_one_page() {
        let mut calls = 0;
        let (_, events) = collect_match_events(None, |after| {
            calls += 1;
            std::future::ready(Ok(events_page(after, 40)))
        })
        .await
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(events.len(), 40);
    }

    #[tokio::test]
    async fn stalled_cursor_ends_paging() {
        let mut calls = 0;
        let (_, events) = collect_match_events(None, |_| {
            calls += 1;
            // always the same first page of a 300-event match
            std::future::ready(Ok(events_page(0, 300)))
        })
        .await
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(events.len(), 100);
    }

    #[tokio::test]
    async fn failed_follow_up_page_fails_the_fetch() {
        let result = collect_match_events(None, |after| {
            std::future::ready(if after == 0 {
                Ok(events_page(0, 250))
            } else {
                Err(FetchOutcome::TransientError("502 Bad Gateway".into()))
            })
        })
        .await;
        assert!(matches!(result, Err(FetchOutcome::TransientError(_))));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let config = OsuApiConfig {
            base_url: "https://osu.ppy.sh/api/v2".into(),
            token_url: "https://osu.ppy.sh/oauth/token".into(),
            client_id: None,
            client_secret: None,
        };
        assert!(matches!(
            OsuApiClient::new(&config, Duration::from_secs(5)),
            Err(ClientError::Config(_))
        ));
    }
}
