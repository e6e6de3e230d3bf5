//! Test doubles and a single-process harness around [`IngestionScheduler`].

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use otr_core::{EntityKey, EntityKind, ExternalId, FetchStatus, Ruleset};
use otr_eisenbahn::{
    Envelope, LocalQueue, MemoryBroker, PublishOptions, Publisher, QueueMessage, RouteTable,
};
use otr_ingest::model::{GameData, MatchData, PlayerData, ScoreData};
use otr_ingest::rate_limit::DEFAULT_WINDOW;
use otr_ingest::{
    request_route, CompletionOutcome, FetchClient, FetchContext, FetchOutcome, FetchRecord,
    FetchRequest, FetchStatusStore, FetchedEntity, IngestionScheduler, MemoryEntitySink,
    MemoryFetchStatusStore, RateLimiter, SchedulerSettings, StoreError,
};

// ── Fetch client ─────────────────────────────────────────────────────

/// Returns scripted outcomes in order, then `fallback` forever.
pub struct ScriptedClient {
    script: Mutex<VecDeque<FetchOutcome>>,
    fallback: FetchOutcome,
    latency: Duration,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(script: Vec<FetchOutcome>, fallback: FetchOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(outcome: FetchOutcome) -> Self {
        Self::new(Vec::new(), outcome)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchClient for ScriptedClient {
    async fn fetch(&self, _: EntityKind, _: ExternalId, _: Option<&FetchContext>) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

// ── Status stores ────────────────────────────────────────────────────

/// Every operation fails as if the database were down.
pub struct UnavailableStore;

fn unavailable() -> StoreError {
    StoreError::Unavailable("connection refused".into())
}

#[async_trait]
impl FetchStatusStore for UnavailableStore {
    async fn get_status(&self, _: EntityKind, _: ExternalId) -> Result<FetchStatus, StoreError> {
        Err(unavailable())
    }
    async fn get_record(&self, _: EntityKind, _: ExternalId) -> Result<FetchRecord, StoreError> {
        Err(unavailable())
    }
    async fn try_begin_fetch(&self, _: EntityKind, _: ExternalId, _: bool) -> Result<bool, StoreError> {
        Err(unavailable())
    }
    async fn complete_fetch(
        &self,
        _: EntityKind,
        _: ExternalId,
        _: CompletionOutcome,
    ) -> Result<FetchRecord, StoreError> {
        Err(unavailable())
    }
    async fn release_fetch(&self, _: EntityKind, _: ExternalId) -> Result<FetchRecord, StoreError> {
        Err(unavailable())
    }
    async fn reset_stale(&self, _: Duration) -> Result<Vec<EntityKey>, StoreError> {
        Err(unavailable())
    }
}

/// Admits normally but loses the connection the first `failures` times a
/// fetch completes.
pub struct CompletionFailsStore {
    pub inner: MemoryFetchStatusStore,
    failures: AtomicUsize,
}

impl CompletionFailsStore {
    pub fn times(failures: usize) -> Self {
        Self {
            inner: MemoryFetchStatusStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }

    pub fn always() -> Self {
        Self::times(usize::MAX)
    }
}

#[async_trait]
impl FetchStatusStore for CompletionFailsStore {
    async fn get_status(&self, kind: EntityKind, id: ExternalId) -> Result<FetchStatus, StoreError> {
        self.inner.get_status(kind, id).await
    }
    async fn get_record(&self, kind: EntityKind, id: ExternalId) -> Result<FetchRecord, StoreError> {
        self.inner.get_record(kind, id).await
    }
    async fn try_begin_fetch(&self, kind: EntityKind, id: ExternalId, force: bool) -> Result<bool, StoreError> {
        self.inner.try_begin_fetch(kind, id, force).await
    }
    async fn complete_fetch(
        &self,
        kind: EntityKind,
        id: ExternalId,
        outcome: CompletionOutcome,
    ) -> Result<FetchRecord, StoreError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(unavailable());
        }
        self.inner.complete_fetch(kind, id, outcome).await
    }
    async fn release_fetch(&self, kind: EntityKind, id: ExternalId) -> Result<FetchRecord, StoreError> {
        self.inner.release_fetch(kind, id).await
    }
    async fn reset_stale(&self, older_than: Duration) -> Result<Vec<EntityKey>, StoreError> {
        self.inner.reset_stale(older_than).await
    }
}

// ── Harness ──────────────────────────────────────────────────────────

pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub publisher: Publisher,
    pub store: Arc<dyn FetchStatusStore>,
    pub sink: Arc<MemoryEntitySink>,
    pub client: Arc<ScriptedClient>,
    pub scheduler: IngestionScheduler,
}

pub fn fast_settings(max_retry_attempts: u32) -> SchedulerSettings {
    SchedulerSettings {
        max_retry_attempts,
        backoff_base: Duration::from_millis(100),
        backoff_max: Duration::from_secs(5),
    }
}

impl Harness {
    pub fn new(client: ScriptedClient) -> Self {
        Self::build(Arc::new(MemoryFetchStatusStore::new()), client, fast_settings(3))
    }

    pub fn build(store: Arc<dyn FetchStatusStore>, client: ScriptedClient, settings: SchedulerSettings) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = Publisher::new(broker.clone(), RouteTable::standard());
        let sink = Arc::new(MemoryEntitySink::new());
        let client = Arc::new(client);
        let limiter = Arc::new(RateLimiter::new(HashMap::new(), DEFAULT_WINDOW).unwrap());
        let scheduler = IngestionScheduler::new(
            store.clone(),
            limiter,
            client.clone(),
            sink.clone(),
            publisher.clone(),
            settings,
        );
        Self {
            broker,
            publisher,
            store,
            sink,
            client,
            scheduler,
        }
    }

    /// Publish a request and return the sent envelope.
    pub async fn request(&self, request: FetchRequest) -> Envelope<FetchRequest> {
        self.publisher
            .publish(request_route(request.kind), request, PublishOptions::new())
            .await
            .unwrap()
    }

    pub fn queue(&self, key: &str) -> Arc<LocalQueue> {
        self.broker.queue(key)
    }

    /// Wait for the next delivery on `key`, delayed ones included.
    pub async fn next(&self, key: &str) -> QueueMessage {
        use otr_eisenbahn::QueueConsumer;
        tokio::time::timeout(Duration::from_secs(600), self.queue(key).recv())
            .await
            .expect("no delivery")
            .unwrap()
            .expect("queue closed")
    }

    pub async fn record(&self, kind: EntityKind, id: ExternalId) -> FetchRecord {
        self.store.get_record(kind, id).await.unwrap()
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

pub fn player(id: ExternalId) -> FetchedEntity {
    FetchedEntity::Player(PlayerData {
        id,
        username: format!("player{id}"),
        country_code: "KR".into(),
        default_ruleset: Ruleset::Osu,
        ruleset: Ruleset::Osu,
        global_rank: Some(1_204),
        country_rank: Some(37),
        pp: Some(9_876.5),
    })
}

/// A match whose API data does not say which mania variant was played.
pub fn mania_match(id: ExternalId) -> FetchedEntity {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    FetchedEntity::Match(MatchData {
        id,
        name: "MWC4K: (GER) vs (KOR)".into(),
        start_time: start,
        end_time: None,
        games: vec![GameData {
            id: id * 10,
            beatmap_id: 75,
            ruleset: Ruleset::ManiaOther,
            scoring_type: "scorev2".into(),
            team_type: "team-vs".into(),
            mods: vec![],
            start_time: start,
            end_time: None,
            scores: vec![ScoreData {
                player_id: 7,
                ruleset: Ruleset::ManiaOther,
                score: 912_345,
                accuracy: 0.9712,
                max_combo: 1_800,
                mods: vec![],
                passed: true,
                slot: Some(0),
                team: Some("red".into()),
            }],
        }],
    })
}
