//! End-to-end behaviour of the ingestion scheduler on the in-memory broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use otr_core::{EntityKind, FetchStatus, Ruleset};
use otr_eisenbahn::{DeadLetter, Envelope};
use otr_ingest::{
    Disposition, FetchCompleted, FetchOutcome, FetchRequest, FetchStatusStore, FetchedEntity,
    IngestError,
};

use common::{fast_settings, mania_match, player, CompletionFailsStore, Harness, ScriptedClient, UnavailableStore};

const PLAYERS: &str = "data.osu.players";
const MATCHES: &str = "data.osu.matches";
const MATCHES_DLQ: &str = "data.osu.matches.dead-letter";
const BEATMAPS_DLQ: &str = "data.osu.beatmaps.dead-letter";
const CHECKS: &str = "processing.checks.tournaments";
const STATS: &str = "processing.stats.tournaments";

#[tokio::test]
async fn fetched_player_is_announced_exactly_once() {
    let h = Harness::new(ScriptedClient::always(FetchOutcome::Success(player(4_000))));
    let sent = h.request(FetchRequest::new(EntityKind::Player, 4_000)).await;

    let msg = h.next(PLAYERS).await;
    assert_eq!(h.scheduler.handle(&msg).await.unwrap(), Disposition::Completed);

    let record = h.record(EntityKind::Player, 4_000).await;
    assert_eq!(record.status, FetchStatus::Fetched);
    assert_eq!(record.attempt_count, 1);
    assert!(h.sink.get(EntityKind::Player, 4_000).is_some());

    let checks = h.queue(CHECKS);
    assert_eq!(checks.pending_len(), 1);
    let done: Envelope<FetchCompleted> = h.next(CHECKS).await.decode().unwrap();
    assert_eq!(done.payload.external_id, 4_000);
    assert_eq!(done.payload.tournament_id, None);
    assert_eq!(done.correlation_id(), sent.correlation_id());
    assert_eq!(done.retry_count(), 0);
    assert_eq!(h.queue(STATS).pending_len(), 0);
}

#[tokio::test]
async fn redelivery_after_fetch_is_skipped() {
    let h = Harness::new(ScriptedClient::always(FetchOutcome::Success(player(5))));
    h.request(FetchRequest::new(EntityKind::Player, 5)).await;
    h.request(FetchRequest::new(EntityKind::Player, 5)).await;

    let first = h.next(PLAYERS).await;
    let second = h.next(PLAYERS).await;
    assert_eq!(h.scheduler.handle(&first).await.unwrap(), Disposition::Completed);
    assert_eq!(h.scheduler.handle(&second).await.unwrap(), Disposition::Skipped);
    // same delivery handled again, as after a lost ack
    assert_eq!(h.scheduler.handle(&first).await.unwrap(), Disposition::Skipped);

    assert_eq!(h.client.calls(), 1);
    assert_eq!(h.queue(CHECKS).pending_len(), 1);
}

#[tokio::test]
async fn forced_request_refetches() {
    let h = Harness::new(ScriptedClient::always(FetchOutcome::Success(player(6))));
    h.request(FetchRequest::new(EntityKind::Player, 6)).await;
    h.request(FetchRequest::new(EntityKind::Player, 6).forced()).await;

    for _ in 0..2 {
        let msg = h.next(PLAYERS).await;
        assert_eq!(h.scheduler.handle(&msg).await.unwrap(), Disposition::Completed);
    }
    assert_eq!(h.client.calls(), 2);
    assert_eq!(h.record(EntityKind::Player, 6).await.attempt_count, 2);
}

#[tokio::test]
async fn concurrent_duplicates_fetch_once() {
    let h = Arc::new(Harness::new(
        ScriptedClient::always(FetchOutcome::Success(mania_match(77)))
            .with_latency(Duration::from_millis(50)),
    ));
    for _ in 0..8 {
        h.request(FetchRequest::new(EntityKind::Match, 77)).await;
    }

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let msg = h.next(MATCHES).await;
        let h = h.clone();
        tasks.spawn(async move { h.scheduler.handle(&msg).await.unwrap() });
    }
    let mut completed = 0;
    while let Some(disposition) = tasks.join_next().await {
        match disposition.unwrap() {
            Disposition::Completed => completed += 1,
            Disposition::Skipped => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(completed, 1);
    assert_eq!(h.client.calls(), 1);
    assert_eq!(h.queue(CHECKS).pending_len(), 1);
}

#[tokio::test]
async fn not_found_publishes_nothing() {
    let h = Harness::new(ScriptedClient::always(FetchOutcome::NotFound));
    h.request(FetchRequest::new(EntityKind::Beatmap, 404)).await;

    let msg = h.next("data.osu.beatmaps").await;
    assert_eq!(h.scheduler.handle(&msg).await.unwrap(), Disposition::NotFound);

    let record = h.record(EntityKind::Beatmap, 404).await;
    assert_eq!(record.status, FetchStatus::NotFound);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(h.queue(CHECKS).pending_len(), 0);
    assert_eq!(h.queue(BEATMAPS_DLQ).pending_len(), 0);
    assert!(h.sink.is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_retry_budget() {
    let h = Harness::new(ScriptedClient::always(FetchOutcome::TransientError(
        "503 Service Unavailable".into(),
    )));
    let sent = h.request(FetchRequest::new(EntityKind::Match, 9)).await;

    let mut dispositions = Vec::new();
    let mut retry_counts = Vec::new();
    for _ in 0..3 {
        let msg = h.next(MATCHES).await;
        let env: Envelope<FetchRequest> = msg.decode().unwrap();
        assert_eq!(env.correlation_id(), sent.correlation_id());
        retry_counts.push(env.retry_count());
        dispositions.push(h.scheduler.handle(&msg).await.unwrap());
    }

    assert_eq!(retry_counts, vec![0, 1, 2]);
    assert_eq!(
        dispositions,
        vec![
            Disposition::Requeued { delay: Duration::from_millis(100) },
            Disposition::Requeued { delay: Duration::from_millis(200) },
            Disposition::DeadLettered,
        ]
    );

    let record = h.record(EntityKind::Match, 9).await;
    assert_eq!(record.status, FetchStatus::Error);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.last_error.as_deref(), Some("503 Service Unavailable"));

    assert_eq!(h.queue(MATCHES).pending_len(), 0);
    assert_eq!(h.queue(MATCHES_DLQ).pending_len(), 1);
    let dead: Envelope<DeadLetter<FetchRequest>> = h.next(MATCHES_DLQ).await.decode().unwrap();
    assert_eq!(dead.payload.original.external_id, 9);
    assert_eq!(dead.payload.source, MATCHES);
    assert!(dead.payload.reason.contains("503"));
    assert_eq!(dead.correlation_id(), sent.correlation_id());
}

#[tokio::test(start_paused = true)]
async fn rate_limiting_does_not_consume_retries() {
    let h = Harness::new(ScriptedClient::new(
        vec![
            FetchOutcome::RateLimited { retry_after: Some(Duration::from_secs(30)) },
            FetchOutcome::RateLimited { retry_after: None },
        ],
        FetchOutcome::Success(player(12)),
    ));
    h.request(FetchRequest::new(EntityKind::Player, 12)).await;

    let first = h.next(PLAYERS).await;
    assert_eq!(
        h.scheduler.handle(&first).await.unwrap(),
        Disposition::Requeued { delay: Duration::from_secs(30) }
    );
    let record = h.record(EntityKind::Player, 12).await;
    assert_eq!(record.status, FetchStatus::NotFetched);
    assert_eq!(record.attempt_count, 0);

    let second = h.next(PLAYERS).await;
    assert!(matches!(
        h.scheduler.handle(&second).await.unwrap(),
        Disposition::Requeued { .. }
    ));

    let third = h.next(PLAYERS).await;
    assert_eq!(third.decode::<FetchRequest>().unwrap().retry_count(), 2);
    assert_eq!(h.scheduler.handle(&third).await.unwrap(), Disposition::Completed);

    let record = h.record(EntityKind::Player, 12).await;
    assert_eq!(record.status, FetchStatus::Fetched);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(h.queue("data.osu.players.dead-letter").pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_after_failure_keeps_error_state() {
    let h = Harness::new(ScriptedClient::new(
        vec![
            FetchOutcome::TransientError("timeout".into()),
            FetchOutcome::RateLimited { retry_after: None },
        ],
        FetchOutcome::NotFound,
    ));
    h.request(FetchRequest::new(EntityKind::Beatmap, 31)).await;

    for _ in 0..2 {
        let msg = h.next("data.osu.beatmaps").await;
        h.scheduler.handle(&msg).await.unwrap();
    }
    let record = h.record(EntityKind::Beatmap, 31).await;
    assert_eq!(record.status, FetchStatus::Error);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn permanent_error_is_dead_lettered() {
    let h = Harness::new(ScriptedClient::always(FetchOutcome::PermanentError(
        "undecodable response body".into(),
    )));
    h.request(FetchRequest::new(EntityKind::Match, 3)).await;

    let msg = h.next(MATCHES).await;
    assert_eq!(h.scheduler.handle(&msg).await.unwrap(), Disposition::DeadLettered);

    let record = h.record(EntityKind::Match, 3).await;
    assert_eq!(record.status, FetchStatus::Error);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(h.queue(MATCHES).pending_len(), 0);
    assert_eq!(h.queue(MATCHES_DLQ).pending_len(), 1);
    assert_eq!(h.queue(CHECKS).pending_len(), 0);
}

#[tokio::test]
async fn unavailable_store_leaves_message_unacknowledged() {
    let h = Harness::build(
        Arc::new(UnavailableStore),
        ScriptedClient::always(FetchOutcome::Success(player(1))),
        fast_settings(3),
    );
    h.request(FetchRequest::new(EntityKind::Player, 1)).await;

    let msg = h.next(PLAYERS).await;
    let err = h.scheduler.handle(&msg).await.unwrap_err();
    assert!(matches!(err, IngestError::Store(_)), "{err}");
    assert!(h.scheduler.handle_message(msg).await.is_err());
    assert_eq!(h.client.calls(), 0);
    assert_eq!(h.queue(CHECKS).pending_len(), 0);
}

#[tokio::test]
async fn failed_completion_releases_admission() {
    let h = Harness::build(
        Arc::new(CompletionFailsStore::always()),
        ScriptedClient::always(FetchOutcome::Success(player(2))),
        fast_settings(3),
    );
    h.request(FetchRequest::new(EntityKind::Player, 2)).await;

    let msg = h.next(PLAYERS).await;
    assert!(h.scheduler.handle(&msg).await.is_err());

    // Back to a state a redelivery is admitted from.
    let record = h.record(EntityKind::Player, 2).await;
    assert_eq!(record.status, FetchStatus::NotFetched);
    assert!(h.store.try_begin_fetch(EntityKind::Player, 2, false).await.unwrap());
    // Completion was announced before the status write failed.
    assert_eq!(h.queue(CHECKS).pending_len(), 1);
}

#[tokio::test]
async fn completion_lost_after_publish_is_announced_again() {
    let h = Harness::build(
        Arc::new(CompletionFailsStore::times(1)),
        ScriptedClient::always(FetchOutcome::Success(player(3))),
        fast_settings(3),
    );
    let sent = h.request(FetchRequest::new(EntityKind::Player, 3)).await;

    // Published, then the status write fails: the message is not acked.
    let msg = h.next(PLAYERS).await;
    assert!(h.scheduler.handle_message(msg.clone()).await.is_err());
    assert_eq!(h.queue(CHECKS).pending_len(), 1);

    // The redelivery fetches and announces a second time.
    assert_eq!(h.scheduler.handle(&msg).await.unwrap(), Disposition::Completed);
    assert_eq!(h.client.calls(), 2);
    assert_eq!(h.queue(CHECKS).pending_len(), 2);
    for _ in 0..2 {
        let done: Envelope<FetchCompleted> = h.next(CHECKS).await.decode().unwrap();
        assert_eq!(done.payload.external_id, 3);
        assert_eq!(done.correlation_id(), sent.correlation_id());
    }

    let record = h.record(EntityKind::Player, 3).await;
    assert_eq!(record.status, FetchStatus::Fetched);
    assert_eq!(record.attempt_count, 1, "the lost completion was never recorded");
}

#[tokio::test]
async fn mania_submode_follows_tournament() {
    let h = Harness::new(ScriptedClient::always(FetchOutcome::Success(mania_match(500))));
    h.request(FetchRequest::new(EntityKind::Match, 500).with_context(42, Ruleset::Mania4k))
        .await;

    let msg = h.next(MATCHES).await;
    assert_eq!(h.scheduler.handle(&msg).await.unwrap(), Disposition::Completed);

    let done: Envelope<FetchCompleted> = h.next(CHECKS).await.decode().unwrap();
    assert_eq!(done.payload.tournament_id, Some(42));
    let FetchedEntity::Match(data) = &done.payload.resolved_data else {
        panic!("expected match data");
    };
    assert_eq!(data.games[0].ruleset, Ruleset::Mania4k);
    assert_eq!(data.games[0].scores[0].ruleset, Ruleset::Mania4k);
    assert_eq!(h.sink.get(EntityKind::Match, 500), Some(done.payload.resolved_data.clone()));
}

#[tokio::test]
async fn osutrack_snapshots_go_to_stats() {
    let snapshot = FetchedEntity::OsuTrackSnapshot(otr_ingest::model::OsuTrackSnapshotData {
        player_id: 8,
        ruleset: Ruleset::Osu,
        history: vec![],
    });
    let h = Harness::new(ScriptedClient::always(FetchOutcome::Success(snapshot)));
    h.request(FetchRequest::new(EntityKind::OsuTrackSnapshot, 8)).await;

    let msg = h.next("data.osutrack.players").await;
    assert_eq!(h.scheduler.handle(&msg).await.unwrap(), Disposition::Completed);
    assert_eq!(h.queue(STATS).pending_len(), 1);
    assert_eq!(h.queue(CHECKS).pending_len(), 0);
}

#[tokio::test]
async fn undecodable_message_is_dropped() {
    let h = Harness::new(ScriptedClient::always(FetchOutcome::NotFound));
    h.queue(PLAYERS).push(b"definitely not msgpack".to_vec(), None);

    let msg = h.next(PLAYERS).await;
    assert_eq!(h.scheduler.handle(&msg).await.unwrap(), Disposition::Dropped);
    assert_eq!(h.client.calls(), 0);
}
