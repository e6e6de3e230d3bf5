//! ingest-worker: consumes fetch requests and drives them to a terminal
//! status.
//!
//! Consumes:
//! - `data.osu.players`, `data.osu.matches`, `data.osu.beatmaps`
//! - `data.osutrack.players`
//!
//! Publishes:
//! - `processing.checks.tournaments` / `processing.stats.tournaments` on success
//! - the request queue again (delayed) on retryable failures
//! - `<request queue>.dead-letter` when a request is given up
//!
//! Unless `--drain-dead-letters=false`, the dead-letter queues are bound
//! here as well and every letter is logged at `warn`.
//!
//! Only the `zmq` transport is accepted: on the in-memory broker nothing
//! in this process would ever consume the completion queues.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use otr_core::config::{load_dotenv, Config};
use otr_core::EntityKind;
use otr_eisenbahn::{
    EisenbahnConfig, EisenbahnError, Publisher, QueueConsumer, QueueSender, RouteTable,
    TransportKind, Worker, WorkerBuilder, WorkerRunner, ZmqQueueConsumer, ZmqQueueSender,
};
use otr_ingest::{
    dead_letter_keys, report_dead_letter, request_route, ApiFetchClient, EntitySink, FetchStatusStore, IngestionScheduler,
    MemoryEntitySink, MemoryFetchStatusStore, OsuApiClient, OsuTrackClient, PgEntitySink,
    PgFetchStatusStore, RateLimiter, SchedulerSettings, StaleFetchReconciler,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Fetch worker for osu! tournament data.
#[derive(Parser, Debug)]
#[command(name = "ingest-worker", version, about)]
struct Cli {
    /// Path to eisenbahn.toml config file.
    #[arg(long, env = "EISENBAHN_CONFIG", default_value = "config/eisenbahn.toml")]
    config: String,

    /// Shutdown timeout in seconds.
    #[arg(long, env = "INGEST_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,

    /// Bind the dead-letter queues and log what arrives on them.
    #[arg(long, env = "INGEST_DRAIN_DEAD_LETTERS", default_value_t = true, action = clap::ArgAction::Set)]
    drain_dead_letters: bool,
}

// ── IngestWorker ────────────────────────────────────────────────────

/// Owns what outlives single messages: the reconciler task and the
/// publisher that has to be drained on the way out.
struct IngestWorker {
    reconciler: Mutex<Option<StaleFetchReconciler>>,
    reconciler_task: Mutex<Option<JoinHandle<()>>>,
    reconciler_shutdown: Arc<Notify>,
    publisher: Publisher,
}

#[async_trait]
impl Worker for IngestWorker {
    async fn start(&self) -> Result<(), EisenbahnError> {
        if let Some(reconciler) = self.reconciler.lock().await.take() {
            *self.reconciler_task.lock().await = Some(reconciler.spawn(self.reconciler_shutdown.clone()));
        }
        info!("ingest worker started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), EisenbahnError> {
        self.reconciler_shutdown.notify_one();
        if let Some(task) = self.reconciler_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "stale-fetch reconciler ended abnormally");
            }
        }
        self.publisher.close().await?;
        info!("ingest worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "ingest-worker"
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    load_dotenv();
    let config = Config::from_env();
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let bus = EisenbahnConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load eisenbahn config from {}", cli.config))?;
    info!(path = %cli.config, "loaded eisenbahn config");
    if bus.transport.kind != TransportKind::Zmq {
        bail!(
            "transport kind {:?} in {} cannot reach downstream stages; ingest-worker needs kind = \"zmq\"",
            bus.transport.kind,
            cli.config
        );
    }

    let routes = RouteTable::standard();
    let request_keys: Vec<&'static str> = EntityKind::ALL
        .iter()
        .map(|kind| routes.key(request_route(*kind)))
        .collect();
    let drained_keys = if cli.drain_dead_letters {
        dead_letter_keys(&routes)
    } else {
        Vec::new()
    };

    // Consumers bind before anything is published so that requeues and
    // dead letters find this process's own endpoints.
    let mut consumers: Vec<(&'static str, Arc<dyn QueueConsumer>)> = Vec::new();
    for key in request_keys.iter().chain(&drained_keys) {
        let transport = bus.endpoint_for(key, &routes)?;
        let consumer = ZmqQueueConsumer::bind(key, &transport).await?;
        consumers.push((*key, Arc::new(consumer) as Arc<dyn QueueConsumer>));
    }
    let sender: Arc<dyn QueueSender> = Arc::new(ZmqQueueSender::new(&bus.endpoints(&routes)?));
    let publisher = Publisher::new(sender, routes);

    // Status store and sink.
    let (store, sink): (Arc<dyn FetchStatusStore>, Arc<dyn EntitySink>) =
        if config.postgres.is_configured() {
            let store = PgFetchStatusStore::connect(&config.postgres)
                .await
                .context("failed to connect to PostgreSQL")?;
            let sink = PgEntitySink::new(store.pool().clone());
            (
                Arc::new(store) as Arc<dyn FetchStatusStore>,
                Arc::new(sink) as Arc<dyn EntitySink>,
            )
        } else {
            warn!("PostgreSQL not configured, fetch status is kept in memory and lost on exit");
            (
                Arc::new(MemoryFetchStatusStore::new()) as Arc<dyn FetchStatusStore>,
                Arc::new(MemoryEntitySink::new()) as Arc<dyn EntitySink>,
            )
        };

    // Upstream clients.
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limits)?);
    let timeout = config.ingest.request_timeout();
    let osu = OsuApiClient::new(&config.osu, timeout)?.with_limiter(limiter.clone());
    let osu_track = OsuTrackClient::new(&config.osu_track, timeout)?;
    let client = Arc::new(ApiFetchClient::new(Arc::new(osu), Arc::new(osu_track)));

    let scheduler = Arc::new(IngestionScheduler::new(
        store.clone(),
        limiter,
        client,
        sink,
        publisher.clone(),
        SchedulerSettings::from(&config.ingest),
    ));

    let worker = Arc::new(IngestWorker {
        reconciler: Mutex::new(Some(StaleFetchReconciler::from_settings(store, &config.ingest))),
        reconciler_task: Mutex::new(None),
        reconciler_shutdown: Arc::new(Notify::new()),
        publisher,
    });

    let mut builder = WorkerBuilder::new("ingest-worker")
        .shutdown_timeout(Duration::from_secs(cli.shutdown_timeout))
        .on_message(move |message| {
            let scheduler = scheduler.clone();
            let dead_letter = drained_keys.contains(&message.routing_key.as_str());
            async move {
                if dead_letter {
                    report_dead_letter(&message);
                    return Ok(());
                }
                scheduler.handle_message(message).await
            }
        });
    for (key, consumer) in consumers {
        let concurrency = bus.concurrency(key);
        info!(routing_key = %key, concurrency, "consuming");
        builder = builder.consume(consumer, concurrency);
    }

    info!("ingest-worker starting");
    WorkerRunner::run(worker, builder.build(), None).await?;
    info!("ingest-worker exited cleanly");
    Ok(())
}
