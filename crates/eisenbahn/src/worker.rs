//! Worker trait and lifecycle management.
//!
//! Provides the [`Worker`] trait for long-running processes, [`WorkerBuilder`]
//! for fluent configuration, and [`WorkerRunner`], which drives the consumer
//! loops (ack on success, nack on error) and shuts them down gracefully.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::consumer::QueueMessage;
use crate::error::EisenbahnError;
use crate::traits::QueueConsumer;

// ── Worker trait ─────────────────────────────────────────────────────

/// A long-running process that consumes one or more queues.
///
/// Implementors define their startup/shutdown logic. The [`WorkerRunner`]
/// handles the consumer loops and signal handling.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Called once before any message is consumed.
    async fn start(&self) -> Result<(), EisenbahnError>;

    /// Called once after every consumer loop has finished.
    async fn stop(&self) -> Result<(), EisenbahnError>;

    /// Human-readable name for this worker (used in logging).
    fn name(&self) -> &str;
}

// ── Message handler type ─────────────────────────────────────────────

/// Boxed async function that handles one delivered message.
///
/// `Ok` acks the message. `Err` nacks it, making it available for
/// redelivery.
pub type MessageHandler = Arc<
    dyn Fn(QueueMessage) -> Pin<Box<dyn Future<Output = Result<(), EisenbahnError>> + Send>>
        + Send
        + Sync,
>;

/// A queue and how many concurrent loops consume it.
#[derive(Clone)]
pub struct ConsumerBinding {
    pub consumer: Arc<dyn QueueConsumer>,
    pub concurrency: usize,
}

// ── WorkerBuilder ────────────────────────────────────────────────────

/// Fluent builder for configuring a [`WorkerRunner`].
///
/// # Example
/// ```ignore
/// let config = WorkerBuilder::new("ingest-worker")
///     .consume(broker.queue("data.osu.players"), 4)
///     .on_message(|msg| async move {
///         println!("got: {}", msg.routing_key);
///         Ok(())
///     })
///     .build();
/// ```
pub struct WorkerBuilder {
    name: String,
    shutdown_timeout: Duration,
    error_backoff: Duration,
    message_handler: Option<MessageHandler>,
    bindings: Vec<ConsumerBinding>,
}

impl WorkerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shutdown_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            message_handler: None,
            bindings: Vec::new(),
        }
    }

    /// Maximum time to wait for in-flight handlers during shutdown (default: 30s).
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Pause taken by a consumer loop after a handler error (default: 1s).
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EisenbahnError>> + Send + 'static,
    {
        self.message_handler = Some(Arc::new(move |msg| Box::pin(handler(msg))));
        self
    }

    /// Consume `consumer` with `concurrency` parallel loops. Zero is treated as one.
    pub fn consume(mut self, consumer: Arc<dyn QueueConsumer>, concurrency: usize) -> Self {
        self.bindings.push(ConsumerBinding {
            consumer,
            concurrency: concurrency.max(1),
        });
        self
    }

    pub fn build(self) -> WorkerRunnerConfig {
        WorkerRunnerConfig {
            name: self.name,
            shutdown_timeout: self.shutdown_timeout,
            error_backoff: self.error_backoff,
            message_handler: self.message_handler,
            bindings: self.bindings,
        }
    }
}

// ── WorkerRunnerConfig ───────────────────────────────────────────────

/// Configuration produced by [`WorkerBuilder`], consumed by [`WorkerRunner`].
pub struct WorkerRunnerConfig {
    pub name: String,
    pub shutdown_timeout: Duration,
    pub error_backoff: Duration,
    pub message_handler: Option<MessageHandler>,
    pub bindings: Vec<ConsumerBinding>,
}

// ── WorkerRunner ─────────────────────────────────────────────────────

/// Runs a [`Worker`] and its consumer loops until shutdown.
///
/// Shutdown order:
/// 1. consumer loops stop pulling new messages
/// 2. handlers already running finish and ack/nack (bounded by `shutdown_timeout`)
/// 3. `worker.stop()` is called
pub struct WorkerRunner;

impl WorkerRunner {
    /// Run a worker to completion.
    ///
    /// Returns when a shutdown signal arrives, `shutdown_notify` fires, or
    /// every consumed queue has closed.
    pub async fn run(
        worker: Arc<dyn Worker>,
        config: WorkerRunnerConfig,
        shutdown_notify: Option<Arc<Notify>>,
    ) -> Result<(), EisenbahnError> {
        let worker_name = config.name.clone();
        let handler = config.message_handler.clone().ok_or_else(|| {
            EisenbahnError::Config(format!("worker '{worker_name}' has no message handler"))
        })?;

        info!(worker = %worker_name, queues = config.bindings.len(), "starting worker");
        worker.start().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut loops = JoinSet::new();
        for binding in &config.bindings {
            for slot in 0..binding.concurrency {
                loops.spawn(Self::consume_loop(
                    binding.consumer.clone(),
                    handler.clone(),
                    stop_rx.clone(),
                    config.error_backoff,
                    slot,
                ));
            }
        }
        info!(worker = %worker_name, loops = loops.len(), "worker started");

        tokio::select! {
            _ = Self::wait_for_shutdown(shutdown_notify) => {
                info!(worker = %worker_name, "shutdown signal received");
            }
            _ = Self::join_all(&mut loops) => {
                info!(worker = %worker_name, "all queues closed");
            }
        }

        // Stop pulling; loops finish the message they hold.
        let _ = stop_tx.send(true);
        info!(worker = %worker_name, timeout = ?config.shutdown_timeout, "draining in-flight messages");
        if tokio::time::timeout(config.shutdown_timeout, Self::join_all(&mut loops))
            .await
            .is_err()
        {
            warn!(worker = %worker_name, remaining = loops.len(), "drain timed out, aborting consumer loops");
            loops.abort_all();
        }

        match tokio::time::timeout(config.shutdown_timeout, worker.stop()).await {
            Ok(Ok(())) => info!(worker = %worker_name, "worker stopped gracefully"),
            Ok(Err(e)) => warn!(worker = %worker_name, error = %e, "worker stop returned error"),
            Err(_) => warn!(worker = %worker_name, "worker stop timed out, forcing shutdown"),
        }

        info!(worker = %worker_name, "worker shutdown complete");
        Ok(())
    }

    async fn join_all(loops: &mut JoinSet<()>) {
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "consumer loop panicked");
                }
            }
        }
    }

    /// Pull, handle, ack/nack until stopped or the queue closes.
    async fn consume_loop(
        consumer: Arc<dyn QueueConsumer>,
        handler: MessageHandler,
        mut stop: watch::Receiver<bool>,
        error_backoff: Duration,
        slot: usize,
    ) {
        let routing_key = consumer.routing_key().to_string();
        debug!(routing_key = %routing_key, slot, "consumer loop started");

        loop {
            if *stop.borrow() {
                break;
            }
            let received = tokio::select! {
                biased;
                _ = stop.changed() => break,
                received = consumer.recv() => received,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(routing_key = %routing_key, slot, "queue closed");
                    break;
                }
                Err(e) => {
                    warn!(routing_key = %routing_key, error = %e, "receive failed");
                    tokio::time::sleep(error_backoff).await;
                    continue;
                }
            };

            let receipt = message.receipt_handle.clone();
            let delivery_count = message.delivery_count;
            match handler(message).await {
                Ok(()) => {
                    if let Err(e) = consumer.ack(&receipt).await {
                        warn!(routing_key = %routing_key, error = %e, "ack failed");
                    }
                }
                Err(e) => {
                    warn!(
                        routing_key = %routing_key,
                        delivery_count,
                        error = %e,
                        "handler failed, message returned for redelivery"
                    );
                    if let Err(e) = consumer.nack(&receipt).await {
                        warn!(routing_key = %routing_key, error = %e, "nack failed");
                    }
                    tokio::select! {
                        _ = stop.changed() => {}
                        _ = tokio::time::sleep(error_backoff) => {}
                    }
                }
            }
        }
        debug!(routing_key = %routing_key, slot, "consumer loop finished");
    }

    /// Wait for either an OS shutdown signal or a programmatic notification.
    async fn wait_for_shutdown(external: Option<Arc<Notify>>) {
        match external {
            Some(notify) => {
                tokio::select! {
                    _ = Self::os_signal() => {}
                    _ = notify.notified() => {}
                }
            }
            None => Self::os_signal().await,
        }
    }

    /// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
    async fn os_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl_c");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
