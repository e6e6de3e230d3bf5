//! Recovery of fetches abandoned by a crashed worker.
//!
//! A message whose handler died mid-fetch is redelivered, but its record is
//! stuck in `fetching` and would never be admitted again. The reconciler
//! periodically moves such records to `error`, where the next delivery (or
//! a fresh request) admits them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use otr_core::config::IngestSettings;
use otr_core::EntityKey;

use crate::error::StoreError;
use crate::status::FetchStatusStore;

pub struct StaleFetchReconciler {
    store: Arc<dyn FetchStatusStore>,
    interval: Duration,
    stale_after: Duration,
}

impl StaleFetchReconciler {
    pub fn new(store: Arc<dyn FetchStatusStore>, interval: Duration, stale_after: Duration) -> Self {
        Self {
            store,
            interval,
            stale_after,
        }
    }

    pub fn from_settings(store: Arc<dyn FetchStatusStore>, settings: &IngestSettings) -> Self {
        Self::new(store, settings.reconcile_interval(), settings.stale_fetch_after())
    }

    /// One sweep. Returns the keys that were reset.
    pub async fn run_once(&self) -> Result<Vec<EntityKey>, StoreError> {
        let reset = self.store.reset_stale(self.stale_after).await?;
        for key in &reset {
            warn!(%key, stale_after_secs = self.stale_after.as_secs(), "reset stale fetch");
        }
        Ok(reset)
    }

    /// Sweep every interval until `shutdown` is notified. A zero interval
    /// is refused up front.
    pub async fn run(self, shutdown: Arc<Notify>) {
        if self.interval.is_zero() {
            error!("reconcile interval is zero, stale fetches will not be recovered");
            return;
        }
        info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "stale fetch reconciler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "stale fetch sweep failed");
                    }
                }
            }
        }
        info!("stale fetch reconciler stopped");
    }

    pub fn spawn(self, shutdown: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{MemoryFetchStatusStore, STALE_FETCH_ERROR};
    use otr_core::{EntityKind, FetchStatus};

    #[tokio::test]
    async fn sweep_resets_stuck_fetches() {
        let store = Arc::new(MemoryFetchStatusStore::new());
        store.try_begin_fetch(EntityKind::Beatmap, 75, false).await.unwrap();

        let reconciler = StaleFetchReconciler::new(store.clone(), Duration::from_secs(60), Duration::ZERO);
        let reset = reconciler.run_once().await.unwrap();
        assert_eq!(reset, vec![EntityKey::new(EntityKind::Beatmap, 75)]);

        let record = store.get_record(EntityKind::Beatmap, 75).await.unwrap();
        assert_eq!(record.status, FetchStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some(STALE_FETCH_ERROR));
        // admitted again
        assert!(store.try_begin_fetch(EntityKind::Beatmap, 75, false).await.unwrap());
    }

    #[tokio::test]
    async fn zero_interval_returns_instead_of_panicking() {
        let store = Arc::new(MemoryFetchStatusStore::new());
        let handle = StaleFetchReconciler::new(store, Duration::ZERO, Duration::from_secs(600))
            .spawn(Arc::new(Notify::new()));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reconciler kept running")
            .expect("reconciler panicked");
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryFetchStatusStore::new());
        let shutdown = Arc::new(Notify::new());
        let handle = StaleFetchReconciler::new(store, Duration::from_millis(10), Duration::from_secs(600))
            .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reconciler did not stop")
            .unwrap();
    }
}
