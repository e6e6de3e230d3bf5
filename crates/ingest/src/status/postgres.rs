use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use otr_core::config::PostgresConfig;
use otr_core::{EntityKey, EntityKind, ExternalId, FetchStatus};

use super::{admitting_statuses, released_status, CompletionOutcome, FetchRecord, FetchStatusStore, STALE_FETCH_ERROR};
use crate::error::StoreError;

const RECORD_COLUMNS: &str =
    "internal_id, entity_kind, external_id, status, last_attempted_at, attempt_count, last_error";

#[derive(Debug, sqlx::FromRow)]
struct FetchRow {
    internal_id: i64,
    entity_kind: String,
    external_id: i64,
    status: String,
    last_attempted_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_error: Option<String>,
}

impl TryFrom<FetchRow> for FetchRecord {
    type Error = StoreError;

    fn try_from(row: FetchRow) -> Result<Self, Self::Error> {
        Ok(FetchRecord {
            kind: EntityKind::from_str(&row.entity_kind)?,
            external_id: row.external_id,
            internal_id: row.internal_id,
            status: FetchStatus::from_str(&row.status)?,
            last_attempted_at: row.last_attempted_at,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            last_error: row.last_error,
        })
    }
}

/// Status store backed by the `fetch_status` table.
///
/// Every transition is a single conditional `UPDATE ... RETURNING`, so the
/// row lock taken by PostgreSQL is the only serialization point.
#[derive(Debug, Clone)]
pub struct PgFetchStatusStore {
    pool: PgPool,
}

impl PgFetchStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, apply migrations and return the store.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!(host = %config.host, database = %config.database, "PostgreSQL connected");

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("fetch_status migrations applied");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_row(&self, key: EntityKey) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO fetch_status (entity_kind, external_id, status)
             VALUES ($1, $2, 'not_fetched')
             ON CONFLICT (entity_kind, external_id) DO NOTHING",
        )
        .bind(key.kind.as_str())
        .bind(key.external_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_row(&self, key: EntityKey) -> Result<Option<FetchRecord>, StoreError> {
        let row = sqlx::query_as::<_, FetchRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM fetch_status
             WHERE entity_kind = $1 AND external_id = $2"
        ))
        .bind(key.kind.as_str())
        .bind(key.external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FetchRecord::try_from).transpose()
    }

    /// Explain why a conditional update matched nothing.
    async fn rejected(&self, key: EntityKey, to: FetchStatus) -> StoreError {
        match self.fetch_row(key).await {
            Ok(Some(record)) => StoreError::InvalidTransition {
                key,
                from: record.status,
                to,
            },
            Ok(None) => StoreError::MissingRecord(key),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl FetchStatusStore for PgFetchStatusStore {
    async fn get_status(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchStatus, StoreError> {
        Ok(self.get_record(kind, external_id).await?.status)
    }

    async fn get_record(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchRecord, StoreError> {
        let key = EntityKey::new(kind, external_id);
        self.ensure_row(key).await?;
        self.fetch_row(key)
            .await?
            .ok_or(StoreError::MissingRecord(key))
    }

    async fn try_begin_fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        force: bool,
    ) -> Result<bool, StoreError> {
        let key = EntityKey::new(kind, external_id);
        self.ensure_row(key).await?;

        let from: Vec<String> = admitting_statuses(force)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let admitted = sqlx::query_scalar::<_, i64>(
            "UPDATE fetch_status
             SET status = 'fetching', last_attempted_at = now()
             WHERE entity_kind = $1 AND external_id = $2 AND status = ANY($3)
             RETURNING internal_id",
        )
        .bind(kind.as_str())
        .bind(external_id)
        .bind(&from)
        .fetch_optional(&self.pool)
        .await?;

        debug!(%key, force, admitted = admitted.is_some(), "try_begin_fetch");
        Ok(admitted.is_some())
    }

    async fn complete_fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        outcome: CompletionOutcome,
    ) -> Result<FetchRecord, StoreError> {
        let key = EntityKey::new(kind, external_id);
        let to = outcome.status();
        let row = sqlx::query_as::<_, FetchRow>(&format!(
            "UPDATE fetch_status
             SET status = $3, attempt_count = attempt_count + 1, last_error = $4
             WHERE entity_kind = $1 AND external_id = $2 AND status = 'fetching'
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(kind.as_str())
        .bind(external_id)
        .bind(to.as_str())
        .bind(outcome.error())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.rejected(key, to).await),
        }
    }

    async fn release_fetch(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchRecord, StoreError> {
        let key = EntityKey::new(kind, external_id);
        let row = sqlx::query_as::<_, FetchRow>(&format!(
            "UPDATE fetch_status
             SET status = CASE WHEN attempt_count = 0 THEN 'not_fetched' ELSE 'error' END
             WHERE entity_kind = $1 AND external_id = $2 AND status = 'fetching'
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let to = match self.fetch_row(key).await? {
                    Some(record) => released_status(record.attempt_count),
                    None => return Err(StoreError::MissingRecord(key)),
                };
                Err(self.rejected(key, to).await)
            }
        }
    }

    async fn reset_stale(&self, older_than: Duration) -> Result<Vec<EntityKey>, StoreError> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query_as::<_, (String, i64)>(
            "UPDATE fetch_status
             SET status = 'error', attempt_count = attempt_count + 1, last_error = $1
             WHERE status = 'fetching'
               AND (last_attempted_at IS NULL OR last_attempted_at <= $2)
             RETURNING entity_kind, external_id",
        )
        .bind(STALE_FETCH_ERROR)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(kind, id)| Ok(EntityKey::new(EntityKind::from_str(&kind)?, id)))
            .collect()
    }
}
