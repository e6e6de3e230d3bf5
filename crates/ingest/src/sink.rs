//! Where successfully fetched entities are persisted before completion is
//! announced downstream.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;

use otr_core::{EntityKey, EntityKind, ExternalId};

use crate::error::StoreError;
use crate::model::FetchedEntity;

#[async_trait]
pub trait EntitySink: Send + Sync {
    /// Store the latest data for an entity, replacing earlier data.
    async fn persist(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        entity: &FetchedEntity,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryEntitySink {
    entities: Mutex<HashMap<EntityKey, FetchedEntity>>,
}

impl MemoryEntitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind, external_id: ExternalId) -> Option<FetchedEntity> {
        self.entities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&EntityKey::new(kind, external_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntitySink for MemoryEntitySink {
    async fn persist(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        entity: &FetchedEntity,
    ) -> Result<(), StoreError> {
        self.entities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(EntityKey::new(kind, external_id), entity.clone());
        Ok(())
    }
}

/// Upserts payloads into `fetched_entities` as JSONB.
#[derive(Debug, Clone)]
pub struct PgEntitySink {
    pool: PgPool,
}

impl PgEntitySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitySink for PgEntitySink {
    async fn persist(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        entity: &FetchedEntity,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO fetched_entities (entity_kind, external_id, payload, fetched_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (entity_kind, external_id)
             DO UPDATE SET payload = EXCLUDED.payload, fetched_at = EXCLUDED.fetched_at",
        )
        .bind(kind.as_str())
        .bind(external_id)
        .bind(Json(entity))
        .execute(&self.pool)
        .await?;
        debug!(%kind, external_id, "entity persisted");
        Ok(())
    }
}
