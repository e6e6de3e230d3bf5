use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::ExternalApi;
use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub osu: OsuApiConfig,
    pub osu_track: OsuTrackConfig,
    pub rate_limits: RateLimitConfig,
    pub ingest: IngestSettings,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `OTR_PROFILE`. When set (e.g. `PROD`), every key is
    /// first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("OTR_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            osu: OsuApiConfig::from_env_profiled(p),
            osu_track: OsuTrackConfig::from_env_profiled(p),
            rate_limits: RateLimitConfig::from_env_profiled(p),
            ingest: IngestSettings::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the worker cannot run with. Rate budgets are checked
    /// again when the limiter is built; this catches them before any socket
    /// or pool is opened.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (api, rpm) in &self.rate_limits.requests_per_minute {
            if *rpm <= 0 {
                return Err(CoreError::Config(format!(
                    "requests_per_minute for '{api}' must be > 0, got {rpm}"
                )));
            }
        }
        if self.ingest.reconcile_interval_secs == 0 {
            return Err(CoreError::Config("reconcile interval must be at least 1s".into()));
        }
        if self.ingest.stale_fetch_after_secs <= self.ingest.request_timeout_secs {
            // Otherwise fetches still waiting on their HTTP call get reset.
            return Err(CoreError::Config(format!(
                "stale fetch threshold ({}s) must exceed the request timeout ({}s)",
                self.ingest.stale_fetch_after_secs, self.ingest.request_timeout_secs
            )));
        }
        if self.ingest.backoff_base_ms > self.ingest.backoff_max_ms {
            return Err(CoreError::Config(format!(
                "backoff base ({}ms) exceeds backoff max ({}ms)",
                self.ingest.backoff_base_ms, self.ingest.backoff_max_ms
            )));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!("  osu:         base_url={}, credentials={}", self.osu.base_url, self.osu.is_configured());
        tracing::info!("  osutrack:    base_url={}", self.osu_track.base_url);
        for (api, rpm) in &self.rate_limits.requests_per_minute {
            tracing::info!("  rate limit:  {}={}/min", api, rpm);
        }
        tracing::info!(
            "  ingest:      max_retry_attempts={}, backoff={}..{}ms",
            self.ingest.max_retry_attempts,
            self.ingest.backoff_base_ms,
            self.ingest.backoff_max_ms
        );
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection string; wins over the individual fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "DATABASE_URL"),
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "otr"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some() || self.username.is_some()
    }
}

// ── osu! API v2 ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsuApiConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
}

impl OsuApiConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_or(p, "OSU_API_BASE_URL", "https://osu.ppy.sh/api/v2"),
            token_url: profiled_env_or(p, "OSU_TOKEN_URL", "https://osu.ppy.sh/oauth/token"),
            client_id: profiled_env_opt(p, "OSU_CLIENT_ID"),
            client_secret: profiled_env_opt(p, "OSU_CLIENT_SECRET"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

// ── osu!track ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsuTrackConfig {
    pub base_url: String,
}

impl OsuTrackConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_or(p, "OSUTRACK_API_BASE_URL", "https://osutrack-api.ameo.dev"),
        }
    }
}

// ── Rate limits ───────────────────────────────────────────────

/// Per-API request budgets. Signed so that a misconfigured negative value
/// reaches validation instead of silently failing to parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: HashMap<ExternalApi, i64>,
}

impl RateLimitConfig {
    fn from_env_profiled(p: &str) -> Self {
        let mut requests_per_minute = HashMap::new();
        let osu = profiled_env_or(p, "OSU_REQUESTS_PER_MINUTE", "60");
        let osu_track = profiled_env_or(p, "OSUTRACK_REQUESTS_PER_MINUTE", "30");
        requests_per_minute.insert(ExternalApi::Osu, osu.parse().unwrap_or(0));
        requests_per_minute.insert(ExternalApi::OsuTrack, osu_track.parse().unwrap_or(0));
        Self { requests_per_minute }
    }
}

// ── Ingestion behaviour ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    pub max_retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub stale_fetch_after_secs: u64,
}

impl IngestSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_retry_attempts: profiled_env_u32(p, "MAX_RETRY_ATTEMPTS", 3),
            backoff_base_ms: profiled_env_u64(p, "RETRY_BACKOFF_BASE_MS", 1_000),
            backoff_max_ms: profiled_env_u64(p, "RETRY_BACKOFF_MAX_MS", 300_000),
            request_timeout_secs: profiled_env_u64(p, "REQUEST_TIMEOUT_SECS", 30),
            reconcile_interval_secs: profiled_env_u64(p, "RECONCILE_INTERVAL_SECS", 60),
            stale_fetch_after_secs: profiled_env_u64(p, "STALE_FETCH_AFTER_SECS", 600),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn stale_fetch_after(&self) -> Duration {
        Duration::from_secs(self.stale_fetch_after_secs)
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            request_timeout_secs: 30,
            reconcile_interval_secs: 60,
            stale_fetch_after_secs: 600,
        }
    }
}
