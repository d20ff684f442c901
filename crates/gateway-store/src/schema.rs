//! Table definitions.
//!
//! The schema is created idempotently on connect. Health counters share one
//! column layout across `providers` and `pool_keys`.

use crate::error::Result;
use sqlx::SqlitePool;
use tracing::debug;

const PROVIDERS: &str = r"
CREATE TABLE IF NOT EXISTS providers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wrapper_name TEXT NOT NULL,
    model_name TEXT NOT NULL,
    type_name TEXT NOT NULL,
    domain_or_url TEXT NOT NULL DEFAULT '',
    api_key TEXT NOT NULL,
    no_https INTEGER NOT NULL DEFAULT 0,
    reasoning_budget INTEGER,
    active INTEGER NOT NULL DEFAULT 1,
    total_requests INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    healthy INTEGER NOT NULL DEFAULT 1,
    last_latency_ms INTEGER NOT NULL DEFAULT 0,
    last_request_ok INTEGER NOT NULL DEFAULT 0,
    first_check_completed INTEGER NOT NULL DEFAULT 0,
    last_checked_at TEXT,
    last_error TEXT,
    UNIQUE (wrapper_name, model_name, type_name, domain_or_url, api_key)
)";

const API_KEYS: &str = r"
CREATE TABLE IF NOT EXISTS api_keys (
    key TEXT PRIMARY KEY,
    allowed_models TEXT NOT NULL DEFAULT '[]',
    active INTEGER NOT NULL DEFAULT 1,
    input_bytes INTEGER NOT NULL DEFAULT 0,
    output_bytes INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    traffic_limit INTEGER
)";

const POOL_KEYS: &str = r"
CREATE TABLE IF NOT EXISTS pool_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    sub_type TEXT NOT NULL DEFAULT '',
    api_key TEXT NOT NULL,
    base_url TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    total_requests INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    healthy INTEGER NOT NULL DEFAULT 1,
    last_latency_ms INTEGER NOT NULL DEFAULT 0,
    last_request_ok INTEGER NOT NULL DEFAULT 0,
    first_check_completed INTEGER NOT NULL DEFAULT 0,
    last_checked_at TEXT,
    last_error TEXT,
    UNIQUE (kind, sub_type, api_key)
)";

/// Create every table that does not exist yet
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for statement in [PROVIDERS, API_KEYS, POOL_KEYS] {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("Store schema ready");
    Ok(())
}
