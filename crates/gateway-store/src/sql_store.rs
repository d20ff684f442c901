//! [`ProviderStore`] backed by SQLite.
//!
//! Counter updates are single `UPDATE` statements that read the old row
//! values, so concurrent reports never lose increments.

use crate::error::{Result, StoreError};
use crate::pool::{connect, PoolConfig};
use crate::schema::ensure_schema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::{
    ApiKey, GatewayResult, HealthCounters, KeyTraffic, PoolKey, PoolKind, ProviderRecord,
    ProviderSpec, ProviderStore, UNHEALTHY_THRESHOLD,
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

const PROVIDER_COLUMNS: &str = "id, wrapper_name, model_name, type_name, domain_or_url, api_key, \
    no_https, reasoning_budget, total_requests, success_count, failure_count, \
    consecutive_failures, healthy, last_latency_ms, last_request_ok, first_check_completed, \
    last_checked_at, last_error";

const POOL_KEY_COLUMNS: &str = "id, kind, sub_type, api_key, base_url, active, total_requests, \
    success_count, failure_count, consecutive_failures, healthy, last_latency_ms, \
    last_request_ok, first_check_completed, last_checked_at, last_error";

/// Tables carrying health counters
#[derive(Debug, Clone, Copy)]
enum CounterTable {
    Providers,
    PoolKeys,
}

impl CounterTable {
    fn name(self) -> &'static str {
        match self {
            Self::Providers => "providers",
            Self::PoolKeys => "pool_keys",
        }
    }

    fn what(self) -> &'static str {
        match self {
            Self::Providers => "provider",
            Self::PoolKeys => "pool key",
        }
    }
}

fn outcome_sql(table: CounterTable) -> String {
    format!(
        "UPDATE {} SET \
            total_requests = total_requests + 1, \
            success_count = success_count + ?1, \
            failure_count = failure_count + (1 - ?1), \
            consecutive_failures = CASE WHEN ?1 = 1 THEN 0 ELSE consecutive_failures + 1 END, \
            healthy = CASE WHEN ?1 = 1 THEN 1 \
                WHEN consecutive_failures + 1 >= ?2 THEN 0 ELSE healthy END, \
            last_latency_ms = ?3, \
            last_request_ok = ?1 \
         WHERE id = ?4",
        table.name()
    )
}

fn probe_sql(table: CounterTable) -> String {
    format!(
        "UPDATE {} SET \
            total_requests = total_requests + 1, \
            success_count = success_count + ?1, \
            failure_count = failure_count + (1 - ?1), \
            consecutive_failures = CASE WHEN ?1 = 1 THEN 0 ELSE consecutive_failures + 1 END, \
            healthy = CASE WHEN ?1 = 1 THEN 1 \
                WHEN consecutive_failures + 1 >= ?2 THEN 0 ELSE healthy END, \
            last_latency_ms = ?3, \
            last_request_ok = ?1, \
            first_check_completed = 1, \
            last_checked_at = ?5, \
            last_error = CASE WHEN ?1 = 1 THEN NULL ELSE ?6 END \
         WHERE id = ?4",
        table.name()
    )
}

fn counters_from_row(row: &SqliteRow) -> Result<HealthCounters> {
    Ok(HealthCounters {
        total_requests: row.try_get::<i64, _>("total_requests")? as u64,
        success_count: row.try_get::<i64, _>("success_count")? as u64,
        failure_count: row.try_get::<i64, _>("failure_count")? as u64,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        healthy: row.try_get("healthy")?,
        last_latency_ms: row.try_get("last_latency_ms")?,
        last_request_ok: row.try_get("last_request_ok")?,
        first_check_completed: row.try_get("first_check_completed")?,
        last_checked_at: row.try_get::<Option<DateTime<Utc>>, _>("last_checked_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn provider_from_row(row: &SqliteRow) -> Result<ProviderRecord> {
    let spec = ProviderSpec {
        wrapper_name: row.try_get("wrapper_name")?,
        model_name: row.try_get("model_name")?,
        type_name: row.try_get("type_name")?,
        domain_or_url: row.try_get("domain_or_url")?,
        api_key: SecretString::new(row.try_get("api_key")?),
        no_https: row.try_get("no_https")?,
        reasoning_budget: row
            .try_get::<Option<i64>, _>("reasoning_budget")?
            .map(|b| b as u32),
    };
    Ok(ProviderRecord {
        id: row.try_get("id")?,
        spec,
        counters: counters_from_row(row)?,
    })
}

fn pool_kind(value: &str) -> Result<PoolKind> {
    match value {
        "amap" => Ok(PoolKind::Amap),
        "web_search" => Ok(PoolKind::WebSearch),
        other => Err(StoreError::Corrupt(format!("unknown pool kind '{other}'"))),
    }
}

fn pool_key_from_row(row: &SqliteRow) -> Result<PoolKey> {
    let kind: String = row.try_get("kind")?;
    Ok(PoolKey {
        id: row.try_get("id")?,
        kind: pool_kind(&kind)?,
        sub_type: row.try_get("sub_type")?,
        api_key: SecretString::new(row.try_get("api_key")?),
        base_url: row.try_get("base_url")?,
        active: row.try_get("active")?,
        counters: counters_from_row(row)?,
    })
}

/// SQLite store
#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    /// Connect and create the schema
    pub async fn connect(url: &str, config: &PoolConfig) -> Result<Self> {
        let pool = connect(url, config).await?;
        ensure_schema(&pool).await?;
        info!(url = %url, "Store connected");
        Ok(Self { pool })
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", &PoolConfig::default()).await
    }

    /// Underlying pool
    #[must_use]
    pub fn inner(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Traffic recorded for a caller key
    pub async fn key_traffic(&self, key: &str) -> Result<Option<KeyTraffic>> {
        let row = sqlx::query(
            "SELECT input_bytes, output_bytes, success_count, failure_count, traffic_limit \
             FROM api_keys WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(KeyTraffic {
                input_bytes: row.try_get::<i64, _>("input_bytes")? as u64,
                output_bytes: row.try_get::<i64, _>("output_bytes")? as u64,
                success_count: row.try_get::<i64, _>("success_count")? as u64,
                failure_count: row.try_get::<i64, _>("failure_count")? as u64,
                limit: row
                    .try_get::<Option<i64>, _>("traffic_limit")?
                    .map(|l| l as u64),
            })
        })
        .transpose()
    }

    /// Enable or disable a provider
    pub async fn set_provider_active(&self, id: i64, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE providers SET active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { what: "provider", id });
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        table: CounterTable,
        id: i64,
        success: bool,
        latency_ms: i64,
    ) -> Result<()> {
        let result = sqlx::query(&outcome_sql(table))
            .bind(i64::from(success))
            .bind(i64::from(UNHEALTHY_THRESHOLD))
            .bind(latency_ms)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: table.what(),
                id,
            });
        }
        Ok(())
    }

    async fn record_probe(
        &self,
        table: CounterTable,
        id: i64,
        healthy: bool,
        latency_ms: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(&probe_sql(table))
            .bind(i64::from(healthy))
            .bind(i64::from(UNHEALTHY_THRESHOLD))
            .bind(latency_ms)
            .bind(id)
            .bind(Utc::now())
            .bind(error)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: table.what(),
                id,
            });
        }
        Ok(())
    }

    async fn find_provider(&self, spec: &ProviderSpec) -> Result<Option<ProviderRecord>> {
        let sql = format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE wrapper_name = ?1 AND model_name = ?2 \
             AND type_name = ?3 AND domain_or_url = ?4 AND api_key = ?5"
        );
        let row = sqlx::query(&sql)
            .bind(&spec.wrapper_name)
            .bind(&spec.model_name)
            .bind(&spec.type_name)
            .bind(&spec.domain_or_url)
            .bind(spec.api_key.expose_secret())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(provider_from_row).transpose()
    }
}

#[async_trait]
impl ProviderStore for SqlStore {
    async fn active_providers(&self) -> GatewayResult<Vec<ProviderRecord>> {
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE active = 1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        let records = rows
            .iter()
            .map(provider_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn upsert_provider(&self, spec: &ProviderSpec) -> GatewayResult<ProviderRecord> {
        sqlx::query(
            "INSERT INTO providers (wrapper_name, model_name, type_name, domain_or_url, api_key, \
             no_https, reasoning_budget) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (wrapper_name, model_name, type_name, domain_or_url, api_key) DO NOTHING",
        )
        .bind(&spec.wrapper_name)
        .bind(&spec.model_name)
        .bind(&spec.type_name)
        .bind(&spec.domain_or_url)
        .bind(spec.api_key.expose_secret())
        .bind(spec.no_https)
        .bind(spec.reasoning_budget.map(i64::from))
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let record = self
            .find_provider(spec)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("{} vanished after insert", spec.describe())))?;
        debug!(id = record.id, provider = %spec.describe(), "Provider upserted");
        Ok(record)
    }

    async fn provider(&self, id: i64) -> GatewayResult<Option<ProviderRecord>> {
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.as_ref().map(provider_from_row).transpose()?)
    }

    async fn update_provider_stats(
        &self,
        id: i64,
        success: bool,
        latency_ms: i64,
    ) -> GatewayResult<()> {
        Ok(self
            .record_outcome(CounterTable::Providers, id, success, latency_ms)
            .await?)
    }

    async fn update_provider_health(
        &self,
        id: i64,
        healthy: bool,
        latency_ms: i64,
        error: Option<&str>,
    ) -> GatewayResult<()> {
        Ok(self
            .record_probe(CounterTable::Providers, id, healthy, latency_ms, error)
            .await?)
    }

    async fn api_keys(&self) -> GatewayResult<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT key, allowed_models FROM api_keys WHERE active = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key").map_err(StoreError::from)?;
            let models: String = row.try_get("allowed_models").map_err(StoreError::from)?;
            let models: Vec<String> = serde_json::from_str(&models).map_err(StoreError::from)?;
            keys.push(ApiKey::new(key, models));
        }
        Ok(keys)
    }

    async fn upsert_api_key(&self, key: &ApiKey, limit: Option<u64>) -> GatewayResult<()> {
        let mut models: Vec<&String> = key.allowed_models.iter().collect();
        models.sort();
        let models = serde_json::to_string(&models).map_err(StoreError::from)?;
        sqlx::query(
            "INSERT INTO api_keys (key, allowed_models, traffic_limit) VALUES (?1, ?2, ?3) \
             ON CONFLICT (key) DO UPDATE SET allowed_models = excluded.allowed_models, \
             traffic_limit = excluded.traffic_limit, active = 1",
        )
        .bind(&key.key)
        .bind(models)
        .bind(limit.map(|l| l as i64))
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn record_key_traffic(
        &self,
        key: &str,
        input_bytes: u64,
        output_bytes: u64,
        success: bool,
    ) -> GatewayResult<()> {
        let success = i64::from(success);
        sqlx::query(
            "INSERT INTO api_keys (key, input_bytes, output_bytes, success_count, failure_count) \
             VALUES (?1, ?2, ?3, ?4, 1 - ?4) \
             ON CONFLICT (key) DO UPDATE SET \
                input_bytes = input_bytes + excluded.input_bytes, \
                output_bytes = output_bytes + excluded.output_bytes, \
                success_count = success_count + excluded.success_count, \
                failure_count = failure_count + excluded.failure_count",
        )
        .bind(key)
        .bind(input_bytes as i64)
        .bind(output_bytes as i64)
        .bind(success)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn traffic_allowed(&self, key: &str) -> GatewayResult<bool> {
        Ok(self
            .key_traffic(key)
            .await?
            .map_or(true, |t| t.limit.map_or(true, |limit| t.used() < limit)))
    }

    async fn active_pool_keys(
        &self,
        kind: PoolKind,
        sub_type: Option<&str>,
    ) -> GatewayResult<Vec<PoolKey>> {
        let sql = format!(
            "SELECT {POOL_KEY_COLUMNS} FROM pool_keys WHERE kind = ?1 AND active = 1 \
             AND api_key != '' AND (?2 IS NULL OR sub_type = ?2) ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.to_string())
            .bind(sub_type)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        let keys = rows
            .iter()
            .map(pool_key_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(keys)
    }

    async fn pool_key_counts(&self, kind: PoolKind) -> GatewayResult<Vec<(String, usize)>> {
        let rows = sqlx::query(
            "SELECT sub_type, COUNT(*) AS n FROM pool_keys WHERE kind = ?1 AND active = 1 \
             GROUP BY sub_type ORDER BY sub_type",
        )
        .bind(kind.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let sub_type: String = row.try_get("sub_type").map_err(StoreError::from)?;
            let n: i64 = row.try_get("n").map_err(StoreError::from)?;
            counts.push((sub_type, n as usize));
        }
        Ok(counts)
    }

    async fn upsert_pool_key(&self, key: &PoolKey) -> GatewayResult<i64> {
        sqlx::query(
            "INSERT INTO pool_keys (kind, sub_type, api_key, base_url, active) \
             VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT (kind, sub_type, api_key) DO NOTHING",
        )
        .bind(key.kind.to_string())
        .bind(&key.sub_type)
        .bind(key.api_key.expose_secret())
        .bind(&key.base_url)
        .bind(key.active)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM pool_keys WHERE kind = ?1 AND sub_type = ?2 AND api_key = ?3",
        )
        .bind(key.kind.to_string())
        .bind(&key.sub_type)
        .bind(key.api_key.expose_secret())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(id)
    }

    async fn update_pool_key_stats(
        &self,
        id: i64,
        success: bool,
        latency_ms: i64,
    ) -> GatewayResult<()> {
        Ok(self
            .record_outcome(CounterTable::PoolKeys, id, success, latency_ms)
            .await?)
    }

    async fn update_pool_key_health(
        &self,
        id: i64,
        healthy: bool,
        latency_ms: i64,
        error: Option<&str>,
    ) -> GatewayResult<()> {
        Ok(self
            .record_probe(CounterTable::PoolKeys, id, healthy, latency_ms, error)
            .await?)
    }
}
