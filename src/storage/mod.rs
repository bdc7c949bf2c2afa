//! SQLite record store
//!
//! Three independent tables:
//! - `markets`: created markets, upserted by address
//! - `daemon_state`: key/value JSON, the typed [`DaemonState`] lives under
//!   a reserved key
//! - `inbound_events`: append-only webhook log with a processed flag
//!
//! Token quantities are stored as decimal TEXT and timestamps as epoch
//! milliseconds.

#[cfg(test)]
mod tests;

use crate::error::{DaemonError, Result};
use crate::types::{
    from_millis, DaemonState, InboundEvent, InboundWebhook, Market, MarketCategory, MarketStatus,
    TokenAmount,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Reserved `daemon_state` key for the typed state object
pub const STATE_KEY: &str = "__daemon_state__";

/// Path that selects an in-memory database
pub const MEMORY_PATH: &str = ":memory:";

/// Inbound events included in an export
const EXPORT_EVENT_LIMIT: u32 = 100;

/// Pool size used by [`Database::connect`]
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS markets (
    address TEXT PRIMARY KEY,
    question TEXT NOT NULL,
    category TEXT NOT NULL,
    category_key TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    creation_signature TEXT,
    initial_liquidity TEXT NOT NULL,
    duration_days INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    outcome TEXT,
    volume TEXT,
    resolved_at INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_markets_status ON markets(status);
CREATE INDEX IF NOT EXISTS idx_markets_category ON markets(category_key);
CREATE INDEX IF NOT EXISTS idx_markets_created ON markets(created_at);

CREATE TABLE IF NOT EXISTS daemon_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS inbound_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    signature TEXT,
    payload TEXT NOT NULL DEFAULT '{}',
    processed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_inbound_events_type ON inbound_events(event_type);
"#;

/// Filter for [`Database::get_all_markets`]
#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    pub status: Option<MarketStatus>,
    /// Matches either the category key or its label
    pub category: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl MarketFilter {
    pub fn with_status(status: MarketStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Partial update for [`Database::update_market`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct MarketUpdate {
    pub question: Option<String>,
    pub category: Option<MarketCategory>,
    pub creation_signature: Option<String>,
    pub duration_days: Option<u32>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: Option<MarketStatus>,
    pub outcome: Option<String>,
    pub volume: Option<TokenAmount>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl MarketUpdate {
    /// Mark a market resolved with the given outcome, now
    pub fn resolve(outcome: impl Into<String>) -> Self {
        Self {
            status: Some(MarketStatus::Resolved),
            outcome: Some(outcome.into()),
            resolved_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// Aggregate counts over the markets table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    pub total: u64,
    pub active: u64,
    pub resolved: u64,
    pub cancelled: u64,
    pub by_category: BTreeMap<String, u64>,
    pub created_last_7_days: u64,
}

/// Volume and resolution metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_markets: u64,
    pub resolved_markets: u64,
    pub total_volume: TokenAmount,
    /// Mean duration of resolved markets
    pub avg_duration_days: Decimal,
    /// resolved / total
    pub resolution_rate: Decimal,
}

/// Filter for [`Database::get_inbound_events`]
#[derive(Debug, Clone, Default)]
pub struct InboundEventFilter {
    pub event_type: Option<String>,
    pub signature: Option<String>,
    pub processed: Option<bool>,
    pub limit: Option<u32>,
}

/// Complete store export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub markets: Vec<Market>,
    #[serde(default)]
    pub state: Option<DaemonState>,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub inbound_events: Vec<InboundEvent>,
}

/// What an import applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub markets: usize,
    pub state_restored: bool,
}

/// SQLite-backed record store
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path`. `":memory:"` keeps it in RAM.
    pub async fn connect(path: &str) -> Result<Self> {
        Self::connect_with(path, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Like [`Database::connect`] with an explicit pool size for file databases
    pub async fn connect_with(path: &str, max_connections: u32) -> Result<Self> {
        let pool = if path == MEMORY_PATH {
            // A single long-lived connection, otherwise every connection
            // would see its own empty in-memory database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await?
        } else {
            let expanded = shellexpand::tilde(path).into_owned();
            if let Some(parent) = Path::new(&expanded).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(&expanded)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_with(options)
                .await?
        };

        let db = Self { pool };
        db.init_schema().await?;
        info!("Record store opened at {}", path);
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Release all connections
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Record store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    // ==================== Markets ====================

    /// Insert or replace by address, then read the stored row back
    pub async fn save_market(&self, market: &Market) -> Result<Market> {
        let end_time = market.effective_end_time()?;
        let metadata = serde_json::to_string(&market.metadata)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO markets (
                address, question, category, category_key, created_at, creation_signature,
                initial_liquidity, duration_days, end_time, status, outcome, volume,
                resolved_at, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&market.address)
        .bind(&market.question)
        .bind(&market.category)
        .bind(&market.category_key)
        .bind(market.created_at.timestamp_millis())
        .bind(&market.creation_signature)
        .bind(market.initial_liquidity.to_string())
        .bind(market.duration_days)
        .bind(end_time.timestamp_millis())
        .bind(market.status.as_str())
        .bind(&market.outcome)
        .bind(market.volume.map(|v| v.to_string()))
        .bind(market.resolved_at.map(|t| t.timestamp_millis()))
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        self.get_market(&market.address).await?.ok_or_else(|| {
            DaemonError::Persistence(format!("market {} missing after write", market.address))
        })
    }

    pub async fn get_market(&self, address: &str) -> Result<Option<Market>> {
        let row = sqlx::query("SELECT * FROM markets WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_market).transpose()
    }

    /// Newest first
    pub async fn get_all_markets(&self, filter: &MarketFilter) -> Result<Vec<Market>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM markets WHERE 1 = 1");

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(category) = &filter.category {
            query
                .push(" AND (category_key = ")
                .push_bind(category.clone())
                .push(" OR category = ")
                .push_bind(category.clone())
                .push(")");
        }
        if let Some(after) = filter.created_after {
            query.push(" AND created_at >= ").push_bind(after.timestamp_millis());
        }
        if let Some(before) = filter.created_before {
            query.push(" AND created_at <= ").push_bind(before.timestamp_millis());
        }

        query.push(" ORDER BY created_at DESC, address ASC");

        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                query.push(" LIMIT ").push_bind(i64::from(limit));
                query.push(" OFFSET ").push_bind(i64::from(offset.unwrap_or(0)));
            }
            (None, Some(offset)) => {
                query.push(" LIMIT -1 OFFSET ").push_bind(i64::from(offset));
            }
            (None, None) => {}
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_market).collect()
    }

    /// Merge the supplied fields. Returns `None` when the market does not exist.
    pub async fn update_market(&self, address: &str, update: MarketUpdate) -> Result<Option<Market>> {
        let Some(mut market) = self.get_market(address).await? else {
            return Ok(None);
        };

        if let Some(question) = update.question {
            market.question = question;
        }
        if let Some(category) = update.category {
            market.category = category.label().to_string();
            market.category_key = category.key().to_string();
        }
        if let Some(signature) = update.creation_signature {
            market.creation_signature = Some(signature);
        }
        if let Some(days) = update.duration_days {
            market.duration_days = days;
            // Recomputed from the new duration unless given explicitly below
            market.end_time = None;
        }
        if let Some(end_time) = update.end_time {
            market.end_time = Some(end_time);
        }
        if let Some(status) = update.status {
            market.status = status;
        }
        if let Some(outcome) = update.outcome {
            market.outcome = Some(outcome);
        }
        if let Some(volume) = update.volume {
            market.volume = Some(volume);
        }
        if let Some(resolved_at) = update.resolved_at {
            market.resolved_at = Some(resolved_at);
        }
        if let Some(metadata) = update.metadata {
            market.metadata = metadata;
        }

        self.save_market(&market).await.map(Some)
    }

    pub async fn delete_market(&self, address: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM markets WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every market. Returns the number of rows deleted.
    pub async fn clear_markets(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM markets").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn get_stats(&self) -> Result<MarketStats> {
        let mut stats = MarketStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM markets GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n = count(&row)?;
            stats.total += n;
            match MarketStatus::from_str(&status) {
                Ok(MarketStatus::Active) => stats.active += n,
                Ok(MarketStatus::Resolved) => stats.resolved += n,
                Ok(MarketStatus::Cancelled) => stats.cancelled += n,
                Err(_) => debug!("Ignoring unknown status '{}' in stats", status),
            }
        }

        let rows = sqlx::query("SELECT category_key, COUNT(*) AS n FROM markets GROUP BY category_key")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let key: String = row.try_get("category_key")?;
            stats.by_category.insert(key, count(&row)?);
        }

        let cutoff = Utc::now() - Duration::days(7);
        let row = sqlx::query("SELECT COUNT(*) AS n FROM markets WHERE created_at >= ?")
            .bind(cutoff.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
        stats.created_last_7_days = count(&row)?;

        Ok(stats)
    }

    pub async fn get_performance_metrics(&self) -> Result<PerformanceMetrics> {
        let rows = sqlx::query("SELECT status, duration_days, volume FROM markets")
            .fetch_all(&self.pool)
            .await?;

        let mut metrics = PerformanceMetrics::default();
        let mut resolved_days: u64 = 0;

        for row in &rows {
            metrics.total_markets += 1;

            let volume: Option<String> = row.try_get("volume")?;
            if let Some(volume) = volume {
                metrics.total_volume = metrics.total_volume.try_add(volume.parse()?)?;
            }

            let status: String = row.try_get("status")?;
            if status == MarketStatus::Resolved.as_str() {
                let days: u32 = row.try_get("duration_days")?;
                metrics.resolved_markets += 1;
                resolved_days += u64::from(days);
            }
        }

        if metrics.resolved_markets > 0 {
            metrics.avg_duration_days = (Decimal::from(resolved_days)
                / Decimal::from(metrics.resolved_markets))
            .round_dp(4);
        }
        if metrics.total_markets > 0 {
            metrics.resolution_rate = (Decimal::from(metrics.resolved_markets)
                / Decimal::from(metrics.total_markets))
            .round_dp(4);
        }

        Ok(metrics)
    }

    // ==================== Daemon state ====================

    pub async fn save_state(&self, state: &DaemonState) -> Result<()> {
        self.set_value(STATE_KEY, &serde_json::to_value(state)?).await
    }

    pub async fn get_state(&self) -> Result<Option<DaemonState>> {
        match self.get_value(STATE_KEY).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Plain key/value write on the state table
    pub async fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO daemon_state (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(serde_json::to_string(value)?)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value FROM daemon_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_value(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM daemon_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All plain key/values, excluding the typed state object
    pub async fn get_values(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let rows = sqlx::query("SELECT key, value FROM daemon_state WHERE key != ? ORDER BY key")
            .bind(STATE_KEY)
            .fetch_all(&self.pool)
            .await?;

        let mut values = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let raw: String = row.try_get("value")?;
            values.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(values)
    }

    // ==================== Inbound events ====================

    pub async fn save_inbound_event(&self, event: &InboundWebhook) -> Result<InboundEvent> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO inbound_events (event_type, signature, payload, processed, created_at) VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&event.event_type)
        .bind(&event.signature)
        .bind(serde_json::to_string(&event.payload)?)
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(InboundEvent {
            id: result.last_insert_rowid(),
            event_type: event.event_type.clone(),
            signature: event.signature.clone(),
            payload: event.payload.clone(),
            processed: false,
            created_at: from_millis(created_at.timestamp_millis()),
        })
    }

    pub async fn get_inbound_event(&self, id: i64) -> Result<Option<InboundEvent>> {
        let row = sqlx::query("SELECT * FROM inbound_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_inbound_event).transpose()
    }

    /// Newest first
    pub async fn get_inbound_events(&self, filter: &InboundEventFilter) -> Result<Vec<InboundEvent>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM inbound_events WHERE 1 = 1");

        if let Some(event_type) = &filter.event_type {
            query.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(signature) = &filter.signature {
            query.push(" AND signature = ").push_bind(signature.clone());
        }
        if let Some(processed) = filter.processed {
            query.push(" AND processed = ").push_bind(i64::from(processed));
        }
        query.push(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_inbound_event).collect()
    }

    /// Flip `processed` to true. Returns `false` if already processed or unknown.
    pub async fn mark_processed(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE inbound_events SET processed = 1 WHERE id = ? AND processed = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ==================== Export / import ====================

    pub async fn export(&self) -> Result<StoreSnapshot> {
        Ok(StoreSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            markets: self.get_all_markets(&MarketFilter::default()).await?,
            state: self.get_state().await?,
            values: self.get_values().await?,
            inbound_events: self
                .get_inbound_events(&InboundEventFilter {
                    limit: Some(EXPORT_EVENT_LIMIT),
                    ..Default::default()
                })
                .await?,
        })
    }

    pub async fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export().await?)?)
    }

    /// Re-apply an exported snapshot.
    ///
    /// Markets go through [`Database::save_market`], so importing the same
    /// snapshot twice is harmless. Daemon state is only taken over when it
    /// is ahead of what is stored; inbound events are not replayed.
    pub async fn import_json(&self, json: &str) -> Result<ImportSummary> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        let mut summary = ImportSummary::default();

        for market in &snapshot.markets {
            self.save_market(market).await?;
            summary.markets += 1;
        }

        for (key, value) in &snapshot.values {
            self.set_value(key, value).await?;
        }

        if let Some(imported) = &snapshot.state {
            let current = self.get_state().await?.map(|s| s.iteration_count).unwrap_or(0);
            if imported.iteration_count > current {
                self.save_state(imported).await?;
                summary.state_restored = true;
            }
        }

        info!(
            "Imported {} markets (state restored: {})",
            summary.markets, summary.state_restored
        );
        Ok(summary)
    }
}

fn count(row: &SqliteRow) -> Result<u64> {
    let n: i64 = row.try_get("n")?;
    Ok(u64::try_from(n).unwrap_or(0))
}

fn row_to_market(row: &SqliteRow) -> Result<Market> {
    let initial_liquidity: String = row.try_get("initial_liquidity")?;
    let volume: Option<String> = row.try_get("volume")?;
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata")?;
    let resolved_at: Option<i64> = row.try_get("resolved_at")?;

    Ok(Market {
        address: row.try_get("address")?,
        question: row.try_get("question")?,
        category: row.try_get("category")?,
        category_key: row.try_get("category_key")?,
        created_at: from_millis(row.try_get("created_at")?),
        creation_signature: row.try_get("creation_signature")?,
        initial_liquidity: initial_liquidity.parse()?,
        duration_days: row.try_get("duration_days")?,
        end_time: Some(from_millis(row.try_get("end_time")?)),
        status: status.parse()?,
        outcome: row.try_get("outcome")?,
        volume: volume.map(|v| v.parse()).transpose()?,
        resolved_at: resolved_at.map(from_millis),
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn row_to_inbound_event(row: &SqliteRow) -> Result<InboundEvent> {
    let payload: String = row.try_get("payload")?;
    let processed: i64 = row.try_get("processed")?;

    Ok(InboundEvent {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        signature: row.try_get("signature")?,
        payload: serde_json::from_str(&payload)?,
        processed: processed != 0,
        created_at: from_millis(row.try_get("created_at")?),
    })
}
