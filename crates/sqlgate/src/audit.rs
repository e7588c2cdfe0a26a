//! Append-only audit trail with lazy retention pruning.
//!
//! Every gateway call attempt produces one [`AuditRecord`]. Persisting it is
//! best effort: a failing store is logged and never turns a successful call
//! into a failed one. Records older than the retention window are deleted at
//! most once per UTC day, piggybacking on the first write of the day.

use std::{fmt, path::Path, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    QueryBuilder, Sqlite,
};
use tracing::{debug, info, warn};

use crate::{
    config::AuditConfig,
    error::{GatewayError, GatewayResult},
    policy::Tier,
};

type HmacSha256 = Hmac<Sha256>;

/// Caller filter that selects records written without a caller name.
pub const UNNAMED_CALLER: &str = "__unnamed";

const MAX_PER_PAGE: u32 = 500;
const DEFAULT_PER_PAGE: u32 = 20;
const AUDIT_DB_FILE: &str = "audit.db";
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Databases,
    Schema,
    Query,
    Execute,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Databases => "databases",
            Operation::Schema => "schema",
            Operation::Query => "query",
            Operation::Execute => "execute",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "databases" => Ok(Operation::Databases),
            "schema" => Ok(Operation::Schema),
            "query" => Ok(Operation::Query),
            "execute" => Ok(Operation::Execute),
            other => Err(anyhow!("unknown audit operation: {other}")),
        }
    }
}

/// One call attempt as kept in the trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub recorded_at: DateTime<Utc>,
    pub trace_id: String,
    pub caller_name: Option<String>,
    pub tier: Tier,
    /// `None` when alias resolution failed.
    pub alias: Option<String>,
    pub operation: Operation,
    pub sql: Option<String>,
    pub params: Value,
    pub rows_affected: Option<i64>,
    /// Error class of a failed attempt. Backend details are never kept.
    pub error_kind: Option<String>,
    pub signature: Option<String>,
}

impl AuditRecord {
    pub fn new(operation: Operation, trace_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            recorded_at: Utc::now(),
            trace_id: trace_id.into(),
            caller_name: None,
            tier,
            alias: None,
            operation,
            sql: None,
            params: Value::Object(Default::default()),
            rows_affected: None,
            error_kind: None,
            signature: None,
        }
    }

    fn signing_payload(&self) -> Result<Vec<u8>> {
        let payload = json!({
            "recorded_at": format_timestamp(&self.recorded_at),
            "trace_id": self.trace_id,
            "caller_name": self.caller_name,
            "tier": self.tier,
            "alias": self.alias,
            "operation": self.operation,
            "sql": self.sql,
            "params": self.params,
            "rows_affected": self.rows_affected,
            "error_kind": self.error_kind,
        });
        serde_json::to_vec(&payload).context("serializing audit record for signing")
    }

    fn mac(&self, key: &[u8]) -> Result<HmacSha256> {
        if key.is_empty() {
            return Err(anyhow!("configured audit HMAC key is empty"));
        }
        let mut mac = HmacSha256::new_from_slice(key).context("initializing HMAC for audit trail")?;
        mac.update(&self.signing_payload()?);
        Ok(mac)
    }

    /// Computes the HMAC-SHA256 signature over every field but `signature`.
    pub fn sign(&self, key: &[u8]) -> Result<String> {
        Ok(STANDARD_NO_PAD.encode(self.mac(key)?.finalize().into_bytes()))
    }

    /// Checks the stored signature in constant time.
    pub fn verify(&self, key: &[u8]) -> bool {
        let Some(stored) = self.signature.as_deref() else {
            return false;
        };
        let Ok(expected) = STANDARD_NO_PAD.decode(stored) else {
            return false;
        };
        self.mac(key)
            .map(|mac| mac.verify_slice(&expected).is_ok())
            .unwrap_or(false)
    }
}

/// Fixed-width UTC timestamp, so lexical order equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("parsing audit timestamp {raw}"))
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Filters for browsing the trail. Dates are whole UTC days, both inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    pub alias: Option<String>,
    pub caller: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub page: u32,
    pub per_page: u32,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            alias: None,
            caller: None,
            date_from: None,
            date_to: None,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl AuditQuery {
    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.clamp(1, MAX_PER_PAGE)
    }

    fn offset(&self) -> i64 {
        i64::from(self.page() - 1) * i64::from(self.per_page())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditRecord>,
    pub total: u64,
}

/// Persistence backend of the trail.
#[async_trait]
pub trait AuditStore: Send + Sync + fmt::Debug {
    async fn append(&self, record: &AuditRecord) -> Result<()>;
    /// Deletes every record strictly older than `cutoff`; returns the count.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    async fn list(&self, query: &AuditQuery) -> Result<AuditPage>;
}

/// Audit store kept in `<log_dir>/audit.db`.
#[derive(Debug, Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    pub async fn open(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("creating audit directory {}", log_dir.display()))?;
        let path = log_dir.join(AUDIT_DB_FILE);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("opening audit store {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running audit store migrations")?;

        debug!(path = %path.display(), "audit store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    recorded_at: String,
    trace_id: String,
    caller_name: Option<String>,
    tier: String,
    alias: Option<String>,
    operation: String,
    sql_text: Option<String>,
    params: String,
    rows_affected: Option<i64>,
    error_kind: Option<String>,
    signature: Option<String>,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = anyhow::Error;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(Self {
            recorded_at: parse_timestamp(&row.recorded_at)?,
            trace_id: row.trace_id,
            caller_name: row.caller_name,
            tier: row.tier.parse::<Tier>().map_err(|err| anyhow!(err))?,
            alias: row.alias,
            operation: row.operation.parse::<Operation>()?,
            sql: row.sql_text,
            params: serde_json::from_str(&row.params)
                .unwrap_or_else(|_| Value::Object(Default::default())),
            rows_affected: row.rows_affected,
            error_kind: row.error_kind,
            signature: row.signature,
        })
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &AuditQuery) {
    let mut clause = " WHERE ";
    let mut next = |builder: &mut QueryBuilder<'_, Sqlite>| {
        builder.push(clause);
        clause = " AND ";
    };

    if let Some(alias) = non_blank(&query.alias) {
        next(builder);
        builder.push("alias = ").push_bind(alias.to_string());
    }
    match non_blank(&query.caller) {
        Some(UNNAMED_CALLER) => {
            next(builder);
            builder.push("(caller_name IS NULL OR caller_name = '')");
        }
        Some(caller) => {
            next(builder);
            builder.push("caller_name = ").push_bind(caller.to_string());
        }
        None => {}
    }
    if let Some(from) = query.date_from {
        next(builder);
        builder
            .push("recorded_at >= ")
            .push_bind(format_timestamp(&start_of_day(from)));
    }
    if let Some(end) = query.date_to.and_then(|to| to.succ_opt()) {
        next(builder);
        builder
            .push("recorded_at < ")
            .push_bind(format_timestamp(&start_of_day(end)));
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let params =
            serde_json::to_string(&record.params).context("serializing audit parameters")?;
        sqlx::query(
            r#"
            INSERT INTO audit_records (
                recorded_at, trace_id, caller_name, tier, alias, operation,
                sql_text, params, rows_affected, error_kind, signature
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(&record.recorded_at))
        .bind(&record.trace_id)
        .bind(&record.caller_name)
        .bind(record.tier.as_str())
        .bind(&record.alias)
        .bind(record.operation.as_str())
        .bind(&record.sql)
        .bind(params)
        .bind(record.rows_affected)
        .bind(&record.error_kind)
        .bind(&record.signature)
        .execute(&self.pool)
        .await
        .context("inserting audit record")?;
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_records WHERE recorded_at < ?")
            .bind(format_timestamp(&cutoff))
            .execute(&self.pool)
            .await
            .context("pruning audit records")?;
        Ok(result.rows_affected())
    }

    async fn list(&self, query: &AuditQuery) -> Result<AuditPage> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_records");
        push_filters(&mut count, query);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("counting audit records")?;

        let mut select = QueryBuilder::<Sqlite>::new(
            "SELECT recorded_at, trace_id, caller_name, tier, alias, operation, \
             sql_text, params, rows_affected, error_kind, signature FROM audit_records",
        );
        push_filters(&mut select, query);
        select
            .push(" ORDER BY recorded_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(query.per_page()))
            .push(" OFFSET ")
            .push_bind(query.offset());
        let rows: Vec<AuditRow> = select
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .context("listing audit records")?;

        let entries = rows
            .into_iter()
            .map(AuditRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(AuditPage {
            entries,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }
}

/// Audit front used by the gateway. Holds the prune marker so that the
/// once-a-day cleanup is scoped to one gateway state, not to the process.
#[derive(Debug)]
pub struct AuditTrail {
    store: Option<Arc<dyn AuditStore>>,
    retention: chrono::Duration,
    hmac_key: Option<Vec<u8>>,
    last_prune: Mutex<Option<NaiveDate>>,
}

impl AuditTrail {
    pub fn disabled() -> Self {
        Self {
            store: None,
            retention: chrono::Duration::zero(),
            hmac_key: None,
            last_prune: Mutex::new(None),
        }
    }

    pub fn with_store(store: Arc<dyn AuditStore>, retention_days: u32) -> Self {
        Self {
            store: Some(store),
            retention: chrono::Duration::days(i64::from(retention_days)),
            hmac_key: None,
            last_prune: Mutex::new(None),
        }
    }

    pub fn with_hmac_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.hmac_key = key;
        self
    }

    /// Opens the configured store. A disabled configuration opens nothing.
    pub async fn open(config: &AuditConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let store = SqliteAuditStore::open(&config.log_dir).await?;
        info!(
            log_dir = %config.log_dir.display(),
            retention_days = config.retention_days,
            signed = config.hmac_key.is_some(),
            "audit trail enabled"
        );
        Ok(Self::with_store(Arc::new(store), config.retention_days)
            .with_hmac_key(config.hmac_key.clone()))
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Persists the record. Never fails; problems are logged.
    pub async fn record(&self, mut record: AuditRecord) {
        let Some(store) = &self.store else {
            return;
        };

        if let Some(key) = &self.hmac_key {
            match record.sign(key) {
                Ok(signature) => record.signature = Some(signature),
                Err(err) => warn!(error = %err, trace_id = %record.trace_id, "failed to sign audit record"),
            }
        }

        if let Err(err) = store.append(&record).await {
            warn!(
                error = %err,
                trace_id = %record.trace_id,
                operation = %record.operation,
                "failed to persist audit record"
            );
        }

        self.prune_if_due(record.recorded_at).await;
    }

    /// Runs the retention delete unless it already ran on `now`'s UTC day.
    /// Returns whether a prune was attempted.
    pub async fn prune_if_due(&self, now: DateTime<Utc>) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let today = now.date_naive();
        {
            let mut marker = self.last_prune.lock();
            if *marker == Some(today) {
                return false;
            }
            *marker = Some(today);
        }

        let cutoff = now - self.retention;
        match store.prune_before(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, cutoff = %format_timestamp(&cutoff), "pruned audit records"),
            Err(err) => warn!(error = %err, "failed to prune audit records"),
        }
        true
    }

    /// Browses the trail. A disabled trail has no records.
    pub async fn list(&self, query: &AuditQuery) -> GatewayResult<AuditPage> {
        match &self.store {
            Some(store) => store
                .list(query)
                .await
                .map_err(|err| GatewayError::Internal(format!("{err:#}"))),
            None => Ok(AuditPage::default()),
        }
    }
}
