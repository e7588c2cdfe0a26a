//! Per-target connection handles and the cache that shares them.
//!
//! A [`ConnectionHandle`] wraps one lazily connected sqlx pool. The
//! [`EngineCache`] keys handles by [`ConnectionTarget`], the normalized set of
//! fields a driver actually connects with, so profiles that only differ in
//! alias (or in fields the driver ignores) share a handle.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sqlx::{
    database::HasArguments,
    mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow},
    postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow},
    query::Query,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    types::{Decimal, Uuid},
    Column, ColumnIndex, Database, Decode, Encode, Row, Type, TypeInfo, ValueRef,
};
use tracing::{debug, info};

use crate::{
    dialect::Driver,
    error::{GatewayError, GatewayResult},
    params::{bind_named, Params, PlaceholderStyle},
    profile::{DatabaseProfile, Endpoint, Secret},
};

/// One result row keyed by column name.
pub type JsonRow = Map<String, Value>;

const MAX_CONNECTIONS: u32 = 8;
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;
const SQLITE_MEMORY: &str = ":memory:";

/// Normalized connection key derived from a profile.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ConnectionTarget {
    Network {
        driver: Driver,
        host: String,
        port: u16,
        user: String,
        password: Option<Secret>,
        database: Option<String>,
    },
    File {
        path: String,
    },
}

impl ConnectionTarget {
    pub fn from_profile(profile: &DatabaseProfile) -> GatewayResult<Self> {
        let settings = match &profile.endpoint {
            Endpoint::Direct(settings) => settings,
            Endpoint::Proxied(_) => {
                return Err(GatewayError::UnsupportedDialect(format!(
                    "profile '{}' is proxied and has no direct connection",
                    profile.alias
                )))
            }
        };
        let dialect = settings.dialect;
        let driver = dialect
            .driver()
            .ok_or_else(|| GatewayError::UnsupportedDialect(dialect.to_string()))?;
        profile.validate()?;

        match driver {
            Driver::Sqlite => Ok(ConnectionTarget::File {
                path: settings
                    .database
                    .clone()
                    .unwrap_or_else(|| SQLITE_MEMORY.to_string()),
            }),
            Driver::Postgres | Driver::MySql => {
                let missing = |field: &str| {
                    GatewayError::validation(format!(
                        "profile '{}' is missing '{field}'",
                        profile.alias
                    ))
                };
                Ok(ConnectionTarget::Network {
                    driver,
                    host: settings.host.clone().ok_or_else(|| missing("host"))?,
                    port: settings
                        .port
                        .or(dialect.default_port())
                        .ok_or_else(|| missing("port"))?,
                    user: settings.user.clone().ok_or_else(|| missing("user"))?,
                    password: settings.password.clone(),
                    database: settings.database.clone(),
                })
            }
        }
    }

    pub fn driver(&self) -> Driver {
        match self {
            ConnectionTarget::Network { driver, .. } => *driver,
            ConnectionTarget::File { .. } => Driver::Sqlite,
        }
    }
}

/// Renders the target as a URL without its password.
impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Network {
                driver,
                host,
                port,
                user,
                database,
                ..
            } => write!(
                f,
                "{}://{}@{}:{}/{}",
                driver.scheme(),
                user,
                host,
                port,
                database.as_deref().unwrap_or("")
            ),
            ConnectionTarget::File { path } => write!(f, "sqlite://{path}"),
        }
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionTarget({self})")
    }
}

#[derive(Debug, Clone)]
enum BackendPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

/// Execution capability for one connection target. Cheap to share; the
/// underlying pool handles concurrent callers.
#[derive(Debug)]
pub struct ConnectionHandle {
    target: ConnectionTarget,
    pool: BackendPool,
}

impl ConnectionHandle {
    /// Builds the pool without connecting; the first statement connects.
    /// Must be called from within a Tokio runtime.
    pub fn open(target: ConnectionTarget) -> GatewayResult<Self> {
        let pool = match &target {
            ConnectionTarget::Network {
                driver: Driver::Postgres,
                host,
                port,
                user,
                password,
                database,
            } => {
                let mut options = PgConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .username(user);
                if let Some(password) = password {
                    options = options.password(password.expose());
                }
                if let Some(database) = database {
                    options = options.database(database);
                }
                BackendPool::Postgres(
                    PgPoolOptions::new()
                        .max_connections(MAX_CONNECTIONS)
                        .connect_lazy_with(options),
                )
            }
            ConnectionTarget::Network {
                driver: Driver::MySql,
                host,
                port,
                user,
                password,
                database,
            } => {
                let mut options = MySqlConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .username(user);
                if let Some(password) = password {
                    options = options.password(password.expose());
                }
                if let Some(database) = database {
                    options = options.database(database);
                }
                BackendPool::MySql(
                    MySqlPoolOptions::new()
                        .max_connections(MAX_CONNECTIONS)
                        .connect_lazy_with(options),
                )
            }
            ConnectionTarget::Network {
                driver: Driver::Sqlite,
                ..
            } => {
                return Err(GatewayError::Internal(
                    "sqlite targets are addressed by file path".into(),
                ))
            }
            ConnectionTarget::File { path } if path == SQLITE_MEMORY => {
                let options = SqliteConnectOptions::from_str("sqlite::memory:")
                    .map_err(GatewayError::connection)?;
                // Every connection to `:memory:` is a separate database, so
                // keep exactly one alive for the lifetime of the handle.
                BackendPool::Sqlite(
                    SqlitePoolOptions::new()
                        .max_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                        .connect_lazy_with(options),
                )
            }
            ConnectionTarget::File { path } => {
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));
                BackendPool::Sqlite(
                    SqlitePoolOptions::new()
                        .max_connections(MAX_CONNECTIONS)
                        .connect_lazy_with(options),
                )
            }
        };

        Ok(Self { target, pool })
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Runs a statement and returns its rows.
    pub async fn fetch_rows(&self, sql: &str, params: &Params) -> GatewayResult<Vec<JsonRow>> {
        debug!(target = %self.target, "fetching rows");
        match &self.pool {
            BackendPool::Postgres(pool) => {
                let bound = bind_named(sql, params, PlaceholderStyle::Numbered)?;
                let mut query = sqlx::query(&bound.sql);
                for value in &bound.values {
                    query = bind_json(query, value);
                }
                let rows = query.fetch_all(pool).await.map_err(GatewayError::connection)?;
                Ok(rows.iter().map(|row| row_to_json(row, pg_value)).collect())
            }
            BackendPool::MySql(pool) => {
                let bound = bind_named(sql, params, PlaceholderStyle::QuestionMark)?;
                let mut query = sqlx::query(&bound.sql);
                for value in &bound.values {
                    query = bind_json(query, value);
                }
                let rows = query.fetch_all(pool).await.map_err(GatewayError::connection)?;
                Ok(rows.iter().map(|row| row_to_json(row, mysql_value)).collect())
            }
            BackendPool::Sqlite(pool) => {
                let bound = bind_named(sql, params, PlaceholderStyle::QuestionMark)?;
                let mut query = sqlx::query(&bound.sql);
                for value in &bound.values {
                    query = bind_json(query, value);
                }
                let rows = query.fetch_all(pool).await.map_err(GatewayError::connection)?;
                Ok(rows.iter().map(|row| row_to_json(row, sqlite_value)).collect())
            }
        }
    }

    /// Runs a statement inside a transaction and returns the affected rows.
    pub async fn execute(&self, sql: &str, params: &Params) -> GatewayResult<u64> {
        debug!(target = %self.target, "executing statement");
        let affected = match &self.pool {
            BackendPool::Postgres(pool) => {
                let bound = bind_named(sql, params, PlaceholderStyle::Numbered)?;
                let mut query = sqlx::query(&bound.sql);
                for value in &bound.values {
                    query = bind_json(query, value);
                }
                let mut tx = pool.begin().await.map_err(GatewayError::connection)?;
                let result = query.execute(&mut *tx).await.map_err(GatewayError::connection)?;
                tx.commit().await.map_err(GatewayError::connection)?;
                result.rows_affected()
            }
            BackendPool::MySql(pool) => {
                let bound = bind_named(sql, params, PlaceholderStyle::QuestionMark)?;
                let mut query = sqlx::query(&bound.sql);
                for value in &bound.values {
                    query = bind_json(query, value);
                }
                let mut tx = pool.begin().await.map_err(GatewayError::connection)?;
                let result = query.execute(&mut *tx).await.map_err(GatewayError::connection)?;
                tx.commit().await.map_err(GatewayError::connection)?;
                result.rows_affected()
            }
            BackendPool::Sqlite(pool) => {
                let bound = bind_named(sql, params, PlaceholderStyle::QuestionMark)?;
                let mut query = sqlx::query(&bound.sql);
                for value in &bound.values {
                    query = bind_json(query, value);
                }
                let mut tx = pool.begin().await.map_err(GatewayError::connection)?;
                let result = query.execute(&mut *tx).await.map_err(GatewayError::connection)?;
                tx.commit().await.map_err(GatewayError::connection)?;
                result.rows_affected()
            }
        };
        Ok(affected)
    }

    /// Column metadata of one table as reported by the embedded engine
    /// (`name`, `type`, `notnull`, `pk`, ...). Only file targets have it.
    pub async fn table_columns(&self, table: &str) -> GatewayResult<Vec<JsonRow>> {
        match &self.pool {
            BackendPool::Sqlite(pool) => {
                let rows = sqlx::query(
                    "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?) ORDER BY cid",
                )
                .bind(table)
                .fetch_all(pool)
                .await
                .map_err(GatewayError::connection)?;
                Ok(rows.iter().map(|row| row_to_json(row, sqlite_value)).collect())
            }
            _ => Err(GatewayError::UnsupportedDialect(format!(
                "{} targets have no table introspection primitive",
                self.target.driver().scheme()
            ))),
        }
    }
}

/// Process-lifetime cache of connection handles keyed by target.
#[derive(Debug, Default)]
pub struct EngineCache {
    handles: RwLock<HashMap<ConnectionTarget, Arc<ConnectionHandle>>>,
}

impl EngineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared handle for the profile's target, creating it on
    /// first use. Concurrent first use of one target creates one handle.
    pub fn get_handle(&self, profile: &DatabaseProfile) -> GatewayResult<Arc<ConnectionHandle>> {
        let target = ConnectionTarget::from_profile(profile)?;
        if let Some(handle) = self.handles.read().get(&target) {
            return Ok(Arc::clone(handle));
        }

        let mut handles = self.handles.write();
        if let Some(handle) = handles.get(&target) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(ConnectionHandle::open(target.clone())?);
        info!(alias = %profile.alias, target = %target, "created connection handle");
        handles.insert(target, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

fn bind_json<'q, DB>(
    query: Query<'q, DB, <DB as HasArguments<'q>>::Arguments>,
    value: &Value,
) -> Query<'q, DB, <DB as HasArguments<'q>>::Arguments>
where
    DB: Database,
    Option<String>: Encode<'q, DB> + Type<DB>,
    bool: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    f64: Encode<'q, DB> + Type<DB>,
    String: Encode<'q, DB> + Type<DB>,
{
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(int) => query.bind(int),
            None => query.bind(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => query.bind(text.clone()),
        other => query.bind(other.to_string()),
    }
}

fn row_to_json<R, F>(row: &R, decode: F) -> JsonRow
where
    R: Row,
    F: Fn(&R, usize) -> Value,
{
    row.columns()
        .iter()
        .map(|column| (column.name().to_string(), decode(row, column.ordinal())))
        .collect()
}

fn decode_as<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<T, _>(idx).ok()
}

fn is_null<R>(row: &R, idx: usize) -> bool
where
    R: Row,
    usize: ColumnIndex<R>,
{
    row.try_get_raw(idx).map_or(true, |raw| raw.is_null())
}

fn unsupported<R>(row: &R, idx: usize) -> Value
where
    R: Row,
    usize: ColumnIndex<R>,
{
    Value::String(format!("<{}>", row.column(idx).type_info().name()))
}

/// Tries each type in order and maps the first one the column decodes as.
macro_rules! first_decodable {
    ($row:expr, $idx:expr, $($ty:ty => $map:expr),+ $(,)?) => {
        Option::<Value>::None
            $(.or_else(|| decode_as::<_, $ty>($row, $idx).map($map)))+
    };
}

fn pg_value(row: &PgRow, idx: usize) -> Value {
    if is_null(row, idx) {
        return Value::Null;
    }
    first_decodable!(row, idx,
        bool => Value::Bool,
        i16 => Value::from,
        i32 => Value::from,
        i64 => Value::from,
        f32 => |v: f32| Value::from(f64::from(v)),
        f64 => Value::from,
        String => Value::String,
        Decimal => |v: Decimal| Value::String(v.to_string()),
        Uuid => |v: Uuid| Value::String(v.to_string()),
        DateTime<Utc> => |v: DateTime<Utc>| Value::String(v.to_rfc3339()),
        NaiveDateTime => |v: NaiveDateTime| Value::String(v.to_string()),
        NaiveDate => |v: NaiveDate| Value::String(v.to_string()),
        NaiveTime => |v: NaiveTime| Value::String(v.to_string()),
        Value => |v: Value| v,
        Vec<u8> => |v: Vec<u8>| Value::String(STANDARD.encode(v)),
    )
    .unwrap_or_else(|| unsupported(row, idx))
}

fn mysql_value(row: &MySqlRow, idx: usize) -> Value {
    if is_null(row, idx) {
        return Value::Null;
    }
    first_decodable!(row, idx,
        i64 => Value::from,
        u64 => Value::from,
        f64 => Value::from,
        f32 => |v: f32| Value::from(f64::from(v)),
        String => Value::String,
        Decimal => |v: Decimal| Value::String(v.to_string()),
        DateTime<Utc> => |v: DateTime<Utc>| Value::String(v.to_rfc3339()),
        NaiveDateTime => |v: NaiveDateTime| Value::String(v.to_string()),
        NaiveDate => |v: NaiveDate| Value::String(v.to_string()),
        NaiveTime => |v: NaiveTime| Value::String(v.to_string()),
        Value => |v: Value| v,
        Vec<u8> => |v: Vec<u8>| Value::String(STANDARD.encode(v)),
    )
    .unwrap_or_else(|| unsupported(row, idx))
}

fn sqlite_value(row: &SqliteRow, idx: usize) -> Value {
    if is_null(row, idx) {
        return Value::Null;
    }
    first_decodable!(row, idx,
        i64 => Value::from,
        f64 => Value::from,
        String => Value::String,
        bool => Value::Bool,
        Vec<u8> => |v: Vec<u8>| Value::String(STANDARD.encode(v)),
    )
    .unwrap_or_else(|| unsupported(row, idx))
}
