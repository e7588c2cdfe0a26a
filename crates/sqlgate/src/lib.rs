//! Credential-scoped SQL access gateway.
//!
//! A caller holding an [`AccessGrant`] asks the [`Gateway`] to list its
//! databases, describe a schema, run a read query or execute a write. Each
//! call resolves the target alias against the grant, checks the statement
//! against the assignment's permission [`Tier`], runs it either directly
//! through a cached sqlx pool or through a remote gateway over HTTP, and
//! leaves exactly one record in the [`AuditTrail`].

pub mod access;
pub mod audit;
pub mod classify;
pub mod config;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod params;
pub mod policy;
pub mod profile;
pub mod remote;
pub mod schema;

pub use access::{AccessGrant, Assignment, GrantStore, GrantedDatabase, InMemoryGrantStore};
pub use audit::{AuditPage, AuditQuery, AuditRecord, AuditStore, AuditTrail, Operation, SqliteAuditStore};
pub use config::{locate_config_file, AuditConfig, ConfigError, GatewayConfig};
pub use dialect::Dialect;
pub use engine::{ConnectionHandle, ConnectionTarget, EngineCache, JsonRow};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewayState, RowsAffected, StatementRequest, Traced};
pub use params::Params;
pub use policy::Tier;
pub use profile::{DatabaseProfile, Mode, Secret};
pub use schema::{ColumnInfo, SchemaDescription};
