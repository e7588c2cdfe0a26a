use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use sqlgate::{
    locate_config_file, AccessGrant, AuditQuery, Gateway, GatewayConfig, InMemoryGrantStore,
    Params, StatementRequest,
};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "sqlgate", version, about = "Credential-scoped SQL access gateway")]
pub struct Cli {
    /// Configuration file (defaults to ./config.yaml, then ./sqlgate/config.yaml).
    #[arg(long, short, env = "SQLGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Caller name recorded in the audit trail.
    #[arg(long, default_value = "cli", global = true)]
    pub caller: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List reachable databases and their permission.
    Databases,
    /// Describe table columns.
    Schema {
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        db: Option<String>,
    },
    /// Run a read-only statement.
    Query(StatementArgs),
    /// Run an INSERT, UPDATE or DELETE.
    Execute(StatementArgs),
    /// Browse the audit trail.
    Audit(AuditArgs),
}

#[derive(Debug, Args)]
pub struct StatementArgs {
    #[arg(long)]
    pub sql: String,
    /// Named parameters as a JSON object, e.g. '{"id": 7}'.
    #[arg(long, value_parser = parse_params)]
    pub params: Option<Params>,
    #[arg(long)]
    pub db: Option<String>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    #[arg(long)]
    pub db: Option<String>,
    /// Caller name filter; `__unnamed` selects records without one.
    #[arg(long = "by")]
    pub by: Option<String>,
    #[arg(long)]
    pub from: Option<NaiveDate>,
    #[arg(long)]
    pub to: Option<NaiveDate>,
    #[arg(long, default_value_t = 1)]
    pub page: u32,
    #[arg(long, default_value_t = 20)]
    pub per_page: u32,
}

fn parse_params(raw: &str) -> Result<Params, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("params must be a JSON object".to_string()),
        Err(err) => Err(format!("invalid params JSON: {err}")),
    }
}

impl StatementArgs {
    fn request(self) -> StatementRequest {
        StatementRequest {
            sql: self.sql,
            params: self.params.unwrap_or_default(),
            alias: self.db,
        }
    }
}

/// Runs one command and returns its JSON output.
pub async fn run(cli: Cli) -> Result<Value> {
    let path = locate_config_file(cli.config.as_deref())?;
    debug!(path = %path.display(), "loading configuration");
    let config = GatewayConfig::load(&path)?;

    let gateway = Gateway::open(&config, Arc::new(InMemoryGrantStore::new()))
        .await
        .context("initializing gateway")?;
    let grant = AccessGrant::from_config(&config, cli.caller);

    let output = match cli.command {
        Command::Databases => serde_json::to_value(gateway.list_databases(&grant).await?)?,
        Command::Schema { table, db } => serde_json::to_value(
            gateway
                .schema(&grant, table.as_deref(), db.as_deref())
                .await?,
        )?,
        Command::Query(args) => {
            serde_json::to_value(gateway.query(&grant, &args.request()).await?)?
        }
        Command::Execute(args) => {
            serde_json::to_value(gateway.execute(&grant, &args.request()).await?)?
        }
        Command::Audit(args) => {
            let query = AuditQuery {
                alias: args.db,
                caller: args.by,
                date_from: args.from,
                date_to: args.to,
                page: args.page,
                per_page: args.per_page,
            };
            serde_json::to_value(gateway.audit_log(&query).await?)?
        }
    };
    Ok(output)
}
