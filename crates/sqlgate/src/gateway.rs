//! Orchestration of one gateway call: resolve, authorize, execute, audit.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    access::{self, AccessGrant, GrantStore, GrantedDatabase},
    audit::{AuditPage, AuditQuery, AuditRecord, AuditTrail, Operation},
    config::GatewayConfig,
    engine::{EngineCache, JsonRow},
    error::{GatewayError, GatewayResult},
    params::Params,
    policy::{authorize_read, authorize_write, Tier},
    profile::{DatabaseProfile, Endpoint},
    remote::RemoteGateway,
    schema::{self, SchemaDescription},
};

/// Shared, long-lived state of a gateway.
#[derive(Debug)]
pub struct GatewayState {
    pub engines: EngineCache,
    pub audit: AuditTrail,
    pub remote: RemoteGateway,
}

impl GatewayState {
    pub fn new(audit: AuditTrail) -> GatewayResult<Self> {
        Ok(Self {
            engines: EngineCache::new(),
            audit,
            remote: RemoteGateway::new()?,
        })
    }
}

/// Result of a call together with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traced<T> {
    pub data: T,
    pub trace_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default, alias = "db_alias")]
    pub alias: Option<String>,
}

impl StatementRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsAffected {
    pub rows_affected: u64,
}

/// Accumulates what is known about a call attempt until it is audited.
struct Attempt {
    trace_id: String,
    operation: Operation,
    caller_name: Option<String>,
    grant_tier: Tier,
    alias: Option<String>,
    tier: Option<Tier>,
    sql: Option<String>,
    params: Value,
}

impl Attempt {
    fn new(operation: Operation, grant: &AccessGrant) -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            operation,
            caller_name: grant.display_name.clone(),
            grant_tier: grant.tier,
            alias: None,
            tier: None,
            sql: None,
            params: Value::Object(Default::default()),
        }
    }

    fn statement(mut self, sql: &str, params: &Params) -> Self {
        self.sql = Some(sql.to_string());
        self.params = Value::Object(params.clone());
        self
    }

    fn resolve<'g>(
        &mut self,
        grant: &'g AccessGrant,
        alias: Option<&str>,
    ) -> GatewayResult<(&'g DatabaseProfile, Tier)> {
        let (profile, tier) = access::resolve(grant, alias)?;
        self.alias = Some(profile.alias.clone());
        self.tier = Some(tier);
        Ok((profile, tier))
    }

    fn into_record(self, outcome: Result<Option<i64>, &'static str>) -> AuditRecord {
        let mut record = AuditRecord::new(
            self.operation,
            self.trace_id,
            self.tier.unwrap_or(self.grant_tier),
        );
        record.caller_name = self.caller_name;
        record.alias = self.alias;
        record.sql = self.sql;
        record.params = self.params;
        match outcome {
            Ok(rows_affected) => record.rows_affected = rows_affected,
            Err(kind) => record.error_kind = Some(kind.to_string()),
        }
        record
    }
}

/// Entry point for all data-plane operations. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    state: Arc<GatewayState>,
    grants: Arc<dyn GrantStore>,
}

impl Gateway {
    pub fn new(state: Arc<GatewayState>, grants: Arc<dyn GrantStore>) -> Self {
        Self { state, grants }
    }

    /// Builds a gateway with the audit policy of `config`.
    pub async fn open(config: &GatewayConfig, grants: Arc<dyn GrantStore>) -> Result<Self> {
        let audit = AuditTrail::open(&config.audit).await?;
        let state = GatewayState::new(audit)?;
        Ok(Self::new(Arc::new(state), grants))
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Looks up the grant behind a bearer token.
    pub async fn authenticate(&self, token: &str) -> GatewayResult<AccessGrant> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GatewayError::UnknownCredential);
        }
        match self
            .grants
            .find_by_token_hash(&access::hash_token(token))
            .await?
        {
            Some(grant) if grant.enabled => Ok(grant),
            _ => Err(GatewayError::UnknownCredential),
        }
    }

    #[instrument(skip_all, fields(operation = "databases"))]
    pub async fn list_databases(
        &self,
        grant: &AccessGrant,
    ) -> GatewayResult<Traced<Vec<GrantedDatabase>>> {
        let attempt = Attempt::new(Operation::Databases, grant);
        let result = if grant.enabled {
            Ok(grant.granted_databases())
        } else {
            Err(GatewayError::UnknownCredential)
        };
        self.conclude(attempt, result, |_| None).await
    }

    #[instrument(skip_all, fields(operation = "schema"))]
    pub async fn schema(
        &self,
        grant: &AccessGrant,
        table: Option<&str>,
        alias: Option<&str>,
    ) -> GatewayResult<Traced<SchemaDescription>> {
        let mut attempt = Attempt::new(Operation::Schema, grant);
        if let Some(table) = table.filter(|t| !t.trim().is_empty()) {
            attempt.params = json!({ "table": table });
        }
        let result = self.run_schema(grant, table, alias, &mut attempt).await;
        self.conclude(attempt, result, |_| None).await
    }

    #[instrument(skip_all, fields(operation = "query"))]
    pub async fn query(
        &self,
        grant: &AccessGrant,
        request: &StatementRequest,
    ) -> GatewayResult<Traced<Vec<JsonRow>>> {
        let mut attempt =
            Attempt::new(Operation::Query, grant).statement(&request.sql, &request.params);
        let result = self.run_query(grant, request, &mut attempt).await;
        self.conclude(attempt, result, |_| None).await
    }

    #[instrument(skip_all, fields(operation = "execute"))]
    pub async fn execute(
        &self,
        grant: &AccessGrant,
        request: &StatementRequest,
    ) -> GatewayResult<Traced<RowsAffected>> {
        let mut attempt =
            Attempt::new(Operation::Execute, grant).statement(&request.sql, &request.params);
        let result = self.run_execute(grant, request, &mut attempt).await;
        self.conclude(attempt, result, |affected| {
            i64::try_from(affected.rows_affected).ok()
        })
        .await
    }

    /// Browses the audit trail of this gateway.
    pub async fn audit_log(&self, query: &AuditQuery) -> GatewayResult<AuditPage> {
        self.state.audit.list(query).await
    }

    async fn run_schema(
        &self,
        grant: &AccessGrant,
        table: Option<&str>,
        alias: Option<&str>,
        attempt: &mut Attempt,
    ) -> GatewayResult<SchemaDescription> {
        let (profile, _tier) = attempt.resolve(grant, alias)?;
        match &profile.endpoint {
            Endpoint::Direct(_) => schema::describe(&self.state.engines, profile, table).await,
            Endpoint::Proxied(remote) => {
                self.state
                    .remote
                    .schema(remote, table.filter(|t| !t.trim().is_empty()), &profile.alias)
                    .await
            }
        }
    }

    async fn run_query(
        &self,
        grant: &AccessGrant,
        request: &StatementRequest,
        attempt: &mut Attempt,
    ) -> GatewayResult<Vec<JsonRow>> {
        let (profile, tier) = attempt.resolve(grant, request.alias.as_deref())?;
        authorize_read(tier, &request.sql)?;
        match &profile.endpoint {
            Endpoint::Direct(_) => {
                let handle = self.state.engines.get_handle(profile)?;
                handle.fetch_rows(&request.sql, &request.params).await
            }
            Endpoint::Proxied(remote) => {
                self.state
                    .remote
                    .query(remote, &request.sql, &request.params, &profile.alias)
                    .await
            }
        }
    }

    async fn run_execute(
        &self,
        grant: &AccessGrant,
        request: &StatementRequest,
        attempt: &mut Attempt,
    ) -> GatewayResult<RowsAffected> {
        let (profile, tier) = attempt.resolve(grant, request.alias.as_deref())?;
        authorize_write(tier, &request.sql)?;
        let rows_affected = match &profile.endpoint {
            Endpoint::Direct(_) => {
                let handle = self.state.engines.get_handle(profile)?;
                handle.execute(&request.sql, &request.params).await?
            }
            Endpoint::Proxied(remote) => {
                self.state
                    .remote
                    .execute(remote, &request.sql, &request.params, &profile.alias)
                    .await?
            }
        };
        Ok(RowsAffected { rows_affected })
    }

    async fn conclude<T>(
        &self,
        attempt: Attempt,
        result: GatewayResult<T>,
        rows_affected: impl FnOnce(&T) -> Option<i64>,
    ) -> GatewayResult<Traced<T>> {
        let trace_id = attempt.trace_id.clone();
        let operation = attempt.operation;
        let outcome = match &result {
            Ok(data) => Ok(rows_affected(data)),
            Err(err) => Err(err.kind()),
        };
        let alias = attempt.alias.clone();
        self.state.audit.record(attempt.into_record(outcome)).await;

        match result {
            Ok(data) => {
                info!(%trace_id, %operation, alias = ?alias, "call completed");
                Ok(Traced { data, trace_id })
            }
            Err(err) => {
                warn!(%trace_id, %operation, alias = ?alias, kind = err.kind(), error = %err, "call failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Assignment, InMemoryGrantStore};

    fn grant(assignments: Vec<Assignment>) -> AccessGrant {
        AccessGrant {
            credential_id: "k".into(),
            display_name: Some("tester".into()),
            enabled: true,
            tier: Tier::Readonly,
            default_alias: None,
            assignments,
        }
    }

    #[test]
    fn attempt_records_effective_tier_or_grant_tier() {
        let g = grant(vec![Assignment {
            profile: DatabaseProfile::sqlite("a", "/tmp/a.db"),
            tier: Tier::Full,
        }]);
        let mut attempt = Attempt::new(Operation::Execute, &g).statement("DELETE FROM t", &Params::new());
        attempt.resolve(&g, None).unwrap();
        let record = attempt.into_record(Ok(Some(2)));
        assert_eq!(record.tier, Tier::Full);
        assert_eq!(record.alias.as_deref(), Some("a"));
        assert_eq!(record.rows_affected, Some(2));
        assert_eq!(record.trace_id.len(), 32);

        let mut unresolved = Attempt::new(Operation::Query, &g);
        assert!(unresolved.resolve(&g, Some("zzz")).is_err());
        let record = unresolved.into_record(Err("alias_not_granted"));
        assert_eq!(record.tier, Tier::Readonly);
        assert_eq!(record.alias, None);
        assert_eq!(record.error_kind.as_deref(), Some("alias_not_granted"));
        assert_eq!(record.caller_name.as_deref(), Some("tester"));
    }

    #[test]
    fn statement_request_accepts_wire_alias_key() {
        let request: StatementRequest =
            serde_json::from_value(json!({"sql": "SELECT 1", "db_alias": "sales"})).unwrap();
        assert_eq!(request.alias.as_deref(), Some("sales"));
        assert!(request.params.is_empty());
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_blank_and_disabled_tokens() {
        let store = Arc::new(InMemoryGrantStore::new());
        store.insert("good", grant(vec![]));
        let mut disabled = grant(vec![]);
        disabled.enabled = false;
        store.insert("off", disabled);

        let gateway = Gateway::new(
            Arc::new(GatewayState::new(AuditTrail::disabled()).unwrap()),
            store,
        );
        assert!(gateway.authenticate("good").await.is_ok());
        for token in ["", "  ", "nope", "off"] {
            assert!(matches!(
                gateway.authenticate(token).await,
                Err(GatewayError::UnknownCredential)
            ));
        }
    }
}
