use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tempfile::tempdir;

use sqlgate::{
    AccessGrant, Assignment, AuditQuery, AuditTrail, DatabaseProfile, Gateway, GatewayError,
    GatewayState, InMemoryGrantStore, SqliteAuditStore, StatementRequest, Tier,
};

const REMOTE_TOKEN: &str = "remote-service-token";

#[derive(Debug, Clone)]
struct Hit {
    path: String,
    authorization: Option<String>,
    body: Value,
}

#[derive(Default)]
struct FakeRemote {
    hits: Mutex<Vec<Hit>>,
}

impl FakeRemote {
    fn record(&self, path: &str, headers: &HeaderMap, body: Value) {
        self.hits.lock().push(Hit {
            path: path.to_string(),
            authorization: headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            body,
        });
    }

    fn hits(&self) -> Vec<Hit> {
        self.hits.lock().clone()
    }
}

async fn schema(
    State(remote): State<Arc<FakeRemote>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    remote.record("/schema", &headers, json!(query));
    Json(json!({
        "data": {
            "db_alias": query.get("db_alias"),
            "table": query.get("table"),
            "columns": [{"table_name": "entries", "column_name": "amount", "data_type": "numeric"}]
        },
        "trace_id": "remote-trace"
    }))
}

async fn query(
    State(remote): State<Arc<FakeRemote>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    remote.record("/query", &headers, body);
    Json(json!({"data": [{"id": 1, "amount": "12.50"}], "trace_id": "remote-trace"}))
}

async fn execute(
    State(remote): State<Arc<FakeRemote>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let conflict = body["sql"].as_str().unwrap_or_default().contains("conflict");
    remote.record("/execute", &headers, body);
    if conflict {
        return (
            StatusCode::CONFLICT,
            Json(json!({"detail": "row version mismatch"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"data": {"rows_affected": 4}, "trace_id": "remote-trace"})),
    )
}

async fn spawn_remote() -> Result<(SocketAddr, Arc<FakeRemote>)> {
    let remote = Arc::new(FakeRemote::default());
    let app = Router::new()
        .route("/api/schema", get(schema))
        .route("/api/query", post(query))
        .route("/api/execute", post(execute))
        .with_state(remote.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((addr, remote))
}

struct Harness {
    gateway: Gateway,
    remote: Arc<FakeRemote>,
    profile: DatabaseProfile,
    _dir: tempfile::TempDir,
}

async fn harness() -> Result<Harness> {
    let dir = tempdir()?;
    let (addr, remote) = spawn_remote().await?;
    let store = SqliteAuditStore::open(dir.path()).await?;
    let state = GatewayState::new(AuditTrail::with_store(Arc::new(store), 30))?;
    let gateway = Gateway::new(Arc::new(state), Arc::new(InMemoryGrantStore::new()));
    let profile = DatabaseProfile::proxied("ledger", format!("http://{addr}/api/"), REMOTE_TOKEN);
    Ok(Harness {
        gateway,
        remote,
        profile,
        _dir: dir,
    })
}

fn grant(profile: &DatabaseProfile, tier: Tier) -> AccessGrant {
    AccessGrant {
        credential_id: "caller-key".into(),
        display_name: Some("finance".into()),
        enabled: true,
        tier,
        default_alias: None,
        assignments: vec![Assignment {
            profile: profile.clone(),
            tier,
        }],
    }
}

#[tokio::test]
async fn queries_are_delegated_with_the_profile_credential() -> Result<()> {
    let h = harness().await?;
    let grant = grant(&h.profile, Tier::Readonly);

    let rows = h
        .gateway
        .query(
            &grant,
            &StatementRequest::new("SELECT id, amount FROM entries WHERE id = :id")
                .with_params(json!({"id": 1}).as_object().cloned().expect("object")),
        )
        .await?;
    assert_eq!(rows.data.len(), 1);
    assert_eq!(rows.data[0]["amount"], json!("12.50"));
    assert_ne!(rows.trace_id, "remote-trace");

    let hits = h.remote.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "/query");
    assert_eq!(
        hits[0].authorization.as_deref(),
        Some(format!("Bearer {REMOTE_TOKEN}").as_str())
    );
    assert_eq!(
        hits[0].body,
        json!({"sql": "SELECT id, amount FROM entries WHERE id = :id", "params": {"id": 1}, "db_alias": "ledger"})
    );
    Ok(())
}

#[tokio::test]
async fn local_policy_is_enforced_before_contacting_the_remote() -> Result<()> {
    let h = harness().await?;

    let write = grant(&h.profile, Tier::Write);
    let err = h
        .gateway
        .execute(&write, &StatementRequest::new("DELETE FROM entries"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::PermissionDenied(_)));

    let readonly = grant(&h.profile, Tier::Readonly);
    let err = h
        .gateway
        .query(&readonly, &StatementRequest::new("UPDATE entries SET amount = 0"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::StatementNotAllowed(_)));

    let err = h
        .gateway
        .query(&readonly, &StatementRequest::new("SELECT 1; DELETE FROM entries"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::StatementNotAllowed(_)));

    assert!(h.remote.hits().is_empty());

    let page = h.gateway.audit_log(&AuditQuery::default()).await?;
    assert_eq!(page.total, 3);
    Ok(())
}

#[tokio::test]
async fn remote_writes_return_rows_affected_and_surface_errors() -> Result<()> {
    let h = harness().await?;
    let full = grant(&h.profile, Tier::Full);

    let done = h
        .gateway
        .execute(&full, &StatementRequest::new("DELETE FROM entries WHERE stale = 1"))
        .await?;
    assert_eq!(done.data.rows_affected, 4);

    let err = h
        .gateway
        .execute(&full, &StatementRequest::new("UPDATE entries SET note = 'conflict'"))
        .await
        .unwrap_err();
    match err {
        GatewayError::Remote { status, detail } => {
            assert_eq!(status, 409);
            assert_eq!(detail, "row version mismatch");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let page = h.gateway.audit_log(&AuditQuery::default()).await?;
    assert_eq!(page.total, 2);
    let newest = &page.entries[0];
    assert_eq!(newest.error_kind.as_deref(), Some("remote_failure"));
    assert_eq!(page.entries[1].rows_affected, Some(4));
    Ok(())
}

#[tokio::test]
async fn schema_is_delegated_with_table_and_alias() -> Result<()> {
    let h = harness().await?;
    let grant = grant(&h.profile, Tier::Readonly);

    let described = h.gateway.schema(&grant, Some("entries"), None).await?;
    assert_eq!(described.data.alias, "ledger");
    assert_eq!(described.data.table.as_deref(), Some("entries"));
    assert_eq!(described.data.columns[0].data_type.as_deref(), Some("numeric"));

    let hits = h.remote.hits();
    assert_eq!(hits[0].path, "/schema");
    assert_eq!(hits[0].body, json!({"table": "entries", "db_alias": "ledger"}));
    Ok(())
}

#[tokio::test]
async fn unreachable_remote_is_a_connection_failure() -> Result<()> {
    let dir = tempdir()?;
    let state = GatewayState::new(AuditTrail::with_store(
        Arc::new(SqliteAuditStore::open(dir.path()).await?),
        30,
    ))?;
    let gateway = Gateway::new(Arc::new(state), Arc::new(InMemoryGrantStore::new()));
    // Bind then drop to get a port nobody listens on.
    let addr = tokio::net::TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let profile = DatabaseProfile::proxied("ledger", format!("http://{addr}"), REMOTE_TOKEN);

    let err = gateway
        .query(&grant(&profile, Tier::Readonly), &StatementRequest::new("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ConnectionFailure(_)), "{err}");
    let rendered = err.to_string();
    assert!(!rendered.contains(REMOTE_TOKEN));
    Ok(())
}
