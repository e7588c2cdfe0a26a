//! HTTP client for a remote gateway instance that executes on our behalf.
//!
//! Only the profile's own remote credential is sent. The caller's token is
//! never forwarded.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    engine::JsonRow,
    error::{GatewayError, GatewayResult},
    params::Params,
    profile::ProxiedSettings,
    schema::SchemaDescription,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DETAIL_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
    #[serde(default)]
    trace_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatementBody<'a> {
    sql: &'a str,
    params: &'a Params,
    db_alias: &'a str,
}

#[derive(Debug, Deserialize)]
struct RowsAffectedBody {
    #[serde(default)]
    rows_affected: u64,
}

#[derive(Debug, Clone)]
pub struct RemoteGateway {
    http: Client,
}

impl RemoteGateway {
    pub fn new() -> GatewayResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("sqlgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| GatewayError::Internal(format!("building HTTP client: {err}")))?;
        Ok(Self { http })
    }

    pub async fn schema(
        &self,
        remote: &ProxiedSettings,
        table: Option<&str>,
        alias: &str,
    ) -> GatewayResult<SchemaDescription> {
        let mut url = endpoint(remote, "schema")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(table) = table {
                pairs.append_pair("table", table);
            }
            pairs.append_pair("db_alias", alias);
        }
        self.send(remote, self.http.request(Method::GET, url)).await
    }

    pub async fn query(
        &self,
        remote: &ProxiedSettings,
        sql: &str,
        params: &Params,
        alias: &str,
    ) -> GatewayResult<Vec<JsonRow>> {
        let url = endpoint(remote, "query")?;
        let body = StatementBody {
            sql,
            params,
            db_alias: alias,
        };
        self.send(remote, self.http.request(Method::POST, url).json(&body))
            .await
    }

    pub async fn execute(
        &self,
        remote: &ProxiedSettings,
        sql: &str,
        params: &Params,
        alias: &str,
    ) -> GatewayResult<u64> {
        let url = endpoint(remote, "execute")?;
        let body = StatementBody {
            sql,
            params,
            db_alias: alias,
        };
        let affected: RowsAffectedBody = self
            .send(remote, self.http.request(Method::POST, url).json(&body))
            .await?;
        Ok(affected.rows_affected)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        remote: &ProxiedSettings,
        request: RequestBuilder,
    ) -> GatewayResult<T> {
        let response = request
            .bearer_auth(remote.token.expose())
            .send()
            .await
            .map_err(|err| GatewayError::connection(format!("remote gateway unreachable: {err}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| GatewayError::connection(format!("reading remote response: {err}")))?;

        if !status.is_success() {
            return Err(GatewayError::Remote {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|err| {
            GatewayError::Remote {
                status: status.as_u16(),
                detail: format!("malformed response: {err}"),
            }
        })?;
        if let Some(trace_id) = &envelope.trace_id {
            debug!(remote_trace_id = %trace_id, "remote gateway call completed");
        }
        Ok(envelope.data)
    }
}

fn endpoint(remote: &ProxiedSettings, path: &str) -> GatewayResult<Url> {
    let base = remote.base_url.trim_end_matches('/');
    Url::parse(&format!("{base}/{path}"))
        .map_err(|err| GatewayError::validation(format!("invalid api_url '{base}': {err}")))
}

/// Pulls `detail` (or `error`) out of an error body, else the raw text.
fn error_detail(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        if let Some(detail) = map.get("detail").or_else(|| map.get("error")) {
            return match detail {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
        }
    }
    body.chars().take(MAX_DETAIL_CHARS).collect()
}
