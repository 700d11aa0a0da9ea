//! HTTP endpoints for health checks, relay info, event lookup and queries.

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, Query as AxumQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr};
use tracing::{debug, info, warn};

use crate::{error::RelayError, filter::Filter, storage::Store};

#[derive(Clone)]
struct HttpState {
    store: Store,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Start an HTTP server exposing `/healthz`, `/query`, `/events/{id}` and
/// relay info.
pub async fn serve_http(
    addr: SocketAddr,
    store: Store,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http listening");
    axum::serve(listener, router(store).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(store: Store) -> Router {
    Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/query", get(query))
        .route("/events/:id", get(event_by_id))
        .with_state(HttpState { store })
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Minimal NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    /// Software identifier (always "strand").
    software: String,
    version: String,
    /// NIPs implemented: basic protocol, deletion and COUNT.
    supported_nips: Vec<u32>,
}

async fn relay_info() -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "strand".into(),
            software: "strand".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: vec![1, 9, 45],
        }),
    )
}

/// URL query parameters accepted by the `/query` endpoint.
#[derive(Deserialize)]
struct QueryParams {
    /// Comma-separated id prefixes.
    ids: Option<String>,
    /// Comma-separated author key prefixes.
    authors: Option<String>,
    /// Comma-separated kind numbers (e.g. `0,1`).
    kinds: Option<String>,
    /// Comma-separated referenced event ids (`#e`).
    e: Option<String>,
    /// Comma-separated referenced public keys (`#p`).
    p: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<String>,
}

/// Convert query string parameters into a [`Filter`].
///
/// List parameters are comma separated and map onto the filter fields of the
/// same name; `e` and `p` become `#e` and `#p`. Numbers that fail to parse are
/// ignored.
///
/// Example: `/query?authors=ab12&kinds=1,7&since=1700000000`
fn params_to_filter(params: QueryParams) -> Result<Filter, RelayError> {
    use serde_json::Value;
    let list = |s: String| -> Value {
        s.split(',')
            .filter(|v| !v.is_empty())
            .map(|v| Value::String(v.to_string()))
            .collect()
    };
    let mut obj = serde_json::Map::new();
    if let Some(ids) = params.ids {
        obj.insert("ids".into(), list(ids));
    }
    if let Some(a) = params.authors {
        obj.insert("authors".into(), list(a));
    }
    if let Some(k) = params.kinds {
        let arr = k
            .split(',')
            .filter_map(|v| v.parse::<u32>().ok())
            .map(|v| Value::Number(v.into()))
            .collect();
        obj.insert("kinds".into(), Value::Array(arr));
    }
    if let Some(e) = params.e {
        obj.insert("#e".into(), list(e));
    }
    if let Some(p) = params.p {
        obj.insert("#p".into(), list(p));
    }
    for (key, raw) in [
        ("since", params.since),
        ("until", params.until),
        ("limit", params.limit),
    ] {
        if let Some(n) = raw.and_then(|v| v.parse::<u64>().ok()) {
            obj.insert(key.into(), Value::Number(n.into()));
        }
    }
    Ok(Filter::from_value(&Value::Object(obj))?)
}

fn error_response(err: RelayError) -> Response {
    let status = match &err {
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Protocol(_) | RelayError::Validation(_) => StatusCode::BAD_REQUEST,
        RelayError::Storage(_) | RelayError::Bus(_) => {
            warn!(error = %err, "http request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

/// Parse query parameters and return matching events as NDJSON.
async fn query(
    State(state): State<HttpState>,
    AxumQuery(params): AxumQuery<QueryParams>,
) -> Response {
    let filter = match params_to_filter(params) {
        Ok(f) => f,
        Err(e) => return error_response(e),
    };
    let events = match state.store.query(&[filter]).await {
        Ok(events) => events,
        Err(e) => return error_response(e),
    };
    debug!(events = events.len(), "GET /query");
    // newline-delimited so clients can parse incrementally
    let body = events
        .iter()
        .filter_map(|e| serde_json::to_string(e).ok())
        .collect::<Vec<_>>()
        .join("\n");
    ([(header::CONTENT_TYPE, "application/x-ndjson")], Body::from(body)).into_response()
}

/// Single stored event by exact id.
async fn event_by_id(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    match state.store.fetch_event(&id).await {
        Ok(ev) => Json(ev).into_response(),
        Err(e) => error_response(e),
    }
}
