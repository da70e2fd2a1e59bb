use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::query::{Point, QueryEngine, RangeQuery};
use super::CollectorHandle;
use crate::codec::Pipeline;
use crate::export::health::{bind_address, HealthMetrics};
use crate::table::Snapshot;

/// Envelope version reported in every chart response.
const RESPONSE_VERSION: i32 = 1;

const CODE_OK: i32 = 0;
const CODE_MISSING_ID: i32 = 11;
const CODE_BAD_ID: i32 = 12;
const CODE_BAD_BEGIN: i32 = 13;
const CODE_BAD_END: i32 = 14;
const CODE_BAD_ALIGN: i32 = 16;
const CODE_BAD_CALLBACK: i32 = 18;

/// Shared state for the collector's HTTP handlers.
pub struct HttpState {
    pub handle: CollectorHandle,
    pub engine: Arc<QueryEngine>,
    pub pipeline: Pipeline,
    pub health: Option<Arc<HealthMetrics>>,
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/v1/tables", post(submit_handler))
        .route("/cgi/chart", get(chart_handler))
        .with_state(state)
}

/// Binds `addr` and serves the collector API until `ctx` is cancelled.
pub async fn serve(
    addr: &str,
    state: Arc<HttpState>,
    ctx: CancellationToken,
) -> Result<JoinHandle<()>> {
    let bind_addr = bind_address(addr, ":8100");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))?;
    let local_addr = listener.local_addr().context("getting local address")?;
    let app = router(state);

    Ok(tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "collector API started");

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            ctx.cancelled().await;
        })
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "collector API server error");
        }
    }))
}

/// POST /v1/tables - one agent snapshot, encoded by the agreed pipeline.
async fn submit_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    let raw = match state.pipeline.decode(&body) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "undecodable snapshot body");
            count_ingest_error(&state, "codec");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let snapshot: Snapshot = match serde_json::from_slice(&raw) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(error = %e, "malformed snapshot JSON");
            count_ingest_error(&state, "json");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let keys = snapshot.table.len();
    if let Err(e) = state.handle.submit(snapshot).await {
        tracing::error!(error = %e, "rejecting snapshot");
        return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
    }

    tracing::trace!(keys, "snapshot accepted");
    StatusCode::OK.into_response()
}

fn count_ingest_error(state: &HttpState, kind: &str) {
    if let Some(h) = &state.health {
        h.ingest_errors.with_label_values(&[kind]).inc();
    }
}

/// Raw query string; values are parsed by hand so each bad field gets its
/// own response code.
#[derive(Debug, Default, Deserialize)]
pub struct ChartParams {
    pub id: Option<String>,
    pub begin: Option<String>,
    pub end: Option<String>,
    pub align: Option<String>,
    pub callback: Option<String>,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    ver: i32,
    code: i32,
    msg: String,
    data: T,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
struct ChartData {
    id: u32,
    begin: i64,
    end: i64,
    interval: i64,
    data: Vec<Point>,
}

/// A chart request that failed before or during the query.
struct ChartError {
    code: i32,
    msg: String,
}

impl ChartError {
    fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}

/// GET /cgi/chart?id=&begin=&end=&align=&callback=
async fn chart_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<ChartParams>,
) -> Response {
    let callback = params.callback.clone().filter(|c| !c.is_empty());
    if let Some(cb) = &callback {
        if !is_valid_callback(cb) {
            return render(
                None,
                &Envelope {
                    ver: RESPONSE_VERSION,
                    code: CODE_BAD_CALLBACK,
                    msg: "invalid callback name".to_string(),
                    data: Empty {},
                },
            );
        }
    }

    match run_chart(&state, &params).await {
        Ok(data) => render(
            callback.as_deref(),
            &Envelope {
                ver: RESPONSE_VERSION,
                code: CODE_OK,
                msg: "ok".to_string(),
                data,
            },
        ),
        Err(e) => render(
            callback.as_deref(),
            &Envelope {
                ver: RESPONSE_VERSION,
                code: e.code,
                msg: e.msg,
                data: Empty {},
            },
        ),
    }
}

async fn run_chart(state: &HttpState, params: &ChartParams) -> Result<ChartData, ChartError> {
    let key = match params.id.as_deref().filter(|s| !s.is_empty()) {
        None => return Err(ChartError::new(CODE_MISSING_ID, "missing id")),
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ChartError::new(CODE_BAD_ID, format!("bad id: {raw}")))?,
    };
    let begin = parse_opt(params.begin.as_deref())
        .map_err(|raw| ChartError::new(CODE_BAD_BEGIN, format!("bad begin: {raw}")))?;
    let end = parse_opt(params.end.as_deref())
        .map_err(|raw| ChartError::new(CODE_BAD_END, format!("bad end: {raw}")))?;
    let align = parse_opt(params.align.as_deref())
        .map_err(|raw| ChartError::new(CODE_BAD_ALIGN, format!("bad align: {raw}")))?;

    let series = state
        .engine
        .get_range(&RangeQuery {
            key,
            begin,
            end,
            align,
        })
        .await
        .map_err(|e| {
            tracing::warn!(key, error = %e, "chart query failed");
            ChartError::new(e.code(), e.to_string())
        })?;

    Ok(ChartData {
        id: series.key,
        begin: series.begin,
        end: series.end,
        interval: series.alignment,
        data: series.points,
    })
}

/// Parses an optional integer parameter; an empty value counts as unset.
fn parse_opt(raw: Option<&str>) -> Result<Option<i64>, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|_| s.to_string()),
    }
}

fn is_valid_callback(name: &str) -> bool {
    name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
}

fn render<T: Serialize>(callback: Option<&str>, envelope: &Envelope<T>) -> Response {
    let json = match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "encoding chart response");
            return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response();
        }
    };

    match callback {
        Some(cb) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/javascript")],
            format!("{cb}({json})"),
        )
            .into_response(),
        None => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
    }
}
