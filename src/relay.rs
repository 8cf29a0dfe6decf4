//! HTTP relay between the automation workflow and the dashboard.
//!
//! The relay keeps no state of its own. It validates and acknowledges what
//! the workflow sends, optionally drops accepted payloads into the staging
//! area for the dashboard poller, and proxies thread history from an
//! upstream query endpoint when one is configured.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{Database, PENDING_KEY, PENDING_THREADS_KEY};
use crate::models::{is_truthy, JobMatchPayload, StagedThreadMessage};

const ALLOWED_HEADERS: &str = "Content-Type, X-API-Key";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{error}: {message}")]
    BadRequest {
        error: &'static str,
        message: &'static str,
    },
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            RelayError::BadRequest { error, message } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": error, "message": message }),
            ),
            RelayError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                json!({ "error": "Method not allowed" }),
            ),
            // Surfaced verbatim; the relay is an internal tool.
            RelayError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Internal server error", "message": message }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct RelayState {
    http: reqwest::Client,
    threads_url: Option<String>,
    api_key: Option<String>,
    staging: Option<Arc<Mutex<Database>>>,
}

impl RelayState {
    pub fn new(config: &Config, staging: Option<Database>) -> Self {
        Self {
            http: reqwest::Client::new(),
            threads_url: config.threads_url.clone(),
            api_key: config.api_key.clone(),
            staging: staging.map(|db| Arc::new(Mutex::new(db))),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route(
            "/api/matches",
            post(receive_match)
                .options(preflight_post)
                .fallback(method_not_allowed),
        )
        .route(
            "/api/thread-update",
            post(receive_thread_update)
                .options(preflight_post)
                .fallback(method_not_allowed),
        )
        .route(
            "/api/get-threads",
            get(get_threads)
                .options(preflight_get)
                .fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .with_state(state)
}

pub async fn serve(config: &Config, bind: SocketAddr, staging: Option<Database>) -> Result<()> {
    let staging_enabled = staging.is_some();
    let app = router(RelayState::new(config, staging));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind relay to {}", bind))?;
    info!(
        %bind,
        staging = staging_enabled,
        upstream_threads = config.threads_url.as_deref().unwrap_or("(none)"),
        "Relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down relay");
        })
        .await
        .context("Relay server failed")?;
    Ok(())
}

// --- Handlers ---

async fn receive_match(
    State(state): State<RelayState>,
    body: Bytes,
) -> Result<Json<Value>, RelayError> {
    let job_match: Value = parse_body(&body, "Error processing request")?;

    if !is_truthy(job_match.get("job_id")) || !is_truthy(job_match.get("candidates")) {
        return Err(RelayError::BadRequest {
            error: "Invalid payload",
            message: "job_id and candidates are required",
        });
    }

    info!(payload = %job_match, "Received job match");

    let candidates_count = job_match
        .get("candidates")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    if let Some(staging) = &state.staging {
        match serde_json::from_value::<JobMatchPayload>(job_match.clone()) {
            Ok(payload) => stage(Arc::clone(staging), PENDING_KEY, payload).await,
            Err(e) => warn!(error = %e, "Job match not staged, payload shape not understood"),
        }
    }

    Ok(Json(json!({
        "status": "received",
        "job_id": job_match["job_id"],
        "candidates_count": candidates_count,
        "timestamp": timestamp(),
        "message": "Job match received successfully. Data will be displayed in the dashboard.",
    })))
}

async fn receive_thread_update(
    State(state): State<RelayState>,
    body: Bytes,
) -> Result<Json<Value>, RelayError> {
    let payload: Value = parse_body(&body, "Error processing thread update")?;

    if !is_truthy(payload.get("job_id")) || !is_truthy(payload.get("message")) {
        return Err(RelayError::BadRequest {
            error: "Invalid payload",
            message: "job_id and message are required",
        });
    }

    let message = &payload["message"];
    if !is_truthy(message.get("id"))
        || !is_truthy(message.get("direction"))
        || !is_truthy(message.get("body"))
    {
        return Err(RelayError::BadRequest {
            error: "Invalid message structure",
            message: "message must include id, direction, and body",
        });
    }

    info!(payload = %payload, "Received thread update");

    if let Some(staging) = &state.staging {
        let staged = json!({ "job_id": payload["job_id"], "message": message });
        match serde_json::from_value::<StagedThreadMessage>(staged) {
            Ok(update) => stage(Arc::clone(staging), PENDING_THREADS_KEY, update).await,
            Err(e) => warn!(error = %e, "Thread update not staged, message shape not understood"),
        }
    }

    Ok(Json(json!({
        "status": "received",
        "job_id": payload["job_id"],
        "message_id": message["id"],
        "direction": message["direction"],
        "thread_count": or_default(payload.get("thread_count"), json!(1)),
        "unread_count": or_default(payload.get("unread_count"), json!(0)),
        "timestamp": timestamp(),
        "message": "Thread update received successfully.",
    })))
}

#[derive(Debug, Deserialize)]
struct ThreadQuery {
    job_id: Option<String>,
}

async fn get_threads(
    State(state): State<RelayState>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Value>, RelayError> {
    let Some(job_id) = query.job_id.filter(|id| !id.is_empty()) else {
        return Err(RelayError::BadRequest {
            error: "Missing parameter",
            message: "job_id query parameter is required",
        });
    };

    info!(job_id = %job_id, "Fetching threads for job");

    if let Some(url) = &state.threads_url {
        match fetch_upstream_threads(&state, url, &job_id).await? {
            Some(messages) => {
                let count = messages.len();
                return Ok(Json(json!({
                    "status": "success",
                    "job_id": job_id,
                    "threads": messages,
                    "count": count,
                })));
            }
            None => debug!(job_id = %job_id, "Upstream gave no threads, using fallback"),
        }
    }

    Ok(Json(json!({
        "status": "success",
        "job_id": job_id,
        "threads": [],
        "count": 0,
        "message": "No n8n endpoint configured. Using client-side storage.",
    })))
}

/// `Ok(None)` when the upstream cannot be reached or answers with a failure
/// status. A success response that is not JSON is an internal error.
async fn fetch_upstream_threads(
    state: &RelayState,
    url: &str,
    job_id: &str,
) -> Result<Option<Vec<Value>>, RelayError> {
    let response = state
        .http
        .get(url)
        .query(&[("job_id", job_id)])
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-API-Key", state.api_key.as_deref().unwrap_or(""))
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Thread upstream unreachable");
            return Ok(None);
        }
    };
    if !response.status().is_success() {
        warn!(status = %response.status(), "Thread upstream returned an error status");
        return Ok(None);
    }

    let body: Value = response.json().await.map_err(|e| {
        error!(error = %e, "Error fetching threads");
        RelayError::Internal(e.to_string())
    })?;
    Ok(Some(match body.get("messages") {
        Some(Value::Array(messages)) => messages.clone(),
        _ => Vec::new(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn preflight_post() -> Response {
    preflight("POST, OPTIONS")
}

async fn preflight_get() -> Response {
    preflight("GET, OPTIONS")
}

fn preflight(methods: &'static str) -> Response {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS),
            (header::ACCESS_CONTROL_ALLOW_METHODS, methods),
        ],
    )
        .into_response()
}

async fn method_not_allowed() -> RelayError {
    RelayError::MethodNotAllowed
}

// --- Helpers ---

fn parse_body(body: &[u8], context: &str) -> Result<Value, RelayError> {
    serde_json::from_slice(body).map_err(|e| {
        error!(error = %e, "{}", context);
        RelayError::Internal(e.to_string())
    })
}

/// Appends `item` to the staging area. SQLite may wait on its busy timeout,
/// so the write runs on the blocking pool.
async fn stage<T>(staging: Arc<Mutex<Database>>, key: &'static str, item: T)
where
    T: serde::Serialize + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || match staging.lock() {
        Ok(db) => db.stage(key, &item),
        Err(_) => Err(anyhow::anyhow!("staging database lock poisoned")),
    })
    .await
    .unwrap_or_else(|e| Err(anyhow::anyhow!("staging task failed: {}", e)));

    match result {
        Ok(()) => debug!(key, "Staged payload for the dashboard"),
        Err(e) => warn!(key, error = %format!("{:#}", e), "Failed to stage payload"),
    }
}

fn or_default(value: Option<&Value>, default: Value) -> Value {
    match value {
        Some(v) if is_truthy(Some(v)) => v.clone(),
        _ => default,
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
