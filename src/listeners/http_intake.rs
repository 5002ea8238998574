//! HTTP intake receiver: `POST /api/logs/{sourceId}` and the batch variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::task::JoinHandle;

use super::{Listener, STOP_GRACE_PERIOD};
use crate::buffer::IngestionBuffer;
use crate::error::{GrepWiseError, GrepWiseResult};
use crate::parser::http_payload::{parse_http_log_request, LogRequest};
use crate::parser::{self, DEFAULT_CLOCK_SKEW_BUDGET_MS};
use crate::sources::SourceRegistry;

pub const MAX_BATCH_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_BATCH_ENTRIES: usize = 10_000;

#[derive(Clone)]
struct IntakeState {
    buffer: Arc<IngestionBuffer>,
    sources: Arc<SourceRegistry>,
}

pub struct HttpIntakeListener {
    host: String,
    port: u16,
    buffer: Arc<IngestionBuffer>,
    sources: Arc<SourceRegistry>,
    running: Arc<AtomicBool>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HttpIntakeListener {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        buffer: Arc<IngestionBuffer>,
        sources: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            buffer,
            sources,
            running: Arc::new(AtomicBool::new(false)),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn router(&self) -> Router {
        let state =
            IntakeState { buffer: Arc::clone(&self.buffer), sources: Arc::clone(&self.sources) };
        Router::new()
            .route("/api/logs/:source_id", post(intake_single))
            .route("/api/logs/:source_id/batch", post(intake_batch))
            .with_state(state)
    }
}

#[async_trait]
impl Listener for HttpIntakeListener {
    async fn start(&self) -> GrepWiseResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TokioTcpListener::bind(&addr)
            .await
            .map_err(|e| GrepWiseError::transient_io(e.to_string()))?;
        let app = self.router();
        self.running.store(true, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        *self.handle.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) -> GrepWiseResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = tokio::time::timeout(STOP_GRACE_PERIOD, handle).await;
        }
        Ok(())
    }
}

fn auth_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("X-Auth-Token").and_then(|v| v.to_str().ok())
}

async fn intake_single(
    State(state): State<IntakeState>,
    Path(source_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<LogRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .sources
        .check_http_auth(&source_id, auth_token(&headers))
        .map_err(to_http_error)?;

    let source = format!("http:{source_id}");
    let record = parser::finalize(
        parse_http_log_request(&req, &source),
        DEFAULT_CLOCK_SKEW_BUDGET_MS,
    );
    state.buffer.add(record);
    Ok(StatusCode::ACCEPTED)
}

async fn intake_batch(
    State(state): State<IntakeState>,
    Path(source_id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    state
        .sources
        .check_http_auth(&source_id, auth_token(&headers))
        .map_err(to_http_error)?;

    if body.len() > MAX_BATCH_BYTES {
        return Err((StatusCode::PAYLOAD_TOO_LARGE, "batch exceeds 10 MB".to_string()));
    }

    let entries: Vec<LogRequest> = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid batch payload: {e}")))?;

    if entries.len() > MAX_BATCH_ENTRIES {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            "batch exceeds 10000 entries".to_string(),
        ));
    }

    let source = format!("http:{source_id}");
    let records = entries
        .iter()
        .map(|req| {
            parser::finalize(parse_http_log_request(req, &source), DEFAULT_CLOCK_SKEW_BUDGET_MS)
        })
        .collect();
    let accepted = state.buffer.add_all(records);

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "accepted": accepted }))))
}

fn to_http_error(err: GrepWiseError) -> (StatusCode, String) {
    let status = match err.kind {
        crate::error::ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        crate::error::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        crate::error::ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.message)
}
