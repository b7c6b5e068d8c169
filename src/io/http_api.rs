//! HTTP API
//!
//! JSON endpoints for door commands, tenant access status and access attempts,
//! plus /health and Prometheus /metrics. Every JSON body is an envelope with
//! `success` and `timestamp`. Uses hyper (HTTP/1).

use crate::domain::command::{
    AttemptRequest, CommandRequest, RawAttemptRequest, RawCommandRequest, RawStatusRequest,
    StatusRequest,
};
use crate::domain::error::{EngineError, EngineResult};
use crate::infra::metrics::Metrics;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::engine::{AccessControlEngine, CommandOutcome, Reply};
use crate::services::relock_worker::{schedule_relock, RelockCmd};
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Request bodies above this size are rejected
const MAX_BODY_BYTES: usize = 64 * 1024;

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";
const PROMETHEUS: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state behind every connection
pub struct ApiState {
    engine: Arc<AccessControlEngine>,
    metrics: Arc<Metrics>,
    site_id: String,
    relock_tx: Option<mpsc::Sender<RelockCmd>>,
}

impl ApiState {
    pub fn new(engine: Arc<AccessControlEngine>, metrics: Arc<Metrics>, site_id: String) -> Self {
        Self { engine, metrics, site_id, relock_tx: None }
    }

    /// Hand temporary unlocks to the re-lock worker
    pub fn with_relock(mut self, relock_tx: mpsc::Sender<RelockCmd>) -> Self {
        self.relock_tx = Some(relock_tx);
        self
    }
}

/// Response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(reply: Reply<T>) -> Self {
        Self {
            success: true,
            data: Some(reply.data),
            error: None,
            warning: reply.warning,
            timestamp: Utc::now(),
        }
    }

    fn failed(message: String) -> Self {
        Self { success: false, data: None, error: Some(message), warning: None, timestamp: Utc::now() }
    }
}

/// Transport-independent response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl ApiReply {
    fn json<T: Serialize>(status: StatusCode, response: &ApiResponse<T>) -> Self {
        match serde_json::to_string(response) {
            Ok(body) => Self { status, content_type: JSON, body },
            Err(e) => {
                error!(error = %e, "response_serialize_failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    content_type: JSON,
                    body: r#"{"success":false,"error":"response serialization failed"}"#.to_string(),
                }
            }
        }
    }

    fn text(status: StatusCode, content_type: &'static str, body: String) -> Self {
        Self { status, content_type, body }
    }

    fn error(status: StatusCode, message: String) -> Self {
        Self::json::<()>(status, &ApiResponse::failed(message))
    }

    fn from_result<T: Serialize>(result: EngineResult<Reply<T>>) -> Self {
        match result {
            Ok(reply) => Self::json(StatusCode::OK, &ApiResponse::ok(reply)),
            Err(e) => {
                let status = StatusCode::from_u16(e.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Self::error(status, e.to_string())
            }
        }
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = self.status;
        response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        response
    }
}

fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> EngineResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| EngineError::validation(format!("invalid JSON body: {e}")))
}

/// Route one request. `body` is the complete request body.
pub async fn dispatch(state: &ApiState, method: &Method, path: &str, body: &[u8]) -> ApiReply {
    match (method, path) {
        (&Method::GET, "/health") => ApiReply::text(StatusCode::OK, TEXT, "ok".to_string()),
        (&Method::GET, "/metrics") => ApiReply::text(
            StatusCode::OK,
            PROMETHEUS,
            format_prometheus_metrics(&state.metrics, &state.site_id),
        ),
        (&Method::POST, "/api/doors/command") => ApiReply::from_result(door_command(state, body).await),
        (&Method::POST, "/api/access/status") => {
            let result = match parse_body::<RawStatusRequest>(body).and_then(StatusRequest::from_raw) {
                Ok(request) => state.engine.access_status(request).await,
                Err(e) => Err(e),
            };
            ApiReply::from_result(result)
        }
        (&Method::POST, "/api/access/attempt") => {
            let result = match parse_body::<RawAttemptRequest>(body).and_then(AttemptRequest::from_raw) {
                Ok(request) => state.engine.access_attempt(request).await,
                Err(e) => Err(e),
            };
            ApiReply::from_result(result)
        }
        (_, "/health" | "/metrics" | "/api/doors/command" | "/api/access/status" | "/api/access/attempt") => {
            ApiReply::error(StatusCode::METHOD_NOT_ALLOWED, format!("method {method} not allowed"))
        }
        _ => ApiReply::error(StatusCode::NOT_FOUND, format!("no route for {path}")),
    }
}

async fn door_command(state: &ApiState, body: &[u8]) -> EngineResult<Reply<CommandOutcome>> {
    let raw: RawCommandRequest = parse_body(body)?;
    let request =
        CommandRequest::from_raw(raw, state.engine.settings().default_auto_lock_seconds)?;
    let reply = state.engine.command(request).await?;

    if let (Some(seconds), Some(version), Some(tx)) =
        (reply.data.auto_lock_seconds, reply.data.version, &state.relock_tx)
    {
        schedule_relock(tx, &state.metrics, &reply.data.door_id, version, seconds);
    }
    Ok(reply)
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(path = %path, error = %e, "request_body_rejected");
            let reply = ApiReply::error(StatusCode::PAYLOAD_TOO_LARGE, format!("request body rejected: {e}"));
            return Ok(reply.into_response());
        }
    };

    let reply = dispatch(&state, &method, &path, &body).await;
    debug!(method = %method, path = %path, status = %reply.status.as_u16(), "http_request");
    Ok(reply.into_response())
}

/// Serve the API on an already-bound listener until shutdown is signalled
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr().context("Failed to read listener address")?;
    info!(addr = %local_addr, site = %state.site_id, "http_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind and serve the API
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    state: Arc<ApiState>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind_address, port))
        .await
        .with_context(|| format!("Failed to bind HTTP API on {bind_address}:{port}"))?;
    serve(listener, state, shutdown).await
}
