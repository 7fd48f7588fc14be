//! HTTP ingestion gateway
//!
//! `POST /SendEvent` validates the event, publishes it to the topic exactly
//! once and maps the publish report onto a status code. `GET /health`
//! reports queue depths. Every response is JSON and carries permissive CORS
//! headers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{Json, Router};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::broker::message::Message;
use crate::transport::message::{AcceptedResponse, ErrorResponse};
use crate::utils::error::{Result, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum GatewayBody {
    Accepted(AcceptedResponse),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub body: GatewayBody,
}

impl GatewayResponse {
    fn accepted() -> Self {
        Self {
            status: StatusCode::OK,
            body: GatewayBody::Accepted(AcceptedResponse::default()),
        }
    }

    fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: GatewayBody::Error(ErrorResponse::new(message)),
        }
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        with_cors(self.status, Json(self.body))
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    queues: BTreeMap<String, usize>,
}

fn with_cors(status: StatusCode, body: impl IntoResponse) -> Response {
    (
        status,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true"),
        ],
        body,
    )
        .into_response()
}

/// Pull `(body, status)` out of a raw `SendEvent` payload.
///
/// `message` may be a string or a JSON object; an object is stored as its
/// compact JSON text. `status` must be a non-empty string.
pub fn parse_event(raw: &[u8]) -> std::result::Result<(String, String), ValidationError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(ValidationError::NotAnObject);
    };

    let body = match fields.remove("message") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("message")),
        Some(Value::String(text)) if text.is_empty() => {
            return Err(ValidationError::InvalidField {
                field: "message",
                reason: "must not be empty".to_string(),
            });
        }
        Some(Value::String(text)) => text,
        Some(object @ Value::Object(_)) => object.to_string(),
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "message",
                reason: "must be a string or an object".to_string(),
            });
        }
    };

    let status = match fields.remove("status") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("status")),
        Some(Value::String(status)) if !status.is_empty() => status,
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "status",
                reason: "must be a non-empty string".to_string(),
            });
        }
    };

    Ok((body, status))
}

/// Validate, publish once and map the outcome to a response.
pub fn handle_request(broker: &Broker, raw: &[u8]) -> GatewayResponse {
    let (body, status) = match parse_event(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("rejected event: {e}");
            return GatewayResponse::error(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let message = Message::with_status(body, status);
    let message_id = message.id.clone();
    match broker.publish(message).into_result() {
        Ok(report) => {
            debug!(%message_id, delivered = report.delivered(), "event accepted");
            GatewayResponse::accepted()
        }
        Err(e) => {
            warn!(%message_id, "publish failed: {e}");
            GatewayResponse::error(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/SendEvent", post(send_event))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

async fn send_event(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResponse {
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        let is_json = content_type
            .to_str()
            .map(|v| v.trim().to_ascii_lowercase().starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return GatewayResponse::error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "content type must be application/json",
            );
        }
    }
    handle_request(&broker, &body)
}

async fn health(State(broker): State<Arc<Broker>>) -> Response {
    with_cors(
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            queues: broker.queue_depths(),
        }),
    )
}

/// Serve the gateway on `addr` until `shutdown` is cancelled.
pub async fn start_http_server(
    addr: &str,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("gateway listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(broker))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("gateway stopped");
    Ok(())
}
