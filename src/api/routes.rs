use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::auth::middleware::{bearer_token, device_fingerprint};
use crate::auth::{consumer_auth_middleware, ConsumerAuth};
use crate::error::{PipelineError, StoreError};
use crate::middleware::request_logging;
use crate::models::SignalView;
use crate::workflow::{
    ApprovalWorkflow, InboundWebhook, Rejection, WorkflowState, DEVICE_HEADER,
    IDEMPOTENCY_HEADER, PRODUCER_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

pub const MAX_WEBHOOK_BODY_BYTES: usize = 256 * 1024;
pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<ApprovalWorkflow>,
    pub consumer_auth: Arc<ConsumerAuth>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let consumer = Router::new()
        .route("/signals", get(list_signals))
        .route_layer(middleware::from_fn_with_state(
            state.consumer_auth.clone(),
            consumer_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/signals", post(receive_webhook))
        .route("/approvals/redeem", post(redeem_approval))
        .merge(consumer)
        .layer(RequestBodyLimitLayer::new(MAX_WEBHOOK_BODY_BYTES))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Producer webhook: authenticate, deduplicate, persist and approve a signal.
///
/// Processing runs on its own task so a client that disconnects mid-request
/// does not cancel work that has started committing.
async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let inbound = InboundWebhook {
        producer_id: header(&headers, PRODUCER_HEADER),
        signature: header(&headers, SIGNATURE_HEADER),
        timestamp: header(&headers, TIMESTAMP_HEADER),
        idempotency_key: header(&headers, IDEMPOTENCY_HEADER),
        device_fingerprint: header(&headers, DEVICE_HEADER),
        body: body.to_vec(),
    };

    let workflow = state.workflow.clone();
    let outcome = tokio::spawn(async move { workflow.process(inbound).await })
        .await
        .map_err(|e| ApiError::Internal(format!("webhook task failed: {}", e)))??;

    Ok(Json(WebhookResponse {
        signal_id: outcome.receipt.signal_id,
        cursor: outcome.receipt.cursor,
        approval_token: outcome.receipt.approval_token,
        expires_at: outcome.receipt.expires_at,
        replayed: outcome.replayed,
    }))
}

/// Execution-engine path: redeem a token for the signal it approves.
async fn redeem_approval(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SignalView>, ApiError> {
    let signal = state
        .workflow
        .redeem(bearer_token(&headers), device_fingerprint(&headers))?;
    Ok(Json(SignalView::from_signal(&signal)))
}

/// Ordered, gap-free page of a producer's signals.
async fn list_signals(
    State(state): State<AppState>,
    Query(params): Query<SignalQuery>,
) -> Result<Json<SignalPage>, ApiError> {
    let from_cursor = params.from_cursor.unwrap_or(0);
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);

    let signals = state
        .workflow
        .read_signals(&params.producer_id, from_cursor, limit)?;
    let next_cursor = signals.last().map(|s| s.cursor + 1).unwrap_or(from_cursor);

    Ok(Json(SignalPage {
        producer_id: params.producer_id,
        count: signals.len(),
        next_cursor,
        signals: signals.iter().map(SignalView::from_signal).collect(),
    }))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

// ===== Request/Response Types =====

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    pub producer_id: String,
    pub from_cursor: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub signal_id: String,
    pub cursor: u64,
    pub approval_token: String,
    pub expires_at: DateTime<Utc>,
    pub replayed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignalPage {
    pub producer_id: String,
    pub count: usize,
    pub next_cursor: u64,
    pub signals: Vec<SignalView>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Pipeline {
        error: PipelineError,
        stage: Option<WorkflowState>,
    },
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        ApiError::Pipeline { error, stage: None }
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        ApiError::Pipeline {
            error: rejection.error,
            stage: Some(rejection.stage),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        PipelineError::from(err).into()
    }
}

/// HTTP status for each error class.
pub fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Auth(_) | PipelineError::Token(_) => StatusCode::UNAUTHORIZED,
        PipelineError::Replay(_) | PipelineError::Idempotency(_) => StatusCode::CONFLICT,
        PipelineError::Request(crate::error::RequestError::SignalConflict(_)) => {
            StatusCode::CONFLICT
        }
        PipelineError::Request(_) => StatusCode::BAD_REQUEST,
        PipelineError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        PipelineError::Policy(_) => StatusCode::FORBIDDEN,
        PipelineError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (error, stage) = match self {
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "internal_error",
                        "category": "internal",
                        "message": "Internal server error",
                        "retryable": true,
                    })),
                )
                    .into_response();
            }
            ApiError::Pipeline { error, stage } => (error, stage),
        };

        let status = status_for(&error);
        let message = match &error {
            PipelineError::Store(err) => {
                tracing::error!("Storage error: {}", err);
                "Storage unavailable, retry later".to_string()
            }
            PipelineError::Signing(err) => {
                tracing::error!("Token signing error: {}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": error.reason(),
            "category": error.category(),
            "message": message,
            "retryable": error.is_retryable(),
        });
        if let Some(stage) = stage {
            body["stage"] = json!(stage.as_str());
        }

        let mut response = (status, Json(body)).into_response();
        if let PipelineError::RateLimited(limit) = &error {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(limit.retry_after_secs()));
        }
        response
    }
}
