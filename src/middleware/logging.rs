//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

/// Logs each request once it completes. Health checks are skipped.
///
/// The producer id is included when present so rejected deliveries can be
/// traced back to their sender.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let producer = request
        .headers()
        .get("x-producer-id")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let response = next.run(request).await;
    let latency = start.elapsed();
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            producer = %producer,
            status = status,
            latency_ms = latency.as_millis(),
            "Request failed (5xx)"
        );
    } else if status >= 400 {
        info!(
            method = %method,
            path = %path,
            producer = %producer,
            status = status,
            latency_ms = latency.as_millis(),
            "Request rejected (4xx)"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            producer = %producer,
            status = status,
            latency_ms = latency.as_millis(),
            "Request completed"
        );
    }

    response
}
