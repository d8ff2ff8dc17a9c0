//! Middleware implementations for the proxy service

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

/// Logging middleware - logs request/response details with timing
///
/// Responses the proxy produced itself (5xx without an upstream) are logged
/// at warn level so they stand out from relayed upstream statuses.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    // Extract request details before passing ownership
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        remote_addr = remote_addr,
        method = %method,
        path = path,
        "Incoming request"
    );

    let response = next.run(request).await;
    let duration = start.elapsed();
    let status = response.status();

    if status.is_server_error() {
        warn!(
            remote_addr = remote_addr,
            method = %method,
            path = path,
            status = status.as_u16(),
            duration_ms = duration.as_millis(),
            "Request failed"
        );
    } else {
        info!(
            remote_addr = remote_addr,
            method = %method,
            path = path,
            status = status.as_u16(),
            duration_ms = duration.as_millis(),
            "Request completed"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::middleware::from_fn;
    use tower::ServiceExt;

    fn respond_with(status: StatusCode) -> axum::Router {
        axum::Router::new()
            .fallback(move || async move { status })
            .layer(from_fn(logging_middleware))
    }

    #[tokio::test]
    async fn test_logging_middleware_passes_response_through() {
        let request = Request::builder()
            .method("GET")
            .uri("/test")
            .body(Body::empty())
            .unwrap();

        let response = respond_with(StatusCode::ACCEPTED)
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_logging_middleware_with_connect_info() {
        let mut request = Request::builder()
            .method("POST")
            .uri("/submit")
            .body(Body::from("payload"))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))));

        let response = respond_with(StatusCode::BAD_GATEWAY)
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
