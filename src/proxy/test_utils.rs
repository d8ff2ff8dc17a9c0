//! Test utilities for proxy module testing
//!
//! Real axum upstreams bound to ephemeral ports, plus request and config
//! helpers shared by the unit and integration tests.

#[cfg(test)]
pub mod test_helpers {
    use crate::proxy::types::*;
    use axum::{
        body::{Body, Bytes},
        extract::{Path, Request},
        http::{HeaderValue, Method, StatusCode},
        response::{IntoResponse, Response},
        routing::any,
        Router,
    };
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Header the echo upstream uses to report the path and query it received
    pub const UPSTREAM_PATH_HEADER: &str = "x-upstream-path";

    /// Create a test proxy configuration with short timeouts and a small pool
    pub fn test_proxy_config() -> ProxyConfig {
        ProxyConfig::new("127.0.0.1:0")
            .with_timeout(Duration::from_secs(5))
            .with_pool_capacity(PoolCapacity::try_new(8).expect("8 is a valid capacity"))
    }

    /// Serve `router` on an ephemeral local port for the rest of the test
    pub async fn spawn_upstream(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream listener");
        let addr = listener.local_addr().expect("upstream local address");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        addr
    }

    /// An address nothing is listening on
    pub fn unused_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind scratch listener");
        listener.local_addr().expect("scratch local address")
    }

    /// Upstream that echoes the request body and reports what it saw in headers
    ///
    /// `/status/{code}` answers with that status instead.
    pub fn echo_router() -> Router {
        Router::new()
            .route("/status/{code}", any(status_handler))
            .fallback(echo_handler)
    }

    async fn status_handler(Path(code): Path<u16>) -> impl IntoResponse {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, "Status response")
    }

    async fn echo_handler(request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .unwrap_or_default();

        let mut response = Response::new(Body::from(body));
        let headers = response.headers_mut();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        if let Ok(value) = HeaderValue::from_str(&path) {
            headers.insert(UPSTREAM_PATH_HEADER, value);
        }
        if let Some(trace) = parts.headers.get("x-trace") {
            headers.insert("x-seen-trace", trace.clone());
        }
        if let Some(host) = parts.headers.get(axum::http::header::HOST) {
            headers.insert("x-seen-host", host.clone());
        }
        if let Ok(method) = HeaderValue::from_str(parts.method.as_str()) {
            headers.insert("x-seen-method", method);
        }
        response
    }

    /// Upstream that echoes the body and reports its `x-checksum` trailer
    /// in an `x-seen-checksum` response header
    pub fn trailer_router() -> Router {
        Router::new().fallback(|request: Request| async move {
            let collected = match request.into_body().collect().await {
                Ok(collected) => collected,
                Err(_) => return StatusCode::BAD_REQUEST.into_response(),
            };
            let checksum = collected
                .trailers()
                .and_then(|trailers| trailers.get("x-checksum"))
                .cloned();

            let mut response = Response::new(Body::from(collected.to_bytes()));
            if let Some(checksum) = checksum {
                response.headers_mut().insert("x-seen-checksum", checksum);
            }
            response
        })
    }

    /// Upstream that waits `delay` before answering
    pub fn slow_router(delay: Duration) -> Router {
        Router::new().fallback(move || async move {
            tokio::time::sleep(delay).await;
            (StatusCode::OK, "Slow response")
        })
    }

    /// Upstream that always answers with `status` and `body`
    pub fn fixed_router(status: StatusCode, body: &'static str) -> Router {
        Router::new().fallback(move || async move { (status, body) })
    }

    /// A request as seen by a recording upstream
    #[derive(Clone, Debug)]
    pub struct RecordedRequest {
        pub method: Method,
        pub path: String,
        pub body: Bytes,
    }

    /// Upstream that reports every request it receives on a channel
    pub fn recording_router() -> (Router, mpsc::UnboundedReceiver<RecordedRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new().fallback(move |request: Request| {
            let tx = tx.clone();
            async move {
                let (parts, body) = request.into_parts();
                let body = axum::body::to_bytes(body, usize::MAX)
                    .await
                    .unwrap_or_default();
                tx.send(RecordedRequest {
                    method: parts.method,
                    path: parts.uri.path().to_string(),
                    body,
                })
                .ok();
                (StatusCode::OK, "recorded")
            }
        });
        (router, rx)
    }

    /// Wait for the next recorded request, failing the test after a few seconds
    pub async fn next_recorded(rx: &mut mpsc::UnboundedReceiver<RecordedRequest>) -> RecordedRequest {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for upstream request")
            .expect("recording upstream stopped")
    }

    /// Build an inbound request for the proxy router
    pub fn proxy_request(method: &str, uri: &str, body: impl Into<Body>) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-trace", "abc")
            .body(body.into())
            .expect("test request should be valid")
    }

    /// Collect a response body
    pub async fn read_body(response: Response) -> Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("response body should be readable")
            .to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[test]
    fn test_config_creation() {
        let config = test_proxy_config();
        assert_eq!(config.pool_capacity.into_inner(), 8);
        assert_eq!(config.timeout.as_secs(), 5);
    }

    #[tokio::test]
    async fn test_echo_router_reports_request() {
        let response = echo_router()
            .oneshot(proxy_request("PUT", "/a/b?c=d", "hello"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(UPSTREAM_PATH_HEADER).unwrap(), "/a/b?c=d");
        assert_eq!(response.headers().get("x-seen-trace").unwrap(), "abc");
        assert_eq!(response.headers().get("x-seen-method").unwrap(), "PUT");
        assert_eq!(&read_body(response).await[..], b"hello");
    }

    #[tokio::test]
    async fn test_echo_router_status_route() {
        let response = echo_router()
            .oneshot(proxy_request("GET", "/status/404", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_recording_router_captures_requests() {
        let (router, mut rx) = recording_router();
        router
            .oneshot(proxy_request("POST", "/events", "payload"))
            .await
            .unwrap();

        let recorded = next_recorded(&mut rx).await;
        assert_eq!(recorded.path, "/events");
        assert_eq!(&recorded.body[..], b"payload");
    }
}
