//! Client-facing error responses
//!
//! Clients only ever see a status code and its canonical reason phrase.
//! Upstream and internal detail stays in the logs.

use crate::proxy::types::ProxyError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

/// Extension trait mapping errors onto the statuses the proxy emits itself
pub trait ErrorResponseExt {
    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;
}

impl ErrorResponseExt for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoPrimary => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error conversion for Axum responses
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        status_text_response(self.status_code())
    }
}

/// Plain text response whose body is the status's reason phrase
pub fn status_text_response(status: StatusCode) -> Response {
    let text = status.canonical_reason().unwrap_or("Unknown Status");
    let mut response = (status, format!("{text}\n")).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case(ProxyError::NoPrimary, StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ProxyError::Cancelled, StatusCode::INTERNAL_SERVER_ERROR)]
    #[case(
        ProxyError::RequestTimeout(Duration::from_secs(1)),
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    #[case(
        ProxyError::InvalidTargetUrl("bad".to_string()),
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    fn test_status_mapping(#[case] error: ProxyError, #[case] expected: StatusCode) {
        assert_eq!(error.status_code(), expected);
    }

    #[tokio::test]
    async fn test_error_body_does_not_leak_detail() {
        let error = ProxyError::InvalidTargetUrl("secret-host.internal".to_string());
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Internal Server Error\n");
    }

    #[tokio::test]
    async fn test_no_primary_body() {
        let response = status_text_response(StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Service Unavailable\n");
    }
}
