//! Forwarding unit bound to a single upstream target
//!
//! A [`Switch`] builds the outbound URI for each request (target scheme and
//! host, inbound path and query, rewritten through its prefix table), runs
//! the call under its own deadline and the proxy's cancellation scope, copies
//! the upstream body into the request's [`Transfer`], and reports the outcome.
//! The same switch type serves as the primary and as every secondary.

use crate::proxy::hooks::{self, CallRecord, Hook, HookPhase};
use crate::proxy::rewrite::{RewriteRule, RewriteTable};
use crate::proxy::transfer::Transfer;
use crate::proxy::types::*;
use crate::proxy::url_resolver::{TargetBase, UrlResolver};
use axum::body::Body;
use axum::extract::ConnectInfo;
use chrono::Utc;
use http_body_util::BodyExt;
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::{HeaderMap, Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Status and headers returned by an upstream
///
/// The body itself stays in the transfer's output accumulator.
#[derive(Debug)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Connection between the proxy and one upstream service
#[derive(Clone)]
pub struct Switch {
    target: Arc<TargetBase>,
    rewrites: Arc<RewriteTable>,
    timeout: Duration,
    client: UpstreamClient,
    pre: Option<Hook>,
    post: Option<Hook>,
}

impl Switch {
    /// Create a switch for `target` with the default timeout
    pub fn new(target: &str) -> ProxyResult<Self> {
        Self::with_timeout(target, DEFAULT_TIMEOUT)
    }

    /// Create a switch for `target`; a zero timeout disables the deadline
    pub fn with_timeout(target: &str, timeout: Duration) -> ProxyResult<Self> {
        let target = TargetBase::parse(target)?;
        Ok(Self {
            target: Arc::new(target),
            rewrites: Arc::new(RewriteTable::new()),
            timeout,
            client: build_client(timeout),
            pre: None,
            post: None,
        })
    }

    /// Set the hook called before each outbound call
    pub fn with_pre_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallRecord<'_>) + Send + Sync + 'static,
    {
        self.pre = Some(Arc::new(hook));
        self
    }

    /// Set the hook called after each completed outbound call
    pub fn with_post_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallRecord<'_>) + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(hook));
        self
    }

    /// Install already shared hooks
    pub fn with_hooks(mut self, pre: Option<Hook>, post: Option<Hook>) -> Self {
        self.pre = pre;
        self.post = post;
        self
    }

    /// Rewrite paths starting with `from` so they start with `to`
    ///
    /// The table is shared with every clone of this switch, including
    /// clones already registered with a proxy.
    pub fn rewrite(&self, from: impl Into<String>, to: impl Into<String>) {
        self.rewrites.insert(from, to);
    }

    /// Remove the rewrite for `from`
    pub fn remove_rewrite(&self, from: &str) -> bool {
        self.rewrites.remove(from)
    }

    pub fn rewrites(&self) -> Vec<RewriteRule> {
        self.rewrites.rules()
    }

    pub fn target(&self) -> &TargetBase {
        &self.target
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute exactly one forwarding attempt against this switch's target
    ///
    /// The transfer's input cursor must be at offset 0 and its output
    /// accumulator empty. On a transport error no hook fires and nothing is
    /// returned but the error; if copying the body fails, the bytes read so
    /// far stay in the accumulator.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        inbound: &Parts,
        transfer: &mut Transfer,
    ) -> ProxyResult<UpstreamReply> {
        let uri = UrlResolver::resolve_target_uri(&self.target, &inbound.uri, &self.rewrites)?;
        let url = uri.to_string();
        let correlation_id = CorrelationId::generate();
        let remote_addr = inbound
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let mut request = Request::builder()
            .method(inbound.method.clone())
            .uri(uri.clone())
            .body(transfer.outbound_body())?;

        hooks::invoke(
            self.pre.as_ref(),
            HookPhase::Pre,
            &CallRecord {
                correlation_id,
                timestamp: Utc::now(),
                remote_addr,
                url: &url,
                path: uri.path(),
                method: &inbound.method,
                status: None,
                headers: &inbound.headers,
                body: transfer.captured(),
            },
        );

        let mut headers = inbound.headers.clone();
        headers.remove(HOST);
        *request.headers_mut() = headers;

        debug!(%correlation_id, method = %inbound.method, url = %url, "Forwarding to upstream");

        let exchange = async {
            let response = self.client.request(request).await?;
            let (parts, mut body) = response.into_parts();
            let out = transfer.output_mut();
            while let Some(frame) = body.frame().await {
                if let Ok(chunk) = frame?.into_data() {
                    out.extend_from_slice(&chunk);
                }
            }
            Ok::<_, ProxyError>(parts)
        };

        let deadline = async {
            if self.timeout.is_zero() {
                exchange.await
            } else {
                tokio::time::timeout(self.timeout, exchange)
                    .await
                    .map_err(|_| ProxyError::RequestTimeout(self.timeout))?
            }
        };

        let parts = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            outcome = deadline => outcome?,
        };

        hooks::invoke(
            self.post.as_ref(),
            HookPhase::Post,
            &CallRecord {
                correlation_id,
                timestamp: Utc::now(),
                remote_addr,
                url: &url,
                path: uri.path(),
                method: &inbound.method,
                status: Some(parts.status),
                headers: &parts.headers,
                body: transfer.output(),
            },
        );

        debug!(%correlation_id, status = parts.status.as_u16(), "Upstream call completed");

        Ok(UpstreamReply {
            status: parts.status,
            headers: parts.headers,
        })
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("target", &self.target.to_string())
            .field("rewrites", &self.rewrites.rules())
            .field("timeout", &self.timeout)
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .finish()
    }
}

fn build_client(timeout: Duration) -> UpstreamClient {
    let limit = (!timeout.is_zero()).then_some(timeout);

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(limit);
    http.set_keepalive(limit);

    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    let mut builder = Client::builder(TokioExecutor::new());
    builder.pool_timer(TokioTimer::new());
    if let Some(idle) = limit {
        builder.pool_idle_timeout(idle);
    }
    builder.build(https)
}
