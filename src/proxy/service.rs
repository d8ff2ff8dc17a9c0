//! Main proxy service implementation
//!
//! The `Proxy` is the front door. It owns the transfer pool, the routing
//! table (one optional primary switch and an ordered list of secondaries),
//! and the cancellation scope every outbound call runs under.
//!
//! ## Request Lifecycle
//!
//! 1. Check a transfer out of the pool and read the full body into it
//! 2. Forward through the primary and answer the client with its reply
//!    (503 when no primary is configured, 500 on any failure)
//! 3. Replay the captured request to each secondary, in order, once the
//!    client is done with the response body; their outcomes are discarded
//! 4. Return the transfer to the pool
//!
//! A transfer stays checked out until its last secondary finishes, and the
//! pool hands out at most `pool_capacity` of them, so slow secondaries slow
//! down admission instead of piling up background work.
//!
//! ## Service Lifecycle
//!
//! ```rust,ignore
//! use switchproxy::proxy::{Proxy, ProxyConfig, Switch};
//!
//! let proxy = Proxy::new(ProxyConfig::new("0.0.0.0:8080"));
//! proxy.primary(Switch::new("http://primary.internal")?);
//! proxy.add_secondary([Switch::new("http://analytics.internal")?]);
//!
//! // Blocks until `proxy.stop()` is called from elsewhere
//! proxy.start().await?;
//! ```

use crate::proxy::idle::IdleTimeout;
use crate::proxy::middleware::logging_middleware;
use crate::proxy::switch::{Switch, UpstreamReply};
use crate::proxy::tls::create_tls_acceptor;
use crate::proxy::transfer::{PooledTransfer, TransferPool};
use crate::proxy::types::*;
use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::from_fn,
    response::Response,
    Router,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::http::request::Parts;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

/// Pause after a transient accept failure before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-process and system-wide descriptor limits (EMFILE, ENFILE)
const FD_LIMIT_ERRNOS: [i32; 2] = [24, 23];

/// Immutable routing snapshot
///
/// Reconfiguration builds a new snapshot and swaps it in atomically, so a
/// request always sees either the old or the new table, never a mix.
#[derive(Clone, Debug, Default)]
pub struct Routes {
    pub primary: Option<Switch>,
    pub secondaries: Vec<Switch>,
}

struct ProxyInner {
    config: ProxyConfig,
    routes: ArcSwap<Routes>,
    pool: Arc<TransferPool>,
    cancel: CancellationToken,
}

/// Forwarding proxy with fan-out mirroring
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// Create a new proxy with its own cancellation scope
    pub fn new(config: ProxyConfig) -> Self {
        Self::from_token(config, CancellationToken::new())
    }

    /// Create a proxy that also stops when `parent` is cancelled
    pub fn with_cancellation(config: ProxyConfig, parent: &CancellationToken) -> Self {
        Self::from_token(config, parent.child_token())
    }

    fn from_token(config: ProxyConfig, cancel: CancellationToken) -> Self {
        let pool = Arc::new(TransferPool::new(config.pool_capacity));
        Self {
            inner: Arc::new(ProxyInner {
                config,
                routes: ArcSwap::from_pointee(Routes::default()),
                pool,
                cancel,
            }),
        }
    }

    /// Set the primary switch whose responses are returned to clients
    pub fn primary(&self, switch: Switch) {
        self.inner.routes.rcu(|routes| Routes {
            primary: Some(switch.clone()),
            secondaries: routes.secondaries.clone(),
        });
    }

    /// Append mirror switches; they are replayed in the order added
    pub fn add_secondary(&self, switches: impl IntoIterator<Item = Switch>) {
        let added: Vec<Switch> = switches.into_iter().collect();
        if added.is_empty() {
            return;
        }
        self.inner.routes.rcu(|routes| {
            let mut secondaries = routes.secondaries.clone();
            secondaries.extend(added.iter().cloned());
            Routes {
                primary: routes.primary.clone(),
                secondaries,
            }
        });
    }

    /// Current routing snapshot
    pub fn routes(&self) -> Arc<Routes> {
        self.inner.routes.load_full()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Pool backing every in-flight request
    pub fn pool(&self) -> &Arc<TransferPool> {
        &self.inner.pool
    }

    /// Scope cancelled by [`Proxy::stop`]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Catch-all router for every method and path
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(forward_handler)
            .with_state(Arc::clone(&self.inner))
            .layer(from_fn(logging_middleware))
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(&self) -> ProxyResult<()> {
        let listener = TcpListener::bind(&self.inner.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until stopped
    ///
    /// Returns the listener's error if accepting fails for a reason other
    /// than a single bad connection or a momentary resource shortage. The
    /// proxy is stopped when this returns, whatever the reason.
    pub async fn serve(&self, listener: TcpListener) -> ProxyResult<()> {
        let result = self.accept_loop(listener).await;
        self.stop();
        result
    }

    /// Cancel the scope, stop accepting and drop open connections
    ///
    /// Requests still waiting for a transfer fail. Calling this more than
    /// once has no further effect.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("Stopping proxy");
        }
        self.inner.cancel.cancel();
        self.inner.pool.close();
    }

    async fn accept_loop(&self, listener: TcpListener) -> ProxyResult<()> {
        let tls = match &self.inner.config.tls {
            Some(files) => Some(create_tls_acceptor(&files.cert, &files.key)?),
            None => None,
        };

        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            tls = tls.is_some(),
            "Proxy listening"
        );

        let router = self.router();
        let cancel = self.inner.cancel.clone();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote_addr) = match accepted {
                Ok(connection) => connection,
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(error = %err, "Failed to accept connection");
                    // Brief pause so a persistent condition does not spin the loop
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
                Err(err) => {
                    error!(address = %local_addr, error = %err, "Listener failed");
                    return Err(err.into());
                }
            };

            let router = router.clone();
            let cancel = cancel.clone();
            let tls = tls.clone();
            let timeout = self.inner.config.timeout;
            let stream = IdleTimeout::new(stream, timeout);

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => {
                        match with_deadline(timeout, acceptor.accept(stream)).await {
                            Some(Ok(tls_stream)) => {
                                serve_connection(tls_stream, remote_addr, router, cancel, timeout)
                                    .await
                            }
                            Some(Err(err)) => {
                                debug!(%remote_addr, error = %err, "TLS handshake failed");
                            }
                            None => {
                                debug!(%remote_addr, "TLS handshake timed out");
                            }
                        }
                    }
                    None => serve_connection(stream, remote_addr, router, cancel, timeout).await,
                }
            });
        }

        info!(address = %local_addr, "Proxy stopped accepting connections");
        Ok(())
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("config", &self.inner.config)
            .field("routes", &self.inner.routes.load())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn serve_connection<S>(
    stream: S,
    remote_addr: SocketAddr,
    router: Router,
    cancel: CancellationToken,
    timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote_addr));
        router.clone().oneshot(request.map(Body::new))
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().timer(TokioTimer::new());
    builder.http2().timer(TokioTimer::new());
    if !timeout.is_zero() {
        builder.http1().header_read_timeout(timeout);
        builder
            .http2()
            .keep_alive_interval(timeout)
            .keep_alive_timeout(timeout);
    }

    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::select! {
        result = connection => {
            if let Err(err) = result {
                debug!(%remote_addr, error = %err, "Connection closed with error");
            }
        }
        _ = cancel.cancelled() => {
            debug!(%remote_addr, "Dropping connection on shutdown");
        }
    }
}

/// Axum handler for every proxied request
async fn forward_handler(
    State(proxy): State<Arc<ProxyInner>>,
    request: Request,
) -> Result<Response, ProxyError> {
    proxy.handle(request).await
}

impl ProxyInner {
    async fn handle(&self, request: Request) -> Result<Response, ProxyError> {
        let mut transfer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ProxyError::Cancelled),
            acquired = self.pool.acquire() => acquired?,
        };
        let (parts, body) = request.into_parts();

        with_deadline(self.config.timeout, transfer.ingest(body))
            .await
            .unwrap_or(Err(ProxyError::RequestTimeout(self.config.timeout)))
            .inspect_err(|err| warn!(error = %err, "Failed to read request body"))?;

        let routes = self.routes.load_full();
        let (delivered, response_done) = oneshot::channel();
        let outcome = match &routes.primary {
            Some(primary) => match primary.process(&self.cancel, &parts, &mut transfer).await {
                Ok(reply) => Ok(relay(reply, transfer.output(), delivered)),
                Err(err) => {
                    warn!(
                        target_url = %primary.target(),
                        error = %err,
                        "Primary upstream call failed"
                    );
                    Err(err)
                }
            },
            None => Err(ProxyError::NoPrimary),
        };

        if !routes.secondaries.is_empty() {
            let cancel = self.cancel.clone();
            tokio::spawn(mirror(routes, parts, transfer, response_done, cancel));
        }

        outcome
    }
}

/// Accept failures that concern one connection or a momentary shortage
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) || err
        .raw_os_error()
        .is_some_and(|code| FD_LIMIT_ERRNOS.contains(&code))
}

/// Await `future` for at most `timeout`; a zero timeout waits indefinitely
async fn with_deadline<F: std::future::Future>(
    timeout: Duration,
    future: F,
) -> Option<F::Output> {
    if timeout.is_zero() {
        Some(future.await)
    } else {
        tokio::time::timeout(timeout, future).await.ok()
    }
}

fn relay(reply: UpstreamReply, body: &[u8], delivered: oneshot::Sender<()>) -> Response {
    let body = RelayBody {
        body: Full::new(Bytes::copy_from_slice(body)),
        _delivered: delivered,
    };
    let mut response = Response::new(Body::new(body));
    *response.status_mut() = reply.status;
    *response.headers_mut() = reply.headers;
    response
}

/// Primary reply body; dropping it tells the mirror the client is served
struct RelayBody {
    body: Full<Bytes>,
    _delivered: oneshot::Sender<()>,
}

impl HttpBody for RelayBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        Pin::new(&mut self.body).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.body.size_hint()
    }
}

/// Replay the captured request to every secondary, sequentially
///
/// Starts once the response body has been written out or abandoned.
/// Outcomes are discarded. The transfer goes back to the pool when this
/// returns.
async fn mirror(
    routes: Arc<Routes>,
    parts: Parts,
    mut transfer: PooledTransfer,
    response_done: oneshot::Receiver<()>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = response_done => {}
        _ = cancel.cancelled() => {}
    }

    for secondary in &routes.secondaries {
        transfer.reset_output();
        transfer.rewind();
        if let Err(err) = secondary.process(&cancel, &parts, &mut transfer).await {
            debug!(
                target_url = %secondary.target(),
                error = %err,
                "Secondary upstream call failed"
            );
        }
    }
}
