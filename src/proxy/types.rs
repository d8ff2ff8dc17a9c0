//! Type definitions for the proxy module

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ========== Constants ==========

/// Default timeout for both the inbound server and outbound switch calls
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default listen address when none is configured
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

/// Default number of idle transfers kept by the pool
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Default path when none is specified
pub const DEFAULT_PATH: &str = "/";

/// Scheme applied to targets configured without one
pub const DEFAULT_SCHEME: &str = "http";

// ========== Capacity Types ==========

/// Maximum number of idle transfers retained by the pool
#[nutype(
    derive(Clone, Copy, Debug, Display, PartialEq, Eq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |capacity: &usize| *capacity > 0),
)]
pub struct PoolCapacity(usize);

impl Default for PoolCapacity {
    fn default() -> Self {
        match Self::try_new(DEFAULT_POOL_CAPACITY) {
            Ok(capacity) => capacity,
            Err(_) => unreachable!("DEFAULT_POOL_CAPACITY is non-zero"),
        }
    }
}

// ========== Identifier Types ==========

/// Per-call correlation token handed to hooks
///
/// Uniqueness is best effort: it is meant for joining pre and post records
/// in a log sink, never for authorization.
#[nutype(derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, AsRef, From))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Produce a fresh, likely-unique token
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

// ========== Configuration ==========

/// Certificate and key files used to serve TLS
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: String,
    pub key: String,
}

impl TlsFiles {
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }
}

/// Proxy configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Address the listener binds to
    pub listen: String,
    /// Serve TLS with these files when present
    pub tls: Option<TlsFiles>,
    /// Uniform header-read, body-read and idle timeout for inbound connections
    pub timeout: Duration,
    /// Idle transfers kept by the buffer pool
    pub pool_capacity: PoolCapacity,
}

impl ProxyConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.tls = Some(TlsFiles::new(cert, key));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: PoolCapacity) -> Self {
        self.pool_capacity = capacity;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDRESS.to_string(),
            tls: None,
            timeout: DEFAULT_TIMEOUT,
            pool_capacity: PoolCapacity::default(),
        }
    }
}

// ========== Errors ==========

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid target URL: {0}")]
    InvalidTargetUrl(String),

    #[error("No primary switch configured")]
    NoPrimary,

    #[error("Request body could not be read: {0}")]
    BodyRead(#[from] axum::Error),

    #[error("Request timeout after {0:?}")]
    RequestTimeout(Duration),

    #[error("Proxy is shutting down")]
    Cancelled,

    #[error("Connection error: {0}")]
    Connection(#[from] hyper_util::client::legacy::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("TLS material error: {0}")]
    TlsMaterial(String),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
