//! Instrumentation hooks invoked around every outbound call
//!
//! A switch may carry a pre-hook, called before the upstream is contacted,
//! and a post-hook, called once the upstream body has been fully copied.
//! Both receive a [`CallRecord`] borrowing the request state; the record is
//! not meant to outlive the call.
//!
//! Hooks run inline on the request path and cannot fail the request. A
//! panicking hook is caught and logged.

use crate::proxy::types::CorrelationId;
use chrono::{DateTime, Utc};
use hyper::{HeaderMap, Method, StatusCode};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot of one outbound call, before or after it executes
#[derive(Clone, Debug)]
pub struct CallRecord<'a> {
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    pub remote_addr: Option<SocketAddr>,
    pub url: &'a str,
    pub path: &'a str,
    pub method: &'a Method,
    /// Upstream status; absent while the call has not run yet
    pub status: Option<StatusCode>,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

impl CallRecord<'_> {
    /// True once the record describes an upstream response
    pub fn is_response(&self) -> bool {
        !self.method.as_str().is_empty() && self.status.is_some()
    }
}

/// Callback receiving call records
pub type Hook = Arc<dyn Fn(&CallRecord<'_>) + Send + Sync>;

/// Which side of the outbound call a hook observes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

/// Run a hook, containing any panic it raises
pub(crate) fn invoke(hook: Option<&Hook>, phase: HookPhase, record: &CallRecord<'_>) {
    let Some(hook) = hook else {
        return;
    };

    if catch_unwind(AssertUnwindSafe(|| hook(record))).is_err() {
        warn!(
            correlation_id = %record.correlation_id,
            phase = phase.as_str(),
            url = record.url,
            "Hook panicked; ignoring"
        );
    }
}

/// Pre and post hooks that emit each record as a tracing event
pub fn tracing_hooks() -> (Hook, Hook) {
    let pre: Hook = Arc::new(|record: &CallRecord<'_>| {
        info!(
            correlation_id = %record.correlation_id,
            remote_addr = ?record.remote_addr,
            method = %record.method,
            url = record.url,
            path = record.path,
            body_size = record.body.len(),
            "Forwarding request"
        );
    });
    let post: Hook = Arc::new(|record: &CallRecord<'_>| {
        info!(
            correlation_id = %record.correlation_id,
            method = %record.method,
            url = record.url,
            status = record.status.map(|status| status.as_u16()).unwrap_or_default(),
            body_size = record.body.len(),
            "Upstream responded"
        );
    });
    (pre, post)
}
