//! Forwarding proxy with fan-out mirroring
//!
//! Every inbound request is read into a pooled [`Transfer`], forwarded to the
//! primary [`Switch`] whose reply goes back to the client, then replayed to
//! each secondary switch with the secondary outcomes discarded.

pub mod error_response;
pub mod hooks;
pub mod idle;
pub mod middleware;
pub mod rewrite;
pub mod service;
pub mod switch;
pub mod tls;
pub mod transfer;
pub mod types;
pub mod url_resolver;

#[cfg(test)]
pub(crate) mod test_utils;

#[cfg(test)]
mod tests;


pub use hooks::{tracing_hooks, CallRecord, Hook};
pub use rewrite::{RewriteRule, RewriteTable};
pub use service::{Proxy, Routes};
pub use switch::{Switch, UpstreamReply};
pub use transfer::{PooledTransfer, Transfer, TransferPool};
pub use types::{CorrelationId, PoolCapacity, ProxyConfig, ProxyError, ProxyResult, TlsFiles};
