//! Switchproxy - an HTTP forwarding proxy with fan-out mirroring
//!
//! Each inbound request is forwarded to a primary upstream whose response
//! is returned to the client, and replayed to any number of secondary
//! upstreams whose responses are discarded.

pub mod application;
pub mod config;
pub mod error;
pub mod proxy;

pub use application::Application;
pub use error::{Error, Result};
pub use proxy::{Proxy, ProxyConfig, Switch};
