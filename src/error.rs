use crate::proxy::types::ProxyError;
use thiserror::Error;

/// Switchproxy application error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid target '{url}': {source}")]
    InvalidTarget {
        url: String,
        #[source]
        source: ProxyError,
    },
}

impl Error {
    pub fn invalid_target(url: impl Into<String>, source: ProxyError) -> Self {
        Self::InvalidTarget {
            url: url.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
