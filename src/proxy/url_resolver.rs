//! Target URL resolution and path handling for proxy requests

use crate::proxy::rewrite::RewriteTable;
use crate::proxy::types::*;
use hyper::http::uri::{Authority, Scheme};
use hyper::Uri;

/// Scheme and authority every request of a switch is redirected to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetBase {
    scheme: Scheme,
    authority: Authority,
}

impl TargetBase {
    /// Parse a configured target, defaulting to plain HTTP when no scheme is given
    ///
    /// Only the scheme and authority are kept; the path of every outbound
    /// request comes from the inbound request.
    pub fn parse(target: &str) -> ProxyResult<Self> {
        let target = target.trim();
        let with_scheme = if target.contains("://") {
            target.to_string()
        } else {
            format!("{DEFAULT_SCHEME}://{}", target.trim_start_matches('/'))
        };

        let uri: Uri = with_scheme
            .parse()
            .map_err(|e| ProxyError::InvalidTargetUrl(format!("'{target}': {e}")))?;

        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidTargetUrl(format!("'{target}': missing scheme")))?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(ProxyError::InvalidTargetUrl(format!(
                "'{target}': unsupported scheme '{scheme}'"
            )));
        }

        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidTargetUrl(format!("'{target}': missing host")))?;

        Ok(Self { scheme, authority })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

impl std::fmt::Display for TargetBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Strategy for composing outbound URIs
pub struct UrlResolver;

impl UrlResolver {
    /// Resolve the final URI for the outgoing request
    ///
    /// Scheme and host come from the target; path and query come from the
    /// inbound request, with the path passed through the rewrite table. An
    /// empty query (`/path?`) is kept as is.
    pub fn resolve_target_uri(
        target: &TargetBase,
        original_uri: &Uri,
        rewrites: &RewriteTable,
    ) -> ProxyResult<Uri> {
        let original_path = match original_uri.path() {
            "" => DEFAULT_PATH,
            path => path,
        };
        let path = rewrites.apply(original_path);

        let path_and_query = match original_uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };

        Uri::builder()
            .scheme(target.scheme.clone())
            .authority(target.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::InvalidTargetUrl(format!("{target}: {e}")))
    }
}
