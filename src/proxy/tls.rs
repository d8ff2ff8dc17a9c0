//! TLS termination for the inbound listener

use crate::proxy::types::{ProxyError, ProxyResult};
use rustls::crypto::ring::{cipher_suite, default_provider};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// ALPN identifiers offered to clients, most preferred first
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// AEAD-only suites with forward secrecy; TLS 1.2 is the floor
fn server_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        ..default_provider()
    }
}

/// Create a TLS acceptor from PEM certificate chain and private key files
pub fn create_tls_acceptor(cert_path: &str, key_path: &str) -> ProxyResult<TlsAcceptor> {
    let cert_file = File::open(cert_path).map_err(|e| {
        ProxyError::TlsMaterial(format!("failed to open certificate file '{cert_path}': {e}"))
    })?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| {
                ProxyError::TlsMaterial(format!("failed to parse certificate file: {e}"))
            })?;

    if certs.is_empty() {
        return Err(ProxyError::TlsMaterial(format!(
            "no certificates found in '{cert_path}'"
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        ProxyError::TlsMaterial(format!("failed to open private key file '{key_path}': {e}"))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ProxyError::TlsMaterial(format!("failed to parse private key file: {e}")))?
        .ok_or_else(|| ProxyError::TlsMaterial(format!("no private key found in '{key_path}'")))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(server_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|proto| proto.to_vec()).collect();

    Ok(TlsAcceptor::from(Arc::new(config)))
}
