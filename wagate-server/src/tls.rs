//! HTTPS material. Certificate and key arrive as base64-encoded PEM (config or
//! the `CERTIFICATE` / `SSLKEY` variables) and are decoded in memory. Anything
//! invalid degrades to plain HTTP with a warning.

use axum_server::tls_rustls::RustlsConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use wagate_core::config::TlsConfig;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Invalid base64 in {field}: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Invalid certificate or private key: {0}")]
    Material(#[from] std::io::Error),
}

/// Select ring as the process-wide rustls provider. Must run before any TLS
/// config is built; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Decode one base64 PEM blob. Embedded whitespace and newlines are ignored.
pub fn decode_pem(field: &'static str, encoded: &str) -> Result<Vec<u8>, TlsError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|source| TlsError::Base64 { field, source })
}

async fn build(cert_b64: &str, key_b64: &str) -> Result<RustlsConfig, TlsError> {
    let cert = decode_pem("certificate", cert_b64)?;
    let key = decode_pem("private_key", key_b64)?;
    Ok(RustlsConfig::from_pem(cert, key).await?)
}

/// `Some` only when both halves are configured and valid.
pub async fn load_tls(config: &TlsConfig) -> Option<RustlsConfig> {
    let (cert, key) = match (config.certificate.as_deref(), config.private_key.as_deref()) {
        (Some(c), Some(k)) if !c.trim().is_empty() && !k.trim().is_empty() => (c, k),
        (None, None) => return None,
        _ => {
            tracing::warn!("Only one of certificate/private key is set, serving plain HTTP only");
            return None;
        }
    };

    match build(cert, key).await {
        Ok(rustls) => Some(rustls),
        Err(e) => {
            tracing::warn!(error = %e, "TLS material rejected, serving plain HTTP only");
            None
        }
    }
}
