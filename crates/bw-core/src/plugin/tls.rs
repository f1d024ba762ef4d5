//! TLS server configuration for terminating plugins

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{BurrowError, Result};

/// Names the generated identity is issued for
const SELF_SIGNED_NAMES: &[&str] = &["localhost", "burrow.local"];

/// Build a server config from a PEM certificate chain and private key
pub fn server_config_from_pem(crt_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(crt_path)
        .map_err(|e| {
            BurrowError::InvalidTls(format!("Failed to read {}: {}", crt_path.display(), e))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            BurrowError::InvalidTls(format!("Bad certificate in {}: {}", crt_path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(BurrowError::InvalidTls(format!(
            "No certificate found in {}",
            crt_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        BurrowError::InvalidTls(format!("Bad private key in {}: {}", key_path.display(), e))
    })?;

    info!("Loaded TLS certificate from {}", crt_path.display());
    build(certs, key)
}

/// Build a server config around a freshly generated, self-signed identity.
///
/// Nothing can verify this identity. It is only meant for setups where the
/// tunnel below already authenticated the peer.
pub fn self_signed_server_config() -> Result<Arc<ServerConfig>> {
    let names: Vec<String> = SELF_SIGNED_NAMES.iter().map(|s| s.to_string()).collect();
    let rcgen::CertifiedKey { cert, signing_key } = rcgen::generate_simple_self_signed(names)
        .map_err(|e| BurrowError::InvalidTls(format!("Failed to generate certificate: {}", e)))?;

    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

    warn!("No certificate configured, serving an unverified self-signed TLS identity");
    build(vec![cert_der], key_der)
}

fn build(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
