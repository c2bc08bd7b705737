//! rustls configuration for mutually authenticated channels.
//!
//! Both sides present `cert_file`/`key_file` and verify the peer against `ca_file`
//! (or against `cert_file` itself for self-signed pairs).

use std::path::Path;
use std::sync::Arc;

use labkit::TlsFiles;
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::RemoteError;

/// Process default provider if one is installed, otherwise aws-lc-rs without
/// installing it globally.
fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn tls_error(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Tls {
        reason: e.to_string(),
    }
}

fn pem_error(path: &Path, e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Pem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// # Errors
/// Returns `RemoteError::Pem` if the file is unreadable or holds no certificate.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, RemoteError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| pem_error(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, e))?;
    if certs.is_empty() {
        return Err(pem_error(path, "no certificate found"));
    }
    Ok(certs)
}

/// # Errors
/// Returns `RemoteError::Pem` if the file is unreadable or holds no private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, RemoteError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| pem_error(path, e))
}

fn trust_store(path: &Path) -> Result<Arc<RootCertStore>, RemoteError> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
    if ignored > 0 {
        tracing::warn!(path = %path.display(), ignored, "Some trust anchors could not be parsed");
    }
    if added == 0 {
        return Err(pem_error(path, "no usable trust anchor"));
    }
    Ok(Arc::new(roots))
}

/// Server side: present our certificate and require a client certificate signed by the
/// trust anchor.
///
/// # Errors
/// Returns `RemoteError::Pem` or `RemoteError::Tls` on unusable material.
pub fn server_config(files: &TlsFiles) -> Result<Arc<ServerConfig>, RemoteError> {
    let provider = crypto_provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(
        trust_store(files.trust_anchor())?,
        Arc::clone(&provider),
    )
    .build()
    .map_err(tls_error)?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&files.cert_file)?, load_private_key(&files.key_file)?)
        .map_err(tls_error)?;
    Ok(Arc::new(config))
}

/// Client side: verify the server against the trust anchor and authenticate with our
/// own certificate.
///
/// # Errors
/// Returns `RemoteError::Pem` or `RemoteError::Tls` on unusable material.
pub fn client_config(files: &TlsFiles) -> Result<Arc<ClientConfig>, RemoteError> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_root_certificates(trust_store(files.trust_anchor())?)
        .with_client_auth_cert(load_certs(&files.cert_file)?, load_private_key(&files.key_file)?)
        .map_err(tls_error)?;
    Ok(Arc::new(config))
}
