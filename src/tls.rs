//! TLS termination with SNI certificate selection from the config registry
//!
//! Certificates live in the registry snapshot as precompiled
//! `rustls::sign::CertifiedKey`s; the resolver looks the SNI host up in the
//! domain map on every handshake, so certificate changes take effect with the
//! next snapshot swap and no listener restart.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::registry::Registry;

/// Build signing material from PEM text. Failures here are fatal at boot and
/// logged-and-skipped on reload.
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::CertStore(format!("failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::CertStore(
            "no certificates found in PEM".to_string(),
        ));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| GatewayError::CertStore(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| GatewayError::CertStore("no private key found in PEM".to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| GatewayError::CertStore(format!("unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// SNI resolver backed by the registry's domain map
pub struct SniCertResolver {
    registry: Arc<Registry>,
}

impl SniCertResolver {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        match self.registry.lookup_domain(server_name) {
            Some(relation) => relation.cert.map(|cert| cert.certified.clone()),
            None => {
                debug!(sni = %server_name, "no certificate for SNI host");
                None
            }
        }
    }
}

/// Server config for the TLS listener: SNI resolver, h2 + http/1.1 ALPN
pub fn server_config(registry: Arc<Registry>) -> rustls::ServerConfig {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(registry)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_pem_rejected() {
        assert!(certified_key_from_pem("not a cert", "not a key").is_err());
    }

    #[test]
    fn test_empty_pem_rejected() {
        let err = certified_key_from_pem("", "").unwrap_err();
        assert!(matches!(err, GatewayError::CertStore(_)));
    }
}
