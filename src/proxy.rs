//! Backend forwarding
//!
//! Plain-HTTP backends go through a pooled hyper client (30s idle). HTTPS
//! backends are dialed per request so the TLS handshake can carry the
//! application's public domain as SNI while connecting to the destination
//! address; backend certificates are not verified. A dial failure marks the
//! destination offline and fires the offline notifier once per transition.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, Method};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::registry::Destination;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives backend-offline and certificate-expiry events. SMTP delivery is
/// an external collaborator; the default implementation just logs.
pub trait OfflineNotifier: Send + Sync {
    fn notify_offline(&self, app_name: &str, destination: &str);
    fn notify_expiring_certs(&self, expiring: &[(String, i64)]);
}

/// Log-only notifier
pub struct LogNotifier;

impl OfflineNotifier for LogNotifier {
    fn notify_offline(&self, app_name: &str, destination: &str) {
        warn!(app = %app_name, destination = %destination, "backend server offline");
    }

    fn notify_expiring_certs(&self, expiring: &[(String, i64)]) {
        for (common_name, days) in expiring {
            warn!(
                cert = %common_name,
                remain_days = days,
                "certificate is about to expire"
            );
        }
    }
}

/// A request ready to forward to a backend
pub struct BackendRequest {
    pub method: Method,
    /// Origin-form target: path plus optional query
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Public domain of the application; Host header and backend SNI
    pub host: String,
}

/// Backend forwarder shared by all requests
pub struct ProxyClient {
    http_client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        let http_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(64)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build_http();
        Self { http_client }
    }

    /// Forward a request to `dest`. On dial failure the destination is
    /// marked offline and `notifier` fires once for the transition.
    pub async fn forward(
        &self,
        dest: &Destination,
        https: bool,
        req: BackendRequest,
        app_name: &str,
        notifier: &dyn OfflineNotifier,
        now: i64,
    ) -> Result<hyper::Response<Incoming>> {
        dest.check_time.store(now, Ordering::Relaxed);
        let result = if https {
            self.forward_tls(dest, req).await
        } else {
            self.forward_plain(dest, req).await
        };
        match result {
            Ok(response) => {
                dest.online.store(true, Ordering::Relaxed);
                Ok(response)
            }
            Err(e) => {
                // swap() detects the online→offline transition so the
                // notifier fires once, not per failing request.
                if dest.online.swap(false, Ordering::AcqRel) {
                    notifier.notify_offline(app_name, &dest.destination);
                }
                Err(e)
            }
        }
    }

    async fn forward_plain(
        &self,
        dest: &Destination,
        req: BackendRequest,
    ) -> Result<hyper::Response<Incoming>> {
        let uri = format!("http://{}{}", dest.destination, req.path_and_query);
        let mut builder = Request::builder().method(req.method).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = req.headers;
            if let Ok(host) = HeaderValue::from_str(&req.host) {
                headers.insert(header::HOST, host);
            }
        }
        let request = builder
            .body(Full::new(req.body))
            .map_err(|e| GatewayError::Upstream(format!("request build: {}", e)))?;

        self.http_client.request(request).await.map_err(|e| {
            if e.is_connect() {
                GatewayError::Dial {
                    destination: dest.destination.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e),
                }
            } else {
                GatewayError::Upstream(e.to_string())
            }
        })
    }

    async fn forward_tls(
        &self,
        dest: &Destination,
        req: BackendRequest,
    ) -> Result<hyper::Response<Incoming>> {
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&dest.destination))
            .await
            .map_err(|_| GatewayError::Dial {
                destination: dest.destination.clone(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"),
            })?
            .map_err(|e| GatewayError::Dial {
                destination: dest.destination.clone(),
                source: e,
            })?;

        let server_name = ServerName::try_from(req.host.clone()).map_err(|e| {
            GatewayError::Upstream(format!("invalid SNI host {}: {}", req.host, e))
        })?;
        let connector = TlsConnector::from(skip_verify_client_config());
        let tls = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| GatewayError::Dial {
                destination: dest.destination.clone(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timeout"),
            })?
            .map_err(|e| GatewayError::Dial {
                destination: dest.destination.clone(),
                source: e,
            })?;

        let negotiated_h2 = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(|alpn| alpn == b"h2")
            .unwrap_or(false);
        debug!(
            destination = %dest.destination,
            h2 = negotiated_h2,
            "backend TLS established"
        );

        if negotiated_h2 {
            let (mut sender, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
                    .await
                    .map_err(|e| GatewayError::Upstream(format!("h2 handshake: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("backend h2 connection ended: {}", e);
                }
            });

            let uri = format!("https://{}{}", req.host, req.path_and_query);
            let mut builder = Request::builder().method(req.method).uri(&uri);
            if let Some(headers) = builder.headers_mut() {
                *headers = req.headers;
                headers.remove(header::HOST);
            }
            let request = builder
                .body(Full::new(req.body))
                .map_err(|e| GatewayError::Upstream(format!("request build: {}", e)))?;
            sender
                .send_request(request)
                .await
                .map_err(|e| GatewayError::Upstream(e.to_string()))
        } else {
            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
                .await
                .map_err(|e| GatewayError::Upstream(format!("h1 handshake: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("backend connection ended: {}", e);
                }
            });

            let mut builder = Request::builder()
                .method(req.method)
                .uri(&req.path_and_query);
            if let Some(headers) = builder.headers_mut() {
                *headers = req.headers;
                if let Ok(host) = HeaderValue::from_str(&req.host) {
                    headers.insert(header::HOST, host);
                }
            }
            let request = builder
                .body(Full::new(req.body))
                .map_err(|e| GatewayError::Upstream(format!("request build: {}", e)))?;
            sender
                .send_request(request)
                .await
                .map_err(|e| GatewayError::Upstream(e.to_string()))
        }
    }
}

/// Headers that must not cross the proxy boundary
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Copy of `headers` without hop-by-hop entries
pub fn strip_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Backend TLS: no certificate verification, SNI carries the public domain,
/// ALPN offers h2 then http/1.1, TLS 1.2 minimum.
fn skip_verify_client_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut config = rustls::ClientConfig::builder_with_protocol_versions(&[
                &rustls::version::TLS13,
                &rustls::version::TLS12,
            ])
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
            config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
            Arc::new(config)
        })
        .clone()
}

/// Accepts any backend certificate; the backends are inside the trust
/// boundary and often carry self-signed or mismatched certificates.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "a.example.com".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());
        headers.insert("x-custom", "kept".parse().unwrap());
        headers.insert("accept", "text/html".parse().unwrap());

        let stripped = strip_hop_headers(&headers);
        assert!(stripped.get("host").is_none());
        assert!(stripped.get("connection").is_none());
        assert!(stripped.get("upgrade").is_none());
        assert_eq!(stripped.get("x-custom").unwrap(), "kept");
        assert_eq!(stripped.get("accept").unwrap(), "text/html");
    }
}
