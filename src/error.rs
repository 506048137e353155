//! Unified error types for the gateway core

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Certificate store error: {0}")]
    CertStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config fetch failed: {0}")]
    ConfigFetch(String),

    #[error("Backend dial failed for {destination}: {source}")]
    Dial {
        destination: String,
        source: std::io::Error,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("OAuth provider not supported: {0}")]
    OAuthProvider(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
