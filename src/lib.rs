//! Warden Gateway - application gateway and web application firewall
//!
//! A TLS-capable reverse proxy that:
//! - Terminates HTTP(S) for one or more virtual hosts with SNI certificates
//! - Evaluates every request against WAF group policies, IP access lists,
//!   CC rate-limit policies, a 5-second shield and an OAuth gate
//! - Serves static content from an on-disk CDN cache with conditional-GET
//!   revalidation
//! - Forwards surviving requests to HTTP, FastCGI or static-file backends
//! - Synchronizes configuration from a primary node's store on replicas

pub mod access_log;
pub mod cc;
pub mod cdn_cache;
pub mod config;
pub mod error;
pub mod fastcgi;
pub mod ip_policy;
pub mod oauth;
pub mod pages;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod selector;
pub mod session;
pub mod shield;
pub mod tls;
pub mod waf;

// Re-export commonly used types
pub use cc::{CcEngine, CcPolicy, CcVerdict, PolicyAction};
pub use config::{GatewayConfig, GlobalSettings, NodeRole};
pub use error::{GatewayError, Result};
pub use ip_policy::{FirewallSink, IpPolicyTable, NftablesSink, NullSink};
pub use pipeline::{router, GatewayCore, GatewayState};
pub use proxy::{LogNotifier, OfflineNotifier, ProxyClient};
pub use registry::{ConfigStore, FileStore, MemoryStore, Registry};
pub use session::{Session, SessionStore};
pub use waf::{CheckPoint, GroupPolicy, WafMatcher};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
