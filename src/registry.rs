//! Config registry: atomically swapped snapshot of domains, applications and
//! certificates, refreshed from a [`ConfigStore`]
//!
//! The registry is the only configuration surface the request pipeline sees.
//! A primary node's store is the authoritative DAL; replicas are handed a
//! store that proxies the RPC channel. Both are polled on their LastModified
//! counters and the snapshot is replaced atomically, so readers never block a
//! reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::cc::{CcEngine, CcPolicy};
use crate::config::GlobalSettings;
use crate::error::{GatewayError, Result};
use crate::ip_policy::{IpPolicyEntry, IpPolicyTable};
use crate::tls::certified_key_from_pem;
use crate::waf::{GroupPolicy, Vulnerability, WafMatcher};

/// How the client IP is derived for an application
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientIpMethod {
    #[default]
    RemoteAddr,
    XForwardedFor,
    XRealIp,
    RealIp,
}

/// Backend route type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    HttpProxy,
    Static,
    FastCgi,
}

// ═══════════════════════════════════════════════════════════════
// Store documents (wire/disk form)
// ═══════════════════════════════════════════════════════════════

/// Destination row as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationDoc {
    pub id: i64,
    pub route_type: RouteType,
    /// Request path prefix this destination serves
    pub request_route: String,
    /// Backend path prefix (HTTP proxy) or filesystem root (static/FastCGI)
    pub backend_route: String,
    /// host:port, or default document for static routes
    pub destination: String,
}

/// Application row as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDoc {
    pub id: i64,
    pub name: String,
    /// Scheme used towards the backend: "http" or "https"
    pub internal_scheme: String,
    #[serde(default)]
    pub client_ip_method: ClientIpMethod,
    #[serde(default)]
    pub redirect_https: bool,
    #[serde(default)]
    pub waf_enabled: bool,
    #[serde(default)]
    pub shield_enabled: bool,
    #[serde(default)]
    pub oauth_required: bool,
    #[serde(default = "default_session_seconds")]
    pub session_seconds: i64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub destinations: Vec<DestinationDoc>,
}

fn default_session_seconds() -> i64 {
    7200
}

/// Domain row as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainDoc {
    pub id: i64,
    pub name: String,
    pub app_id: i64,
    #[serde(default)]
    pub cert_id: i64,
    #[serde(default)]
    pub redirect: bool,
    #[serde(default)]
    pub location: String,
}

/// Certificate row as stored (PEM text)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertDoc {
    pub id: i64,
    pub common_name: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// Seconds since epoch
    #[serde(default)]
    pub expire_time: i64,
}

/// Backend portion of the store document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendDoc {
    #[serde(default)]
    pub applications: Vec<ApplicationDoc>,
    #[serde(default)]
    pub domains: Vec<DomainDoc>,
    #[serde(default)]
    pub certs: Vec<CertDoc>,
}

/// Firewall portion of the store document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallDoc {
    #[serde(default)]
    pub cc_policies: Vec<CcPolicy>,
    #[serde(default)]
    pub group_policies: Vec<GroupPolicy>,
    #[serde(default)]
    pub ip_policies: Vec<IpPolicyEntry>,
    #[serde(default)]
    pub vulns: Vec<Vulnerability>,
}

/// Full store document (JSON file form used by [`FileStore`])
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDoc {
    #[serde(default)]
    pub backend_last_modified: i64,
    #[serde(default)]
    pub firewall_last_modified: i64,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub backend: BackendDoc,
    #[serde(default)]
    pub firewall: FirewallDoc,
}

// ═══════════════════════════════════════════════════════════════
// Runtime snapshot
// ═══════════════════════════════════════════════════════════════

/// A backend route destination. `online` and `check_time` are written by the
/// dial path only; concurrent readers accept stale values.
#[derive(Debug)]
pub struct Destination {
    pub id: i64,
    pub route_type: RouteType,
    pub request_route: String,
    pub backend_route: String,
    pub destination: String,
    pub online: AtomicBool,
    pub check_time: AtomicI64,
}

impl Destination {
    fn from_doc(doc: &DestinationDoc) -> Self {
        Self {
            id: doc.id,
            route_type: doc.route_type,
            request_route: doc.request_route.clone(),
            backend_route: doc.backend_route.clone(),
            destination: doc.destination.clone(),
            online: AtomicBool::new(true),
            check_time: AtomicI64::new(0),
        }
    }

    pub fn mark_offline(&self, now: i64) {
        self.online.store(false, Ordering::Relaxed);
        self.check_time.store(now, Ordering::Relaxed);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}

/// A protected application
#[derive(Debug)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub internal_scheme: String,
    pub client_ip_method: ClientIpMethod,
    pub redirect_https: bool,
    pub waf_enabled: bool,
    pub shield_enabled: bool,
    pub oauth_required: bool,
    pub session_seconds: i64,
    pub owner: String,
    pub destinations: Vec<Arc<Destination>>,
    /// Round-robin cursor for the route selector
    pub rr_cursor: AtomicUsize,
}

impl Application {
    fn from_doc(doc: &ApplicationDoc) -> Self {
        Self {
            id: doc.id,
            name: doc.name.clone(),
            internal_scheme: doc.internal_scheme.clone(),
            client_ip_method: doc.client_ip_method,
            redirect_https: doc.redirect_https,
            waf_enabled: doc.waf_enabled,
            shield_enabled: doc.shield_enabled,
            oauth_required: doc.oauth_required,
            session_seconds: doc.session_seconds,
            owner: doc.owner.clone(),
            destinations: doc
                .destinations
                .iter()
                .map(|d| Arc::new(Destination::from_doc(d)))
                .collect(),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn backend_https(&self) -> bool {
        self.internal_scheme == "https"
    }
}

/// Loaded certificate with its precompiled rustls signing material
pub struct CertEntry {
    pub id: i64,
    pub common_name: String,
    pub expire_time: i64,
    pub certified: Arc<rustls::sign::CertifiedKey>,
}

impl std::fmt::Debug for CertEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertEntry")
            .field("id", &self.id)
            .field("common_name", &self.common_name)
            .field("expire_time", &self.expire_time)
            .finish()
    }
}

/// Hot-path lookup value: everything the pipeline needs for one host name
#[derive(Debug, Clone)]
pub struct DomainRelation {
    pub app: Arc<Application>,
    pub cert: Option<Arc<CertEntry>>,
    pub redirect: bool,
    pub location: String,
}

/// One immutable view of the backend configuration
#[derive(Debug, Default)]
pub struct Snapshot {
    pub apps: HashMap<i64, Arc<Application>>,
    pub domain_map: HashMap<String, DomainRelation>,
    pub certs: Vec<Arc<CertEntry>>,
}

impl Snapshot {
    fn build(doc: &BackendDoc) -> Result<Self> {
        let mut certs = Vec::with_capacity(doc.certs.len());
        let mut certs_by_id = HashMap::new();
        for cert_doc in &doc.certs {
            let certified = certified_key_from_pem(&cert_doc.cert_pem, &cert_doc.key_pem)?;
            let entry = Arc::new(CertEntry {
                id: cert_doc.id,
                common_name: cert_doc.common_name.clone(),
                expire_time: cert_doc.expire_time,
                certified: Arc::new(certified),
            });
            certs_by_id.insert(cert_doc.id, entry.clone());
            certs.push(entry);
        }

        let mut apps = HashMap::with_capacity(doc.applications.len());
        for app_doc in &doc.applications {
            apps.insert(app_doc.id, Arc::new(Application::from_doc(app_doc)));
        }

        let mut domain_map = HashMap::with_capacity(doc.domains.len());
        for domain in &doc.domains {
            let app = match apps.get(&domain.app_id) {
                Some(app) => app.clone(),
                None => {
                    error!(
                        domain = %domain.name,
                        app_id = domain.app_id,
                        "domain references unknown application, skipping"
                    );
                    continue;
                }
            };
            domain_map.insert(
                domain.name.clone(),
                DomainRelation {
                    app,
                    cert: certs_by_id.get(&domain.cert_id).cloned(),
                    redirect: domain.redirect,
                    location: domain.location.clone(),
                },
            );
        }

        Ok(Self {
            apps,
            domain_map,
            certs,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
// Config store
// ═══════════════════════════════════════════════════════════════

/// Source of authoritative configuration. The primary's implementation wraps
/// the DAL; replicas wrap the RPC channel. Never called on the hot path.
pub trait ConfigStore: Send + Sync {
    fn backend_last_modified(&self) -> Result<i64>;
    fn firewall_last_modified(&self) -> Result<i64>;
    fn fetch_settings(&self) -> Result<GlobalSettings>;
    fn fetch_backend(&self) -> Result<BackendDoc>;
    fn fetch_firewall(&self) -> Result<FirewallDoc>;
}

/// JSON-file-backed store for standalone deployments and tests
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<StoreDoc> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            GatewayError::ConfigFetch(format!("read {:?}: {}", self.path, e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::ConfigFetch(format!("parse {:?}: {}", self.path, e)))
    }
}

impl ConfigStore for FileStore {
    fn backend_last_modified(&self) -> Result<i64> {
        Ok(self.read()?.backend_last_modified)
    }

    fn firewall_last_modified(&self) -> Result<i64> {
        Ok(self.read()?.firewall_last_modified)
    }

    fn fetch_settings(&self) -> Result<GlobalSettings> {
        Ok(self.read()?.settings)
    }

    fn fetch_backend(&self) -> Result<BackendDoc> {
        Ok(self.read()?.backend)
    }

    fn fetch_firewall(&self) -> Result<FirewallDoc> {
        Ok(self.read()?.firewall)
    }
}

/// In-memory store, used by tests to mutate configuration mid-run
#[derive(Default)]
pub struct MemoryStore {
    doc: RwLock<StoreDoc>,
}

impl MemoryStore {
    pub fn new(doc: StoreDoc) -> Self {
        Self {
            doc: RwLock::new(doc),
        }
    }

    /// Replace the backend document, bumping its LastModified counter
    pub fn set_backend(&self, backend: BackendDoc) {
        let mut doc = self.doc.write();
        doc.backend = backend;
        doc.backend_last_modified += 1;
    }

    /// Replace the firewall document, bumping its LastModified counter
    pub fn set_firewall(&self, firewall: FirewallDoc) {
        let mut doc = self.doc.write();
        doc.firewall = firewall;
        doc.firewall_last_modified += 1;
    }

    pub fn set_settings(&self, settings: GlobalSettings) {
        self.doc.write().settings = settings;
    }
}

impl ConfigStore for MemoryStore {
    fn backend_last_modified(&self) -> Result<i64> {
        Ok(self.doc.read().backend_last_modified)
    }

    fn firewall_last_modified(&self) -> Result<i64> {
        Ok(self.doc.read().firewall_last_modified)
    }

    fn fetch_settings(&self) -> Result<GlobalSettings> {
        Ok(self.doc.read().settings.clone())
    }

    fn fetch_backend(&self) -> Result<BackendDoc> {
        Ok(self.doc.read().backend.clone())
    }

    fn fetch_firewall(&self) -> Result<FirewallDoc> {
        Ok(self.doc.read().firewall.clone())
    }
}

// ═══════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════

/// Atomically swapped configuration registry
pub struct Registry {
    store: Arc<dyn ConfigStore>,
    snapshot: ArcSwap<Snapshot>,
    settings: ArcSwap<GlobalSettings>,
    backend_last_modified: AtomicI64,
    firewall_last_modified: AtomicI64,
}

impl Registry {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            snapshot: ArcSwap::new(Arc::new(Snapshot::default())),
            settings: ArcSwap::new(Arc::new(GlobalSettings::default())),
            backend_last_modified: AtomicI64::new(-1),
            firewall_last_modified: AtomicI64::new(-1),
        }
    }

    /// Current snapshot; held by a request for its whole lifetime
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn settings(&self) -> Arc<GlobalSettings> {
        self.settings.load_full()
    }

    pub fn lookup_domain(&self, host: &str) -> Option<DomainRelation> {
        self.snapshot.load().domain_map.get(host).cloned()
    }

    pub fn app_by_id(&self, app_id: i64) -> Option<Arc<Application>> {
        self.snapshot.load().apps.get(&app_id).cloned()
    }

    /// Fetch and install a fresh backend snapshot
    pub fn reload_backend(&self) -> Result<()> {
        let doc = self.store.fetch_backend()?;
        let snapshot = Snapshot::build(&doc)?;
        info!(
            apps = snapshot.apps.len(),
            domains = snapshot.domain_map.len(),
            certs = snapshot.certs.len(),
            "backend configuration loaded"
        );
        self.snapshot.store(Arc::new(snapshot));
        if let Ok(modified) = self.store.backend_last_modified() {
            self.backend_last_modified.store(modified, Ordering::Relaxed);
        }
        if let Ok(settings) = self.store.fetch_settings() {
            self.settings.store(Arc::new(settings));
        }
        Ok(())
    }

    /// Fetch the firewall document and feed it into the engines
    pub fn reload_firewall(
        &self,
        cc: &CcEngine,
        waf: &WafMatcher,
        ip_table: &IpPolicyTable,
    ) -> Result<()> {
        let doc = self.store.fetch_firewall()?;
        cc.apply_policies(&doc.cc_policies);
        waf.apply_policies(&doc.group_policies, &doc.vulns);
        ip_table.apply_policies(&doc.ip_policies);
        info!(
            cc_policies = doc.cc_policies.len(),
            group_policies = doc.group_policies.len(),
            ip_policies = doc.ip_policies.len(),
            "firewall configuration loaded"
        );
        if let Ok(modified) = self.store.firewall_last_modified() {
            self.firewall_last_modified
                .store(modified, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Certificates expiring within `within_days`, as (common name, days left)
    pub fn expiring_certs(&self, now: i64, within_days: i64) -> Vec<(String, i64)> {
        self.snapshot
            .load()
            .certs
            .iter()
            .filter_map(|cert| {
                let remain_days = (cert.expire_time - now) / 86400;
                (remain_days <= within_days)
                    .then(|| (cert.common_name.clone(), remain_days))
            })
            .collect()
    }
}

/// Poll the store's LastModified counters and refresh whatever changed.
/// Fetch errors are logged and retried on the next tick; the hot path keeps
/// serving the last good snapshot.
pub fn spawn_sync(
    registry: Arc<Registry>,
    cc: Arc<CcEngine>,
    waf: Arc<WafMatcher>,
    ip_table: Arc<IpPolicyTable>,
    sync_seconds: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sync_seconds));
        interval.tick().await; // immediate first tick is a no-op
        loop {
            interval.tick().await;

            match registry.store.backend_last_modified() {
                Ok(modified)
                    if modified != registry.backend_last_modified.load(Ordering::Relaxed) =>
                {
                    if let Err(e) = registry.reload_backend() {
                        error!("backend reload failed: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => error!("backend_last_modified poll failed: {}", e),
            }

            match registry.store.firewall_last_modified() {
                Ok(modified)
                    if modified != registry.firewall_last_modified.load(Ordering::Relaxed) =>
                {
                    if let Err(e) = registry.reload_firewall(&cc, &waf, &ip_table) {
                        error!("firewall reload failed: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => error!("firewall_last_modified poll failed: {}", e),
            }
        }
    })
}
