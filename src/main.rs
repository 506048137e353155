//! Warden Gateway - application gateway and web application firewall
//!
//! Boot sequence: load the node config, pull the first configuration
//! snapshot from the store (fatal if certificates cannot be loaded), start
//! the firewall engines, then bring up the plaintext and TLS listeners.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use dashmap::DashMap;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden_gateway::access_log::{AccessLogger, AccessStats};
use warden_gateway::cc::CcEngine;
use warden_gateway::cdn_cache::CdnCache;
use warden_gateway::config::GatewayConfig;
use warden_gateway::ip_policy::{IpPolicyTable, NftablesSink};
use warden_gateway::oauth::OAuthCache;
use warden_gateway::pipeline::{router, GatewayCore, GatewayState};
use warden_gateway::proxy::{LogNotifier, ProxyClient};
use warden_gateway::registry::{spawn_sync, FileStore, Registry};
use warden_gateway::session::SessionStore;
use warden_gateway::waf::WafMatcher;

/// Warden Gateway - application gateway and WAF
#[derive(Parser, Debug)]
#[command(name = "warden-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "./gateway.toml", env = "WARDEN_CONFIG")]
    config: PathBuf,

    /// Override plaintext listen address
    #[arg(long, env = "WARDEN_LISTEN_HTTP")]
    listen_http: Option<String>,

    /// Override TLS listen address
    #[arg(long, env = "WARDEN_LISTEN_HTTPS")]
    listen_https: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "WARDEN_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "WARDEN_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start listeners)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("starting warden-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("configuration file: {:?}", args.config);

    let mut config = if args.config.exists() {
        GatewayConfig::load(&args.config)?
    } else {
        warn!("config file not found, using defaults");
        GatewayConfig::default()
    };

    if let Some(listen) = args.listen_http {
        config.listen.http = listen;
    }
    if let Some(listen) = args.listen_https {
        config.listen.https = listen;
    }
    config.validate()?;
    info!(
        "configuration validated (role: {:?}, sync every {}s)",
        config.node.role, config.node.sync_seconds
    );

    if args.validate {
        info!("configuration validation successful, exiting");
        return Ok(());
    }

    let config = Arc::new(config);

    // First snapshot from the store. Certificate load failures are fatal
    // here; later reload failures fall back to the last good snapshot.
    let store = Arc::new(FileStore::new(&config.store.file));
    let registry = Arc::new(Registry::new(store));
    registry.reload_backend()?;

    let cc = Arc::new(CcEngine::new());
    let waf = Arc::new(WafMatcher::new());
    let ip_table = Arc::new(IpPolicyTable::new());
    if let Err(e) = registry.reload_firewall(&cc, &waf, &ip_table) {
        warn!("initial firewall load failed, starting with defaults: {}", e);
    }
    cc.start();

    let sessions = Arc::new(if config.session.signing_key.is_empty() {
        warn!("no session signing key configured, sessions will not survive restarts");
        SessionStore::ephemeral()
    } else {
        SessionStore::new(config.session.signing_key.as_bytes().to_vec())
    });

    let oauth_cache = Arc::new(OAuthCache::with_default_ttl());
    oauth_cache.spawn_cleanup();

    let access_log_file = config
        .logging
        .access_log_file
        .clone()
        .unwrap_or_else(|| config.paths.log_dir.join("access.log"));
    let access_logger = AccessLogger::new(config.logging.access_log, Some(access_log_file));

    let core = Arc::new(GatewayCore {
        config: config.clone(),
        registry: registry.clone(),
        cc: cc.clone(),
        waf: waf.clone(),
        ip_table: ip_table.clone(),
        sink: Arc::new(NftablesSink),
        notifier: Arc::new(LogNotifier),
        sessions,
        oauth_cache,
        captcha_hits: Arc::new(DashMap::new()),
        cdn_cache: Arc::new(CdnCache::new(&config.paths.cdn_cache_root)),
        proxy: Arc::new(ProxyClient::new()),
        access_logger,
        stats: Arc::new(AccessStats::new()),
        concurrency: Arc::new(AtomicU64::new(0)),
    });

    // Replica/primary synchronization against the store's counters
    spawn_sync(
        registry.clone(),
        cc.clone(),
        waf.clone(),
        ip_table.clone(),
        config.node.sync_seconds,
    );

    spawn_daily_routine(core.clone());

    // Plaintext listener
    let http_addr = config.listen.http_addr()?;
    let http_router = router(GatewayState {
        core: core.clone(),
        is_tls: false,
    });
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", http_addr, e))?;
    info!("HTTP listener on {}", http_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(
            http_listener,
            http_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!("HTTP listener error: {}", e);
        }
    });

    // TLS listener with SNI certificate selection from the registry
    let https_addr = config.listen.https_addr()?;
    let tls_config = RustlsConfig::from_config(Arc::new(warden_gateway::tls::server_config(
        registry.clone(),
    )));
    let https_router = router(GatewayState {
        core: core.clone(),
        is_tls: true,
    });
    info!("HTTPS listener on {}", https_addr);
    tokio::spawn(async move {
        if let Err(e) = axum_server::bind_rustls(https_addr, tls_config)
            .serve(https_router.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            error!("HTTPS listener error: {}", e);
        }
    });

    info!("warden-gateway ready");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, shutting down");
        }
    }

    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Daily routine at 03:00 local: expired log purge, statistics cleanup,
/// certificate expiry audit.
fn spawn_daily_routine(core: Arc<GatewayCore>) {
    tokio::spawn(async move {
        let mut day = 0u64;
        loop {
            tokio::time::sleep(until_next_3am()).await;
            day += 1;

            let settings = core.registry.settings();
            purge_old_logs(&core.config.paths.log_dir, settings.access_log_days);

            // Counters follow the 14-day statistics retention.
            if day % 14 == 0 {
                core.stats.clear();
            }

            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let expiring = core.registry.expiring_certs(now, 31);
            if !expiring.is_empty() {
                core.notifier.notify_expiring_certs(&expiring);
            }
        }
    });
}

fn until_next_3am() -> Duration {
    use chrono::{Local, NaiveTime, TimeZone};
    let now = Local::now();
    let next = now.date_naive().succ_opt().map(|d| {
        Local
            .from_local_datetime(&d.and_time(NaiveTime::from_hms_opt(3, 0, 0).unwrap()))
            .single()
    });
    match next.flatten() {
        Some(next) => (next - now)
            .to_std()
            .unwrap_or(Duration::from_secs(86400)),
        None => Duration::from_secs(86400),
    }
}

/// Delete log files older than the retention window
fn purge_old_logs(log_dir: &std::path::Path, retention_days: i64) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    let cutoff = std::time::SystemTime::now()
        - Duration::from_secs((retention_days.max(0) as u64) * 86400);
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if let Ok(modified) = metadata.modified() {
            if modified < cutoff {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("failed to delete expired log {:?}: {}", path, e);
                } else {
                    info!("deleted expired log {:?}", path);
                }
            }
        }
    }
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    sigterm.recv().await;
    info!("received SIGTERM");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}
