//! Request pipeline: the per-request state machine
//!
//! One linear pass with early exits: domain resolution, redirects, HTTPS
//! upgrade, client IP extraction, IP policy, 5-second shield, CC gate, WAF
//! gate, OAuth gate, route selection, dispatch, response-phase WAF. Every
//! exit path releases the buffered body and the concurrency guard.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::BodyExt;
use tracing::{debug, info, warn};

use crate::access_log::{AccessLogEntry, AccessLogger, AccessStats};
use crate::cc::{captcha_client_id, CcEngine, CcVerdict, PolicyAction};
use crate::cdn_cache::{is_static_resource, parse_http_date, CacheState, CdnCache};
use crate::config::GatewayConfig;
use crate::ip_policy::{FirewallSink, IpPolicyTable};
use crate::oauth::{oauth_state_id, OAuthCache, OAuthState};
use crate::pages::{block_page, content_type_for, internal_error_page, shield_page, HitInfo,
    CAPTCHA_ENTRANCE};
use crate::proxy::{strip_hop_headers, BackendRequest, OfflineNotifier, ProxyClient};
use crate::registry::{Application, ClientIpMethod, Registry, RouteType};
use crate::selector::select_backend_route;
use crate::session::{Session, SessionStore};
use crate::shield::{is_crawler, is_search_engine, shield_token, SHIELD_TOKEN_KEY,
    SHIELD_VERIFY_PATH};
use crate::waf::{MatchState, RequestContext, WafMatcher};

/// Seconds an IP policy block or crawler block lasts
const TRANSIENT_BLOCK_SECONDS: u64 = 900;

/// Largest request body the gateway will buffer for inspection
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Lifetime of a shield pass token in the session cookie
const SHIELD_SESSION_SECONDS: i64 = 3600;

/// Everything the pipeline needs, shared across both listeners
pub struct GatewayCore {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<Registry>,
    pub cc: Arc<CcEngine>,
    pub waf: Arc<WafMatcher>,
    pub ip_table: Arc<IpPolicyTable>,
    pub sink: Arc<dyn FirewallSink>,
    pub notifier: Arc<dyn OfflineNotifier>,
    pub sessions: Arc<SessionStore>,
    pub oauth_cache: Arc<OAuthCache>,
    pub captcha_hits: Arc<DashMap<String, HitInfo>>,
    pub cdn_cache: Arc<CdnCache>,
    pub proxy: Arc<ProxyClient>,
    pub access_logger: AccessLogger,
    pub stats: Arc<AccessStats>,
    pub concurrency: Arc<AtomicU64>,
}

impl GatewayCore {
    pub fn concurrency_now(&self) -> u64 {
        self.concurrency.load(Ordering::Relaxed)
    }
}

/// Per-listener handler state
#[derive(Clone)]
pub struct GatewayState {
    pub core: Arc<GatewayCore>,
    /// Whether this listener terminated TLS
    pub is_tls: bool,
}

/// Router for one listener: a single fallback handler, like the ingress of a
/// reverse proxy should be.
pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(gateway_handler).with_state(state)
}

/// Concurrency counter scope guard; decrements on every exit path
struct ConnGuard(Arc<AtomicU64>);

impl ConnGuard {
    fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn gateway_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let core = state.core.clone();
    let _guard = ConnGuard::new(core.concurrency.clone());

    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let headers = parts.headers.clone();
    let proto = proto_string(parts.version);

    let path = uri.path().to_string();
    let raw_query = uri.query().unwrap_or("").to_string();
    let request_uri = if raw_query.is_empty() {
        path.clone()
    } else {
        format!("{}?{}", path, raw_query)
    };

    let domain_str = strip_port(host_of(&uri, &headers));

    // Domain resolution; unknown hosts get the welcome site.
    let Some(relation) = core.registry.lookup_domain(&domain_str) else {
        return serve_welcome(&core, &path).await;
    };
    if relation.redirect {
        return redirect_with_query(&relation.location, &raw_query, StatusCode::MOVED_PERMANENTLY);
    }
    let app = relation.app.clone();

    // HTTPS upgrade
    if !state.is_tls && app.redirect_https {
        let location = format!(
            "https://{}{}{}",
            domain_str,
            core.config.listen.https_port_suffix(),
            path
        );
        return redirect_with_query(&location, &raw_query, StatusCode::MOVED_PERMANENTLY);
    }

    let src_ip = client_ip(&app, &headers, peer);
    let user_agent = header_str(&headers, "user-agent").to_string();
    let cookie_header = header_str(&headers, "cookie").to_string();
    let now = unix_now();

    // The body is buffered exactly once; the WAF inspects views of it and
    // the same bytes are forwarded to the backend.
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("request body read failed: {}", e);
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    // Gateway-owned endpoints
    if path == SHIELD_VERIFY_PATH && method == Method::POST {
        return shield_verify(&core, &headers, &body_bytes, &src_ip, &user_agent);
    }
    if path == "/oauth/logout" {
        return oauth_logout(&core);
    }

    // IP policy, only trustworthy for directly connected clients
    let mut is_allow_ip = false;
    if app.client_ip_method == ClientIpMethod::RemoteAddr {
        if let Ok(ip) = src_ip.parse() {
            if let Some(policy) = core.ip_table.lookup(ip) {
                if policy.apply_to_cc {
                    if policy.is_allow {
                        is_allow_ip = true;
                    } else {
                        core.sink.block_ip(ip, TRANSIENT_BLOCK_SECONDS);
                        return empty_response();
                    }
                }
            }
        }
    }

    // 5-second shield
    if !is_allow_ip && app.shield_enabled {
        let session = core.sessions.load(&headers);
        let expected = shield_token(&src_ip, &user_agent);
        if session.get(SHIELD_TOKEN_KEY) != Some(expected.as_str()) {
            let settings = core.registry.settings();
            let skip = settings.skip_se_enabled && is_search_engine(&user_agent);
            if !skip {
                if is_crawler(&headers, &user_agent) {
                    if let Ok(ip) = src_ip.parse() {
                        core.sink.block_ip(ip, TRANSIENT_BLOCK_SECONDS);
                    }
                    return empty_response();
                }
                return shield_page(&request_uri);
            }
        }
    }

    // CC gate
    if !is_allow_ip {
        if let CcVerdict::Attack {
            policy,
            client_id,
            need_log,
        } = core
            .cc
            .check(app.id, &src_ip, &path, &user_agent, &cookie_header)
        {
            let hit = HitInfo {
                type_id: 1,
                policy_id: policy.app_id,
                vuln_name: "CC".to_string(),
                action: policy.action,
                client_id: client_id.clone(),
                target_url: request_uri.clone(),
                block_time: now,
            };
            match policy.action {
                PolicyAction::Block => {
                    if need_log {
                        log_cc_request(&app, &src_ip, &policy.action);
                    }
                    if app.client_ip_method == ClientIpMethod::RemoteAddr {
                        if let Ok(ip) = src_ip.parse() {
                            core.sink.block_ip(ip, policy.block_seconds.max(0) as u64);
                        }
                    }
                    return block_page(&hit);
                }
                PolicyAction::BypassAndLog => {
                    if need_log {
                        log_cc_request(&app, &src_ip, &policy.action);
                    }
                }
                PolicyAction::Captcha => {
                    if need_log {
                        log_cc_request(&app, &src_ip, &policy.action);
                    }
                    core.captcha_hits.insert(client_id.clone(), hit);
                    let captcha_url = format!("{}?id={}", CAPTCHA_ENTRANCE, client_id);
                    return redirect(&captcha_url, StatusCode::TEMPORARY_REDIRECT);
                }
                PolicyAction::Pass => {}
            }
        }
    }

    // WAF gate; the match state survives into the response phase
    let mut match_state = MatchState::new();
    if !is_allow_ip && app.waf_enabled {
        let ctx = RequestContext {
            host: &domain_str,
            src_ip: &src_ip,
            method: method.as_str(),
            path: &path,
            raw_query: &raw_query,
            proto: &proto,
            headers: &headers,
            body: &body_bytes,
        };
        if let Some(policy) = core.waf.inspect_request(app.id, &ctx, &mut match_state) {
            match policy.action {
                PolicyAction::Block => {
                    let hit = HitInfo {
                        type_id: 2,
                        policy_id: policy.id,
                        vuln_name: core.waf.vuln_name(policy.vuln_id),
                        action: policy.action,
                        client_id: String::new(),
                        target_url: request_uri.clone(),
                        block_time: now,
                    };
                    log_waf_request(&app, &src_ip, policy.id);
                    return block_page(&hit);
                }
                PolicyAction::BypassAndLog => {
                    log_waf_request(&app, &src_ip, policy.id);
                }
                PolicyAction::Captcha => {
                    log_waf_request(&app, &src_ip, policy.id);
                    let client_id =
                        captcha_client_id(&src_ip, &path, &user_agent, &cookie_header);
                    let hit = HitInfo {
                        type_id: 2,
                        policy_id: policy.id,
                        vuln_name: "Group Policy Hit".to_string(),
                        action: policy.action,
                        client_id: client_id.clone(),
                        target_url: request_uri.clone(),
                        block_time: now,
                    };
                    core.captcha_hits.insert(client_id.clone(), hit);
                    let captcha_url = format!("{}?id={}", CAPTCHA_ENTRANCE, client_id);
                    return redirect(&captcha_url, StatusCode::TEMPORARY_REDIRECT);
                }
                PolicyAction::Pass => {}
            }
        }
    }

    // OAuth gate
    let mut auth_headers: Vec<(header::HeaderName, HeaderValue)> = Vec::new();
    let settings = core.registry.settings();
    if app.oauth_required && settings.auth.enabled {
        match oauth_gate(
            &core, &app, &headers, &domain_str, &path, &request_uri, &src_ip, &user_agent,
            state.is_tls,
        ) {
            OAuthOutcome::Respond(response) => return response,
            OAuthOutcome::Continue { user } => {
                if let Some((user_id, access_token)) = user {
                    if let (Ok(user_value), Ok(token_value)) = (
                        HeaderValue::from_str(&user_id),
                        HeaderValue::from_str(&access_token),
                    ) {
                        auth_headers
                            .push((header::HeaderName::from_static("x-auth-user"), user_value));
                        auth_headers
                            .push((header::HeaderName::from_static("x-auth-token"), token_value));
                    }
                }
            }
        }
    }

    // Route selection
    let Some(dest) = select_backend_route(&app, &path) else {
        return internal_error_page("Internal Servers Offline");
    };

    // Detached statistics; failures never touch the foreground path.
    core.stats.inc_path(app.id, &path);
    let referer = header_str(&headers, "referer");
    if !referer.is_empty() {
        core.stats.inc_referer(app.id, referer);
    }

    let response = match dest.route_type {
        RouteType::Static => serve_static_route(&dest, &path).await,
        RouteType::FastCgi => {
            serve_fastcgi_route(&dest, &method, &path, &raw_query, &headers, &body_bytes,
                &src_ip, &domain_str)
            .await
        }
        RouteType::HttpProxy => {
            serve_proxy_route(
                &core, &state, &app, &dest, &method, &path, &request_uri, &headers,
                body_bytes, &domain_str, &src_ip, is_allow_ip, &mut match_state, auth_headers, now,
            )
            .await
        }
    };

    let entry = AccessLogEntry {
        domain: domain_str.clone(),
        client_ip: src_ip.clone(),
        method: method.to_string(),
        request_uri: request_uri.clone(),
        user_agent: user_agent.clone(),
        status: response.status().as_u16(),
    };
    let logger = core.access_logger.clone();
    tokio::spawn(async move {
        logger.log(&entry);
    });

    response
}

// ═══════════════════════════════════════════════════════════════
// OAuth gate
// ═══════════════════════════════════════════════════════════════

enum OAuthOutcome {
    Continue {
        user: Option<(String, String)>,
    },
    Respond(Response),
}

#[allow(clippy::too_many_arguments)]
fn oauth_gate(
    core: &GatewayCore,
    app: &Application,
    headers: &HeaderMap,
    domain_str: &str,
    path: &str,
    request_uri: &str,
    src_ip: &str,
    user_agent: &str,
    is_tls: bool,
) -> OAuthOutcome {
    let settings = core.registry.settings();
    let mut session = core.sessions.load(headers);

    let full_url = if is_tls {
        format!(
            "https://{}{}{}",
            domain_str,
            core.config.listen.https_port_suffix(),
            path
        )
    } else {
        request_uri.to_string()
    };

    if let Some(user_id) = session.get("userid").map(str::to_string) {
        let access_token = session.get("access_token").unwrap_or("").to_string();
        return OAuthOutcome::Continue {
            user: Some((user_id, access_token)),
        };
    }

    let state_id = oauth_state_id(src_ip, &full_url, user_agent);
    match session.get(&state_id).map(str::to_string) {
        None => {
            // First pass: remember where to come back to and bounce to the
            // provider entrance.
            let entrance = match settings.auth.entrance_url(&state_id) {
                Ok(url) => url,
                Err(e) => return OAuthOutcome::Respond(plain_response(&e.to_string())),
            };
            core.oauth_cache.set(
                &state_id,
                OAuthState {
                    callback_url: full_url,
                    user_id: String::new(),
                    access_token: String::new(),
                },
            );
            session.set(&state_id, &state_id);
            let cookie = core.sessions.cookie_value(&session, 300);
            OAuthOutcome::Respond(redirect_with_cookie(
                &entrance,
                StatusCode::TEMPORARY_REDIRECT,
                cookie,
            ))
        }
        Some(state_id) => match core.oauth_cache.get(&state_id) {
            None => {
                // Cache entry expired: clear the session and restart.
                let cookie = core.sessions.cookie_value(&Session::default(), -1);
                OAuthOutcome::Respond(redirect_with_cookie(
                    &full_url,
                    StatusCode::TEMPORARY_REDIRECT,
                    cookie,
                ))
            }
            Some(oauth_state) if oauth_state.user_id.is_empty() => {
                // Callback has not completed yet; bounce again.
                session.remove("userid");
                let entrance = match settings.auth.entrance_url(&state_id) {
                    Ok(url) => url,
                    Err(e) => return OAuthOutcome::Respond(plain_response(&e.to_string())),
                };
                OAuthOutcome::Respond(redirect(&entrance, StatusCode::TEMPORARY_REDIRECT))
            }
            Some(oauth_state) => {
                // Completed exchange: commit identity, return to the
                // original URL.
                session.remove(&state_id);
                session.set("userid", &oauth_state.user_id);
                session.set("access_token", &oauth_state.access_token);
                let cookie = core
                    .sessions
                    .cookie_value(&session, app.session_seconds.max(0));
                OAuthOutcome::Respond(redirect_with_cookie(
                    &oauth_state.callback_url,
                    StatusCode::TEMPORARY_REDIRECT,
                    cookie,
                ))
            }
        },
    }
}

fn oauth_logout(core: &GatewayCore) -> Response {
    let cookie = core.sessions.cookie_value(&Session::default(), -1);
    redirect_with_cookie("/", StatusCode::TEMPORARY_REDIRECT, cookie)
}

fn shield_verify(
    core: &GatewayCore,
    headers: &HeaderMap,
    body: &Bytes,
    src_ip: &str,
    user_agent: &str,
) -> Response {
    let form = String::from_utf8_lossy(body);
    let redirect_to = form
        .split('&')
        .find_map(|pair| pair.strip_prefix("redirect="))
        .map(|v| urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_default())
        .filter(|v| v.starts_with('/'))
        .unwrap_or_else(|| "/".to_string());

    let mut session = core.sessions.load(headers);
    session.set(SHIELD_TOKEN_KEY, &shield_token(src_ip, user_agent));
    let cookie = core.sessions.cookie_value(&session, SHIELD_SESSION_SECONDS);
    redirect_with_cookie(&redirect_to, StatusCode::TEMPORARY_REDIRECT, cookie)
}

// ═══════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════

async fn serve_welcome(core: &GatewayCore, path: &str) -> Response {
    let root = &core.config.paths.welcome_root;
    let relative = if path.ends_with('/') {
        format!("{}index.html", path)
    } else {
        path.to_string()
    };
    serve_file(&root.join(relative.trim_start_matches('/')), &relative).await
}

async fn serve_static_route(dest: &crate::registry::Destination, path: &str) -> Response {
    let relative = path.replacen(&dest.request_route, "", 1);
    let target = if path.ends_with('/') {
        format!("{}{}{}", dest.backend_route, relative, dest.destination)
    } else {
        format!("{}{}", dest.backend_route, relative)
    };
    serve_file(Path::new(&target), &target).await
}

async fn serve_file(path: &Path, name: &str) -> Response {
    if name.split('/').any(|segment| segment == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    match tokio::fs::read(path).await {
        Ok(contents) => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type_for(name));
            if let Ok(metadata) = std::fs::metadata(path) {
                if let Ok(modified) = metadata.modified() {
                    builder = builder.header(
                        header::LAST_MODIFIED,
                        crate::cdn_cache::http_date(modified),
                    );
                }
            }
            builder
                .body(Body::from(contents))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_fastcgi_route(
    dest: &crate::registry::Destination,
    method: &Method,
    path: &str,
    raw_query: &str,
    headers: &HeaderMap,
    body: &Bytes,
    src_ip: &str,
    domain_str: &str,
) -> Response {
    let new_path = if dest.request_route != "/" {
        path.replacen(&dest.request_route, "/", 1)
    } else {
        path.to_string()
    };
    let script_filename = format!("{}{}", dest.backend_route, new_path);

    let request = crate::fastcgi::FcgiRequest {
        script_filename,
        method: method.as_str(),
        path,
        query: raw_query,
        remote_addr: src_ip,
        server_name: domain_str,
        headers,
        body,
    };
    match crate::fastcgi::request(&dest.destination, request).await {
        Ok(fcgi) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(fcgi.status).unwrap_or(StatusCode::OK));
            for (name, value) in &fcgi.headers {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(fcgi.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            warn!(destination = %dest.destination, "fastcgi request failed: {}", e);
            internal_error_page("Internal Server Offline")
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_proxy_route(
    core: &Arc<GatewayCore>,
    state: &GatewayState,
    app: &Arc<Application>,
    dest: &Arc<crate::registry::Destination>,
    method: &Method,
    path: &str,
    request_uri: &str,
    headers: &HeaderMap,
    body_bytes: Bytes,
    domain_str: &str,
    src_ip: &str,
    is_allow_ip: bool,
    match_state: &mut MatchState,
    auth_headers: Vec<(header::HeaderName, HeaderValue)>,
    now: i64,
) -> Response {
    let request_was_static = is_static_resource(method.as_str(), request_uri);
    let mut populate_cache = false;

    // CDN cache: serve or revalidate before touching the backend.
    if request_was_static && !headers.contains_key(header::RANGE) {
        match core.cdn_cache.lookup(app.id, path, SystemTime::now()) {
            CacheState::Fresh(file) => return serve_file(&file, path).await,
            CacheState::NeedsRevalidation {
                path: file,
                last_modified,
            } => {
                return revalidate_and_serve(
                    core, app, dest, request_uri, domain_str, &file, last_modified, path, now,
                )
                .await;
            }
            CacheState::Miss => {
                populate_cache = true;
            }
        }
    }

    // Build the backend request: hop-by-hop headers stripped, forwarding
    // headers appended, Origin rewritten for plaintext→https hops.
    let mut backend_headers = strip_hop_headers(headers);
    if let Ok(ip_value) = HeaderValue::from_str(src_ip) {
        backend_headers.insert("x-real-ip", ip_value.clone());
        match backend_headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => {
                let appended = format!("{}, {}", existing, src_ip);
                if let Ok(value) = HeaderValue::from_str(&appended) {
                    backend_headers.insert("x-forwarded-for", value);
                }
            }
            None => {
                backend_headers.insert("x-forwarded-for", ip_value);
            }
        }
    }
    if !state.is_tls && app.backend_https() && backend_headers.contains_key(header::ORIGIN) {
        if let Ok(origin) = HeaderValue::from_str(&format!("https://{}", domain_str)) {
            backend_headers.insert(header::ORIGIN, origin);
        }
    }
    for (name, value) in auth_headers {
        backend_headers.insert(name, value);
    }

    let backend_request = BackendRequest {
        method: method.clone(),
        path_and_query: request_uri.to_string(),
        headers: backend_headers,
        body: body_bytes,
        host: domain_str.to_string(),
    };

    let upstream = match core
        .proxy
        .forward(
            dest,
            app.backend_https(),
            backend_request,
            &app.name,
            core.notifier.as_ref(),
            now,
        )
        .await
    {
        Ok(response) => response,
        Err(e) => {
            debug!(destination = %dest.destination, "backend request failed: {}", e);
            return internal_error_page("Internal Server Offline");
        }
    };

    let (mut parts, incoming) = upstream.into_parts();
    let response_body = match incoming.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("backend body read failed: {}", e);
            return internal_error_page("Internal Server Offline");
        }
    };

    // Response-phase WAF: may substitute a block page.
    if !is_allow_ip && app.waf_enabled {
        if let Some(policy) = core.waf.inspect_response(
            app.id,
            parts.status.as_u16(),
            &parts.headers,
            &response_body,
            request_was_static,
            match_state,
        ) {
            log_waf_request(app, src_ip, policy.id);
            if policy.action == PolicyAction::Block {
                let hit = HitInfo {
                    type_id: 2,
                    policy_id: policy.id,
                    vuln_name: core.waf.vuln_name(policy.vuln_id),
                    action: policy.action,
                    client_id: String::new(),
                    target_url: request_uri.to_string(),
                    block_time: now,
                };
                return block_page(&hit);
            }
        }
    }

    // Populate the cache from a cacheable 200.
    if populate_cache && parts.status == StatusCode::OK {
        let last_modified = parts
            .headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        let cache = core.cdn_cache.clone();
        let app_id = app.id;
        let cache_path = path.to_string();
        let body_copy = response_body.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.store(app_id, &cache_path, &body_copy, last_modified) {
                debug!("cdn cache store failed: {}", e);
            }
        });
    }

    // The body was re-materialized, so framing headers no longer apply.
    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.remove(header::TRANSFER_ENCODING);
    parts.headers.remove(header::CONNECTION);

    Response::from_parts(parts, Body::from(response_body))
}

/// Conditional GET against the origin for a stale cache entry. A 200
/// replaces the file, a 304 refreshes the revalidation marker, anything else
/// serves the stale copy.
#[allow(clippy::too_many_arguments)]
async fn revalidate_and_serve(
    core: &Arc<GatewayCore>,
    app: &Arc<Application>,
    dest: &Arc<crate::registry::Destination>,
    request_uri: &str,
    domain_str: &str,
    cached_file: &Path,
    cached_modified: SystemTime,
    path: &str,
    now: i64,
) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&crate::cdn_cache::http_date(cached_modified)) {
        headers.insert(header::IF_MODIFIED_SINCE, value);
    }
    let request = BackendRequest {
        method: Method::GET,
        path_and_query: request_uri.to_string(),
        headers,
        body: Bytes::new(),
        host: domain_str.to_string(),
    };

    let upstream = core
        .proxy
        .forward(
            dest,
            app.backend_https(),
            request,
            &app.name,
            core.notifier.as_ref(),
            now,
        )
        .await;

    match upstream {
        Ok(response) if response.status() == StatusCode::OK => {
            let (parts, incoming) = response.into_parts();
            match incoming.collect().await {
                Ok(collected) => {
                    let body = collected.to_bytes();
                    let last_modified = parts
                        .headers
                        .get(header::LAST_MODIFIED)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_http_date);
                    if let Err(e) = core.cdn_cache.store(app.id, path, &body, last_modified) {
                        debug!("cdn cache refresh failed: {}", e);
                    }
                    serve_file(cached_file, path).await
                }
                Err(e) => {
                    debug!("revalidation body read failed: {}", e);
                    serve_file(cached_file, path).await
                }
            }
        }
        Ok(response) if response.status() == StatusCode::NOT_MODIFIED => {
            if let Err(e) = core.cdn_cache.touch(cached_file) {
                debug!("cdn cache touch failed: {}", e);
            }
            serve_file(cached_file, path).await
        }
        Ok(_) | Err(_) => serve_file(cached_file, path).await,
    }
}

// ═══════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn proto_string(version: Version) -> String {
    match version {
        Version::HTTP_09 => "HTTP/0.9".to_string(),
        Version::HTTP_10 => "HTTP/1.0".to_string(),
        Version::HTTP_11 => "HTTP/1.1".to_string(),
        Version::HTTP_2 => "HTTP/2.0".to_string(),
        Version::HTTP_3 => "HTTP/3.0".to_string(),
        _ => "HTTP/1.1".to_string(),
    }
}

fn host_of(uri: &axum::http::Uri, headers: &HeaderMap) -> String {
    if let Some(host) = uri.host() {
        return host.to_string();
    }
    header_str(headers, "host").to_string()
}

/// `example.com:8443` → `example.com`; bracketed IPv6 keeps its brackets off
pub fn strip_port(host: String) -> String {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => {
            host[..idx].to_string()
        }
        _ => host,
    }
}

/// Client IP per the application's configured method, falling back to the
/// peer address when the selected header is empty.
fn client_ip(app: &Application, headers: &HeaderMap, peer: SocketAddr) -> String {
    let from_header = match app.client_ip_method {
        ClientIpMethod::RemoteAddr => return peer.ip().to_string(),
        ClientIpMethod::XForwardedFor => header_str(headers, "x-forwarded-for")
            .rsplit(',')
            .next()
            .unwrap_or("")
            .trim()
            .to_string(),
        ClientIpMethod::XRealIp => header_str(headers, "x-real-ip").to_string(),
        ClientIpMethod::RealIp => header_str(headers, "real-ip").to_string(),
    };
    if from_header.is_empty() {
        peer.ip().to_string()
    } else {
        from_header
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn redirect(location: &str, status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn redirect_with_query(location: &str, raw_query: &str, status: StatusCode) -> Response {
    let target = if raw_query.is_empty() {
        location.to_string()
    } else {
        format!("{}?{}", location, raw_query)
    };
    redirect(&target, status)
}

fn redirect_with_cookie(location: &str, status: StatusCode, cookie: HeaderValue) -> Response {
    Response::builder()
        .status(status)
        .header(header::LOCATION, location)
        .header(header::SET_COOKIE, cookie)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn empty_response() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn plain_response(message: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn log_cc_request(app: &Application, src_ip: &str, action: &PolicyAction) {
    info!(
        target: "cc_log",
        app_id = app.id,
        src_ip = %src_ip,
        action = ?action,
        "CC policy hit"
    );
}

fn log_waf_request(app: &Application, src_ip: &str, policy_id: i64) {
    info!(
        target: "waf_log",
        app_id = app.id,
        src_ip = %src_ip,
        policy_id = policy_id,
        "group policy hit"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:443".to_string()), "example.com");
        assert_eq!(strip_port("example.com".to_string()), "example.com");
        assert_eq!(strip_port("[::1]:8443".to_string()), "::1");
        assert_eq!(strip_port("127.0.0.1:80".to_string()), "127.0.0.1");
    }

    #[test]
    fn test_proto_string() {
        assert_eq!(proto_string(Version::HTTP_11), "HTTP/1.1");
        assert_eq!(proto_string(Version::HTTP_2), "HTTP/2.0");
    }
}
