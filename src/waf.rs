//! Web Application Firewall: group-policy evaluation over named checkpoints
//!
//! A group policy hits when every one of its checks has matched somewhere in
//! the request (or response). The matcher walks the request checkpoint by
//! checkpoint; per-policy progress is tracked in a per-request match state so
//! checks at different checkpoints conjoin, and repeated values are only
//! evaluated once.
//!
//! All regex patterns are compiled at policy load. A pattern that fails to
//! compile is logged at debug level and its check never matches.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::HeaderMap;
use bytes::Bytes;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cc::PolicyAction;

/// Named positions where checks are evaluated. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPoint {
    Host,
    IpAddress,
    Method,
    UrlPath,
    UrlQuery,
    FileExt,
    UploadFileExt,
    GetPostKey,
    GetPostValue,
    CookieKey,
    CookieValue,
    UserAgent,
    ContentType,
    HeaderKey,
    HeaderValue,
    Referer,
    Proto,
    ResponseStatusCode,
    ResponseHeaderKey,
    ResponseHeaderValue,
    ResponseBody,
}

/// Comparison applied by a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOperation {
    Regex,
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

/// One check inside a group policy, as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub check_point: CheckPoint,
    pub operation: CheckOperation,
    pub pattern: String,
    /// For HeaderValue/ResponseHeaderValue: restrict to this header name
    #[serde(default)]
    pub key_name: Option<String>,
}

/// WAF rule group, as stored. Hits when all checks match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPolicy {
    pub id: i64,
    /// 0 = global
    pub app_id: i64,
    pub vuln_id: i64,
    pub action: PolicyAction,
    pub is_enabled: bool,
    pub checks: Vec<Check>,
}

/// Vulnerability id → display name, shown on block pages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: i64,
    pub name: String,
}

#[derive(Debug)]
struct CompiledCheck {
    point: CheckPoint,
    operation: CheckOperation,
    pattern: String,
    key_name: Option<String>,
    regex: Option<Regex>,
}

/// Compiled group policy with precompiled regexes
#[derive(Debug)]
pub struct CompiledPolicy {
    pub id: i64,
    pub app_id: i64,
    pub vuln_id: i64,
    pub action: PolicyAction,
    checks: Vec<CompiledCheck>,
}

/// Per-request match state: per-policy progress plus a seen-value dedup set
#[derive(Debug, Default)]
pub struct MatchState {
    matched: HashMap<i64, u64>,
    seen: HashSet<(CheckPoint, String, String)>,
}

impl MatchState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Request data the matcher walks. The body is the single buffered copy that
/// is later forwarded to the backend unchanged.
pub struct RequestContext<'a> {
    pub host: &'a str,
    pub src_ip: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub raw_query: &'a str,
    pub proto: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a Bytes,
}

/// The WAF matcher
pub struct WafMatcher {
    policies: ArcSwap<Vec<Arc<CompiledPolicy>>>,
    vuln_names: DashMap<i64, String>,
}

impl Default for WafMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WafMatcher {
    pub fn new() -> Self {
        Self {
            policies: ArcSwap::new(Arc::new(Vec::new())),
            vuln_names: DashMap::new(),
        }
    }

    /// Replace the policy set, compiling regexes. Disabled policies are
    /// dropped here so the hot path never sees them.
    pub fn apply_policies(&self, policies: &[GroupPolicy], vulns: &[Vulnerability]) {
        let compiled: Vec<Arc<CompiledPolicy>> = policies
            .iter()
            .filter(|p| p.is_enabled && !p.checks.is_empty())
            .filter_map(|policy| {
                if policy.checks.len() > 63 {
                    debug!(policy = policy.id, "policy has too many checks, skipping");
                    return None;
                }
                let checks = policy
                    .checks
                    .iter()
                    .map(|check| {
                        let regex = match check.operation {
                            CheckOperation::Regex => match Regex::new(&check.pattern) {
                                Ok(re) => Some(re),
                                Err(e) => {
                                    debug!(
                                        policy = policy.id,
                                        pattern = %check.pattern,
                                        "invalid regex pattern, check disabled: {}",
                                        e
                                    );
                                    None
                                }
                            },
                            _ => None,
                        };
                        CompiledCheck {
                            point: check.check_point,
                            operation: check.operation,
                            pattern: check.pattern.clone(),
                            key_name: check.key_name.clone(),
                            regex,
                        }
                    })
                    .collect();
                Some(Arc::new(CompiledPolicy {
                    id: policy.id,
                    app_id: policy.app_id,
                    vuln_id: policy.vuln_id,
                    action: policy.action,
                    checks,
                }))
            })
            .collect();
        self.policies.store(Arc::new(compiled));

        self.vuln_names.clear();
        for vuln in vulns {
            self.vuln_names.insert(vuln.id, vuln.name.clone());
        }
    }

    pub fn vuln_name(&self, vuln_id: i64) -> String {
        self.vuln_names
            .get(&vuln_id)
            .map(|name| name.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Walk the request checkpoints in order, stopping at the first policy
    /// whose checks are all satisfied.
    pub fn inspect_request(
        &self,
        app_id: i64,
        ctx: &RequestContext<'_>,
        state: &mut MatchState,
    ) -> Option<Arc<CompiledPolicy>> {
        if let Some(hit) = self.match_value(app_id, ctx.host, CheckPoint::Host, None, false, state)
        {
            return Some(hit);
        }
        if let Some(hit) =
            self.match_value(app_id, ctx.src_ip, CheckPoint::IpAddress, None, false, state)
        {
            return Some(hit);
        }
        if let Some(hit) =
            self.match_value(app_id, ctx.method, CheckPoint::Method, None, false, state)
        {
            return Some(hit);
        }
        if let Some(hit) =
            self.match_value(app_id, ctx.path, CheckPoint::UrlPath, None, false, state)
        {
            return Some(hit);
        }
        if !ctx.raw_query.is_empty() {
            if let Some(hit) =
                self.match_value(app_id, ctx.raw_query, CheckPoint::UrlQuery, None, true, state)
            {
                return Some(hit);
            }
        }
        let ext = file_extension(ctx.path);
        if !ext.is_empty() {
            if let Some(hit) =
                self.match_value(app_id, &ext, CheckPoint::FileExt, None, false, state)
            {
                return Some(hit);
            }
        }

        // Body: multipart gets per-part scanning, JSON a recursive walk of
        // string leaves, everything else the classic form-field loop.
        let content_type = header_str(ctx.headers, "content-type");
        let (media_type, boundary) = parse_media_type(content_type);
        let mut form_params = parse_form_params(ctx.raw_query);

        if media_type.starts_with("multipart/form-data") {
            if let Some(boundary) = boundary {
                for part in parse_multipart(ctx.body, &boundary) {
                    if let Some(filename) = &part.filename {
                        let upload_ext = file_extension(filename);
                        if let Some(hit) = self.match_value(
                            app_id,
                            &upload_ext,
                            CheckPoint::UploadFileExt,
                            None,
                            false,
                            state,
                        ) {
                            return Some(hit);
                        }
                    }
                    let content = String::from_utf8_lossy(part.body);
                    if let Some(hit) = self.match_value(
                        app_id,
                        &content,
                        CheckPoint::GetPostValue,
                        None,
                        true,
                        state,
                    ) {
                        return Some(hit);
                    }
                    if part.filename.is_none() {
                        if let Some(name) = part.name {
                            form_params.push((name, content.into_owned()));
                        }
                    }
                }
            } else {
                debug!("multipart body without boundary parameter, skipping part scan");
            }
        } else if media_type.starts_with("application/json") {
            if !ctx.body.is_empty() {
                match serde_json::from_slice::<serde_json::Value>(ctx.body) {
                    Ok(value) => {
                        if let Some(hit) = self.json_value_hit(app_id, &value, state) {
                            return Some(hit);
                        }
                    }
                    Err(e) => debug!("request body is not valid JSON: {}", e),
                }
            }
        } else if media_type.starts_with("application/x-www-form-urlencoded") {
            let body_str = String::from_utf8_lossy(ctx.body);
            form_params.extend(parse_form_params(&body_str));
        }

        if !media_type.starts_with("application/json") {
            for (key, value) in &form_params {
                if let Some(hit) =
                    self.match_value(app_id, key, CheckPoint::GetPostKey, None, false, state)
                {
                    return Some(hit);
                }
                // Short pure-digit values (ids, page numbers) are noise.
                if is_small_number(value) {
                    continue;
                }
                if let Some(hit) =
                    self.match_value(app_id, value, CheckPoint::GetPostValue, None, true, state)
                {
                    return Some(hit);
                }
            }
        }

        let referer = header_str(ctx.headers, "referer");
        if let Some(hit) =
            self.match_value(app_id, referer, CheckPoint::Referer, None, false, state)
        {
            return Some(hit);
        }

        for (name, value) in parse_cookies(header_str(ctx.headers, "cookie")) {
            if let Some(hit) =
                self.match_value(app_id, &name, CheckPoint::CookieKey, None, false, state)
            {
                return Some(hit);
            }
            if let Some(hit) =
                self.match_value(app_id, &value, CheckPoint::CookieValue, None, true, state)
            {
                return Some(hit);
            }
        }

        let user_agent = header_str(ctx.headers, "user-agent");
        if let Some(hit) =
            self.match_value(app_id, user_agent, CheckPoint::UserAgent, None, false, state)
        {
            return Some(hit);
        }

        if let Some(hit) =
            self.match_value(app_id, &media_type, CheckPoint::ContentType, None, false, state)
        {
            return Some(hit);
        }

        for (name, value) in ctx.headers.iter() {
            let name_str = name.as_str();
            if let Some(hit) =
                self.match_value(app_id, name_str, CheckPoint::HeaderKey, None, false, state)
            {
                return Some(hit);
            }
            if let Ok(value_str) = value.to_str() {
                if let Some(hit) = self.match_value(
                    app_id,
                    value_str,
                    CheckPoint::HeaderValue,
                    Some(name_str),
                    false,
                    state,
                ) {
                    return Some(hit);
                }
            }
        }

        self.match_value(app_id, ctx.proto, CheckPoint::Proto, None, false, state)
    }

    /// Response-phase walk. Skipped for protocol switches and static serves.
    pub fn inspect_response(
        &self,
        app_id: i64,
        status: u16,
        headers: &HeaderMap,
        body: &Bytes,
        request_was_static: bool,
        state: &mut MatchState,
    ) -> Option<Arc<CompiledPolicy>> {
        if status == 101 || request_was_static {
            return None;
        }

        let status_str = status.to_string();
        if let Some(hit) = self.match_value(
            app_id,
            &status_str,
            CheckPoint::ResponseStatusCode,
            None,
            false,
            state,
        ) {
            return Some(hit);
        }

        for (name, value) in headers.iter() {
            let name_str = name.as_str();
            if let Some(hit) = self.match_value(
                app_id,
                name_str,
                CheckPoint::ResponseHeaderKey,
                None,
                false,
                state,
            ) {
                return Some(hit);
            }
            if let Ok(value_str) = value.to_str() {
                if let Some(hit) = self.match_value(
                    app_id,
                    value_str,
                    CheckPoint::ResponseHeaderValue,
                    Some(name_str),
                    false,
                    state,
                ) {
                    return Some(hit);
                }
            }
        }

        let is_gzip = headers
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        let body_text = if is_gzip {
            let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
            let mut decompressed = Vec::new();
            match decoder.read_to_end(&mut decompressed) {
                Ok(_) => String::from_utf8_lossy(&decompressed).into_owned(),
                Err(e) => {
                    debug!("gzip decompress failed, scanning raw body: {}", e);
                    String::from_utf8_lossy(body).into_owned()
                }
            }
        } else {
            String::from_utf8_lossy(body).into_owned()
        };

        self.match_value(
            app_id,
            &body_text,
            CheckPoint::ResponseBody,
            None,
            false,
            state,
        )
    }

    fn json_value_hit(
        &self,
        app_id: i64,
        value: &serde_json::Value,
        state: &mut MatchState,
    ) -> Option<Arc<CompiledPolicy>> {
        match value {
            serde_json::Value::String(s) => {
                self.match_value(app_id, s, CheckPoint::GetPostValue, None, true, state)
            }
            serde_json::Value::Array(items) => items
                .iter()
                .find_map(|item| self.json_value_hit(app_id, item, state)),
            serde_json::Value::Object(map) => map
                .values()
                .find_map(|item| self.json_value_hit(app_id, item, state)),
            // Null, Bool and Number leaves carry no scannable text.
            _ => None,
        }
    }

    /// Evaluate `value` at `point` against every applicable policy, advancing
    /// per-policy progress. Returns the first fully satisfied policy.
    fn match_value(
        &self,
        app_id: i64,
        value: &str,
        point: CheckPoint,
        key_name: Option<&str>,
        decode: bool,
        state: &mut MatchState,
    ) -> Option<Arc<CompiledPolicy>> {
        let seen_key = (
            point,
            key_name.unwrap_or_default().to_string(),
            value.to_string(),
        );
        if !state.seen.insert(seen_key) {
            return None;
        }

        let decoded;
        let candidate = if decode {
            decoded = unescape_raw_value(value);
            decoded.as_str()
        } else {
            value
        };

        let policies = self.policies.load();
        for policy in policies.iter() {
            if policy.app_id != 0 && policy.app_id != app_id {
                continue;
            }
            for (idx, check) in policy.checks.iter().enumerate() {
                if check.point != point {
                    continue;
                }
                if let Some(want_key) = &check.key_name {
                    if !want_key.is_empty()
                        && !key_name
                            .map(|k| k.eq_ignore_ascii_case(want_key))
                            .unwrap_or(false)
                    {
                        continue;
                    }
                }
                if check_matches(check, candidate) {
                    let mask = state.matched.entry(policy.id).or_insert(0);
                    *mask |= 1 << idx;
                    if *mask == (1u64 << policy.checks.len()) - 1 {
                        return Some(policy.clone());
                    }
                }
            }
        }
        None
    }
}

fn check_matches(check: &CompiledCheck, value: &str) -> bool {
    match check.operation {
        CheckOperation::Regex => check
            .regex
            .as_ref()
            .map(|re| re.is_match(value))
            .unwrap_or(false),
        CheckOperation::Equals => value == check.pattern,
        CheckOperation::NotEquals => value != check.pattern,
        CheckOperation::Contains => value.contains(&check.pattern),
        CheckOperation::GreaterThan => match (value.parse::<f64>(), check.pattern.parse::<f64>()) {
            (Ok(v), Ok(p)) => v > p,
            _ => false,
        },
        CheckOperation::LessThan => match (value.parse::<f64>(), check.pattern.parse::<f64>()) {
            (Ok(v), Ok(p)) => v < p,
            _ => false,
        },
    }
}

/// Unescape a raw query or cookie value before matching: first repair the
/// escape sequences attackers use to dodge the decoder (`%%`, `%'`, `%"`,
/// trailing `%`), then percent-decode, then normalize.
pub fn unescape_raw_value(raw: &str) -> String {
    let mut repaired = raw
        .replace("%%", "%25%")
        .replace("%'", "%25'")
        .replace("%\"", "%25\"");
    if repaired.ends_with('%') {
        repaired.push_str("25");
    }
    let spaced = repaired.replace('+', " ");
    let decoded = match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            debug!("percent-decode failed: {}", e);
            String::new()
        }
    };
    preprocess_string(&decoded)
}

/// Lower-case and collapse whitespace runs to a single space
pub fn preprocess_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_whitespace = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                out.push(' ');
                in_whitespace = true;
            }
        } else {
            in_whitespace = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        }
    }
    out
}

/// Extension of a path including the dot (".php"), empty when none
pub fn file_extension(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(idx) => name[idx..].to_string(),
        None => String::new(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn parse_media_type(content_type: &str) -> (String, Option<String>) {
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let boundary = parts.find_map(|param| {
        let param = param.trim();
        param
            .strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
    });
    (media_type, boundary)
}

/// Query/form pairs, percent-decoded
fn parse_form_params(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut it = pair.splitn(2, '=');
            let key = it.next().unwrap_or("");
            let value = it.next().unwrap_or("");
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|c| c.into_owned())
        .unwrap_or(spaced)
}

fn parse_cookies(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|cookie| {
            let cookie = cookie.trim();
            if cookie.is_empty() {
                return None;
            }
            let mut it = cookie.splitn(2, '=');
            let name = it.next()?.to_string();
            let value = it.next().unwrap_or("").to_string();
            Some((name, value))
        })
        .collect()
}

fn is_small_number(value: &str) -> bool {
    !value.is_empty() && value.len() <= 5 && value.bytes().all(|b| b.is_ascii_digit())
}

struct MultipartPart<'a> {
    name: Option<String>,
    filename: Option<String>,
    body: &'a [u8],
}

/// Minimal multipart/form-data splitter over the already-buffered body.
/// Malformed input yields fewer parts rather than an error.
fn parse_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<MultipartPart<'a>> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();
    let mut offset = 0;

    while let Some(pos) = find_subsequence(&body[offset..], delimiter) {
        let start = offset + pos + delimiter.len();
        if body[start..].starts_with(b"--") {
            break; // closing delimiter
        }
        let content_start = match find_subsequence(&body[start..], b"\r\n") {
            Some(i) => start + i + 2,
            None => break,
        };
        let content_end = match find_subsequence(&body[content_start..], delimiter) {
            Some(i) => content_start + i,
            None => body.len(),
        };
        let mut segment = &body[content_start..content_end];
        // Strip the CRLF that precedes the next delimiter.
        if segment.ends_with(b"\r\n") {
            segment = &segment[..segment.len() - 2];
        }
        if segment.starts_with(b"--") {
            break;
        }

        let (headers, part_body) = match find_subsequence(segment, b"\r\n\r\n") {
            Some(i) => (&segment[..i], &segment[i + 4..]),
            None => (&segment[..0], segment),
        };
        let headers_text = String::from_utf8_lossy(headers);
        let mut name = None;
        let mut filename = None;
        for line in headers_text.lines() {
            if line.to_ascii_lowercase().starts_with("content-disposition:") {
                for param in line.split(';') {
                    let param = param.trim();
                    if let Some(v) = param.strip_prefix("name=") {
                        name = Some(v.trim_matches('"').to_string());
                    } else if let Some(v) = param.strip_prefix("filename=") {
                        filename = Some(v.trim_matches('"').to_string());
                    }
                }
            }
        }
        parts.push(MultipartPart {
            name,
            filename,
            body: part_body,
        });
        offset = content_end;
    }
    parts
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sqli_policy() -> GroupPolicy {
        GroupPolicy {
            id: 10,
            app_id: 0,
            vuln_id: 1,
            action: PolicyAction::Captcha,
            is_enabled: true,
            checks: vec![Check {
                check_point: CheckPoint::UrlQuery,
                operation: CheckOperation::Regex,
                pattern: r"\bor\s+1\s*=\s*1".to_string(),
                key_name: None,
            }],
        }
    }

    fn matcher_with(policies: Vec<GroupPolicy>) -> WafMatcher {
        let matcher = WafMatcher::new();
        matcher.apply_policies(
            &policies,
            &[Vulnerability {
                id: 1,
                name: "SQL Injection".to_string(),
            }],
        );
        matcher
    }

    fn base_ctx<'a>(headers: &'a HeaderMap, body: &'a Bytes) -> RequestContext<'a> {
        RequestContext {
            host: "shop.example.com",
            src_ip: "1.2.3.4",
            method: "GET",
            path: "/page",
            raw_query: "",
            proto: "HTTP/1.1",
            headers,
            body,
        }
    }

    #[test]
    fn test_sqli_query_hit() {
        let matcher = matcher_with(vec![sqli_policy()]);
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let mut ctx = base_ctx(&headers, &body);
        ctx.raw_query = "id=1%20OR%201%3D1--";

        let mut state = MatchState::new();
        let hit = matcher.inspect_request(7, &ctx, &mut state).unwrap();
        assert_eq!(hit.id, 10);
        assert_eq!(hit.action, PolicyAction::Captcha);
        assert_eq!(matcher.vuln_name(hit.vuln_id), "SQL Injection");
    }

    #[test]
    fn test_clean_request_passes() {
        let matcher = matcher_with(vec![sqli_policy()]);
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let mut ctx = base_ctx(&headers, &body);
        ctx.raw_query = "id=42";

        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_none());
    }

    #[test]
    fn test_conjunction_across_checkpoints() {
        let policy = GroupPolicy {
            id: 20,
            app_id: 0,
            vuln_id: 1,
            action: PolicyAction::Block,
            is_enabled: true,
            checks: vec![
                Check {
                    check_point: CheckPoint::Method,
                    operation: CheckOperation::Equals,
                    pattern: "POST".to_string(),
                    key_name: None,
                },
                Check {
                    check_point: CheckPoint::UrlPath,
                    operation: CheckOperation::Regex,
                    pattern: "^/admin".to_string(),
                    key_name: None,
                },
            ],
        };
        let matcher = matcher_with(vec![policy]);
        let headers = HeaderMap::new();
        let body = Bytes::new();

        // Path matches but method does not: no hit.
        let mut ctx = base_ctx(&headers, &body);
        ctx.path = "/admin/users";
        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_none());

        // Both checks satisfied: hit.
        ctx.method = "POST";
        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_some());
    }

    #[test]
    fn test_app_scoping() {
        let mut policy = sqli_policy();
        policy.app_id = 9;
        let matcher = matcher_with(vec![policy]);
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let mut ctx = base_ctx(&headers, &body);
        ctx.raw_query = "id=1+or+1%3D1";

        // Policy belongs to app 9; app 7 traffic is not evaluated against it.
        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_none());
        let mut state = MatchState::new();
        assert!(matcher.inspect_request(9, &ctx, &mut state).is_some());
    }

    #[test]
    fn test_json_body_walk() {
        let policy = GroupPolicy {
            id: 30,
            app_id: 0,
            vuln_id: 1,
            action: PolicyAction::Block,
            is_enabled: true,
            checks: vec![Check {
                check_point: CheckPoint::GetPostValue,
                operation: CheckOperation::Contains,
                pattern: "<script".to_string(),
                key_name: None,
            }],
        };
        let matcher = matcher_with(vec![policy]);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        let body = Bytes::from(r#"{"user":{"comments":["ok","<SCRIPT>alert(1)</script>"]}}"#);
        let mut ctx = base_ctx(&headers, &body);
        ctx.method = "POST";

        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_some());
    }

    #[test]
    fn test_multipart_upload_ext() {
        let policy = GroupPolicy {
            id: 40,
            app_id: 0,
            vuln_id: 1,
            action: PolicyAction::Block,
            is_enabled: true,
            checks: vec![Check {
                check_point: CheckPoint::UploadFileExt,
                operation: CheckOperation::Equals,
                pattern: ".php".to_string(),
                key_name: None,
            }],
        };
        let matcher = matcher_with(vec![policy]);
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            "multipart/form-data; boundary=XBOUND".parse().unwrap(),
        );
        let body = Bytes::from(
            "--XBOUND\r\n\
             Content-Disposition: form-data; name=\"upload\"; filename=\"shell.php\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             <?php echo 1; ?>\r\n\
             --XBOUND--\r\n",
        );
        let mut ctx = base_ctx(&headers, &body);
        ctx.method = "POST";

        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_some());
    }

    #[test]
    fn test_header_value_key_filter() {
        let policy = GroupPolicy {
            id: 50,
            app_id: 0,
            vuln_id: 1,
            action: PolicyAction::Block,
            is_enabled: true,
            checks: vec![Check {
                check_point: CheckPoint::HeaderValue,
                operation: CheckOperation::Contains,
                pattern: "sqlmap".to_string(),
                key_name: Some("x-scanner".to_string()),
            }],
        };
        let matcher = matcher_with(vec![policy]);
        let body = Bytes::new();

        // Pattern in a different header: the key filter keeps it from firing.
        let mut headers = HeaderMap::new();
        headers.insert("x-other", "sqlmap/1.0".parse().unwrap());
        let ctx = base_ctx(&headers, &body);
        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_none());

        let mut headers = HeaderMap::new();
        headers.insert("x-scanner", "sqlmap/1.0".parse().unwrap());
        let ctx = base_ctx(&headers, &body);
        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_some());
    }

    #[test]
    fn test_response_status_and_gzip_body() {
        let policies = vec![
            GroupPolicy {
                id: 60,
                app_id: 0,
                vuln_id: 1,
                action: PolicyAction::Block,
                is_enabled: true,
                checks: vec![Check {
                    check_point: CheckPoint::ResponseStatusCode,
                    operation: CheckOperation::GreaterThan,
                    pattern: "503".to_string(),
                    key_name: None,
                }],
            },
            GroupPolicy {
                id: 61,
                app_id: 0,
                vuln_id: 1,
                action: PolicyAction::Block,
                is_enabled: true,
                checks: vec![Check {
                    check_point: CheckPoint::ResponseBody,
                    operation: CheckOperation::Contains,
                    pattern: "secret-token".to_string(),
                    key_name: None,
                }],
            },
        ];
        let matcher = matcher_with(policies);

        let headers = HeaderMap::new();
        let mut state = MatchState::new();
        let hit = matcher
            .inspect_response(7, 504, &headers, &Bytes::new(), false, &mut state)
            .unwrap();
        assert_eq!(hit.id, 60);

        // Gzip-encoded body is decompressed before scanning.
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"leaked secret-token here").unwrap();
        let gzipped = Bytes::from(encoder.finish().unwrap());
        let mut headers = HeaderMap::new();
        headers.insert("content-encoding", "gzip".parse().unwrap());
        let mut state = MatchState::new();
        let hit = matcher
            .inspect_response(7, 200, &headers, &gzipped, false, &mut state)
            .unwrap();
        assert_eq!(hit.id, 61);
    }

    #[test]
    fn test_response_skipped_for_static_and_upgrade() {
        let matcher = matcher_with(vec![GroupPolicy {
            id: 70,
            app_id: 0,
            vuln_id: 1,
            action: PolicyAction::Block,
            is_enabled: true,
            checks: vec![Check {
                check_point: CheckPoint::ResponseStatusCode,
                operation: CheckOperation::Equals,
                pattern: "101".to_string(),
                key_name: None,
            }],
        }]);
        let headers = HeaderMap::new();
        let mut state = MatchState::new();
        assert!(matcher
            .inspect_response(7, 101, &headers, &Bytes::new(), false, &mut state)
            .is_none());
        let mut state = MatchState::new();
        assert!(matcher
            .inspect_response(7, 200, &headers, &Bytes::new(), true, &mut state)
            .is_none());
    }

    #[test]
    fn test_unescape_raw_value() {
        assert_eq!(unescape_raw_value("a%20b"), "a b");
        assert_eq!(unescape_raw_value("A+B"), "a b");
        // Broken trailing percent is repaired, not dropped.
        assert_eq!(unescape_raw_value("abc%"), "abc%");
        // Bare %' sequences survive as literals.
        assert_eq!(unescape_raw_value("1%'--"), "1%'--");
        // Whitespace runs collapse, case folds.
        assert_eq!(unescape_raw_value("SELECT%20%20%09*"), "select *");
    }

    #[test]
    fn test_small_numeric_values_skipped() {
        let policy = GroupPolicy {
            id: 80,
            app_id: 0,
            vuln_id: 1,
            action: PolicyAction::Block,
            is_enabled: true,
            checks: vec![Check {
                check_point: CheckPoint::GetPostValue,
                operation: CheckOperation::Regex,
                pattern: r"^\d+$".to_string(),
                key_name: None,
            }],
        };
        let matcher = matcher_with(vec![policy]);
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let mut ctx = base_ctx(&headers, &body);
        ctx.raw_query = "page=3";

        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_none());

        // Six digits is past the skip threshold.
        ctx.raw_query = "page=123456";
        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_some());
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        let policy = GroupPolicy {
            id: 90,
            app_id: 0,
            vuln_id: 1,
            action: PolicyAction::Block,
            is_enabled: true,
            checks: vec![Check {
                check_point: CheckPoint::UrlPath,
                operation: CheckOperation::Regex,
                pattern: "([unclosed".to_string(),
                key_name: None,
            }],
        };
        let matcher = matcher_with(vec![policy]);
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let ctx = base_ctx(&headers, &body);

        let mut state = MatchState::new();
        assert!(matcher.inspect_request(7, &ctx, &mut state).is_none());
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("/path/to/shell.php"), ".php");
        assert_eq!(file_extension("/articles/12345"), "");
        assert_eq!(file_extension("/a.b/c"), "");
        assert_eq!(file_extension("archive.tar.gz"), ".gz");
    }

    #[test]
    fn test_multipart_parser_parts() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"field1\"\r\n\r\n\
            value1\r\n\
            --B\r\n\
            Content-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file contents\r\n\
            --B--\r\n";
        let parts = parse_multipart(body, "B");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name.as_deref(), Some("field1"));
        assert_eq!(parts[0].body, b"value1");
        assert_eq!(parts[1].filename.as_deref(), Some("x.txt"));
        assert_eq!(parts[1].body, b"file contents");
    }
}
