//! Templated gateway responses: block page, internal error page, shield
//! challenge and the welcome fallback

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;

use crate::cc::PolicyAction;
use crate::shield::SHIELD_VERIFY_PATH;

/// Describes a blocked or challenged request; rendered into the block page
/// and cached for the captcha flow.
#[derive(Debug, Clone)]
pub struct HitInfo {
    /// 1 = CC, 2 = WAF
    pub type_id: i64,
    pub policy_id: i64,
    pub vuln_name: String,
    pub action: PolicyAction,
    pub client_id: String,
    pub target_url: String,
    pub block_time: i64,
}

/// Captcha entrance path; the admin UI owns the page itself
pub const CAPTCHA_ENTRANCE: &str = "/captcha";

const BLOCK_PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>403 Forbidden</title></head>
<body style="font-family:sans-serif;text-align:center;margin-top:10%">
<h1>403 Forbidden</h1>
<p>Your request was blocked by the application firewall.</p>
<p>Reason: {reason} &middot; Policy: {policy_id}</p>
</body>
</html>
"#;

const INTERNAL_ERROR_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>500 Internal Error</title></head>
<body style="font-family:sans-serif;text-align:center;margin-top:10%">
<h1>Service Unavailable</h1>
<p>{description}</p>
</body>
</html>
"#;

const SHIELD_PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>Checking your browser</title>
<script>
setTimeout(function () {
    var form = document.getElementById("shield-form");
    form.submit();
}, 5000);
</script>
</head>
<body style="font-family:sans-serif;text-align:center;margin-top:10%">
<h1>Checking your browser before accessing</h1>
<p>This process is automatic. You will be redirected shortly.</p>
<form id="shield-form" method="POST" action="{verify_path}">
<input type="hidden" name="redirect" value="{redirect}">
<noscript><input type="submit" value="Continue"></noscript>
</form>
</body>
</html>
"#;

fn html_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// 403 block page for a policy hit
pub fn block_page(hit: &HitInfo) -> Response {
    let body = BLOCK_PAGE_TEMPLATE
        .replace("{reason}", &escape_html(&hit.vuln_name))
        .replace("{policy_id}", &hit.policy_id.to_string());
    html_response(StatusCode::FORBIDDEN, body)
}

/// Internal error page; the description stays a category string
pub fn internal_error_page(description: &str) -> Response {
    let body = INTERNAL_ERROR_TEMPLATE.replace("{description}", &escape_html(description));
    html_response(StatusCode::INTERNAL_SERVER_ERROR, body)
}

/// The 5-second shield interstitial
pub fn shield_page(redirect_path: &str) -> Response {
    let body = SHIELD_PAGE_TEMPLATE
        .replace("{verify_path}", SHIELD_VERIFY_PATH)
        .replace("{redirect}", &escape_html(redirect_path));
    html_response(StatusCode::OK, body)
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Content type by file extension for static serving
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
