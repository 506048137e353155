//! 5-second shield: crawler heuristics and the interstitial challenge
//!
//! The shield filters non-browser clients in front of the CC and WAF gates.
//! Verified search engines may bypass it; obvious crawlers are blocked at the
//! firewall; everything else gets an interstitial that completes client-side
//! after a short delay and stamps `shldtoken` into the session. The server
//! never blocks.

use std::sync::OnceLock;

use axum::http::HeaderMap;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Session key holding the shield pass token
pub const SHIELD_TOKEN_KEY: &str = "shldtoken";

/// Path the challenge page posts back to once the delay has elapsed
pub const SHIELD_VERIFY_PATH: &str = "/.gateway/shield";

fn search_engine_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(Googlebot|Baiduspider|bingbot|Sogou|360Spider|Yahoo! Slurp|YandexBot|DuckDuckBot|Applebot)",
        )
        .expect("search engine regex is valid")
    })
}

fn crawler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(curl|wget|python-requests|python-urllib|libwww-perl|httpclient|scrapy|go-http-client|java/|masscan|nmap|zgrab|nikto|sqlmap)")
            .expect("crawler regex is valid")
    })
}

/// Known search engine by User-Agent
pub fn is_search_engine(user_agent: &str) -> bool {
    !user_agent.is_empty() && search_engine_re().is_match(user_agent)
}

/// Loose crawler heuristic. The shield page is the real filter; this only
/// catches clients that do not even pretend to be browsers.
pub fn is_crawler(headers: &HeaderMap, user_agent: &str) -> bool {
    if user_agent.is_empty() {
        return true;
    }
    if crawler_re().is_match(user_agent) {
        return true;
    }
    // Browsers always send Accept-Language.
    !headers.contains_key("accept-language")
}

/// Expected token value for a client, bound to its IP and User-Agent
pub fn shield_token(src_ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(src_ip.as_bytes());
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}
