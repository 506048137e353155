//! Signed cookie session store
//!
//! The gateway keeps per-client state (shield token, OAuth identity, pending
//! OAuth states) in one opaque cookie named `janusec-token`: a base64 JSON
//! map plus an HMAC-SHA256 tag. The store is injected wherever sessions are
//! read or written, so tests can construct one with a fixed key.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Cookie carrying the gateway session
pub const SESSION_COOKIE: &str = "janusec-token";

/// A decoded session. Mutations are written back by producing a fresh
/// Set-Cookie value; nothing is shared across requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    values: BTreeMap<String, String>,
}

impl Session {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Signed-cookie codec
pub struct SessionStore {
    key: Vec<u8>,
}

impl SessionStore {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        assert!(!key.is_empty(), "session signing key must not be empty");
        Self { key }
    }

    /// Store with a random key; sessions do not survive restarts
    pub fn ephemeral() -> Self {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Decode the session from the request's Cookie header. Missing,
    /// malformed or tampered cookies yield an empty session.
    pub fn load(&self, headers: &HeaderMap) -> Session {
        let Some(cookie_header) = headers.get("cookie").and_then(|v| v.to_str().ok()) else {
            return Session::default();
        };
        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some(token) = cookie.strip_prefix(&format!("{}=", SESSION_COOKIE)) {
                return self.decode(token).unwrap_or_default();
            }
        }
        Session::default()
    }

    /// Set-Cookie value persisting `session` for `max_age` seconds.
    /// A negative max_age clears the cookie.
    pub fn cookie_value(&self, session: &Session, max_age: i64) -> HeaderValue {
        let cookie = if max_age < 0 {
            format!(
                "{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax",
                SESSION_COOKIE
            )
        } else {
            format!(
                "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
                SESSION_COOKIE,
                self.encode(session),
                max_age
            )
        };
        HeaderValue::from_str(&cookie)
            .unwrap_or_else(|_| HeaderValue::from_static("janusec-token="))
    }

    fn encode(&self, session: &Session) -> String {
        let payload = serde_json::to_vec(&session.values).unwrap_or_default();
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
        let tag = self.sign(payload_b64.as_bytes());
        format!("{}.{}", payload_b64, tag)
    }

    fn decode(&self, token: &str) -> Option<Session> {
        let (payload_b64, tag) = token.split_once('.')?;
        let expected = self.sign(payload_b64.as_bytes());
        // Not secret-dependent in length, and both sides are fixed-size hex.
        if !constant_time_eq(tag.as_bytes(), expected.as_bytes()) {
            debug!("session cookie signature mismatch");
            return None;
        }
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let values: BTreeMap<String, String> = serde_json::from_slice(&payload).ok()?;
        Some(Session { values })
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_cookie(value: &HeaderValue) -> HeaderMap {
        let cookie = value.to_str().unwrap();
        let pair = cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("cookie", pair.parse().unwrap());
        headers
    }

    #[test]
    fn test_round_trip() {
        let store = SessionStore::new(b"0123456789abcdef0123456789abcdef".to_vec());
        let mut session = Session::default();
        session.set("userid", "alice");
        session.set("access_token", "tok-123");

        let cookie = store.cookie_value(&session, 300);
        let loaded = store.load(&headers_with_cookie(&cookie));
        assert_eq!(loaded.get("userid"), Some("alice"));
        assert_eq!(loaded.get("access_token"), Some("tok-123"));
    }

    #[test]
    fn test_tampered_cookie_rejected() {
        let store = SessionStore::new(b"0123456789abcdef0123456789abcdef".to_vec());
        let mut session = Session::default();
        session.set("userid", "alice");
        let cookie = store.cookie_value(&session, 300);

        let cookie_str = cookie.to_str().unwrap();
        let tampered = cookie_str.replacen("janusec-token=", "janusec-token=x", 1);
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            tampered.split(';').next().unwrap().parse().unwrap(),
        );
        assert!(store.load(&headers).is_empty());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let store_a = SessionStore::new(b"a-key-a-key-a-key-a-key-a-key-a!".to_vec());
        let store_b = SessionStore::new(b"b-key-b-key-b-key-b-key-b-key-b!".to_vec());
        let mut session = Session::default();
        session.set("userid", "alice");
        let cookie = store_a.cookie_value(&session, 300);
        assert!(store_b.load(&headers_with_cookie(&cookie)).is_empty());
    }

    #[test]
    fn test_missing_cookie_yields_empty_session() {
        let store = SessionStore::ephemeral();
        assert!(store.load(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn test_clear_cookie() {
        let store = SessionStore::ephemeral();
        let cookie = store.cookie_value(&Session::default(), -1);
        assert!(cookie.to_str().unwrap().contains("Max-Age=0"));
    }
}
