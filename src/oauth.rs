//! OAuth gate support: state cache and provider entrance URLs
//!
//! The gateway only drives the state exchange; provider callbacks are
//! handled by an external collaborator that fills in `user_id` and
//! `access_token` via [`OAuthCache::set`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};

/// Pending or completed OAuth exchange, keyed by state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthState {
    pub callback_url: String,
    pub user_id: String,
    pub access_token: String,
}

/// Expiring in-memory state cache
pub struct OAuthCache {
    entries: DashMap<String, (OAuthState, Instant)>,
    ttl: Duration,
}

impl OAuthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Default provider TTL: five minutes
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(300))
    }

    pub fn set(&self, state: &str, value: OAuthState) {
        self.entries
            .insert(state.to_string(), (value, Instant::now() + self.ttl));
    }

    pub fn get(&self, state: &str) -> Option<OAuthState> {
        let entry = self.entries.get(state)?;
        let (value, expires) = entry.value();
        if Instant::now() >= *expires {
            drop(entry);
            self.entries.remove(state);
            return None;
        }
        Some(value.clone())
    }

    pub fn remove(&self, state: &str) {
        self.entries.remove(state);
    }

    /// Periodic sweep of expired entries
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let now = Instant::now();
                cache.entries.retain(|_, (_, expires)| *expires > now);
            }
        })
    }
}

/// `state = SHA-256(srcIP || fullURL || UA)`
pub fn oauth_state_id(src_ip: &str, url: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(src_ip.as_bytes());
    hasher.update(url.as_bytes());
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════
// Provider configuration
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WxworkConfig {
    pub corp_id: String,
    pub agent_id: String,
    pub callback: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DingtalkConfig {
    pub app_id: String,
    pub callback: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeishuConfig {
    pub app_id: String,
    pub callback: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LarkConfig {
    pub app_id: String,
    pub callback: String,
}

/// Complete LDAP provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapConfig {
    pub entrance: String,
    pub address: String,
    pub dn: String,
    pub using_tls: bool,
    pub authenticator_enabled: bool,
    pub bind_required: bool,
    pub base_dn: String,
    pub bind_username: String,
    pub bind_password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Cas2Config {
    pub entrance: String,
    pub callback: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamlConfig {
    pub metadata_url: String,
}

/// Authentication configuration, refreshed with global settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub provider: String,
    pub wxwork: WxworkConfig,
    pub dingtalk: DingtalkConfig,
    pub feishu: FeishuConfig,
    pub lark: LarkConfig,
    pub ldap: LdapConfig,
    pub cas2: Cas2Config,
    pub saml: SamlConfig,
}

impl AuthConfig {
    /// Entrance URL for the configured provider; each provider has its own
    /// template.
    pub fn entrance_url(&self, state: &str) -> Result<String> {
        match self.provider.as_str() {
            "wxwork" => Ok(format!(
                "https://open.work.weixin.qq.com/wwopen/sso/qrConnect?appid={}&agentid={}&redirect_uri={}&state={}",
                self.wxwork.corp_id, self.wxwork.agent_id, self.wxwork.callback, state
            )),
            "dingtalk" => Ok(format!(
                "https://oapi.dingtalk.com/connect/qrconnect?appid={}&response_type=code&scope=snsapi_login&state={}&redirect_uri={}",
                self.dingtalk.app_id, state, self.dingtalk.callback
            )),
            "feishu" => Ok(format!(
                "https://open.feishu.cn/open-apis/authen/v1/index?redirect_uri={}&app_id={}&state={}",
                self.feishu.callback, self.feishu.app_id, state
            )),
            "lark" => Ok(format!(
                "https://open.larksuite.com/open-apis/authen/v1/index?redirect_uri={}&app_id={}&state={}",
                self.lark.callback, self.lark.app_id, state
            )),
            "ldap" => Ok(format!("/ldap/login?state={}", state)),
            "cas2" => Ok(format!(
                "{}/login?renew=true&service={}?state={}",
                self.cas2.entrance, self.cas2.callback, state
            )),
            "saml" => Ok(format!("/saml/login?state={}", state)),
            other => Err(GatewayError::OAuthProvider(other.to_string())),
        }
    }
}
