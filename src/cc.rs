//! CC (request flood) engine: per-app sliding-window counters with ticker
//! decay and bad-IP flagging
//!
//! Buckets are keyed by `(ccAppID, clientID)` where the client id is a
//! SHA-256 fingerprint of the source IP plus whatever the policy stats by.
//! A policy's ticker folds quick counts into slow counts every interval and
//! promotes clients over the threshold to bad-IP for `block_seconds`. The
//! promotion is the only strict transition and is done with a compare-and-set
//! so it is observed exactly once.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Action applied when a policy fires. Numeric values are the stored form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum PolicyAction {
    Block,
    BypassAndLog,
    Captcha,
    Pass,
}

impl TryFrom<i64> for PolicyAction {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            100 => Ok(Self::Block),
            200 => Ok(Self::BypassAndLog),
            300 => Ok(Self::Captcha),
            400 => Ok(Self::Pass),
            other => Err(format!("unknown policy action {}", other)),
        }
    }
}

impl From<PolicyAction> for i64 {
    fn from(action: PolicyAction) -> i64 {
        match action {
            PolicyAction::Block => 100,
            PolicyAction::BypassAndLog => 200,
            PolicyAction::Captcha => 300,
            PolicyAction::Pass => 400,
        }
    }
}

/// One CC policy; `app_id == 0` is the global default, which shares buckets
/// across all applications it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcPolicy {
    pub app_id: i64,
    pub interval_milliseconds: i64,
    pub max_count: i64,
    pub block_seconds: i64,
    pub action: PolicyAction,
    #[serde(default)]
    pub stat_by_url: bool,
    #[serde(default)]
    pub stat_by_ua: bool,
    #[serde(default)]
    pub stat_by_cookie: bool,
    pub is_enabled: bool,
}

impl CcPolicy {
    /// Boot-time global default: 6 hits per 100ms window, 900s block
    pub fn global_default() -> Self {
        Self {
            app_id: 0,
            interval_milliseconds: 100,
            max_count: 6,
            block_seconds: 900,
            action: PolicyAction::Block,
            stat_by_url: true,
            stat_by_ua: false,
            stat_by_cookie: false,
            is_enabled: true,
        }
    }
}

/// Per-client counters. Individual fields race benignly; only the bad-IP
/// promotion must be observed exactly once.
#[derive(Debug, Default)]
pub struct ClientStat {
    pub quick_count: AtomicI64,
    pub slow_count: AtomicI64,
    pub time_frame_count: AtomicI64,
    pub is_bad_ip: AtomicBool,
    pub remain_millis: AtomicI64,
}

/// Verdict for one request
#[derive(Debug, Clone)]
pub enum CcVerdict {
    Pass,
    Attack {
        policy: Arc<CcPolicy>,
        client_id: String,
        need_log: bool,
    },
}

type BucketMap = Arc<DashMap<String, Arc<ClientStat>>>;

/// Ticker ownership: dropping the handle stops the task, so replacing a
/// policy's ticker cannot leak the old one.
struct TickerHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The CC engine
pub struct CcEngine {
    policies: Arc<DashMap<i64, Arc<CcPolicy>>>,
    buckets: Arc<DashMap<i64, BucketMap>>,
    tickers: DashMap<i64, TickerHandle>,
}

impl Default for CcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CcEngine {
    pub fn new() -> Self {
        let engine = Self {
            policies: Arc::new(DashMap::new()),
            buckets: Arc::new(DashMap::new()),
            tickers: DashMap::new(),
        };
        engine
            .policies
            .insert(0, Arc::new(CcPolicy::global_default()));
        engine
    }

    /// Start the global (app 0) ticker. Called once at boot.
    pub fn start(&self) {
        if let Some(policy) = self.policies.get(&0).map(|p| p.clone()) {
            if policy.is_enabled {
                self.start_ticker(0);
            }
        }
    }

    /// Policy for an app, falling back to the global policy
    pub fn policy_for_app(&self, app_id: i64) -> Arc<CcPolicy> {
        self.policies
            .get(&app_id)
            .or_else(|| self.policies.get(&0))
            .map(|p| p.clone())
            .unwrap_or_else(|| Arc::new(CcPolicy::global_default()))
    }

    /// Replace the policy set. Tickers follow policy lifetime: removed or
    /// disabled policies stop theirs, interval changes restart.
    pub fn apply_policies(&self, policies: &[CcPolicy]) {
        let mut keep: Vec<i64> = Vec::with_capacity(policies.len());
        for policy in policies {
            keep.push(policy.app_id);
            let previous = self.policies.get(&policy.app_id).map(|p| p.clone());
            self.policies
                .insert(policy.app_id, Arc::new(policy.clone()));

            let interval_changed = previous
                .map(|p| p.interval_milliseconds != policy.interval_milliseconds)
                .unwrap_or(true);
            if policy.is_enabled {
                if interval_changed || !self.tickers.contains_key(&policy.app_id) {
                    self.start_ticker(policy.app_id);
                }
            } else {
                self.tickers.remove(&policy.app_id);
            }
        }
        // The global policy cannot be deleted; everything else follows the store.
        self.policies
            .retain(|app_id, _| *app_id == 0 || keep.contains(app_id));
        self.tickers
            .retain(|app_id, _| *app_id == 0 || keep.contains(app_id));
        if !keep.contains(&0) && !self.policies.contains_key(&0) {
            self.policies
                .insert(0, Arc::new(CcPolicy::global_default()));
        }
    }

    /// Per-request update. Only a client already flagged bad produces an
    /// attack verdict; promotion itself happens on the decay tick.
    pub fn check(
        &self,
        app_id: i64,
        src_ip: &str,
        url_path: &str,
        user_agent: &str,
        cookie: &str,
    ) -> CcVerdict {
        let policy = self.policy_for_app(app_id);
        if !policy.is_enabled {
            return CcVerdict::Pass;
        }
        // Global policy stats across apps in one shared bucket space.
        let cc_app_id = if policy.app_id == 0 { 0 } else { app_id };
        let buckets = self.bucket_map(cc_app_id);

        let client_id = client_fingerprint(&policy, src_ip, url_path, user_agent, cookie);
        let stat = buckets
            .entry(client_id.clone())
            .or_insert_with(|| Arc::new(ClientStat::default()))
            .clone();

        if stat.is_bad_ip.load(Ordering::Acquire) {
            // First hit of the current interval carries the log duty.
            let need_log = stat
                .quick_count
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            return CcVerdict::Attack {
                policy,
                client_id,
                need_log,
            };
        }

        stat.quick_count.fetch_add(1, Ordering::Relaxed);
        CcVerdict::Pass
    }

    /// Drop the bucket for a client (captcha solved)
    pub fn clear_stat(&self, cc_app_id: i64, client_id: &str) {
        if let Some(buckets) = self.buckets.get(&cc_app_id) {
            buckets.remove(client_id);
        }
    }

    /// Bucket lookup for tests and the captcha flow
    pub fn stat(&self, cc_app_id: i64, client_id: &str) -> Option<Arc<ClientStat>> {
        self.buckets
            .get(&cc_app_id)?
            .get(client_id)
            .map(|s| s.clone())
    }

    fn bucket_map(&self, cc_app_id: i64) -> BucketMap {
        self.buckets
            .entry(cc_app_id)
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }

    /// One decay pass over an app's buckets. Exposed so tests can drive the
    /// clock; the ticker task calls it every `interval_milliseconds`.
    pub fn run_decay(policy: &CcPolicy, buckets: &DashMap<String, Arc<ClientStat>>) {
        buckets.retain(|client_id, stat| {
            if stat.is_bad_ip.load(Ordering::Acquire) {
                let remain = stat
                    .remain_millis
                    .fetch_sub(policy.interval_milliseconds, Ordering::AcqRel)
                    - policy.interval_milliseconds;
                if remain <= 0 {
                    debug!(client_id = %client_id, "bad-ip window elapsed, bucket evicted");
                    return false;
                }
                return true;
            }

            if stat.quick_count.load(Ordering::Relaxed) >= policy.max_count {
                // High frequency trigger
                if stat
                    .is_bad_ip
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    stat.quick_count.store(0, Ordering::Release);
                    stat.remain_millis
                        .store(policy.block_seconds * 1000, Ordering::Release);
                }
                return true;
            }

            if stat.slow_count.load(Ordering::Relaxed) >= policy.max_count {
                // Low frequency trigger
                if stat
                    .is_bad_ip
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    stat.quick_count.store(0, Ordering::Release);
                    stat.slow_count.store(0, Ordering::Release);
                    stat.remain_millis
                        .store(policy.block_seconds * 1000, Ordering::Release);
                }
                return true;
            }

            // Not an attacker this interval: fold quick into slow, evict
            // after 15 idle-ish intervals.
            let frames = stat.time_frame_count.fetch_add(1, Ordering::Relaxed) + 1;
            if frames >= 15 {
                return false;
            }
            let quick = stat.quick_count.swap(0, Ordering::AcqRel);
            stat.slow_count.fetch_add(quick, Ordering::Relaxed);
            true
        });
    }

    fn start_ticker(&self, app_id: i64) {
        // Outside a runtime (unit tests) decay is driven manually.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let policies = self.policies.clone();
        let buckets = self.buckets.clone();
        let task = handle.spawn(async move {
            loop {
                let Some(policy) = policies.get(&app_id).map(|p| p.clone()) else {
                    return;
                };
                let interval = Duration::from_millis(policy.interval_milliseconds.max(1) as u64);
                tokio::time::sleep(interval).await;
                let cc_app_id = if policy.app_id == 0 { 0 } else { app_id };
                if let Some(map) = buckets.get(&cc_app_id).map(|m| m.clone()) {
                    Self::run_decay(&policy, &map);
                }
            }
        });
        // Insert replaces any previous handle, which aborts the old ticker.
        self.tickers.insert(app_id, TickerHandle { handle: task });
    }
}

/// `clientID = SHA-256(srcIP || url? || ua? || cookie?)` per the policy's
/// stat flags
pub fn client_fingerprint(
    policy: &CcPolicy,
    src_ip: &str,
    url_path: &str,
    user_agent: &str,
    cookie: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(src_ip.as_bytes());
    if policy.stat_by_url {
        hasher.update(url_path.as_bytes());
    }
    if policy.stat_by_ua {
        hasher.update(user_agent.as_bytes());
    }
    if policy.stat_by_cookie {
        hasher.update(cookie.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Client id used for the captcha flow: SHA-256(srcIP || path || ua || cookie)
pub fn captcha_client_id(src_ip: &str, url_path: &str, user_agent: &str, cookie: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(src_ip.as_bytes());
    hasher.update(url_path.as_bytes());
    hasher.update(user_agent.as_bytes());
    hasher.update(cookie.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy(app_id: i64) -> CcPolicy {
        CcPolicy {
            app_id,
            interval_milliseconds: 1000,
            max_count: 3,
            block_seconds: 5,
            action: PolicyAction::Block,
            stat_by_url: false,
            stat_by_ua: false,
            stat_by_cookie: false,
            is_enabled: true,
        }
    }

    fn drive_decay(engine: &CcEngine, app_id: i64) {
        let policy = engine.policy_for_app(app_id);
        let cc_app_id = if policy.app_id == 0 { 0 } else { app_id };
        let map = engine.bucket_map(cc_app_id);
        CcEngine::run_decay(&policy, &map);
    }

    #[test]
    fn test_burst_promotes_to_bad_ip() {
        let engine = CcEngine::new();
        engine.apply_policies(&[test_policy(7)]);

        // Three requests inside one interval all pass.
        for _ in 0..3 {
            assert!(matches!(
                engine.check(7, "1.2.3.4", "/", "curl", ""),
                CcVerdict::Pass
            ));
        }

        // Interval boundary: quick count reached max, promotion fires.
        drive_decay(&engine, 7);

        match engine.check(7, "1.2.3.4", "/", "curl", "") {
            CcVerdict::Attack {
                policy, need_log, ..
            } => {
                assert_eq!(policy.action, PolicyAction::Block);
                assert!(need_log);
            }
            CcVerdict::Pass => panic!("expected attack verdict"),
        }

        let client_id = client_fingerprint(&test_policy(7), "1.2.3.4", "/", "curl", "");
        let stat = engine.stat(7, &client_id).unwrap();
        assert!(stat.is_bad_ip.load(Ordering::Acquire));
    }

    #[test]
    fn test_need_log_fires_once_per_window() {
        let engine = CcEngine::new();
        engine.apply_policies(&[test_policy(7)]);

        for _ in 0..3 {
            engine.check(7, "9.9.9.9", "/", "ua", "");
        }
        drive_decay(&engine, 7);

        let first = engine.check(7, "9.9.9.9", "/", "ua", "");
        let second = engine.check(7, "9.9.9.9", "/", "ua", "");
        match (first, second) {
            (
                CcVerdict::Attack { need_log: a, .. },
                CcVerdict::Attack { need_log: b, .. },
            ) => {
                assert!(a);
                assert!(!b);
            }
            _ => panic!("expected two attack verdicts"),
        }
    }

    #[test]
    fn test_bad_ip_expires_after_block_window() {
        let engine = CcEngine::new();
        engine.apply_policies(&[test_policy(7)]);

        for _ in 0..3 {
            engine.check(7, "5.5.5.5", "/", "ua", "");
        }
        drive_decay(&engine, 7); // promote

        let client_id = client_fingerprint(&test_policy(7), "5.5.5.5", "/", "ua", "");
        assert!(engine.stat(7, &client_id).is_some());

        // block_seconds=5, interval=1s: five more ticks drain the window.
        for _ in 0..5 {
            drive_decay(&engine, 7);
        }
        assert!(engine.stat(7, &client_id).is_none());

        // Fresh bucket afterwards: requests pass again.
        assert!(matches!(
            engine.check(7, "5.5.5.5", "/", "ua", ""),
            CcVerdict::Pass
        ));
    }

    #[test]
    fn test_slow_count_promotion() {
        let engine = CcEngine::new();
        engine.apply_policies(&[test_policy(7)]);

        // Two requests per interval stay under max_count=3 quick, but the
        // folded slow count crosses it on the second tick.
        for _ in 0..2 {
            engine.check(7, "6.6.6.6", "/", "ua", "");
        }
        drive_decay(&engine, 7); // slow=2
        for _ in 0..2 {
            engine.check(7, "6.6.6.6", "/", "ua", "");
        }
        drive_decay(&engine, 7); // slow=4 >= 3 next tick
        drive_decay(&engine, 7); // promotion

        match engine.check(7, "6.6.6.6", "/", "ua", "") {
            CcVerdict::Attack { .. } => {}
            CcVerdict::Pass => panic!("expected slow-count promotion"),
        }
    }

    #[test]
    fn test_idle_bucket_evicted_after_15_intervals() {
        let engine = CcEngine::new();
        engine.apply_policies(&[test_policy(7)]);

        engine.check(7, "8.8.8.8", "/", "ua", "");
        let client_id = client_fingerprint(&test_policy(7), "8.8.8.8", "/", "ua", "");

        for _ in 0..15 {
            drive_decay(&engine, 7);
        }
        assert!(engine.stat(7, &client_id).is_none());
    }

    #[test]
    fn test_global_policy_shares_buckets_across_apps() {
        let engine = CcEngine::new();
        let mut global = test_policy(0);
        global.max_count = 3;
        engine.apply_policies(&[global]);

        // Two apps, same client: counts accumulate in the app-0 bucket space.
        engine.check(1, "7.7.7.7", "/", "ua", "");
        engine.check(2, "7.7.7.7", "/", "ua", "");
        engine.check(1, "7.7.7.7", "/", "ua", "");
        drive_decay(&engine, 1);

        match engine.check(2, "7.7.7.7", "/", "ua", "") {
            CcVerdict::Attack { .. } => {}
            CcVerdict::Pass => panic!("global policy must share buckets"),
        }
    }

    #[test]
    fn test_fingerprint_varies_with_stat_flags() {
        let mut policy = test_policy(7);
        let base = client_fingerprint(&policy, "1.1.1.1", "/a", "ua", "c");
        policy.stat_by_url = true;
        let with_url = client_fingerprint(&policy, "1.1.1.1", "/a", "ua", "c");
        assert_ne!(base, with_url);

        let other_path = client_fingerprint(&policy, "1.1.1.1", "/b", "ua", "c");
        assert_ne!(with_url, other_path);
    }

    #[test]
    fn test_disabled_policy_passes_everything() {
        let engine = CcEngine::new();
        let mut policy = test_policy(7);
        policy.is_enabled = false;
        engine.apply_policies(&[policy]);

        for _ in 0..100 {
            assert!(matches!(
                engine.check(7, "2.2.2.2", "/", "ua", ""),
                CcVerdict::Pass
            ));
        }
    }

    #[test]
    fn test_global_policy_survives_apply() {
        let engine = CcEngine::new();
        engine.apply_policies(&[test_policy(7)]);
        // Global default must still resolve even though the store sent only
        // the app-7 policy.
        let global = engine.policy_for_app(42);
        assert_eq!(global.app_id, 0);
    }
}
