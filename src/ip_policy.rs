//! IP policy table and the nftables blocking sink
//!
//! Maps IP/CIDR entries to an allow or block decision with an "apply to CC"
//! flag. Transient blocks leave the process through [`FirewallSink`]; the
//! core never observes nftables state.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One IP policy row as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPolicyEntry {
    /// Single IP or CIDR
    pub cidr: String,
    pub is_allow: bool,
    #[serde(default)]
    pub apply_to_cc: bool,
}

#[derive(Debug, Clone)]
struct CompiledPolicy {
    net: IpNet,
    is_allow: bool,
    apply_to_cc: bool,
}

/// Decision for a source IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPolicy {
    pub is_allow: bool,
    pub apply_to_cc: bool,
}

/// Lookup table over the configured IP policies. Swapped atomically on
/// firewall reload; first matching entry wins.
#[derive(Default)]
pub struct IpPolicyTable {
    policies: ArcSwap<Vec<CompiledPolicy>>,
}

impl IpPolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table. Entries that parse as neither CIDR nor bare IP are
    /// logged and skipped.
    pub fn apply_policies(&self, entries: &[IpPolicyEntry]) {
        let compiled: Vec<CompiledPolicy> = entries
            .iter()
            .filter_map(|entry| {
                let net = match entry.cidr.parse::<IpNet>() {
                    Ok(net) => net,
                    Err(_) => match entry.cidr.parse::<IpAddr>() {
                        Ok(IpAddr::V4(v4)) => IpNet::V4(ipnet::Ipv4Net::new(v4, 32).ok()?),
                        Ok(IpAddr::V6(v6)) => IpNet::V6(ipnet::Ipv6Net::new(v6, 128).ok()?),
                        Err(e) => {
                            warn!("invalid IP policy entry '{}': {}", entry.cidr, e);
                            return None;
                        }
                    },
                };
                Some(CompiledPolicy {
                    net,
                    is_allow: entry.is_allow,
                    apply_to_cc: entry.apply_to_cc,
                })
            })
            .collect();
        self.policies.store(Arc::new(compiled));
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<IpPolicy> {
        self.policies
            .load()
            .iter()
            .find(|policy| policy.net.contains(&ip))
            .map(|policy| IpPolicy {
                is_allow: policy.is_allow,
                apply_to_cc: policy.apply_to_cc,
            })
    }
}

/// Sink for transient IP blocks. The production implementation feeds
/// nftables; tests substitute a recorder.
pub trait FirewallSink: Send + Sync {
    /// Block `ip` for `seconds`. Must not block the caller.
    fn block_ip(&self, ip: IpAddr, seconds: u64);
}

/// nftables-backed sink: inserts a timed element into the blackhole set
pub struct NftablesSink;

impl FirewallSink for NftablesSink {
    fn block_ip(&self, ip: IpAddr, seconds: u64) {
        let element = format!("{{ {} timeout {}s }}", ip, seconds);
        tokio::spawn(async move {
            let output = tokio::process::Command::new("nft")
                .args(["add", "element", "inet", "filter", "blackhole", &element])
                .output()
                .await;
            match output {
                Ok(output) if output.status.success() => {
                    debug!(%element, "nftables block inserted");
                }
                Ok(output) => {
                    warn!(
                        %element,
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "nft returned non-zero"
                    );
                }
                Err(e) => warn!(%element, "failed to run nft: {}", e),
            }
        });
    }
}

/// Sink that drops every block; used when nftables is unavailable and by
/// tests that only assert on pipeline behavior.
pub struct NullSink;

impl FirewallSink for NullSink {
    fn block_ip(&self, _ip: IpAddr, _seconds: u64) {}
}
