use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::LoadBalanceConfig;
use crate::dns::packet::DnsRecord;
use crate::dns::types::RecordType;
use crate::selector::SelectionMode;
use crate::weights::{normalize_domain, Domain, ParsedWeights};

/// SHA-256 of the raw weight file bytes
pub type ContentDigest = [u8; 32];

/// Weighted Balancer - 重み付きラウンドロビン
///
/// ドメインごとに「次の応答で先頭に来るべきIP」を覚えておき、
/// 応答のA/AAAAレコードの中からそのIPを先頭に持ってくる。
/// 長期的には各IPが先頭に来る割合が重みの比率に収束する。
pub struct WeightedBalancer {
    pub(crate) weight_path: PathBuf,
    pub(crate) reload: Duration,
    mode: SelectionMode,
    /// One lock for table swaps and for every reorder
    pub(crate) table: Mutex<WeightTable>,
    // Stats
    applied: AtomicU64,
    passthrough: AtomicU64,
    pub(crate) reloads: AtomicU64,
    pub(crate) reload_failures: AtomicU64,
    last_reload: RwLock<Option<DateTime<Utc>>>,
}

pub(crate) struct WeightTable {
    pub(crate) domains: HashMap<String, Domain>,
    pub(crate) digest: Option<ContentDigest>,
    rng: StdRng,
}

impl WeightedBalancer {
    pub fn new(weight_path: PathBuf, reload: Duration, mode: SelectionMode, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            weight_path,
            reload,
            mode,
            table: Mutex::new(WeightTable {
                domains: HashMap::new(),
                digest: None,
                rng,
            }),
            applied: AtomicU64::new(0),
            passthrough: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            reload_failures: AtomicU64::new(0),
            last_reload: RwLock::new(None),
        }
    }

    pub fn from_config(config: &LoadBalanceConfig) -> Self {
        Self::new(
            config.weight_path(),
            Duration::from_secs(config.reload_secs),
            SelectionMode::from_deterministic(config.deterministic),
            config.seed,
        )
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Replace the whole domain map with a freshly parsed one.
    /// Selector progress is not carried over.
    pub(crate) fn install(&self, digest: ContentDigest, parsed: ParsedWeights) {
        let mut domains: HashMap<String, Domain> = parsed
            .into_iter()
            .map(|(name, weights)| (name, Domain::new(weights, self.mode)))
            .collect();

        {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            // first expectation, so the first live query already has one
            for domain in domains.values_mut() {
                domain.top = domain.selector.next_top(&domain.weights, &mut table.rng);
            }
            table.domains = domains;
            table.digest = Some(digest);
        }

        self.reloads.fetch_add(1, Ordering::Relaxed);
        *self.last_reload.write() = Some(Utc::now());
    }

    /// Move the expected top address of `qname` to the front of the address
    /// records and regroup the section as CNAME, other, A/AAAA, MX.
    /// Returns false (records untouched, state not advanced) when there is
    /// nothing to apply.
    pub fn reorder(&self, qname: &str, records: &mut Vec<DnsRecord>) -> bool {
        if !records.iter().any(|r| r.rtype.is_address()) {
            self.passthrough.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let key = normalize_domain(qname);
        let position = {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            table.domains.get_mut(&key).and_then(|domain| {
                let expected = domain.top?;
                let position = records
                    .iter()
                    .filter(|r| r.rtype.is_address())
                    .position(|r| r.address().is_some_and(|ip| same_ip(ip, expected)))?;
                domain.top = domain.selector.next_top(&domain.weights, &mut table.rng);
                debug!("{}: promoted {} (next: {:?})", key, expected, domain.top);
                Some(position)
            })
        };

        let Some(position) = position else {
            self.passthrough.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let mut cnames = Vec::new();
        let mut addresses = Vec::new();
        let mut mx = Vec::new();
        let mut rest = Vec::new();
        for record in records.drain(..) {
            match record.rtype {
                RecordType::CNAME => cnames.push(record),
                RecordType::A | RecordType::AAAA => addresses.push(record),
                RecordType::MX => mx.push(record),
                _ => rest.push(record),
            }
        }
        addresses.swap(0, position);

        records.extend(cnames);
        records.extend(rest);
        records.extend(addresses);
        records.extend(mx);

        self.applied.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Current expected top address for a domain
    #[cfg(test)]
    pub fn expected_top(&self, qname: &str) -> Option<IpAddr> {
        let key = normalize_domain(qname);
        self.table.lock().domains.get(&key).and_then(|d| d.top)
    }

    /// Get balancer stats for Web UI
    pub fn get_stats(&self) -> serde_json::Value {
        let domains = self.table.lock().domains.len();
        let last_reload = (*self.last_reload.read())
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
        serde_json::json!({
            "weight_file": self.weight_path.display().to_string(),
            "reload_secs": self.reload.as_secs(),
            "mode": match self.mode {
                SelectionMode::Randomized => "randomized",
                SelectionMode::Deterministic => "deterministic",
            },
            "domains": domains,
            "reorders_applied": self.applied.load(Ordering::Relaxed),
            "reorders_passthrough": self.passthrough.load(Ordering::Relaxed),
            "reloads": self.reloads.load(Ordering::Relaxed),
            "reload_failures": self.reload_failures.load(Ordering::Relaxed),
            "last_reload": last_reload,
        })
    }

    /// List all domains with their weights (for Web UI)
    pub fn list_domains(&self) -> Vec<serde_json::Value> {
        let table = self.table.lock();
        let mut names: Vec<&String> = table.domains.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let domain = &table.domains[name];
                serde_json::json!({
                    "name": name,
                    "weights": domain.weights.iter().map(|w| serde_json::json!({
                        "address": w.address.to_string(),
                        "weight": w.value,
                    })).collect::<Vec<_>>(),
                    "weight_sum": domain.weight_sum(),
                    "selector": domain.selector.kind(),
                    "top": domain.top.map(|ip| ip.to_string()),
                })
            })
            .collect()
    }
}

/// IPv4 and IPv4-mapped IPv6 forms of one address compare equal
fn same_ip(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}
