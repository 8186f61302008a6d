use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;

/// Result of a successful upstream query
pub struct UpstreamResult {
    pub response: Vec<u8>,
    pub upstream_name: String,
    pub latency: Duration,
}

/// Per-upstream statistics
struct UpstreamState {
    name: String,
    addr: SocketAddr,
    timeout: Duration,
    total_queries: AtomicU64,
    total_failures: AtomicU64,
    last_latency: RwLock<Option<Duration>>,
}

/// Forwards queries to the configured upstreams, first one first.
/// The next upstream is only tried when the previous one failed or timed out.
pub struct UpstreamManager {
    upstreams: Vec<UpstreamState>,
}

impl UpstreamManager {
    pub fn new(configs: &[UpstreamConfig]) -> anyhow::Result<Self> {
        if configs.is_empty() {
            return Err(anyhow::anyhow!("At least one upstream server is required"));
        }

        let upstreams = configs
            .iter()
            .map(|c| {
                let addr: SocketAddr = format!("{}:{}", c.address, c.port)
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid upstream address for {}: {}", c.name, e))?;
                Ok(UpstreamState {
                    name: c.name.clone(),
                    addr,
                    timeout: Duration::from_millis(c.timeout_ms),
                    total_queries: AtomicU64::new(0),
                    total_failures: AtomicU64::new(0),
                    last_latency: RwLock::new(None),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        info!("Upstream manager initialized with {} upstreams", upstreams.len());
        Ok(Self { upstreams })
    }

    /// Forward a raw query, failing over in configuration order
    pub async fn forward(&self, query: &[u8]) -> anyhow::Result<UpstreamResult> {
        let mut last_error = None;

        for upstream in &self.upstreams {
            upstream.total_queries.fetch_add(1, Ordering::Relaxed);
            let start = Instant::now();
            match Self::query_upstream(query, upstream.addr, upstream.timeout).await {
                Ok(response) => {
                    let latency = start.elapsed();
                    *upstream.last_latency.write() = Some(latency);
                    debug!("Upstream {} answered in {:?}", upstream.name, latency);
                    return Ok(UpstreamResult {
                        response,
                        upstream_name: upstream.name.clone(),
                        latency,
                    });
                }
                Err(e) => {
                    upstream.total_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Upstream {} failed: {}", upstream.name, e);
                    last_error = Some(e);
                }
            }
        }

        Err(anyhow::anyhow!(
            "All upstreams failed: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    /// Send query to a single upstream and wait for the matching response
    async fn query_upstream(query: &[u8], addr: SocketAddr, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; 4096];
        tokio::time::timeout(timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                // ignore strays that do not carry our transaction ID
                if len >= 2 && query.len() >= 2 && buf[..2] == query[..2] {
                    return Ok::<_, std::io::Error>(buf[..len].to_vec());
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("Timeout after {:?}", timeout))?
        .map_err(Into::into)
    }

    /// Get upstream stats for Web UI
    pub fn get_stats(&self) -> serde_json::Value {
        let upstreams: Vec<serde_json::Value> = self.upstreams.iter().map(|u| {
            serde_json::json!({
                "name": u.name,
                "address": u.addr.to_string(),
                "total_queries": u.total_queries.load(Ordering::Relaxed),
                "total_failures": u.total_failures.load(Ordering::Relaxed),
                "last_latency_ms": (*u.last_latency.read()).map(|d| format!("{:.1}", d.as_secs_f64() * 1000.0)),
            })
        }).collect();

        serde_json::json!(upstreams)
    }
}
