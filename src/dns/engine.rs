use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, debug, warn};

use crate::balancer::WeightedBalancer;
use crate::config::Config;
use crate::dns::packet;
use crate::upstream::UpstreamManager;

/// Core query engine - forwards queries and rebalances the answers
pub struct QueryEngine {
    pub upstream: Arc<UpstreamManager>,
    /// None when no `[loadbalance]` section is configured
    pub balancer: Option<Arc<WeightedBalancer>>,
    total_queries: AtomicU64,
    rewritten: AtomicU64,
}

impl QueryEngine {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let upstream = Arc::new(UpstreamManager::new(&config.upstreams)?);
        let balancer = config
            .loadbalance
            .as_ref()
            .map(|lb| Arc::new(WeightedBalancer::from_config(lb)));

        match &balancer {
            Some(b) => info!("⚖️ Weighted balancing enabled ({:?}, file: {})", b.mode(), b.weight_path.display()),
            None => info!("Weighted balancing disabled (no [loadbalance] section)"),
        }

        Ok(Self::with_parts(upstream, balancer))
    }

    pub fn with_parts(upstream: Arc<UpstreamManager>, balancer: Option<Arc<WeightedBalancer>>) -> Self {
        Self {
            upstream,
            balancer,
            total_queries: AtomicU64::new(0),
            rewritten: AtomicU64::new(0),
        }
    }

    /// Handle a raw DNS query and return raw response bytes
    pub async fn handle_query(&self, query_data: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.total_queries.fetch_add(1, Ordering::Relaxed);

        let (qname, qtype) = packet::extract_query_info(query_data)?;
        debug!("Query: {} {}", qname, qtype.name());

        let result = self.upstream.forward(query_data).await?;
        debug!("{} {} answered via {} in {:?}", qname, qtype.name(), result.upstream_name, result.latency);

        Ok(self.rebalance(result.response))
    }

    /// Apply the weighted order to the answer and additional sections.
    /// Anything that cannot be parsed or re-encoded is passed through as is.
    pub fn rebalance(&self, response: Vec<u8>) -> Vec<u8> {
        let Some(balancer) = &self.balancer else {
            return response;
        };

        let mut parsed = match packet::parse_packet(&response) {
            Ok(p) => p,
            Err(e) => {
                debug!("Response not parseable, forwarding untouched: {}", e);
                return response;
            }
        };
        let Some(qname) = parsed.questions.first().map(|q| q.name.clone()) else {
            return response;
        };

        let answers = balancer.reorder(&qname, &mut parsed.answers);
        let additionals = balancer.reorder(&qname, &mut parsed.additionals);
        if !answers && !additionals {
            return response;
        }

        match packet::encode_packet(&parsed) {
            Ok(encoded) => {
                self.rewritten.fetch_add(1, Ordering::Relaxed);
                debug!("Rebalanced response {:#06x} for {} ({:?})", parsed.header.id, qname, parsed.header.rcode);
                encoded
            }
            Err(e) => {
                warn!("Failed to re-encode rebalanced response for {}: {}", qname, e);
                response
            }
        }
    }

    /// Handle TCP DNS queries (length-prefixed)
    pub async fn handle_tcp(&self, mut stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        debug!("TCP connection from {}", addr);

        loop {
            let mut len_buf = [0u8; 2];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let msg_len = u16::from_be_bytes(len_buf) as usize;
            if msg_len == 0 {
                break;
            }

            let mut msg_buf = vec![0u8; msg_len];
            stream.read_exact(&mut msg_buf).await?;

            let response = match self.handle_query(&msg_buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("TCP query from {} failed: {}", addr, e);
                    packet::build_servfail(&msg_buf)?
                }
            };

            let resp_len = u16::try_from(response.len())?.to_be_bytes();
            stream.write_all(&resp_len).await?;
            stream.write_all(&response).await?;
        }

        Ok(())
    }

    /// Get stats for Web UI
    pub fn get_stats(&self) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "total_queries": self.total_queries.load(Ordering::Relaxed),
            "rewritten_responses": self.rewritten.load(Ordering::Relaxed),
            "upstreams": self.upstream.get_stats(),
        });
        if let Some(ref balancer) = self.balancer {
            stats["loadbalance"] = balancer.get_stats();
        }
        stats
    }
}
