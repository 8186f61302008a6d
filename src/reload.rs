use std::sync::atomic::Ordering;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::balancer::{ContentDigest, WeightedBalancer};
use crate::weights::{parse_weight_bytes, WeightError};

/// Outcome of a successful refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Reloaded { domains: usize },
    /// Same bytes as the table currently in use
    Unchanged,
}

impl WeightedBalancer {
    /// Re-read the weight file and swap in a new table if its content changed.
    /// The file is read and parsed without holding the table lock; a parse
    /// failure leaves the current table in place.
    pub async fn refresh(&self) -> Result<Refresh, WeightError> {
        let data = tokio::fs::read(&self.weight_path).await.map_err(|source| {
            self.reload_failures.fetch_add(1, Ordering::Relaxed);
            WeightError::Open {
                path: self.weight_path.clone(),
                source,
            }
        })?;

        let digest: ContentDigest = Sha256::digest(&data).into();
        if self.table.lock().digest == Some(digest) {
            debug!("Weight file {} not changed", self.weight_path.display());
            return Ok(Refresh::Unchanged);
        }

        let file = self.weight_path.display().to_string();
        let parsed = parse_weight_bytes(&data, &file).inspect_err(|_| {
            self.reload_failures.fetch_add(1, Ordering::Relaxed);
        })?;

        let domains = parsed.len();
        self.install(digest, parsed);
        info!("Successfully reloaded weight file {} ({} domains)", file, domains);
        Ok(Refresh::Reloaded { domains })
    }

    /// Startup load. A missing file is tolerated when periodic reload will
    /// retry it; everything else is returned to the caller.
    pub async fn initial_load(&self) -> Result<(), WeightError> {
        match self.refresh().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_open() && !self.reload.is_zero() => {
                warn!("Failed to open weight file: {}. Will try again in {:?}", e, self.reload);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reload loop - re-read the weight file every `reload` until shutdown.
    /// Does nothing when the reload interval is zero.
    pub async fn run_reload_loop(&self, mut shutdown: watch::Receiver<bool>) {
        if self.reload.is_zero() {
            return;
        }

        info!("Weight reload loop started (interval: {:?})", self.reload);
        let start = tokio::time::Instant::now() + self.reload;
        let mut ticker = tokio::time::interval_at(start, self.reload);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(_) => {}
                        Err(e) if e.is_open() => warn!("{}. Will try again in {:?}", e, self.reload),
                        Err(e) => error!("Weight reload failed, keeping current table: {}", e),
                    }
                }
            }
        }
        info!("Weight reload loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::packet::{parse_packet, testutil};
    use crate::selector::SelectionMode;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    const ONE_DOMAIN: &str = "w1,example.org\n192.168.1.15 10\n192.168.1.14 20\n";
    const TWO_DOMAINS: &str = "w1.example.org\n192.168.1.15 10\n192.168.1.14 20\n\nw2.example.org\n192.168.2.16 11\n";

    static FILE_SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_weight_file(content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "neko-wrr-test-{}-{}.weights",
            std::process::id(),
            FILE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn balancer(path: &PathBuf, reload: Duration, mode: SelectionMode) -> WeightedBalancer {
        WeightedBalancer::new(path.clone(), reload, mode, Some(1))
    }

    #[tokio::test]
    async fn test_refresh_loads_table() {
        let path = temp_weight_file(ONE_DOMAIN);
        let balancer = balancer(&path, Duration::ZERO, SelectionMode::Randomized);

        assert_eq!(balancer.refresh().await.unwrap(), Refresh::Reloaded { domains: 1 });
        let domains = balancer.list_domains();
        assert_eq!(domains[0]["name"], "w1,example.org.");
        assert_eq!(domains[0]["weight_sum"], 30);
        assert_eq!(domains[0]["weights"][0]["address"], "192.168.1.14");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_content_keeps_selector_state() {
        let path = temp_weight_file("d.test\n10.0.0.1 2\n10.0.0.2 1\n");
        let balancer = balancer(&path, Duration::ZERO, SelectionMode::Deterministic);
        balancer.refresh().await.unwrap();

        // advance the cycle twice: .1 .1 -> next is .2
        let raw = testutil::response(1, "d.test", &[
            testutil::a("d.test", "10.0.0.1"),
            testutil::a("d.test", "10.0.0.2"),
        ], &[]);
        let answer = parse_packet(&raw).unwrap().answers;
        for _ in 0..2 {
            assert!(balancer.reorder("d.test", &mut answer.clone()));
        }
        assert_eq!(balancer.expected_top("d.test"), Some("10.0.0.2".parse().unwrap()));

        // same bytes (even rewritten) -> no replacement
        std::fs::write(&path, "d.test\n10.0.0.1 2\n10.0.0.2 1\n").unwrap();
        assert_eq!(balancer.refresh().await.unwrap(), Refresh::Unchanged);
        assert_eq!(balancer.expected_top("d.test"), Some("10.0.0.2".parse().unwrap()));
        assert_eq!(balancer.reloads.load(Ordering::Relaxed), 1);

        // any content change rebuilds the table and restarts the cycle
        std::fs::write(&path, "d.test\n10.0.0.1 2\n10.0.0.2 1\n# touched\n").unwrap();
        assert_eq!(balancer.refresh().await.unwrap(), Refresh::Reloaded { domains: 1 });
        assert_eq!(balancer.expected_top("d.test"), Some("10.0.0.1".parse().unwrap()));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_previous_table() {
        let path = temp_weight_file(TWO_DOMAINS);
        let balancer = balancer(&path, Duration::ZERO, SelectionMode::Randomized);
        balancer.refresh().await.unwrap();

        std::fs::write(&path, "w3.example.org\n10.0.0.1 10\n10.0.0.2 300\n").unwrap();
        let err = balancer.refresh().await.unwrap_err();
        assert!(matches!(err, WeightError::InvalidWeight { .. }));
        assert!(!err.is_open());

        let names: Vec<String> = balancer
            .list_domains()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["w1.example.org.", "w2.example.org."]);
        assert_eq!(balancer.reload_failures.load(Ordering::Relaxed), 1);

        // the broken content is reported again on the next attempt
        assert!(balancer.refresh().await.is_err());

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_is_distinct() {
        let path = std::env::temp_dir().join("neko-wrr-test-does-not-exist.weights");
        let balancer = balancer(&path, Duration::ZERO, SelectionMode::Randomized);
        let err = balancer.refresh().await.unwrap_err();
        assert!(err.is_open());
        assert!(err.to_string().contains("open error"));
    }

    #[tokio::test]
    async fn test_open_failure_keeps_previous_table() {
        let path = temp_weight_file(TWO_DOMAINS);
        let balancer = balancer(&path, Duration::from_secs(30), SelectionMode::Deterministic);
        balancer.refresh().await.unwrap();
        let before = balancer.list_domains();
        let top = balancer.expected_top("w1.example.org");
        assert_eq!(top, Some("192.168.1.14".parse().unwrap()));

        std::fs::remove_file(&path).unwrap();
        let err = balancer.refresh().await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(balancer.list_domains(), before);
        assert_eq!(balancer.expected_top("w1.example.org"), top);
        assert_eq!(balancer.reloads.load(Ordering::Relaxed), 1);
        assert_eq!(balancer.reload_failures.load(Ordering::Relaxed), 1);

        // once the file is back with the same bytes nothing is rebuilt
        std::fs::write(&path, TWO_DOMAINS).unwrap();
        assert_eq!(balancer.refresh().await.unwrap(), Refresh::Unchanged);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_initial_load_tolerates_missing_file_only_with_reload() {
        let path = std::env::temp_dir().join("neko-wrr-test-missing-at-startup.weights");
        assert!(balancer(&path, Duration::from_secs(30), SelectionMode::Randomized)
            .initial_load().await
            .is_ok());
        assert!(balancer(&path, Duration::ZERO, SelectionMode::Randomized)
            .initial_load().await
            .unwrap_err()
            .is_open());

        let bad = temp_weight_file("10.0.0.1 1\n");
        let err = balancer(&bad, Duration::from_secs(30), SelectionMode::Randomized)
            .initial_load().await
            .unwrap_err();
        assert!(matches!(err, WeightError::MissingDomain { .. }));
        std::fs::remove_file(&bad).unwrap();
    }

    #[tokio::test]
    async fn test_periodic_reload_picks_up_changes_and_stops() {
        let path = temp_weight_file(ONE_DOMAIN);
        let balancer = Arc::new(balancer(&path, Duration::from_millis(10), SelectionMode::Randomized));
        balancer.initial_load().await.unwrap();
        assert_eq!(balancer.list_domains().len(), 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let balancer = balancer.clone();
            tokio::spawn(async move { balancer.run_reload_loop(shutdown_rx).await })
        };

        std::fs::write(&path, TWO_DOMAINS).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(balancer.list_domains().len(), 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reload loop should stop on shutdown")
            .unwrap();

        // no reloads after shutdown
        let reloads = balancer.reloads.load(Ordering::Relaxed);
        std::fs::write(&path, ONE_DOMAIN).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(balancer.reloads.load(Ordering::Relaxed), reloads);
        assert_eq!(balancer.list_domains().len(), 2);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_returns_immediately() {
        let path = temp_weight_file(ONE_DOMAIN);
        let balancer = balancer(&path, Duration::ZERO, SelectionMode::Randomized);
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_millis(100), balancer.run_reload_loop(rx))
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();
    }
}
