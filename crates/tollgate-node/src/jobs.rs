//! Background jobs: bucket sweep, retention cleanup, decay, load sampling,
//! conflict checks, peer sync workers and the replication listener.
//!
//! Jobs share nothing but the node's stores, so each can stop or restart
//! independently. All of them stop on one cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tollgate_limits::LoadSampler;
use tollgate_repl::PeerHandler;
use tracing::{debug, info, warn};

use crate::node::Node;

/// Running background jobs of one node.
pub struct BackgroundJobs {
    node: Arc<Node>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl BackgroundJobs {
    /// Start every job. `sampler` is polled only when load sampling is on.
    pub async fn start(node: Arc<Node>, sampler: Option<Arc<dyn LoadSampler>>) -> anyhow::Result<Self> {
        let jobs = Self {
            node: node.clone(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        let config = node.config().clone();

        let n = node.clone();
        jobs.spawn_periodic("bucket-sweep", config.retention.sweep_interval_ms, move || {
            let removed = n.sweep_buckets();
            if removed > 0 {
                debug!(removed, "bucket sweep");
            }
        });

        let n = node.clone();
        jobs.spawn_periodic("retention-cleanup", config.retention.cleanup_interval_ms, move || {
            n.cleanup();
        });

        let n = node.clone();
        jobs.spawn_periodic("decay", config.reputation.decay_check_interval_ms, move || {
            if let Err(e) = n.run_decay() {
                warn!(error = %e, "decay run failed");
            }
        });

        let n = node.clone();
        jobs.spawn_periodic("conflict-check", config.replication.conflict_check_interval_ms, move || {
            if let Err(e) = n.check_conflicts() {
                warn!(error = %e, "conflict check failed");
            }
        });

        if let Some(sampler) = sampler.filter(|_| config.node.load_sampling) {
            let n = node.clone();
            jobs.spawn_periodic("load-sampler", config.throttle.sample_interval_ms, move || {
                n.observe_load(sampler.sample(n.now_ms()));
            });
        }

        for peer in node.peers()? {
            jobs.spawn_peer_worker(&peer.node_id);
        }

        if let Some(addr) = &config.node.listen_addr {
            let listener = TcpListener::bind(addr).await?;
            let handler: Arc<dyn PeerHandler> = node.replicator().clone();
            let cancel = jobs.cancel.child_token();
            jobs.tracker.spawn(async move {
                if let Err(e) = tollgate_repl::serve(listener, handler, cancel).await {
                    warn!(error = %e, "replication listener failed");
                }
            });
        }

        info!(node = %node.node_id(), tasks = jobs.tracker.len(), "background jobs started");
        Ok(jobs)
    }

    /// Start a sync worker for a peer registered after startup.
    pub fn spawn_peer_worker(&self, node_id: &str) {
        let replicator = self.node.replicator().clone();
        self.tracker
            .spawn(replicator.run_peer(node_id.to_string(), self.cancel.child_token()));
    }

    /// Register a peer and start its sync worker.
    pub fn add_peer(&self, node_id: &str, endpoint: &str) -> crate::error::Result<()> {
        self.node.register_peer(node_id, endpoint)?;
        self.spawn_peer_worker(node_id);
        Ok(())
    }

    /// Number of running tasks.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Returns true if no task is running.
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Token that stops every job when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `tick` every `interval_ms` on the blocking pool, one tick at a time.
    fn spawn_periodic<F>(&self, name: &'static str, interval_ms: u64, tick: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cancel = self.cancel.child_token();
        let tick = Arc::new(tick);
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so jobs start one interval in.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let tick = tick.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
                            warn!(job = name, error = %e, "job tick failed");
                        }
                    }
                }
            }
            debug!(job = name, "job stopped");
        });
    }

    /// Stop every job and wait for in-progress work to finish.
    pub async fn shutdown(self) {
        info!("stopping background jobs");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("background jobs stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tollgate_limits::{LimitType, LoadSample, RuleSpec, Scope, ThrottleLevel};
    use tollgate_repl::LoopbackTransport;
    use tollgate_reputation::{MemoryKvStore, SystemClock};

    struct Overloaded;

    impl LoadSampler for Overloaded {
        fn sample(&self, now_ms: u64) -> LoadSample {
            LoadSample {
                cpu_pct: 99.0,
                memory_pct: 10.0,
                workers: 0,
                taken_at_ms: now_ms,
            }
        }
    }

    fn node(config: NodeConfig) -> Arc<Node> {
        Arc::new(
            Node::new(
                config,
                Arc::new(MemoryKvStore::new()),
                Arc::new(LoopbackTransport::new()),
                Arc::new(SystemClock),
            )
            .unwrap(),
        )
    }

    fn fast_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.listen_addr = None;
        config.throttle.sample_interval_ms = 10;
        config.retention.sweep_interval_ms = 10;
        config.retention.cleanup_interval_ms = 10;
        config.reputation.decay_check_interval_ms = 10;
        config.replication.conflict_check_interval_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_sampler_drives_throttle() {
        let node = node(fast_config());
        let jobs = BackgroundJobs::start(node.clone(), Some(Arc::new(Overloaded))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        jobs.shutdown().await;
        assert_eq!(node.throttle().level(), ThrottleLevel::Critical);
    }

    #[tokio::test]
    async fn test_sampling_disabled() {
        let mut config = fast_config();
        config.node.load_sampling = false;
        let node = node(config);
        let jobs = BackgroundJobs::start(node.clone(), Some(Arc::new(Overloaded))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        jobs.shutdown().await;
        assert_eq!(node.throttle().level(), ThrottleLevel::None);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_tasks() {
        let node = node(fast_config());
        node.create_rule(RuleSpec::new("api", Scope::Ip, LimitType::PerSecond, 1))
            .unwrap();
        let jobs = BackgroundJobs::start(node.clone(), None).await.unwrap();
        assert_eq!(jobs.len(), 4);
        jobs.add_peer("node-2", "nowhere").unwrap();
        assert_eq!(jobs.len(), 5);
        let token = jobs.cancel_token();
        jobs.shutdown().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_slow_job_leaves_runtime_responsive() {
        let jobs = BackgroundJobs {
            node: node(fast_config()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = ticks.clone();
        jobs.spawn_periodic("slow", 5, move || {
            std::thread::sleep(Duration::from_millis(200));
            counted.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(150), "runtime stalled for {:?}", started.elapsed());

        jobs.shutdown().await;
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_listener_serves_peers() {
        let mut config = fast_config();
        config.node.listen_addr = Some("127.0.0.1:0".to_string());
        let node = node(config);
        let jobs = BackgroundJobs::start(node, None).await.unwrap();
        assert_eq!(jobs.len(), 5);
        jobs.shutdown().await;
    }
}
