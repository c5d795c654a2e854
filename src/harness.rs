//! Cluster Harness
//!
//! Runs several nodes against one in-memory consensus service. Every node
//! contends for the same route and runs a one-shot task once it leads,
//! lingers for a random time, then shuts down so the next node can take
//! over. The run succeeds when every node has completed its task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::WolfHaConfig;
use crate::consensus::{ConsensusService, MemoryConsensus, MemoryConsensusConfig};
use crate::error::{Error, Result};
use crate::lifecycle::RouteActivation;
use crate::node::RouteNode;

/// Harness configuration
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Number of nodes
    pub nodes: usize,
    pub namespace: String,
    pub route: String,
    /// Maximum random delay before a node starts
    pub start_jitter: Duration,
    /// Longest time a node keeps leading after its task ran; the actual
    /// linger is drawn from the upper half of this range
    pub linger: Duration,
    /// Upper bound for the whole run
    pub run_timeout: Duration,
    /// Grace period for route drain
    pub drain_grace: Duration,
    pub consensus: MemoryConsensusConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            namespace: "ns".to_string(),
            route: "r".to_string(),
            start_jitter: Duration::from_millis(500),
            linger: Duration::from_millis(1000),
            run_timeout: Duration::from_secs(60),
            drain_grace: Duration::from_secs(1),
            consensus: MemoryConsensusConfig::default(),
        }
    }
}

/// One completed route task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub node_id: String,
    pub route: String,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of a harness run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub namespace: String,
    pub route: String,
    /// Every node id that took part
    pub nodes: Vec<String>,
    /// Completed tasks in completion order
    pub completed: Vec<RunRecord>,
    /// Nodes still registered once the run ended
    pub still_joined: Vec<String>,
    /// Highest number of nodes running the route at once
    pub max_concurrent: usize,
    /// Entries in the consensus log at the end of the run
    pub commit_index: u64,
    pub elapsed_ms: u64,
}

impl RunReport {
    /// Nodes that never completed their task
    pub fn missing(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|id| !self.completed.iter().any(|r| &r.node_id == *id))
            .cloned()
            .collect()
    }

    /// Check whether every node completed exactly once
    pub fn all_completed(&self) -> bool {
        self.missing().is_empty() && self.completed.len() == self.nodes.len()
    }
}

/// Shared concurrency gauge across nodes
#[derive(Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Route activation that runs its task the first time it is activated
struct OneShotRoute {
    node_id: String,
    sink: Mutex<Option<(mpsc::Sender<RunRecord>, oneshot::Sender<()>)>>,
    gauge: Arc<Gauge>,
}

#[async_trait::async_trait]
impl RouteActivation for OneShotRoute {
    async fn activate(&self, route: &str) -> Result<()> {
        let running = self.gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(running, Ordering::SeqCst);

        let Some((records, done)) = self.sink.lock().await.take() else {
            tracing::debug!("{} already ran {}", self.node_id, route);
            return Ok(());
        };

        tracing::info!("{} running {}", self.node_id, route);
        let record = RunRecord {
            node_id: self.node_id.clone(),
            route: route.to_string(),
            completed_at: chrono::Utc::now(),
        };
        records
            .send(record)
            .await
            .map_err(|_| Error::Internal("run record channel closed".into()))?;
        let _ = done.send(());
        Ok(())
    }

    async fn deactivate(&self, _route: &str) -> Result<()> {
        self.gauge.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Runs a simulated cluster
pub struct ClusterHarness {
    config: HarnessConfig,
}

impl ClusterHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    fn node_ids(&self) -> Vec<String> {
        (0..self.config.nodes).map(|i| format!("n{}", i)).collect()
    }

    fn node_config(&self, node_id: &str) -> WolfHaConfig {
        let mut config = WolfHaConfig::for_node(node_id, self.config.namespace.clone());
        config.node.routes = vec![self.config.route.clone()];
        config.cluster.session_timeout_ms = self.config.consensus.session_timeout.as_millis() as u64;
        config.lifecycle.drain_grace_ms = self.config.drain_grace.as_millis() as u64;
        config
    }

    /// Run every node to completion
    pub async fn run(&self) -> Result<RunReport> {
        if self.config.nodes == 0 {
            return Err(Error::Config("harness needs at least one node".into()));
        }

        let started = Instant::now();
        let consensus = MemoryConsensus::start(self.config.consensus.clone());
        let gauge = Arc::new(Gauge::default());
        let nodes = self.node_ids();

        tracing::info!(
            "Starting {} nodes in {} contending for {}",
            nodes.len(),
            self.config.namespace,
            self.config.route
        );

        let cancel = CancellationToken::new();
        let mut streams = Vec::with_capacity(nodes.len());
        let mut tasks = Vec::with_capacity(nodes.len());
        for node_id in &nodes {
            let (records_tx, records_rx) = mpsc::channel(1);
            streams.push(ReceiverStream::new(records_rx));

            let (done_tx, done_rx) = oneshot::channel();
            let activation = Arc::new(OneShotRoute {
                node_id: node_id.clone(),
                sink: Mutex::new(Some((records_tx, done_tx))),
                gauge: Arc::clone(&gauge),
            });

            let run = NodeRun {
                config: self.node_config(node_id),
                service: consensus.clone(),
                activation,
                done: done_rx,
                jitter: random_delay(Duration::ZERO, self.config.start_jitter),
                linger: random_delay(self.config.linger / 2, self.config.linger),
                cancel: cancel.clone(),
            };
            tasks.push(tokio::spawn(run.run()));
        }

        let mut merged = futures::stream::select_all(streams);
        let mut completed = Vec::with_capacity(nodes.len());
        let collect = async {
            while let Some(record) = merged.next().await {
                completed.push(record);
                if completed.len() == nodes.len() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.config.run_timeout, collect).await.is_err() {
            tracing::warn!(
                "Run timed out after {:?} with {}/{} completed, shutting nodes down",
                self.config.run_timeout,
                completed.len(),
                nodes.len()
            );
            cancel.cancel();
        }

        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Node failed: {}", e),
                Err(e) => tracing::error!("Node task failed: {}", e),
            }
        }

        let still_joined = match consensus.members(&self.config.namespace).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!("Could not read final membership: {}", e);
                Vec::new()
            }
        };
        let commit_index = consensus.commit_index().await;
        consensus.shutdown();

        Ok(RunReport {
            namespace: self.config.namespace.clone(),
            route: self.config.route.clone(),
            nodes,
            completed,
            still_joined,
            max_concurrent: gauge.peak.load(Ordering::SeqCst),
            commit_index,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn random_delay(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(min_ms);
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// One node's part in a run
struct NodeRun {
    config: WolfHaConfig,
    service: Arc<dyn ConsensusService>,
    activation: Arc<OneShotRoute>,
    done: oneshot::Receiver<()>,
    jitter: Duration,
    linger: Duration,
    /// Fires when the run is abandoned
    cancel: CancellationToken,
}

impl NodeRun {
    async fn run(self) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.jitter) => {}
        }

        let node = RouteNode::start(&self.config, self.service, self.activation).await?;

        let ran = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            done = self.done => Some(done.is_ok()),
        };

        match ran {
            Some(true) => {
                node.schedule_shutdown(self.linger).await;
                tokio::select! {
                    _ = node.departed() => Ok(()),
                    _ = self.cancel.cancelled() => node.shutdown().await,
                }
            }
            Some(false) => {
                node.shutdown().await?;
                Err(Error::Internal(format!("{} dropped its route task", node.node_id())))
            }
            None => node.shutdown().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(nodes: usize) -> HarnessConfig {
        HarnessConfig {
            nodes,
            start_jitter: Duration::from_millis(100),
            linger: Duration::from_millis(100),
            run_timeout: Duration::from_secs(20),
            drain_grace: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_every_node_completes_once() {
        let report = ClusterHarness::new(fast_config(3)).run().await.unwrap();

        assert!(report.all_completed(), "missing: {:?}", report.missing());
        assert_eq!(report.nodes, vec!["n0", "n1", "n2"]);
        assert_eq!(report.max_concurrent, 1);
        assert!(report.commit_index > 0);
        assert!(report.still_joined.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_run_shuts_every_node_down() {
        let started = std::time::Instant::now();
        let report = ClusterHarness::new(HarnessConfig {
            nodes: 2,
            start_jitter: Duration::ZERO,
            linger: Duration::from_secs(30),
            run_timeout: Duration::from_millis(800),
            drain_grace: Duration::from_millis(200),
            ..Default::default()
        })
        .run()
        .await
        .unwrap();

        // The first leader lingers past the timeout, so the second never runs
        assert_eq!(report.completed.len(), 1);
        assert!(!report.all_completed());
        assert!(report.still_joined.is_empty(), "left behind: {:?}", report.still_joined);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_single_node_run() {
        let report = ClusterHarness::new(fast_config(1)).run().await.unwrap();
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].node_id, "n0");
        assert_eq!(report.completed[0].route, "r");
    }

    #[tokio::test]
    async fn test_zero_nodes_is_rejected() {
        let result = ClusterHarness::new(fast_config(0)).run().await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_report_missing() {
        let report = RunReport {
            namespace: "ns".into(),
            route: "r".into(),
            nodes: vec!["n0".into(), "n1".into()],
            completed: vec![RunRecord {
                node_id: "n1".into(),
                route: "r".into(),
                completed_at: chrono::Utc::now(),
            }],
            still_joined: vec![],
            max_concurrent: 1,
            commit_index: 4,
            elapsed_ms: 10,
        };
        assert_eq!(report.missing(), vec!["n0".to_string()]);
        assert!(!report.all_completed());
    }
}
