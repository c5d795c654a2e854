//! Route Node
//!
//! Wires registration, election and lifecycle together for one node
//! from its configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::config::WolfHaConfig;
use crate::consensus::ConsensusService;
use crate::error::Result;
use crate::lifecycle::{LifecycleController, RouteActivation, RouteState};
use crate::registration::{MembershipHandle, NodeRegistration};
use crate::state::{Election, ElectionEngine, NodeStatus};

/// A running node in one namespace
pub struct RouteNode {
    handle: MembershipHandle,
    engine: Arc<ElectionEngine>,
    controller: Arc<LifecycleController>,
}

impl RouteNode {
    /// Join the configured namespace and contend for the configured routes
    pub async fn start(
        config: &WolfHaConfig,
        service: Arc<dyn ConsensusService>,
        activation: Arc<dyn RouteActivation>,
    ) -> Result<Self> {
        config.validate()?;

        let registration = NodeRegistration::new(service, config.registration_config());
        let handle = registration
            .join(&config.node.namespace, &config.node.id, config.cluster.peers.clone())
            .await?;

        let engine = match ElectionEngine::start(handle.clone(), config.election_config()).await {
            Ok(engine) => engine,
            Err(e) => {
                // Do not stay registered without an engine
                let _ = handle.leave().await;
                return Err(e);
            }
        };

        let controller = LifecycleController::new(
            Arc::clone(&engine),
            activation,
            config.lifecycle_config(),
        );

        let node = Self {
            handle,
            engine,
            controller,
        };

        for route in &config.node.routes {
            if let Err(e) = node.manage(route).await {
                let _ = node.shutdown().await;
                return Err(e);
            }
        }

        tracing::info!(
            "Node {} started in {} with {} route(s)",
            node.node_id(),
            node.namespace(),
            config.node.routes.len()
        );
        Ok(node)
    }

    pub fn node_id(&self) -> &str {
        self.handle.node_id()
    }

    pub fn namespace(&self) -> &str {
        self.handle.namespace()
    }

    pub fn handle(&self) -> &MembershipHandle {
        &self.handle
    }

    pub fn engine(&self) -> &Arc<ElectionEngine> {
        &self.engine
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Contend for an additional route
    pub async fn manage(&self, route: &str) -> Result<()> {
        self.controller.manage(route).await
    }

    pub async fn status(&self) -> NodeStatus {
        self.handle.status().await
    }

    pub async fn route_state(&self, route: &str) -> Option<RouteState> {
        self.controller.state(route).await
    }

    pub async fn election(&self, route: &str) -> Option<Election> {
        self.engine.election(route).await
    }

    /// Shut down after `delay`
    pub async fn schedule_shutdown(&self, delay: Duration) {
        self.controller.schedule_shutdown(delay).await
    }

    /// Drain all routes and leave the namespace
    pub async fn shutdown(&self) -> Result<()> {
        self.controller.shutdown().await
    }

    /// Wait until the node has shut down
    pub async fn departed(&self) {
        self.controller.departed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::consensus::{MemoryConsensus, MemoryConsensusConfig};
    use crate::error::Error;

    #[derive(Default)]
    struct Counting {
        active: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RouteActivation for Counting {
        async fn activate(&self, _route: &str) -> Result<()> {
            self.active.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deactivate(&self, _route: &str) -> Result<()> {
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(id: &str) -> WolfHaConfig {
        let mut config = WolfHaConfig::for_node(id, "ns");
        config.node.routes = vec!["timer".to_string(), "poller".to_string()];
        config.lifecycle.drain_grace_ms = 500;
        config
    }

    async fn wait_active(node: &RouteNode, route: &str) {
        let mut rx = node.controller().watch(route).await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == RouteState::Active))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_node_starts_configured_routes() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let activation = Arc::new(Counting::default());

        let node = RouteNode::start(&config("n0"), consensus.clone(), activation.clone())
            .await
            .unwrap();
        wait_active(&node, "timer").await;
        wait_active(&node, "poller").await;
        assert_eq!(activation.active.load(Ordering::SeqCst), 2);
        assert_eq!(node.election("timer").await.unwrap().leader.as_deref(), Some("n0"));

        node.shutdown().await.unwrap();
        assert_eq!(node.status().await, NodeStatus::Departed);
        assert_eq!(node.route_state("timer").await, Some(RouteState::Departed));
        assert_eq!(activation.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_node_id_is_rejected() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let activation = Arc::new(Counting::default());

        let _first = RouteNode::start(&config("n0"), consensus.clone(), activation.clone())
            .await
            .unwrap();
        let second = RouteNode::start(&config("n0"), consensus.clone(), activation).await;
        assert!(matches!(second, Err(Error::DuplicateNode { .. })));
    }
}
