//! Node Registration
//!
//! Joins a node into a namespace group on the consensus service and keeps
//! its session alive. The returned [`MembershipHandle`] is the node's
//! identity for every later operation and the single place departure is
//! decided, whether voluntary (`leave`) or implicit (session expiry).

use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::consensus::{ConsensusService, SessionId};
use crate::error::{Error, Result};
use crate::state::NodeStatus;

/// Registration configuration
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Upper bound for one join attempt
    pub join_timeout: Duration,
    /// Attempts before giving up on the quorum
    pub connect_attempts: u32,
    /// First retry delay
    pub backoff_base: Duration,
    /// Retry delay ceiling
    pub backoff_max: Duration,
    /// Session timeout enforced by the consensus service
    pub session_timeout: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(2),
            connect_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            session_timeout: Duration::from_secs(3),
        }
    }
}

/// Exponential backoff with up to 50% random jitter
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(max);
    let jitter_ms = capped.as_millis() as u64 / 2;
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
        0
    };
    capped + Duration::from_millis(jitter)
}

struct HandleInner {
    namespace: String,
    node_id: String,
    peers: Vec<String>,
    session: SessionId,
    status: RwLock<NodeStatus>,
    /// Fires on leave or session loss
    departed: CancellationToken,
    service: Arc<dyn ConsensusService>,
}

/// Membership of one node in one namespace
#[derive(Clone)]
pub struct MembershipHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for MembershipHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipHandle")
            .field("namespace", &self.inner.namespace)
            .field("node_id", &self.inner.node_id)
            .field("session", &self.inner.session)
            .finish()
    }
}

impl MembershipHandle {
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn peers(&self) -> &[String] {
        &self.inner.peers
    }

    pub fn session(&self) -> &SessionId {
        &self.inner.session
    }

    pub(crate) fn service(&self) -> &Arc<dyn ConsensusService> {
        &self.inner.service
    }

    /// Current membership status
    pub async fn status(&self) -> NodeStatus {
        *self.inner.status.read().await
    }

    /// Check whether the node has left, voluntarily or not
    pub fn is_departed(&self) -> bool {
        self.inner.departed.is_cancelled()
    }

    /// Token cancelled once the node departs. Every wait tied to this
    /// membership selects on it.
    pub fn departure_token(&self) -> CancellationToken {
        self.inner.departed.child_token()
    }

    /// Wait until the node has departed
    pub async fn departed(&self) {
        self.inner.departed.cancelled().await
    }

    /// Leave the namespace group.
    ///
    /// Idempotent: calling it again, or after the session already
    /// expired, is a no-op.
    pub async fn leave(&self) -> Result<()> {
        {
            let mut status = self.inner.status.write().await;
            match *status {
                NodeStatus::Leaving | NodeStatus::Departed => {
                    tracing::debug!(
                        "Node {} already {}, leave is a no-op",
                        self.inner.node_id,
                        *status
                    );
                    return Ok(());
                }
                _ => *status = NodeStatus::Leaving,
            }
        }

        tracing::info!(
            "Node {} leaving namespace {}",
            self.inner.node_id,
            self.inner.namespace
        );

        // Cancel pending lock waits before the group forgets us
        self.inner.departed.cancel();

        let result = match self.inner.service.leave_group(&self.inner.session).await {
            Ok(()) => Ok(()),
            Err(Error::SessionExpired(_)) | Err(Error::UnknownSession(_)) => {
                tracing::debug!("Session {} already gone", self.inner.session);
                Ok(())
            }
            Err(e) => {
                // The session will expire on its own once keep-alives stop
                tracing::warn!(
                    "Leave for {} not acknowledged ({}), relying on session expiry",
                    self.inner.node_id,
                    e
                );
                Err(e)
            }
        };

        *self.inner.status.write().await = NodeStatus::Departed;
        result
    }

    /// Mark the node departed after its session was lost
    async fn expire(&self, reason: &str) {
        let mut status = self.inner.status.write().await;
        if *status == NodeStatus::Departed {
            return;
        }
        tracing::warn!(
            "Node {} lost its session in {}: {}",
            self.inner.node_id,
            self.inner.namespace,
            reason
        );
        *status = NodeStatus::Departed;
        self.inner.departed.cancel();
    }
}

/// Registers nodes into namespace groups
pub struct NodeRegistration {
    service: Arc<dyn ConsensusService>,
    config: RegistrationConfig,
}

impl NodeRegistration {
    /// Create a registration front-end for a consensus service
    pub fn new(service: Arc<dyn ConsensusService>, config: RegistrationConfig) -> Self {
        Self { service, config }
    }

    /// Join a namespace group.
    ///
    /// Transient failures are retried with exponential backoff; a
    /// duplicate node id fails immediately.
    pub async fn join(
        &self,
        namespace: &str,
        node_id: &str,
        peers: Vec<String>,
    ) -> Result<MembershipHandle> {
        let mut last_error = None;

        for attempt in 0..self.config.connect_attempts {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1, self.config.backoff_base, self.config.backoff_max);
                tracing::debug!("Retrying join of {} in {:?}", node_id, delay);
                tokio::time::sleep(delay).await;
            }

            let outcome = tokio::time::timeout(
                self.config.join_timeout,
                self.service.join_group(namespace, node_id),
            )
            .await
            .unwrap_or_else(|_| Err(Error::ConnectionTimeout(format!("consensus quorum for {}", namespace))));

            match outcome {
                Ok(session) => {
                    tracing::info!(
                        "Node {} joined namespace {} (session {})",
                        node_id,
                        namespace,
                        session
                    );
                    let handle = MembershipHandle {
                        inner: Arc::new(HandleInner {
                            namespace: namespace.to_string(),
                            node_id: node_id.to_string(),
                            peers,
                            session,
                            status: RwLock::new(NodeStatus::Active),
                            departed: CancellationToken::new(),
                            service: Arc::clone(&self.service),
                        }),
                    };
                    self.spawn_keep_alive(handle.clone());
                    return Ok(handle);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "Join attempt {}/{} for {} failed: {}",
                        attempt + 1,
                        self.config.connect_attempts,
                        node_id,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::error!("Join of {} rejected: {}", node_id, e);
                    return Err(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(Error::Connectivity(format!(
            "{} could not join {} after {} attempts: {}",
            node_id, namespace, self.config.connect_attempts, reason
        )))
    }

    /// Leave a namespace group
    pub async fn leave(&self, handle: &MembershipHandle) -> Result<()> {
        handle.leave().await
    }

    /// Renew the session until the node departs. A session that could
    /// not be renewed in time is treated as lost before the consensus
    /// service expires it.
    fn spawn_keep_alive(&self, handle: MembershipHandle) {
        let session_timeout = self.config.session_timeout;
        let interval = (session_timeout / 3).max(Duration::from_millis(1));
        let token = handle.departure_token();

        tokio::spawn(async move {
            let mut last_renewal = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match handle.service().keep_alive(handle.session()).await {
                    Ok(()) => last_renewal = Instant::now(),
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("Keep-alive for {} failed: {}", handle.node_id(), e);
                        // Give up one tick before the service would expire us
                        if last_renewal.elapsed() + interval >= session_timeout {
                            handle.expire("no renewal within session timeout").await;
                            break;
                        }
                    }
                    Err(e) => {
                        handle.expire(&e.to_string()).await;
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{MemoryConsensus, MemoryConsensusConfig};

    fn fast_config() -> RegistrationConfig {
        RegistrationConfig {
            join_timeout: Duration::from_millis(100),
            connect_attempts: 3,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            session_timeout: Duration::from_millis(300),
        }
    }

    fn consensus() -> Arc<MemoryConsensus> {
        Arc::new(MemoryConsensus::new(MemoryConsensusConfig {
            session_timeout: Duration::from_millis(300),
            ..Default::default()
        }))
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let base = Duration::from_millis(10);
        let max = Duration::from_millis(100);

        let first = backoff_delay(0, base, max);
        assert!(first >= base && first <= base + base / 2);

        let late = backoff_delay(20, base, max);
        assert!(late >= max && late <= max + max / 2);
    }

    #[tokio::test]
    async fn test_join_and_leave_is_idempotent() {
        let consensus = consensus();
        let registration = NodeRegistration::new(consensus.clone(), fast_config());

        let handle = registration.join("ns", "n0", vec![]).await.unwrap();
        assert_eq!(handle.status().await, NodeStatus::Active);
        assert_eq!(consensus.members("ns").await.unwrap(), vec!["n0".to_string()]);

        registration.leave(&handle).await.unwrap();
        assert_eq!(handle.status().await, NodeStatus::Departed);
        assert!(handle.is_departed());
        let commits = consensus.commit_index().await;

        // Second leave changes nothing
        registration.leave(&handle).await.unwrap();
        assert_eq!(consensus.commit_index().await, commits);
        assert!(consensus.members("ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_node_is_not_retried() {
        let consensus = consensus();
        let registration = NodeRegistration::new(consensus.clone(), fast_config());

        let _first = registration.join("ns", "n0", vec![]).await.unwrap();
        let err = registration.join("ns", "n0", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateNode { .. }));
    }

    #[tokio::test]
    async fn test_join_without_quorum_fails_with_connectivity() {
        let consensus = consensus();
        consensus.set_available(1);
        let registration = NodeRegistration::new(consensus.clone(), fast_config());

        let err = registration.join("ns", "n0", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_keep_alive_holds_session() {
        let consensus = MemoryConsensus::start(MemoryConsensusConfig {
            session_timeout: Duration::from_millis(300),
            reap_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let registration = NodeRegistration::new(consensus.clone(), fast_config());
        let handle = registration.join("ns", "n0", vec![]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(handle.status().await, NodeStatus::Active);
        assert_eq!(consensus.members("ns").await.unwrap(), vec!["n0".to_string()]);
        consensus.shutdown();
    }

    #[tokio::test]
    async fn test_partitioned_node_departs_before_server_expiry() {
        let consensus = MemoryConsensus::start(MemoryConsensusConfig {
            session_timeout: Duration::from_millis(300),
            reap_interval: Duration::from_millis(5),
            ..Default::default()
        });
        let registration = NodeRegistration::new(consensus.clone(), fast_config());
        let handle = registration.join("ns", "n0", vec![]).await.unwrap();

        consensus.partition(handle.session()).await;
        tokio::time::timeout(Duration::from_secs(2), handle.departed())
            .await
            .unwrap();

        // The service still holds the session, so nobody else can have
        // taken over anything this node owned
        assert_eq!(consensus.members("ns").await.unwrap(), vec!["n0".to_string()]);
        consensus.shutdown();
    }

    #[tokio::test]
    async fn test_expired_session_marks_departed() {
        let consensus = consensus();
        let registration = NodeRegistration::new(consensus.clone(), fast_config());
        let handle = registration.join("ns", "n0", vec![]).await.unwrap();

        consensus.expire_session(handle.session()).await;
        tokio::time::timeout(Duration::from_secs(2), handle.departed())
            .await
            .unwrap();
        assert_eq!(handle.status().await, NodeStatus::Departed);

        // Leave after implicit departure is a no-op
        handle.leave().await.unwrap();
    }
}
