//! In-memory consensus service
//!
//! A single-process stand-in for a replicated consensus cluster. Every
//! mutation runs under one lock and is appended to a command log before
//! its notification is broadcast, so all observers see one linear
//! history. Replica loss and client partitions are simulated so that
//! quorum failures and session expiry can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    ConsensusService, EventStream, LockEvent, LockGrant, MembershipChange, MembershipEvent,
    SessionId,
};
use crate::error::{Error, Result};

/// In-memory consensus configuration
#[derive(Debug, Clone)]
pub struct MemoryConsensusConfig {
    /// Number of simulated replicas
    pub replicas: usize,
    /// Sessions expire after this long without a keep-alive
    pub session_timeout: Duration,
    /// How often the reaper looks for expired sessions
    pub reap_interval: Duration,
    /// Notification buffer per subscriber
    pub channel_capacity: usize,
}

impl Default for MemoryConsensusConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            session_timeout: Duration::from_secs(3),
            reap_interval: Duration::from_millis(100),
            channel_capacity: 1024,
        }
    }
}

/// Committed state machine command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Join {
        namespace: String,
        node_id: String,
        session: SessionId,
    },
    Leave {
        session: SessionId,
    },
    Expire {
        session: SessionId,
    },
    Grant {
        namespace: String,
        resource: String,
        node_id: String,
        term: u64,
    },
    Release {
        namespace: String,
        resource: String,
        node_id: String,
        term: u64,
    },
}

/// Entry of the command log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub index: u64,
    pub committed_at: chrono::DateTime<chrono::Utc>,
    pub command: Command,
}

struct Session {
    namespace: String,
    node_id: String,
    deadline: Instant,
}

#[derive(Default)]
struct LockState {
    holder: Option<(SessionId, String)>,
    term: u64,
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    /// Members per namespace, in join order
    groups: HashMap<String, Vec<String>>,
    locks: HashMap<(String, String), LockState>,
    log: Vec<LogRecord>,
    expired: HashSet<SessionId>,
    partitioned: HashSet<SessionId>,
}

/// Linearizable in-process membership and lock service
pub struct MemoryConsensus {
    config: MemoryConsensusConfig,
    state: Mutex<State>,
    available: AtomicUsize,
    membership_tx: broadcast::Sender<MembershipEvent>,
    lock_tx: broadcast::Sender<LockEvent>,
    shutdown: CancellationToken,
}

impl MemoryConsensus {
    /// Create a service without a session reaper
    pub fn new(config: MemoryConsensusConfig) -> Self {
        let (membership_tx, _) = broadcast::channel(config.channel_capacity);
        let (lock_tx, _) = broadcast::channel(config.channel_capacity);

        Self {
            available: AtomicUsize::new(config.replicas),
            config,
            state: Mutex::new(State::default()),
            membership_tx,
            lock_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a service and start its session reaper
    pub fn start(config: MemoryConsensusConfig) -> Arc<Self> {
        let service = Arc::new(Self::new(config));
        service.spawn_reaper();
        service
    }

    /// Periodically expire sessions that missed their keep-alive deadline
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.reap_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = service.expire_stale_sessions().await;
                        if !expired.is_empty() {
                            tracing::debug!("Reaped {} expired sessions", expired.len());
                        }
                    }
                }
            }
        })
    }

    /// Stop the session reaper
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Simulate replica loss or recovery
    pub fn set_available(&self, replicas: usize) {
        let replicas = replicas.min(self.config.replicas);
        self.available.store(replicas, Ordering::SeqCst);
        tracing::info!("Consensus replicas available: {}/{}", replicas, self.config.replicas);
    }

    /// Majority of replicas
    pub fn quorum_size(&self) -> usize {
        (self.config.replicas / 2) + 1
    }

    /// Cut a session off from the quorum. Its calls fail and its
    /// keep-alives stop landing, so it eventually expires.
    pub async fn partition(&self, session: &SessionId) {
        self.state.lock().await.partitioned.insert(session.clone());
    }

    /// Reconnect a partitioned session
    pub async fn heal(&self, session: &SessionId) {
        self.state.lock().await.partitioned.remove(session);
    }

    /// Expire a session immediately, as if its process crashed
    pub async fn expire_session(&self, session: &SessionId) -> bool {
        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(session) {
            return false;
        }
        self.remove_session(
            &mut state,
            session,
            Command::Expire {
                session: session.clone(),
            },
        );
        true
    }

    /// Expire every session past its deadline
    pub async fn expire_stale_sessions(&self) -> Vec<SessionId> {
        let mut state = self.state.lock().await;
        self.reap_locked(&mut state)
    }

    /// Snapshot of the committed command log
    pub async fn log(&self) -> Vec<LogRecord> {
        self.state.lock().await.log.clone()
    }

    /// Index of the last committed command
    pub async fn commit_index(&self) -> u64 {
        self.state.lock().await.log.len() as u64
    }

    fn check_quorum(&self) -> Result<()> {
        let reached = self.available.load(Ordering::SeqCst);
        let required = self.quorum_size();
        if reached < required {
            return Err(Error::QuorumNotReached { reached, required });
        }
        Ok(())
    }

    fn check_session(&self, state: &State, session: &SessionId) -> Result<()> {
        if state.partitioned.contains(session) {
            return Err(Error::QuorumNotReached {
                reached: 0,
                required: self.quorum_size(),
            });
        }
        if state.sessions.contains_key(session) {
            Ok(())
        } else if state.expired.contains(session) {
            Err(Error::SessionExpired(session.clone()))
        } else {
            Err(Error::UnknownSession(session.clone()))
        }
    }

    fn append(&self, state: &mut State, command: Command) {
        let index = state.log.len() as u64 + 1;
        tracing::trace!("Committed #{}: {:?}", index, command);
        state.log.push(LogRecord {
            index,
            committed_at: chrono::Utc::now(),
            command,
        });
    }

    fn reap_locked(&self, state: &mut State) -> Vec<SessionId> {
        let now = Instant::now();
        let stale: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for session in &stale {
            tracing::info!("Session {} expired", session);
            self.remove_session(
                state,
                session,
                Command::Expire {
                    session: session.clone(),
                },
            );
        }
        stale
    }

    /// Drop a session: release its locks, then remove it from its group
    fn remove_session(&self, state: &mut State, session: &SessionId, command: Command) {
        let Some(removed) = state.sessions.remove(session) else {
            return;
        };
        let expired = matches!(command, Command::Expire { .. });
        self.append(state, command);
        if expired {
            state.expired.insert(session.clone());
        }
        state.partitioned.remove(session);

        let held: Vec<(String, String)> = state
            .locks
            .iter()
            .filter(|(_, lock)| matches!(&lock.holder, Some((s, _)) if s == session))
            .map(|(key, _)| key.clone())
            .collect();
        for key in held {
            self.release_locked(state, &key, session);
        }

        if let Some(members) = state.groups.get_mut(&removed.namespace) {
            members.retain(|id| id != &removed.node_id);
        }
        let _ = self.membership_tx.send(MembershipEvent {
            namespace: removed.namespace,
            node_id: removed.node_id,
            change: MembershipChange::Left,
        });
    }

    fn release_locked(&self, state: &mut State, key: &(String, String), session: &SessionId) {
        let Some(lock) = state.locks.get_mut(key) else {
            return;
        };
        let node_id = match &lock.holder {
            Some((holder, node_id)) if holder == session => node_id.clone(),
            _ => return,
        };
        lock.holder = None;
        let term = lock.term;

        self.append(
            state,
            Command::Release {
                namespace: key.0.clone(),
                resource: key.1.clone(),
                node_id,
                term,
            },
        );
        let _ = self.lock_tx.send(LockEvent {
            namespace: key.0.clone(),
            resource: key.1.clone(),
            holder: None,
            term,
        });
    }
}

fn lagged<T>(item: std::result::Result<T, BroadcastStreamRecvError>) -> Result<T> {
    item.map_err(|BroadcastStreamRecvError::Lagged(skipped)| Error::Lagged(skipped))
}

#[async_trait::async_trait]
impl ConsensusService for MemoryConsensus {
    async fn join_group(&self, namespace: &str, node_id: &str) -> Result<SessionId> {
        self.check_quorum()?;
        let mut state = self.state.lock().await;
        self.reap_locked(&mut state);

        let duplicate = state
            .sessions
            .values()
            .any(|s| s.namespace == namespace && s.node_id == node_id);
        if duplicate {
            return Err(Error::DuplicateNode {
                namespace: namespace.to_string(),
                node_id: node_id.to_string(),
            });
        }

        let session = uuid::Uuid::new_v4().to_string();
        state.sessions.insert(
            session.clone(),
            Session {
                namespace: namespace.to_string(),
                node_id: node_id.to_string(),
                deadline: Instant::now() + self.config.session_timeout,
            },
        );
        state
            .groups
            .entry(namespace.to_string())
            .or_default()
            .push(node_id.to_string());
        self.append(
            &mut state,
            Command::Join {
                namespace: namespace.to_string(),
                node_id: node_id.to_string(),
                session: session.clone(),
            },
        );
        let _ = self.membership_tx.send(MembershipEvent {
            namespace: namespace.to_string(),
            node_id: node_id.to_string(),
            change: MembershipChange::Joined,
        });

        Ok(session)
    }

    async fn leave_group(&self, session: &SessionId) -> Result<()> {
        self.check_quorum()?;
        let mut state = self.state.lock().await;
        self.check_session(&state, session)?;
        self.remove_session(
            &mut state,
            session,
            Command::Leave {
                session: session.clone(),
            },
        );
        Ok(())
    }

    async fn keep_alive(&self, session: &SessionId) -> Result<()> {
        self.check_quorum()?;
        let mut state = self.state.lock().await;
        self.check_session(&state, session)?;
        let timeout = self.config.session_timeout;
        if let Some(s) = state.sessions.get_mut(session) {
            s.deadline = Instant::now() + timeout;
        }
        Ok(())
    }

    async fn try_lock(
        &self,
        namespace: &str,
        resource: &str,
        session: &SessionId,
    ) -> Result<LockGrant> {
        self.check_quorum()?;
        let mut state = self.state.lock().await;
        self.check_session(&state, session)?;

        let node_id = state.sessions[session].node_id.clone();
        let key = (namespace.to_string(), resource.to_string());
        let lock = state.locks.entry(key).or_default();

        if let Some((holder, holder_node)) = &lock.holder {
            if holder == session {
                return Ok(LockGrant::Granted { term: lock.term });
            }
            return Ok(LockGrant::Denied {
                holder: Some(holder_node.clone()),
                term: lock.term,
            });
        }

        lock.term += 1;
        lock.holder = Some((session.clone(), node_id.clone()));
        let term = lock.term;

        self.append(
            &mut state,
            Command::Grant {
                namespace: namespace.to_string(),
                resource: resource.to_string(),
                node_id: node_id.clone(),
                term,
            },
        );
        let _ = self.lock_tx.send(LockEvent {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            holder: Some(node_id),
            term,
        });
        Ok(LockGrant::Granted { term })
    }

    async fn release_lock(&self, namespace: &str, resource: &str, session: &SessionId) -> Result<()> {
        self.check_quorum()?;
        let mut state = self.state.lock().await;
        self.check_session(&state, session)?;
        let key = (namespace.to_string(), resource.to_string());
        self.release_locked(&mut state, &key, session);
        Ok(())
    }

    async fn lock_holder(&self, namespace: &str, resource: &str) -> Result<LockEvent> {
        self.check_quorum()?;
        let state = self.state.lock().await;
        let key = (namespace.to_string(), resource.to_string());
        let (holder, term) = state
            .locks
            .get(&key)
            .map(|lock| (lock.holder.as_ref().map(|(_, node)| node.clone()), lock.term))
            .unwrap_or((None, 0));

        Ok(LockEvent {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            holder,
            term,
        })
    }

    async fn members(&self, namespace: &str) -> Result<Vec<String>> {
        self.check_quorum()?;
        let state = self.state.lock().await;
        Ok(state.groups.get(namespace).cloned().unwrap_or_default())
    }

    async fn subscribe_membership(&self, namespace: &str) -> Result<EventStream<MembershipEvent>> {
        self.check_quorum()?;
        let namespace = namespace.to_string();
        let stream = BroadcastStream::new(self.membership_tx.subscribe()).filter_map(move |item| {
            match lagged(item) {
                Ok(event) if event.namespace != namespace => None,
                other => Some(other),
            }
        });
        Ok(Box::pin(stream))
    }

    async fn subscribe_lock(&self, namespace: &str, resource: &str) -> Result<EventStream<LockEvent>> {
        self.check_quorum()?;
        let namespace = namespace.to_string();
        let resource = resource.to_string();
        let stream = BroadcastStream::new(self.lock_tx.subscribe()).filter_map(move |item| {
            match lagged(item) {
                Ok(event) if event.namespace != namespace || event.resource != resource => None,
                other => Some(other),
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MemoryConsensus {
        MemoryConsensus::new(MemoryConsensusConfig {
            session_timeout: Duration::from_millis(200),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_duplicate_node_rejected() {
        let consensus = service();
        consensus.join_group("ns", "n0").await.unwrap();

        let err = consensus.join_group("ns", "n0").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateNode { .. }));

        // Same id in another namespace is fine
        consensus.join_group("other", "n0").await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_terms_increase() {
        let consensus = service();
        let a = consensus.join_group("ns", "a").await.unwrap();
        let b = consensus.join_group("ns", "b").await.unwrap();

        assert_eq!(
            consensus.try_lock("ns", "r", &a).await.unwrap(),
            LockGrant::Granted { term: 1 }
        );
        assert_eq!(
            consensus.try_lock("ns", "r", &b).await.unwrap(),
            LockGrant::Denied {
                holder: Some("a".into()),
                term: 1
            }
        );

        // Release by a non-holder is ignored
        consensus.release_lock("ns", "r", &b).await.unwrap();
        assert_eq!(consensus.lock_holder("ns", "r").await.unwrap().holder.as_deref(), Some("a"));

        consensus.release_lock("ns", "r", &a).await.unwrap();
        assert_eq!(
            consensus.try_lock("ns", "r", &b).await.unwrap(),
            LockGrant::Granted { term: 2 }
        );
    }

    #[tokio::test]
    async fn test_leave_releases_locks_and_notifies() {
        let consensus = service();
        let a = consensus.join_group("ns", "a").await.unwrap();
        consensus.join_group("ns", "b").await.unwrap();

        let mut locks = consensus.subscribe_lock("ns", "r").await.unwrap();
        let mut members = consensus.subscribe_membership("ns").await.unwrap();

        consensus.try_lock("ns", "r", &a).await.unwrap();
        consensus.leave_group(&a).await.unwrap();

        let granted = locks.next().await.unwrap().unwrap();
        assert_eq!(granted.holder.as_deref(), Some("a"));
        let released = locks.next().await.unwrap().unwrap();
        assert_eq!(released.holder, None);
        assert_eq!(released.term, 1);

        let left = members.next().await.unwrap().unwrap();
        assert_eq!(left.node_id, "a");
        assert_eq!(left.change, MembershipChange::Left);
        assert_eq!(consensus.members("ns").await.unwrap(), vec!["b".to_string()]);

        assert!(matches!(
            consensus.leave_group(&a).await,
            Err(Error::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_session_expiry() {
        let consensus = service();
        let a = consensus.join_group("ns", "a").await.unwrap();
        consensus.try_lock("ns", "r", &a).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let expired = consensus.expire_stale_sessions().await;
        assert_eq!(expired, vec![a.clone()]);

        assert!(matches!(consensus.keep_alive(&a).await, Err(Error::SessionExpired(_))));
        assert_eq!(consensus.lock_holder("ns", "r").await.unwrap().holder, None);
        assert!(consensus.members("ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quorum_loss() {
        let consensus = service();
        consensus.set_available(1);
        assert!(matches!(
            consensus.join_group("ns", "a").await,
            Err(Error::QuorumNotReached { reached: 1, required: 2 })
        ));

        consensus.set_available(2);
        let a = consensus.join_group("ns", "a").await.unwrap();

        consensus.partition(&a).await;
        assert!(consensus.keep_alive(&a).await.unwrap_err().is_retryable());
        consensus.heal(&a).await;
        consensus.keep_alive(&a).await.unwrap();
    }

    #[tokio::test]
    async fn test_log_records_every_mutation() {
        let consensus = service();
        let a = consensus.join_group("ns", "a").await.unwrap();
        consensus.try_lock("ns", "r", &a).await.unwrap();
        consensus.expire_session(&a).await;

        let log = consensus.log().await;
        let indexes: Vec<u64> = log.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
        assert!(matches!(log[1].command, Command::Grant { term: 1, .. }));
        assert!(matches!(log[2].command, Command::Expire { .. }));
        assert!(matches!(log[3].command, Command::Release { .. }));
        assert_eq!(consensus.commit_index().await, 4);
    }
}
