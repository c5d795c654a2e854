//! Consensus Membership Service
//!
//! The coordination layer only relies on group membership and
//! linearizable distributed locks. Any backend that offers both
//! (etcd-like stores, Raft libraries, the in-memory service below)
//! can sit behind [`ConsensusService`].

mod memory;

pub use memory::{Command, LogRecord, MemoryConsensus, MemoryConsensusConfig};

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Liveness handle issued by the consensus service for a joined node
pub type SessionId = String;

/// Stream of notifications from the consensus service.
///
/// An `Err` item means notifications were lost and the subscriber
/// must reconcile against a fresh snapshot.
pub type EventStream<T> = BoxStream<'static, Result<T>>;

/// Membership change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    Joined,
    Left,
}

/// A node joined or left a namespace group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub namespace: String,
    pub node_id: String,
    pub change: MembershipChange,
}

/// Lock ownership as committed by the consensus service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub namespace: String,
    pub resource: String,
    /// Node id of the holder, `None` when the lock is free
    pub holder: Option<String>,
    /// Term of the most recent grant
    pub term: u64,
}

/// Outcome of a lock request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockGrant {
    Granted { term: u64 },
    Denied { holder: Option<String>, term: u64 },
}

/// Group membership and distributed locks backed by a replicated log
#[async_trait::async_trait]
pub trait ConsensusService: Send + Sync {
    /// Join a namespace group, returning a new session
    async fn join_group(&self, namespace: &str, node_id: &str) -> Result<SessionId>;

    /// Leave the group, releasing every lock the session holds
    async fn leave_group(&self, session: &SessionId) -> Result<()>;

    /// Renew a session before it expires
    async fn keep_alive(&self, session: &SessionId) -> Result<()>;

    /// Try to take a lock without waiting
    async fn try_lock(
        &self,
        namespace: &str,
        resource: &str,
        session: &SessionId,
    ) -> Result<LockGrant>;

    /// Release a lock held by the session. Releasing a lock the
    /// session does not hold is a no-op.
    async fn release_lock(&self, namespace: &str, resource: &str, session: &SessionId) -> Result<()>;

    /// Current committed lock state
    async fn lock_holder(&self, namespace: &str, resource: &str) -> Result<LockEvent>;

    /// Current members of a namespace group, in join order
    async fn members(&self, namespace: &str) -> Result<Vec<String>>;

    /// Subscribe to join/leave notifications for a namespace
    async fn subscribe_membership(&self, namespace: &str) -> Result<EventStream<MembershipEvent>>;

    /// Subscribe to ownership changes of one lock
    async fn subscribe_lock(&self, namespace: &str, resource: &str) -> Result<EventStream<LockEvent>>;
}
