//! Namespace Membership View
//!
//! Local, eventually-consistent picture of which nodes are members of
//! a namespace group. Fed by the consensus service's membership
//! notifications and reconciled from snapshots when notifications are
//! lost.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Node status in a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Joined, but not yet seen in a committed member list
    Joining,
    /// Member of the namespace group
    Active,
    /// Leaving the group
    Leaving,
    /// Gone, either by leaving or by session expiry
    Departed,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Joining => write!(f, "JOINING"),
            NodeStatus::Active => write!(f, "ACTIVE"),
            NodeStatus::Leaving => write!(f, "LEAVING"),
            NodeStatus::Departed => write!(f, "DEPARTED"),
        }
    }
}

/// State of a single member as seen locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Unique node identifier
    pub id: String,
    /// Current status
    pub status: NodeStatus,
    /// Local join sequence, used to order candidates
    pub seq: u64,
    /// When the join was observed
    pub joined_at: chrono::DateTime<chrono::Utc>,
    /// When the departure was observed
    pub departed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl NodeState {
    /// Create a new active member
    pub fn new(id: String, seq: u64) -> Self {
        Self {
            id,
            status: NodeStatus::Active,
            seq,
            joined_at: chrono::Utc::now(),
            departed_at: None,
        }
    }

    /// Create this node's own entry, pending confirmation
    pub fn joining(id: String) -> Self {
        Self {
            status: NodeStatus::Joining,
            ..Self::new(id, 0)
        }
    }

    /// Check if the node can still contend
    pub fn is_alive(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

struct Members {
    nodes: HashMap<String, NodeState>,
    next_seq: u64,
}

/// Membership tracker for one namespace
pub struct ClusterMembership {
    /// Namespace this view covers
    namespace: String,
    /// This node's ID
    node_id: String,
    /// Known nodes (including self and departed nodes)
    members: RwLock<Members>,
}

impl ClusterMembership {
    /// Create a new membership view containing only this node. It stays
    /// `Joining` until a membership snapshot or notification confirms it.
    pub fn new(namespace: String, node_id: String) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(node_id.clone(), NodeState::joining(node_id.clone()));

        Self {
            namespace,
            node_id,
            members: RwLock::new(Members { nodes, next_seq: 1 }),
        }
    }

    /// Namespace this view covers
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Record a joined member. Returns false if it was already alive.
    pub async fn add_member(&self, id: &str) -> bool {
        let mut guard = self.members.write().await;
        let members = &mut *guard;
        let seq = members.next_seq;

        match members.nodes.get_mut(id) {
            Some(node) if node.is_alive() => false,
            Some(node) => {
                // Rejoin after departure goes to the back of the line
                node.status = NodeStatus::Active;
                node.seq = seq;
                node.joined_at = chrono::Utc::now();
                node.departed_at = None;
                members.next_seq += 1;
                true
            }
            None => {
                members.nodes.insert(id.to_string(), NodeState::new(id.to_string(), seq));
                members.next_seq += 1;
                true
            }
        }
    }

    /// Record a departed member. Returns false if it was not alive.
    pub async fn mark_departed(&self, id: &str) -> bool {
        let mut members = self.members.write().await;
        match members.nodes.get_mut(id) {
            Some(node) if node.is_alive() => {
                node.status = NodeStatus::Departed;
                node.departed_at = Some(chrono::Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Replace the view with a committed member list (join order)
    pub async fn reconcile(&self, snapshot: &[String]) {
        for id in snapshot {
            self.add_member(id).await;
        }

        let mut members = self.members.write().await;
        for node in members.nodes.values_mut() {
            if node.is_alive() && !snapshot.contains(&node.id) {
                tracing::debug!(
                    "Reconcile: {} no longer in namespace {}",
                    node.id,
                    self.namespace
                );
                node.status = NodeStatus::Departed;
                node.departed_at = Some(chrono::Utc::now());
            }
        }
    }

    /// Get a member's state
    pub async fn get_node(&self, id: &str) -> Option<NodeState> {
        self.members.read().await.nodes.get(id).cloned()
    }

    /// Check if a member is alive
    pub async fn is_alive(&self, id: &str) -> bool {
        self.get_node(id).await.is_some_and(|n| n.is_alive())
    }

    /// Live members in join order
    pub async fn candidates(&self) -> Vec<String> {
        let members = self.members.read().await;
        let mut alive: Vec<&NodeState> = members.nodes.values().filter(|n| n.is_alive()).collect();
        alive.sort_by_key(|n| n.seq);
        alive.into_iter().map(|n| n.id.clone()).collect()
    }

    /// Get membership summary
    pub async fn summary(&self) -> MembershipSummary {
        let members = self.members.read().await;
        let count = |status: NodeStatus| members.nodes.values().filter(|n| n.status == status).count();

        MembershipSummary {
            namespace: self.namespace.clone(),
            total_nodes: members.nodes.len(),
            active_nodes: count(NodeStatus::Active),
            joining_nodes: count(NodeStatus::Joining),
            departed_nodes: count(NodeStatus::Departed),
        }
    }
}

/// Membership summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipSummary {
    pub namespace: String,
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub joining_nodes: usize,
    pub departed_nodes: usize,
}
