//! State Management Module
//!
//! Tracks namespace membership as seen by this node and the per-route
//! leadership elections built on top of it.

mod membership;
pub mod election;

pub use membership::{NodeState, NodeStatus, ClusterMembership, MembershipSummary};
pub use election::{
    Election, ElectionConfig, ElectionEngine, ElectionState, LeadershipEvent, LeadershipKind,
    LeadershipNotice, Subscription,
};
