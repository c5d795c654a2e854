//! WolfHA - Clustered Route Leadership Coordinator
//!
//! Coordinates which node in a cluster runs each named route. Nodes join a
//! namespace group on a consensus service, contend for a distributed lock
//! per route, and only the lock holder runs the route. When the leader
//! leaves or its session expires, a surviving node takes over.
//!
//! # Architecture
//!
//! Three layers sit on top of a linearizable [`consensus::ConsensusService`]:
//! registration joins the namespace and keeps the session alive, the
//! election engine turns lock grants into leadership events, and the
//! lifecycle controller starts and drains routes in response.
//!
//! # Features
//!
//! - Exclusive route ownership with strictly increasing terms
//! - Failover on voluntary leave or session expiry
//! - Drain before hand-over, bounded by a grace period
//! - In-memory consensus service for tests and simulation
//! - Cluster harness for multi-node runs

pub mod config;
pub mod error;
pub mod consensus;
pub mod state;
pub mod registration;
pub mod lifecycle;
pub mod node;
pub mod harness;

pub use config::WolfHaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfHaConfig;
    pub use crate::error::{Error, Result};
    pub use crate::consensus::{ConsensusService, MemoryConsensus, MemoryConsensusConfig};
    pub use crate::registration::{MembershipHandle, NodeRegistration};
    pub use crate::state::{ElectionEngine, LeadershipEvent, LeadershipKind, Subscription};
    pub use crate::lifecycle::{LifecycleController, RouteActivation, RouteState};
    pub use crate::node::RouteNode;
}
