//! Route Lifecycle
//!
//! Starts and stops routes in reaction to leadership events. The route
//! logic itself lives behind [`RouteActivation`].

mod controller;

pub use controller::LifecycleController;

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Route execution capability supplied by the host application
#[async_trait::async_trait]
pub trait RouteActivation: Send + Sync {
    /// Start executing the route
    async fn activate(&self, route: &str) -> Result<()>;

    /// Stop the route, finishing in-flight work
    async fn deactivate(&self, route: &str) -> Result<()>;
}

/// Lifecycle state of one route on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteState {
    Idle,
    Starting,
    Active,
    Stopping,
    Departed,
}

impl RouteState {
    /// Check whether a transition is allowed by the state machine
    pub fn can_transition_to(self, next: RouteState) -> bool {
        use RouteState::*;

        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Active)
                | (Starting, Stopping)
                | (Active, Stopping)
                | (Stopping, Idle)
                | (Idle, Departed)
                | (Stopping, Departed)
        )
    }
}

impl std::fmt::Display for RouteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteState::Idle => write!(f, "IDLE"),
            RouteState::Starting => write!(f, "STARTING"),
            RouteState::Active => write!(f, "ACTIVE"),
            RouteState::Stopping => write!(f, "STOPPING"),
            RouteState::Departed => write!(f, "DEPARTED"),
        }
    }
}

/// Lifecycle configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Bound for route activation and drain
    pub grace_period: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
        }
    }
}
