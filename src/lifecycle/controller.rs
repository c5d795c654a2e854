//! Lifecycle Controller
//!
//! One driver task per route turns leadership notices into calls on the
//! route activation capability. Notices for a route are handled strictly
//! one after another, and a loss is only acknowledged to the engine once
//! the route has drained or the grace period ran out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{LifecycleConfig, RouteActivation, RouteState};
use crate::error::{Error, Result};
use crate::state::{ElectionEngine, LeadershipKind, LeadershipNotice, Subscription};

struct RouteSlot {
    state: watch::Receiver<RouteState>,
    task: Option<JoinHandle<()>>,
}

/// Drives route activation for one node in one namespace
pub struct LifecycleController {
    engine: Arc<ElectionEngine>,
    activation: Arc<dyn RouteActivation>,
    config: LifecycleConfig,
    routes: RwLock<HashMap<String, RouteSlot>>,
    /// Tells route drivers to drain and stop
    shutdown: CancellationToken,
    /// Fires once shutdown has completed
    departed: CancellationToken,
    stopping: AtomicBool,
    /// Pending scheduled shutdown
    timer: Mutex<Option<CancellationToken>>,
}

impl LifecycleController {
    /// Create a controller. If the node's membership is lost the
    /// controller shuts itself down.
    pub fn new(
        engine: Arc<ElectionEngine>,
        activation: Arc<dyn RouteActivation>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            engine,
            activation,
            config,
            routes: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            departed: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            timer: Mutex::new(None),
        });

        let watcher = Arc::clone(&controller);
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.departed.cancelled() => {}
                _ = watcher.engine.handle().departed() => {
                    if let Err(e) = watcher.shutdown().await {
                        tracing::debug!("Shutdown after membership loss: {}", e);
                    }
                }
            }
        });

        controller
    }

    pub fn node_id(&self) -> &str {
        self.engine.node_id()
    }

    pub fn namespace(&self) -> &str {
        self.engine.namespace()
    }

    pub fn engine(&self) -> &Arc<ElectionEngine> {
        &self.engine
    }

    /// Contend for a route and drive its lifecycle
    pub async fn manage(&self, route: &str) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let subscription = self.engine.contend(self.namespace(), route).await?;
        let (state_tx, state_rx) = watch::channel(RouteState::Idle);

        let driver = RouteDriver {
            route: route.to_string(),
            node_id: self.node_id().to_string(),
            activation: Arc::clone(&self.activation),
            grace: self.config.grace_period,
            state: state_tx,
            subscription,
        };
        let task = tokio::spawn(driver.run(self.shutdown.clone()));

        self.routes.write().await.insert(
            route.to_string(),
            RouteSlot {
                state: state_rx,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Current state of a route
    pub async fn state(&self, route: &str) -> Option<RouteState> {
        self.routes
            .read()
            .await
            .get(route)
            .map(|slot| *slot.state.borrow())
    }

    /// Follow state changes of a route
    pub async fn watch(&self, route: &str) -> Option<watch::Receiver<RouteState>> {
        self.routes.read().await.get(route).map(|slot| slot.state.clone())
    }

    /// Routes managed by this controller
    pub async fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.read().await.keys().cloned().collect();
        routes.sort();
        routes
    }

    /// Shut down after `delay` unless cancelled first. A new schedule
    /// replaces the previous one.
    pub async fn schedule_shutdown(self: &Arc<Self>, delay: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.timer.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        tracing::debug!("{} scheduled shutdown in {:?}", self.node_id(), delay);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = controller.shutdown().await {
                        tracing::warn!("Scheduled shutdown of {} failed: {}", controller.node_id(), e);
                    }
                }
            }
        });
    }

    /// Cancel a pending scheduled shutdown
    pub async fn cancel_scheduled_shutdown(&self) {
        if let Some(token) = self.timer.lock().await.take() {
            token.cancel();
        }
    }

    /// Drain every route, then leave the namespace
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            self.departed.cancelled().await;
            return Ok(());
        }

        self.cancel_scheduled_shutdown().await;
        tracing::info!("Shutting down {} in {}", self.node_id(), self.namespace());

        self.shutdown.cancel();
        let tasks: Vec<(String, JoinHandle<()>)> = self
            .routes
            .write()
            .await
            .iter_mut()
            .filter_map(|(route, slot)| slot.task.take().map(|task| (route.clone(), task)))
            .collect();
        for (route, task) in tasks {
            if let Err(e) = task.await {
                tracing::error!("Driver for {} failed: {}", route, e);
            }
        }

        let result = self.engine.handle().leave().await;
        self.departed.cancel();
        tracing::info!("{} departed {}", self.node_id(), self.namespace());
        result
    }

    /// Check whether shutdown has completed
    pub fn is_departed(&self) -> bool {
        self.departed.is_cancelled()
    }

    /// Wait until shutdown has completed
    pub async fn departed(&self) {
        self.departed.cancelled().await
    }
}

/// Per-route state machine
struct RouteDriver {
    route: String,
    node_id: String,
    activation: Arc<dyn RouteActivation>,
    grace: Duration,
    state: watch::Sender<RouteState>,
    subscription: Subscription,
}

impl RouteDriver {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let notice = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                notice = self.subscription.next() => notice,
            };

            match notice {
                Some(notice) => self.handle(notice).await,
                None => break,
            }
        }

        self.finish().await;
    }

    fn current(&self) -> RouteState {
        *self.state.borrow()
    }

    fn transition(&self, next: RouteState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            tracing::warn!(
                "{}: unexpected route transition {} -> {} on {}",
                self.route,
                current,
                next,
                self.node_id
            );
        }
        tracing::debug!("{}: {} -> {} on {}", self.route, current, next, self.node_id);
        self.state.send_replace(next);
    }

    async fn handle(&mut self, notice: LeadershipNotice) {
        let term = notice.event.term;

        match notice.event.kind {
            LeadershipKind::Gained => {
                if self.current() != RouteState::Idle {
                    tracing::warn!("{}: gained term {} while {}", self.route, term, self.current());
                } else {
                    self.start(term).await;
                }
            }
            LeadershipKind::Lost => match self.current() {
                RouteState::Active | RouteState::Starting => {
                    self.transition(RouteState::Stopping);
                    self.drain().await;
                    self.transition(RouteState::Idle);
                    tracing::info!("{} released {} (term {})", self.node_id, self.route, term);
                }
                state => {
                    tracing::debug!("{}: lost term {} while {}", self.route, term, state);
                }
            },
        }

        notice.ack();
    }

    async fn start(&mut self, term: u64) {
        self.transition(RouteState::Starting);

        let outcome = tokio::time::timeout(self.grace, self.activation.activate(&self.route)).await;
        let failure = match outcome {
            Ok(Ok(())) => {
                self.transition(RouteState::Active);
                tracing::info!("{} is active on {} (term {})", self.route, self.node_id, term);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("not started within {:?}", self.grace),
        };

        tracing::warn!("{}: activation failed on {}: {}", self.route, self.node_id, failure);
        self.transition(RouteState::Stopping);
        self.drain().await;
        self.transition(RouteState::Idle);

        // Let another node try
        if let Err(e) = self.subscription.step_down().await {
            tracing::debug!("{}: step down after failed activation: {}", self.route, e);
        }
    }

    /// Deactivate within the grace period; overrunning it is accepted
    async fn drain(&self) {
        match tokio::time::timeout(self.grace, self.activation.deactivate(&self.route)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("{}: deactivation failed on {}: {}", self.route, self.node_id, e);
            }
            Err(_) => {
                tracing::warn!(
                    "{}: drain exceeded grace period of {:?} on {}, forcing idle",
                    self.route,
                    self.grace,
                    self.node_id
                );
            }
        }
    }

    async fn finish(&mut self) {
        match self.current() {
            RouteState::Active | RouteState::Starting => {
                self.transition(RouteState::Stopping);
                self.drain().await;
            }
            RouteState::Departed => return,
            _ => {}
        }
        self.transition(RouteState::Departed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use crate::consensus::{MemoryConsensus, MemoryConsensusConfig};
    use crate::registration::{NodeRegistration, RegistrationConfig};
    use crate::state::ElectionConfig;

    /// Tracks how many nodes run the route at once
    #[derive(Default)]
    struct Exclusive {
        running: AtomicUsize,
        max_running: AtomicUsize,
        activations: AtomicUsize,
        attempts: AtomicUsize,
        fail_activation: AtomicBool,
        drain_delay: std::sync::Mutex<Duration>,
    }

    #[async_trait::async_trait]
    impl RouteActivation for Exclusive {
        async fn activate(&self, route: &str) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_activation.load(Ordering::SeqCst) {
                return Err(Error::Activation {
                    route: route.to_string(),
                    action: "activate",
                    reason: "refused".into(),
                });
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deactivate(&self, _route: &str) -> Result<()> {
            let delay = *self.drain_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn controller(
        consensus: &Arc<MemoryConsensus>,
        node_id: &str,
        activation: Arc<Exclusive>,
        grace: Duration,
    ) -> Arc<LifecycleController> {
        let registration = NodeRegistration::new(consensus.clone(), RegistrationConfig::default());
        let handle = registration.join("ns", node_id, vec![]).await.unwrap();
        let engine = ElectionEngine::start(
            handle,
            ElectionConfig {
                contention_jitter: Duration::from_millis(5),
                step_down_holdoff: Duration::from_millis(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        LifecycleController::new(engine, activation, LifecycleConfig { grace_period: grace })
    }

    async fn wait_for(controller: &LifecycleController, route: &str, state: RouteState) {
        let mut rx = controller.watch(route).await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for route state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_leader_activates_and_shutdown_hands_over() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let activation = Arc::new(Exclusive::default());

        let a = controller(&consensus, "a", activation.clone(), Duration::from_secs(1)).await;
        a.manage("r").await.unwrap();
        wait_for(&a, "r", RouteState::Active).await;

        let b = controller(&consensus, "b", activation.clone(), Duration::from_secs(1)).await;
        b.manage("r").await.unwrap();
        assert_eq!(b.state("r").await, Some(RouteState::Idle));

        a.shutdown().await.unwrap();
        assert!(a.is_departed());
        assert_eq!(a.state("r").await, Some(RouteState::Departed));

        wait_for(&b, "r", RouteState::Active).await;
        assert_eq!(activation.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(activation.activations.load(Ordering::SeqCst), 2);

        // Shutdown twice is harmless
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_drain_is_forced_after_grace_period() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let activation = Arc::new(Exclusive::default());
        *activation.drain_delay.lock().unwrap() = Duration::from_secs(10);

        let a = controller(&consensus, "a", activation.clone(), Duration::from_millis(100)).await;
        a.manage("r").await.unwrap();
        wait_for(&a, "r", RouteState::Active).await;

        let started = std::time::Instant::now();
        a.shutdown().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(a.state("r").await, Some(RouteState::Departed));
    }

    #[tokio::test]
    async fn test_failed_activation_returns_to_idle() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let activation = Arc::new(Exclusive::default());
        activation.fail_activation.store(true, Ordering::SeqCst);

        let a = controller(&consensus, "a", activation.clone(), Duration::from_millis(200)).await;
        a.manage("r").await.unwrap();

        // The route is retried after every step-down but never comes up
        tokio::time::timeout(Duration::from_secs(3), async {
            while activation.attempts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_ne!(a.state("r").await, Some(RouteState::Active));
        assert_eq!(activation.activations.load(Ordering::SeqCst), 0);

        // Once activation works again the route comes up after re-contention
        activation.fail_activation.store(false, Ordering::SeqCst);
        wait_for(&a, "r", RouteState::Active).await;
        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduled_shutdown_can_be_cancelled() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let activation = Arc::new(Exclusive::default());
        let a = controller(&consensus, "a", activation, Duration::from_millis(200)).await;

        a.schedule_shutdown(Duration::from_millis(100)).await;
        a.cancel_scheduled_shutdown().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!a.is_departed());

        a.schedule_shutdown(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(2), a.departed())
            .await
            .unwrap();
        assert!(matches!(a.manage("r").await, Err(Error::ShuttingDown)));
    }
}
