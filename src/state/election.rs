//! Leader Election
//!
//! Per-route leadership built on the consensus service's distributed
//! locks. Every contending node races for the route's lock; the
//! consensus log grants it to exactly one session per term. Losers wait
//! for a release notification instead of polling, and any surviving
//! candidate may win the next term.
//!
//! A leader only trusts the consensus service: a lock notification that
//! names another holder, a released lock, or a stream it can no longer
//! confirm all demote it, even if it never sees the new leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::consensus::{
    ConsensusService, EventStream, LockEvent, LockGrant, MembershipChange, MembershipEvent, SessionId,
};
use crate::error::{Error, Result};
use crate::registration::{backoff_delay, MembershipHandle};
use crate::state::ClusterMembership;

/// Election state of one route on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// Waiting for the lock
    Candidate,
    /// Holding the lock
    Leader,
    /// Lock ownership could not be confirmed; treated as not leader
    Unknown,
    /// No longer contending
    Stopped,
}

/// Kind of leadership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadershipKind {
    Gained,
    Lost,
}

/// Leadership change observed by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipEvent {
    pub namespace: String,
    pub route: String,
    pub node_id: String,
    pub kind: LeadershipKind,
    pub term: u64,
}

/// A leadership event awaiting acknowledgement.
///
/// For a `Lost` event the engine holds the lock (on step-down) or
/// delays re-contention until the notice is acknowledged or dropped.
#[derive(Debug)]
pub struct LeadershipNotice {
    pub event: LeadershipEvent,
    ack: Option<oneshot::Sender<()>>,
}

impl LeadershipNotice {
    /// Acknowledge the event
    pub fn ack(mut self) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(());
        }
    }
}

/// Cached view of one election
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
    pub namespace: String,
    pub route: String,
    /// Last known leader
    pub leader: Option<String>,
    /// Last known term
    pub term: u64,
    /// Live members that may contend, in join order
    pub candidates: Vec<String>,
    /// This node's state in the election
    pub state: ElectionState,
}

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Upper bound for one lock request
    pub lock_timeout: Duration,
    /// Subscription attempts before reporting the namespace unavailable
    pub subscribe_attempts: u32,
    /// First retry delay
    pub backoff_base: Duration,
    /// Retry delay ceiling
    pub backoff_max: Duration,
    /// Maximum random delay before re-contending after a release
    pub contention_jitter: Duration,
    /// Maximum random delay before contending again after stepping down
    pub step_down_holdoff: Duration,
    /// Per-route event buffer
    pub event_buffer: usize,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(1),
            subscribe_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            contention_jitter: Duration::from_millis(50),
            step_down_holdoff: Duration::from_millis(200),
            event_buffer: 16,
        }
    }
}

#[derive(Debug)]
struct RouteView {
    leader: Option<String>,
    term: u64,
    state: ElectionState,
    /// Highest term this node has been granted
    last_gained: u64,
}

enum Control {
    StepDown,
}

type RouteMap = Arc<RwLock<HashMap<String, Arc<RwLock<RouteView>>>>>;

/// Caller side of a route contention
pub struct Subscription {
    namespace: String,
    route: String,
    events: mpsc::Receiver<LeadershipNotice>,
    control: mpsc::Sender<Control>,
    view: Arc<RwLock<RouteView>>,
}

impl Subscription {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Next leadership notice, in order. `None` once contention ended.
    pub async fn next(&mut self) -> Option<LeadershipNotice> {
        self.events.recv().await
    }

    /// Check whether this node currently holds the route
    pub async fn is_leader(&self) -> bool {
        self.view.read().await.state == ElectionState::Leader
    }

    /// Give up leadership. The lock is released once the resulting
    /// `Lost` notice is acknowledged; this node then contends again.
    pub async fn step_down(&self) -> Result<()> {
        if self.view.read().await.state != ElectionState::Leader {
            return Err(Error::NotLeader(self.route.clone()));
        }
        match self.control.try_send(Control::StepDown) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ShuttingDown),
        }
    }
}

/// Leadership election engine for one node in one namespace
pub struct ElectionEngine {
    handle: MembershipHandle,
    membership: Arc<ClusterMembership>,
    config: ElectionConfig,
    routes: RouteMap,
}

impl ElectionEngine {
    /// Start the engine: subscribe to namespace membership and keep the
    /// candidate view current until the node departs.
    pub async fn start(handle: MembershipHandle, config: ElectionConfig) -> Result<Arc<Self>> {
        let membership = Arc::new(ClusterMembership::new(
            handle.namespace().to_string(),
            handle.node_id().to_string(),
        ));

        let engine = Arc::new(Self {
            handle,
            membership,
            config,
            routes: Arc::new(RwLock::new(HashMap::new())),
        });

        let stream = engine.subscribe_membership().await?;
        engine.refresh_members().await;

        let watcher = Arc::clone(&engine);
        tokio::spawn(async move { watcher.watch_membership(stream).await });

        Ok(engine)
    }

    pub fn namespace(&self) -> &str {
        self.handle.namespace()
    }

    pub fn node_id(&self) -> &str {
        self.handle.node_id()
    }

    pub fn handle(&self) -> &MembershipHandle {
        &self.handle
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    fn service(&self) -> &Arc<dyn ConsensusService> {
        self.handle.service()
    }

    /// Contend for leadership of a route
    pub async fn contend(&self, namespace: &str, route: &str) -> Result<Subscription> {
        if namespace != self.namespace() {
            return Err(Error::NamespaceUnavailable(format!(
                "{} has not joined namespace {}",
                self.node_id(),
                namespace
            )));
        }
        if self.handle.is_departed() {
            return Err(Error::ShuttingDown);
        }
        if self.routes.read().await.contains_key(route) {
            return Err(Error::AlreadyContending(route.to_string()));
        }

        // Subscribe before the first lock attempt so no release is missed
        let locks = self.subscribe_lock(route).await?;

        let view = Arc::new(RwLock::new(RouteView {
            leader: None,
            term: 0,
            state: ElectionState::Candidate,
            last_gained: 0,
        }));
        {
            let mut routes = self.routes.write().await;
            if routes.contains_key(route) {
                return Err(Error::AlreadyContending(route.to_string()));
            }
            routes.insert(route.to_string(), Arc::clone(&view));
        }

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (control_tx, control_rx) = mpsc::channel(1);

        let contender = Contender {
            namespace: self.namespace().to_string(),
            route: route.to_string(),
            node_id: self.node_id().to_string(),
            session: self.handle.session().clone(),
            service: Arc::clone(self.service()),
            config: self.config.clone(),
            view: Arc::clone(&view),
            routes: Arc::clone(&self.routes),
            events: events_tx,
        };
        let cancel = self.handle.departure_token();
        tokio::spawn(contender.run(locks, control_rx, cancel));

        tracing::info!(
            "Node {} contending for {}/{}",
            self.node_id(),
            self.namespace(),
            route
        );

        Ok(Subscription {
            namespace: self.namespace().to_string(),
            route: route.to_string(),
            events: events_rx,
            control: control_tx,
            view,
        })
    }

    /// Cached view of a route's election
    pub async fn election(&self, route: &str) -> Option<Election> {
        let view = self.routes.read().await.get(route).cloned()?;
        let view = view.read().await;

        Some(Election {
            namespace: self.namespace().to_string(),
            route: route.to_string(),
            leader: view.leader.clone(),
            term: view.term,
            candidates: self.membership.candidates().await,
            state: view.state,
        })
    }

    /// Routes this node is contending for
    pub async fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.read().await.keys().cloned().collect();
        routes.sort();
        routes
    }

    async fn subscribe_membership(&self) -> Result<EventStream<MembershipEvent>> {
        let mut last_error = None;
        for attempt in 0..self.config.subscribe_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1, self.config.backoff_base, self.config.backoff_max)).await;
            }
            match self.service().subscribe_membership(self.namespace()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(Error::NamespaceUnavailable(format!(
            "membership of {}: {}",
            self.namespace(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn subscribe_lock(&self, route: &str) -> Result<EventStream<LockEvent>> {
        let mut last_error = None;
        for attempt in 0..self.config.subscribe_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1, self.config.backoff_base, self.config.backoff_max)).await;
            }
            match self.service().subscribe_lock(self.namespace(), route).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Lock subscription for {} failed: {}", route, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NamespaceUnavailable(format!(
            "lock {}/{}: {}",
            self.namespace(),
            route,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn refresh_members(&self) {
        match self.service().members(self.namespace()).await {
            Ok(snapshot) => self.membership.reconcile(&snapshot).await,
            Err(e) => tracing::warn!("Membership snapshot of {} failed: {}", self.namespace(), e),
        }
    }

    /// Refresh cached leaders from the consensus service. Only routes
    /// this node does not lead are touched; a leader learns about its
    /// own demotion from the lock stream.
    async fn reconcile_routes(&self, departed: Option<&str>) {
        let routes: Vec<(String, Arc<RwLock<RouteView>>)> = self
            .routes
            .read()
            .await
            .iter()
            .map(|(route, view)| (route.clone(), Arc::clone(view)))
            .collect();

        for (route, view) in routes {
            let stale = {
                let view = view.read().await;
                view.state != ElectionState::Leader
                    && departed.map_or(true, |id| view.leader.as_deref() == Some(id))
            };
            if !stale {
                continue;
            }

            match self.service().lock_holder(self.namespace(), &route).await {
                Ok(lock) => {
                    let mut view = view.write().await;
                    if view.state != ElectionState::Leader && lock.term >= view.term {
                        view.leader = lock.holder;
                        view.term = lock.term;
                    }
                }
                Err(e) => tracing::debug!("Could not reconcile {}: {}", route, e),
            }
        }
    }

    async fn watch_membership(self: Arc<Self>, mut stream: EventStream<MembershipEvent>) {
        let token = self.handle.departure_token();

        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(event)) => match event.change {
                    MembershipChange::Joined => {
                        if self.membership.add_member(&event.node_id).await {
                            tracing::debug!("{} joined {}", event.node_id, event.namespace);
                        }
                    }
                    MembershipChange::Left => {
                        if self.membership.mark_departed(&event.node_id).await {
                            tracing::info!("{} left {}", event.node_id, event.namespace);
                        }
                        self.reconcile_routes(Some(&event.node_id)).await;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!("Membership notifications lost ({}), reconciling", e);
                    self.refresh_members().await;
                    self.reconcile_routes(None).await;
                }
                None => {
                    tracing::warn!("Membership stream of {} ended, resubscribing", self.namespace());
                    match self.subscribe_membership().await {
                        Ok(fresh) => {
                            stream = fresh;
                            self.refresh_members().await;
                            self.reconcile_routes(None).await;
                        }
                        Err(e) => {
                            tracing::error!("Membership view of {} is frozen: {}", self.namespace(), e);
                            break;
                        }
                    }
                }
            }
        }
    }
}

enum HoldOutcome {
    SteppedDown,
    Revoked(String),
    StreamEnded,
    Cancelled,
    Closed,
}

enum WaitOutcome {
    Released,
    StreamEnded,
    Cancelled,
    Closed,
}

/// Contention task for one route
struct Contender {
    namespace: String,
    route: String,
    node_id: String,
    session: SessionId,
    service: Arc<dyn ConsensusService>,
    config: ElectionConfig,
    view: Arc<RwLock<RouteView>>,
    routes: RouteMap,
    events: mpsc::Sender<LeadershipNotice>,
}

impl Contender {
    async fn run(
        self,
        locks: EventStream<LockEvent>,
        mut control: mpsc::Receiver<Control>,
        cancel: CancellationToken,
    ) {
        let mut locks = Some(locks);
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() || self.events.is_closed() {
                break;
            }

            if locks.is_none() {
                match self.resubscribe(&cancel).await {
                    Some(fresh) => locks = Some(fresh),
                    None => break,
                }
            }
            let Some(stream) = locks.as_mut() else {
                break;
            };

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.acquire() => attempt,
            };

            match attempt {
                Ok(LockGrant::Granted { term }) => {
                    failures = 0;
                    if !self.become_leader(term).await {
                        self.release().await;
                        if !self.pause(Duration::ZERO, self.config.step_down_holdoff, &cancel).await {
                            break;
                        }
                        continue;
                    }
                    if !self.notify(LeadershipKind::Gained, term, false).await {
                        self.demote(ElectionState::Stopped).await;
                        self.release().await;
                        break;
                    }

                    match self.hold(term, stream, &mut control, &cancel).await {
                        HoldOutcome::SteppedDown => {
                            tracing::info!("{} stepping down from {} (term {})", self.node_id, self.route, term);
                            self.demote(ElectionState::Candidate).await;
                            // Drain before anyone else can take the route
                            self.notify(LeadershipKind::Lost, term, true).await;
                            self.release().await;
                            let holdoff = self.config.step_down_holdoff;
                            if !self.pause(holdoff / 2, holdoff, &cancel).await {
                                break;
                            }
                        }
                        HoldOutcome::Revoked(reason) => {
                            let signal = Error::AmbiguousLeadership {
                                namespace: self.namespace.clone(),
                                route: self.route.clone(),
                                reason,
                            };
                            tracing::warn!("{}: {}, demoting", self.node_id, signal);
                            self.demote(ElectionState::Unknown).await;
                            self.notify(LeadershipKind::Lost, term, true).await;
                        }
                        HoldOutcome::StreamEnded => {
                            tracing::warn!("Lock stream for {} ended while leading, demoting", self.route);
                            locks = None;
                            self.demote(ElectionState::Unknown).await;
                            self.notify(LeadershipKind::Lost, term, true).await;
                            self.release().await;
                        }
                        HoldOutcome::Cancelled => {
                            self.demote(ElectionState::Stopped).await;
                            self.try_notify(LeadershipKind::Lost, term);
                            self.release().await;
                            break;
                        }
                        HoldOutcome::Closed => {
                            self.demote(ElectionState::Stopped).await;
                            self.release().await;
                            break;
                        }
                    }
                }
                Ok(LockGrant::Denied { holder, term }) => {
                    failures = 0;
                    self.observe(holder, term).await;

                    match self.await_release(stream, &mut control, &cancel).await {
                        WaitOutcome::Released => {
                            // Random delay so no candidate is favoured
                            if !self.pause(Duration::ZERO, self.config.contention_jitter, &cancel).await {
                                break;
                            }
                        }
                        WaitOutcome::StreamEnded => locks = None,
                        WaitOutcome::Cancelled | WaitOutcome::Closed => break,
                    }
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff_delay(failures, self.config.backoff_base, self.config.backoff_max);
                    failures = failures.saturating_add(1);
                    tracing::warn!("Lock request for {} failed: {}, retrying in {:?}", self.route, e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.should_step_down() => {
                    tracing::warn!("{} stops contending for {}: {}", self.node_id, self.route, e);
                    break;
                }
                Err(e) => {
                    tracing::error!("{} cannot contend for {}: {}", self.node_id, self.route, e);
                    break;
                }
            }
        }

        self.demote(ElectionState::Stopped).await;
        let mut routes = self.routes.write().await;
        if routes.get(&self.route).is_some_and(|v| Arc::ptr_eq(v, &self.view)) {
            routes.remove(&self.route);
        }
        tracing::debug!("{} stopped contending for {}", self.node_id, self.route);
    }

    async fn acquire(&self) -> Result<LockGrant> {
        tokio::time::timeout(
            self.config.lock_timeout,
            self.service.try_lock(&self.namespace, &self.route, &self.session),
        )
        .await
        .unwrap_or_else(|_| Err(Error::ConnectionTimeout(format!("lock {}/{}", self.namespace, self.route))))
    }

    async fn release(&self) {
        let released = tokio::time::timeout(
            self.config.lock_timeout,
            self.service.release_lock(&self.namespace, &self.route, &self.session),
        )
        .await;

        match released {
            Ok(Ok(())) => {}
            Ok(Err(Error::SessionExpired(_))) | Ok(Err(Error::UnknownSession(_))) => {}
            Ok(Err(e)) => tracing::warn!("Release of {} failed: {}", self.route, e),
            Err(_) => tracing::warn!("Release of {} timed out", self.route),
        }
    }

    /// Record a grant. Returns false if the term does not move forward.
    async fn become_leader(&self, term: u64) -> bool {
        let mut view = self.view.write().await;
        if term <= view.last_gained {
            tracing::warn!(
                "Granted term {} for {} is not after {}, treating as ambiguous",
                term,
                self.route,
                view.last_gained
            );
            view.state = ElectionState::Unknown;
            return false;
        }

        view.last_gained = term;
        view.term = term;
        view.leader = Some(self.node_id.clone());
        view.state = ElectionState::Leader;

        tracing::info!(
            "{} won {}/{} for term {}",
            self.node_id,
            self.namespace,
            self.route,
            term
        );
        true
    }

    async fn demote(&self, state: ElectionState) {
        let mut view = self.view.write().await;
        view.state = state;
        if view.leader.as_deref() == Some(self.node_id.as_str()) {
            view.leader = None;
        }
    }

    async fn observe(&self, holder: Option<String>, term: u64) {
        let mut view = self.view.write().await;
        if term >= view.term {
            view.term = term;
            view.leader = holder;
        }
        if view.state != ElectionState::Leader {
            view.state = ElectionState::Candidate;
        }
    }

    fn event(&self, kind: LeadershipKind, term: u64) -> LeadershipEvent {
        LeadershipEvent {
            namespace: self.namespace.clone(),
            route: self.route.clone(),
            node_id: self.node_id.clone(),
            kind,
            term,
        }
    }

    /// Deliver an event. Returns false if nobody is listening.
    async fn notify(&self, kind: LeadershipKind, term: u64, wait_ack: bool) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let notice = LeadershipNotice {
            event: self.event(kind, term),
            ack: Some(ack_tx),
        };
        if self.events.send(notice).await.is_err() {
            return false;
        }
        if wait_ack {
            // A dropped notice counts as acknowledged
            let _ = ack_rx.await;
        }
        true
    }

    fn try_notify(&self, kind: LeadershipKind, term: u64) {
        let notice = LeadershipNotice {
            event: self.event(kind, term),
            ack: None,
        };
        let _ = self.events.try_send(notice);
    }

    /// Sleep a random time in `[min, max]`. Returns false if cancelled.
    async fn pause(&self, min: Duration, max: Duration, cancel: &CancellationToken) -> bool {
        let min_ms = min.as_millis() as u64;
        let max_ms = (max.as_millis() as u64).max(min_ms);
        let delay = Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms));

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn hold(
        &self,
        term: u64,
        stream: &mut EventStream<LockEvent>,
        control: &mut mpsc::Receiver<Control>,
        cancel: &CancellationToken,
    ) -> HoldOutcome {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return HoldOutcome::Cancelled,
                _ = self.events.closed() => return HoldOutcome::Closed,
                command = control.recv() => match command {
                    Some(Control::StepDown) => return HoldOutcome::SteppedDown,
                    None => return HoldOutcome::Closed,
                },
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if event.term < term {
                            continue;
                        }
                        if event.term == term && event.holder.as_deref() == Some(self.node_id.as_str()) {
                            continue;
                        }
                        return HoldOutcome::Revoked(format!(
                            "lock held by {:?} at term {}",
                            event.holder, event.term
                        ));
                    }
                    Some(Err(e)) => {
                        match self.service.lock_holder(&self.namespace, &self.route).await {
                            Ok(lock) if lock.term == term
                                && lock.holder.as_deref() == Some(self.node_id.as_str()) => continue,
                            Ok(lock) => {
                                return HoldOutcome::Revoked(format!(
                                    "lock held by {:?} at term {}",
                                    lock.holder, lock.term
                                ));
                            }
                            Err(err) => {
                                return HoldOutcome::Revoked(format!(
                                    "cannot confirm lock after {}: {}",
                                    e, err
                                ));
                            }
                        }
                    }
                    None => return HoldOutcome::StreamEnded,
                },
            }
        }
    }

    async fn await_release(
        &self,
        stream: &mut EventStream<LockEvent>,
        control: &mut mpsc::Receiver<Control>,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = self.events.closed() => return WaitOutcome::Closed,
                command = control.recv() => match command {
                    Some(Control::StepDown) => {
                        tracing::debug!("Ignoring step-down for {}, not leader", self.route);
                    }
                    None => return WaitOutcome::Closed,
                },
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let released = event.holder.is_none();
                        self.observe(event.holder, event.term).await;
                        if released {
                            return WaitOutcome::Released;
                        }
                    }
                    // Notifications lost; ask the lock directly
                    Some(Err(_)) => return WaitOutcome::Released,
                    None => return WaitOutcome::StreamEnded,
                },
            }
        }
    }

    async fn resubscribe(&self, cancel: &CancellationToken) -> Option<EventStream<LockEvent>> {
        let mut attempt = 0u32;
        loop {
            match self.service.subscribe_lock(&self.namespace, &self.route).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    let delay = backoff_delay(attempt, self.config.backoff_base, self.config.backoff_max);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!("Resubscribing to {} failed: {}, retrying in {:?}", self.route, e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{MemoryConsensus, MemoryConsensusConfig};
    use crate::registration::{NodeRegistration, RegistrationConfig};

    fn election_config() -> ElectionConfig {
        ElectionConfig {
            lock_timeout: Duration::from_millis(200),
            subscribe_attempts: 2,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            contention_jitter: Duration::from_millis(10),
            step_down_holdoff: Duration::from_millis(300),
            event_buffer: 8,
        }
    }

    async fn engine(consensus: &Arc<MemoryConsensus>, node_id: &str) -> Arc<ElectionEngine> {
        let registration = NodeRegistration::new(
            consensus.clone(),
            RegistrationConfig {
                session_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        let handle = registration.join("ns", node_id, vec![]).await.unwrap();
        ElectionEngine::start(handle, election_config()).await.unwrap()
    }

    async fn next_event(sub: &mut Subscription) -> LeadershipNotice {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timed out waiting for leadership event")
            .expect("contention ended")
    }

    #[tokio::test]
    async fn test_single_node_gains_term_one() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let engine = engine(&consensus, "n0").await;

        let mut sub = engine.contend("ns", "r").await.unwrap();
        let notice = next_event(&mut sub).await;
        assert_eq!(notice.event.kind, LeadershipKind::Gained);
        assert_eq!(notice.event.term, 1);
        notice.ack();

        assert!(sub.is_leader().await);
        let election = engine.election("r").await.unwrap();
        assert_eq!(election.leader.as_deref(), Some("n0"));
        assert_eq!(election.state, ElectionState::Leader);
        assert_eq!(election.candidates, vec!["n0".to_string()]);
    }

    #[tokio::test]
    async fn test_contend_rejects_foreign_namespace_and_duplicates() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let engine = engine(&consensus, "n0").await;

        assert!(matches!(
            engine.contend("other", "r").await,
            Err(Error::NamespaceUnavailable(_))
        ));

        let _sub = engine.contend("ns", "r").await.unwrap();
        assert!(matches!(
            engine.contend("ns", "r").await,
            Err(Error::AlreadyContending(_))
        ));
    }

    #[tokio::test]
    async fn test_step_down_hands_over_with_higher_term() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let a = engine(&consensus, "a").await;
        let b = engine(&consensus, "b").await;

        let mut sub_a = a.contend("ns", "r").await.unwrap();
        let gained = next_event(&mut sub_a).await;
        assert_eq!(gained.event.term, 1);
        gained.ack();

        let mut sub_b = b.contend("ns", "r").await.unwrap();
        assert!(matches!(sub_b.step_down().await, Err(Error::NotLeader(_))));

        sub_a.step_down().await.unwrap();
        let lost = next_event(&mut sub_a).await;
        assert_eq!(lost.event.kind, LeadershipKind::Lost);
        assert_eq!(lost.event.term, 1);

        // Lock is kept until the loss is acknowledged
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consensus.lock_holder("ns", "r").await.unwrap().holder.as_deref(), Some("a"));
        lost.ack();

        let gained_b = next_event(&mut sub_b).await;
        assert_eq!(gained_b.event.kind, LeadershipKind::Gained);
        assert_eq!(gained_b.event.node_id, "b");
        assert_eq!(gained_b.event.term, 2);
    }

    #[tokio::test]
    async fn test_session_expiry_demotes_leader() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let a = engine(&consensus, "a").await;
        let b = engine(&consensus, "b").await;

        let mut sub_a = a.contend("ns", "r").await.unwrap();
        next_event(&mut sub_a).await.ack();
        let mut sub_b = b.contend("ns", "r").await.unwrap();

        consensus.expire_session(a.handle().session()).await;

        let lost = next_event(&mut sub_a).await;
        assert_eq!(lost.event.kind, LeadershipKind::Lost);
        lost.ack();
        assert!(!sub_a.is_leader().await);

        let gained = next_event(&mut sub_b).await;
        assert_eq!(gained.event.kind, LeadershipKind::Gained);
        assert_eq!(gained.event.term, 2);

        // The survivor's view drops the departed node
        tokio::time::sleep(Duration::from_millis(50)).await;
        let election = b.election("r").await.unwrap();
        assert_eq!(election.candidates, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_contend_without_quorum_reports_namespace_unavailable() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let engine = engine(&consensus, "n0").await;

        consensus.set_available(1);
        assert!(matches!(
            engine.contend("ns", "r").await,
            Err(Error::NamespaceUnavailable(_))
        ));
        assert!(engine.routes().await.is_empty());

        consensus.set_available(3);
        engine.contend("ns", "r").await.unwrap();
    }

    #[tokio::test]
    async fn test_partitioned_leader_steps_down_on_its_own() {
        let consensus = MemoryConsensus::start(MemoryConsensusConfig {
            session_timeout: Duration::from_millis(300),
            reap_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let registration = NodeRegistration::new(
            consensus.clone(),
            RegistrationConfig {
                session_timeout: Duration::from_millis(300),
                ..Default::default()
            },
        );
        let a = ElectionEngine::start(
            registration.join("ns", "a", vec![]).await.unwrap(),
            election_config(),
        )
        .await
        .unwrap();
        let b = ElectionEngine::start(
            registration.join("ns", "b", vec![]).await.unwrap(),
            election_config(),
        )
        .await
        .unwrap();

        let mut sub_a = a.contend("ns", "r").await.unwrap();
        next_event(&mut sub_a).await.ack();
        let mut sub_b = b.contend("ns", "r").await.unwrap();

        // Keep-alives from a stop landing
        consensus.partition(a.handle().session()).await;

        let mut kinds = Vec::new();
        let ended = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(notice) = sub_a.next().await {
                kinds.push(notice.event.kind);
                notice.ack();
            }
        })
        .await;
        assert!(ended.is_ok(), "contention of a did not end");
        assert!(kinds.contains(&LeadershipKind::Lost));
        assert!(!sub_a.is_leader().await);
        assert!(a.handle().is_departed());

        let gained = next_event(&mut sub_b).await;
        assert_eq!(gained.event.kind, LeadershipKind::Gained);
        assert_eq!(gained.event.term, 2);
        consensus.shutdown();
    }

    #[tokio::test]
    async fn test_leave_cancels_pending_contention() {
        let consensus = Arc::new(MemoryConsensus::new(MemoryConsensusConfig::default()));
        let a = engine(&consensus, "a").await;
        let b = engine(&consensus, "b").await;

        let mut sub_a = a.contend("ns", "r").await.unwrap();
        next_event(&mut sub_a).await.ack();
        let mut sub_b = b.contend("ns", "r").await.unwrap();

        b.handle().leave().await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(2), sub_b.next())
            .await
            .unwrap();
        assert!(ended.is_none());
        assert!(b.contend("ns", "other").await.is_err());
        assert!(sub_a.is_leader().await);
    }
}
