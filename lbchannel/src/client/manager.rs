// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! The connection manager drives a resolver, feeds its results to the load balancer, owns
//! every subchannel and serves picks against the latest published picker.

use super::backoff::{BackoffPolicy, ExponentialBackoff};
use super::balance::{BalancerState, ChannelController, ChannelState, ChildHandlerBalancer, LoadBalancer, LoadBalancerFactory, LoadBalancerRegistry, Pick, PickContext, PickResult};
use super::config::{LoadBalancingConfig, ServiceConfig};
use super::resolver::{Resolver, ResolverResult};
use super::subchannel::{Subchannel, SubchannelEvent, SubchannelId};
use super::{ClientError, ConnectivityState};
use crate::net::BalancerAddress;
use crate::transport::TransportFactory;
use crate::Status;
use arc_swap::ArcSwap;
use async_broadcast::{Receiver, RecvError};
use faststr::FastStr;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Notify, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Value of the `event` field of the log line emitted when a resolver error is masked by the
/// previous good result.
pub const RESOLVER_FALLBACK_EVENT: &str = "resolver_service_config_fallback";

/// A connection manager config.
#[non_exhaustive]
pub struct Builder {
    /// The resolver of the target.
    pub(crate) resolver: Arc<dyn Resolver>,
    /// Creates the transport of every subchannel.
    pub(crate) transport_factory: Arc<dyn TransportFactory>,
    /// Policies selectable by service config.
    pub(crate) registry: LoadBalancerRegistry,
    /// Reconnect backoff of every subchannel.
    pub(crate) backoff: Arc<dyn BackoffPolicy>,
    /// Ignore service configs supplied by the resolver, default is false.
    pub(crate) disable_resolver_service_config: bool,
    /// Used when the resolver supplies no service config.
    pub(crate) default_service_config: Option<ServiceConfig>,
}

impl Builder {
    /// Create a connection manager builder.
    pub fn new(resolver: impl Resolver, transport_factory: impl TransportFactory) -> Self {
        Self {
            resolver: Arc::new(resolver),
            transport_factory: Arc::new(transport_factory),
            registry: LoadBalancerRegistry::with_defaults(),
            backoff: Arc::new(ExponentialBackoff::default()),
            disable_resolver_service_config: false,
            default_service_config: None,
        }
    }
    /// Register a load balancing policy. It is searched before the built-in policies.
    pub fn with_load_balancer_factory(mut self, factory: impl LoadBalancerFactory) -> Self {
        self.registry.register(Arc::new(factory));
        self
    }
    /// Set the reconnect backoff of subchannels.
    pub fn with_backoff_policy(mut self, backoff: impl BackoffPolicy) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }
    /// Ignore service configs supplied by the resolver.
    /// Default is false.
    pub fn with_disable_resolver_service_config(mut self, disable: bool) -> Self {
        self.disable_resolver_service_config = disable;
        self
    }
    /// Set the service config used when the resolver supplies none.
    pub fn with_default_service_config(mut self, service_config: ServiceConfig) -> Self {
        self.default_service_config = Some(service_config);
        self
    }
    /// Build a connection manager. Nothing resolves or connects until [`ConnectionManager::connect`].
    pub fn build(self) -> ConnectionManager {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let results = self.resolver.watch();
        let (resolved, _) = watch::channel(false);
        ConnectionManager {
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState {
                    balancer: ChildHandlerBalancer::new(self.registry.clone()),
                    subchannels: Vec::new(),
                    last_good_addresses: None,
                    shut_down: false,
                }),
                picker: ArcSwap::from_pointee(BalancerState::queue(ConnectivityState::Idle, None)),
                picker_changed: Notify::new(),
                resolved,
                started: OnceCell::new(),
                receivers: Mutex::new(Some((results, events_rx))),
                events_tx,
                shutdown: CancellationToken::new(),
                resolver: self.resolver,
                transport_factory: self.transport_factory,
                registry: self.registry,
                backoff: self.backoff,
                disable_resolver_service_config: self.disable_resolver_service_config,
                default_service_config: self.default_service_config,
            }),
        }
    }
}

/// Resolves a target and routes calls over its subchannels.
///
/// Clones share one channel. The channel shuts down on [`ConnectionManager::shutdown`] or when
/// the last clone is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<ManagerState>,
    picker: ArcSwap<BalancerState>,
    picker_changed: Notify,
    resolved: watch::Sender<bool>,
    started: OnceCell<()>,
    receivers: Mutex<Option<(Receiver<ResolverResult>, UnboundedReceiver<SubchannelEvent>)>>,
    events_tx: UnboundedSender<SubchannelEvent>,
    shutdown: CancellationToken,
    resolver: Arc<dyn Resolver>,
    transport_factory: Arc<dyn TransportFactory>,
    registry: LoadBalancerRegistry,
    backoff: Arc<dyn BackoffPolicy>,
    disable_resolver_service_config: bool,
    default_service_config: Option<ServiceConfig>,
}

struct ManagerState {
    balancer: ChildHandlerBalancer,
    subchannels: Vec<Subchannel>,
    last_good_addresses: Option<Vec<BalancerAddress>>,
    shut_down: bool,
}

impl ConnectionManager {
    /// Starts the resolver once; concurrent callers share the one start.
    ///
    /// With `wait_for_ready`, also waits until the resolver produced its first result.
    pub async fn connect(&self, wait_for_ready: bool, cancel: &CancellationToken) -> Result<(), ClientError> {
        self.shared.started.get_or_init(|| async { self.start() }).await;
        if self.shared.shutdown.is_cancelled() {
            return Err(Status::unavailable("connection manager is shut down").into());
        }
        if !wait_for_ready {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = self.shared.wait_resolved() => match self.shared.shutdown.is_cancelled() {
                false => Ok(()),
                true => Err(Status::unavailable("connection manager is shut down").into()),
            },
        }
    }

    /// Picks a subchannel for one call.
    ///
    /// Until the first resolver result is applied every pick waits for it. After that a queued
    /// pick fails at once unless `wait_for_ready` is set, in which case it waits for the next
    /// picker, the context deadline, or `cancel`.
    pub async fn pick(&self, context: &PickContext, wait_for_ready: bool, cancel: &CancellationToken) -> Result<Pick, ClientError> {
        if !*self.shared.resolved.borrow() {
            trace!("[LBCHANNEL] pick waiting for the first resolver result");
            tokio::select! {
                _ = self.shared.wait_resolved() => {},
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = sleep_until_deadline(context.deadline) => return Err(ClientError::DeadlineExceeded),
            }
        }
        loop {
            let notified = self.shared.picker_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.shared.picker.load_full();
            match state.picker.pick(context) {
                PickResult::Complete(pick) => return Ok(pick),
                PickResult::Fail(status) => return Err(status.into()),
                PickResult::Queue if !wait_for_ready => return Err(state.unavailable_status().into()),
                PickResult::Queue => trace!(connectivity = %state.connectivity, "[LBCHANNEL] pick queued"),
            }

            tokio::select! {
                _ = &mut notified => {},
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = sleep_until_deadline(context.deadline) => return Err(ClientError::DeadlineExceeded),
            }
        }
    }

    /// Aggregate connectivity of the channel.
    pub fn state(&self) -> ConnectivityState {
        self.shared.picker.load().connectivity
    }

    /// Every live subchannel, for diagnostics.
    pub fn subchannels(&self) -> Vec<Subchannel> {
        self.shared.state.lock().subchannels.clone()
    }

    /// Name of the load balancing policy serving picks.
    pub fn current_policy(&self) -> Option<FastStr> {
        self.shared.state.lock().balancer.current_policy().map(FastStr::new)
    }

    /// Stops resolution, releases every subchannel and fails all later picks.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    fn start(&self) {
        let Some((results, events)) = self.shared.receivers.lock().take() else {
            return;
        };
        tokio::spawn(dispatch(Arc::downgrade(&self.shared), self.shared.shutdown.clone(), results, events));
        debug!("[LBCHANNEL] starting resolver");
        self.shared.resolver.start();
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Applies resolver results and subchannel transitions in arrival order.
async fn dispatch(shared: Weak<Shared>, shutdown: CancellationToken, mut results: Receiver<ResolverResult>, mut events: UnboundedReceiver<SubchannelEvent>) {
    let mut results_open = true;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = results.recv(), if results_open => match result {
                Ok(result) => match shared.upgrade() {
                    Some(shared) => shared.apply_resolver_result(result),
                    None => return,
                },
                Err(RecvError::Overflowed(skipped)) => warn!("[LBCHANNEL] skipped {} stale resolver results", skipped),
                Err(RecvError::Closed) => {
                    debug!("[LBCHANNEL] resolver channel closed");
                    results_open = false;
                },
            },
            Some(event) = events.recv() => match shared.upgrade() {
                Some(shared) => shared.apply_subchannel_event(event),
                None => return,
            },
        }
    }
}

impl Shared {
    /// Resolves once the first resolver result was applied or the manager shut down.
    async fn wait_resolved(&self) {
        let mut resolved = self.resolved.subscribe();
        // The sender lives in `self`, so the wait only ends by observing `true`.
        let _ = resolved.wait_for(|resolved| *resolved).await;
    }

    fn apply_resolver_result(&self, result: ResolverResult) {
        let mut guard = self.state.lock();
        if guard.shut_down {
            return;
        }
        let channel_state = match (result.error().cloned(), &guard.last_good_addresses) {
            (Some(status), Some(_)) => {
                warn!(event = RESOLVER_FALLBACK_EVENT, %status, "[LBCHANNEL] resolver returned an error, keeping the previous addresses and service config");
                None
            },
            (Some(status), None) => {
                debug!(%status, "[LBCHANNEL] resolver failed before any good result");
                Some(ChannelState {
                    addresses: Vec::new(),
                    load_balancing_config: None,
                    error: Some(status),
                })
            },
            (None, last_good) => {
                let service_config = if self.disable_resolver_service_config { None } else { result.service_config };
                let load_balancing_config = service_config.or_else(|| self.default_service_config.clone()).and_then(|config| self.select_policy(&config));
                let addresses = match (result.addresses.is_empty(), last_good) {
                    (true, Some(last_good)) => last_good.clone(),
                    _ => result.addresses,
                };
                debug!(count = addresses.len(), policy = ?load_balancing_config.as_ref().map(|config| &config.policy_name), "[LBCHANNEL] resolver returned addresses");
                Some(ChannelState {
                    addresses,
                    load_balancing_config,
                    error: None,
                })
            },
        };
        if let Some(channel_state) = channel_state {
            if !channel_state.addresses.is_empty() {
                guard.last_good_addresses = Some(channel_state.addresses.clone());
            }
            let ManagerState { balancer, subchannels, .. } = &mut *guard;
            balancer.update_channel_state(channel_state, &mut Controller { shared: self, subchannels });
        }
        drop(guard);
        self.resolved.send_replace(true);
    }

    fn apply_subchannel_event(&self, event: SubchannelEvent) {
        let mut guard = self.state.lock();
        if guard.shut_down {
            return;
        }
        let ManagerState { balancer, subchannels, .. } = &mut *guard;
        let Some(subchannel) = subchannels.iter().find(|subchannel| subchannel.id() == event.id).cloned() else {
            return;
        };
        balancer.subchannel_state_changed(&subchannel, &event.state, &mut Controller { shared: self, subchannels });
        if event.state.connectivity == ConnectivityState::Shutdown {
            subchannels.retain(|subchannel| subchannel.id() != event.id);
        }
    }

    fn select_policy(&self, service_config: &ServiceConfig) -> Option<LoadBalancingConfig> {
        let selected = self.registry.select(service_config);
        if selected.is_none() && !service_config.load_balancing_configs.is_empty() {
            let names: Vec<&str> = service_config.load_balancing_configs.iter().map(|config| config.policy_name.as_str()).collect();
            warn!(policies = ?names, "[LBCHANNEL] no registered load balancing policy in service config, keeping the current policy");
        }
        selected
    }

    fn publish(&self, state: BalancerState) {
        let previous = self.picker.load().connectivity;
        if previous != state.connectivity {
            debug!(from = %previous, to = %state.connectivity, "[LBCHANNEL] channel state changed");
        }
        self.picker.store(Arc::new(state));
        self.picker_changed.notify_waiters();
    }

    fn shutdown(&self) {
        let mut guard = self.state.lock();
        if guard.shut_down {
            return;
        }
        guard.shut_down = true;
        self.shutdown.cancel();
        self.resolver.shutdown();
        guard.balancer.dispose();
        guard.subchannels.clear();
        self.publish(BalancerState::shutdown());
        self.resolved.send_replace(true);
        debug!("[LBCHANNEL] connection manager shut down");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The [`ChannelController`] the balancer acts through, valid while the state lock is held.
struct Controller<'a> {
    shared: &'a Shared,
    subchannels: &'a mut Vec<Subchannel>,
}

impl ChannelController for Controller<'_> {
    fn create_subchannel(&mut self, addresses: Vec<BalancerAddress>) -> Subchannel {
        let id = SubchannelId::next();
        let transport = self.shared.transport_factory.create(id);
        let subchannel = Subchannel::new(id, addresses, transport, self.shared.backoff.clone(), self.shared.events_tx.clone());
        trace!(subchannel = %id, addresses = ?subchannel.addresses(), "[LBCHANNEL] created subchannel");
        self.subchannels.push(subchannel.clone());
        subchannel
    }

    fn update_state(&mut self, state: BalancerState) {
        self.shared.publish(state);
    }

    fn refresh_resolver(&mut self) {
        self.shared.resolver.refresh();
    }
}
