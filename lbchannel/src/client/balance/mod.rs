// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Load balancing policies.
//!
//! A [`LoadBalancer`] receives resolved addresses and subchannel transitions and publishes a
//! [`BalancerState`] whose picker routes calls. Balancers never touch the connection manager
//! directly; they act through a [`ChannelController`].

pub mod child_handler;
pub mod pick_first;
pub mod picker;
pub mod round_robin;
#[cfg(test)]
mod testing;

pub use child_handler::ChildHandlerBalancer;
pub use pick_first::PickFirstBalancer;
pub use picker::{CompletionContext, FailPicker, Pick, PickContext, PickResult, QueuePicker, SubchannelCallTracker, SubchannelPicker};
pub use round_robin::RoundRobinBalancer;

use super::config::{LoadBalancingConfig, ServiceConfig, PICK_FIRST_POLICY_NAME, ROUND_ROBIN_POLICY_NAME};
use super::subchannel::{Subchannel, SubchannelState};
use super::ConnectivityState;
use crate::net::BalancerAddress;
use crate::Status;
use std::fmt;
use std::sync::Arc;

/// A load balancing policy instance.
pub trait LoadBalancer: Send + 'static {
    /// Applies a resolver update.
    fn update_channel_state(&mut self, state: ChannelState, controller: &mut dyn ChannelController);
    /// Handles a transition of a subchannel this balancer created.
    fn subchannel_state_changed(&mut self, subchannel: &Subchannel, state: &SubchannelState, controller: &mut dyn ChannelController);
    /// Asks idle subchannels to connect.
    fn request_connection(&mut self, controller: &mut dyn ChannelController);
    /// Releases every subchannel. Called exactly once, after which the balancer is dropped.
    fn dispose(&mut self);
}

/// What the connection manager knows about the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelState {
    /// Resolved addresses; the previous good set when the latest resolution failed.
    pub addresses: Vec<BalancerAddress>,
    /// The selected policy config, `None` when the update does not select one.
    pub load_balancing_config: Option<LoadBalancingConfig>,
    /// Resolution error, set only when no good resolution exists.
    pub error: Option<Status>,
}

/// The operations a balancer may perform on its channel.
pub trait ChannelController {
    /// Creates an idle subchannel for a group of equivalent addresses.
    fn create_subchannel(&mut self, addresses: Vec<BalancerAddress>) -> Subchannel;
    /// Publishes a new aggregate state and picker.
    fn update_state(&mut self, state: BalancerState);
    /// Asks the resolver to re-resolve.
    fn refresh_resolver(&mut self);
}

/// Aggregate state published by a balancer.
#[derive(Clone)]
pub struct BalancerState {
    /// Aggregate connectivity.
    pub connectivity: ConnectivityState,
    /// Routes picks until the next update.
    pub picker: Arc<dyn SubchannelPicker>,
    /// Why the balancer cannot serve picks, when known.
    pub status: Option<Status>,
}

impl BalancerState {
    /// A state with the given picker.
    pub fn new(connectivity: ConnectivityState, picker: Arc<dyn SubchannelPicker>) -> Self {
        Self { connectivity, picker, status: None }
    }
    /// A state whose picker queues every pick.
    pub fn queue(connectivity: ConnectivityState, status: Option<Status>) -> Self {
        Self {
            connectivity,
            picker: Arc::new(QueuePicker),
            status,
        }
    }
    /// A TransientFailure state whose picker fails every pick with `status`.
    pub fn failure(status: Status) -> Self {
        Self {
            connectivity: ConnectivityState::TransientFailure,
            picker: Arc::new(FailPicker::new(status.clone())),
            status: Some(status),
        }
    }
    /// A Shutdown state.
    pub fn shutdown() -> Self {
        let status = Status::unavailable("channel is shut down");
        Self {
            connectivity: ConnectivityState::Shutdown,
            picker: Arc::new(FailPicker::new(status.clone())),
            status: Some(status),
        }
    }
    /// The status returned to a pick that cannot wait.
    pub fn unavailable_status(&self) -> Status {
        match &self.status {
            Some(status) => status.clone(),
            None => Status::unavailable(format!("no ready subchannel, channel is {}", self.connectivity)),
        }
    }
}

impl fmt::Debug for BalancerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancerState").field("connectivity", &self.connectivity).field("status", &self.status).finish_non_exhaustive()
    }
}

/// Creates balancers for one policy name.
pub trait LoadBalancerFactory: Send + Sync + 'static {
    /// The policy name matched against [`LoadBalancingConfig::policy_name`].
    fn name(&self) -> &str;
    /// Creates a balancer.
    fn create(&self, config: &LoadBalancingConfig) -> Box<dyn LoadBalancer>;
}

struct BuiltinFactory {
    name: &'static str,
    build: fn(&LoadBalancingConfig) -> Box<dyn LoadBalancer>,
}

impl LoadBalancerFactory for BuiltinFactory {
    fn name(&self) -> &str {
        self.name
    }
    fn create(&self, config: &LoadBalancingConfig) -> Box<dyn LoadBalancer> {
        (self.build)(config)
    }
}

fn build_pick_first(_: &LoadBalancingConfig) -> Box<dyn LoadBalancer> {
    Box::new(PickFirstBalancer::new())
}

fn build_round_robin(_: &LoadBalancingConfig) -> Box<dyn LoadBalancer> {
    Box::new(RoundRobinBalancer::new())
}

const BUILTIN_FACTORIES: [(&str, fn(&LoadBalancingConfig) -> Box<dyn LoadBalancer>); 2] = [(PICK_FIRST_POLICY_NAME, build_pick_first), (ROUND_ROBIN_POLICY_NAME, build_round_robin)];

/// Policy factories by name. User factories are searched before the built-in ones.
#[derive(Clone)]
pub struct LoadBalancerRegistry {
    factories: Vec<Arc<dyn LoadBalancerFactory>>,
    user_count: usize,
}

impl Default for LoadBalancerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LoadBalancerRegistry {
    /// A registry holding `pick_first` and `round_robin`.
    pub fn with_defaults() -> Self {
        let factories = BUILTIN_FACTORIES
            .iter()
            .map(|&(name, build)| Arc::new(BuiltinFactory { name, build }) as Arc<dyn LoadBalancerFactory>)
            .collect();
        Self { factories, user_count: 0 }
    }
    /// Registers `factory`, shadowing any built-in policy of the same name.
    pub fn register(&mut self, factory: Arc<dyn LoadBalancerFactory>) {
        self.factories.insert(self.user_count, factory);
        self.user_count += 1;
    }
    /// The factory registered for `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn LoadBalancerFactory>> {
        self.factories.iter().find(|factory| factory.name() == name)
    }
    /// Whether a factory is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
    /// The first config in `service_config` naming a registered policy.
    pub fn select(&self, service_config: &ServiceConfig) -> Option<LoadBalancingConfig> {
        service_config.load_balancing_configs.iter().find(|config| self.contains(&config.policy_name)).cloned()
    }
}
