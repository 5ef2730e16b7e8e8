// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Switches between load balancing policies without interrupting traffic.
//!
//! The handler owns up to two children. The `current` child serves picks. When an update
//! selects a different policy, the new child is staged as `pending` and connects its own
//! subchannels in the background; it replaces `current` only once it reports Ready.

use super::pick_first::PickFirstBalancer;
use super::{BalancerState, ChannelController, ChannelState, LoadBalancer, LoadBalancerRegistry};
use crate::client::config::{LoadBalancingConfig, PICK_FIRST_POLICY_NAME};
use crate::client::subchannel::{Subchannel, SubchannelId, SubchannelState};
use crate::client::ConnectivityState;
use crate::net::BalancerAddress;
use faststr::FastStr;
use std::collections::HashSet;
use tracing::{debug, warn};

/// A policy instance and the subchannels it created.
struct Child {
    name: FastStr,
    balancer: Box<dyn LoadBalancer>,
    subchannels: HashSet<SubchannelId>,
}

impl Child {
    fn new(name: FastStr, balancer: Box<dyn LoadBalancer>) -> Self {
        Self {
            name,
            balancer,
            subchannels: HashSet::new(),
        }
    }

    fn dispose(mut self) {
        debug!(policy = %self.name, "[LBCHANNEL] disposing load balancer");
        self.balancer.dispose();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Current,
    Pending,
}

/// The two child slots. Each transition returns the child it displaced, which the caller
/// must dispose.
#[derive(Default)]
struct Slots {
    current: Option<Child>,
    pending: Option<Child>,
}

impl Slots {
    /// The first child becomes current; later ones replace the pending child.
    fn stage(&mut self, child: Child) -> (Slot, Option<Child>) {
        if self.current.is_none() {
            self.current = Some(child);
            (Slot::Current, None)
        } else {
            (Slot::Pending, self.pending.replace(child))
        }
    }

    fn promote(&mut self) -> Option<Child> {
        let pending = self.pending.take()?;
        self.current.replace(pending)
    }

    fn abandon_pending(&mut self) -> Option<Child> {
        self.pending.take()
    }

    fn newest(&self) -> Option<Slot> {
        if self.pending.is_some() {
            Some(Slot::Pending)
        } else if self.current.is_some() {
            Some(Slot::Current)
        } else {
            None
        }
    }

    fn get_mut(&mut self, slot: Slot) -> Option<&mut Child> {
        match slot {
            Slot::Current => self.current.as_mut(),
            Slot::Pending => self.pending.as_mut(),
        }
    }

    fn find(&self, policy_name: &str) -> Option<Slot> {
        if self.current.as_ref().is_some_and(|child| child.name.as_str() == policy_name) {
            Some(Slot::Current)
        } else if self.pending.as_ref().is_some_and(|child| child.name.as_str() == policy_name) {
            Some(Slot::Pending)
        } else {
            None
        }
    }

    fn owner_of(&self, subchannel: SubchannelId) -> Option<Slot> {
        if self.current.as_ref().is_some_and(|child| child.subchannels.contains(&subchannel)) {
            Some(Slot::Current)
        } else if self.pending.as_ref().is_some_and(|child| child.subchannels.contains(&subchannel)) {
            Some(Slot::Pending)
        } else {
            None
        }
    }
}

/// The controller handed to a child: records the subchannels it creates and holds back its
/// state updates for the handler to route.
struct ChildController<'a, 'b> {
    parent: &'a mut (dyn ChannelController + 'b),
    subchannels: &'a mut HashSet<SubchannelId>,
    update: Option<BalancerState>,
}

impl ChannelController for ChildController<'_, '_> {
    fn create_subchannel(&mut self, addresses: Vec<BalancerAddress>) -> Subchannel {
        let subchannel = self.parent.create_subchannel(addresses);
        self.subchannels.insert(subchannel.id());
        subchannel
    }

    fn update_state(&mut self, state: BalancerState) {
        self.update = Some(state);
    }

    fn refresh_resolver(&mut self) {
        self.parent.refresh_resolver();
    }
}

/// The balancer a connection manager talks to. It delegates to the child selected by the
/// latest update and performs graceful policy swaps.
pub struct ChildHandlerBalancer {
    registry: LoadBalancerRegistry,
    slots: Slots,
}

impl ChildHandlerBalancer {
    /// Creates a handler without children.
    pub fn new(registry: LoadBalancerRegistry) -> Self {
        Self {
            registry,
            slots: Slots::default(),
        }
    }

    /// Name of the policy serving picks.
    pub fn current_policy(&self) -> Option<&str> {
        self.slots.current.as_ref().map(|child| child.name.as_str())
    }

    /// Name of the policy waiting to become Ready.
    pub fn pending_policy(&self) -> Option<&str> {
        self.slots.pending.as_ref().map(|child| child.name.as_str())
    }

    fn create_child(&self, config: &LoadBalancingConfig) -> Option<Child> {
        let factory = self.registry.get(&config.policy_name)?;
        Some(Child::new(config.policy_name.clone(), factory.create(config)))
    }

    fn stage(&mut self, child: Child) -> Slot {
        debug!(policy = %child.name, "[LBCHANNEL] created load balancer");
        let (slot, displaced) = self.slots.stage(child);
        if let Some(displaced) = displaced {
            displaced.dispose();
        }
        slot
    }

    /// Picks the child that receives a resolver update, creating or abandoning children.
    fn select(&mut self, config: Option<&LoadBalancingConfig>) -> Slot {
        if let Some(config) = config {
            match self.slots.find(&config.policy_name) {
                Some(Slot::Current) => {
                    if let Some(abandoned) = self.slots.abandon_pending() {
                        debug!(policy = %abandoned.name, "[LBCHANNEL] abandoned pending load balancer");
                        abandoned.dispose();
                    }
                    return Slot::Current;
                },
                Some(Slot::Pending) => return Slot::Pending,
                None => match self.create_child(config) {
                    Some(child) => return self.stage(child),
                    None => warn!(policy = %config.policy_name, "[LBCHANNEL] load balancing policy is not registered"),
                },
            }
        }
        match self.slots.newest() {
            Some(slot) => slot,
            None => {
                let child = self
                    .create_child(&LoadBalancingConfig::pick_first())
                    .unwrap_or_else(|| Child::new(FastStr::from_static_str(PICK_FIRST_POLICY_NAME), Box::new(PickFirstBalancer::new())));
                self.stage(child)
            },
        }
    }

    fn route<F>(&mut self, slot: Slot, controller: &mut dyn ChannelController, f: F)
    where
        F: FnOnce(&mut dyn LoadBalancer, &mut dyn ChannelController),
    {
        let Some(child) = self.slots.get_mut(slot) else {
            return;
        };
        let mut child_controller = ChildController {
            parent: &mut *controller,
            subchannels: &mut child.subchannels,
            update: None,
        };
        f(child.balancer.as_mut(), &mut child_controller);
        let Some(update) = child_controller.update.take() else {
            return;
        };
        match slot {
            Slot::Current => controller.update_state(update),
            Slot::Pending if update.connectivity == ConnectivityState::Ready => {
                if let Some(displaced) = self.slots.promote() {
                    displaced.dispose();
                }
                debug!(policy = ?self.current_policy(), "[LBCHANNEL] switched load balancing policy");
                controller.update_state(update);
            },
            Slot::Pending => {},
        }
    }
}

impl LoadBalancer for ChildHandlerBalancer {
    fn update_channel_state(&mut self, state: ChannelState, controller: &mut dyn ChannelController) {
        let slot = self.select(state.load_balancing_config.as_ref());
        self.route(slot, controller, |balancer, controller| balancer.update_channel_state(state, controller));
    }

    fn subchannel_state_changed(&mut self, subchannel: &Subchannel, state: &SubchannelState, controller: &mut dyn ChannelController) {
        if let Some(slot) = self.slots.owner_of(subchannel.id()) {
            self.route(slot, controller, |balancer, controller| balancer.subchannel_state_changed(subchannel, state, controller));
        }
    }

    fn request_connection(&mut self, controller: &mut dyn ChannelController) {
        self.route(Slot::Current, controller, |balancer, controller| balancer.request_connection(controller));
        self.route(Slot::Pending, controller, |balancer, controller| balancer.request_connection(controller));
    }

    fn dispose(&mut self) {
        if let Some(pending) = self.slots.pending.take() {
            pending.dispose();
        }
        if let Some(current) = self.slots.current.take() {
            current.dispose();
        }
    }
}
