// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Round-robin: one subchannel per address, calls rotate over the ready ones.

use super::picker::{Pick, PickContext, PickResult, SubchannelPicker};
use super::{BalancerState, ChannelController, ChannelState, LoadBalancer};
use crate::client::subchannel::{Subchannel, SubchannelId, SubchannelState};
use crate::client::ConnectivityState;
use crate::Status;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The round-robin policy.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    subchannels: Vec<Subchannel>,
    published: Option<(ConnectivityState, Vec<SubchannelId>)>,
    last_failure: Option<Status>,
}

impl RoundRobinBalancer {
    /// Creates a balancer without subchannels.
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&mut self, controller: &mut dyn ChannelController) {
        let mut ready = Vec::new();
        let mut connecting = false;
        for subchannel in &self.subchannels {
            match subchannel.state().connectivity {
                ConnectivityState::Ready => {
                    if let Some(address) = subchannel.current_address() {
                        ready.push(Pick::new(subchannel.clone(), address));
                    }
                },
                ConnectivityState::Idle | ConnectivityState::Connecting => connecting = true,
                ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {},
            }
        }
        let connectivity = if !ready.is_empty() {
            ConnectivityState::Ready
        } else if connecting {
            ConnectivityState::Connecting
        } else {
            ConnectivityState::TransientFailure
        };
        let key = (connectivity, ready.iter().map(|pick| pick.subchannel.id()).collect::<Vec<_>>());
        if self.published.as_ref() == Some(&key) {
            return;
        }
        self.published = Some(key);
        let state = if ready.is_empty() {
            let status = match connectivity {
                ConnectivityState::TransientFailure => self.last_failure.clone(),
                _ => None,
            };
            BalancerState::queue(connectivity, status)
        } else {
            BalancerState::new(ConnectivityState::Ready, Arc::new(RoundRobinPicker::new(ready)))
        };
        controller.update_state(state);
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn update_channel_state(&mut self, state: ChannelState, controller: &mut dyn ChannelController) {
        if let Some(error) = state.error {
            if self.subchannels.is_empty() {
                controller.update_state(BalancerState::failure(error));
            }
            return;
        }
        if state.addresses.is_empty() {
            if self.subchannels.is_empty() {
                controller.update_state(BalancerState::failure(Status::unavailable("resolver returned no addresses")));
            }
            return;
        }

        let mut previous = std::mem::take(&mut self.subchannels);
        for address in state.addresses {
            let kept = previous.iter().position(|subchannel| subchannel.addresses().first() == Some(&address));
            let subchannel = match kept {
                Some(index) => previous.swap_remove(index),
                None => {
                    let subchannel = controller.create_subchannel(vec![address]);
                    subchannel.request_connection();
                    subchannel
                },
            };
            self.subchannels.push(subchannel);
        }
        for removed in previous {
            debug!(subchannel = %removed.id(), "[LBCHANNEL] round_robin released subchannel");
            removed.shutdown();
        }
        self.publish(controller);
    }

    fn subchannel_state_changed(&mut self, subchannel: &Subchannel, state: &SubchannelState, controller: &mut dyn ChannelController) {
        if !self.subchannels.contains(subchannel) {
            return;
        }
        match state.connectivity {
            ConnectivityState::Idle => subchannel.request_connection(),
            ConnectivityState::TransientFailure => {
                self.last_failure = state.status.clone();
                controller.refresh_resolver();
            },
            _ => {},
        }
        self.publish(controller);
    }

    fn request_connection(&mut self, _controller: &mut dyn ChannelController) {
        for subchannel in &self.subchannels {
            subchannel.request_connection();
        }
    }

    fn dispose(&mut self) {
        for subchannel in self.subchannels.drain(..) {
            subchannel.shutdown();
        }
    }
}

/// Rotates over the subchannels that were ready when it was built, starting at a random one.
pub struct RoundRobinPicker {
    picks: Vec<Pick>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    /// Creates a picker over `picks`.
    pub fn new(picks: Vec<Pick>) -> Self {
        let start = if picks.is_empty() { 0 } else { rand::thread_rng().gen_range(0..picks.len()) };
        Self {
            picks,
            next: AtomicUsize::new(start),
        }
    }
}

impl SubchannelPicker for RoundRobinPicker {
    fn pick(&self, _: &PickContext) -> PickResult {
        if self.picks.is_empty() {
            return PickResult::Queue;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.picks.len();
        PickResult::Complete(self.picks[index].clone())
    }
}
