// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Pick-first: one subchannel over the whole address list, every call goes to the first
//! address that connects.

use super::picker::{Pick, PickContext, PickResult, SubchannelPicker};
use super::{BalancerState, ChannelController, ChannelState, LoadBalancer};
use crate::client::subchannel::{Subchannel, SubchannelState};
use crate::client::ConnectivityState;
use crate::Status;
use std::sync::Arc;
use tracing::debug;

/// The pick-first policy.
#[derive(Debug, Default)]
pub struct PickFirstBalancer {
    subchannel: Option<Subchannel>,
}

impl PickFirstBalancer {
    /// Creates a balancer without a subchannel.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for PickFirstBalancer {
    fn update_channel_state(&mut self, state: ChannelState, controller: &mut dyn ChannelController) {
        if let Some(error) = state.error {
            if self.subchannel.is_none() {
                controller.update_state(BalancerState::failure(error));
            }
            return;
        }
        if state.addresses.is_empty() {
            if self.subchannel.is_none() {
                controller.update_state(BalancerState::failure(Status::unavailable("resolver returned no addresses")));
            }
            return;
        }
        match &self.subchannel {
            Some(subchannel) => subchannel.update_addresses(state.addresses),
            None => {
                let subchannel = controller.create_subchannel(state.addresses);
                debug!(subchannel = %subchannel.id(), "[LBCHANNEL] pick_first created subchannel");
                subchannel.request_connection();
                self.subchannel = Some(subchannel);
                controller.update_state(BalancerState::queue(ConnectivityState::Connecting, None));
            },
        }
    }

    fn subchannel_state_changed(&mut self, subchannel: &Subchannel, state: &SubchannelState, controller: &mut dyn ChannelController) {
        if self.subchannel.as_ref() != Some(subchannel) {
            return;
        }
        match state.connectivity {
            ConnectivityState::Ready => {
                let picker = PickFirstPicker { subchannel: subchannel.clone() };
                controller.update_state(BalancerState::new(ConnectivityState::Ready, Arc::new(picker)));
            },
            ConnectivityState::Idle => {
                subchannel.request_connection();
                controller.update_state(BalancerState::queue(ConnectivityState::Connecting, None));
            },
            ConnectivityState::Connecting => controller.update_state(BalancerState::queue(ConnectivityState::Connecting, None)),
            ConnectivityState::TransientFailure => {
                controller.update_state(BalancerState::queue(ConnectivityState::TransientFailure, state.status.clone()));
                controller.refresh_resolver();
            },
            ConnectivityState::Shutdown => {},
        }
    }

    fn request_connection(&mut self, _controller: &mut dyn ChannelController) {
        if let Some(subchannel) = &self.subchannel {
            subchannel.request_connection();
        }
    }

    fn dispose(&mut self) {
        if let Some(subchannel) = self.subchannel.take() {
            subchannel.shutdown();
        }
    }
}

/// Routes every call to the one subchannel while it is connected.
#[derive(Debug)]
pub struct PickFirstPicker {
    subchannel: Subchannel,
}

impl SubchannelPicker for PickFirstPicker {
    fn pick(&self, _: &PickContext) -> PickResult {
        match self.subchannel.current_address() {
            Some(address) => PickResult::Complete(Pick::new(self.subchannel.clone(), address)),
            None => PickResult::Queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PickFirstBalancer;
    use crate::client::balance::testing::RecordingController;
    use crate::client::balance::{ChannelState, LoadBalancer, PickContext, PickResult};
    use crate::client::ConnectivityState;
    use crate::net::BalancerAddress;
    use crate::{Code, Status};
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_picks_first_reachable_address() {
        let mut controller = RecordingController::new();
        let mut balancer = PickFirstBalancer::new();
        let state = ChannelState {
            addresses: vec![BalancerAddress::new("127.0.0.1", 1), BalancerAddress::new("127.0.0.1", 2)],
            ..Default::default()
        };
        balancer.update_channel_state(state, &mut controller);
        assert_eq!(controller.created.len(), 1);
        assert_eq!(controller.last_state().connectivity, ConnectivityState::Connecting);

        controller.drive_until(&mut balancer, ConnectivityState::Ready).await;
        let pick = assert_matches!(controller.last_state().picker.pick(&PickContext::default()), PickResult::Complete(pick) => pick);
        assert_eq!(pick.address, BalancerAddress::new("127.0.0.1", 2));

        balancer.dispose();
        assert_eq!(controller.created[0].state().connectivity, ConnectivityState::Shutdown);
    }

    #[tokio::test]
    async fn test_error_without_subchannel_fails_picks() {
        let mut controller = RecordingController::new();
        let mut balancer = PickFirstBalancer::new();
        let state = ChannelState {
            error: Some(Status::internal("An error!")),
            ..Default::default()
        };
        balancer.update_channel_state(state, &mut controller);
        assert!(controller.created.is_empty());
        let status = assert_matches!(controller.last_state().picker.pick(&PickContext::default()), PickResult::Fail(status) => status);
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "An error!");
    }

    #[tokio::test]
    async fn test_failure_queues_and_refreshes_resolver() {
        let mut controller = RecordingController::new();
        let mut balancer = PickFirstBalancer::new();
        let state = ChannelState {
            addresses: vec![BalancerAddress::new("127.0.0.1", 1)],
            ..Default::default()
        };
        balancer.update_channel_state(state, &mut controller);
        controller.drive_until(&mut balancer, ConnectivityState::TransientFailure).await;

        let last = controller.last_state();
        assert_matches!(last.picker.pick(&PickContext::default()), PickResult::Queue);
        assert_eq!(last.unavailable_status().code(), Code::Unavailable);
        assert_eq!(controller.refreshes, 1);
        balancer.dispose();
    }
}
