// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Balancer test support.

use super::{BalancerState, ChannelController, LoadBalancer};
use crate::client::backoff::ExponentialBackoff;
use crate::client::subchannel::{Subchannel, SubchannelEvent, SubchannelId};
use crate::client::ConnectivityState;
use crate::net::BalancerAddress;
use crate::transport::{BoxIo, ConnectResult, SubchannelTransport};
use crate::Status;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Connects to every port except 1.
pub(crate) struct PortTransport;

impl SubchannelTransport for PortTransport {
    fn try_connect<'a>(&'a self, address: &'a BalancerAddress, _cancel: CancellationToken) -> BoxFuture<'a, ConnectResult> {
        async move {
            if address.endpoint().port() == 1 {
                ConnectResult::failure(Status::unavailable("connection refused"))
            } else {
                ConnectResult::ready()
            }
        }
        .boxed()
    }

    fn get_stream<'a>(&'a self, _address: &'a BalancerAddress, _cancel: CancellationToken) -> BoxFuture<'a, Result<BoxIo, Status>> {
        async move { Err(Status::unavailable("no streams")) }.boxed()
    }

    fn disconnect(&self) {}
}

/// Records what a balancer does with its channel.
pub(crate) struct RecordingController {
    pub(crate) created: Vec<Subchannel>,
    pub(crate) states: Vec<BalancerState>,
    pub(crate) refreshes: usize,
    events_tx: UnboundedSender<SubchannelEvent>,
    events_rx: UnboundedReceiver<SubchannelEvent>,
}

impl RecordingController {
    pub(crate) fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            created: Vec::new(),
            states: Vec::new(),
            refreshes: 0,
            events_tx,
            events_rx,
        }
    }

    pub(crate) fn last_state(&self) -> &BalancerState {
        self.states.last().expect("no state published")
    }

    /// Feeds subchannel events to `balancer` until it publishes `connectivity`.
    pub(crate) async fn drive_until(&mut self, balancer: &mut dyn LoadBalancer, connectivity: ConnectivityState) {
        while self.states.last().map(|state| state.connectivity) != Some(connectivity) {
            let event = self.events_rx.recv().await.expect("events closed");
            self.dispatch(balancer, event);
        }
    }

    /// Feeds subchannel events to `balancer` until every created subchannel is Ready and its
    /// events were handled.
    pub(crate) async fn drive_until_all_ready(&mut self, balancer: &mut dyn LoadBalancer) {
        loop {
            let all_ready = self.created.iter().all(|subchannel| subchannel.state().connectivity == ConnectivityState::Ready);
            while let Ok(event) = self.events_rx.try_recv() {
                self.dispatch(balancer, event);
            }
            if all_ready {
                return;
            }
            if self.created.iter().all(|subchannel| subchannel.state().connectivity == ConnectivityState::Ready) {
                continue;
            }
            let event = self.events_rx.recv().await.expect("events closed");
            self.dispatch(balancer, event);
        }
    }

    fn dispatch(&mut self, balancer: &mut dyn LoadBalancer, event: SubchannelEvent) {
        if let Some(subchannel) = self.created.iter().find(|subchannel| subchannel.id() == event.id).cloned() {
            balancer.subchannel_state_changed(&subchannel, &event.state, self);
        }
    }
}

impl ChannelController for RecordingController {
    fn create_subchannel(&mut self, addresses: Vec<BalancerAddress>) -> Subchannel {
        let subchannel = Subchannel::new(
            SubchannelId::next(),
            addresses,
            Arc::new(PortTransport),
            Arc::new(ExponentialBackoff::default()),
            self.events_tx.clone(),
        );
        self.created.push(subchannel.clone());
        subchannel
    }

    fn update_state(&mut self, state: BalancerState) {
        self.states.push(state);
    }

    fn refresh_resolver(&mut self) {
        self.refreshes += 1;
    }
}
