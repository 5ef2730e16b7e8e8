// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! A subchannel is one logical connection to a group of equivalent addresses.
//!
//! Connectivity moves `Idle -> Connecting -> Ready | TransientFailure`; a failed round is
//! retried after a backoff delay, and `Shutdown` is terminal. Every transition is sent to the
//! owning connection manager, which hands it to the load balancer.

use super::backoff::BackoffPolicy;
use super::ConnectivityState;
use crate::net::BalancerAddress;
use crate::transport::{BoxIo, SubchannelTransport};
use crate::Status;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique subchannel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubchannelId(u64);

impl SubchannelId {
    /// Wraps a raw id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
    /// The raw id.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubchannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subchannel#{}", self.0)
    }
}

/// Connectivity of a subchannel plus the failure that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubchannelState {
    /// Current connectivity.
    pub connectivity: ConnectivityState,
    /// Set in [`ConnectivityState::TransientFailure`].
    pub status: Option<Status>,
}

impl SubchannelState {
    /// A state without a failure status.
    pub fn new(connectivity: ConnectivityState) -> Self {
        Self { connectivity, status: None }
    }
    /// A failed state.
    pub fn failure(status: Status) -> Self {
        Self {
            connectivity: ConnectivityState::TransientFailure,
            status: Some(status),
        }
    }
}

/// A state transition of one subchannel.
#[derive(Debug, Clone)]
pub(crate) struct SubchannelEvent {
    pub(crate) id: SubchannelId,
    pub(crate) state: SubchannelState,
}

/// Handle to a subchannel. Clones share the same connection.
#[derive(Clone)]
pub struct Subchannel {
    inner: Arc<Inner>,
}

struct Inner {
    id: SubchannelId,
    transport: Arc<dyn SubchannelTransport>,
    backoff: Arc<dyn BackoffPolicy>,
    events: UnboundedSender<SubchannelEvent>,
    core: Mutex<Core>,
}

struct Core {
    addresses: Vec<BalancerAddress>,
    state: SubchannelState,
    current_address: Option<BalancerAddress>,
    connect: Option<CancellationToken>,
}

impl Subchannel {
    pub(crate) fn new(
        id: SubchannelId,
        addresses: Vec<BalancerAddress>,
        transport: Arc<dyn SubchannelTransport>,
        backoff: Arc<dyn BackoffPolicy>,
        events: UnboundedSender<SubchannelEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                transport,
                backoff,
                events,
                core: Mutex::new(Core {
                    addresses,
                    state: SubchannelState::new(ConnectivityState::Idle),
                    current_address: None,
                    connect: None,
                }),
            }),
        }
    }

    /// The subchannel id.
    #[inline]
    pub fn id(&self) -> SubchannelId {
        self.inner.id
    }

    /// Candidate addresses, tried in order.
    pub fn addresses(&self) -> Vec<BalancerAddress> {
        self.inner.core.lock().addresses.clone()
    }

    /// Current state.
    pub fn state(&self) -> SubchannelState {
        self.inner.core.lock().state.clone()
    }

    /// The address of the established connection, set only while Ready.
    pub fn current_address(&self) -> Option<BalancerAddress> {
        self.inner.core.lock().current_address.clone()
    }

    /// The transport owned by this subchannel.
    #[inline]
    pub fn transport(&self) -> &Arc<dyn SubchannelTransport> {
        &self.inner.transport
    }

    /// Starts connecting if Idle; otherwise does nothing.
    pub fn request_connection(&self) {
        let mut core = self.inner.core.lock();
        if core.state.connectivity != ConnectivityState::Idle {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                let status = Status::internal(format!("cannot connect without a tokio runtime: {err}"));
                self.set_state(&mut core, SubchannelState::failure(status), None);
                return;
            },
        };
        let cancel = CancellationToken::new();
        core.connect = Some(cancel.clone());
        self.set_state(&mut core, SubchannelState::new(ConnectivityState::Connecting), None);
        drop(core);
        handle.spawn(self.clone().connect_loop(cancel));
    }

    /// Replaces the candidate addresses.
    ///
    /// A Ready connection whose address is still a candidate is kept; otherwise the current
    /// attempt is dropped and connecting starts over.
    pub fn update_addresses(&self, addresses: Vec<BalancerAddress>) {
        let mut core = self.inner.core.lock();
        if core.state.connectivity == ConnectivityState::Shutdown || core.addresses == addresses {
            return;
        }
        core.addresses = addresses;
        if core.state.connectivity == ConnectivityState::Ready {
            if let Some(current) = &core.current_address {
                if core.addresses.contains(current) {
                    return;
                }
            }
        }
        if let Some(connect) = core.connect.take() {
            connect.cancel();
        }
        let was_idle = core.state.connectivity == ConnectivityState::Idle;
        self.set_state(&mut core, SubchannelState::new(ConnectivityState::Idle), None);
        drop(core);
        if !was_idle {
            debug!(subchannel = %self.inner.id, "[LBCHANNEL] addresses changed, reconnecting");
            self.inner.transport.disconnect();
            self.request_connection();
        }
    }

    /// Opens a byte stream to `address` over the subchannel's transport.
    ///
    /// A failure to reach the connected address means the connection is gone: the subchannel
    /// drops it and moves to Idle so its load balancer reconnects.
    pub async fn get_stream(&self, address: &BalancerAddress, cancel: CancellationToken) -> Result<BoxIo, Status> {
        let result = self.inner.transport.get_stream(address, cancel.clone()).await;
        if let Err(status) = &result {
            if !cancel.is_cancelled() {
                self.connection_lost(address, status);
            }
        }
        result
    }

    fn connection_lost(&self, address: &BalancerAddress, status: &Status) {
        let mut core = self.inner.core.lock();
        if core.state.connectivity != ConnectivityState::Ready || core.current_address.as_ref() != Some(address) {
            return;
        }
        debug!(subchannel = %self.inner.id, %address, %status, "[LBCHANNEL] connection lost");
        if let Some(connect) = core.connect.take() {
            connect.cancel();
        }
        self.set_state(&mut core, SubchannelState::new(ConnectivityState::Idle), None);
        drop(core);
        self.inner.transport.disconnect();
    }

    /// Moves to Shutdown, cancelling any connect attempt and releasing the transport.
    pub fn shutdown(&self) {
        let mut core = self.inner.core.lock();
        if core.state.connectivity == ConnectivityState::Shutdown {
            return;
        }
        if let Some(connect) = core.connect.take() {
            connect.cancel();
        }
        self.set_state(&mut core, SubchannelState::new(ConnectivityState::Shutdown), None);
        drop(core);
        self.inner.transport.disconnect();
    }

    fn set_state(&self, core: &mut Core, state: SubchannelState, current_address: Option<BalancerAddress>) {
        core.current_address = current_address;
        if core.state == state {
            return;
        }
        trace!(subchannel = %self.inner.id, from = %core.state.connectivity, to = %state.connectivity, "[LBCHANNEL] subchannel state changed");
        core.state = state.clone();
        // The receiver is gone only after the manager shut down.
        let _ = self.inner.events.send(SubchannelEvent { id: self.inner.id, state });
    }

    /// Applies a transition made by the connect attempt guarded by `cancel`.
    fn transition(&self, cancel: &CancellationToken, state: SubchannelState, current_address: Option<BalancerAddress>) -> bool {
        let mut core = self.inner.core.lock();
        if cancel.is_cancelled() || core.state.connectivity == ConnectivityState::Shutdown {
            return false;
        }
        self.set_state(&mut core, state, current_address);
        true
    }

    async fn connect_loop(self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            let mut last_error = None;
            for address in self.addresses() {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = self.inner.transport.try_connect(&address, cancel.clone()) => result,
                };
                if result.state == ConnectivityState::Ready {
                    debug!(subchannel = %self.inner.id, %address, "[LBCHANNEL] subchannel connected");
                    self.transition(&cancel, SubchannelState::new(ConnectivityState::Ready), Some(address));
                    return;
                }
                let status = result.error.unwrap_or_else(|| Status::unavailable(format!("connect to {address} ended in {}", result.state)));
                debug!(subchannel = %self.inner.id, %address, %status, "[LBCHANNEL] subchannel connect failed");
                last_error = Some(status);
            }

            attempt = attempt.saturating_add(1);
            let status = match last_error {
                Some(status) => Status::unavailable(status.message().to_owned()),
                None => Status::unavailable("subchannel has no addresses"),
            };
            if !self.transition(&cancel, SubchannelState::failure(status), None) {
                return;
            }
            let delay = self.inner.backoff.next_delay(attempt);
            trace!(subchannel = %self.inner.id, attempt, delay = %humantime::format_duration(delay), "[LBCHANNEL] subchannel backing off");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {},
            }
            if !self.transition(&cancel, SubchannelState::new(ConnectivityState::Connecting), None) {
                return;
            }
        }
    }
}

impl PartialEq for Subchannel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Subchannel {}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Subchannel")
            .field("id", &self.inner.id)
            .field("addresses", &core.addresses)
            .field("state", &core.state)
            .field("current_address", &core.current_address)
            .finish()
    }
}
