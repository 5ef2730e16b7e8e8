// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Pickers route a single call to a subchannel.

use crate::client::subchannel::Subchannel;
use crate::net::BalancerAddress;
use crate::Status;
use faststr::FastStr;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Call headers.
pub type Metadata = BTreeMap<FastStr, FastStr>;

/// An immutable routing snapshot. A balancer publishes a new picker on every state change.
pub trait SubchannelPicker: Send + Sync + 'static {
    /// Routes one call.
    fn pick(&self, context: &PickContext) -> PickResult;
}

/// What a picker may inspect about a call.
#[derive(Debug, Clone, Default)]
pub struct PickContext {
    /// Headers of the outgoing call.
    pub metadata: Metadata,
    /// When the call gives up.
    pub deadline: Option<Instant>,
}

impl PickContext {
    /// A context with the given deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The outcome of a pick.
#[derive(Debug, Clone)]
pub enum PickResult {
    /// Use this subchannel.
    Complete(Pick),
    /// Nothing is usable yet; wait for the next picker.
    Queue,
    /// The call fails with this status.
    Fail(Status),
}

/// A chosen subchannel.
#[derive(Clone)]
pub struct Pick {
    /// The subchannel carrying the call.
    pub subchannel: Subchannel,
    /// The connected address of the subchannel.
    pub address: BalancerAddress,
    /// Told when the call starts and when its response headers arrive.
    pub call_tracker: Option<Arc<dyn SubchannelCallTracker>>,
}

impl Pick {
    /// A pick without a tracker.
    pub fn new(subchannel: Subchannel, address: BalancerAddress) -> Self {
        Self {
            subchannel,
            address,
            call_tracker: None,
        }
    }
    /// Attaches a call tracker.
    pub fn with_call_tracker(mut self, call_tracker: Arc<dyn SubchannelCallTracker>) -> Self {
        self.call_tracker = Some(call_tracker);
        self
    }
}

impl fmt::Debug for Pick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pick")
            .field("subchannel", &self.subchannel.id())
            .field("address", &self.address)
            .field("call_tracker", &self.call_tracker.is_some())
            .finish()
    }
}

/// Observes calls routed through a pick.
pub trait SubchannelCallTracker: Send + Sync + 'static {
    /// The call was dispatched.
    fn start(&self);
    /// The response headers arrived or the call failed before them.
    fn complete(&self, context: CompletionContext);
}

/// Completion of a tracked call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionContext {
    /// The address the call went to.
    pub address: BalancerAddress,
    /// Set when the call failed.
    pub error: Option<Status>,
}

/// Queues every pick.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuePicker;

impl SubchannelPicker for QueuePicker {
    fn pick(&self, _: &PickContext) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with a fixed status.
#[derive(Debug, Clone)]
pub struct FailPicker {
    status: Status,
}

impl FailPicker {
    /// Creates a picker failing with `status`.
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

impl SubchannelPicker for FailPicker {
    fn pick(&self, _: &PickContext) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}
