// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Routes outbound calls through the connection manager.
//!
//! [`BalancedCaller`] picks a subchannel for each call, points the call at the picked address
//! and hands it to a [`CallPipeline`] together with a [`SubchannelBinding`]. The pipeline gets
//! its byte stream from the binding, which asks the [`SharedTransportHandler`] connect hook.

pub use super::balance::picker::Metadata;

use super::balance::{CompletionContext, PickContext};
use super::subchannel::Subchannel;
use super::{ClientError, ConnectionManager};
use crate::net::{BalancerAddress, Endpoint};
use crate::transport::BoxIo;
use crate::Status;
use faststr::FastStr;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Header carrying the `HostOverride` attribute of the picked address.
pub const HOST_HEADER: &str = "host";

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Wait for a ready subchannel instead of failing at once, default is false.
    pub wait_for_ready: bool,
    /// When the call gives up waiting.
    pub deadline: Option<Instant>,
}

impl CallOptions {
    /// Set whether to wait for a ready subchannel.
    pub fn with_wait_for_ready(mut self, wait_for_ready: bool) -> Self {
        self.wait_for_ready = wait_for_ready;
        self
    }
    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
    /// Set the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// An outbound call before routing.
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    /// Destination authority; rewritten to the picked endpoint.
    pub authority: Option<Endpoint>,
    /// Method path.
    pub path: FastStr,
    /// Request headers.
    pub headers: Metadata,
    /// Call options.
    pub options: CallOptions,
}

impl OutgoingCall {
    /// A call to `path` with default options.
    pub fn new(path: impl Into<FastStr>) -> Self {
        Self {
            authority: None,
            path: path.into(),
            headers: Metadata::new(),
            options: CallOptions::default(),
        }
    }
    /// Set the destination authority.
    pub fn with_authority(mut self, authority: Endpoint) -> Self {
        self.authority = Some(authority);
        self
    }
    /// Add a request header.
    pub fn with_header(mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
    /// Set the call options.
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }
}

/// Sends a routed call.
pub trait CallPipeline: Send + Sync + 'static {
    /// What a call resolves to once its response headers arrive.
    type Response: Send;
    /// Sends `call` over the subchannel in `binding`.
    fn send(&self, call: OutgoingCall, binding: SubchannelBinding, cancel: CancellationToken) -> impl Future<Output = Result<Self::Response, Status>> + Send;
}

/// The subchannel a call was routed to.
#[derive(Clone)]
pub struct SubchannelBinding {
    subchannel: Subchannel,
    address: BalancerAddress,
    handler: Arc<SharedTransportHandler>,
}

impl SubchannelBinding {
    /// The bound subchannel.
    pub fn subchannel(&self) -> &Subchannel {
        &self.subchannel
    }
    /// The picked address.
    pub fn address(&self) -> &BalancerAddress {
        &self.address
    }
    /// Opens a byte stream for the call through the transport handler.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<BoxIo, Status> {
        self.handler.connect(self.clone(), cancel).await
    }
}

impl std::fmt::Debug for SubchannelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubchannelBinding").field("subchannel", &self.subchannel.id()).field("address", &self.address).finish()
    }
}

/// Opens the byte stream of a bound call.
pub type ConnectHook = Arc<dyn Fn(SubchannelBinding, CancellationToken) -> BoxFuture<'static, Result<BoxIo, Status>> + Send + Sync>;

/// A transport handler shared by every caller of a process.
#[derive(Default)]
pub struct SharedTransportHandler {
    hook: Mutex<Option<ConnectHook>>,
}

impl SharedTransportHandler {
    /// Creates a handler without a connect hook.
    pub fn new() -> Self {
        Self::default()
    }
    /// Whether a connect hook is installed.
    pub fn has_connect_hook(&self) -> bool {
        self.hook.lock().is_some()
    }
    /// Opens a stream through the installed hook.
    pub async fn connect(&self, binding: SubchannelBinding, cancel: CancellationToken) -> Result<BoxIo, Status> {
        let hook = self.hook.lock().clone();
        match hook {
            Some(hook) => hook(binding, cancel).await,
            None => Err(Status::internal("transport handler has no connect hook")),
        }
    }
}

/// Installs the subchannel connect hook on `handler` unless one is installed.
/// Returns whether this call installed it.
pub fn ensure_connect_hook(handler: &SharedTransportHandler) -> bool {
    let mut hook = handler.hook.lock();
    if hook.is_some() {
        return false;
    }
    let installed: ConnectHook = Arc::new(|binding: SubchannelBinding, cancel: CancellationToken| {
        async move { binding.subchannel.get_stream(&binding.address, cancel).await }.boxed()
    });
    *hook = Some(installed);
    trace!("[LBCHANNEL] installed subchannel connect hook");
    true
}

/// Routes calls through a [`ConnectionManager`].
pub struct BalancedCaller<P> {
    manager: ConnectionManager,
    handler: Arc<SharedTransportHandler>,
    pipeline: P,
}

impl<P> BalancedCaller<P>
where
    P: CallPipeline,
{
    /// Creates a caller, installing the connect hook on `handler` if needed.
    pub fn new(manager: ConnectionManager, handler: Arc<SharedTransportHandler>, pipeline: P) -> Self {
        ensure_connect_hook(&handler);
        Self { manager, handler, pipeline }
    }

    /// The connection manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Routes and sends one call.
    pub async fn call(&self, mut call: OutgoingCall, cancel: &CancellationToken) -> Result<P::Response, ClientError> {
        self.manager.connect(false, cancel).await?;
        let context = PickContext {
            metadata: call.headers.clone(),
            deadline: call.options.deadline,
        };
        let pick = self.manager.pick(&context, call.options.wait_for_ready, cancel).await?;

        let endpoint = pick.address.endpoint();
        if call.authority.as_ref() != Some(endpoint) {
            call.authority = Some(endpoint.clone());
            if let Some(host) = pick.address.host_override() {
                call.headers.insert(FastStr::from_static_str(HOST_HEADER), host.clone());
            }
        }
        trace!(subchannel = %pick.subchannel.id(), address = %pick.address, path = %call.path, "[LBCHANNEL] call routed");

        let binding = SubchannelBinding {
            subchannel: pick.subchannel.clone(),
            address: pick.address.clone(),
            handler: self.handler.clone(),
        };
        let sent = self.pipeline.send(call, binding, cancel.clone());
        if let Some(tracker) = &pick.call_tracker {
            tracker.start();
        }
        let result = sent.await;
        if let Some(tracker) = &pick.call_tracker {
            tracker.complete(CompletionContext {
                address: pick.address.clone(),
                error: result.as_ref().err().cloned(),
            });
        }
        result.map_err(ClientError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::{ensure_connect_hook, SharedTransportHandler};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connect_hook_installed_once() {
        let handler = Arc::new(SharedTransportHandler::new());
        assert!(!handler.has_connect_hook());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let handler = handler.clone();
                tokio::spawn(async move { ensure_connect_hook(&handler) })
            })
            .collect();
        let mut installed = 0;
        for task in tasks {
            if task.await.unwrap() {
                installed += 1;
            }
        }
        assert_eq!(installed, 1);
        assert!(handler.has_connect_hook());
        assert!(!ensure_connect_hook(&handler));
    }
}
