// Modifications Copyright Andeya Lee 2024
// Based on original source code from Volo Contributors licensed under MIT OR Apache-2.0
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Name resolution: turns a target into addresses and an optional service config.

use crate::client::config::ServiceConfig;
use crate::net::BalancerAddress;
use crate::Status;
use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
pub use dns::DnsResolver;
pub use fixed::StaticResolver;
pub use manual::ManualResolver;
use tracing::{trace, warn};

mod dns;
mod fixed;
mod manual;

/// Capacity of a resolver's result channel; older results are overwritten when full.
const RESULT_CHANNEL_CAPACITY: usize = 16;

/// [`Resolver`] is the most basic trait for name resolution.
///
/// Results are pushed through the receiver returned by [`Resolver::watch`]; nothing polls.
pub trait Resolver: Send + Sync + 'static {
    /// Starts resolving. Called at most once by a connection manager.
    fn start(&self);
    /// `watch` should return a [`async_broadcast::Receiver`] which can be used to subscribe
    /// [`ResolverResult`]s published after the call.
    fn watch(&self) -> Receiver<ResolverResult>;
    /// Asks for a fresh resolution, e.g. after a connection failure.
    fn refresh(&self) {}
    /// Stops any background work.
    fn shutdown(&self) {}
}

impl<R> Resolver for std::sync::Arc<R>
where
    R: Resolver + ?Sized,
{
    fn start(&self) {
        (**self).start()
    }
    fn watch(&self) -> Receiver<ResolverResult> {
        (**self).watch()
    }
    fn refresh(&self) {
        (**self).refresh()
    }
    fn shutdown(&self) {
        (**self).shutdown()
    }
}

/// One resolution snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverResult {
    /// Set when resolution itself failed.
    pub status: Option<Status>,
    /// Resolved addresses, in resolver order.
    pub addresses: Vec<BalancerAddress>,
    /// Service config, when the resolver supplies one.
    pub service_config: Option<ServiceConfig>,
    /// Set when the resolver found a service config but could not use it.
    pub service_config_status: Option<Status>,
}

impl ResolverResult {
    /// A successful resolution. A service config status must carry an error.
    pub fn for_result(addresses: Vec<BalancerAddress>, service_config: Option<ServiceConfig>, service_config_status: Option<Status>) -> Result<Self, Status> {
        if service_config_status.as_ref().is_some_and(Status::is_ok) {
            return Err(Status::invalid_argument("service config status requires an error status"));
        }
        Ok(Self {
            status: None,
            addresses,
            service_config,
            service_config_status,
        })
    }
    /// A successful resolution carrying only addresses.
    pub fn for_addresses(addresses: Vec<BalancerAddress>) -> Self {
        Self {
            status: None,
            addresses,
            service_config: None,
            service_config_status: None,
        }
    }
    /// A failed resolution. An `Ok` status is rejected.
    pub fn for_failure(status: Status) -> Result<Self, Status> {
        if status.is_ok() {
            return Err(Status::invalid_argument("resolver failure requires an error status"));
        }
        Ok(Self {
            status: Some(status),
            addresses: Vec::new(),
            service_config: None,
            service_config_status: None,
        })
    }
    /// The first error carried by the result, resolution errors first. `Ok` statuses are not errors.
    pub fn error(&self) -> Option<&Status> {
        [&self.status, &self.service_config_status].into_iter().flatten().find(|status| !status.is_ok())
    }
}

/// Publishing side of a resolver's result channel.
///
/// Publishing never waits: with no subscriber the result is dropped, and a slow subscriber
/// loses the oldest results first.
pub struct ResolverPublisher {
    sender: Sender<ResolverResult>,
    keep_open: InactiveReceiver<ResolverResult>,
}

impl Default for ResolverPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverPublisher {
    /// Creates an open channel without subscribers.
    pub fn new() -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(RESULT_CHANNEL_CAPACITY);
        sender.set_overflow(true);
        sender.set_await_active(false);
        Self {
            sender,
            keep_open: receiver.deactivate(),
        }
    }
    /// Subscribes to results published from now on.
    pub fn subscribe(&self) -> Receiver<ResolverResult> {
        self.keep_open.activate_cloned()
    }
    /// Publishes a result to every subscriber.
    pub fn publish(&self, result: ResolverResult) {
        match self.sender.try_broadcast(result) {
            Ok(None) => {},
            Ok(Some(_)) => trace!("[LBCHANNEL] resolver channel full, dropped the oldest result"),
            Err(TrySendError::Inactive(_)) => trace!("[LBCHANNEL] resolver result published without subscribers"),
            Err(err) => warn!("[LBCHANNEL] failed to publish resolver result: {:?}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ResolverPublisher, ResolverResult};
    use crate::net::BalancerAddress;
    use crate::{Code, Status};

    #[test]
    fn test_failure_requires_error_status() {
        assert!(ResolverResult::for_failure(Status::ok()).is_err());
        let failure = ResolverResult::for_failure(Status::internal("An error!")).unwrap();
        assert_eq!(failure.error().map(Status::code), Some(Code::Internal));
        assert!(failure.addresses.is_empty());
    }

    #[test]
    fn test_result_rejects_ok_service_config_status() {
        let addresses = vec![BalancerAddress::new("localhost", 80)];
        let err = ResolverResult::for_result(addresses.clone(), None, Some(Status::ok())).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let result = ResolverResult::for_result(addresses.clone(), None, Some(Status::internal("An error!"))).unwrap();
        assert_eq!(result.error().map(Status::message), Some("An error!"));

        // Hand-built results carrying `Ok` still report no error.
        let built = ResolverResult {
            service_config_status: Some(Status::ok()),
            ..ResolverResult::for_addresses(addresses)
        };
        assert_eq!(built.error(), None);
    }

    #[test]
    fn test_publisher_delivers_to_late_subscriber_only_new_results() {
        let publisher = ResolverPublisher::new();
        publisher.publish(ResolverResult::for_addresses(vec![BalancerAddress::new("localhost", 80)]));

        let mut receiver = publisher.subscribe();
        assert!(receiver.try_recv().is_err());

        let next = ResolverResult::for_addresses(vec![BalancerAddress::new("localhost", 81)]);
        publisher.publish(next.clone());
        assert_eq!(receiver.try_recv().unwrap(), next);
    }
}
