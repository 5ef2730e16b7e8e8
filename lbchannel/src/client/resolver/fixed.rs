// Modifications Copyright Andeya Lee 2024
// Based on original source code from Volo Contributors licensed under MIT OR Apache-2.0
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Fixed address list resolver.

use super::{Resolver, ResolverPublisher, ResolverResult};
use crate::client::config::ServiceConfig;
use crate::net::BalancerAddress;
use async_broadcast::Receiver;
use std::net::SocketAddr;

/// [`StaticResolver`] is a simple implementation of [`Resolver`] that publishes a fixed list
/// of addresses once it is started.
pub struct StaticResolver {
    addresses: Vec<BalancerAddress>,
    service_config: Option<ServiceConfig>,
    publisher: ResolverPublisher,
}

impl StaticResolver {
    /// Creates a new [`StaticResolver`].
    pub fn new(addresses: Vec<BalancerAddress>) -> Self {
        Self {
            addresses,
            service_config: None,
            publisher: ResolverPublisher::new(),
        }
    }
    /// Publish `service_config` together with the addresses.
    pub fn with_service_config(mut self, service_config: ServiceConfig) -> Self {
        self.service_config = Some(service_config);
        self
    }
}

impl From<Vec<SocketAddr>> for StaticResolver {
    fn from(addrs: Vec<SocketAddr>) -> Self {
        Self::new(addrs.into_iter().map(BalancerAddress::from).collect())
    }
}

impl Resolver for StaticResolver {
    fn start(&self) {
        self.publisher.publish(ResolverResult {
            service_config: self.service_config.clone(),
            ..ResolverResult::for_addresses(self.addresses.clone())
        });
    }

    fn watch(&self) -> Receiver<ResolverResult> {
        self.publisher.subscribe()
    }
}
