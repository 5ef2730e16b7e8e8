// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Resolvable endpoints and the addresses handed to load balancers.

use faststr::FastStr;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

/// Attribute key whose value is sent as the outgoing `host` header instead of the endpoint.
pub const HOST_OVERRIDE_KEY: &str = "HostOverride";

/// A host and port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: FastStr,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<FastStr>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
    /// Returns the host name or IP literal.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }
    /// Returns the port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// One resolved address: an endpoint plus attributes attached by the resolver.
///
/// Two addresses are equal when both the endpoint and every attribute match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalancerAddress {
    endpoint: Endpoint,
    attributes: BTreeMap<FastStr, FastStr>,
}

impl BalancerAddress {
    /// Creates an address without attributes.
    pub fn new(host: impl Into<FastStr>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::new(host, port),
            attributes: BTreeMap::new(),
        }
    }
    /// Returns a copy with `key` set to `value`.
    pub fn with_attribute(mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
    /// Returns the endpoint.
    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
    /// Returns all attributes.
    #[inline]
    pub fn attributes(&self) -> &BTreeMap<FastStr, FastStr> {
        &self.attributes
    }
    /// Gets an attribute value.
    #[inline]
    pub fn attribute(&self, key: &str) -> Option<&FastStr> {
        self.attributes.get(key)
    }
    /// The value of the [`HOST_OVERRIDE_KEY`] attribute, if any.
    #[inline]
    pub fn host_override(&self) -> Option<&FastStr> {
        self.attribute(HOST_OVERRIDE_KEY)
    }
}

impl From<Endpoint> for BalancerAddress {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            attributes: BTreeMap::new(),
        }
    }
}

impl From<SocketAddr> for BalancerAddress {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::from(addr).into()
    }
}

impl fmt::Display for BalancerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.endpoint, f)
    }
}
