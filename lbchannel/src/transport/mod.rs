// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Byte-stream transports used by subchannels.
//!
//! A [`TransportFactory`] creates one [`SubchannelTransport`] per subchannel. The subchannel
//! checks connectivity through [`SubchannelTransport::try_connect`]; the call pipeline later
//! asks the same transport for a stream with [`SubchannelTransport::get_stream`].

pub mod tcp;
pub use tcp::{TcpConfig, TcpTransportFactory};

use crate::client::subchannel::SubchannelId;
use crate::client::ConnectivityState;
use crate::net::BalancerAddress;
use crate::Status;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// A bidirectional byte stream.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed [`Io`].
pub type BoxIo = Box<dyn Io>;

/// Outcome of a connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    /// The state the subchannel should move to for this address.
    pub state: ConnectivityState,
    /// Why the attempt did not reach [`ConnectivityState::Ready`].
    pub error: Option<Status>,
}

impl ConnectResult {
    /// A successful attempt.
    pub fn ready() -> Self {
        Self {
            state: ConnectivityState::Ready,
            error: None,
        }
    }
    /// A failed attempt.
    pub fn failure(error: Status) -> Self {
        Self {
            state: ConnectivityState::TransientFailure,
            error: Some(error),
        }
    }
}

/// The transport owned by one subchannel.
pub trait SubchannelTransport: Send + Sync + 'static {
    /// Tries to connect to `address`, resolving to the resulting connectivity.
    fn try_connect<'a>(&'a self, address: &'a BalancerAddress, cancel: CancellationToken) -> BoxFuture<'a, ConnectResult>;
    /// Returns a byte stream to `address` for a call bound to this subchannel.
    fn get_stream<'a>(&'a self, address: &'a BalancerAddress, cancel: CancellationToken) -> BoxFuture<'a, Result<BoxIo, Status>>;
    /// Releases any connection held for the subchannel.
    fn disconnect(&self);
}

/// Creates subchannel transports.
pub trait TransportFactory: Send + Sync + 'static {
    /// Creates the transport for a new subchannel.
    fn create(&self, subchannel: SubchannelId) -> Arc<dyn SubchannelTransport>;
}

impl<T> TransportFactory for Arc<T>
where
    T: TransportFactory + ?Sized,
{
    fn create(&self, subchannel: SubchannelId) -> Arc<dyn SubchannelTransport> {
        (**self).create(subchannel)
    }
}
