// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! TCP transport.

use super::{BoxIo, ConnectResult, SubchannelTransport, TransportFactory};
use crate::client::subchannel::SubchannelId;
use crate::net::BalancerAddress;
use crate::Status;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// TCP transport config.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TcpConfig {
    /// Maximum time for one dial, default is 20s.
    pub(crate) connect_timeout: Duration,
    /// Whether to set `TCP_NODELAY`, default is true.
    pub(crate) nodelay: bool,
    /// TCP keepalive idle time, default is 60s; `None` disables keepalive.
    pub(crate) keepalive: Option<Duration>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl TcpConfig {
    /// Set the maximum time for one dial.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
    /// Set whether to disable Nagle's algorithm.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
    /// Set the keepalive idle time, `None` disables keepalive.
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }
    /// Maximum time for one dial.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Creates one [`TcpTransport`] per subchannel.
#[derive(Clone, Debug, Default)]
pub struct TcpTransportFactory {
    config: TcpConfig,
}

impl TcpTransportFactory {
    /// Creates a factory with the given config.
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self, subchannel: SubchannelId) -> Arc<dyn SubchannelTransport> {
        Arc::new(TcpTransport {
            subchannel,
            config: self.config.clone(),
            idle: Mutex::new(None),
        })
    }
}

/// A subchannel transport over TCP.
///
/// The stream dialed by a successful connect attempt is parked and handed to the first call that asks
/// for the same address; later calls dial fresh streams.
pub struct TcpTransport {
    subchannel: SubchannelId,
    config: TcpConfig,
    idle: Mutex<Option<(BalancerAddress, TcpStream)>>,
}

impl TcpTransport {
    async fn dial(&self, address: &BalancerAddress, cancel: &CancellationToken) -> Result<TcpStream, Status> {
        let endpoint = address.endpoint();
        let connect = TcpStream::connect((endpoint.host(), endpoint.port()));
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Status::cancelled(format!("connect to {endpoint} was cancelled"))),
            res = tokio::time::timeout(self.config.connect_timeout, connect) => match res {
                Ok(res) => res?,
                Err(_) => return Err(Status::deadline_exceeded(format!("connect to {endpoint} timed out after {}", humantime::format_duration(self.config.connect_timeout)))),
            },
        };
        stream.set_nodelay(self.config.nodelay)?;
        if let Some(idle) = self.config.keepalive {
            SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(stream)
    }
}

impl SubchannelTransport for TcpTransport {
    fn try_connect<'a>(&'a self, address: &'a BalancerAddress, cancel: CancellationToken) -> BoxFuture<'a, ConnectResult> {
        async move {
            match self.dial(address, &cancel).await {
                Ok(stream) => {
                    trace!(subchannel = %self.subchannel, %address, "[LBCHANNEL] tcp connect attempt succeeded");
                    *self.idle.lock() = Some((address.clone(), stream));
                    ConnectResult::ready()
                },
                Err(status) => {
                    debug!(subchannel = %self.subchannel, %address, %status, "[LBCHANNEL] tcp connect attempt failed");
                    ConnectResult::failure(status)
                },
            }
        }
        .boxed()
    }

    fn get_stream<'a>(&'a self, address: &'a BalancerAddress, cancel: CancellationToken) -> BoxFuture<'a, Result<BoxIo, Status>> {
        async move {
            let parked = {
                let mut idle = self.idle.lock();
                match idle.take() {
                    Some((parked_address, stream)) if &parked_address == address => Some(stream),
                    other => {
                        *idle = other;
                        None
                    },
                }
            };
            let stream = match parked {
                Some(stream) => stream,
                None => self.dial(address, &cancel).await?,
            };
            Ok(Box::new(stream) as BoxIo)
        }
        .boxed()
    }

    fn disconnect(&self) {
        if self.idle.lock().take().is_some() {
            trace!(subchannel = %self.subchannel, "[LBCHANNEL] dropped parked tcp stream");
        }
    }
}
