// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! DNS resolver backed by the system resolver.

use super::{Resolver, ResolverPublisher, ResolverResult};
use crate::net::BalancerAddress;
use crate::Status;
use async_broadcast::Receiver;
use faststr::FastStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default interval between periodic resolutions.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Default minimum time between two resolutions.
const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Resolves `host:port` with [`tokio::net::lookup_host`].
///
/// Resolution runs on start, on every [`Resolver::refresh`] and periodically; resolutions are
/// never closer together than the minimum refresh interval.
pub struct DnsResolver {
    host: FastStr,
    port: u16,
    refresh_interval: Duration,
    min_refresh_interval: Duration,
    shared: Arc<Shared>,
}

struct Shared {
    publisher: ResolverPublisher,
    refresh: Notify,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl DnsResolver {
    /// Creates a resolver for `host:port`.
    pub fn new(host: impl Into<FastStr>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            shared: Arc::new(Shared {
                publisher: ResolverPublisher::new(),
                refresh: Notify::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }
    /// Set the interval between periodic resolutions, default is 30s.
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }
    /// Set the minimum time between two resolutions, default is 5s.
    pub fn with_min_refresh_interval(mut self, min_refresh_interval: Duration) -> Self {
        self.min_refresh_interval = min_refresh_interval;
        self
    }
}

impl Resolver for DnsResolver {
    fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                warn!("[LBCHANNEL] dns resolver for {}:{} needs a tokio runtime: {}", self.host, self.port, err);
                self.shared.started.store(false, Ordering::Release);
                return;
            },
        };
        let task = ResolveLoop {
            host: self.host.clone(),
            port: self.port,
            refresh_interval: self.refresh_interval,
            min_refresh_interval: self.min_refresh_interval,
            shared: self.shared.clone(),
        };
        handle.spawn(task.run());
    }

    fn watch(&self) -> Receiver<ResolverResult> {
        self.shared.publisher.subscribe()
    }

    fn refresh(&self) {
        self.shared.refresh.notify_one();
    }

    fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl Drop for DnsResolver {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

struct ResolveLoop {
    host: FastStr,
    port: u16,
    refresh_interval: Duration,
    min_refresh_interval: Duration,
    shared: Arc<Shared>,
}

impl ResolveLoop {
    async fn run(self) {
        loop {
            let resolved_at = Instant::now();
            let result = tokio::select! {
                _ = self.shared.shutdown.cancelled() => return,
                result = self.resolve() => result,
            };
            self.shared.publisher.publish(result);

            tokio::select! {
                _ = self.shared.shutdown.cancelled() => return,
                _ = self.shared.refresh.notified() => {},
                _ = tokio::time::sleep(self.refresh_interval) => {},
            }
            let earliest = resolved_at + self.min_refresh_interval;
            if Instant::now() < earliest {
                tokio::select! {
                    _ = self.shared.shutdown.cancelled() => return,
                    _ = tokio::time::sleep_until(earliest) => {},
                }
            }
        }
    }

    async fn resolve(&self) -> ResolverResult {
        match tokio::net::lookup_host((self.host.as_str(), self.port)).await {
            Ok(addrs) => {
                let mut addresses: Vec<BalancerAddress> = Vec::new();
                for addr in addrs {
                    let address = BalancerAddress::from(addr);
                    if !addresses.contains(&address) {
                        addresses.push(address);
                    }
                }
                debug!(host = %self.host, port = self.port, count = addresses.len(), "[LBCHANNEL] dns resolved");
                ResolverResult::for_addresses(addresses)
            },
            Err(err) => {
                debug!(host = %self.host, port = self.port, error = %err, "[LBCHANNEL] dns resolution failed");
                ResolverResult {
                    status: Some(Status::unavailable(format!("dns resolution of {}:{} failed: {}", self.host, self.port, err))),
                    addresses: Vec::new(),
                    service_config: None,
                    service_config_status: None,
                }
            },
        }
    }
}
