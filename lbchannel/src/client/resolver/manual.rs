// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Resolver driven by explicit updates.

use super::{Resolver, ResolverPublisher, ResolverResult};
use crate::client::config::ServiceConfig;
use crate::net::BalancerAddress;
use crate::Status;
use async_broadcast::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A resolver whose results are pushed by the application.
///
/// The latest result is kept; it is published when the resolver starts and every update
/// after that is published immediately.
#[derive(Default)]
pub struct ManualResolver {
    publisher: ResolverPublisher,
    latest: Mutex<Option<ResolverResult>>,
    started: AtomicUsize,
    refreshes: AtomicUsize,
}

impl ManualResolver {
    /// Creates a resolver without a result.
    pub fn new() -> Self {
        Self::default()
    }
    /// Replaces the addresses and service config. An `Ok` service config status is rejected.
    pub fn update_addresses(&self, addresses: Vec<BalancerAddress>, service_config: Option<ServiceConfig>, service_config_status: Option<Status>) -> Result<(), Status> {
        self.update_result(ResolverResult::for_result(addresses, service_config, service_config_status)?);
        Ok(())
    }
    /// Replaces the latest result.
    pub fn update_result(&self, result: ResolverResult) {
        let mut latest = self.latest.lock();
        *latest = Some(result.clone());
        if self.start_count() > 0 {
            self.publisher.publish(result);
        }
    }
    /// Number of times [`Resolver::start`] was called.
    pub fn start_count(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }
    /// Number of times [`Resolver::refresh`] was called.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Acquire)
    }
}

impl Resolver for ManualResolver {
    fn start(&self) {
        let latest = self.latest.lock();
        self.started.fetch_add(1, Ordering::AcqRel);
        if let Some(result) = latest.clone() {
            self.publisher.publish(result);
        }
    }

    fn watch(&self) -> Receiver<ResolverResult> {
        self.publisher.subscribe()
    }

    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::AcqRel);
    }
}
