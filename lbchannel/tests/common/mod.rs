// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
#![allow(dead_code)]

use futures::future::BoxFuture;
use futures::FutureExt;
use lbchannel::client::balance::{ChannelController, ChannelState, LoadBalancer, LoadBalancerFactory, PickFirstBalancer, RoundRobinBalancer};
use lbchannel::client::config::LoadBalancingConfig;
use lbchannel::client::subchannel::{Subchannel, SubchannelId, SubchannelState};
use lbchannel::net::BalancerAddress;
use lbchannel::transport::{BoxIo, ConnectResult, SubchannelTransport, TransportFactory};
use lbchannel::Status;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// A transport factory whose transports connect to every address unless told otherwise.
#[derive(Clone, Default)]
pub struct TestTransportFactory {
    inner: Arc<FactoryInner>,
}

#[derive(Default)]
struct FactoryInner {
    failing: Mutex<HashSet<BalancerAddress>>,
    broken_streams: Mutex<HashSet<BalancerAddress>>,
    gates: Mutex<HashMap<BalancerAddress, Arc<Semaphore>>>,
    attempts: Mutex<Vec<BalancerAddress>>,
    created: AtomicUsize,
}

impl TestTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect attempts to `address` fail.
    pub fn fail(&self, address: &BalancerAddress) {
        self.inner.failing.lock().insert(address.clone());
    }

    /// Streams opened to `address` fail; connect attempts still succeed.
    pub fn fail_streams(&self, address: &BalancerAddress) {
        self.inner.broken_streams.lock().insert(address.clone());
    }

    /// Connect attempts to `address` wait until [`TestTransportFactory::release`].
    pub fn hold(&self, address: &BalancerAddress) {
        self.inner.gates.lock().insert(address.clone(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, address: &BalancerAddress) {
        if let Some(gate) = self.inner.gates.lock().remove(address) {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    pub fn attempts(&self) -> Vec<BalancerAddress> {
        self.inner.attempts.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }
}

impl TransportFactory for TestTransportFactory {
    fn create(&self, _subchannel: SubchannelId) -> Arc<dyn SubchannelTransport> {
        self.inner.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(TestTransport { inner: self.inner.clone() })
    }
}

struct TestTransport {
    inner: Arc<FactoryInner>,
}

impl SubchannelTransport for TestTransport {
    fn try_connect<'a>(&'a self, address: &'a BalancerAddress, cancel: CancellationToken) -> BoxFuture<'a, ConnectResult> {
        async move {
            self.inner.attempts.lock().push(address.clone());
            let gate = self.inner.gates.lock().get(address).cloned();
            if let Some(gate) = gate {
                tokio::select! {
                    _ = cancel.cancelled() => return ConnectResult::failure(Status::cancelled("connect cancelled")),
                    _ = gate.acquire() => {},
                }
            }
            if self.inner.failing.lock().contains(address) {
                ConnectResult::failure(Status::unavailable(format!("connect to {address} refused")))
            } else {
                ConnectResult::ready()
            }
        }
        .boxed()
    }

    fn get_stream<'a>(&'a self, address: &'a BalancerAddress, _cancel: CancellationToken) -> BoxFuture<'a, Result<BoxIo, Status>> {
        async move {
            if self.inner.broken_streams.lock().contains(address) {
                return Err(Status::unavailable(format!("stream to {address} reset")));
            }
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client) as BoxIo)
        }
        .boxed()
    }

    fn disconnect(&self) {}
}

/// Counts balancers created and disposed for one policy name.
#[derive(Clone, Default)]
pub struct PolicyCounters {
    pub created: Arc<AtomicUsize>,
    pub disposed: Arc<AtomicUsize>,
}

impl PolicyCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Wraps a built-in policy under its own name and counts its instances.
pub struct CountingFactory {
    name: &'static str,
    counters: PolicyCounters,
}

impl CountingFactory {
    pub fn pick_first(counters: PolicyCounters) -> Self {
        Self { name: "pick_first", counters }
    }

    pub fn round_robin(counters: PolicyCounters) -> Self {
        Self { name: "round_robin", counters }
    }
}

impl LoadBalancerFactory for CountingFactory {
    fn name(&self) -> &str {
        self.name
    }

    fn create(&self, _config: &LoadBalancingConfig) -> Box<dyn LoadBalancer> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let inner: Box<dyn LoadBalancer> = match self.name {
            "round_robin" => Box::new(RoundRobinBalancer::new()),
            _ => Box::new(PickFirstBalancer::new()),
        };
        Box::new(CountingBalancer {
            inner,
            disposed: self.counters.disposed.clone(),
        })
    }
}

struct CountingBalancer {
    inner: Box<dyn LoadBalancer>,
    disposed: Arc<AtomicUsize>,
}

impl LoadBalancer for CountingBalancer {
    fn update_channel_state(&mut self, state: ChannelState, controller: &mut dyn ChannelController) {
        self.inner.update_channel_state(state, controller)
    }

    fn subchannel_state_changed(&mut self, subchannel: &Subchannel, state: &SubchannelState, controller: &mut dyn ChannelController) {
        self.inner.subchannel_state_changed(subchannel, state, controller)
    }

    fn request_connection(&mut self, controller: &mut dyn ChannelController) {
        self.inner.request_connection(controller)
    }

    fn dispose(&mut self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        self.inner.dispose()
    }
}

/// Counts log events by the value of their `event` field.
#[derive(Clone, Default)]
pub struct EventCounter {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl EventCounter {
    pub fn count(&self, event: &str) -> usize {
        self.counts.lock().get(event).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct EventField(Option<String>);

impl Visit for EventField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "event" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "event" && self.0.is_none() {
            self.0 = Some(format!("{value:?}").trim_matches('"').to_owned());
        }
    }
}

impl<S: Subscriber> Layer<S> for EventCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut field = EventField::default();
        event.record(&mut field);
        if let Some(name) = field.0 {
            *self.counts.lock().entry(name).or_default() += 1;
        }
    }
}

/// Captures events of the current thread until the guard drops.
pub fn capture_events() -> (EventCounter, DefaultGuard) {
    let counter = EventCounter::default();
    let subscriber = tracing_subscriber::registry().with(counter.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (counter, guard)
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within 5s");
}

pub fn address(host: &str, port: u16) -> BalancerAddress {
    BalancerAddress::new(host.to_owned(), port)
}
