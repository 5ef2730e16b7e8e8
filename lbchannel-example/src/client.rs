// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use lbchannel::client::resolver::{DnsResolver, Resolver, StaticResolver};
use lbchannel::client::{BalancedCaller, Builder, CallOptions, OutgoingCall, ServiceConfig, SharedTransportHandler};
use lbchannel::net::BalancerAddress;
use lbchannel::transport::TcpTransportFactory;
use service::{init_tracing, EchoPipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
struct Flags {
    /// Sets the host to connect to.
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    /// Sets the ports to balance over; with `--dns` only the first is used.
    #[clap(long, value_delimiter = ',', default_value = "8888,8889,8890")]
    ports: Vec<u16>,
    /// Resolves the host through DNS instead of using it as a fixed address.
    #[clap(long)]
    dns: bool,
    /// Balances with round_robin instead of pick_first.
    #[clap(long)]
    round_robin: bool,
    /// Sets the number of calls to make.
    #[clap(long, default_value_t = 6)]
    calls: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("lbchannel echo client")?;

    let resolver: Arc<dyn Resolver> = if flags.dns {
        let port = flags.ports.first().copied().unwrap_or(8888);
        Arc::new(DnsResolver::new(flags.host.clone(), port))
    } else {
        Arc::new(StaticResolver::new(flags.ports.iter().map(|port| BalancerAddress::new(flags.host.clone(), *port)).collect()))
    };
    let policy = if flags.round_robin { "round_robin" } else { "pick_first" };
    let manager = Builder::new(resolver, TcpTransportFactory::default())
        .with_default_service_config(ServiceConfig::with_policies([policy]))
        .build();
    let caller = BalancedCaller::new(manager, Arc::new(SharedTransportHandler::new()), EchoPipeline);

    let cancel = CancellationToken::new();
    for i in 0..flags.calls {
        let call = OutgoingCall::new(format!("/echo/{i}")).with_options(CallOptions::default().with_wait_for_ready(true).with_timeout(Duration::from_secs(5)));
        match caller.call(call, &cancel).await {
            Ok(reply) => tracing::info!(call = i, "{reply}"),
            Err(e) => tracing::warn!(call = i, "{:?}", anyhow::Error::from(e)),
        }
    }
    caller.manager().shutdown();
    Ok(())
}
