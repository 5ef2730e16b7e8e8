// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use lbchannel::client::{CallPipeline, OutgoingCall, SubchannelBinding};
use lbchannel::Status;
use std::future::Future;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes a tracing subscriber that logs to stdout, filtered by `RUST_LOG`.
pub fn init_tracing(service_name: &'static str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .try_init()?;
    tracing::info!(service_name, "tracing initialized");
    Ok(())
}

/// Sends the call path as one line and reads one echoed line back.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoPipeline;

impl CallPipeline for EchoPipeline {
    type Response = String;

    fn send(&self, call: OutgoingCall, binding: SubchannelBinding, cancel: CancellationToken) -> impl Future<Output = Result<Self::Response, Status>> + Send {
        async move {
            let stream = binding.connect(cancel).await?;
            let mut stream = BufReader::new(stream);
            let request = format!("{}\n", call.path);
            stream.write_all(request.as_bytes()).await.map_err(|e| Status::unavailable(format!("write to {} failed: {e}", binding.address())))?;
            stream.flush().await.map_err(|e| Status::unavailable(format!("flush to {} failed: {e}", binding.address())))?;
            let mut reply = String::new();
            stream.read_line(&mut reply).await.map_err(|e| Status::unavailable(format!("read from {} failed: {e}", binding.address())))?;
            Ok(reply.trim_end().to_owned())
        }
    }
}
