// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use service::init_tracing;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser)]
struct Flags {
    /// Sets the port numbers to listen on.
    #[clap(long, value_delimiter = ',', default_value = "8888,8889,8890")]
    ports: Vec<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("lbchannel echo server")?;

    let mut listeners = Vec::with_capacity(flags.ports.len());
    for port in flags.ports {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)).await?;
        tracing::info!(port, "listening");
        listeners.push(tokio::spawn(serve(listener, port)));
    }
    for listener in listeners {
        listener.await?;
    }
    Ok(())
}

async fn serve(listener: TcpListener, port: u16) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(async move {
                    if let Err(e) = echo(stream, port).await {
                        tracing::warn!(%peer, "connection closed: {e}");
                    }
                });
            },
            Err(e) => tracing::warn!(port, "accept failed: {e}"),
        }
    }
}

async fn echo(stream: TcpStream, port: u16) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    while stream.read_line(&mut line).await? > 0 {
        let reply = format!("port {port}: {}\n", line.trim_end());
        stream.write_all(reply.as_bytes()).await?;
        stream.flush().await?;
        line.clear();
    }
    Ok(())
}
