// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

mod common;

use assert_matches::assert_matches;
use common::{address, capture_events, wait_until, TestTransportFactory};
use lbchannel::client::balance::PickContext;
use lbchannel::client::resolver::{DnsResolver, ManualResolver, ResolverResult};
use lbchannel::client::{Builder, ClientError, LoadBalancingConfig, ServiceConfig, RESOLVER_FALLBACK_EVENT};
use lbchannel::net::BalancerAddress;
use lbchannel::transport::TcpTransportFactory;
use lbchannel::{Code, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn concurrent_connects_start_resolver_once() -> anyhow::Result<()> {
    let resolver = Arc::new(ManualResolver::new());
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).build();
    let cancel = CancellationToken::new();

    let connects = (0..10).map(|_| manager.connect(false, &cancel));
    for result in futures::future::join_all(connects).await {
        result?;
    }
    assert_eq!(resolver.start_count(), 1);
    Ok(())
}

#[tokio::test]
async fn first_resolution_error_fails_picks_verbatim() -> anyhow::Result<()> {
    let resolver = Arc::new(ManualResolver::new());
    resolver.update_result(ResolverResult::for_failure(Status::internal("An error!"))?);
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).build();
    let cancel = CancellationToken::new();
    manager.connect(false, &cancel).await?;

    for wait_for_ready in [false, true] {
        let err = manager.pick(&PickContext::default(), wait_for_ready, &cancel).await.unwrap_err();
        let status = assert_matches!(err, ClientError::Status(status) => status);
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "An error!");
    }
    Ok(())
}

#[tokio::test]
async fn first_service_config_error_fails_picks_verbatim() -> anyhow::Result<()> {
    let resolver = Arc::new(ManualResolver::new());
    resolver.update_addresses(vec![address("localhost", 80)], None, Some(Status::internal("An error!")))?;
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).build();
    let cancel = CancellationToken::new();
    manager.connect(false, &cancel).await?;

    let err = manager.pick(&PickContext::default(), false, &cancel).await.unwrap_err();
    let status = assert_matches!(err, ClientError::Status(status) => status);
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "An error!");
    Ok(())
}

#[tokio::test]
async fn pick_before_first_resolution_honors_deadline() -> anyhow::Result<()> {
    let resolver = Arc::new(ManualResolver::new());
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).build();
    let cancel = CancellationToken::new();
    manager.connect(false, &cancel).await?;

    let context = PickContext::default().with_deadline(tokio::time::Instant::now() + Duration::from_millis(20));
    let err = manager.pick(&context, false, &cancel).await.unwrap_err();
    assert_matches!(err, ClientError::DeadlineExceeded);
    Ok(())
}

#[tokio::test]
async fn error_after_success_keeps_previous_result() -> anyhow::Result<()> {
    let (events, _guard) = capture_events();
    let resolver = Arc::new(ManualResolver::new());
    resolver.update_addresses(vec![address("localhost", 80)], None, None)?;
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).build();
    let cancel = CancellationToken::new();
    manager.connect(true, &cancel).await?;

    let pick = manager.pick(&PickContext::default(), true, &cancel).await?;
    assert_eq!(pick.address, address("localhost", 80));

    resolver.update_addresses(vec![address("localhost", 80)], None, Some(Status::internal("An error!")))?;
    wait_until(|| events.count(RESOLVER_FALLBACK_EVENT) == 1).await;

    let pick = manager.pick(&PickContext::default(), false, &cancel).await?;
    assert_eq!(pick.address, address("localhost", 80));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(events.count(RESOLVER_FALLBACK_EVENT), 1);
    Ok(())
}

#[tokio::test]
async fn wait_for_ready_pick_waits_for_first_resolution() -> anyhow::Result<()> {
    let resolver = Arc::new(ManualResolver::new());
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).build();
    let cancel = CancellationToken::new();
    manager.connect(false, &cancel).await?;

    let waiting = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.pick(&PickContext::default(), true, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());

    resolver.update_addresses(vec![address("localhost", 80)], None, None)?;
    let pick = tokio::time::timeout(Duration::from_secs(5), waiting).await???;
    assert_eq!(pick.address, address("localhost", 80));
    Ok(())
}

#[tokio::test]
async fn disabled_resolver_service_config_keeps_pick_first() -> anyhow::Result<()> {
    let resolver = Arc::new(ManualResolver::new());
    resolver.update_addresses(vec![address("localhost", 80), address("localhost", 81)], Some(ServiceConfig::with_policies(["round_robin"])), None)?;
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).with_disable_resolver_service_config(true).build();
    let cancel = CancellationToken::new();
    manager.connect(true, &cancel).await?;

    let pick = manager.pick(&PickContext::default(), true, &cancel).await?;
    assert_eq!(pick.address, address("localhost", 80));
    assert_eq!(manager.current_policy().as_deref(), Some("pick_first"));
    assert_eq!(manager.subchannels().len(), 1);
    Ok(())
}

#[tokio::test]
async fn empty_addresses_keep_previous_and_still_swap_policy() -> anyhow::Result<()> {
    let resolver = Arc::new(ManualResolver::new());
    resolver.update_addresses(vec![address("localhost", 80)], None, None)?;
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).build();
    let cancel = CancellationToken::new();
    manager.connect(true, &cancel).await?;
    manager.pick(&PickContext::default(), true, &cancel).await?;

    resolver.update_addresses(Vec::new(), Some(ServiceConfig { load_balancing_configs: vec![LoadBalancingConfig::round_robin()] }), None)?;
    wait_until(|| manager.current_policy().as_deref() == Some("round_robin")).await;

    let pick = manager.pick(&PickContext::default(), true, &cancel).await?;
    assert_eq!(pick.address, address("localhost", 80));
    Ok(())
}

#[tokio::test]
async fn empty_first_resolution_is_unavailable() -> anyhow::Result<()> {
    let resolver = Arc::new(ManualResolver::new());
    resolver.update_addresses(Vec::new(), None, None)?;
    let manager = Builder::new(resolver.clone(), TestTransportFactory::new()).build();
    let cancel = CancellationToken::new();
    manager.connect(true, &cancel).await?;

    let err = manager.pick(&PickContext::default(), false, &cancel).await.unwrap_err();
    assert_eq!(err.status().map(Status::code), Some(Code::Unavailable));
    Ok(())
}

#[tokio::test]
async fn dns_resolver_over_tcp() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let manager = Builder::new(DnsResolver::new("127.0.0.1", port), TcpTransportFactory::default()).build();
    let cancel = CancellationToken::new();
    manager.connect(true, &cancel).await?;
    let pick = tokio::time::timeout(Duration::from_secs(5), manager.pick(&PickContext::default(), true, &cancel)).await??;
    assert_eq!(pick.address, BalancerAddress::new("127.0.0.1", port));
    manager.shutdown();
    Ok(())
}
