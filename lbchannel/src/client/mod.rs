// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Resolves targets, balances load across subchannels and picks a connection for every call.

pub mod backoff;
pub mod balance;
pub mod caller;
pub mod config;
pub mod manager;
pub mod resolver;
pub mod subchannel;

pub use caller::{ensure_connect_hook, BalancedCaller, CallOptions, CallPipeline, OutgoingCall, SharedTransportHandler, SubchannelBinding};
pub use config::{LoadBalancingConfig, ServiceConfig};
pub use manager::{Builder, ConnectionManager, RESOLVER_FALLBACK_EVENT};

use crate::Status;
use std::fmt;

/// The connectivity of a subchannel, a load balancer or the whole channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// Not connected and not trying to connect.
    Idle,
    /// Establishing a connection.
    Connecting,
    /// Connected and able to carry calls.
    Ready,
    /// The last attempt failed; another attempt follows after a backoff.
    TransientFailure,
    /// Terminal. Nothing leaves this state.
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Errors returned to callers of the connection manager.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// A resolver, balancer or transport failure, carried verbatim.
    #[error(transparent)]
    Status(#[from] Status),
    /// The caller cancelled while waiting.
    #[error("operation was cancelled while waiting for the channel")]
    Cancelled,
    /// The call deadline passed while waiting.
    #[error("deadline exceeded while waiting for a ready subchannel")]
    DeadlineExceeded,
}

impl ClientError {
    /// The carried status, if the error came from the channel rather than from the caller.
    pub fn status(&self) -> Option<&Status> {
        match self {
            ClientError::Status(status) => Some(status),
            _ => None,
        }
    }
}
