// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! lbchannel is the client-side connection and load balancing core of an RPC client.
//!
//! A [`client::ConnectionManager`] drives a [`client::resolver::Resolver`], hands the resolved
//! addresses to a pluggable [`client::balance::LoadBalancer`], and serves picks of ready
//! [`client::subchannel::Subchannel`]s to callers. [`client::caller::BalancedCaller`] wires the
//! picks into an outbound call pipeline.
#![warn(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod net;
pub mod status;
pub mod transport;

pub use client::{ClientError, ConnectionManager};
pub use status::{Code, Status};
