// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! net tool
pub mod address;
pub use address::{BalancerAddress, Endpoint, HOST_OVERRIDE_KEY};
