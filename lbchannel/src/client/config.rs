// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Service config supplied alongside resolved addresses.

use faststr::FastStr;

/// Name of the pick-first policy.
pub const PICK_FIRST_POLICY_NAME: &str = "pick_first";
/// Name of the round-robin policy.
pub const ROUND_ROBIN_POLICY_NAME: &str = "round_robin";

/// Policy selection data for a target.
///
/// Entries are tried in order; the first one naming a registered policy wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Candidate load balancing policies, most preferred first.
    #[serde(default)]
    pub load_balancing_configs: Vec<LoadBalancingConfig>,
}

impl ServiceConfig {
    /// A config listing the given policies.
    pub fn with_policies<I, S>(policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FastStr>,
    {
        Self {
            load_balancing_configs: policies.into_iter().map(LoadBalancingConfig::new).collect(),
        }
    }
}

/// One named load balancing policy config.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancingConfig {
    /// The registered name of the policy.
    pub policy_name: FastStr,
}

impl LoadBalancingConfig {
    /// Creates a config for `policy_name`.
    pub fn new(policy_name: impl Into<FastStr>) -> Self {
        Self { policy_name: policy_name.into() }
    }
    /// Config for [`PICK_FIRST_POLICY_NAME`].
    pub fn pick_first() -> Self {
        Self::new(PICK_FIRST_POLICY_NAME)
    }
    /// Config for [`ROUND_ROBIN_POLICY_NAME`].
    pub fn round_robin() -> Self {
        Self::new(ROUND_ROBIN_POLICY_NAME)
    }
}
