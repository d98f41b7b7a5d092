//! Target network description and fee sanity bounds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One gwei in wei.
pub const GWEI: u128 = 1_000_000_000;

fn default_fee() -> u128 {
	20 * GWEI
}

fn default_fee_cache_ttl_seconds() -> u64 {
	60
}

fn default_max_confirm_wait_seconds() -> u64 {
	120
}

/// The chain the orchestrator is allowed to talk to.
///
/// Built once from configuration and checked against the live endpoint by the
/// network guard before anything else touches the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
	pub rpc_url: String,
	pub expected_chain_id: u64,
	/// Value reported by `net_version`.
	pub expected_network_id: u64,
	/// Fee per gas substituted when the network quote is unusable, in wei.
	#[serde(default = "default_fee")]
	pub default_fee: u128,
	#[serde(default = "default_fee_cache_ttl_seconds")]
	pub fee_cache_ttl_seconds: u64,
	#[serde(default = "default_max_confirm_wait_seconds")]
	pub max_confirm_wait_seconds: u64,
}

impl NetworkProfile {
	pub fn fee_cache_ttl(&self) -> Duration {
		Duration::from_secs(self.fee_cache_ttl_seconds)
	}

	pub fn max_confirm_wait(&self) -> Duration {
		Duration::from_secs(self.max_confirm_wait_seconds)
	}
}

fn default_min_fee() -> u128 {
	GWEI
}

fn default_max_fee() -> u128 {
	500 * GWEI
}

/// Inclusive range of fee-per-gas values accepted from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBounds {
	#[serde(default = "default_min_fee")]
	pub min_fee: u128,
	#[serde(default = "default_max_fee")]
	pub max_fee: u128,
}

impl FeeBounds {
	pub fn contains(&self, fee: u128) -> bool {
		fee >= self.min_fee && fee <= self.max_fee
	}
}

impl Default for FeeBounds {
	fn default() -> Self {
		Self {
			min_fee: default_min_fee(),
			max_fee: default_max_fee(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_profile_defaults_from_toml() {
		let profile: NetworkProfile = toml::from_str(
			r#"
			rpc_url = "http://127.0.0.1:7545"
			expected_chain_id = 1337
			expected_network_id = 5777
			"#,
		)
		.unwrap();
		assert_eq!(profile.default_fee, 20 * GWEI);
		assert_eq!(profile.fee_cache_ttl(), Duration::from_secs(60));
		assert_eq!(profile.max_confirm_wait(), Duration::from_secs(120));
	}

	#[test]
	fn test_bounds_are_inclusive() {
		let bounds = FeeBounds::default();
		assert!(bounds.contains(GWEI));
		assert!(bounds.contains(500 * GWEI));
		assert!(!bounds.contains(GWEI - 1));
		assert!(!bounds.contains(500 * GWEI + 1));
	}
}
