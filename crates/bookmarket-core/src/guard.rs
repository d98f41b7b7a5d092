//! Startup check that the chain client points at the expected network.

use alloy_primitives::{Address, U256};
use bookmarket_delivery::ChainInterface;
use bookmarket_types::NetworkProfile;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur while verifying the configured network.
#[derive(Debug, Error)]
pub enum GuardError {
	/// Error that occurs when the chain endpoint does not answer.
	#[error("Chain endpoint unreachable: {0}")]
	Unreachable(String),
	/// Error that occurs when the chain or network id differs from configuration.
	#[error("Network mismatch: {field} is {actual}, expected {expected}")]
	NetworkMismatch {
		field: &'static str,
		expected: u64,
		actual: u64,
	},
	/// Error that occurs when no usable account is found on the network.
	#[error("No accounts reachable on the network")]
	NoFundedAccounts,
}

/// What the guard observed on a network that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedNetwork {
	pub chain_id: u64,
	pub network_id: u64,
	pub accounts: Vec<Address>,
	/// Accounts seen with a non-zero balance.
	pub funded: Vec<Address>,
}

pub struct NetworkGuard;

impl NetworkGuard {
	/// Checks, in order: the endpoint answers, the chain id matches, the
	/// network id matches, and at least one account is reachable.
	///
	/// `known_accounts` are accounts the process signs with; they count as
	/// reachable alongside those the node itself exposes. All accounts at a
	/// zero balance only produces a warning.
	pub async fn verify(
		chain: &dyn ChainInterface,
		profile: &NetworkProfile,
		known_accounts: &[Address],
	) -> Result<VerifiedNetwork, GuardError> {
		let chain_id = chain
			.get_chain_id()
			.await
			.map_err(|e| GuardError::Unreachable(e.to_string()))?;
		if chain_id != profile.expected_chain_id {
			return Err(GuardError::NetworkMismatch {
				field: "chain id",
				expected: profile.expected_chain_id,
				actual: chain_id,
			});
		}

		let network_id = chain
			.get_network_id()
			.await
			.map_err(|e| GuardError::Unreachable(e.to_string()))?;
		if network_id != profile.expected_network_id {
			return Err(GuardError::NetworkMismatch {
				field: "network id",
				expected: profile.expected_network_id,
				actual: network_id,
			});
		}

		let mut accounts = match chain.get_accounts().await {
			Ok(accounts) => accounts,
			Err(e) if e.is_transient() => return Err(GuardError::Unreachable(e.to_string())),
			Err(e) => {
				// Hosted endpoints commonly refuse eth_accounts.
				warn!(error = %e, "Node does not list accounts");
				Vec::new()
			},
		};
		for account in known_accounts {
			if !accounts.contains(account) {
				accounts.push(*account);
			}
		}
		if accounts.is_empty() {
			return Err(GuardError::NoFundedAccounts);
		}

		let mut funded = Vec::new();
		for account in &accounts {
			let balance = chain
				.get_balance(*account)
				.await
				.map_err(|e| GuardError::Unreachable(e.to_string()))?;
			if balance > U256::ZERO {
				funded.push(*account);
			}
		}
		if funded.is_empty() {
			warn!(accounts = accounts.len(), "All reachable accounts have zero balance");
		}

		info!(
			chain_id,
			network_id,
			accounts = accounts.len(),
			funded = funded.len(),
			"Network verified"
		);
		Ok(VerifiedNetwork {
			chain_id,
			network_id,
			accounts,
			funded,
		})
	}
}
