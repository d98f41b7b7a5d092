//! Chain access and transaction delivery.
//!
//! [`ChainInterface`] is the thin boundary to the node: one method per JSON-RPC
//! query, no retries, no caching. Everything stateful about talking to the
//! chain sits on top of it: the [`fee::FeeEstimator`] caches fee quotes and the
//! [`submitter::DeliveryService`] assigns nonces, signs, broadcasts and waits for
//! receipts.

use alloy_primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use bookmarket_types::{ConfigSchema, ImplementationRegistry, NetworkProfile, PreparedCall};
use thiserror::Error;

pub mod implementations {
	pub mod evm {
		pub mod alloy;
	}
	pub mod simulated;
}

pub mod fee;
pub mod submitter;

pub use fee::{FeeEstimator, FeeQuote, FeeSource};
pub use submitter::{Broadcast, DeliveryService};

/// Errors from the chain client and the submitter.
#[derive(Debug, Error)]
pub enum DeliveryError {
	/// Error that occurs when the endpoint cannot be reached or does not answer.
	/// Retryable.
	#[error("Network error: {0}")]
	Network(String),
	/// Error that occurs when the node answers and refuses the request, for
	/// example on a revert or a bad nonce.
	#[error("Rejected by node: {0}")]
	Rejected(String),
	/// Error that occurs when the transaction cannot be signed.
	#[error("Signing error: {0}")]
	Signing(String),
	/// Error that occurs when a chain client's configuration is invalid.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

impl DeliveryError {
	/// Whether retrying the same request may succeed.
	pub fn is_transient(&self) -> bool {
		matches!(self, DeliveryError::Network(_))
	}
}

/// The parts of a transaction receipt the orchestrator acts on.
///
/// Only produced for mined transactions; a receipt without a block number is
/// reported as "not yet mined".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReceipt {
	pub hash: TxHash,
	pub block_number: u64,
	pub success: bool,
	pub gas_used: u64,
	pub effective_gas_price: u128,
}

impl ChainReceipt {
	/// Total fee paid, in wei.
	pub fn fee_used(&self) -> U256 {
		U256::from(self.gas_used) * U256::from(self.effective_gas_price)
	}
}

/// JSON-RPC queries against one EVM node.
#[async_trait]
pub trait ChainInterface: Send + Sync {
	/// Returns the configuration schema for this chain client.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// `eth_chainId`.
	async fn get_chain_id(&self) -> Result<u64, DeliveryError>;

	/// `net_version`.
	async fn get_network_id(&self) -> Result<u64, DeliveryError>;

	/// Accounts unlocked on the node.
	async fn get_accounts(&self) -> Result<Vec<Address>, DeliveryError>;

	/// Native balance of `address`, in wei.
	async fn get_balance(&self, address: Address) -> Result<U256, DeliveryError>;

	/// Transaction count including the pending pool.
	async fn get_transaction_count(&self, address: Address) -> Result<u64, DeliveryError>;

	/// Current fee per gas, in wei.
	async fn get_fee_estimate(&self) -> Result<u128, DeliveryError>;

	/// Deployed bytecode; empty when nothing is deployed at `address`.
	async fn get_code(&self, address: Address) -> Result<Bytes, DeliveryError>;

	/// Gas the call would use if sent now. Fails with `Rejected` if it would revert.
	async fn estimate_gas(&self, call: &PreparedCall) -> Result<u64, DeliveryError>;

	/// Read-only `eth_call` at the latest block.
	async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, DeliveryError>;

	/// Submits a signed transaction and returns the hash the node assigned.
	async fn send_raw_transaction(&self, raw: &Bytes) -> Result<TxHash, DeliveryError>;

	/// Receipt of a mined transaction; `None` while it is unknown or pending.
	async fn get_transaction_receipt(
		&self,
		hash: TxHash,
	) -> Result<Option<ChainReceipt>, DeliveryError>;
}

/// Builds a chain client from its `[delivery.implementations.<name>]` table.
pub type ChainFactory =
	fn(&toml::Value, &NetworkProfile) -> Result<Box<dyn ChainInterface>, DeliveryError>;

/// Registration for chain client implementations.
pub trait ChainRegistry: ImplementationRegistry<Factory = ChainFactory> {}

pub fn get_all_implementations() -> Vec<(&'static str, ChainFactory)> {
	use implementations::{evm::alloy, simulated};

	vec![
		(alloy::Registry::NAME, alloy::Registry::factory()),
		(simulated::Registry::NAME, simulated::Registry::factory()),
	]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fee_used_multiplies_gas_and_price() {
		let receipt = ChainReceipt {
			hash: TxHash::repeat_byte(1),
			block_number: 10,
			success: true,
			gas_used: 21_000,
			effective_gas_price: 20_000_000_000,
		};
		assert_eq!(receipt.fee_used(), U256::from(420_000_000_000_000u128));
	}

	#[test]
	fn test_both_implementations_registered() {
		let names: Vec<_> = get_all_implementations().into_iter().map(|(n, _)| n).collect();
		assert_eq!(names, vec!["evm_alloy", "simulated"]);
	}
}
