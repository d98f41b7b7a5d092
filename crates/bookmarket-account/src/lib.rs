//! Signing accounts and signature verification.
//!
//! The orchestrator never sees raw key material outside an account
//! implementation: callers hand an [`AccountService`] to whatever needs a
//! signature and get back signed bytes.

use alloy_consensus::TxLegacy;
use alloy_primitives::{Address, Bytes, TxHash};
use async_trait::async_trait;
use bookmarket_types::{ConfigSchema, ImplementationRegistry};
use thiserror::Error;

pub mod implementations {
	pub mod local;
}

pub mod verifier;

pub use verifier::SignatureVerifier;

/// Errors that can occur during account operations.
#[derive(Debug, Error)]
pub enum AccountError {
	/// Error that occurs when a transaction or message cannot be signed.
	#[error("Signing failed: {0}")]
	SigningFailed(String),
	/// Error that occurs when the configured private key is malformed.
	#[error("Invalid key: {0}")]
	InvalidKey(String),
	/// Error that occurs inside an account implementation.
	#[error("Implementation error: {0}")]
	Implementation(String),
}

/// A transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
	pub hash: TxHash,
	/// EIP-2718 encoding of the signed transaction.
	pub raw: Bytes,
}

/// Trait defining the interface for signing accounts.
///
/// Implementations hold the key material; nothing outside them sees it.
#[async_trait]
pub trait AccountInterface: Send + Sync {
	/// Returns the configuration schema for this account implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Address transactions signed by this account are sent from.
	async fn address(&self) -> Result<Address, AccountError>;

	/// Signs `tx` (EIP-155 replay protection via its `chain_id`).
	async fn sign_transaction(&self, tx: TxLegacy) -> Result<SignedTransaction, AccountError>;

	/// Personal-message signature (`"\x19Ethereum Signed Message:\n" + len` prefix),
	/// 65 bytes `r || s || v` with `v` in {27, 28}.
	async fn sign_message(&self, message: &[u8]) -> Result<Bytes, AccountError>;
}

pub type AccountFactory = fn(&toml::Value) -> Result<Box<dyn AccountInterface>, AccountError>;

/// Registration for account implementations.
pub trait AccountRegistry: ImplementationRegistry<Factory = AccountFactory> {}

pub fn get_all_implementations() -> Vec<(&'static str, AccountFactory)> {
	use implementations::local;

	vec![(local::Registry::NAME, local::Registry::factory())]
}

pub struct AccountService {
	implementation: Box<dyn AccountInterface>,
}

impl AccountService {
	pub fn new(implementation: Box<dyn AccountInterface>) -> Self {
		Self { implementation }
	}

	pub async fn address(&self) -> Result<Address, AccountError> {
		self.implementation.address().await
	}

	pub async fn sign_transaction(&self, tx: TxLegacy) -> Result<SignedTransaction, AccountError> {
		self.implementation.sign_transaction(tx).await
	}

	pub async fn sign_message(&self, message: &[u8]) -> Result<Bytes, AccountError> {
		self.implementation.sign_message(message).await
	}
}
