//! Account backed by a private key held in process memory.

use crate::{AccountError, AccountFactory, AccountInterface, AccountRegistry, SignedTransaction};
use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, Bytes};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use bookmarket_types::{
	without_0x_prefix, ConfigSchema, Field, FieldType, ImplementationRegistry, Schema,
	SecretString, ValidationError,
};
use tracing::info;

pub struct LocalAccount {
	signer: PrivateKeySigner,
}

impl LocalAccount {
	pub fn new(private_key: &SecretString) -> Result<Self, AccountError> {
		let signer = private_key
			.with_exposed(|key| key.parse::<PrivateKeySigner>())
			.map_err(|e| AccountError::InvalidKey(format!("Invalid private key format: {}", e)))?;

		info!(address = %signer.address(), "Local account loaded");
		Ok(Self { signer })
	}
}

#[async_trait]
impl AccountInterface for LocalAccount {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalAccountSchema)
	}

	async fn address(&self) -> Result<Address, AccountError> {
		Ok(self.signer.address())
	}

	async fn sign_transaction(&self, mut tx: TxLegacy) -> Result<SignedTransaction, AccountError> {
		let signature = self
			.signer
			.sign_transaction_sync(&mut tx)
			.map_err(|e| AccountError::SigningFailed(e.to_string()))?;

		let envelope = TxEnvelope::from(tx.into_signed(signature));
		Ok(SignedTransaction {
			hash: *envelope.tx_hash(),
			raw: Bytes::from(envelope.encoded_2718()),
		})
	}

	async fn sign_message(&self, message: &[u8]) -> Result<Bytes, AccountError> {
		let signature = self
			.signer
			.sign_message_sync(message)
			.map_err(|e| AccountError::SigningFailed(e.to_string()))?;
		Ok(Bytes::from(signature.as_bytes().to_vec()))
	}
}

pub struct LocalAccountSchema;

impl ConfigSchema for LocalAccountSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("private_key", FieldType::String).with_validator(|value| {
				let key = value.as_str().map(without_0x_prefix).unwrap_or_default();
				if key.len() != 64 {
					return Err("Private key must be 64 hex characters (32 bytes)".to_string());
				}
				if hex::decode(key).is_err() {
					return Err("Private key must be valid hexadecimal".to_string());
				}
				Ok(())
			})],
			vec![],
		);
		schema.validate(config)
	}
}

/// Builds a [`LocalAccount`] from `[account.implementations.local]`.
pub fn create_account(config: &toml::Value) -> Result<Box<dyn AccountInterface>, AccountError> {
	LocalAccountSchema
		.validate(config)
		.map_err(|e| AccountError::InvalidKey(e.to_string()))?;

	let private_key = config
		.get("private_key")
		.and_then(|v| v.as_str())
		.map(SecretString::from)
		.ok_or_else(|| AccountError::InvalidKey("private_key is required".into()))?;

	Ok(Box::new(LocalAccount::new(&private_key)?))
}

pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "local";
	type Factory = AccountFactory;

	fn factory() -> Self::Factory {
		create_account
	}
}

impl AccountRegistry for Registry {}
