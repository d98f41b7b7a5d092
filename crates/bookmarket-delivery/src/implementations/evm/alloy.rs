//! Alloy-backed JSON-RPC chain client.
//!
//! A plain HTTP provider with every filler disabled: nonce, gas and fee are
//! chosen by the submitter, and signing happens in the account service, so the
//! provider only ever relays queries and pre-signed bytes.

use crate::{ChainInterface, ChainReceipt, DeliveryError};
use alloy_network::Ethereum;
use alloy_primitives::{Address, Bytes, TxHash, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{TransactionInput, TransactionRequest};
use alloy_transport::TransportError;
use async_trait::async_trait;
use bookmarket_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, NetworkProfile, PreparedCall, Schema,
	ValidationError,
};

/// Chain client talking to a single EVM node over HTTP.
pub struct AlloyChain {
	provider: DynProvider<Ethereum>,
}

impl AlloyChain {
	pub fn new(rpc_url: &str) -> Result<Self, DeliveryError> {
		let url: reqwest::Url = rpc_url
			.parse()
			.map_err(|e| DeliveryError::Configuration(format!("Invalid RPC URL {}: {}", rpc_url, e)))?;

		let provider = ProviderBuilder::new()
			.disable_recommended_fillers()
			.connect_http(url)
			.erased();

		Ok(Self { provider })
	}
}

/// Splits node refusals from transport failures.
///
/// A JSON-RPC error response means the node saw the request and said no; any
/// other failure leaves the request's fate unknown.
fn map_rpc_error(context: &str, err: TransportError) -> DeliveryError {
	match err.as_error_resp() {
		Some(payload) => DeliveryError::Rejected(format!("{}: {}", context, payload.message)),
		None => DeliveryError::Network(format!("{}: {}", context, err)),
	}
}

#[async_trait]
impl ChainInterface for AlloyChain {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(AlloyChainSchema)
	}

	async fn get_chain_id(&self) -> Result<u64, DeliveryError> {
		self.provider
			.get_chain_id()
			.await
			.map_err(|e| map_rpc_error("Failed to get chain id", e))
	}

	async fn get_network_id(&self) -> Result<u64, DeliveryError> {
		self.provider
			.get_net_version()
			.await
			.map_err(|e| map_rpc_error("Failed to get network id", e))
	}

	async fn get_accounts(&self) -> Result<Vec<Address>, DeliveryError> {
		self.provider
			.get_accounts()
			.await
			.map_err(|e| map_rpc_error("Failed to list accounts", e))
	}

	async fn get_balance(&self, address: Address) -> Result<U256, DeliveryError> {
		self.provider
			.get_balance(address)
			.await
			.map_err(|e| map_rpc_error("Failed to get balance", e))
	}

	async fn get_transaction_count(&self, address: Address) -> Result<u64, DeliveryError> {
		self.provider
			.get_transaction_count(address)
			.pending()
			.await
			.map_err(|e| map_rpc_error("Failed to get transaction count", e))
	}

	async fn get_fee_estimate(&self) -> Result<u128, DeliveryError> {
		self.provider
			.get_gas_price()
			.await
			.map_err(|e| map_rpc_error("Failed to get gas price", e))
	}

	async fn get_code(&self, address: Address) -> Result<Bytes, DeliveryError> {
		self.provider
			.get_code_at(address)
			.await
			.map_err(|e| map_rpc_error("Failed to get code", e))
	}

	async fn estimate_gas(&self, call: &PreparedCall) -> Result<u64, DeliveryError> {
		let request = TransactionRequest::default()
			.from(call.sender())
			.to(call.to())
			.value(call.value())
			.input(TransactionInput::new(call.calldata().clone()));

		self.provider
			.estimate_gas(request)
			.await
			.map_err(|e| map_rpc_error("Gas estimation failed", e))
	}

	async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, DeliveryError> {
		let request = TransactionRequest::default()
			.to(to)
			.input(TransactionInput::new(data));

		self.provider
			.call(request)
			.await
			.map_err(|e| map_rpc_error("Call failed", e))
	}

	async fn send_raw_transaction(&self, raw: &Bytes) -> Result<TxHash, DeliveryError> {
		let pending = self
			.provider
			.send_raw_transaction(raw)
			.await
			.map_err(|e| map_rpc_error("Failed to send transaction", e))?;
		Ok(*pending.tx_hash())
	}

	async fn get_transaction_receipt(
		&self,
		hash: TxHash,
	) -> Result<Option<ChainReceipt>, DeliveryError> {
		let receipt = self
			.provider
			.get_transaction_receipt(hash)
			.await
			.map_err(|e| map_rpc_error("Failed to get receipt", e))?;

		Ok(receipt.and_then(|r| {
			let block_number = r.block_number?;
			Some(ChainReceipt {
				hash: r.transaction_hash,
				block_number,
				success: r.status(),
				gas_used: r.gas_used,
				effective_gas_price: r.effective_gas_price,
			})
		}))
	}
}

/// `[delivery.implementations.evm_alloy]`
///
/// `rpc_url` is optional and overrides `network.rpc_url`.
pub struct AlloyChainSchema;

impl ConfigSchema for AlloyChainSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![Field::new("rpc_url", FieldType::String).with_validator(|value| {
				match value.as_str() {
					Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
					_ => Err("rpc_url must be an http(s) URL".to_string()),
				}
			})],
		);
		schema.validate(config)
	}
}

pub fn create_chain(
	config: &toml::Value,
	network: &NetworkProfile,
) -> Result<Box<dyn ChainInterface>, DeliveryError> {
	AlloyChainSchema
		.validate(config)
		.map_err(|e| DeliveryError::Configuration(format!("Invalid configuration: {}", e)))?;

	let rpc_url = config
		.get("rpc_url")
		.and_then(|v| v.as_str())
		.unwrap_or(&network.rpc_url);

	tracing::debug!(rpc_url = %rpc_url, "Creating HTTP chain client");
	Ok(Box::new(AlloyChain::new(rpc_url)?))
}

pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "evm_alloy";
	type Factory = crate::ChainFactory;

	fn factory() -> Self::Factory {
		create_chain
	}
}

impl crate::ChainRegistry for Registry {}
