//! Contract binding over a deployment artifact.
//!
//! The artifact is the JSON file a deployment tool writes per contract: the
//! ABI plus the address the contract was deployed at on each network. Only
//! the entry for the verified network is ever used, and the binding refuses to
//! load unless code is actually present at that address.

use alloy_dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy_json_abi::{Function, JsonAbi, StateMutability};
use alloy_primitives::{Address, Bytes, U256};
use bookmarket_delivery::{ChainInterface, DeliveryError};
use bookmarket_types::PreparedCall;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub mod bookmarket;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bookmarket::{BookListing, BookMarket};

/// Errors that can occur while binding or calling the marketplace contract.
#[derive(Debug, Error)]
pub enum ContractError {
	/// Error that occurs when the artifact has no usable ABI.
	#[error("Contract interface missing: {0}")]
	InterfaceMissing(String),
	/// Error that occurs when the artifact has no deployment for the network.
	#[error("No deployment address for network {network_id} (artifact lists: {available})")]
	AddressNotFoundForNetwork { network_id: u64, available: String },
	/// Error that occurs when nothing is deployed at the artifact's address.
	#[error("No code at contract address {0}")]
	NoCodeAtAddress(Address),
	/// Error that occurs when the ABI lacks a function the service calls.
	#[error("Unknown contract function: {0}")]
	UnknownFunction(String),
	/// Error that occurs when call arguments cannot be ABI-encoded.
	#[error("Encoding error: {0}")]
	Encoding(String),
	/// Error that occurs when a call result cannot be ABI-decoded.
	#[error("Decoding error: {0}")]
	Decoding(String),
	/// Error that occurs when the chain client fails during a contract call.
	#[error("Chain error: {0}")]
	Chain(#[from] DeliveryError),
}

#[derive(Debug, Deserialize)]
struct NetworkDeployment {
	address: Address,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentArtifact {
	#[serde(default)]
	contract_name: Option<String>,
	#[serde(default)]
	abi: Option<JsonAbi>,
	#[serde(default)]
	networks: HashMap<String, NetworkDeployment>,
}

/// A deployed contract on the verified network.
pub struct ContractBinding {
	name: String,
	address: Address,
	abi: JsonAbi,
	chain: Arc<dyn ChainInterface>,
}

impl std::fmt::Debug for ContractBinding {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ContractBinding")
			.field("name", &self.name)
			.field("address", &self.address)
			.finish()
	}
}

impl ContractBinding {
	/// Parses `artifact` and binds the deployment for `network_id`.
	///
	/// Deployments on other networks are ignored. Fails if the ABI is absent,
	/// the network has no entry, or the address holds no code.
	pub async fn load(
		artifact: &str,
		network_id: u64,
		chain: Arc<dyn ChainInterface>,
	) -> Result<Self, ContractError> {
		let artifact: DeploymentArtifact = serde_json::from_str(artifact)
			.map_err(|e| ContractError::InterfaceMissing(format!("Invalid artifact: {}", e)))?;

		let name = artifact
			.contract_name
			.unwrap_or_else(|| "contract".to_string());
		let abi = artifact
			.abi
			.filter(|abi| abi.functions().next().is_some())
			.ok_or_else(|| ContractError::InterfaceMissing(format!("{} has no ABI functions", name)))?;

		let address = match artifact.networks.get(&network_id.to_string()) {
			Some(deployment) => deployment.address,
			None => {
				let mut available: Vec<_> = artifact.networks.keys().cloned().collect();
				available.sort();
				return Err(ContractError::AddressNotFoundForNetwork {
					network_id,
					available: if available.is_empty() {
						"none".to_string()
					} else {
						available.join(", ")
					},
				});
			},
		};

		let code = chain.get_code(address).await?;
		if code.is_empty() {
			return Err(ContractError::NoCodeAtAddress(address));
		}

		info!(contract = %name, address = %address, network_id, "Contract bound");
		Ok(Self {
			name,
			address,
			abi,
			chain,
		})
	}

	/// Reads the artifact from disk, then behaves like [`ContractBinding::load`].
	pub async fn from_file(
		path: impl AsRef<Path>,
		network_id: u64,
		chain: Arc<dyn ChainInterface>,
	) -> Result<Self, ContractError> {
		let path = path.as_ref();
		let content = tokio::fs::read_to_string(path).await.map_err(|e| {
			ContractError::InterfaceMissing(format!("Cannot read {}: {}", path.display(), e))
		})?;
		Self::load(&content, network_id, chain).await
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn address(&self) -> Address {
		self.address
	}

	pub fn abi(&self) -> &JsonAbi {
		&self.abi
	}

	/// Overload of `name` taking `arg_count` arguments.
	fn function(&self, name: &str, arg_count: usize) -> Result<&Function, ContractError> {
		let overloads = self
			.abi
			.function(name)
			.ok_or_else(|| ContractError::UnknownFunction(name.to_string()))?;
		overloads
			.iter()
			.find(|f| f.inputs.len() == arg_count)
			.ok_or_else(|| {
				ContractError::Encoding(format!(
					"{} does not take {} argument(s)",
					name, arg_count
				))
			})
	}

	fn encode(&self, function: &Function, args: &[DynSolValue]) -> Result<Bytes, ContractError> {
		function
			.abi_encode_input(args)
			.map(Bytes::from)
			.map_err(|e| ContractError::Encoding(format!("{}: {}", function.name, e)))
	}

	/// Read-only call: no signature, no fee.
	pub async fn call(
		&self,
		name: &str,
		args: &[DynSolValue],
	) -> Result<Vec<DynSolValue>, ContractError> {
		let function = self.function(name, args.len())?;
		let data = self.encode(function, args)?;
		let output = self.chain.call(self.address, data).await?;
		function
			.abi_decode_output(&output)
			.map_err(|e| ContractError::Decoding(format!("{}: {}", name, e)))
	}

	/// Encodes a state-changing call for the submitter.
	pub fn prepare(
		&self,
		name: &str,
		args: &[DynSolValue],
		sender: Address,
		value: U256,
	) -> Result<PreparedCall, ContractError> {
		let function = self.function(name, args.len())?;
		if !value.is_zero() && function.state_mutability != StateMutability::Payable {
			return Err(ContractError::Encoding(format!(
				"{} is not payable but {} wei was attached",
				name, value
			)));
		}
		let data = self.encode(function, args)?;
		Ok(PreparedCall::new(name, self.address, sender, value, data))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{artifact_json, contract_address, simulated_chain, NETWORK_ID};
	use bookmarket_delivery::implementations::simulated::SimulatedChain;

	#[tokio::test]
	async fn test_binds_verified_network_only() {
		let chain = Arc::new(simulated_chain());
		let binding = ContractBinding::load(&artifact_json(), NETWORK_ID, chain.clone())
			.await
			.unwrap();
		assert_eq!(binding.address(), contract_address());
		assert_eq!(binding.name(), "BookMarket");

		// The artifact also lists network 1; it must not be picked up for 9999.
		let err = ContractBinding::load(&artifact_json(), 9999, chain).await.unwrap_err();
		assert!(matches!(
			err,
			ContractError::AddressNotFoundForNetwork { network_id: 9999, .. }
		));
	}

	#[tokio::test]
	async fn test_no_code_at_address() {
		let chain = Arc::new(SimulatedChain::new(1337, NETWORK_ID));
		let err = ContractBinding::load(&artifact_json(), NETWORK_ID, chain)
			.await
			.unwrap_err();
		assert!(matches!(err, ContractError::NoCodeAtAddress(a) if a == contract_address()));
	}

	#[tokio::test]
	async fn test_missing_interface() {
		let chain = Arc::new(simulated_chain());
		let artifact = r#"{"contractName":"BookMarket","networks":{}}"#;
		let err = ContractBinding::load(artifact, NETWORK_ID, chain.clone())
			.await
			.unwrap_err();
		assert!(matches!(err, ContractError::InterfaceMissing(_)));

		let err = ContractBinding::load("not json", NETWORK_ID, chain).await.unwrap_err();
		assert!(matches!(err, ContractError::InterfaceMissing(_)));
	}

	#[tokio::test]
	async fn test_prepare_checks_name_arity_and_payability() {
		let chain = Arc::new(simulated_chain());
		let binding = ContractBinding::load(&artifact_json(), NETWORK_ID, chain)
			.await
			.unwrap();
		let sender = Address::repeat_byte(0x11);

		let call = binding
			.prepare(
				"purchaseBook",
				&[DynSolValue::Uint(U256::from(5u64), 256)],
				sender,
				U256::from(100u64),
			)
			.unwrap();
		assert_eq!(call.to(), contract_address());
		assert_eq!(call.calldata().len(), 4 + 32);

		assert!(matches!(
			binding.prepare("burnEverything", &[], sender, U256::ZERO),
			Err(ContractError::UnknownFunction(_))
		));
		assert!(matches!(
			binding.prepare("purchaseBook", &[], sender, U256::ZERO),
			Err(ContractError::Encoding(_))
		));
		assert!(matches!(
			binding.prepare("withdrawRoyalties", &[], sender, U256::from(1u64)),
			Err(ContractError::Encoding(_))
		));
		// Wrong argument type.
		assert!(matches!(
			binding.prepare("purchaseBook", &[DynSolValue::Bool(true)], sender, U256::ZERO),
			Err(ContractError::Encoding(_))
		));
	}

	#[tokio::test]
	async fn test_from_file() {
		let dir = tempfile::TempDir::new().unwrap();
		let path = dir.path().join("BookMarket.json");
		std::fs::write(&path, artifact_json()).unwrap();

		let chain = Arc::new(simulated_chain());
		let binding = ContractBinding::from_file(&path, NETWORK_ID, chain.clone())
			.await
			.unwrap();
		assert_eq!(binding.address(), contract_address());

		let missing =
			ContractBinding::from_file(dir.path().join("absent.json"), NETWORK_ID, chain).await;
		assert!(matches!(missing, Err(ContractError::InterfaceMissing(_))));
	}
}
