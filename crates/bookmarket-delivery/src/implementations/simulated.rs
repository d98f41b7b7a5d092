//! In-process chain for local runs and tests.
//!
//! Accepts real signed transactions: envelopes are decoded, the sender is
//! recovered from the signature and nonces must arrive in order, exactly as a
//! node would insist. Contract reads are answered from scripted responses.
//! Transactions are mined lazily, the first time a receipt is requested after
//! the confirmation delay has passed.

use crate::{ChainInterface, ChainReceipt, DeliveryError};
use alloy_consensus::transaction::SignerRecoverable;
use alloy_consensus::{Transaction, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Address, Bytes, FixedBytes, TxHash, U256};
use async_trait::async_trait;
use bookmarket_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, NetworkProfile, PreparedCall, Schema,
	ValidationError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_GAS_ESTIMATE: u64 = 60_000;
const FUNDED_BALANCE_WEI: u128 = 100_000_000_000_000_000_000;

/// A transaction accepted by [`SimulatedChain::send_raw_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
	pub hash: TxHash,
	pub from: Address,
	pub nonce: u64,
	pub to: Option<Address>,
	pub value: U256,
	pub input: Bytes,
	pub gas_limit: u64,
	pub gas_price: u128,
}

#[derive(Debug)]
struct Pending {
	tx: SentTransaction,
	received_at: Instant,
	block: Option<u64>,
	success: bool,
}

#[derive(Debug, Default)]
struct State {
	fee: Option<u128>,
	accounts: Vec<Address>,
	balances: HashMap<Address, U256>,
	code: HashMap<Address, Bytes>,
	call_responses: HashMap<Bytes, Bytes>,
	selector_responses: HashMap<FixedBytes<4>, Bytes>,
	reverting: HashSet<FixedBytes<4>>,
	failing_estimates: HashSet<FixedBytes<4>>,
	nonces: HashMap<Address, u64>,
	transactions: HashMap<TxHash, Pending>,
	sent: Vec<SentTransaction>,
	next_block: u64,
}

pub struct SimulatedChain {
	chain_id: u64,
	network_id: u64,
	/// `None` means nothing is ever mined.
	confirmation_delay: Option<Duration>,
	gas_estimate: u64,
	reachable: AtomicBool,
	lose_next_ack: AtomicBool,
	fee_queries: AtomicUsize,
	state: Mutex<State>,
}

fn selector_of(data: &[u8]) -> Option<FixedBytes<4>> {
	data.get(..4).map(FixedBytes::<4>::from_slice)
}

impl SimulatedChain {
	pub fn new(chain_id: u64, network_id: u64) -> Self {
		Self {
			chain_id,
			network_id,
			confirmation_delay: Some(Duration::ZERO),
			gas_estimate: DEFAULT_GAS_ESTIMATE,
			reachable: AtomicBool::new(true),
			lose_next_ack: AtomicBool::new(false),
			fee_queries: AtomicUsize::new(0),
			state: Mutex::new(State {
				next_block: 1,
				..Default::default()
			}),
		}
	}

	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn state_mut(&mut self) -> &mut State {
		self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
	}

	fn ensure_reachable(&self) -> Result<(), DeliveryError> {
		if self.reachable.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(DeliveryError::Network("connection refused".to_string()))
		}
	}

	/// Adds an unlocked account holding `balance` wei.
	pub fn with_account(mut self, address: Address, balance: U256) -> Self {
		let state = self.state_mut();
		state.accounts.push(address);
		state.balances.insert(address, balance);
		self
	}

	pub fn with_fee(mut self, fee: Option<u128>) -> Self {
		self.state_mut().fee = fee;
		self
	}

	pub fn with_code(mut self, address: Address, code: Bytes) -> Self {
		self.state_mut().code.insert(address, code);
		self
	}

	pub fn with_confirmation_delay(mut self, delay: Duration) -> Self {
		self.confirmation_delay = Some(delay);
		self
	}

	/// Transactions are accepted but never mined.
	pub fn never_confirm(mut self) -> Self {
		self.confirmation_delay = None;
		self
	}

	pub fn with_gas_estimate(mut self, gas: u64) -> Self {
		self.gas_estimate = gas;
		self
	}

	/// Transactions calling `selector` are mined with a failed status.
	pub fn with_reverting_selector(mut self, selector: FixedBytes<4>) -> Self {
		self.state_mut().reverting.insert(selector);
		self
	}

	/// Gas estimation for `selector` fails as if the call would revert.
	pub fn with_failing_estimate(mut self, selector: FixedBytes<4>) -> Self {
		self.state_mut().failing_estimates.insert(selector);
		self
	}

	/// Answers `eth_call` with exactly this calldata.
	pub fn set_call_response(&self, calldata: Bytes, response: Bytes) {
		self.state().call_responses.insert(calldata, response);
	}

	/// Answers any `eth_call` starting with `selector` that has no exact match.
	pub fn set_selector_response(&self, selector: FixedBytes<4>, response: Bytes) {
		self.state().selector_responses.insert(selector, response);
	}

	pub fn set_fee(&self, fee: Option<u128>) {
		self.state().fee = fee;
	}

	pub fn set_reachable(&self, reachable: bool) {
		self.reachable.store(reachable, Ordering::SeqCst);
	}

	/// The next accepted transaction is reported to the caller as a network failure.
	pub fn lose_next_ack(&self) {
		self.lose_next_ack.store(true, Ordering::SeqCst);
	}

	pub fn fee_queries(&self) -> usize {
		self.fee_queries.load(Ordering::SeqCst)
	}

	/// Accepted transactions in arrival order.
	pub fn sent_transactions(&self) -> Vec<SentTransaction> {
		self.state().sent.clone()
	}
}

#[async_trait]
impl ChainInterface for SimulatedChain {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(SimulatedChainSchema)
	}

	async fn get_chain_id(&self) -> Result<u64, DeliveryError> {
		self.ensure_reachable()?;
		Ok(self.chain_id)
	}

	async fn get_network_id(&self) -> Result<u64, DeliveryError> {
		self.ensure_reachable()?;
		Ok(self.network_id)
	}

	async fn get_accounts(&self) -> Result<Vec<Address>, DeliveryError> {
		self.ensure_reachable()?;
		Ok(self.state().accounts.clone())
	}

	async fn get_balance(&self, address: Address) -> Result<U256, DeliveryError> {
		self.ensure_reachable()?;
		Ok(self.state().balances.get(&address).copied().unwrap_or_default())
	}

	async fn get_transaction_count(&self, address: Address) -> Result<u64, DeliveryError> {
		self.ensure_reachable()?;
		Ok(self.state().nonces.get(&address).copied().unwrap_or(0))
	}

	async fn get_fee_estimate(&self) -> Result<u128, DeliveryError> {
		self.fee_queries.fetch_add(1, Ordering::SeqCst);
		self.ensure_reachable()?;
		self.state()
			.fee
			.ok_or_else(|| DeliveryError::Network("eth_gasPrice unavailable".to_string()))
	}

	async fn get_code(&self, address: Address) -> Result<Bytes, DeliveryError> {
		self.ensure_reachable()?;
		Ok(self.state().code.get(&address).cloned().unwrap_or_default())
	}

	async fn estimate_gas(&self, call: &PreparedCall) -> Result<u64, DeliveryError> {
		self.ensure_reachable()?;
		let failing = call
			.selector()
			.is_some_and(|s| self.state().failing_estimates.contains(&s));
		if failing {
			return Err(DeliveryError::Rejected("execution reverted".to_string()));
		}
		Ok(self.gas_estimate)
	}

	async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, DeliveryError> {
		self.ensure_reachable()?;
		let state = self.state();
		if !state.code.contains_key(&to) {
			return Ok(Bytes::new());
		}
		if let Some(response) = state.call_responses.get(&data) {
			return Ok(response.clone());
		}
		selector_of(&data)
			.and_then(|s| state.selector_responses.get(&s).cloned())
			.ok_or_else(|| DeliveryError::Rejected("execution reverted".to_string()))
	}

	async fn send_raw_transaction(&self, raw: &Bytes) -> Result<TxHash, DeliveryError> {
		self.ensure_reachable()?;

		let envelope = TxEnvelope::decode_2718(&mut raw.as_ref())
			.map_err(|e| DeliveryError::Rejected(format!("invalid transaction encoding: {}", e)))?;
		let from = envelope
			.recover_signer()
			.map_err(|e| DeliveryError::Rejected(format!("invalid signature: {}", e)))?;

		if envelope.chain_id() != Some(self.chain_id) {
			return Err(DeliveryError::Rejected(format!(
				"invalid chain id {:?}, expected {}",
				envelope.chain_id(),
				self.chain_id
			)));
		}

		let hash = *envelope.tx_hash();
		let mut state = self.state();

		let expected_nonce = state.nonces.get(&from).copied().unwrap_or(0);
		if envelope.nonce() < expected_nonce {
			return Err(DeliveryError::Rejected(format!(
				"nonce too low: got {}, expected {}",
				envelope.nonce(),
				expected_nonce
			)));
		}
		if envelope.nonce() > expected_nonce {
			return Err(DeliveryError::Rejected(format!(
				"nonce too high: got {}, expected {}",
				envelope.nonce(),
				expected_nonce
			)));
		}

		let cost = envelope.value()
			+ U256::from(envelope.gas_limit()) * U256::from(envelope.max_fee_per_gas());
		if let Some(balance) = state.balances.get_mut(&from) {
			if *balance < cost {
				return Err(DeliveryError::Rejected(
					"insufficient funds for gas * price + value".to_string(),
				));
			}
			*balance -= cost;
		}

		let tx = SentTransaction {
			hash,
			from,
			nonce: envelope.nonce(),
			to: envelope.to(),
			value: envelope.value(),
			input: envelope.input().clone(),
			gas_limit: envelope.gas_limit(),
			gas_price: envelope.max_fee_per_gas(),
		};
		let success = selector_of(&tx.input).is_none_or(|s| !state.reverting.contains(&s));

		state.nonces.insert(from, expected_nonce + 1);
		state.sent.push(tx.clone());
		state.transactions.insert(
			hash,
			Pending {
				tx,
				received_at: Instant::now(),
				block: None,
				success,
			},
		);
		drop(state);

		if self.lose_next_ack.swap(false, Ordering::SeqCst) {
			return Err(DeliveryError::Network("request timed out".to_string()));
		}
		Ok(hash)
	}

	async fn get_transaction_receipt(
		&self,
		hash: TxHash,
	) -> Result<Option<ChainReceipt>, DeliveryError> {
		self.ensure_reachable()?;
		let Some(delay) = self.confirmation_delay else {
			return Ok(None);
		};

		let mut state = self.state();
		let next_block = state.next_block;
		let Some(pending) = state.transactions.get_mut(&hash) else {
			return Ok(None);
		};
		if pending.received_at.elapsed() < delay {
			return Ok(None);
		}

		let block_number = match pending.block {
			Some(block) => block,
			None => {
				pending.block = Some(next_block);
				next_block
			},
		};
		let receipt = ChainReceipt {
			hash,
			block_number,
			success: pending.success,
			gas_used: self.gas_estimate.min(pending.tx.gas_limit),
			effective_gas_price: pending.tx.gas_price,
		};
		if block_number == next_block {
			state.next_block += 1;
		}
		Ok(Some(receipt))
	}
}

/// `[delivery.implementations.simulated]`
pub struct SimulatedChainSchema;

impl ConfigSchema for SimulatedChainSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let positive = || FieldType::Integer {
			min: Some(1),
			max: None,
		};
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("chain_id", positive()),
				Field::new("network_id", positive()),
				Field::new("fee_per_gas", positive()),
				Field::new(
					"confirmation_delay_ms",
					FieldType::Integer {
						min: Some(0),
						max: None,
					},
				),
				Field::new("accounts", FieldType::Array(Box::new(FieldType::Address))),
				Field::new("contracts", FieldType::Array(Box::new(FieldType::Address))),
			],
		);
		schema.validate(config)
	}
}

fn addresses(config: &toml::Value, key: &str) -> Vec<Address> {
	config
		.get(key)
		.and_then(|v| v.as_array())
		.map(|items| {
			items
				.iter()
				.filter_map(|v| v.as_str())
				.filter_map(|s| s.parse().ok())
				.collect()
		})
		.unwrap_or_default()
}

/// Builds a [`SimulatedChain`] answering for the configured network.
///
/// Ids default to the profile's expected values; listed accounts are funded
/// with 100 ether and listed contracts get placeholder code.
pub fn create_chain(
	config: &toml::Value,
	network: &NetworkProfile,
) -> Result<Box<dyn ChainInterface>, DeliveryError> {
	SimulatedChainSchema
		.validate(config)
		.map_err(|e| DeliveryError::Configuration(format!("Invalid configuration: {}", e)))?;

	let int = |key: &str| config.get(key).and_then(|v| v.as_integer());

	let chain_id = int("chain_id").map_or(network.expected_chain_id, |v| v as u64);
	let network_id = int("network_id").map_or(network.expected_network_id, |v| v as u64);
	let fee = int("fee_per_gas").map_or(network.default_fee, |v| v as u128);
	let delay = Duration::from_millis(int("confirmation_delay_ms").unwrap_or(0) as u64);

	let mut chain = SimulatedChain::new(chain_id, network_id)
		.with_fee(Some(fee))
		.with_confirmation_delay(delay);
	for account in addresses(config, "accounts") {
		chain = chain.with_account(account, U256::from(FUNDED_BALANCE_WEI));
	}
	for contract in addresses(config, "contracts") {
		chain = chain.with_code(contract, Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]));
	}

	tracing::warn!(chain_id, network_id, "Using simulated chain; no real node is contacted");
	Ok(Box::new(chain))
}

pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "simulated";
	type Factory = crate::ChainFactory;

	fn factory() -> Self::Factory {
		create_chain
	}
}

impl crate::ChainRegistry for Registry {}
