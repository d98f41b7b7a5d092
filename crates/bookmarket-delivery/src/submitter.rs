//! Nonce assignment, signing, broadcast and confirmation tracking.

use crate::{ChainInterface, ChainReceipt, DeliveryError, FeeEstimator};
use alloy_consensus::TxLegacy;
use alloy_primitives::{Address, Bytes, TxHash, TxKind};
use bookmarket_account::AccountService;
use bookmarket_types::{truncate_id, KeyedGuard, KeyedLocks, PreparedCall, TxOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A transaction handed to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
	pub hash: TxHash,
	pub nonce: u64,
	pub gas_limit: u64,
	pub fee_per_gas: u128,
	/// False when the send call failed in transit. The transaction was signed
	/// and may still have reached the pool, so it is tracked by hash.
	pub acknowledged: bool,
}

/// A signed transaction not yet handed to the node.
///
/// Holds its sender's critical section until sent or dropped.
pub struct SignedSubmission {
	pub hash: TxHash,
	pub nonce: u64,
	pub gas_limit: u64,
	pub fee_per_gas: u128,
	raw: Bytes,
	_sender_guard: KeyedGuard<Address>,
}

impl std::fmt::Debug for SignedSubmission {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SignedSubmission")
			.field("hash", &self.hash)
			.field("nonce", &self.nonce)
			.finish()
	}
}

/// Submits prepared calls and reports how they ended.
///
/// Nonce fetch, signing and broadcast for one sender happen inside that
/// sender's critical section, so concurrent submissions from one account get
/// distinct, gap-free nonces. Different senders never wait on each other.
pub struct DeliveryService {
	chain: Arc<dyn ChainInterface>,
	fees: Arc<FeeEstimator>,
	chain_id: u64,
	gas_limit_ceiling: u64,
	poll_interval: Duration,
	sender_locks: KeyedLocks<Address>,
}

impl DeliveryService {
	pub fn new(
		chain: Arc<dyn ChainInterface>,
		fees: Arc<FeeEstimator>,
		chain_id: u64,
		gas_limit_ceiling: u64,
		poll_interval: Duration,
	) -> Self {
		Self {
			chain,
			fees,
			chain_id,
			gas_limit_ceiling,
			poll_interval,
			sender_locks: KeyedLocks::new(),
		}
	}

	pub fn chain(&self) -> &Arc<dyn ChainInterface> {
		&self.chain
	}

	pub fn fees(&self) -> &Arc<FeeEstimator> {
		&self.fees
	}

	/// Gas estimate plus a 20% margin, capped at the ceiling.
	///
	/// An estimate already above the ceiling is refused outright.
	fn gas_limit_for(&self, estimate: u64) -> Result<u64, DeliveryError> {
		if estimate > self.gas_limit_ceiling {
			return Err(DeliveryError::Rejected(format!(
				"gas estimate {} exceeds ceiling {}",
				estimate, self.gas_limit_ceiling
			)));
		}
		let padded = estimate.saturating_add(estimate / 5);
		Ok(padded.min(self.gas_limit_ceiling))
	}

	/// Signs `call` with `account` without sending it.
	///
	/// The returned submission keeps the sender's critical section held, so
	/// its nonce stays reserved until it is sent or dropped. Callers persist
	/// [`SignedSubmission::hash`] before calling [`DeliveryService::send`];
	/// a dropped submission was never seen by the node.
	#[instrument(skip_all, fields(function = %call.function(), sender = %call.sender()))]
	pub async fn sign(
		&self,
		call: PreparedCall,
		account: &AccountService,
	) -> Result<SignedSubmission, DeliveryError> {
		let signer = account
			.address()
			.await
			.map_err(|e| DeliveryError::Signing(e.to_string()))?;
		if signer != call.sender() {
			return Err(DeliveryError::Signing(format!(
				"account {} cannot sign for sender {}",
				signer,
				call.sender()
			)));
		}

		let estimate = self.chain.estimate_gas(&call).await?;
		let gas_limit = self.gas_limit_for(estimate)?;
		let fee = self.fees.current().await;

		let sender_guard = self.sender_locks.acquire(&call.sender()).await;

		let nonce = self.chain.get_transaction_count(call.sender()).await?;
		let tx = TxLegacy {
			chain_id: Some(self.chain_id),
			nonce,
			gas_price: fee.value,
			gas_limit,
			to: TxKind::Call(call.to()),
			value: call.value(),
			input: call.calldata().clone(),
		};

		let signed = account
			.sign_transaction(tx)
			.await
			.map_err(|e| DeliveryError::Signing(e.to_string()))?;

		debug!(
			tx_hash = %truncate_id(&signed.hash.to_string()),
			nonce,
			gas_limit,
			"Transaction signed"
		);

		Ok(SignedSubmission {
			hash: signed.hash,
			nonce,
			gas_limit,
			fee_per_gas: fee.value,
			raw: signed.raw,
			_sender_guard: sender_guard,
		})
	}

	/// Hands a signed transaction to the node.
	///
	/// Errors mean the node refused it. A send that fails in transit is not an
	/// error; see [`Broadcast::acknowledged`].
	pub async fn send(&self, submission: SignedSubmission) -> Result<Broadcast, DeliveryError> {
		let hash = submission.hash;
		let acknowledged = match self.chain.send_raw_transaction(&submission.raw).await {
			Ok(node_hash) => {
				if node_hash != hash {
					warn!(node_hash = %node_hash, local_hash = %hash, "Node reported a different transaction hash");
				}
				true
			},
			Err(e) if e.is_transient() => {
				warn!(
					tx_hash = %truncate_id(&hash.to_string()),
					error = %e,
					"Broadcast not acknowledged; tracking by hash"
				);
				false
			},
			Err(e) => return Err(e),
		};

		info!(
			tx_hash = %truncate_id(&hash.to_string()),
			nonce = submission.nonce,
			gas_limit = submission.gas_limit,
			fee_per_gas = submission.fee_per_gas,
			"Transaction broadcast"
		);

		Ok(Broadcast {
			hash,
			nonce: submission.nonce,
			gas_limit: submission.gas_limit,
			fee_per_gas: submission.fee_per_gas,
			acknowledged,
		})
	}

	/// Signs and sends `call` in one step.
	///
	/// Errors mean nothing was accepted by the node: a failed estimate, a
	/// refused broadcast or a signing failure.
	pub async fn broadcast(
		&self,
		call: PreparedCall,
		account: &AccountService,
	) -> Result<Broadcast, DeliveryError> {
		let submission = self.sign(call, account).await?;
		self.send(submission).await
	}

	/// Single receipt lookup, for callers that poll on their own schedule.
	pub async fn receipt(&self, hash: TxHash) -> Result<Option<ChainReceipt>, DeliveryError> {
		self.chain.get_transaction_receipt(hash).await
	}

	/// Polls for a receipt until `timeout` elapses.
	///
	/// Lookup errors count as "not mined yet". The deadline bounds the whole
	/// wait, including a receipt request that hangs.
	pub async fn await_outcome(&self, hash: TxHash, timeout: Duration) -> TxOutcome {
		let deadline = Instant::now() + timeout;

		loop {
			match tokio::time::timeout_at(deadline, self.chain.get_transaction_receipt(hash)).await {
				Ok(Ok(Some(receipt))) => return outcome_from_receipt(receipt),
				Ok(Ok(None)) => {},
				Ok(Err(e)) => {
					debug!(tx_hash = %truncate_id(&hash.to_string()), error = %e, "Receipt lookup failed");
				},
				Err(_) => break,
			}

			let now = Instant::now();
			if now >= deadline {
				break;
			}
			tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
		}

		warn!(
			tx_hash = %truncate_id(&hash.to_string()),
			timeout_ms = timeout.as_millis() as u64,
			"No receipt before deadline"
		);
		TxOutcome::TimedOut { hash }
	}

	/// Broadcasts `call` and waits up to `timeout` for its receipt.
	pub async fn submit(
		&self,
		call: PreparedCall,
		account: &AccountService,
		timeout: Duration,
	) -> TxOutcome {
		match self.broadcast(call, account).await {
			Ok(broadcast) => self.await_outcome(broadcast.hash, timeout).await,
			Err(e) => {
				warn!(error = %e, "Submission failed before broadcast");
				TxOutcome::failed(e.to_string())
			},
		}
	}
}

/// Maps a mined receipt to its outcome.
pub fn outcome_from_receipt(receipt: ChainReceipt) -> TxOutcome {
	if receipt.success {
		info!(
			tx_hash = %truncate_id(&receipt.hash.to_string()),
			block = receipt.block_number,
			gas_used = receipt.gas_used,
			"Transaction confirmed"
		);
		TxOutcome::Confirmed {
			hash: receipt.hash,
			block_number: receipt.block_number,
			gas_used: receipt.gas_used,
			fee_used: receipt.fee_used(),
		}
	} else {
		warn!(
			tx_hash = %truncate_id(&receipt.hash.to_string()),
			block = receipt.block_number,
			"Transaction reverted"
		);
		TxOutcome::Failed {
			reason: format!("transaction reverted in block {}", receipt.block_number),
			hash: Some(receipt.hash),
		}
	}
}
