//! Marketplace actions: purchases, listings and royalty withdrawals.
//!
//! Every fee-bearing action runs the same sequence. The user's signature over
//! a server-built message is checked first, then that the signing account is
//! the user's own, then the on-chain state the request depends on.
//! Value-moving actions write a `Pending` ledger record, sign, attach the
//! hash, and only then send, so the record can always be matched against the
//! chain. On-chain failure is reported as an outcome; only problems with the
//! request itself are errors.

use crate::auth::{Action, ActionMessage, Capability, Identity};
use crate::content::{ContentError, ContentService};
use crate::guard::{GuardError, NetworkGuard, VerifiedNetwork};
use crate::ledger::{LedgerError, LedgerReconciler};
use crate::recovery::ReconciliationService;
use alloy_primitives::{keccak256, Address, TxHash, U256};
use bookmarket_account::{AccountError, AccountService, SignatureVerifier};
use bookmarket_contract::{BookListing, BookMarket, ContractError};
use bookmarket_delivery::{DeliveryError, DeliveryService};
use bookmarket_types::{
	current_timestamp, truncate_id, Counterparties, NetworkProfile, PreparedCall, TransactionKind, TransactionRecord,
	TransactionRecordId, TxOutcome,
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Royalties are a percentage of the sale price.
const MAX_ROYALTY_PERCENT: u64 = 100;

/// Furthest a purchase authorization may expire from now, in seconds.
pub const MAX_AUTHORIZATION_WINDOW_SECS: u64 = 600;

/// Errors returned by marketplace actions and reads.
#[derive(Debug, Error)]
pub enum ActionError {
	/// Error that occurs when the signature does not match the message and address.
	#[error("Invalid signature")]
	Unauthorized,
	/// Error that occurs when the identity lacks a capability the action needs.
	#[error("Missing capability: {0}")]
	Forbidden(Capability),
	/// Error that occurs when the request conflicts with chain or ledger state.
	#[error("Invalid request: {0}")]
	InvalidRequest(String),
	/// Error that occurs when a book or transaction does not exist.
	#[error("Not found: {0}")]
	NotFound(String),
	/// Error that occurs when encoding a call or decoding a contract read fails.
	#[error("Contract error: {0}")]
	Contract(#[from] ContractError),
	/// Error that occurs when the chain endpoint cannot be queried.
	#[error("Chain error: {0}")]
	Chain(#[from] DeliveryError),
	/// Error that occurs when the signing account is unavailable.
	#[error("Account error: {0}")]
	Account(#[from] AccountError),
	/// Error that occurs when the ledger cannot be read or written.
	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),
	/// Error that occurs when uploaded content is rejected or cannot be stored.
	#[error("Content error: {0}")]
	Content(#[from] ContentError),
	/// Error that occurs when the endpoint is not the expected network.
	#[error("Network check failed: {0}")]
	Network(#[from] GuardError),
}

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
	pub book_id: U256,
	/// Wei offered; must equal the listing price.
	pub amount: U256,
	/// Unix seconds after which the signature is no longer accepted.
	pub expires_at: u64,
	pub signature: String,
}

#[derive(Debug, Clone)]
pub struct ListingRequest {
	pub content_id: String,
	pub price: U256,
	pub royalty: U256,
	pub signature: String,
}

#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
	pub amount: U256,
	pub signature: String,
}

/// What an action did on chain and in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReceipt {
	/// Absent for actions that move no value.
	pub record_id: Option<TransactionRecordId>,
	pub outcome: TxOutcome,
	/// False when the ledger could not be updated after broadcast; the
	/// reconciliation pass picks the record up later.
	pub ledger_synced: bool,
}

/// Ledger record and live chain state for one hash.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
	pub hash: TxHash,
	pub record: Option<TransactionRecord>,
	/// `None` while the transaction is not mined.
	pub confirmed: Option<bool>,
	pub block_number: Option<u64>,
}

/// Ledger fields of a value-moving action.
struct Recorded {
	kind: TransactionKind,
	counterparties: Counterparties,
	amount: U256,
	related_item_id: Option<u64>,
}

pub struct MarketEngine {
	network: NetworkProfile,
	market: Arc<BookMarket>,
	delivery: Arc<DeliveryService>,
	ledger: Arc<LedgerReconciler>,
	content: Arc<ContentService>,
	reconciliation: Arc<ReconciliationService>,
	operator: Arc<AccountService>,
	verifier: SignatureVerifier,
	max_confirm_wait: Duration,
}

impl MarketEngine {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		network: NetworkProfile,
		market: Arc<BookMarket>,
		delivery: Arc<DeliveryService>,
		ledger: Arc<LedgerReconciler>,
		content: Arc<ContentService>,
		reconciliation: Arc<ReconciliationService>,
		operator: Arc<AccountService>,
		max_confirm_wait: Duration,
	) -> Self {
		Self {
			network,
			market,
			delivery,
			ledger,
			content,
			reconciliation,
			operator,
			verifier: SignatureVerifier::new(),
			max_confirm_wait,
		}
	}

	/// Profile the guard verified at startup.
	pub fn network(&self) -> &NetworkProfile {
		&self.network
	}

	pub fn market(&self) -> &Arc<BookMarket> {
		&self.market
	}

	pub fn ledger(&self) -> &Arc<LedgerReconciler> {
		&self.ledger
	}

	pub fn reconciliation(&self) -> &Arc<ReconciliationService> {
		&self.reconciliation
	}

	/// Account the service signs transactions with.
	pub fn operator(&self) -> &Arc<AccountService> {
		&self.operator
	}

	fn authorize(
		&self,
		identity: &Identity,
		action: Action,
		message: &ActionMessage,
		signature: &str,
	) -> Result<(), ActionError> {
		if !self
			.verifier
			.verify(message.as_str(), signature, &identity.address.to_string())
		{
			warn!(address = %identity.address, action = ?action, "Signature rejected");
			return Err(ActionError::Unauthorized);
		}
		if let Some(missing) = identity.missing_for(action) {
			warn!(address = %identity.address, action = ?action, capability = %missing, "Capability missing");
			return Err(ActionError::Forbidden(missing));
		}
		Ok(())
	}

	/// Buys a listed book at its current price.
	///
	/// The signed message names an expiry and is accepted only once, so a
	/// captured signature cannot buy the same book again.
	#[instrument(skip_all, fields(buyer = %identity.address, book_id = %request.book_id))]
	pub async fn purchase(
		&self,
		identity: &Identity,
		request: PurchaseRequest,
		signer: &AccountService,
	) -> Result<ActionReceipt, ActionError> {
		let message = ActionMessage::purchase(request.book_id, request.amount, request.expires_at);
		self.authorize(identity, Action::Purchase, &message, &request.signature)?;
		let sender = ensure_signer(identity, signer).await?;

		let now = current_timestamp();
		if request.expires_at <= now {
			return Err(ActionError::InvalidRequest("authorization has expired".into()));
		}
		if request.expires_at > now.saturating_add(MAX_AUTHORIZATION_WINDOW_SECS) {
			return Err(ActionError::InvalidRequest(format!(
				"authorization may not expire more than {}s ahead",
				MAX_AUTHORIZATION_WINDOW_SECS
			)));
		}

		let book = self
			.market
			.book(request.book_id)
			.await?
			.ok_or_else(|| ActionError::NotFound(format!("book {}", request.book_id)))?;
		if !book.available {
			return Err(ActionError::InvalidRequest(format!(
				"book {} is not available",
				request.book_id
			)));
		}
		if request.amount != book.price {
			return Err(ActionError::InvalidRequest(format!(
				"amount {} does not match price {}",
				request.amount, book.price
			)));
		}

		let call = self
			.market
			.prepare_purchase(request.book_id, sender, request.amount)?;

		let digest = authorization_digest(identity.address, &message);
		if !self
			.ledger
			.consume_authorization(&digest, request.expires_at)
			.await?
		{
			warn!(digest = %truncate_id(&digest), "Purchase authorization replayed");
			return Err(ActionError::InvalidRequest("authorization already used".into()));
		}

		self.execute_recorded(
			call,
			Recorded {
				kind: TransactionKind::Purchase,
				counterparties: Counterparties {
					payer: identity.address,
					payee: Some(book.author),
				},
				amount: request.amount,
				related_item_id: u64::try_from(request.book_id).ok(),
			},
			signer,
		)
		.await
	}

	/// Lists an uploaded book for sale. Listings move no value and are not
	/// recorded in the ledger.
	#[instrument(skip_all, fields(author = %identity.address, content_id = %request.content_id))]
	pub async fn list_book(
		&self,
		identity: &Identity,
		request: ListingRequest,
		signer: &AccountService,
	) -> Result<ActionReceipt, ActionError> {
		let message = ActionMessage::list_book(&request.content_id, request.price, request.royalty);
		self.authorize(identity, Action::ListBook, &message, &request.signature)?;
		let sender = ensure_signer(identity, signer).await?;

		if request.price.is_zero() {
			return Err(ActionError::InvalidRequest("price must be positive".into()));
		}
		if request.royalty > U256::from(MAX_ROYALTY_PERCENT) {
			return Err(ActionError::InvalidRequest(format!(
				"royalty {} exceeds {}%",
				request.royalty, MAX_ROYALTY_PERCENT
			)));
		}
		if !self.content.exists(&request.content_id).await? {
			return Err(ActionError::InvalidRequest(format!(
				"content {} has not been uploaded",
				request.content_id
			)));
		}

		let call =
			self.market
				.prepare_list_book(&request.content_id, request.price, request.royalty, sender)?;
		let outcome = self
			.delivery
			.submit(call, signer, self.max_confirm_wait)
			.await;
		info!(confirmed = outcome.is_confirmed(), "Listing submitted");
		Ok(ActionReceipt {
			record_id: None,
			outcome,
			ledger_synced: true,
		})
	}

	/// Withdraws the author's full accrued royalties to the sending account.
	#[instrument(skip_all, fields(author = %identity.address, amount = %request.amount))]
	pub async fn withdraw_royalties(
		&self,
		identity: &Identity,
		request: WithdrawalRequest,
		signer: &AccountService,
	) -> Result<ActionReceipt, ActionError> {
		let message = ActionMessage::withdraw_royalties(request.amount, identity.address);
		self.authorize(identity, Action::WithdrawRoyalties, &message, &request.signature)?;

		let sender = ensure_signer(identity, signer).await?;

		let accrued = self.market.royalties(identity.address).await?;
		if accrued.is_zero() {
			return Err(ActionError::InvalidRequest("no royalties to withdraw".into()));
		}
		if accrued != request.amount {
			return Err(ActionError::InvalidRequest(format!(
				"amount {} does not match accrued royalties {}",
				request.amount, accrued
			)));
		}

		let call = self.market.prepare_withdraw_royalties(sender)?;
		self.execute_recorded(
			call,
			Recorded {
				kind: TransactionKind::Withdrawal,
				counterparties: Counterparties {
					payer: self.market.address(),
					payee: Some(identity.address),
				},
				amount: accrued,
				related_item_id: None,
			},
			signer,
		)
		.await
	}

	/// Pending record, signed hash, send, outcome, resolution.
	///
	/// The hash is persisted before the transaction leaves the process. If
	/// that fails nothing is sent and the record is failed.
	async fn execute_recorded(
		&self,
		call: PreparedCall,
		recorded: Recorded,
		signer: &AccountService,
	) -> Result<ActionReceipt, ActionError> {
		// Nothing has been sent yet, so a failure here is a plain error.
		let record_id = self
			.ledger
			.record_pending(
				recorded.kind,
				recorded.counterparties,
				recorded.amount,
				recorded.related_item_id,
			)
			.await?;

		let signed = match self.delivery.sign(call, signer).await {
			Ok(signed) => signed,
			Err(e) => {
				warn!(record_id = %truncate_id(&record_id), error = %e, "Signing failed");
				return Ok(self.fail_unsent(record_id, e.to_string()).await);
			},
		};

		let hash = signed.hash;
		if let Err(e) = self.ledger.attach_hash(&record_id, hash).await {
			error!(
				record_id = %truncate_id(&record_id),
				tx_hash = %hash,
				error = %e,
				"Failed to record transaction hash; not sending"
			);
			// Releases the sender's nonce without using it.
			drop(signed);
			return Ok(self
				.fail_unsent(record_id, format!("not sent: {}", e))
				.await);
		}

		let outcome = match self.delivery.send(signed).await {
			Ok(broadcast) => {
				self.delivery
					.await_outcome(broadcast.hash, self.max_confirm_wait)
					.await
			},
			Err(e) => {
				warn!(record_id = %truncate_id(&record_id), tx_hash = %hash, error = %e, "Send failed");
				TxOutcome::Failed {
					hash: Some(hash),
					reason: e.to_string(),
				}
			},
		};
		let ledger_synced = self.settle(&record_id, &outcome).await;

		Ok(ActionReceipt {
			record_id: Some(record_id),
			outcome,
			ledger_synced,
		})
	}

	/// Fails a record whose transaction never left the process.
	async fn fail_unsent(&self, record_id: TransactionRecordId, reason: String) -> ActionReceipt {
		let outcome = TxOutcome::failed(reason);
		let ledger_synced = self.settle(&record_id, &outcome).await;
		ActionReceipt {
			record_id: Some(record_id),
			outcome,
			ledger_synced,
		}
	}

	/// Applies `outcome` to the record; a failure is logged and left for the
	/// reconciliation pass.
	async fn settle(&self, record_id: &str, outcome: &TxOutcome) -> bool {
		match self.ledger.resolve(record_id, outcome).await {
			Ok(_) => true,
			Err(e) => {
				error!(
					record_id = %truncate_id(record_id),
					tx_hash = ?outcome.hash(),
					error = %e,
					"Ledger out of sync with chain"
				);
				false
			},
		}
	}

	pub async fn book(&self, book_id: U256) -> Result<BookListing, ActionError> {
		self.market
			.book(book_id)
			.await?
			.ok_or_else(|| ActionError::NotFound(format!("book {}", book_id)))
	}

	pub async fn author_books(&self, author: Address) -> Result<Vec<BookListing>, ActionError> {
		Ok(self.market.author_books(author).await?)
	}

	pub async fn royalties(&self, author: Address) -> Result<U256, ActionError> {
		Ok(self.market.royalties(author).await?)
	}

	/// Looks a hash up in the ledger and on chain. Unknown to both is `NotFound`.
	pub async fn transaction_status(&self, hash: TxHash) -> Result<TransactionView, ActionError> {
		let record = self.ledger.find_by_hash(hash).await?;
		let receipt = self.delivery.receipt(hash).await?;
		if record.is_none() && receipt.is_none() {
			return Err(ActionError::NotFound(format!("transaction {}", hash)));
		}
		Ok(TransactionView {
			hash,
			record,
			confirmed: receipt.as_ref().map(|r| r.success),
			block_number: receipt.map(|r| r.block_number),
		})
	}

	pub async fn history(&self, address: Address) -> Result<Vec<TransactionRecord>, ActionError> {
		Ok(self.ledger.history(address).await?)
	}

	pub async fn upload_content(&self, file_name: &str, data: Bytes) -> Result<String, ActionError> {
		Ok(self.content.upload(file_name, data).await?)
	}

	pub fn verify_signature(&self, message: &str, signature: &str, address: &str) -> bool {
		self.verifier.verify(message, signature, address)
	}

	/// Re-runs the startup network check against the live endpoint.
	pub async fn verify_network(&self) -> Result<VerifiedNetwork, ActionError> {
		let operator = self.operator.address().await?;
		Ok(NetworkGuard::verify(&**self.delivery.chain(), &self.network, &[operator]).await?)
	}
}

/// Transactions are sent from the signer, so it must be the requester's own
/// account for the chain to agree with the ledger.
async fn ensure_signer(
	identity: &Identity,
	signer: &AccountService,
) -> Result<Address, ActionError> {
	let sender = signer.address().await?;
	if sender != identity.address {
		warn!(address = %identity.address, signer = %sender, "Signer is not the requesting account");
		return Err(ActionError::InvalidRequest(
			"transactions can only be signed by the requesting account".into(),
		));
	}
	Ok(sender)
}

/// Identifies a signed authorization by signer and message, not by signature
/// bytes, which have more than one valid encoding.
fn authorization_digest(address: Address, message: &ActionMessage) -> String {
	let mut preimage = address.to_vec();
	preimage.extend_from_slice(message.as_str().as_bytes());
	keccak256(preimage).to_string()
}
