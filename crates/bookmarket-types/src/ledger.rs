//! Off-chain transaction records mirrored from on-chain outcomes.

use alloy_primitives::{Address, TxHash, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a ledger record (UUID v4 text).
pub type TransactionRecordId = String;

/// What the money movement was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
	Purchase,
	Royalty,
	Withdrawal,
}

impl fmt::Display for TransactionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransactionKind::Purchase => write!(f, "purchase"),
			TransactionKind::Royalty => write!(f, "royalty"),
			TransactionKind::Withdrawal => write!(f, "withdrawal"),
		}
	}
}

/// Lifecycle of a record. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
	Pending,
	Completed,
	Failed,
}

impl TransactionStatus {
	pub fn is_terminal(&self) -> bool {
		!matches!(self, TransactionStatus::Pending)
	}
}

impl fmt::Display for TransactionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransactionStatus::Pending => write!(f, "pending"),
			TransactionStatus::Completed => write!(f, "completed"),
			TransactionStatus::Failed => write!(f, "failed"),
		}
	}
}

/// Who pays and who is paid.
///
/// `payee` is absent when the receiving side is the contract itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparties {
	pub payer: Address,
	#[serde(default)]
	pub payee: Option<Address>,
}

/// A persisted ledger entry.
///
/// Written as `Pending` before broadcast, given its hash right after, and
/// moved to a terminal status exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
	pub id: TransactionRecordId,
	pub hash: Option<TxHash>,
	/// Book id the transaction concerns, when there is one.
	pub related_item_id: Option<u64>,
	pub counterparties: Counterparties,
	/// Value moved, in wei.
	pub amount: U256,
	pub kind: TransactionKind,
	pub status: TransactionStatus,
	pub gas_used: Option<u64>,
	/// Wei paid for execution.
	pub fee_used: Option<U256>,
	pub block_number: Option<u64>,
	pub failure_reason: Option<String>,
	pub created_at: u64,
	pub submitted_at: Option<u64>,
	pub completed_at: Option<u64>,
}

impl TransactionRecord {
	/// Pending record with a fresh id.
	pub fn pending(
		kind: TransactionKind,
		counterparties: Counterparties,
		amount: U256,
		related_item_id: Option<u64>,
		now: u64,
	) -> Self {
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			hash: None,
			related_item_id,
			counterparties,
			amount,
			kind,
			status: TransactionStatus::Pending,
			gas_used: None,
			fee_used: None,
			block_number: None,
			failure_reason: None,
			created_at: now,
			submitted_at: None,
			completed_at: None,
		}
	}

	/// True when `address` is on either side of the record.
	pub fn involves(&self, address: &Address) -> bool {
		self.counterparties.payer == *address || self.counterparties.payee.as_ref() == Some(address)
	}

	/// Seconds elapsed since broadcast, or since creation if never broadcast.
	pub fn age(&self, now: u64) -> u64 {
		now.saturating_sub(self.submitted_at.unwrap_or(self.created_at))
	}
}
