//! Normalized result of every on-chain action.

use alloy_primitives::{TxHash, U256};
use serde::{Deserialize, Serialize};

/// How a submitted (or attempted) transaction ended.
///
/// Rejections are values, not errors: a revert, a failed gas estimate or a
/// refused broadcast all come back as `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxOutcome {
	Confirmed {
		hash: TxHash,
		block_number: u64,
		gas_used: u64,
		/// `gas_used * effective_gas_price`, in wei.
		fee_used: U256,
	},
	Failed {
		reason: String,
		/// Set when the transaction was broadcast and then reverted.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		hash: Option<TxHash>,
	},
	/// No receipt before the deadline; the transaction may still land.
	TimedOut { hash: TxHash },
}

impl TxOutcome {
	pub fn failed(reason: impl Into<String>) -> Self {
		TxOutcome::Failed {
			reason: reason.into(),
			hash: None,
		}
	}

	pub fn hash(&self) -> Option<TxHash> {
		match self {
			TxOutcome::Confirmed { hash, .. } | TxOutcome::TimedOut { hash } => Some(*hash),
			TxOutcome::Failed { hash, .. } => *hash,
		}
	}

	pub fn is_confirmed(&self) -> bool {
		matches!(self, TxOutcome::Confirmed { .. })
	}
}
