//! Encoded contract invocations waiting to be signed.

use alloy_primitives::{Address, Bytes, FixedBytes, U256};
use serde::{Deserialize, Serialize};

/// A state-changing contract call, fully encoded.
///
/// Produced by the contract binding and consumed by one submission. Fields are
/// private so a built call cannot be altered between preparation and signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCall {
	function: String,
	to: Address,
	sender: Address,
	value: U256,
	calldata: Bytes,
}

impl PreparedCall {
	pub fn new(
		function: impl Into<String>,
		to: Address,
		sender: Address,
		value: U256,
		calldata: Bytes,
	) -> Self {
		Self {
			function: function.into(),
			to,
			sender,
			value,
			calldata,
		}
	}

	/// Function name, for logging.
	pub fn function(&self) -> &str {
		&self.function
	}

	pub fn to(&self) -> Address {
		self.to
	}

	pub fn sender(&self) -> Address {
		self.sender
	}

	pub fn value(&self) -> U256 {
		self.value
	}

	pub fn calldata(&self) -> &Bytes {
		&self.calldata
	}

	/// First four bytes of the calldata, if present.
	pub fn selector(&self) -> Option<FixedBytes<4>> {
		self.calldata
			.get(..4)
			.map(FixedBytes::<4>::from_slice)
	}
}
