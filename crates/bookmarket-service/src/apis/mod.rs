//! Request handlers behind `/api`.

pub mod actions;
pub mod error;
pub mod queries;

use alloy_primitives::{Address, TxHash};
use error::ApiError;

/// Wei amounts travel as decimal strings; `0x` hex is accepted too.
pub mod u256_decimal {
	use alloy_primitives::U256;
	use serde::{de::Error, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&value.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		let s = s.trim();
		match s.strip_prefix("0x") {
			Some(hex) => U256::from_str_radix(hex, 16),
			None => U256::from_str_radix(s, 10),
		}
		.map_err(D::Error::custom)
	}
}

pub(crate) fn parse_address(text: &str) -> Result<Address, ApiError> {
	text.trim()
		.parse()
		.map_err(|_| ApiError::bad_request(format!("'{}' is not an address", text)))
}

pub(crate) fn parse_hash(text: &str) -> Result<TxHash, ApiError> {
	text.trim()
		.parse()
		.map_err(|_| ApiError::bad_request(format!("'{}' is not a transaction hash", text)))
}
