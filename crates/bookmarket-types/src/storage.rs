//! Namespaces used by the persistence layer.

use std::str::FromStr;

/// Collections kept in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Ledger records keyed by record id.
	Transactions,
	/// Transaction hash to ledger record id.
	TransactionByHash,
	/// Spent purchase authorizations, keyed by message digest, valued by expiry.
	Authorizations,
}

impl StorageKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Transactions => "transactions",
			StorageKey::TransactionByHash => "transaction_by_hash",
			StorageKey::Authorizations => "authorizations",
		}
	}

	pub fn all() -> impl Iterator<Item = Self> {
		[Self::Transactions, Self::TransactionByHash, Self::Authorizations].into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"transactions" => Ok(Self::Transactions),
			"transaction_by_hash" => Ok(Self::TransactionByHash),
			"authorizations" => Ok(Self::Authorizations),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
