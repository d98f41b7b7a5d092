//! Capabilities and the messages users sign to authorize actions.
//!
//! Messages are always built server-side from the request parameters, so a
//! signature only authorizes exactly the action and amounts it was made for.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
	CanListAsAuthor,
	CanSell,
	CanWithdrawRoyalties,
}

impl fmt::Display for Capability {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Capability::CanListAsAuthor => write!(f, "can_list_as_author"),
			Capability::CanSell => write!(f, "can_sell"),
			Capability::CanWithdrawRoyalties => write!(f, "can_withdraw_royalties"),
		}
	}
}

/// Who is asking, as resolved by the caller's route layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub address: Address,
	pub capabilities: HashSet<Capability>,
}

impl Identity {
	/// A buyer: no capabilities beyond purchasing.
	pub fn reader(address: Address) -> Self {
		Self {
			address,
			capabilities: HashSet::new(),
		}
	}

	/// An author: may list, sell and withdraw royalties.
	pub fn author(address: Address) -> Self {
		Self {
			address,
			capabilities: [
				Capability::CanListAsAuthor,
				Capability::CanSell,
				Capability::CanWithdrawRoyalties,
			]
			.into_iter()
			.collect(),
		}
	}

	/// First capability `action` needs that this identity lacks.
	pub fn missing_for(&self, action: Action) -> Option<Capability> {
		action
			.required_capabilities()
			.iter()
			.copied()
			.find(|capability| !self.capabilities.contains(capability))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
	Purchase,
	ListBook,
	WithdrawRoyalties,
}

impl Action {
	pub fn required_capabilities(&self) -> &'static [Capability] {
		match self {
			Action::Purchase => &[],
			Action::ListBook => &[Capability::CanListAsAuthor, Capability::CanSell],
			Action::WithdrawRoyalties => &[Capability::CanWithdrawRoyalties],
		}
	}
}

/// The exact text a user signs for an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMessage(String);

impl ActionMessage {
	/// Purchases carry an expiry (unix seconds) and are accepted once.
	pub fn purchase(book_id: U256, amount: U256, expires_at: u64) -> Self {
		Self(format!(
			"Purchase item {} for {} until {}",
			book_id, amount, expires_at
		))
	}

	pub fn list_book(content_id: &str, price: U256, royalty: U256) -> Self {
		Self(format!(
			"List item {} for {} with royalty {}",
			content_id, price, royalty
		))
	}

	pub fn withdraw_royalties(amount: U256, recipient: Address) -> Self {
		Self(format!(
			"Withdraw royalties {} to {}",
			amount,
			lower_hex(recipient)
		))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ActionMessage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Wallets display and sign lowercase addresses.
fn lower_hex(address: Address) -> String {
	format!("{:#x}", address)
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy_primitives::address;

	#[test]
	fn test_message_formats() {
		let who = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
		assert_eq!(
			ActionMessage::purchase(U256::from(5u64), U256::from(100u64), 1_700_000_600).as_str(),
			"Purchase item 5 for 100 until 1700000600"
		);
		assert_eq!(
			ActionMessage::list_book("QmHash", U256::from(100u64), U256::from(10u64)).as_str(),
			"List item QmHash for 100 with royalty 10"
		);
		assert_eq!(
			ActionMessage::withdraw_royalties(U256::from(250u64), who).to_string(),
			"Withdraw royalties 250 to 0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
		);
	}

	#[test]
	fn test_capabilities_per_action() {
		let reader = Identity::reader(Address::repeat_byte(1));
		let author = Identity::author(Address::repeat_byte(2));

		assert_eq!(reader.missing_for(Action::Purchase), None);
		assert_eq!(reader.missing_for(Action::ListBook), Some(Capability::CanListAsAuthor));
		assert_eq!(
			reader.missing_for(Action::WithdrawRoyalties),
			Some(Capability::CanWithdrawRoyalties)
		);
		assert_eq!(author.missing_for(Action::ListBook), None);
		assert_eq!(author.missing_for(Action::WithdrawRoyalties), None);

		let mut seller_only = Identity::reader(Address::repeat_byte(3));
		seller_only.capabilities.insert(Capability::CanSell);
		assert_eq!(
			seller_only.missing_for(Action::ListBook),
			Some(Capability::CanListAsAuthor)
		);
	}
}
