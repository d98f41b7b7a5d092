//! Typed views over the marketplace contract.

use crate::{ContractBinding, ContractError};
use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, U256};
use bookmarket_types::PreparedCall;
use serde::Serialize;
use tracing::warn;

/// Upper bound on listings fetched per author in one read.
const MAX_AUTHOR_BOOKS: u64 = 1_000;

/// A book listing as stored on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookListing {
	pub book_id: U256,
	/// Content-store id of the book file.
	pub content_id: String,
	pub author: Address,
	/// Price in wei.
	pub price: U256,
	/// Author share in percent.
	pub royalty: U256,
	pub available: bool,
}

fn uint(values: &[DynSolValue], index: usize, function: &str) -> Result<U256, ContractError> {
	values
		.get(index)
		.and_then(|v| v.as_uint())
		.map(|(n, _)| n)
		.ok_or_else(|| ContractError::Decoding(format!("{}: expected uint at {}", function, index)))
}

fn address(values: &[DynSolValue], index: usize, function: &str) -> Result<Address, ContractError> {
	values
		.get(index)
		.and_then(|v| v.as_address())
		.ok_or_else(|| ContractError::Decoding(format!("{}: expected address at {}", function, index)))
}

fn string(values: &[DynSolValue], index: usize, function: &str) -> Result<String, ContractError> {
	values
		.get(index)
		.and_then(|v| v.as_str())
		.map(str::to_string)
		.ok_or_else(|| ContractError::Decoding(format!("{}: expected string at {}", function, index)))
}

fn boolean(values: &[DynSolValue], index: usize, function: &str) -> Result<bool, ContractError> {
	values
		.get(index)
		.and_then(|v| v.as_bool())
		.ok_or_else(|| ContractError::Decoding(format!("{}: expected bool at {}", function, index)))
}

/// The BookMarket contract: listings, purchases and author royalties.
#[derive(Debug)]
pub struct BookMarket {
	binding: ContractBinding,
}

impl BookMarket {
	pub fn new(binding: ContractBinding) -> Self {
		Self { binding }
	}

	pub fn binding(&self) -> &ContractBinding {
		&self.binding
	}

	pub fn address(&self) -> Address {
		self.binding.address()
	}

	/// `books(id)`. Unlisted ids read back as an all-zero struct and map to `None`.
	pub async fn book(&self, book_id: U256) -> Result<Option<BookListing>, ContractError> {
		let values = self
			.binding
			.call("books", &[DynSolValue::Uint(book_id, 256)])
			.await?;

		let author = address(&values, 1, "books")?;
		if author == Address::ZERO {
			return Ok(None);
		}

		Ok(Some(BookListing {
			book_id,
			content_id: string(&values, 0, "books")?,
			author,
			price: uint(&values, 2, "books")?,
			royalty: uint(&values, 3, "books")?,
			available: boolean(&values, 4, "books")?,
		}))
	}

	pub async fn author_book_count(&self, author: Address) -> Result<U256, ContractError> {
		let values = self
			.binding
			.call("getAuthorBookCount", &[DynSolValue::Address(author)])
			.await?;
		uint(&values, 0, "getAuthorBookCount")
	}

	/// Every listing by `author`, in listing order.
	pub async fn author_books(&self, author: Address) -> Result<Vec<BookListing>, ContractError> {
		let count = self.author_book_count(author).await?;
		let count = u64::try_from(count).unwrap_or(u64::MAX);
		if count > MAX_AUTHOR_BOOKS {
			warn!(author = %author, count, "Author book count truncated");
		}

		let mut books = Vec::new();
		for index in 0..count.min(MAX_AUTHOR_BOOKS) {
			let values = self
				.binding
				.call(
					"authorBooks",
					&[
						DynSolValue::Address(author),
						DynSolValue::Uint(U256::from(index), 256),
					],
				)
				.await?;
			let book_id = uint(&values, 0, "authorBooks")?;
			if let Some(book) = self.book(book_id).await? {
				books.push(book);
			}
		}
		Ok(books)
	}

	/// Royalties accrued to `author` and not yet withdrawn, in wei.
	pub async fn royalties(&self, author: Address) -> Result<U256, ContractError> {
		let values = self
			.binding
			.call("getRoyalties", &[DynSolValue::Address(author)])
			.await?;
		uint(&values, 0, "getRoyalties")
	}

	pub fn prepare_list_book(
		&self,
		content_id: &str,
		price: U256,
		royalty: U256,
		author: Address,
	) -> Result<PreparedCall, ContractError> {
		self.binding.prepare(
			"listBook",
			&[
				DynSolValue::String(content_id.to_string()),
				DynSolValue::Uint(price, 256),
				DynSolValue::Uint(royalty, 256),
			],
			author,
			U256::ZERO,
		)
	}

	pub fn prepare_purchase(
		&self,
		book_id: U256,
		buyer: Address,
		value: U256,
	) -> Result<PreparedCall, ContractError> {
		self.binding.prepare(
			"purchaseBook",
			&[DynSolValue::Uint(book_id, 256)],
			buyer,
			value,
		)
	}

	pub fn prepare_withdraw_royalties(&self, author: Address) -> Result<PreparedCall, ContractError> {
		self.binding
			.prepare("withdrawRoyalties", &[], author, U256::ZERO)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{self, artifact_json, simulated_chain, NETWORK_ID};
	use std::sync::Arc;

	async fn market() -> (Arc<bookmarket_delivery::implementations::simulated::SimulatedChain>, BookMarket) {
		let chain = Arc::new(simulated_chain());
		let binding = ContractBinding::load(&artifact_json(), NETWORK_ID, chain.clone())
			.await
			.unwrap();
		(chain, BookMarket::new(binding))
	}

	fn listing(id: u64, author: Address) -> BookListing {
		BookListing {
			book_id: U256::from(id),
			content_id: format!("Qm{}", id),
			author,
			price: U256::from(100u64),
			royalty: U256::from(10u64),
			available: true,
		}
	}

	#[tokio::test]
	async fn test_book_roundtrip_through_chain() {
		let (chain, market) = market().await;
		let author = Address::repeat_byte(0xaa);
		testing::script_book(&chain, &listing(5, author));

		let book = market.book(U256::from(5u64)).await.unwrap().unwrap();
		assert_eq!(book, listing(5, author));
	}

	#[tokio::test]
	async fn test_unlisted_book_is_none() {
		let (chain, market) = market().await;
		testing::script_book(&chain, &listing(7, Address::ZERO));
		assert!(market.book(U256::from(7u64)).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_author_books_and_royalties() {
		let (chain, market) = market().await;
		let author = Address::repeat_byte(0xaa);
		testing::script_author_books(&chain, author, &[listing(1, author), listing(3, author)]);
		testing::script_royalties(&chain, author, U256::from(42u64));

		let books = market.author_books(author).await.unwrap();
		assert_eq!(books.iter().map(|b| b.book_id).collect::<Vec<_>>(), vec![
			U256::from(1u64),
			U256::from(3u64)
		]);
		assert_eq!(market.royalties(author).await.unwrap(), U256::from(42u64));
	}

	#[tokio::test]
	async fn test_prepared_calls_carry_value_only_when_payable() {
		let (_, market) = market().await;
		let who = Address::repeat_byte(0x01);

		let purchase = market
			.prepare_purchase(U256::from(1u64), who, U256::from(100u64))
			.unwrap();
		assert_eq!(purchase.value(), U256::from(100u64));
		assert_eq!(purchase.function(), "purchaseBook");

		let listing = market
			.prepare_list_book("QmHash", U256::from(100u64), U256::from(10u64), who)
			.unwrap();
		assert!(listing.value().is_zero());
		assert_eq!(listing.sender(), who);

		assert!(market.prepare_withdraw_royalties(who).is_ok());
	}
}
