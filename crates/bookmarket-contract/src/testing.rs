//! BookMarket fixture for tests: a deployment artifact and helpers that
//! script a [`SimulatedChain`] to answer the contract's view functions.

use crate::BookListing;
use alloy_dyn_abi::{DynSolValue, JsonAbiExt};
use alloy_json_abi::JsonAbi;
use alloy_primitives::{address, Address, Bytes, U256};
use bookmarket_delivery::implementations::simulated::SimulatedChain;

pub const CHAIN_ID: u64 = 1337;
pub const NETWORK_ID: u64 = 5777;

pub fn contract_address() -> Address {
	address!("0xCfEB869F69431e42cdB54A4F4f105C19C080A601")
}

const ABI: &str = r#"[
	{"type":"function","name":"listBook","stateMutability":"nonpayable",
	 "inputs":[{"name":"_ipfsHash","type":"string"},{"name":"_price","type":"uint256"},{"name":"_royalty","type":"uint256"}],
	 "outputs":[]},
	{"type":"function","name":"purchaseBook","stateMutability":"payable",
	 "inputs":[{"name":"_bookId","type":"uint256"}],"outputs":[]},
	{"type":"function","name":"withdrawRoyalties","stateMutability":"nonpayable",
	 "inputs":[],"outputs":[]},
	{"type":"function","name":"books","stateMutability":"view",
	 "inputs":[{"name":"","type":"uint256"}],
	 "outputs":[{"name":"ipfsHash","type":"string"},{"name":"author","type":"address"},
	            {"name":"price","type":"uint256"},{"name":"royalty","type":"uint256"},
	            {"name":"isAvailable","type":"bool"}]},
	{"type":"function","name":"getAuthorBookCount","stateMutability":"view",
	 "inputs":[{"name":"_author","type":"address"}],"outputs":[{"name":"","type":"uint256"}]},
	{"type":"function","name":"authorBooks","stateMutability":"view",
	 "inputs":[{"name":"","type":"address"},{"name":"","type":"uint256"}],
	 "outputs":[{"name":"","type":"uint256"}]},
	{"type":"function","name":"getRoyalties","stateMutability":"view",
	 "inputs":[{"name":"_author","type":"address"}],"outputs":[{"name":"","type":"uint256"}]}
]"#;

/// Artifact deployed on the fixture network and on network 1.
pub fn artifact_json() -> String {
	format!(
		r#"{{
			"contractName": "BookMarket",
			"abi": {},
			"networks": {{
				"{}": {{ "address": "{}" }},
				"1": {{ "address": "0x000000000000000000000000000000000000dEaD" }}
			}}
		}}"#,
		ABI,
		NETWORK_ID,
		contract_address()
	)
}

/// A chain with the fixture contract deployed.
pub fn simulated_chain() -> SimulatedChain {
	SimulatedChain::new(CHAIN_ID, NETWORK_ID)
		.with_code(contract_address(), Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]))
}

fn calldata(function: &str, args: &[DynSolValue]) -> Bytes {
	let abi: JsonAbi = serde_json::from_str(ABI).expect("fixture ABI parses");
	let function = &abi.function(function).expect("fixture function exists")[0];
	Bytes::from(function.abi_encode_input(args).expect("fixture args encode"))
}

fn returns(values: Vec<DynSolValue>) -> Bytes {
	Bytes::from(DynSolValue::Tuple(values).abi_encode_params())
}

pub fn script_book(chain: &SimulatedChain, book: &BookListing) {
	chain.set_call_response(
		calldata("books", &[DynSolValue::Uint(book.book_id, 256)]),
		returns(vec![
			DynSolValue::String(book.content_id.clone()),
			DynSolValue::Address(book.author),
			DynSolValue::Uint(book.price, 256),
			DynSolValue::Uint(book.royalty, 256),
			DynSolValue::Bool(book.available),
		]),
	);
}

/// Scripts the author's book count, the index lookups and each listing.
pub fn script_author_books(chain: &SimulatedChain, author: Address, books: &[BookListing]) {
	chain.set_call_response(
		calldata("getAuthorBookCount", &[DynSolValue::Address(author)]),
		returns(vec![DynSolValue::Uint(U256::from(books.len()), 256)]),
	);
	for (index, book) in books.iter().enumerate() {
		chain.set_call_response(
			calldata(
				"authorBooks",
				&[
					DynSolValue::Address(author),
					DynSolValue::Uint(U256::from(index), 256),
				],
			),
			returns(vec![DynSolValue::Uint(book.book_id, 256)]),
		);
		script_book(chain, book);
	}
}

pub fn script_royalties(chain: &SimulatedChain, author: Address, amount: U256) {
	chain.set_call_response(
		calldata("getRoyalties", &[DynSolValue::Address(author)]),
		returns(vec![DynSolValue::Uint(amount, 256)]),
	);
}

/// Selector of a fixture function, for scripting reverts.
pub fn selector(function: &str) -> alloy_primitives::FixedBytes<4> {
	let abi: JsonAbi = serde_json::from_str(ABI).expect("fixture ABI parses");
	abi.function(function).expect("fixture function exists")[0].selector()
}
