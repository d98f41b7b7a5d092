//! Every implementation the binary can be configured with, keyed by name.

use bookmarket_account::AccountFactory;
use bookmarket_core::content::ContentFactory;
use bookmarket_core::MarketFactories;
use bookmarket_delivery::ChainFactory;
use bookmarket_storage::StorageFactory;
use std::collections::HashMap;

pub type Factories = MarketFactories<StorageFactory, AccountFactory, ChainFactory, ContentFactory>;

fn by_name<F>(implementations: Vec<(&'static str, F)>) -> HashMap<String, F> {
	implementations
		.into_iter()
		.map(|(name, factory)| (name.to_string(), factory))
		.collect()
}

pub fn all_factories() -> Factories {
	MarketFactories {
		storage_factories: by_name(bookmarket_storage::get_all_implementations()),
		account_factories: by_name(bookmarket_account::get_all_implementations()),
		chain_factories: by_name(bookmarket_delivery::get_all_implementations()),
		content_factories: by_name(bookmarket_core::content::get_all_implementations()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_every_configurable_name_is_registered() {
		let factories = all_factories();
		let mut storage: Vec<_> = factories.storage_factories.keys().cloned().collect();
		storage.sort();
		assert_eq!(storage, vec!["file", "memory"]);
		assert!(factories.account_factories.contains_key("local"));
		assert!(factories.chain_factories.contains_key("evm_alloy"));
		assert!(factories.chain_factories.contains_key("simulated"));
		assert!(factories.content_factories.contains_key("memory"));
		assert!(factories.content_factories.contains_key("ipfs"));
	}
}
