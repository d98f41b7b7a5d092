//! Persistence for ledger records.
//!
//! Backends only move bytes under string keys. [`StorageService`] adds JSON
//! (de)serialization, `namespace:id` keys, namespace listing and simple field
//! filters on top of whichever backend configuration selects.

use async_trait::async_trait;
use bookmarket_types::{ConfigSchema, ImplementationRegistry};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when the requested key does not exist.
	#[error("Not found")]
	NotFound,
	/// Error that occurs when a value cannot be encoded or decoded.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend itself, such as file I/O.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs when a backend's configuration is invalid.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Byte-level key/value backend.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Raw bytes stored under `key`; `NotFound` if there are none.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Writes `value` under `key`, replacing any previous value in one step.
	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

	/// Removing a missing key is not an error.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Whether a value is stored under `key`.
	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// All keys starting with `prefix`, in no particular order.
	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

	/// Returns the configuration schema for this storage backend.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registration for storage backends.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Predicate over one top-level JSON field of a stored value.
#[derive(Debug, Clone)]
pub enum QueryFilter {
	All,
	Equals(String, serde_json::Value),
	NotEquals(String, serde_json::Value),
}

impl QueryFilter {
	fn matches(&self, value: &serde_json::Value) -> bool {
		match self {
			QueryFilter::All => true,
			QueryFilter::Equals(field, expected) => value.get(field) == Some(expected),
			QueryFilter::NotEquals(field, expected) => value.get(field) != Some(expected),
		}
	}
}

fn key_for(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

/// Typed access to a storage backend.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Writes `data`, creating or replacing the entry.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend.set_bytes(&key_for(namespace, id), bytes).await
	}

	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&key_for(namespace, id)).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Replaces an existing entry; `NotFound` if there is none.
	pub async fn update<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let key = key_for(namespace, id);
		if !self.backend.exists(&key).await? {
			return Err(StorageError::NotFound);
		}
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend.set_bytes(&key, bytes).await
	}

	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&key_for(namespace, id)).await
	}

	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&key_for(namespace, id)).await
	}

	/// Every entry of `namespace` as `(id, value)` pairs.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		self.query(namespace, QueryFilter::All).await
	}

	/// Entries of `namespace` whose JSON form satisfies `filter`.
	///
	/// Entries removed between listing and reading are skipped.
	pub async fn query<T: DeserializeOwned>(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<(String, T)>, StorageError> {
		let prefix = format!("{}:", namespace);
		let mut results = Vec::new();

		for key in self.backend.list_keys(&prefix).await? {
			let bytes = match self.backend.get_bytes(&key).await {
				Ok(bytes) => bytes,
				Err(StorageError::NotFound) => continue,
				Err(e) => return Err(e),
			};
			let json: serde_json::Value = serde_json::from_slice(&bytes)
				.map_err(|e| StorageError::Serialization(e.to_string()))?;
			if !filter.matches(&json) {
				continue;
			}
			let value = serde_json::from_value(json)
				.map_err(|e| StorageError::Serialization(e.to_string()))?;
			let id = key[prefix.len()..].to_string();
			results.push((id, value));
		}

		Ok(results)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::memory::MemoryStorage;
	use serde::Deserialize;

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct Entry {
		status: String,
		amount: u64,
	}

	fn service() -> StorageService {
		StorageService::new(Box::new(MemoryStorage::new()))
	}

	#[tokio::test]
	async fn test_store_retrieve_update() {
		let storage = service();
		let entry = Entry {
			status: "pending".into(),
			amount: 100,
		};

		assert!(matches!(
			storage.update("transactions", "a", &entry).await,
			Err(StorageError::NotFound)
		));

		storage.store("transactions", "a", &entry).await.unwrap();
		let done = Entry {
			status: "completed".into(),
			amount: 100,
		};
		storage.update("transactions", "a", &done).await.unwrap();

		let read: Entry = storage.retrieve("transactions", "a").await.unwrap();
		assert_eq!(read, done);

		storage.remove("transactions", "a").await.unwrap();
		assert!(!storage.exists("transactions", "a").await.unwrap());
	}

	#[tokio::test]
	async fn test_query_filters_by_field_and_namespace() {
		let storage = service();
		for (id, status) in [("1", "pending"), ("2", "completed"), ("3", "pending")] {
			storage
				.store(
					"transactions",
					id,
					&Entry {
						status: status.into(),
						amount: 1,
					},
				)
				.await
				.unwrap();
		}
		storage.store("transaction_by_hash", "0xab", &"1").await.unwrap();

		let mut pending: Vec<(String, Entry)> = storage
			.query(
				"transactions",
				QueryFilter::Equals("status".into(), serde_json::json!("pending")),
			)
			.await
			.unwrap();
		pending.sort_by(|a, b| a.0.cmp(&b.0));
		let ids: Vec<_> = pending.iter().map(|(id, _)| id.as_str()).collect();
		assert_eq!(ids, vec!["1", "3"]);

		let others: Vec<(String, Entry)> = storage
			.query(
				"transactions",
				QueryFilter::NotEquals("status".into(), serde_json::json!("pending")),
			)
			.await
			.unwrap();
		assert_eq!(others.len(), 1);

		let all: Vec<(String, Entry)> = storage.retrieve_all("transactions").await.unwrap();
		assert_eq!(all.len(), 3);
	}
}
