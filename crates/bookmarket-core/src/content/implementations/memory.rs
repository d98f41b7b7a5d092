//! In-process content store addressed by the keccak-256 of the content.

use crate::content::{ContentError, ContentFactory, ContentInterface, ContentRegistry};
use async_trait::async_trait;
use bookmarket_types::{ConfigSchema, ImplementationRegistry, Schema, ValidationError};
use bytes::Bytes;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct MemoryContent {
	blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryContent {
	pub fn new() -> Self {
		Self {
			blobs: RwLock::new(HashMap::new()),
		}
	}
}

impl Default for MemoryContent {
	fn default() -> Self {
		Self::new()
	}
}

fn content_id(data: &[u8]) -> String {
	format!("0x{}", hex::encode(Keccak256::digest(data)))
}

#[async_trait]
impl ContentInterface for MemoryContent {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryContentSchema)
	}

	async fn put(&self, data: Bytes) -> Result<String, ContentError> {
		let id = content_id(&data);
		self.blobs.write().await.insert(id.clone(), data);
		Ok(id)
	}

	async fn get(&self, id: &str) -> Result<Bytes, ContentError> {
		self.blobs
			.read()
			.await
			.get(id)
			.cloned()
			.ok_or_else(|| ContentError::NotFound(id.to_string()))
	}

	async fn exists(&self, id: &str) -> Result<bool, ContentError> {
		Ok(self.blobs.read().await.contains_key(id))
	}
}

pub struct MemoryContentSchema;

impl ConfigSchema for MemoryContentSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

pub fn create_content(_config: &toml::Value) -> Result<Box<dyn ContentInterface>, ContentError> {
	Ok(Box::new(MemoryContent::new()))
}

pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = ContentFactory;

	fn factory() -> Self::Factory {
		create_content
	}
}

impl ContentRegistry for Registry {}
