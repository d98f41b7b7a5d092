//! Book file storage behind a content-addressed boundary.
//!
//! The marketplace only ever needs two things from the store: put bytes in
//! and get back an id that the contract listing will carry, and check that an
//! id actually resolves before listing it.

use async_trait::async_trait;
use bookmarket_types::{ConfigSchema, ImplementationRegistry};
use bytes::Bytes;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub mod implementations {
	pub mod ipfs;
	pub mod memory;
}

/// Errors that can occur while storing or reading book content.
#[derive(Debug, Error)]
pub enum ContentError {
	/// Error that occurs when no content has the requested id.
	#[error("Content not found: {0}")]
	NotFound(String),
	/// Error that occurs when an upload fails the size or extension policy.
	#[error("Content rejected: {0}")]
	Rejected(String),
	/// Error that occurs when the content store fails or is unreachable.
	#[error("Content store error: {0}")]
	Backend(String),
	/// Error that occurs when a content store's configuration is invalid.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Trait defining the interface for content-addressed book storage.
#[async_trait]
pub trait ContentInterface: Send + Sync {
	/// Returns the configuration schema for this content store.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Stores `data` and returns the id it is addressed by.
	async fn put(&self, data: Bytes) -> Result<String, ContentError>;

	/// Content stored under `id`; `NotFound` if there is none.
	async fn get(&self, id: &str) -> Result<Bytes, ContentError>;

	/// Whether content is stored under `id`.
	async fn exists(&self, id: &str) -> Result<bool, ContentError>;
}

pub type ContentFactory = fn(&toml::Value) -> Result<Box<dyn ContentInterface>, ContentError>;

/// Registration for content store implementations.
pub trait ContentRegistry: ImplementationRegistry<Factory = ContentFactory> {}

pub fn get_all_implementations() -> Vec<(&'static str, ContentFactory)> {
	use implementations::{ipfs, memory};

	vec![
		(memory::Registry::NAME, memory::Registry::factory()),
		(ipfs::Registry::NAME, ipfs::Registry::factory()),
	]
}

/// Upload limits applied before anything reaches the store.
#[derive(Debug, Clone)]
pub struct ContentPolicy {
	pub max_size_bytes: usize,
	/// Lowercase extensions without the dot.
	pub allowed_extensions: Vec<String>,
}

impl ContentPolicy {
	pub fn check(&self, file_name: &str, size: usize) -> Result<(), ContentError> {
		if size == 0 {
			return Err(ContentError::Rejected("file is empty".into()));
		}
		if size > self.max_size_bytes {
			return Err(ContentError::Rejected(format!(
				"file is {} bytes, limit is {}",
				size, self.max_size_bytes
			)));
		}

		let extension = Path::new(file_name)
			.extension()
			.and_then(|e| e.to_str())
			.map(str::to_ascii_lowercase)
			.ok_or_else(|| ContentError::Rejected(format!("'{}' has no extension", file_name)))?;
		if !self
			.allowed_extensions
			.iter()
			.any(|allowed| allowed.eq_ignore_ascii_case(&extension))
		{
			return Err(ContentError::Rejected(format!(
				"extension '{}' is not allowed (expected one of: {})",
				extension,
				self.allowed_extensions.join(", ")
			)));
		}
		Ok(())
	}
}

pub struct ContentService {
	implementation: Box<dyn ContentInterface>,
	policy: ContentPolicy,
}

impl ContentService {
	pub fn new(implementation: Box<dyn ContentInterface>, policy: ContentPolicy) -> Self {
		Self {
			implementation,
			policy,
		}
	}

	/// Checks the upload against the policy and stores it.
	pub async fn upload(&self, file_name: &str, data: Bytes) -> Result<String, ContentError> {
		self.policy.check(file_name, data.len())?;
		let size = data.len();
		let id = self.implementation.put(data).await?;
		info!(file_name, size, content_id = %id, "Content stored");
		Ok(id)
	}

	pub async fn fetch(&self, id: &str) -> Result<Bytes, ContentError> {
		self.implementation.get(id).await
	}

	pub async fn exists(&self, id: &str) -> Result<bool, ContentError> {
		self.implementation.exists(id).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::memory::MemoryContent;

	fn service() -> ContentService {
		ContentService::new(
			Box::new(MemoryContent::new()),
			ContentPolicy {
				max_size_bytes: 8,
				allowed_extensions: vec!["pdf".into(), "epub".into()],
			},
		)
	}

	#[tokio::test]
	async fn test_upload_then_fetch() {
		let service = service();
		let id = service
			.upload("Moby-Dick.PDF", Bytes::from_static(b"%PDF-1"))
			.await
			.unwrap();
		assert!(service.exists(&id).await.unwrap());
		assert_eq!(service.fetch(&id).await.unwrap(), Bytes::from_static(b"%PDF-1"));
	}

	#[tokio::test]
	async fn test_policy_rejections() {
		let service = service();
		for (name, data) in [
			("book.txt", &b"text"[..]),
			("book", &b"text"[..]),
			("book.pdf", &b""[..]),
			("book.epub", &b"way too large"[..]),
		] {
			let err = service
				.upload(name, Bytes::copy_from_slice(data))
				.await
				.unwrap_err();
			assert!(matches!(err, ContentError::Rejected(_)), "{} accepted", name);
		}
	}

	#[test]
	fn test_every_implementation_registered() {
		let names: Vec<_> = get_all_implementations().into_iter().map(|(n, _)| n).collect();
		assert_eq!(names, vec!["memory", "ipfs"]);
	}
}
