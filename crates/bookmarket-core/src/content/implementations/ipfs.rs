//! Content store backed by an IPFS node's HTTP API (`/api/v0/add`, `/api/v0/cat`).

use crate::content::{ContentError, ContentFactory, ContentInterface, ContentRegistry};
use async_trait::async_trait;
use bookmarket_types::{ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

pub struct IpfsContent {
	client: Client,
	api_url: String,
}

#[derive(Deserialize)]
struct AddResponse {
	#[serde(rename = "Hash")]
	hash: String,
}

impl IpfsContent {
	pub fn new(api_url: &str, timeout: Duration) -> Result<Self, ContentError> {
		let client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| ContentError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
		Ok(Self {
			client,
			api_url: api_url.trim_end_matches('/').to_string(),
		})
	}

	fn endpoint(&self, path: &str) -> String {
		format!("{}/api/v0/{}", self.api_url, path)
	}

	async fn cat(&self, id: &str) -> Result<reqwest::Response, ContentError> {
		self.client
			.post(self.endpoint("cat"))
			.query(&[("arg", id)])
			.send()
			.await
			.map_err(|e| ContentError::Backend(format!("IPFS cat failed: {}", e)))
	}
}

/// The node answers unknown or malformed ids with a 500 and a message body.
fn is_missing(status: StatusCode) -> bool {
	status == StatusCode::NOT_FOUND || status == StatusCode::INTERNAL_SERVER_ERROR
}

#[async_trait]
impl ContentInterface for IpfsContent {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(IpfsContentSchema)
	}

	async fn put(&self, data: Bytes) -> Result<String, ContentError> {
		let form = Form::new().part("file", Part::stream(data).file_name("book"));
		let response = self
			.client
			.post(self.endpoint("add"))
			.multipart(form)
			.send()
			.await
			.map_err(|e| ContentError::Backend(format!("IPFS add failed: {}", e)))?;

		let status = response.status();
		if !status.is_success() {
			return Err(ContentError::Backend(format!("IPFS add returned {}", status)));
		}
		let added: AddResponse = response
			.json()
			.await
			.map_err(|e| ContentError::Backend(format!("Unexpected IPFS add response: {}", e)))?;
		debug!(content_id = %added.hash, "Pinned to IPFS");
		Ok(added.hash)
	}

	async fn get(&self, id: &str) -> Result<Bytes, ContentError> {
		let response = self.cat(id).await?;
		let status = response.status();
		if is_missing(status) {
			return Err(ContentError::NotFound(id.to_string()));
		}
		if !status.is_success() {
			return Err(ContentError::Backend(format!("IPFS cat returned {}", status)));
		}
		response
			.bytes()
			.await
			.map_err(|e| ContentError::Backend(format!("IPFS read failed: {}", e)))
	}

	async fn exists(&self, id: &str) -> Result<bool, ContentError> {
		let response = self.cat(id).await?;
		let status = response.status();
		if status.is_success() {
			Ok(true)
		} else if is_missing(status) {
			Ok(false)
		} else {
			Err(ContentError::Backend(format!("IPFS cat returned {}", status)))
		}
	}
}

pub struct IpfsContentSchema;

impl ConfigSchema for IpfsContentSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("api_url", FieldType::String).with_validator(|value| {
				match value.as_str() {
					Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
					_ => Err("api_url must be an http(s) URL".to_string()),
				}
			})],
			vec![Field::new(
				"timeout_seconds",
				FieldType::Integer {
					min: Some(1),
					max: Some(600),
				},
			)],
		);
		schema.validate(config)
	}
}

pub fn create_content(config: &toml::Value) -> Result<Box<dyn ContentInterface>, ContentError> {
	IpfsContentSchema
		.validate(config)
		.map_err(|e| ContentError::Configuration(format!("Invalid configuration: {}", e)))?;

	let api_url = config
		.get("api_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| ContentError::Configuration("api_url is required".into()))?;
	let timeout = config
		.get("timeout_seconds")
		.and_then(|v| v.as_integer())
		.map(|secs| secs as u64)
		.unwrap_or(DEFAULT_TIMEOUT_SECONDS);

	Ok(Box::new(IpfsContent::new(api_url, Duration::from_secs(timeout))?))
}

pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "ipfs";
	type Factory = ContentFactory;

	fn factory() -> Self::Factory {
		create_content
	}
}

impl ContentRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;

	fn table(toml: &str) -> toml::Value {
		toml::from_str(toml).unwrap()
	}

	#[test]
	fn test_schema() {
		assert!(create_content(&table(r#"api_url = "http://127.0.0.1:5001""#)).is_ok());
		assert!(create_content(&table(r#"api_url = "http://127.0.0.1:5001"
timeout_seconds = 10"#))
		.is_ok());
		assert!(matches!(
			create_content(&table("")),
			Err(ContentError::Configuration(_))
		));
		assert!(matches!(
			create_content(&table(r#"api_url = "ipfs://node""#)),
			Err(ContentError::Configuration(_))
		));
	}

	#[test]
	fn test_endpoint_strips_trailing_slash() {
		let store = IpfsContent::new("http://127.0.0.1:5001/", Duration::from_secs(1)).unwrap();
		assert_eq!(store.endpoint("add"), "http://127.0.0.1:5001/api/v0/add");
	}

	#[tokio::test]
	async fn test_unreachable_node_is_backend_error() {
		let store = IpfsContent::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
		let err = store.put(Bytes::from_static(b"%PDF")).await.unwrap_err();
		assert!(matches!(err, ContentError::Backend(_)));
	}
}
