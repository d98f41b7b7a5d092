//! File-backed storage: one file per key under `storage_path`.
//!
//! Each file holds a fixed header followed by the value. Writes go to a
//! temporary file first and are renamed into place, so a crash never leaves a
//! half-written ledger record behind.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry};
use async_trait::async_trait;
use bookmarket_types::{ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError};
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

const EXTENSION: &str = "rec";

/// `magic (4) | version (2) | payload length (4, LE)`.
struct RecordHeader {
	version: u16,
	payload_len: u32,
}

impl RecordHeader {
	const MAGIC: &'static [u8; 4] = b"BKMS";
	const VERSION: u16 = 1;
	const SIZE: usize = 10;

	fn for_payload(len: usize) -> Result<Self, StorageError> {
		let payload_len = u32::try_from(len)
			.map_err(|_| StorageError::Backend(format!("Value too large: {} bytes", len)))?;
		Ok(Self {
			version: Self::VERSION,
			payload_len,
		})
	}

	fn encode(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
		bytes[6..10].copy_from_slice(&self.payload_len.to_le_bytes());
		bytes
	}

	fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
		if bytes.len() < Self::SIZE || &bytes[0..4] != Self::MAGIC {
			return Err(StorageError::Backend("Not a storage record".into()));
		}
		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"Unsupported record version: {}",
				version
			)));
		}
		let payload_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
		Ok(Self {
			version,
			payload_len,
		})
	}
}

/// Maps a key to a file-name-safe string and back.
///
/// Alphanumerics plus `-`, `_` and `.` pass through; every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
	let mut out = String::with_capacity(key.len());
	for byte in key.bytes() {
		match byte {
			b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
			_ => out.push_str(&format!("%{:02X}", byte)),
		}
	}
	out
}

fn decode_key(name: &str) -> Option<String> {
	let bytes = name.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'%' {
			let hex = name.get(i + 1..i + 3)?;
			out.push(u8::from_str_radix(hex, 16).ok()?);
			i += 3;
		} else {
			out.push(bytes[i]);
			i += 1;
		}
	}
	String::from_utf8(out).ok()
}

pub struct FileStorage {
	base_path: PathBuf,
}

impl FileStorage {
	pub fn new(base_path: PathBuf) -> Self {
		Self { base_path }
	}

	fn path_for(&self, key: &str) -> PathBuf {
		self.base_path
			.join(format!("{}.{}", encode_key(key), EXTENSION))
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let data = match fs::read(self.path_for(key)).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(StorageError::NotFound)
			},
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let header = RecordHeader::decode(&data)?;
		let payload = &data[RecordHeader::SIZE..];
		if payload.len() != header.payload_len as usize {
			return Err(StorageError::Backend(format!(
				"Record '{}' is truncated: expected {} bytes, found {}",
				key,
				header.payload_len,
				payload.len()
			)));
		}
		Ok(payload.to_vec())
	}

	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
		fs::create_dir_all(&self.base_path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		let header = RecordHeader::for_payload(value.len())?;
		let mut contents = Vec::with_capacity(RecordHeader::SIZE + value.len());
		contents.extend_from_slice(&header.encode());
		contents.extend_from_slice(&value);

		let path = self.path_for(key);
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, contents)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		match fs::remove_file(self.path_for(key)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		fs::try_exists(self.path_for(key))
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let mut keys = Vec::new();
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
				continue;
			}
			let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
				continue;
			};
			match decode_key(stem) {
				Some(key) if key.starts_with(prefix) => keys.push(key),
				Some(_) => {},
				None => debug!(file = %path.display(), "Skipping file with undecodable name"),
			}
		}
		Ok(keys)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}
}

pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![],
			vec![Field::new("storage_path", FieldType::String).with_validator(|v| {
				match v.as_str() {
					Some(path) if !path.trim().is_empty() => Ok(()),
					_ => Err("storage_path cannot be empty".to_string()),
				}
			})],
		)
		.validate(config)
	}
}

pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/ledger");

	Ok(Box::new(FileStorage::new(PathBuf::from(storage_path))))
}

pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
