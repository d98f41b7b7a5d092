//! Configuration for the book marketplace orchestrator.
//!
//! Configuration is TOML. A file may pull other files in with
//! `include = ["network.toml", "accounts.toml"]`; each top-level section has
//! to live in exactly one file. `${VAR}` and `${VAR:-default}` placeholders are
//! substituted from the environment before parsing, which keeps private keys
//! and RPC credentials out of the files themselves.

mod loader;

pub use loader::ConfigLoader;

use alloy_primitives::Address;
use bookmarket_types::{FeeBounds, NetworkProfile};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors raised while reading or checking configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs when the configuration file cannot be read.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when the TOML cannot be parsed or deserialized.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when values parse but are inconsistent or out of range.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// The full error embeds the whole input; keep only the message.
		ConfigError::Parse(err.message().to_string())
	}
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	pub market: MarketConfig,
	pub network: NetworkProfile,
	#[serde(default)]
	pub fees: FeeBounds,
	pub delivery: DeliveryConfig,
	pub account: AccountConfig,
	pub contract: ContractConfig,
	pub storage: StorageConfig,
	#[serde(default)]
	pub reconciliation: ReconciliationConfig,
	#[serde(default)]
	pub content: ContentConfig,
	pub api: Option<ApiConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarketConfig {
	/// Name of this marketplace instance, used in logs.
	pub id: String,
}

/// Chain client selection and submission limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliveryConfig {
	pub primary: String,
	pub implementations: HashMap<String, toml::Value>,
	/// Upper bound on the gas limit of any submitted transaction.
	#[serde(default = "default_gas_limit_ceiling")]
	pub gas_limit_ceiling: u64,
	/// Delay between receipt polls.
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
}

fn default_gas_limit_ceiling() -> u64 {
	2_000_000
}

fn default_poll_interval_ms() -> u64 {
	2_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
	pub primary: String,
	pub implementations: HashMap<String, toml::Value>,
}

/// Location of the deployment artifact describing the market contract.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContractConfig {
	pub artifact_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	pub primary: String,
	pub implementations: HashMap<String, toml::Value>,
}

/// Out-of-band reconciliation of records left pending.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconciliationConfig {
	#[serde(default = "default_reconcile_interval_seconds")]
	pub interval_seconds: u64,
	/// A pending record with no receipt after this long is marked failed.
	#[serde(default = "default_abandon_after_seconds")]
	pub abandon_after_seconds: u64,
}

fn default_reconcile_interval_seconds() -> u64 {
	60
}

fn default_abandon_after_seconds() -> u64 {
	86_400
}

impl Default for ReconciliationConfig {
	fn default() -> Self {
		Self {
			interval_seconds: default_reconcile_interval_seconds(),
			abandon_after_seconds: default_abandon_after_seconds(),
		}
	}
}

/// Book file uploads.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentConfig {
	#[serde(default = "default_content_primary")]
	pub primary: String,
	#[serde(default)]
	pub implementations: HashMap<String, toml::Value>,
	#[serde(default = "default_max_size_bytes")]
	pub max_size_bytes: usize,
	#[serde(default = "default_allowed_extensions")]
	pub allowed_extensions: Vec<String>,
}

fn default_content_primary() -> String {
	"memory".to_string()
}

fn default_max_size_bytes() -> usize {
	16 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
	vec!["pdf".to_string(), "epub".to_string()]
}

impl Default for ContentConfig {
	fn default() -> Self {
		Self {
			primary: default_content_primary(),
			implementations: HashMap::new(),
			max_size_bytes: default_max_size_bytes(),
			allowed_extensions: default_allowed_extensions(),
		}
	}
}

/// HTTP surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_api_host")]
	pub host: String,
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Addresses allowed to list books and withdraw royalties.
	#[serde(default)]
	pub authors: Vec<Address>,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

fn env_placeholder() -> Result<&'static Regex, ConfigError> {
	static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
	if let Some(re) = PLACEHOLDER.get() {
		return Ok(re);
	}
	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;
	Ok(PLACEHOLDER.get_or_init(|| re))
}

/// Substitutes `${VAR}` / `${VAR:-default}` placeholders from the environment.
///
/// A placeholder without a default whose variable is unset is an error.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = env_placeholder()?;
	let mut output = String::with_capacity(input.len());
	let mut last = 0;

	for cap in re.captures_iter(input) {
		let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match (std::env::var(name.as_str()), cap.get(2)) {
			(Ok(v), _) => v,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				return Err(ConfigError::Validation(format!(
					"Environment variable '{}' not found",
					name.as_str()
				)))
			},
		};
		output.push_str(&input[last..whole.start()]);
		output.push_str(&value);
		last = whole.end();
	}
	output.push_str(&input[last..]);

	Ok(output)
}

fn require_primary(
	section: &str,
	primary: &str,
	implementations: &HashMap<String, toml::Value>,
) -> Result<(), ConfigError> {
	if primary.is_empty() {
		return Err(ConfigError::Validation(format!(
			"{}.primary cannot be empty",
			section
		)));
	}
	if !implementations.contains_key(primary) {
		return Err(ConfigError::Validation(format!(
			"Primary {} '{}' not found in implementations",
			section, primary
		)));
	}
	Ok(())
}

impl Config {
	/// Loads `path`, following its `include` list relative to its directory.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path = Path::new(path);
		let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
		let file_name = path
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path.display())))?;

		ConfigLoader::new(base_dir).load_config(file_name).await
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.market.id.trim().is_empty() {
			return Err(ConfigError::Validation("market.id cannot be empty".into()));
		}

		let network = &self.network;
		if network.rpc_url.trim().is_empty() {
			return Err(ConfigError::Validation("network.rpc_url cannot be empty".into()));
		}
		if network.fee_cache_ttl_seconds == 0 || network.fee_cache_ttl_seconds > 3_600 {
			return Err(ConfigError::Validation(
				"network.fee_cache_ttl_seconds must be between 1 and 3600".into(),
			));
		}
		if network.max_confirm_wait_seconds == 0 {
			return Err(ConfigError::Validation(
				"network.max_confirm_wait_seconds must be greater than 0".into(),
			));
		}

		if self.fees.min_fee == 0 {
			return Err(ConfigError::Validation("fees.min_fee must be at least 1 wei".into()));
		}
		if self.fees.min_fee > self.fees.max_fee {
			return Err(ConfigError::Validation(format!(
				"fees.min_fee ({}) exceeds fees.max_fee ({})",
				self.fees.min_fee, self.fees.max_fee
			)));
		}
		if !self.fees.contains(network.default_fee) {
			return Err(ConfigError::Validation(format!(
				"network.default_fee {} is outside [{}, {}]",
				network.default_fee, self.fees.min_fee, self.fees.max_fee
			)));
		}

		require_primary(
			"delivery",
			&self.delivery.primary,
			&self.delivery.implementations,
		)?;
		if self.delivery.gas_limit_ceiling < 21_000 {
			return Err(ConfigError::Validation(
				"delivery.gas_limit_ceiling must be at least 21000".into(),
			));
		}
		if self.delivery.poll_interval_ms == 0 {
			return Err(ConfigError::Validation(
				"delivery.poll_interval_ms must be greater than 0".into(),
			));
		}

		require_primary("account", &self.account.primary, &self.account.implementations)?;
		require_primary("storage", &self.storage.primary, &self.storage.implementations)?;

		if self.contract.artifact_path.trim().is_empty() {
			return Err(ConfigError::Validation(
				"contract.artifact_path cannot be empty".into(),
			));
		}

		if self.reconciliation.interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"reconciliation.interval_seconds must be greater than 0".into(),
			));
		}
		if self.reconciliation.abandon_after_seconds < network.max_confirm_wait_seconds {
			return Err(ConfigError::Validation(
				"reconciliation.abandon_after_seconds cannot be shorter than network.max_confirm_wait_seconds"
					.into(),
			));
		}

		if self.content.max_size_bytes == 0 {
			return Err(ConfigError::Validation(
				"content.max_size_bytes must be greater than 0".into(),
			));
		}
		if self.content.allowed_extensions.is_empty() {
			return Err(ConfigError::Validation(
				"content.allowed_extensions cannot be empty".into(),
			));
		}
		// The in-memory store needs no table, so it may be selected implicitly.
		if self.content.primary != "memory" {
			require_primary("content", &self.content.primary, &self.content.implementations)?;
		}

		Ok(())
	}
}

impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
