//! Assembles a [`MarketEngine`] from configuration and implementation factories.
//!
//! Construction fails fast: the network guard runs before the contract is
//! bound or anything is signed, so a misconfigured endpoint never gets as far
//! as a transaction.

use crate::content::{ContentError, ContentInterface, ContentPolicy, ContentService};
use crate::engine::MarketEngine;
use crate::guard::{GuardError, NetworkGuard};
use crate::ledger::LedgerReconciler;
use crate::recovery::ReconciliationService;
use bookmarket_account::{AccountError, AccountInterface, AccountService};
use bookmarket_config::Config;
use bookmarket_contract::{BookMarket, ContractBinding, ContractError};
use bookmarket_delivery::{ChainInterface, DeliveryError, DeliveryService, FeeEstimator};
use bookmarket_storage::{StorageError, StorageInterface, StorageService};
use bookmarket_types::NetworkProfile;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while assembling the engine from configuration.
#[derive(Debug, Error)]
pub enum BuilderError {
	/// Error that occurs when a component's configuration is invalid.
	#[error("Configuration error: {0}")]
	Config(String),
	/// Error that occurs when no factory is registered for a configured component.
	#[error("Missing required component: {0}")]
	MissingComponent(String),
	/// Error that occurs when the endpoint is not the expected network.
	#[error("Network verification failed: {0}")]
	Network(#[from] GuardError),
	/// Error that occurs when the contract artifact cannot be bound.
	#[error("Contract binding failed: {0}")]
	Contract(#[from] ContractError),
}

/// Factory functions for every pluggable component, keyed by config name.
pub struct MarketFactories<SF, AF, CF, CTF> {
	pub storage_factories: HashMap<String, SF>,
	pub account_factories: HashMap<String, AF>,
	pub chain_factories: HashMap<String, CF>,
	pub content_factories: HashMap<String, CTF>,
}

pub struct MarketBuilder {
	config: Config,
}

/// Calls the factory registered for `name`, logging the result the same way
/// for every component.
fn create<T, E: std::fmt::Display>(
	component: &'static str,
	name: &str,
	factory: Option<impl FnOnce() -> Result<T, E>>,
) -> Result<T, BuilderError> {
	let factory = factory.ok_or_else(|| {
		BuilderError::MissingComponent(format!("no {} implementation named '{}'", component, name))
	})?;
	match factory() {
		Ok(implementation) => {
			tracing::info!(component, implementation = %name, "Loaded");
			Ok(implementation)
		},
		Err(e) => {
			tracing::error!(component, implementation = %name, error = %e, "Failed to create implementation");
			Err(BuilderError::Config(format!(
				"Failed to create {} implementation '{}': {}",
				component, name, e
			)))
		},
	}
}

fn primary_table<'a>(
	component: &str,
	primary: &str,
	implementations: &'a HashMap<String, toml::Value>,
) -> Result<&'a toml::Value, BuilderError> {
	implementations.get(primary).ok_or_else(|| {
		BuilderError::Config(format!(
			"Primary {} '{}' has no configuration table",
			component, primary
		))
	})
}

impl MarketBuilder {
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	pub async fn build<SF, AF, CF, CTF>(
		self,
		factories: MarketFactories<SF, AF, CF, CTF>,
	) -> Result<MarketEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
		AF: Fn(&toml::Value) -> Result<Box<dyn AccountInterface>, AccountError>,
		CF: Fn(&toml::Value, &NetworkProfile) -> Result<Box<dyn ChainInterface>, DeliveryError>,
		CTF: Fn(&toml::Value) -> Result<Box<dyn ContentInterface>, ContentError>,
	{
		let config = &self.config;
		tracing::info!(market = %config.market.id, "Building marketplace engine");

		let storage_name = &config.storage.primary;
		let storage_config = primary_table("storage", storage_name, &config.storage.implementations)?;
		let storage_backend = create(
			"storage",
			storage_name,
			factories
				.storage_factories
				.get(storage_name)
				.map(|f| move || f(storage_config)),
		)?;
		let storage = Arc::new(StorageService::new(storage_backend));

		let account_name = &config.account.primary;
		let account_config = primary_table("account", account_name, &config.account.implementations)?;
		let account_impl = create(
			"account",
			account_name,
			factories
				.account_factories
				.get(account_name)
				.map(|f| move || f(account_config)),
		)?;
		let operator = Arc::new(AccountService::new(account_impl));
		let operator_address = operator.address().await.map_err(|e| {
			tracing::error!(component = "account", error = %e, "Failed to get operator address");
			BuilderError::Config(format!("Failed to get operator address: {}", e))
		})?;

		let chain_name = &config.delivery.primary;
		let chain_config = primary_table("delivery", chain_name, &config.delivery.implementations)?;
		let chain: Arc<dyn ChainInterface> = Arc::from(create(
			"delivery",
			chain_name,
			factories
				.chain_factories
				.get(chain_name)
				.map(|f| move || f(chain_config, &config.network)),
		)?);

		let verified = NetworkGuard::verify(chain.as_ref(), &config.network, &[operator_address]).await?;

		let fees = Arc::new(FeeEstimator::new(
			chain.clone(),
			config.fees,
			config.network.default_fee,
			config.network.fee_cache_ttl(),
		));
		let delivery = Arc::new(DeliveryService::new(
			chain.clone(),
			fees,
			verified.chain_id,
			config.delivery.gas_limit_ceiling,
			Duration::from_millis(config.delivery.poll_interval_ms),
		));

		let binding =
			ContractBinding::from_file(&config.contract.artifact_path, verified.network_id, chain)
				.await?;
		let market = Arc::new(BookMarket::new(binding));

		let ledger = Arc::new(LedgerReconciler::new(storage));

		let content_name = &config.content.primary;
		let empty = toml::Value::Table(toml::map::Map::new());
		let content_config = config.content.implementations.get(content_name).unwrap_or(&empty);
		let content_impl = create(
			"content",
			content_name,
			factories
				.content_factories
				.get(content_name)
				.map(|f| move || f(content_config)),
		)?;
		let content = Arc::new(ContentService::new(
			content_impl,
			ContentPolicy {
				max_size_bytes: config.content.max_size_bytes,
				allowed_extensions: config.content.allowed_extensions.clone(),
			},
		));

		let reconciliation = Arc::new(ReconciliationService::new(
			ledger.clone(),
			delivery.clone(),
			config.network.max_confirm_wait(),
			Duration::from_secs(config.reconciliation.abandon_after_seconds),
		));

		tracing::info!(
			market = %config.market.id,
			contract = %market.address(),
			operator = %operator_address,
			"Marketplace engine ready"
		);
		Ok(MarketEngine::new(
			config.network.clone(),
			market,
			delivery,
			ledger,
			content,
			reconciliation,
			operator,
			config.network.max_confirm_wait(),
		))
	}
}
