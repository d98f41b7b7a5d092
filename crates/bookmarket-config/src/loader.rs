//! Multi-file configuration loading.
//!
//! Included files may include further files. Every file is read once; a second
//! visit means the includes form a cycle. Top-level sections are merged into a
//! single table and must not be defined twice.

use crate::{resolve_env_vars, Config, ConfigError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ConfigLoader {
	base_path: PathBuf,
	visited: HashSet<PathBuf>,
	section_sources: HashMap<String, PathBuf>,
}

impl ConfigLoader {
	pub fn new(base_path: impl AsRef<Path>) -> Self {
		Self {
			base_path: base_path.as_ref().to_path_buf(),
			visited: HashSet::new(),
			section_sources: HashMap::new(),
		}
	}

	/// Reads `config_path` and everything it includes, then parses and validates.
	pub async fn load_config(&mut self, config_path: impl AsRef<Path>) -> Result<Config, ConfigError> {
		let root = self.resolve_path(config_path.as_ref())?;
		let mut merged = toml::value::Table::new();
		self.merge_file(&root, &mut merged).await?;

		let text = toml::to_string(&toml::Value::Table(merged)).map_err(|e| {
			ConfigError::Parse(format!("Failed to serialize combined config: {}", e))
		})?;
		text.parse()
	}

	async fn merge_file(
		&mut self,
		path: &Path,
		merged: &mut toml::value::Table,
	) -> Result<(), ConfigError> {
		let content = self.read_once(path).await?;
		let mut table: toml::value::Table = toml::from_str(&content)?;
		let includes = Self::take_includes(&mut table)?;

		for (section, value) in table {
			if let Some(previous) = self.section_sources.get(&section) {
				return Err(ConfigError::Validation(format!(
					"Duplicate section '{}' found in {} and {}. \
					Each top-level section must be unique across all configuration files.",
					section,
					previous.display(),
					path.display()
				)));
			}
			self.section_sources.insert(section.clone(), path.to_path_buf());
			merged.insert(section, value);
		}

		for include in includes {
			let resolved = self.resolve_path(&include)?;
			debug!(file = %resolved.display(), "Including configuration file");
			Box::pin(self.merge_file(&resolved, merged)).await?;
		}

		Ok(())
	}

	async fn read_once(&mut self, path: &Path) -> Result<String, ConfigError> {
		let canonical = tokio::fs::canonicalize(path).await.map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Cannot resolve path {}: {}", path.display(), e),
			))
		})?;

		if !self.visited.insert(canonical.clone()) {
			return Err(ConfigError::Validation(format!(
				"Circular include detected: {} was already loaded",
				canonical.display()
			)));
		}

		let content = tokio::fs::read_to_string(&canonical).await?;
		resolve_env_vars(&content)
	}

	fn take_includes(table: &mut toml::value::Table) -> Result<Vec<PathBuf>, ConfigError> {
		match table.remove("include") {
			None => Ok(Vec::new()),
			Some(toml::Value::String(path)) => Ok(vec![PathBuf::from(path)]),
			Some(toml::Value::Array(items)) => items
				.into_iter()
				.map(|item| match item {
					toml::Value::String(path) => Ok(PathBuf::from(path)),
					_ => Err(ConfigError::Validation(
						"Include array must contain only strings".into(),
					)),
				})
				.collect(),
			Some(_) => Err(ConfigError::Validation(
				"Include must be a string or array of strings".into(),
			)),
		}
	}

	fn resolve_path(&self, path: &Path) -> Result<PathBuf, ConfigError> {
		let resolved = if path.is_absolute() {
			path.to_path_buf()
		} else {
			self.base_path.join(path)
		};

		if !resolved.exists() {
			return Err(ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Configuration file not found: {}", resolved.display()),
			)));
		}

		Ok(resolved)
	}
}
