//! Schema checks for the TOML tables handed to pluggable implementations.
//!
//! Every implementation (chain client, account, storage backend, content store)
//! receives its own `implementations.<name>` table. Before the factory builds
//! anything, the table is checked against the `Schema` the implementation
//! publishes through [`ConfigSchema`].

use thiserror::Error;

/// Errors produced while checking a configuration table.
#[derive(Debug, Error)]
pub enum ValidationError {
	/// Error that occurs when a required field is absent.
	#[error("Missing required field: {0}")]
	MissingField(String),
	/// Error that occurs when a field's validator rejects its value.
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	/// Error that occurs when a field has the wrong TOML type.
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
	/// Error that occurs when a table cannot be deserialized into its struct.
	#[error("Failed to deserialize config: {0}")]
	DeserializationError(String),
}

impl ValidationError {
	fn nested(self, parent: &str) -> Self {
		match self {
			ValidationError::MissingField(f) => {
				ValidationError::MissingField(format!("{}.{}", parent, f))
			},
			ValidationError::InvalidValue { field, message } => ValidationError::InvalidValue {
				field: format!("{}.{}", parent, field),
				message,
			},
			ValidationError::TypeMismatch {
				field,
				expected,
				actual,
			} => ValidationError::TypeMismatch {
				field: format!("{}.{}", parent, field),
				expected,
				actual,
			},
			other => other,
		}
	}
}

/// Expected shape of a single configuration value.
#[derive(Debug)]
pub enum FieldType {
	String,
	/// Integer with inclusive bounds.
	Integer { min: Option<i64>, max: Option<i64> },
	Boolean,
	/// A `0x`-prefixed 20-byte hex account address.
	Address,
	Array(Box<FieldType>),
	Table(Schema),
}

/// Extra check run after the type check passes.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

/// A named field inside a [`Schema`].
pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.field("has_validator", &self.validator.is_some())
			.finish()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	/// Attaches a custom check; the returned message becomes an `InvalidValue` error.
	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, value: &toml::Value) -> Result<(), ValidationError> {
		check_type(&self.name, value, &self.field_type)?;
		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| ValidationError::InvalidValue {
				field: self.name.clone(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of one configuration table.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	/// Checks `config` against this schema, descending into nested tables.
	///
	/// Unknown keys are tolerated; only declared fields are inspected.
	pub fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let table = config
			.as_table()
			.ok_or_else(|| ValidationError::TypeMismatch {
				field: "root".to_string(),
				expected: "table".to_string(),
				actual: config.type_str().to_string(),
			})?;

		for field in &self.required {
			let value = table
				.get(&field.name)
				.ok_or_else(|| ValidationError::MissingField(field.name.clone()))?;
			field.check(value)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(value)?;
			}
		}

		Ok(())
	}
}

fn mismatch(field: &str, expected: &str, value: &toml::Value) -> ValidationError {
	ValidationError::TypeMismatch {
		field: field.to_string(),
		expected: expected.to_string(),
		actual: value.type_str().to_string(),
	}
}

fn check_type(field: &str, value: &toml::Value, expected: &FieldType) -> Result<(), ValidationError> {
	match expected {
		FieldType::String => {
			if !value.is_str() {
				return Err(mismatch(field, "string", value));
			}
		},
		FieldType::Integer { min, max } => {
			let n = value
				.as_integer()
				.ok_or_else(|| mismatch(field, "integer", value))?;
			if let Some(min) = min {
				if n < *min {
					return Err(ValidationError::InvalidValue {
						field: field.to_string(),
						message: format!("Value {} is less than minimum {}", n, min),
					});
				}
			}
			if let Some(max) = max {
				if n > *max {
					return Err(ValidationError::InvalidValue {
						field: field.to_string(),
						message: format!("Value {} is greater than maximum {}", n, max),
					});
				}
			}
		},
		FieldType::Boolean => {
			if !value.is_bool() {
				return Err(mismatch(field, "boolean", value));
			}
		},
		FieldType::Address => {
			let s = value
				.as_str()
				.ok_or_else(|| mismatch(field, "address string", value))?;
			if s.parse::<alloy_primitives::Address>().is_err() {
				return Err(ValidationError::InvalidValue {
					field: field.to_string(),
					message: format!("'{}' is not a 20-byte hex address", s),
				});
			}
		},
		FieldType::Array(inner) => {
			let items = value
				.as_array()
				.ok_or_else(|| mismatch(field, "array", value))?;
			for (i, item) in items.iter().enumerate() {
				check_type(&format!("{}[{}]", field, i), item, inner)?;
			}
		},
		FieldType::Table(schema) => {
			schema.validate(value).map_err(|e| e.nested(field))?;
		},
	}

	Ok(())
}

/// Implemented by every pluggable component to describe its configuration table.
pub trait ConfigSchema: Send + Sync {
	/// Checks `config` against the schema, naming the first offending field.
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn endpoint_schema() -> Schema {
		Schema::new(
			vec![
				Field::new("rpc_url", FieldType::String).with_validator(|v| {
					let url = v.as_str().unwrap_or_default();
					if url.starts_with("http://") || url.starts_with("https://") {
						Ok(())
					} else {
						Err("must be an http(s) url".to_string())
					}
				}),
				Field::new(
					"timeout_ms",
					FieldType::Integer {
						min: Some(1),
						max: Some(60_000),
					},
				),
			],
			vec![Field::new("operator", FieldType::Address)],
		)
	}

	#[test]
	fn test_accepts_well_formed_table() {
		let config: toml::Value = toml::from_str(
			r#"
			rpc_url = "http://127.0.0.1:7545"
			timeout_ms = 500
			operator = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
			"#,
		)
		.unwrap();
		assert!(endpoint_schema().validate(&config).is_ok());
	}

	#[test]
	fn test_reports_missing_and_out_of_range_fields() {
		let missing: toml::Value = toml::from_str(r#"timeout_ms = 5"#).unwrap();
		assert!(matches!(
			endpoint_schema().validate(&missing),
			Err(ValidationError::MissingField(f)) if f == "rpc_url"
		));

		let too_large: toml::Value =
			toml::from_str("rpc_url = \"http://x\"\ntimeout_ms = 90000").unwrap();
		assert!(matches!(
			endpoint_schema().validate(&too_large),
			Err(ValidationError::InvalidValue { field, .. }) if field == "timeout_ms"
		));
	}

	#[test]
	fn test_rejects_bad_address_and_custom_validator() {
		let bad_addr: toml::Value = toml::from_str(
			"rpc_url = \"http://x\"\ntimeout_ms = 5\noperator = \"0x1234\"",
		)
		.unwrap();
		assert!(matches!(
			endpoint_schema().validate(&bad_addr),
			Err(ValidationError::InvalidValue { field, .. }) if field == "operator"
		));

		let bad_url: toml::Value =
			toml::from_str("rpc_url = \"ws://x\"\ntimeout_ms = 5").unwrap();
		assert!(endpoint_schema().validate(&bad_url).is_err());
	}

	#[test]
	fn test_nested_errors_carry_parent_path() {
		let schema = Schema::new(
			vec![Field::new("inner", FieldType::Table(endpoint_schema()))],
			vec![],
		);
		let config: toml::Value = toml::from_str("[inner]\ntimeout_ms = 5").unwrap();
		assert!(matches!(
			schema.validate(&config),
			Err(ValidationError::MissingField(f)) if f == "inner.rpc_url"
		));
	}
}
