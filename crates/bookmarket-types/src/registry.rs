//! Name-to-factory registration shared by every pluggable component.

/// Binds an implementation to the name used for it in configuration.
///
/// A chain client registered as `evm_alloy` is selected by
/// `delivery.primary = "evm_alloy"` and configured from
/// `[delivery.implementations.evm_alloy]`.
pub trait ImplementationRegistry {
	/// Configuration key of the implementation.
	const NAME: &'static str;

	/// Constructor signature shared by implementations of one component.
	type Factory;

	/// Returns the constructor registered under [`Self::NAME`].
	fn factory() -> Self::Factory;
}
