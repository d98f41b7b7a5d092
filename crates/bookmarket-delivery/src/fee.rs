//! Cached fee-per-gas quotes.

use crate::ChainInterface;
use arc_swap::ArcSwapOption;
use bookmarket_types::FeeBounds;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where a quote came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeSource {
	Network,
	/// The configured default, used when the network quote failed or was out of bounds.
	Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeQuote {
	/// Fee per gas, in wei.
	pub value: u128,
	pub source: FeeSource,
	pub observed_at: Instant,
}

/// Fee estimator with a time-bounded cache.
///
/// At most one refresh runs at a time; callers arriving during a refresh wait
/// for it and share its result. Every returned quote lies within the bounds.
pub struct FeeEstimator {
	chain: Arc<dyn ChainInterface>,
	bounds: FeeBounds,
	default_fee: u128,
	ttl: Duration,
	cached: ArcSwapOption<FeeQuote>,
	refresh: Mutex<()>,
}

impl FeeEstimator {
	pub fn new(
		chain: Arc<dyn ChainInterface>,
		bounds: FeeBounds,
		default_fee: u128,
		ttl: Duration,
	) -> Self {
		Self {
			chain,
			bounds,
			// Fallback quotes stay inside the bounds too.
			default_fee: default_fee.clamp(bounds.min_fee, bounds.max_fee),
			ttl,
			cached: ArcSwapOption::empty(),
			refresh: Mutex::new(()),
		}
	}

	fn fresh(&self) -> Option<Arc<FeeQuote>> {
		self.cached
			.load_full()
			.filter(|quote| quote.observed_at.elapsed() < self.ttl)
	}

	/// Returns the cached quote if it is younger than the TTL, otherwise
	/// queries the node. Never fails: an unusable network answer is replaced by
	/// the default fee.
	pub async fn current(&self) -> Arc<FeeQuote> {
		if let Some(quote) = self.fresh() {
			return quote;
		}

		let _guard = self.refresh.lock().await;
		if let Some(quote) = self.fresh() {
			return quote;
		}

		let (value, source) = match self.chain.get_fee_estimate().await {
			Ok(fee) if self.bounds.contains(fee) => (fee, FeeSource::Network),
			Ok(fee) => {
				warn!(
					fee,
					min = self.bounds.min_fee,
					max = self.bounds.max_fee,
					default = self.default_fee,
					"Network fee out of bounds, using default"
				);
				(self.default_fee, FeeSource::Fallback)
			},
			Err(e) => {
				warn!(error = %e, default = self.default_fee, "Fee query failed, using default");
				(self.default_fee, FeeSource::Fallback)
			},
		};

		let quote = Arc::new(FeeQuote {
			value,
			source,
			observed_at: Instant::now(),
		});
		debug!(fee = value, source = ?source, "Fee quote refreshed");
		self.cached.store(Some(quote.clone()));
		quote
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::simulated::SimulatedChain;
	use bookmarket_types::GWEI;

	fn estimator(chain: Arc<SimulatedChain>, ttl: Duration) -> FeeEstimator {
		FeeEstimator::new(chain, FeeBounds::default(), 20 * GWEI, ttl)
	}

	#[tokio::test]
	async fn test_cached_within_ttl() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777).with_fee(Some(30 * GWEI)));
		let fees = estimator(chain.clone(), Duration::from_secs(60));

		let first = fees.current().await;
		let second = fees.current().await;
		assert!(Arc::ptr_eq(&first, &second));
		assert_eq!(first.value, 30 * GWEI);
		assert_eq!(first.source, FeeSource::Network);
		assert_eq!(chain.fee_queries(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_refreshes_after_ttl() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777).with_fee(Some(30 * GWEI)));
		let fees = estimator(chain.clone(), Duration::from_secs(60));

		let first = fees.current().await;
		chain.set_fee(Some(40 * GWEI));
		tokio::time::advance(Duration::from_secs(61)).await;

		let second = fees.current().await;
		assert!(!Arc::ptr_eq(&first, &second));
		assert_eq!(second.value, 40 * GWEI);
		assert_eq!(chain.fee_queries(), 2);
	}

	#[tokio::test]
	async fn test_out_of_bounds_uses_default() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777).with_fee(Some(10_000 * GWEI)));
		let fees = estimator(chain, Duration::from_secs(60));

		let quote = fees.current().await;
		assert_eq!(quote.value, 20 * GWEI);
		assert_eq!(quote.source, FeeSource::Fallback);
	}

	#[tokio::test]
	async fn test_failed_query_uses_default() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777).with_fee(None));
		let fees = estimator(chain, Duration::from_secs(60));

		let quote = fees.current().await;
		assert_eq!(quote.value, 20 * GWEI);
		assert_eq!(quote.source, FeeSource::Fallback);
	}

	#[tokio::test]
	async fn test_concurrent_callers_share_one_refresh() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777).with_fee(Some(25 * GWEI)));
		let fees = Arc::new(estimator(chain.clone(), Duration::from_secs(60)));

		let handles: Vec<_> = (0..16)
			.map(|_| {
				let fees = fees.clone();
				tokio::spawn(async move { fees.current().await })
			})
			.collect();
		for handle in handles {
			assert_eq!(handle.await.unwrap().value, 25 * GWEI);
		}
		assert_eq!(chain.fee_queries(), 1);
	}

	#[test]
	fn test_default_clamped_into_bounds() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777));
		let fees = FeeEstimator::new(chain, FeeBounds::default(), 1, Duration::from_secs(1));
		assert_eq!(fees.default_fee, GWEI);
	}
}
