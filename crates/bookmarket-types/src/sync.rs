//! Per-key async critical sections.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = DashMap<K, Arc<Mutex<()>>>;

/// Hands out one async mutex per key.
///
/// Used to serialize work for a single sender or a single ledger record while
/// leaving unrelated keys free to proceed concurrently. A key's entry lives
/// only while someone holds or waits for it.
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash> {
	locks: Arc<LockMap<K>>,
}

/// Exclusive access to one key. Dropping it releases the key and, when no
/// other task holds or waits for it, removes the key's entry.
pub struct KeyedGuard<K: Eq + Hash> {
	key: K,
	guard: Option<OwnedMutexGuard<()>>,
	locks: Arc<LockMap<K>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
	pub fn new() -> Self {
		Self {
			locks: Arc::new(DashMap::new()),
		}
	}

	/// Waits for exclusive access to `key`. Released when the guard drops.
	pub async fn acquire(&self, key: &K) -> KeyedGuard<K> {
		// Clone the Arc out so the map shard is not held across the await.
		let lock = self
			.locks
			.entry(key.clone())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone();
		let guard = lock.lock_owned().await;
		KeyedGuard {
			key: key.clone(),
			guard: Some(guard),
			locks: self.locks.clone(),
		}
	}

	/// Number of keys currently held or awaited.
	pub fn len(&self) -> usize {
		self.locks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.locks.is_empty()
	}
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
	fn drop(&mut self) {
		// Release first so the map's Arc is the only one left when idle.
		self.guard.take();
		// Waiters hold their own clone, so a contended key stays mapped.
		self.locks
			.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
	}
}

impl<K: Eq + Hash + std::fmt::Debug> std::fmt::Debug for KeyedGuard<K> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyedGuard").field("key", &self.key).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn test_same_key_is_exclusive() {
		let locks = Arc::new(KeyedLocks::<u32>::new());
		let guard = locks.acquire(&7).await;

		let waiter = {
			let locks = locks.clone();
			tokio::spawn(async move {
				let _g = locks.acquire(&7).await;
			})
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!waiter.is_finished());

		// Other keys are unaffected.
		let _other = locks.acquire(&8).await;

		drop(guard);
		waiter.await.unwrap();
	}

	#[tokio::test]
	async fn test_entries_removed_once_released() {
		let locks = KeyedLocks::<String>::new();
		for i in 0..100 {
			let _guard = locks.acquire(&format!("record-{}", i)).await;
		}
		assert!(locks.is_empty());

		let first = locks.acquire(&"a".to_string()).await;
		let second = locks.acquire(&"b".to_string()).await;
		assert_eq!(locks.len(), 2);
		drop(first);
		assert_eq!(locks.len(), 1);
		drop(second);
		assert!(locks.is_empty());
	}

	#[tokio::test]
	async fn test_contended_key_survives_first_release() {
		let locks = Arc::new(KeyedLocks::<u32>::new());
		let guard = locks.acquire(&1).await;

		let waiter = {
			let locks = locks.clone();
			tokio::spawn(async move {
				let _g = locks.acquire(&1).await;
				tokio::time::sleep(Duration::from_millis(10)).await;
			})
		};
		tokio::time::sleep(Duration::from_millis(20)).await;

		// The waiter still needs the same mutex, so the entry stays.
		drop(guard);
		assert_eq!(locks.len(), 1);

		waiter.await.unwrap();
		assert!(locks.is_empty());
	}
}
