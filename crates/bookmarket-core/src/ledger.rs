//! Off-chain transaction records kept in step with on-chain outcomes.
//!
//! A record is written `Pending` before its transaction is signed, gets its
//! hash after signing and before the transaction is sent, and is resolved
//! exactly once into `Completed` or `Failed`. Everything in between (a
//! timed-out wait, a crash after sending) leaves a `Pending` record with
//! enough information for the reconciliation pass to finish the job.
//!
//! The ledger also remembers spent purchase authorizations until they expire.

use alloy_primitives::{Address, TxHash, U256};
use backoff::ExponentialBackoffBuilder;
use bookmarket_storage::{QueryFilter, StorageError, StorageService};
use bookmarket_types::{
	current_timestamp, truncate_id, Counterparties, KeyedLocks, StorageKey, TransactionKind,
	TransactionRecord, TransactionRecordId, TransactionStatus, TxOutcome,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while reading or updating the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
	/// Error that occurs when the storage backend fails after retries.
	#[error("Storage error: {0}")]
	Storage(String),
	/// Error that occurs when no record has the requested id.
	#[error("Transaction record not found: {0}")]
	NotFound(String),
	/// Error that occurs when a hash is already indexed to another record.
	#[error("Hash {hash} already belongs to record {existing}")]
	HashConflict { hash: TxHash, existing: String },
	/// Error that occurs when a terminal record would be modified.
	#[error("Transaction record already resolved: {0}")]
	AlreadyResolved(String),
}

impl From<StorageError> for LedgerError {
	fn from(err: StorageError) -> Self {
		LedgerError::Storage(err.to_string())
	}
}

/// Result of [`LedgerReconciler::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
	/// The record is now `Completed`.
	Completed,
	/// The record is now `Failed`.
	Failed,
	/// The outcome was a timeout; the record keeps waiting with its hash set.
	StillPending,
	/// The record was already terminal; nothing changed.
	AlreadyResolved,
}

pub struct LedgerReconciler {
	storage: Arc<StorageService>,
	record_locks: KeyedLocks<TransactionRecordId>,
	authorization_locks: KeyedLocks<String>,
	retry_window: Duration,
}

impl LedgerReconciler {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self {
			storage,
			record_locks: KeyedLocks::new(),
			authorization_locks: KeyedLocks::new(),
			retry_window: Duration::from_secs(5),
		}
	}

	/// How long a failing storage write is retried before giving up.
	pub fn with_retry_window(mut self, window: Duration) -> Self {
		self.retry_window = window;
		self
	}

	/// Writes with exponential backoff. Only backend failures are retried.
	async fn write<T: Serialize + Sync>(
		&self,
		namespace: &str,
		id: &str,
		value: &T,
	) -> Result<(), LedgerError> {
		let policy = ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(50))
			.with_max_interval(Duration::from_secs(1))
			.with_max_elapsed_time(Some(self.retry_window))
			.build();

		backoff::future::retry(policy, || async {
			self.storage
				.store(namespace, id, value)
				.await
				.map_err(|e| match e {
					StorageError::Backend(_) => {
						debug!(namespace, id = %truncate_id(id), error = %e, "Retrying ledger write");
						backoff::Error::transient(e)
					},
					other => backoff::Error::permanent(other),
				})
		})
		.await
		.map_err(LedgerError::from)
	}

	async fn save(&self, record: &TransactionRecord) -> Result<(), LedgerError> {
		self.write(StorageKey::Transactions.as_str(), &record.id, record)
			.await
	}

	/// Points `hash` at `record_id`. A hash owned by another record is refused.
	async fn index_hash(&self, hash: TxHash, record_id: &str) -> Result<(), LedgerError> {
		let key = hash.to_string();
		match self
			.storage
			.retrieve::<String>(StorageKey::TransactionByHash.as_str(), &key)
			.await
		{
			Ok(existing) if existing == record_id => return Ok(()),
			Ok(existing) => return Err(LedgerError::HashConflict { hash, existing }),
			Err(StorageError::NotFound) => {},
			Err(e) => return Err(e.into()),
		}
		self.write(StorageKey::TransactionByHash.as_str(), &key, &record_id.to_string())
			.await
	}

	/// Creates a `Pending` record and returns its id.
	pub async fn record_pending(
		&self,
		kind: TransactionKind,
		counterparties: Counterparties,
		amount: U256,
		related_item_id: Option<u64>,
	) -> Result<TransactionRecordId, LedgerError> {
		let record = TransactionRecord::pending(
			kind,
			counterparties,
			amount,
			related_item_id,
			current_timestamp(),
		);
		self.save(&record).await?;
		info!(record_id = %truncate_id(&record.id), kind = %kind, amount = %amount, "Ledger record created");
		Ok(record.id)
	}

	/// Stores the signed transaction's hash. Must succeed before the
	/// transaction is sent, so a record without a hash was never broadcast.
	///
	/// Terminal records are refused with `AlreadyResolved`.
	pub async fn attach_hash(&self, record_id: &str, hash: TxHash) -> Result<(), LedgerError> {
		let _guard = self.record_locks.acquire(&record_id.to_string()).await;
		let mut record = self.get(record_id).await?;

		if record.status.is_terminal() {
			warn!(record_id = %truncate_id(record_id), status = %record.status, "Refusing hash for resolved record");
			return Err(LedgerError::AlreadyResolved(record.id));
		}

		match record.hash {
			Some(existing) if existing == hash => return Ok(()),
			Some(existing) => {
				return Err(LedgerError::HashConflict {
					hash: existing,
					existing: record.id,
				})
			},
			None => {},
		}

		self.index_hash(hash, record_id).await?;
		record.hash = Some(hash);
		record.submitted_at = Some(current_timestamp());
		self.save(&record).await?;
		debug!(record_id = %truncate_id(record_id), tx_hash = %truncate_id(&hash.to_string()), "Hash attached");
		Ok(())
	}

	/// Applies `outcome` to the record.
	///
	/// Terminal records are never touched again: a second call returns
	/// `AlreadyResolved`. A timeout keeps the record `Pending` with its hash.
	pub async fn resolve(
		&self,
		record_id: &str,
		outcome: &TxOutcome,
	) -> Result<Resolution, LedgerError> {
		let _guard = self.record_locks.acquire(&record_id.to_string()).await;
		let mut record = self.get(record_id).await?;

		if record.status.is_terminal() {
			debug!(record_id = %truncate_id(record_id), status = %record.status, "Record already resolved");
			return Ok(Resolution::AlreadyResolved);
		}

		let now = current_timestamp();
		let resolution = match outcome {
			TxOutcome::Confirmed {
				hash,
				block_number,
				gas_used,
				fee_used,
			} => {
				record.hash = Some(*hash);
				record.block_number = Some(*block_number);
				record.gas_used = Some(*gas_used);
				record.fee_used = Some(*fee_used);
				record.status = TransactionStatus::Completed;
				record.completed_at = Some(now);
				Resolution::Completed
			},
			TxOutcome::Failed { reason, hash } => {
				if hash.is_some() {
					record.hash = *hash;
				}
				record.failure_reason = Some(reason.clone());
				record.status = TransactionStatus::Failed;
				record.completed_at = Some(now);
				Resolution::Failed
			},
			TxOutcome::TimedOut { hash } => {
				record.hash = Some(*hash);
				record.submitted_at.get_or_insert(now);
				Resolution::StillPending
			},
		};

		if let Some(hash) = record.hash {
			self.index_hash(hash, record_id).await?;
		}
		self.save(&record).await?;

		match resolution {
			Resolution::Failed => warn!(
				record_id = %truncate_id(record_id),
				reason = record.failure_reason.as_deref().unwrap_or_default(),
				"Ledger record failed"
			),
			_ => info!(record_id = %truncate_id(record_id), resolution = ?resolution, "Ledger record resolved"),
		}
		Ok(resolution)
	}

	/// Marks the authorization identified by `digest` as spent.
	///
	/// Returns false when it was spent before. Entries are kept until
	/// `expires_at` and dropped by [`LedgerReconciler::prune_authorizations`].
	pub async fn consume_authorization(
		&self,
		digest: &str,
		expires_at: u64,
	) -> Result<bool, LedgerError> {
		let _guard = self.authorization_locks.acquire(&digest.to_string()).await;
		let namespace = StorageKey::Authorizations.as_str();
		if self.storage.exists(namespace, digest).await? {
			warn!(digest = %truncate_id(digest), "Authorization replayed");
			return Ok(false);
		}
		self.write(namespace, digest, &expires_at).await?;
		Ok(true)
	}

	/// Forgets spent authorizations that expired before `now`.
	pub async fn prune_authorizations(&self, now: u64) -> Result<usize, LedgerError> {
		let namespace = StorageKey::Authorizations.as_str();
		let entries = self.storage.retrieve_all::<u64>(namespace).await?;
		let mut pruned = 0;
		for (digest, expires_at) in entries {
			if expires_at < now {
				self.storage.remove(namespace, &digest).await?;
				pruned += 1;
			}
		}
		if pruned > 0 {
			debug!(pruned, "Expired authorizations pruned");
		}
		Ok(pruned)
	}

	pub async fn get(&self, record_id: &str) -> Result<TransactionRecord, LedgerError> {
		self.storage
			.retrieve(StorageKey::Transactions.as_str(), record_id)
			.await
			.map_err(|e| match e {
				StorageError::NotFound => LedgerError::NotFound(record_id.to_string()),
				other => other.into(),
			})
	}

	pub async fn find_by_hash(&self, hash: TxHash) -> Result<Option<TransactionRecord>, LedgerError> {
		let record_id: String = match self
			.storage
			.retrieve(StorageKey::TransactionByHash.as_str(), &hash.to_string())
			.await
		{
			Ok(id) => id,
			Err(StorageError::NotFound) => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		match self.get(&record_id).await {
			Ok(record) => Ok(Some(record)),
			Err(LedgerError::NotFound(_)) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Every record still waiting for resolution.
	pub async fn pending(&self) -> Result<Vec<TransactionRecord>, LedgerError> {
		let records = self
			.storage
			.query::<TransactionRecord>(
				StorageKey::Transactions.as_str(),
				QueryFilter::Equals(
					"status".to_string(),
					serde_json::Value::String(TransactionStatus::Pending.to_string()),
				),
			)
			.await?;
		Ok(records.into_iter().map(|(_, record)| record).collect())
	}

	/// Records `address` paid or was paid by, newest first.
	pub async fn history(&self, address: Address) -> Result<Vec<TransactionRecord>, LedgerError> {
		let mut records: Vec<TransactionRecord> = self
			.storage
			.retrieve_all::<TransactionRecord>(StorageKey::Transactions.as_str())
			.await?
			.into_iter()
			.map(|(_, record)| record)
			.filter(|record| record.involves(&address))
			.collect();
		records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
		Ok(records)
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use async_trait::async_trait;
	use bookmarket_storage::implementations::memory::MemoryStorage;
	use bookmarket_storage::StorageInterface;
	use bookmarket_types::ConfigSchema;
	use std::sync::atomic::{AtomicUsize, Ordering};

	pub(crate) fn ledger() -> LedgerReconciler {
		LedgerReconciler::new(Arc::new(StorageService::new(Box::new(MemoryStorage::new()))))
	}

	/// Stores `record` as-is, bypassing the lifecycle operations.
	pub(crate) async fn insert(ledger: &LedgerReconciler, record: &TransactionRecord) {
		ledger.save(record).await.unwrap();
	}

	fn parties() -> Counterparties {
		Counterparties {
			payer: Address::repeat_byte(1),
			payee: Some(Address::repeat_byte(2)),
		}
	}

	fn confirmed(hash: TxHash) -> TxOutcome {
		TxOutcome::Confirmed {
			hash,
			block_number: 12,
			gas_used: 50_000,
			fee_used: U256::from(1_000u64),
		}
	}

	#[tokio::test]
	async fn test_confirmed_resolves_once() {
		let ledger = ledger();
		let id = ledger
			.record_pending(TransactionKind::Purchase, parties(), U256::from(100u64), Some(5))
			.await
			.unwrap();
		let hash = TxHash::repeat_byte(0xaa);

		assert_eq!(ledger.resolve(&id, &confirmed(hash)).await.unwrap(), Resolution::Completed);
		let record = ledger.get(&id).await.unwrap();
		assert_eq!(record.status, TransactionStatus::Completed);
		assert_eq!(record.hash, Some(hash));
		assert_eq!(record.block_number, Some(12));
		assert!(record.completed_at.is_some());

		// A later failure must not overwrite the completed record.
		let second = ledger
			.resolve(&id, &TxOutcome::failed("late failure"))
			.await
			.unwrap();
		assert_eq!(second, Resolution::AlreadyResolved);
		assert_eq!(ledger.get(&id).await.unwrap(), record);
	}

	#[tokio::test]
	async fn test_revert_keeps_hash() {
		let ledger = ledger();
		let id = ledger
			.record_pending(TransactionKind::Purchase, parties(), U256::from(100u64), None)
			.await
			.unwrap();
		let hash = TxHash::repeat_byte(0xbb);
		let outcome = TxOutcome::Failed {
			reason: "transaction reverted in block 3".into(),
			hash: Some(hash),
		};

		assert_eq!(ledger.resolve(&id, &outcome).await.unwrap(), Resolution::Failed);
		let record = ledger.get(&id).await.unwrap();
		assert_eq!(record.status, TransactionStatus::Failed);
		assert_eq!(record.hash, Some(hash));
		assert!(record.completed_at.is_some());
		assert_eq!(ledger.find_by_hash(hash).await.unwrap().unwrap().id, id);
	}

	#[tokio::test]
	async fn test_timeout_stays_pending_with_hash() {
		let ledger = ledger();
		let id = ledger
			.record_pending(TransactionKind::Withdrawal, parties(), U256::from(7u64), None)
			.await
			.unwrap();
		let hash = TxHash::repeat_byte(0xcc);

		let resolution = ledger
			.resolve(&id, &TxOutcome::TimedOut { hash })
			.await
			.unwrap();
		assert_eq!(resolution, Resolution::StillPending);

		let pending = ledger.pending().await.unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].hash, Some(hash));
		assert!(pending[0].submitted_at.is_some());

		// The later confirmation still lands.
		assert_eq!(ledger.resolve(&id, &confirmed(hash)).await.unwrap(), Resolution::Completed);
		assert!(ledger.pending().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_concurrent_resolves_apply_once() {
		let ledger = Arc::new(ledger());
		let id = ledger
			.record_pending(TransactionKind::Purchase, parties(), U256::from(1u64), None)
			.await
			.unwrap();

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let ledger = ledger.clone();
				let id = id.clone();
				tokio::spawn(async move {
					ledger
						.resolve(&id, &confirmed(TxHash::repeat_byte(0xdd)))
						.await
						.unwrap()
				})
			})
			.collect();

		let mut completed = 0;
		for handle in handles {
			if handle.await.unwrap() == Resolution::Completed {
				completed += 1;
			}
		}
		assert_eq!(completed, 1);
	}

	#[tokio::test]
	async fn test_hash_is_unique() {
		let ledger = ledger();
		let hash = TxHash::repeat_byte(0xee);
		let first = ledger
			.record_pending(TransactionKind::Purchase, parties(), U256::from(1u64), None)
			.await
			.unwrap();
		let second = ledger
			.record_pending(TransactionKind::Purchase, parties(), U256::from(1u64), None)
			.await
			.unwrap();

		ledger.attach_hash(&first, hash).await.unwrap();
		ledger.attach_hash(&first, hash).await.unwrap();
		let err = ledger.attach_hash(&second, hash).await.unwrap_err();
		assert!(matches!(err, LedgerError::HashConflict { .. }));
	}

	#[tokio::test]
	async fn test_resolved_record_refuses_hash() {
		let ledger = ledger();
		let id = ledger
			.record_pending(TransactionKind::Purchase, parties(), U256::from(100u64), Some(5))
			.await
			.unwrap();
		let failure = TxOutcome::failed("never broadcast: no transaction hash recorded");
		assert_eq!(ledger.resolve(&id, &failure).await.unwrap(), Resolution::Failed);

		let hash = TxHash::repeat_byte(0xab);
		let err = ledger.attach_hash(&id, hash).await.unwrap_err();
		assert!(matches!(err, LedgerError::AlreadyResolved(_)));

		let record = ledger.get(&id).await.unwrap();
		assert_eq!(record.status, TransactionStatus::Failed);
		assert_eq!(record.hash, None);
		assert!(ledger.find_by_hash(hash).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_authorization_consumed_once() {
		let ledger = ledger();
		assert!(ledger.consume_authorization("0xd1", 1_000).await.unwrap());
		assert!(!ledger.consume_authorization("0xd1", 1_000).await.unwrap());
		assert!(ledger.consume_authorization("0xd2", 3_000).await.unwrap());

		assert_eq!(ledger.prune_authorizations(2_000).await.unwrap(), 1);
		assert!(!ledger.consume_authorization("0xd2", 3_000).await.unwrap());
		// Pruned only once expired, when the signature is refused anyway.
		assert!(ledger.consume_authorization("0xd1", 1_000).await.unwrap());
	}

	#[tokio::test]
	async fn test_history_newest_first_and_filtered() {
		let ledger = ledger();
		let me = Address::repeat_byte(1);
		let mut ids = Vec::new();
		for created_at in [100u64, 300, 200] {
			let mut record = TransactionRecord::pending(
				TransactionKind::Purchase,
				parties(),
				U256::from(1u64),
				None,
				created_at,
			);
			record.id = format!("r{}", created_at);
			ledger.save(&record).await.unwrap();
			ids.push(record.id);
		}
		let stranger = TransactionRecord::pending(
			TransactionKind::Purchase,
			Counterparties {
				payer: Address::repeat_byte(9),
				payee: None,
			},
			U256::from(1u64),
			None,
			400,
		);
		ledger.save(&stranger).await.unwrap();

		let history = ledger.history(me).await.unwrap();
		let order: Vec<_> = history.iter().map(|r| r.id.as_str()).collect();
		assert_eq!(order, vec!["r300", "r200", "r100"]);
	}

	#[tokio::test]
	async fn test_unknown_record() {
		let ledger = ledger();
		let err = ledger
			.resolve("missing", &TxOutcome::failed("x"))
			.await
			.unwrap_err();
		assert!(matches!(err, LedgerError::NotFound(_)));
	}

	/// Backend that fails the first `failures` writes to keys under `prefix`.
	pub(crate) struct FlakyStorage {
		inner: MemoryStorage,
		failures: AtomicUsize,
		prefix: &'static str,
	}

	impl FlakyStorage {
		pub(crate) fn new(failures: usize, prefix: &'static str) -> Self {
			Self {
				inner: MemoryStorage::new(),
				failures: AtomicUsize::new(failures),
				prefix,
			}
		}
	}

	#[async_trait]
	impl StorageInterface for FlakyStorage {
		async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
			self.inner.get_bytes(key).await
		}

		async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
			let remaining = self.failures.load(Ordering::SeqCst);
			if remaining > 0 && key.starts_with(self.prefix) {
				self.failures.store(remaining - 1, Ordering::SeqCst);
				return Err(StorageError::Backend("disk busy".into()));
			}
			self.inner.set_bytes(key, value).await
		}

		async fn delete(&self, key: &str) -> Result<(), StorageError> {
			self.inner.delete(key).await
		}

		async fn exists(&self, key: &str) -> Result<bool, StorageError> {
			self.inner.exists(key).await
		}

		async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
			self.inner.list_keys(prefix).await
		}

		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			self.inner.config_schema()
		}
	}

	#[tokio::test]
	async fn test_transient_write_failures_are_retried() {
		let storage = FlakyStorage::new(2, "");
		let ledger = LedgerReconciler::new(Arc::new(StorageService::new(Box::new(storage))));

		let id = ledger
			.record_pending(TransactionKind::Royalty, parties(), U256::from(3u64), None)
			.await
			.unwrap();
		assert_eq!(ledger.get(&id).await.unwrap().kind, TransactionKind::Royalty);
	}

	#[tokio::test]
	async fn test_persistent_write_failure_surfaces() {
		let storage = FlakyStorage::new(usize::MAX, "");
		let ledger = LedgerReconciler::new(Arc::new(StorageService::new(Box::new(storage))))
			.with_retry_window(Duration::from_millis(100));

		let err = ledger
			.record_pending(TransactionKind::Royalty, parties(), U256::from(3u64), None)
			.await
			.unwrap_err();
		assert!(matches!(err, LedgerError::Storage(_)));
	}
}
