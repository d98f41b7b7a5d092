//! Out-of-band resolution of ledger records left `Pending`.
//!
//! Records stay pending when the confirmation wait ran out or the process
//! died between signing and resolution. A pass re-polls the chain for each
//! one old enough to have been given up on by the request that sent it, and
//! fails records that never produced a receipt. The hash is stored before a
//! transaction is sent, so a record without one was never sent and is failed.
//! Each pass also forgets purchase authorizations that have expired.

use crate::ledger::{LedgerError, LedgerReconciler, Resolution};
use bookmarket_delivery::submitter::outcome_from_receipt;
use bookmarket_delivery::DeliveryService;
use bookmarket_types::{current_timestamp, truncate_id, TransactionRecord, TxOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Counts from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
	pub examined: usize,
	pub completed: usize,
	pub failed: usize,
	/// Left pending: too young, or no receipt yet.
	pub still_pending: usize,
	pub errors: usize,
}

pub struct ReconciliationService {
	ledger: Arc<LedgerReconciler>,
	delivery: Arc<DeliveryService>,
	max_confirm_wait: Duration,
	abandon_after: Duration,
}

enum Action {
	Wait,
	Resolve(TxOutcome),
}

impl ReconciliationService {
	pub fn new(
		ledger: Arc<LedgerReconciler>,
		delivery: Arc<DeliveryService>,
		max_confirm_wait: Duration,
		abandon_after: Duration,
	) -> Self {
		Self {
			ledger,
			delivery,
			max_confirm_wait,
			abandon_after,
		}
	}

	async fn decide(&self, record: &TransactionRecord, now: u64) -> Result<Action, String> {
		let age = record.age(now);
		if age < self.max_confirm_wait.as_secs() {
			return Ok(Action::Wait);
		}

		let Some(hash) = record.hash else {
			return Ok(Action::Resolve(TxOutcome::failed(
				"never broadcast: no transaction hash recorded",
			)));
		};

		match self.delivery.receipt(hash).await {
			Ok(Some(receipt)) => Ok(Action::Resolve(outcome_from_receipt(receipt))),
			Ok(None) if age >= self.abandon_after.as_secs() => Ok(Action::Resolve(TxOutcome::Failed {
				reason: format!("no receipt after {} seconds", age),
				hash: Some(hash),
			})),
			Ok(None) => Ok(Action::Wait),
			Err(e) => Err(e.to_string()),
		}
	}

	/// Examines every pending record once.
	#[instrument(skip_all)]
	pub async fn run_pass(&self) -> Result<ReconcileReport, LedgerError> {
		let pending = self.ledger.pending().await?;
		let now = current_timestamp();
		let mut report = ReconcileReport {
			examined: pending.len(),
			..Default::default()
		};

		for record in pending {
			let outcome = match self.decide(&record, now).await {
				Ok(Action::Wait) => {
					report.still_pending += 1;
					continue;
				},
				Ok(Action::Resolve(outcome)) => outcome,
				Err(e) => {
					warn!(record_id = %truncate_id(&record.id), error = %e, "Receipt lookup failed");
					report.errors += 1;
					continue;
				},
			};

			match self.ledger.resolve(&record.id, &outcome).await {
				Ok(Resolution::Completed) => report.completed += 1,
				Ok(Resolution::Failed) => report.failed += 1,
				Ok(Resolution::StillPending) => report.still_pending += 1,
				// Resolved by its own request in the meantime.
				Ok(Resolution::AlreadyResolved) => {},
				Err(e) => {
					warn!(record_id = %truncate_id(&record.id), error = %e, "Failed to resolve record");
					report.errors += 1;
				},
			}
		}

		if let Err(e) = self.ledger.prune_authorizations(now).await {
			warn!(error = %e, "Failed to prune expired authorizations");
		}

		if report.examined > 0 {
			info!(
				examined = report.examined,
				completed = report.completed,
				failed = report.failed,
				still_pending = report.still_pending,
				errors = report.errors,
				"Reconciliation pass finished"
			);
		} else {
			debug!("No pending records");
		}
		Ok(report)
	}

	/// Runs a pass every `interval` until `shutdown` flips to true.
	pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = ticker.tick() => {
					if let Err(e) = self.run_pass().await {
						warn!(error = %e, "Reconciliation pass failed");
					}
				}
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						info!("Reconciliation loop stopped");
						return;
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::tests::{insert, ledger};
	use alloy_primitives::{Address, TxHash, U256};
	use bookmarket_account::implementations::local::LocalAccount;
	use bookmarket_account::AccountService;
	use bookmarket_delivery::implementations::simulated::SimulatedChain;
	use bookmarket_delivery::FeeEstimator;
	use bookmarket_types::{
		Counterparties, FeeBounds, PreparedCall, SecretString, TransactionKind, TransactionStatus,
		GWEI,
	};

	const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

	fn delivery(chain: Arc<SimulatedChain>) -> Arc<DeliveryService> {
		let fees = Arc::new(FeeEstimator::new(
			chain.clone(),
			FeeBounds::default(),
			20 * GWEI,
			Duration::from_secs(60),
		));
		Arc::new(DeliveryService::new(
			chain,
			fees,
			1337,
			2_000_000,
			Duration::from_millis(5),
		))
	}

	fn parties() -> Counterparties {
		Counterparties {
			payer: Address::repeat_byte(1),
			payee: None,
		}
	}

	async fn aged_record(
		ledger: &LedgerReconciler,
		hash: Option<TxHash>,
		age_secs: u64,
	) -> String {
		let mut record = TransactionRecord::pending(
			TransactionKind::Purchase,
			parties(),
			U256::from(1u64),
			None,
			current_timestamp() - age_secs,
		);
		record.hash = hash;
		record.submitted_at = hash.map(|_| record.created_at);
		insert(ledger, &record).await;
		record.id
	}

	#[tokio::test]
	async fn test_pass_resolves_timed_out_transaction() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777));
		let delivery = delivery(chain.clone());
		let account = AccountService::new(Box::new(LocalAccount::new(&SecretString::from(KEY)).unwrap()));
		let call = PreparedCall::new(
			"purchaseBook",
			Address::repeat_byte(0x42),
			account.address().await.unwrap(),
			U256::ZERO,
			vec![1, 2, 3, 4].into(),
		);
		let broadcast = delivery.broadcast(call, &account).await.unwrap();

		let ledger = Arc::new(ledger());
		let id = aged_record(&ledger, Some(broadcast.hash), 300).await;

		let service = ReconciliationService::new(
			ledger.clone(),
			delivery,
			Duration::from_secs(120),
			Duration::from_secs(86_400),
		);
		let report = service.run_pass().await.unwrap();
		assert_eq!(report.completed, 1);

		let record = ledger.get(&id).await.unwrap();
		assert_eq!(record.status, TransactionStatus::Completed);
		assert!(record.block_number.is_some());
	}

	#[tokio::test]
	async fn test_young_records_are_left_alone() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777).never_confirm());
		let ledger = Arc::new(ledger());
		let id = aged_record(&ledger, Some(TxHash::repeat_byte(3)), 10).await;

		let service = ReconciliationService::new(
			ledger.clone(),
			delivery(chain),
			Duration::from_secs(120),
			Duration::from_secs(86_400),
		);
		service.run_pass().await.unwrap();
		assert_eq!(ledger.get(&id).await.unwrap().status, TransactionStatus::Pending);
	}

	#[tokio::test]
	async fn test_abandoned_and_never_broadcast_records_fail() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777).never_confirm());
		let ledger = Arc::new(ledger());
		let lost = aged_record(&ledger, Some(TxHash::repeat_byte(4)), 100_000).await;
		let unsent = aged_record(&ledger, None, 300).await;
		let waiting = aged_record(&ledger, Some(TxHash::repeat_byte(5)), 300).await;

		let service = ReconciliationService::new(
			ledger.clone(),
			delivery(chain),
			Duration::from_secs(120),
			Duration::from_secs(86_400),
		);
		service.run_pass().await.unwrap();

		let lost = ledger.get(&lost).await.unwrap();
		assert_eq!(lost.status, TransactionStatus::Failed);
		assert_eq!(lost.hash, Some(TxHash::repeat_byte(4)));

		let unsent = ledger.get(&unsent).await.unwrap();
		assert_eq!(unsent.status, TransactionStatus::Failed);
		assert!(unsent.failure_reason.unwrap().contains("never broadcast"));

		assert_eq!(ledger.get(&waiting).await.unwrap().status, TransactionStatus::Pending);
	}

	#[tokio::test]
	async fn test_pass_prunes_expired_authorizations() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777));
		let ledger = Arc::new(ledger());
		let now = current_timestamp();
		ledger.consume_authorization("0xold", now - 10).await.unwrap();
		ledger.consume_authorization("0xlive", now + 300).await.unwrap();

		let service = ReconciliationService::new(
			ledger.clone(),
			delivery(chain),
			Duration::from_secs(120),
			Duration::from_secs(86_400),
		);
		service.run_pass().await.unwrap();

		assert!(ledger.consume_authorization("0xold", now - 10).await.unwrap());
		assert!(!ledger.consume_authorization("0xlive", now + 300).await.unwrap());
	}

	#[tokio::test]
	async fn test_unreachable_chain_counts_errors() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777));
		chain.set_reachable(false);
		let ledger = Arc::new(ledger());
		aged_record(&ledger, Some(TxHash::repeat_byte(6)), 300).await;

		let service = ReconciliationService::new(
			ledger,
			delivery(chain),
			Duration::from_secs(120),
			Duration::from_secs(86_400),
		);
		let report = service.run_pass().await.unwrap();
		assert_eq!(report.errors, 1);
	}

	#[tokio::test]
	async fn test_run_stops_on_shutdown() {
		let chain = Arc::new(SimulatedChain::new(1337, 5777));
		let service = Arc::new(ReconciliationService::new(
			Arc::new(ledger()),
			delivery(chain),
			Duration::from_secs(120),
			Duration::from_secs(86_400),
		));
		let (tx, rx) = watch::channel(false);

		let handle = {
			let service = service.clone();
			tokio::spawn(async move { service.run(Duration::from_millis(10), rx).await })
		};
		tokio::time::sleep(Duration::from_millis(30)).await;
		tx.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.unwrap()
			.unwrap();
	}
}
