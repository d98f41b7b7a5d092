//! Orchestration for the book marketplace.
//!
//! Ties the chain-facing crates together: the network guard runs before
//! anything else, the engine executes signed user actions against the
//! marketplace contract, and the ledger keeps an off-chain record of every
//! value-moving transaction in step with what the chain reports.

pub mod auth;
pub mod builder;
pub mod content;
pub mod engine;
pub mod guard;
pub mod ledger;
pub mod recovery;

pub use auth::{Action, ActionMessage, Capability, Identity};
pub use builder::{BuilderError, MarketBuilder, MarketFactories};
pub use content::{ContentError, ContentPolicy, ContentService};
pub use engine::{
	ActionError, ActionReceipt, ListingRequest, MarketEngine, PurchaseRequest, TransactionView,
	WithdrawalRequest,
};
pub use guard::{GuardError, NetworkGuard, VerifiedNetwork};
pub use ledger::{LedgerError, LedgerReconciler, Resolution};
pub use recovery::{ReconcileReport, ReconciliationService};
