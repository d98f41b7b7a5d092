//! Shared types for the book marketplace transaction orchestrator.
//!
//! Value objects passed between the chain client, the submitter, the contract
//! binding and the ledger live here so that no crate has to depend on another
//! just to name a type.

/// Encoded contract calls.
pub mod call;
/// Ledger records and their lifecycle.
pub mod ledger;
/// Network profile and fee bounds.
pub mod network;
/// Outcome of on-chain actions.
pub mod outcome;
/// Implementation registration.
pub mod registry;
/// Redacted secret strings.
pub mod secret_string;
/// Storage namespaces.
pub mod storage;
/// Keyed async locks.
pub mod sync;
pub mod utils;
/// Configuration schema checks.
pub mod validation;

pub use call::PreparedCall;
pub use ledger::*;
pub use network::{FeeBounds, NetworkProfile, GWEI};
pub use outcome::TxOutcome;
pub use registry::ImplementationRegistry;
pub use secret_string::SecretString;
pub use storage::StorageKey;
pub use sync::{KeyedGuard, KeyedLocks};
pub use utils::{current_timestamp, truncate_id, with_0x_prefix, without_0x_prefix};
pub use validation::*;
