//! Personal-message signature checks used as an authorization gate.
//!
//! Verification never errors: anything that cannot be parsed or recovered is
//! simply "not signed by this address".

use alloy_primitives::{Address, Signature};
use bookmarket_types::{truncate_id, without_0x_prefix};
use tracing::debug;

/// Length of an `r || s || v` signature.
const SIGNATURE_LEN: usize = 65;

#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureVerifier;

impl SignatureVerifier {
	pub fn new() -> Self {
		Self
	}

	/// True when `signature` (hex, with or without `0x`) over `message` was
	/// produced by `claimed_address`. Addresses compare case-insensitively.
	pub fn verify(&self, message: &str, signature: &str, claimed_address: &str) -> bool {
		let Ok(bytes) = hex::decode(without_0x_prefix(signature.trim())) else {
			debug!("Signature is not valid hex");
			return false;
		};
		self.verify_bytes(message.as_bytes(), &bytes, claimed_address)
	}

	/// Byte-level variant of [`verify`](Self::verify).
	pub fn verify_bytes(&self, message: &[u8], signature: &[u8], claimed_address: &str) -> bool {
		let Some(claimed) = parse_address(claimed_address) else {
			debug!(claimed = %claimed_address, "Claimed address is malformed");
			return false;
		};

		match recover(message, signature) {
			Some(signer) => {
				let matches = signer == claimed;
				if !matches {
					debug!(
						recovered = %truncate_id(&signer.to_string()),
						claimed = %truncate_id(&claimed.to_string()),
						"Signature recovered to a different address"
					);
				}
				matches
			},
			None => false,
		}
	}
}

/// Parses an address ignoring case, so EIP-55 checksums are neither required
/// nor enforced.
fn parse_address(text: &str) -> Option<Address> {
	let lower = without_0x_prefix(text.trim()).to_ascii_lowercase();
	if lower.len() != 40 {
		return None;
	}
	lower.parse().ok()
}

fn recover(message: &[u8], signature: &[u8]) -> Option<Address> {
	if signature.len() != SIGNATURE_LEN {
		return None;
	}
	// Only the two plain encodings of the recovery id are accepted. The parser
	// also folds EIP-155 style values onto a parity bit, which would let a
	// corrupted `v` recover the same signer.
	if !matches!(signature[64], 0 | 1 | 27 | 28) {
		return None;
	}
	let signature = Signature::from_raw(signature).ok()?;
	signature.recover_address_from_msg(message).ok()
}
