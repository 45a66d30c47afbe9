// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Payment-side primitives and the outgoing payment engine.

pub mod msgs;
pub mod onion_utils;
pub mod outbound_payment;
pub mod payment_master;

use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256::Hash as Sha256;

/// payment_hash type, use to cross-lock hop
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub struct PaymentHash(pub [u8; 32]);
/// payment_preimage type, use to route payment between hop
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentPreimage(pub [u8; 32]);
/// payment_secret type, use to authenticate sender to the receiver and tie MPP HTLCs together
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentSecret(pub [u8; 32]);

impl PaymentPreimage {
	/// The hash a preimage settles.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(Sha256::hash(&self.0).to_byte_array())
	}
}

/// The funding-derived identifier of one local channel.
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ChannelId(pub [u8; 32]);

/// Why an outbound payment exists. The scope keeps retries of a locally
/// initiated send distinct from a payment we relay on someone's behalf, even
/// when both share a payment hash.
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub enum PaymentTagScope {
	/// A payment initiated by this node.
	LocalSend,
	/// A payment relayed for a trampoline peer.
	TrampolineRouted,
}

/// Uniquely keys one outbound payment across all of its retries.
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct FullPaymentTag {
	/// The hash every shard of the payment settles against.
	pub payment_hash: PaymentHash,
	/// The secret carried in final onion payloads.
	pub payment_secret: PaymentSecret,
	/// See [`PaymentTagScope`].
	pub scope: PaymentTagScope,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn preimage_hashes_to_payment_hash() {
		let preimage = PaymentPreimage([42; 32]);
		assert_eq!(preimage.payment_hash(), preimage.payment_hash());
		assert_ne!(preimage.payment_hash().0, preimage.0);
	}
}
