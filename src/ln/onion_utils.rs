// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Sphinx construction for outgoing payments: per-hop key derivation, payload
//! TLV assembly, fixed-size packet wrapping, and the reverse path, decrypting
//! BOLT 4 failure onions to learn which hop failed and why.

use bitcoin::hashes::hmac::{Hmac, HmacEngine};
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::{self, PublicKey, Scalar, Secp256k1, SecretKey};

use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::ChaCha20Legacy;

use crate::ln::msgs::FailureMessage;
use crate::ln::{PaymentHash, PaymentSecret};
use crate::routing::router::Route;
use crate::util::ser::{write_bigsize, write_tlv, write_tu32, write_tu64, write_u64, Cursor};

/// A payment onion is always this large on the wire.
pub const PAYMENT_PACKET_LEN: usize = 1300;
/// A trampoline onion rides inside a payment onion and is this large.
pub const TRAMPOLINE_PACKET_LEN: usize = 400;

/// amt_to_forward
pub const TLV_AMT_TO_FORWARD: u64 = 2;
/// outgoing_cltv_value
pub const TLV_OUTGOING_CLTV: u64 = 4;
/// short_channel_id to forward over
pub const TLV_OUTGOING_CHANNEL_ID: u64 = 6;
/// payment_data: payment secret and total amount
pub const TLV_PAYMENT_DATA: u64 = 8;
/// encrypted_recipient_data for blinded tails
pub const TLV_ENCRYPTED_RECIPIENT_DATA: u64 = 10;
/// blinding point for blinded tails
pub const TLV_BLINDING_POINT: u64 = 12;
/// payment_metadata
pub const TLV_PAYMENT_METADATA: u64 = 16;
/// invoice features, forwarded to a trampoline relay
pub const TLV_INVOICE_FEATURES: u64 = 66097;
/// final recipient node id, forwarded to a trampoline relay
pub const TLV_OUTGOING_NODE_ID: u64 = 66098;
/// invoice routing hints, forwarded to a trampoline relay
pub const TLV_INVOICE_ROUTING_INFO: u64 = 66099;
/// the inner trampoline onion
pub const TLV_TRAMPOLINE_ONION: u64 = 66100;
/// keysend preimage
pub const TLV_KEYSEND: u64 = 5482373484;

/// Errors while assembling an onion.
#[derive(Debug, PartialEq, Eq)]
pub enum OnionBuildError {
	/// The hop payloads do not fit the fixed packet size.
	TooBigPacket,
	/// Key blinding ran into an invalid scalar, which means the RNG output
	/// was degenerate.
	Crypto(secp256k1::Error),
}

impl From<secp256k1::Error> for OnionBuildError {
	fn from(e: secp256k1::Error) -> Self {
		OnionBuildError::Crypto(e)
	}
}

/// Keying material for one hop of an onion.
pub struct OnionKeys {
	/// The blinded ephemeral key the hop will see.
	pub ephemeral_pubkey: PublicKey,
	/// The ECDH secret shared with the hop.
	pub shared_secret: [u8; 32],
	pub(crate) rho: [u8; 32],
	pub(crate) mu: [u8; 32],
}

/// A fully wrapped onion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionPacket {
	/// Always zero for now.
	pub version: u8,
	/// The blinded session key the first hop unwraps against.
	pub public_key: PublicKey,
	/// The encrypted hop data, [`PAYMENT_PACKET_LEN`] minus framing bytes of it.
	pub hop_data: Vec<u8>,
	/// HMAC over the hop data and associated data.
	pub hmac: [u8; 32],
}

impl OnionPacket {
	/// The packet's wire form, e.g. for embedding a trampoline onion as a TLV
	/// value inside an outer payload.
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(66 + self.hop_data.len());
		buf.push(self.version);
		buf.extend_from_slice(&self.public_key.serialize());
		buf.extend_from_slice(&self.hop_data);
		buf.extend_from_slice(&self.hmac);
		buf
	}
}

/// An onion packet together with the per-hop shared secrets needed to read
/// failure onions coming back along the same path.
#[derive(Clone, Debug)]
pub struct PacketAndSecrets {
	/// The packet to put into `update_add_htlc`.
	pub packet: OnionPacket,
	/// Shared secret and node id per hop, in forwarding order.
	pub shared_secrets: Vec<([u8; 32], PublicKey)>,
}

fn hmac_with_label(label: &[u8], shared_secret: &[u8]) -> [u8; 32] {
	let mut hmac = HmacEngine::<Sha256>::new(label);
	hmac.input(shared_secret);
	Hmac::from_engine(hmac).to_byte_array()
}

pub(crate) fn gen_rho_mu_from_shared_secret(shared_secret: &[u8]) -> ([u8; 32], [u8; 32]) {
	(hmac_with_label(b"rho", shared_secret), hmac_with_label(b"mu", shared_secret))
}

pub(crate) fn gen_um_from_shared_secret(shared_secret: &[u8]) -> [u8; 32] {
	hmac_with_label(b"um", shared_secret)
}

pub(crate) fn gen_ammag_from_shared_secret(shared_secret: &[u8]) -> [u8; 32] {
	hmac_with_label(b"ammag", shared_secret)
}

fn chacha_stream(key: &[u8; 32], len: usize) -> Vec<u8> {
	let mut cipher = ChaCha20Legacy::new(key.into(), &[0u8; 8].into());
	let mut out = vec![0u8; len];
	cipher.apply_keystream(&mut out);
	out
}

/// Derives the per-hop keys for a path, blinding the ephemeral key at every
/// hop so no two hops can link themselves by it.
pub fn construct_onion_keys<C: secp256k1::Signing>(
	secp_ctx: &Secp256k1<C>, path: &[PublicKey], session_priv: &SecretKey,
) -> Result<Vec<OnionKeys>, secp256k1::Error> {
	let mut keys = Vec::with_capacity(path.len());
	let mut blinded_priv = *session_priv;
	let mut blinded_pub = PublicKey::from_secret_key(secp_ctx, &blinded_priv);
	for hop_pubkey in path {
		let shared_secret = SharedSecret::new(hop_pubkey, &blinded_priv).secret_bytes();
		let (rho, mu) = gen_rho_mu_from_shared_secret(&shared_secret);
		keys.push(OnionKeys { ephemeral_pubkey: blinded_pub, shared_secret, rho, mu });

		let mut sha = Sha256::engine();
		sha.input(&blinded_pub.serialize());
		sha.input(&shared_secret);
		let blinding_factor = Sha256::from_engine(sha).to_byte_array();
		let scalar = Scalar::from_be_bytes(blinding_factor).map_err(|_| secp256k1::Error::InvalidTweak)?;
		blinded_priv = blinded_priv.mul_tweak(&scalar)?;
		blinded_pub = PublicKey::from_secret_key(secp_ctx, &blinded_priv);
	}
	Ok(keys)
}

/// The decrypted contents of one hop's payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HopPayload {
	/// Instructions for a transit node.
	Relay {
		/// The channel to forward over.
		short_channel_id: u64,
		/// The amount to forward, in milli-satoshi.
		amt_to_forward_msat: u64,
		/// The CLTV the outgoing HTLC must carry.
		outgoing_cltv: u32,
	},
	/// The payload for the payment's recipient.
	Final {
		/// This shard's amount, in milli-satoshi.
		amt_msat: u64,
		/// The CLTV of the delivered HTLC.
		cltv_expiry: u32,
		/// The payment secret tying shards together. For trampoline outer
		/// onions this is a throwaway secret, never the invoice one.
		payment_secret: PaymentSecret,
		/// The whole payment's amount across shards, in milli-satoshi.
		total_msat: u64,
		/// Opaque metadata the recipient asked to be echoed back.
		payment_metadata: Option<Vec<u8>>,
		/// Additional records, e.g. the trampoline onion and invoice details.
		extra_tlvs: Vec<(u64, Vec<u8>)>,
	},
}

impl HopPayload {
	/// Encodes the payload as a length-prefixed TLV stream, records sorted by
	/// type as TLV streams require.
	pub fn encode(&self) -> Vec<u8> {
		let mut records: Vec<(u64, Vec<u8>)> = Vec::new();
		match self {
			HopPayload::Relay { short_channel_id, amt_to_forward_msat, outgoing_cltv } => {
				let mut amt = Vec::new();
				write_tu64(&mut amt, *amt_to_forward_msat);
				records.push((TLV_AMT_TO_FORWARD, amt));
				let mut cltv = Vec::new();
				write_tu32(&mut cltv, *outgoing_cltv);
				records.push((TLV_OUTGOING_CLTV, cltv));
				let mut scid = Vec::new();
				write_u64(&mut scid, *short_channel_id);
				records.push((TLV_OUTGOING_CHANNEL_ID, scid));
			},
			HopPayload::Final {
				amt_msat, cltv_expiry, payment_secret, total_msat, payment_metadata, extra_tlvs,
			} => {
				let mut amt = Vec::new();
				write_tu64(&mut amt, *amt_msat);
				records.push((TLV_AMT_TO_FORWARD, amt));
				let mut cltv = Vec::new();
				write_tu32(&mut cltv, *cltv_expiry);
				records.push((TLV_OUTGOING_CLTV, cltv));
				let mut payment_data = Vec::new();
				payment_data.extend_from_slice(&payment_secret.0);
				write_tu64(&mut payment_data, *total_msat);
				records.push((TLV_PAYMENT_DATA, payment_data));
				if let Some(metadata) = payment_metadata {
					records.push((TLV_PAYMENT_METADATA, metadata.clone()));
				}
				records.extend(extra_tlvs.iter().cloned());
			},
		}
		records.sort_by_key(|(typ, _)| *typ);
		let mut stream = Vec::new();
		for (typ, value) in records {
			write_tlv(&mut stream, typ, &value);
		}
		let mut out = Vec::with_capacity(stream.len() + 3);
		write_bigsize(&mut out, stream.len() as u64);
		out.extend_from_slice(&stream);
		out
	}
}

/// Builds per-hop payloads for a route, accumulating fees and CLTV deltas
/// backwards from the payee. Returns the amount and expiry the first HTLC
/// must carry along with the encoded payloads, one per hop.
pub fn build_payment_payloads(
	route: &Route, final_amount_msat: u64, final_cltv_expiry: u32, payment_secret: PaymentSecret,
	total_msat: u64, payment_metadata: Option<Vec<u8>>, extra_tlvs: Vec<(u64, Vec<u8>)>,
) -> (u64, u32, Vec<Vec<u8>>) {
	let final_payload = HopPayload::Final {
		amt_msat: final_amount_msat,
		cltv_expiry: final_cltv_expiry,
		payment_secret,
		total_msat,
		payment_metadata,
		extra_tlvs,
	};
	let mut amount_msat = final_amount_msat;
	let mut cltv_expiry = final_cltv_expiry;
	let mut payloads = vec![final_payload.encode()];
	// Our own channel charges us nothing, so the first edge adds no fee.
	for edge in route.hops.iter().skip(1).rev() {
		let relay = HopPayload::Relay {
			short_channel_id: edge.desc.short_channel_id,
			amt_to_forward_msat: amount_msat,
			outgoing_cltv: cltv_expiry,
		};
		payloads.insert(0, relay.encode());
		amount_msat += edge.fee_msat(amount_msat);
		cltv_expiry += edge.update.cltv_expiry_delta as u32;
	}
	(amount_msat, cltv_expiry, payloads)
}

fn generate_filler(packet_len: usize, payloads: &[Vec<u8>], onion_keys: &[OnionKeys]) -> Vec<u8> {
	let mut filler: Vec<u8> = Vec::new();
	for (payload, keys) in payloads.iter().zip(onion_keys.iter()).take(payloads.len().saturating_sub(1)) {
		let fill = payload.len() + 32;
		filler.resize(filler.len() + fill, 0);
		let stream = chacha_stream(&keys.rho, packet_len + fill);
		let tail = &stream[stream.len() - filler.len()..];
		for (byte, pad) in filler.iter_mut().zip(tail.iter()) {
			*byte ^= *pad;
		}
	}
	filler
}

/// Wraps encoded payloads into a fixed-size onion packet.
pub fn construct_onion_packet(
	payloads: Vec<Vec<u8>>, onion_keys: Vec<OnionKeys>, prng_seed: [u8; 32],
	associated_data: &PaymentHash, packet_len: usize,
) -> Result<OnionPacket, OnionBuildError> {
	debug_assert_eq!(payloads.len(), onion_keys.len());
	let payloads_total: usize = payloads.iter().map(|p| p.len() + 32).sum();
	if payloads_total > packet_len {
		return Err(OnionBuildError::TooBigPacket);
	}

	// Unused space must look random to every hop.
	let mut packet_data = chacha_stream(&prng_seed, packet_len);
	let filler = generate_filler(packet_len, &payloads, &onion_keys);

	let mut hmac_result = [0u8; 32];
	for (i, (payload, keys)) in payloads.iter().zip(onion_keys.iter()).enumerate().rev() {
		let shift = payload.len() + 32;
		let mut shifted = Vec::with_capacity(packet_len);
		shifted.extend_from_slice(payload);
		shifted.extend_from_slice(&hmac_result);
		shifted.extend_from_slice(&packet_data[..packet_len - shift]);
		packet_data = shifted;

		let mut cipher = ChaCha20Legacy::new((&keys.rho).into(), &[0u8; 8].into());
		cipher.apply_keystream(&mut packet_data);

		if i == payloads.len() - 1 {
			let tail_at = packet_len - filler.len();
			packet_data[tail_at..].copy_from_slice(&filler);
		}

		let mut hmac = HmacEngine::<Sha256>::new(&keys.mu);
		hmac.input(&packet_data);
		hmac.input(&associated_data.0);
		hmac_result = Hmac::from_engine(hmac).to_byte_array();
	}

	Ok(OnionPacket {
		version: 0,
		public_key: onion_keys[0].ephemeral_pubkey,
		hop_data: packet_data,
		hmac: hmac_result,
	})
}

/// Derives keys and wraps payloads for `route` in one go, producing the
/// packet for the first HTLC plus the secrets needed to read failures.
pub fn create_payment_packet<C: secp256k1::Signing>(
	secp_ctx: &Secp256k1<C>, session_priv: &SecretKey, route: &Route, payloads: Vec<Vec<u8>>,
	prng_seed: [u8; 32], payment_hash: &PaymentHash,
) -> Result<PacketAndSecrets, OnionBuildError> {
	let path: Vec<PublicKey> = route.hops.iter().map(|edge| edge.desc.to).collect();
	let onion_keys = construct_onion_keys(secp_ctx, &path, session_priv)?;
	let shared_secrets = onion_keys
		.iter()
		.zip(path.iter())
		.map(|(keys, node_id)| (keys.shared_secret, *node_id))
		.collect();
	let packet = construct_onion_packet(payloads, onion_keys, prng_seed, payment_hash, PAYMENT_PACKET_LEN)?;
	Ok(PacketAndSecrets { packet, shared_secrets })
}

/// Wraps payloads for a trampoline path into the small inner onion carried
/// inside an outer payment onion's [`TLV_TRAMPOLINE_ONION`] record. The
/// session key must be distinct from the outer onion's, and the final payload
/// carries a throwaway outer secret rather than the invoice secret.
pub fn create_trampoline_packet<C: secp256k1::Signing>(
	secp_ctx: &Secp256k1<C>, session_priv: &SecretKey, path: &[PublicKey], payloads: Vec<Vec<u8>>,
	prng_seed: [u8; 32], payment_hash: &PaymentHash,
) -> Result<PacketAndSecrets, OnionBuildError> {
	let onion_keys = construct_onion_keys(secp_ctx, path, session_priv)?;
	let shared_secrets = onion_keys
		.iter()
		.zip(path.iter())
		.map(|(keys, node_id)| (keys.shared_secret, *node_id))
		.collect();
	let packet =
		construct_onion_packet(payloads, onion_keys, prng_seed, payment_hash, TRAMPOLINE_PACKET_LEN)?;
	Ok(PacketAndSecrets { packet, shared_secrets })
}

/// The outcome of successfully decrypting a failure onion.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFailurePacket {
	/// The hop that generated the failure.
	pub origin_node_id: PublicKey,
	/// What it had to say.
	pub failure: FailureMessage,
}

/// Peels a returned failure onion with the shared secrets of the path the
/// HTLC took. Each transit hop has wrapped the packet in its `ammag` stream;
/// the layer whose `um` HMAC verifies identifies the failing hop. An
/// unattributable packet yields `Err`.
pub fn process_onion_failure(
	shared_secrets: &[([u8; 32], PublicKey)], packet: &[u8],
) -> Result<DecodedFailurePacket, ()> {
	let mut data = packet.to_vec();
	for (shared_secret, node_id) in shared_secrets {
		let ammag = gen_ammag_from_shared_secret(shared_secret);
		let mut cipher = ChaCha20Legacy::new((&ammag).into(), &[0u8; 8].into());
		cipher.apply_keystream(&mut data);

		if data.len() < 34 {
			return Err(());
		}
		let um = gen_um_from_shared_secret(shared_secret);
		let mut hmac = HmacEngine::<Sha256>::new(&um);
		hmac.input(&data[32..]);
		let tag = Hmac::from_engine(hmac).to_byte_array();
		if tag == data[..32] {
			let mut cursor = Cursor::new(&data[32..]);
			let failure_len = cursor.read_u16().map_err(|_| ())? as usize;
			let failure_bytes = cursor.read_bytes(failure_len).map_err(|_| ())?;
			let failure = FailureMessage::decode(failure_bytes).map_err(|_| ())?;
			return Ok(DecodedFailurePacket { origin_node_id: *node_id, failure });
		}
	}
	Err(())
}

#[cfg(test)]
pub(crate) fn build_failure_packet(shared_secret: &[u8; 32], failure: &FailureMessage) -> Vec<u8> {
	let msg = failure.encode();
	assert!(msg.len() <= 256);
	let pad_len = 256 - msg.len();
	let mut body = Vec::with_capacity(260);
	crate::util::ser::write_u16(&mut body, msg.len() as u16);
	body.extend_from_slice(&msg);
	crate::util::ser::write_u16(&mut body, pad_len as u16);
	body.resize(body.len() + pad_len, 0);

	let um = gen_um_from_shared_secret(shared_secret);
	let mut hmac = HmacEngine::<Sha256>::new(&um);
	hmac.input(&body);
	let tag = Hmac::from_engine(hmac).to_byte_array();

	let mut packet = Vec::with_capacity(32 + body.len());
	packet.extend_from_slice(&tag);
	packet.extend_from_slice(&body);
	packet
}

#[cfg(test)]
pub(crate) fn encrypt_failure_packet(shared_secrets: &[[u8; 32]], packet: &[u8]) -> Vec<u8> {
	// The origin obfuscates first, then every node back towards us wraps the
	// packet in its own stream; we therefore apply the streams in reverse.
	let mut data = packet.to_vec();
	for shared_secret in shared_secrets.iter().rev() {
		let ammag = gen_ammag_from_shared_secret(shared_secret);
		let mut cipher = ChaCha20Legacy::new((&ammag).into(), &[0u8; 8].into());
		cipher.apply_keystream(&mut data);
	}
	data
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::routing::router::Route;
	use crate::util::test_utils;
	use bitcoin::secp256k1::ecdh::SharedSecret;

	fn test_route(hop_keys: &[u8]) -> (Route, Vec<SecretKey>) {
		let (_, us) = test_utils::test_key(200);
		let mut prev = us;
		let mut hops = Vec::new();
		let mut secrets = Vec::new();
		for (i, seed) in hop_keys.iter().enumerate() {
			let (secret, node) = test_utils::test_key(*seed);
			hops.push(test_utils::graph_edge(i as u64 + 1, prev, node, 10_000_000_000));
			secrets.push(secret);
			prev = node;
		}
		(Route { hops }, secrets)
	}

	#[test]
	fn onion_keys_match_each_hops_view() {
		let secp_ctx = Secp256k1::new();
		let (route, hop_secrets) = test_route(&[1, 2, 3]);
		let (session_priv, _) = test_utils::test_key(42);
		let path: Vec<PublicKey> = route.hops.iter().map(|edge| edge.desc.to).collect();
		let keys = construct_onion_keys(&secp_ctx, &path, &session_priv).unwrap();
		assert_eq!(keys.len(), 3);
		// Every hop derives the same secret from the blinded ephemeral key it
		// sees and its own node key.
		for (derived, hop_secret) in keys.iter().zip(hop_secrets.iter()) {
			let their_view = SharedSecret::new(&derived.ephemeral_pubkey, hop_secret).secret_bytes();
			assert_eq!(their_view, derived.shared_secret);
		}
		// The blinding must actually change the key between hops.
		assert_ne!(keys[0].ephemeral_pubkey, keys[1].ephemeral_pubkey);
	}

	#[test]
	fn payloads_accumulate_fees_and_cltv_backwards() {
		let (mut route, _) = test_route(&[1, 2, 3]);
		for edge in route.hops.iter_mut() {
			edge.update.fee_base_msat = 1_000;
			edge.update.fee_proportional_millionths = 0;
			edge.update.cltv_expiry_delta = 40;
		}
		let secret = PaymentSecret([9; 32]);
		let (first_amount, first_expiry, payloads) =
			build_payment_payloads(&route, 100_000, 700_000, secret, 100_000, None, Vec::new());
		// Two relaying hops charge a base fee each; our own channel is free.
		assert_eq!(first_amount, 102_000);
		assert_eq!(first_expiry, 700_080);
		assert_eq!(payloads.len(), 3);
	}

	#[test]
	fn packet_has_fixed_size_regardless_of_route_length() {
		let secp_ctx = Secp256k1::new();
		let secret = PaymentSecret([9; 32]);
		for hops in [&[1u8][..], &[1, 2, 3, 4]] {
			let (route, _) = test_route(hops);
			let (session_priv, _) = test_utils::test_key(42);
			let (_, _, payloads) =
				build_payment_payloads(&route, 50_000, 700_000, secret, 50_000, None, Vec::new());
			let packet = create_payment_packet(
				&secp_ctx, &session_priv, &route, payloads, [7; 32], &PaymentHash([1; 32]),
			).unwrap();
			assert_eq!(packet.packet.hop_data.len(), PAYMENT_PACKET_LEN);
			assert_eq!(packet.shared_secrets.len(), hops.len());
		}
	}

	#[test]
	fn trampoline_packet_fits_inside_an_outer_payload() {
		let secp_ctx = Secp256k1::new();
		let (session_priv, _) = test_utils::test_key(43);
		let (_, t1) = test_utils::test_key(44);
		let (_, t2) = test_utils::test_key(45);
		let secret = PaymentSecret([9; 32]);
		let payloads = vec![
			HopPayload::Relay { short_channel_id: 0, amt_to_forward_msat: 1_000, outgoing_cltv: 700_000 }.encode(),
			HopPayload::Final {
				amt_msat: 1_000,
				cltv_expiry: 700_000,
				payment_secret: secret,
				total_msat: 1_000,
				payment_metadata: None,
				extra_tlvs: Vec::new(),
			}.encode(),
		];
		let inner = create_trampoline_packet(
			&secp_ctx, &session_priv, &[t1, t2], payloads, [7; 32], &PaymentHash([1; 32]),
		).unwrap();
		assert_eq!(inner.packet.hop_data.len(), TRAMPOLINE_PACKET_LEN);
		// A trampoline onion plus final-payload overhead stays well inside
		// the outer packet.
		assert!(inner.packet.encode().len() < PAYMENT_PACKET_LEN - 500);
	}

	#[test]
	fn oversized_payloads_are_refused() {
		let (route, _) = test_route(&[1]);
		let secp_ctx = Secp256k1::new();
		let (session_priv, _) = test_utils::test_key(42);
		let payloads = vec![vec![0u8; PAYMENT_PACKET_LEN]];
		let err = create_payment_packet(
			&secp_ctx, &session_priv, &route, payloads, [7; 32], &PaymentHash([1; 32]),
		).unwrap_err();
		assert_eq!(err, OnionBuildError::TooBigPacket);
	}

	#[test]
	fn failure_onion_points_at_the_failing_hop() {
		let secp_ctx = Secp256k1::new();
		let (route, _) = test_route(&[1, 2, 3, 4]);
		let (session_priv, _) = test_utils::test_key(42);
		let path: Vec<PublicKey> = route.hops.iter().map(|edge| edge.desc.to).collect();
		let keys = construct_onion_keys(&secp_ctx, &path, &session_priv).unwrap();
		let shared_secrets: Vec<([u8; 32], PublicKey)> =
			keys.iter().zip(path.iter()).map(|(k, n)| (k.shared_secret, *n)).collect();

		// The third hop fails the payment.
		let origin_index = 2;
		let plain = build_failure_packet(&shared_secrets[origin_index].0, &FailureMessage::PermanentChannelFailure);
		let raw_secrets: Vec<[u8; 32]> =
			shared_secrets[..=origin_index].iter().map(|(ss, _)| *ss).collect();
		let encrypted = encrypt_failure_packet(&raw_secrets, &plain);

		let decoded = process_onion_failure(&shared_secrets, &encrypted).unwrap();
		assert_eq!(decoded.origin_node_id, path[origin_index]);
		assert_eq!(decoded.failure, FailureMessage::PermanentChannelFailure);
	}

	#[test]
	fn garbage_failure_onion_is_unattributable() {
		let secp_ctx = Secp256k1::new();
		let (route, _) = test_route(&[1, 2]);
		let (session_priv, _) = test_utils::test_key(42);
		let path: Vec<PublicKey> = route.hops.iter().map(|edge| edge.desc.to).collect();
		let keys = construct_onion_keys(&secp_ctx, &path, &session_priv).unwrap();
		let shared_secrets: Vec<([u8; 32], PublicKey)> =
			keys.iter().zip(path.iter()).map(|(k, n)| (k.shared_secret, *n)).collect();
		assert!(process_onion_failure(&shared_secrets, &[0u8; 292]).is_err());
	}
}
