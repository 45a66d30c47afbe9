// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire-level types the core consumes. The Noise transport parses and frames
//! messages; what arrives here is already typed. The only byte-level encoding
//! kept in this module is the canonical signed portion of gossip messages
//! (needed to check signatures) and the BOLT 4 failure vocabulary (needed to
//! interpret decrypted failure onions).

use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256d;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{self, Message, PublicKey, Secp256k1, Verification};

use crate::ln::ChannelId;
use crate::util::ser::{write_bigsize, write_u16, write_u32, write_u64, Cursor};

use core::fmt;

/// An error in decoding a message or struct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// A length descriptor in the message was out of bounds for the rest of it.
	ShortRead,
	/// A value was decoded which is invalid in context.
	InvalidValue,
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			DecodeError::ShortRead => f.write_str("message ended unexpectedly"),
			DecodeError::InvalidValue => f.write_str("invalid value in message"),
		}
	}
}

impl From<secp256k1::Error> for DecodeError {
	fn from(_: secp256k1::Error) -> Self {
		DecodeError::InvalidValue
	}
}

macro_rules! feature_flags {
	($name: ident) => {
		impl $name {
			/// No feature bits set.
			pub fn empty() -> Self {
				$name { flags: Vec::new() }
			}

			/// Whether the numbered feature bit is set. Bit 0 lives in the
			/// least significant bit of the last flags byte.
			pub fn has_feature_bit(&self, bit: usize) -> bool {
				let byte = bit / 8;
				if byte >= self.flags.len() {
					return false;
				}
				self.flags[self.flags.len() - 1 - byte] & (1 << (bit % 8)) != 0
			}

			/// Sets the numbered feature bit, growing the field as needed.
			pub fn set_feature_bit(&mut self, bit: usize) {
				let byte = bit / 8;
				if byte >= self.flags.len() {
					let grow_by = byte + 1 - self.flags.len();
					let mut grown = vec![0u8; grow_by];
					grown.extend_from_slice(&self.flags);
					self.flags = grown;
				}
				let len = self.flags.len();
				self.flags[len - 1 - byte] |= 1 << (bit % 8);
			}
		}
	};
}

/// Feature bits a peer advertises in its `init` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitFeatures {
	/// Raw BOLT 9 flags, big-endian bit order.
	pub flags: Vec<u8>,
}

feature_flags!(InitFeatures);

impl InitFeatures {
	/// `gossip_queries_ex`: the peer can serve channel range queries extended
	/// with timestamps and checksums. Peers without it are useless for
	/// cross-validated sync and get evicted.
	pub fn supports_extended_gossip_queries(&self) -> bool {
		self.has_feature_bit(10) || self.has_feature_bit(11)
	}
}

/// Feature bits inside a channel announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelFeatures {
	/// Raw flags, big-endian bit order.
	pub flags: Vec<u8>,
}

feature_flags!(ChannelFeatures);

/// Custom-range feature bit marking a private hosted channel announcement.
pub const HOSTED_CHANNELS_REQUIRED: usize = 32772;
/// Optional counterpart of [`HOSTED_CHANNELS_REQUIRED`].
pub const HOSTED_CHANNELS_OPTIONAL: usize = 32773;

impl ChannelFeatures {
	/// Whether the announced channel is a private hosted channel.
	pub fn supports_hosted_channels(&self) -> bool {
		self.has_feature_bit(HOSTED_CHANNELS_REQUIRED) || self.has_feature_bit(HOSTED_CHANNELS_OPTIONAL)
	}
}

/// An address a node may be reached over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetAddress {
	/// An IPv4 address/port.
	IPv4 {
		/// The 4-byte IPv4 address
		addr: [u8; 4],
		/// The port
		port: u16,
	},
	/// An IPv6 address/port.
	IPv6 {
		/// The 16-byte IPv6 address
		addr: [u8; 16],
		/// The port
		port: u16,
	},
	/// A Tor v3 onion service.
	OnionV3 {
		/// The ed25519 long-term public key of the peer
		ed25519_pubkey: [u8; 32],
		/// The checksum of the pubkey and version
		checksum: u16,
		/// The version byte
		version: u8,
		/// The port
		port: u16,
	},
}

impl NetAddress {
	fn write(&self, buf: &mut Vec<u8>) {
		match self {
			NetAddress::IPv4 { addr, port } => {
				buf.push(1);
				buf.extend_from_slice(addr);
				write_u16(buf, *port);
			},
			NetAddress::IPv6 { addr, port } => {
				buf.push(2);
				buf.extend_from_slice(addr);
				write_u16(buf, *port);
			},
			NetAddress::OnionV3 { ed25519_pubkey, checksum, version, port } => {
				buf.push(4);
				buf.extend_from_slice(ed25519_pubkey);
				write_u16(buf, *checksum);
				buf.push(*version);
				write_u16(buf, *port);
			},
		}
	}
}

/// An init message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Init {
	/// Features the peer supports.
	pub features: InitFeatures,
}

/// Short channel id encoding used inside range queries and their replies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShortIdEncoding {
	/// Plain concatenated 8-byte ids.
	Uncompressed,
	/// Deflate-compressed id array.
	Zlib,
}

/// Ask for timestamps in `reply_channel_range`.
pub const QUERY_FLAG_TIMESTAMPS: u8 = 1;
/// Ask for checksums in `reply_channel_range`.
pub const QUERY_FLAG_CHECKSUMS: u8 = 2;
/// Ask for everything a peer can attach to `reply_channel_range`.
pub const QUERY_FLAG_ALL: u8 = QUERY_FLAG_TIMESTAMPS | QUERY_FLAG_CHECKSUMS;

/// A query_channel_range message is used to query a peer for channel
/// UTXOs in a range of blocks. The recipient of a query makes a best
/// effort to reply to the query using one or more reply_channel_range messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryChannelRange {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// The height of the first block for the channel UTXOs being queried
	pub first_blocknum: u32,
	/// The number of blocks to include in the query results
	pub number_of_blocks: u32,
	/// Extended-query TLV: which per-channel details to attach.
	pub query_flags: Option<u8>,
}

/// Per-direction update timestamps attached to an extended range reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timestamps {
	/// Timestamp of the update for direction one.
	pub timestamp_1: u32,
	/// Timestamp of the update for direction two.
	pub timestamp_2: u32,
}

/// Per-direction update checksums attached to an extended range reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Checksums {
	/// Checksum of the update for direction one.
	pub checksum_1: u32,
	/// Checksum of the update for direction two.
	pub checksum_2: u32,
}

/// One block of a peer's answer to a `query_channel_range`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyChannelRange {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// The height of the first block in the range of the reply
	pub first_blocknum: u32,
	/// The number of blocks included in the range of the reply
	pub number_of_blocks: u32,
	/// True when this is the final reply for a query
	pub sync_complete: bool,
	/// Encoding the ids below arrived in; queries derived from this reply
	/// must use the same one.
	pub encoding: ShortIdEncoding,
	/// The short_channel_ids in the channel range
	pub short_channel_ids: Vec<u64>,
	/// Extended-query TLV: per-channel update timestamps, parallel to the ids.
	pub timestamps: Vec<Timestamps>,
	/// Extended-query TLV: per-channel update checksums, parallel to the ids.
	pub checksums: Vec<Checksums>,
}

impl ReplyChannelRange {
	/// Whether the parallel arrays line up. Replies which do not are damaged
	/// or deceptive and are discarded whole.
	pub fn is_holistic(&self) -> bool {
		self.short_channel_ids.len() == self.timestamps.len()
			&& self.short_channel_ids.len() == self.checksums.len()
	}
}

/// Ask for the `channel_announcement` of a queried id.
pub const INCLUDE_CHANNEL_ANNOUNCEMENT: u8 = 1;
/// Ask for the direction-one `channel_update` of a queried id.
pub const INCLUDE_CHANNEL_UPDATE_1: u8 = 2;
/// Ask for the direction-two `channel_update` of a queried id.
pub const INCLUDE_CHANNEL_UPDATE_2: u8 = 4;
/// Ask for the `node_announcement` of the first endpoint of a queried id.
pub const INCLUDE_NODE_ANNOUNCEMENT_1: u8 = 8;
/// Ask for the `node_announcement` of the second endpoint of a queried id.
pub const INCLUDE_NODE_ANNOUNCEMENT_2: u8 = 16;

/// A query_short_channel_ids message is used to query a peer for
/// routing gossip messages related to one or more short_channel_ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryShortChannelIds {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// Encoding of the id array, mirrored from the source reply.
	pub encoding: ShortIdEncoding,
	/// The short_channel_ids that are being queried
	pub short_channel_ids: Vec<u64>,
	/// Extended-query TLV: per-id `INCLUDE_*` flags, parallel to the ids.
	pub query_flags: Vec<u8>,
}

/// A reply_short_channel_ids_end message is sent as a reply to a
/// query_short_channel_ids message. The query recipient makes a best
/// effort to respond based on their local network view which may not be
/// a perfect view of the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyShortChannelIdsEnd {
	/// The genesis hash of the blockchain that was queried
	pub chain_hash: BlockHash,
	/// Indicates if the query recipient maintains up-to-date channel
	/// information for the chain_hash
	pub full_information: bool,
}

/// Asks a peer for every private hosted channel it knows about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPublicHostedChannels {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
}

/// Terminates a peer's stream of hosted channel gossip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyPublicHostedChannelsEnd {
	/// The genesis hash of the blockchain that was queried
	pub chain_hash: BlockHash,
}

/// The canonical fact that a channel exists between two nodes.
///
/// Announcements received from different peers differ only in signature
/// material, so equality and hashing go by channel identity: the short
/// channel id and both endpoints.
#[derive(Clone, Debug)]
pub struct ChannelAnnouncement {
	/// Authentication of the announcement by the first public node
	pub node_signature_1: Option<Signature>,
	/// Authentication of the announcement by the second public node
	pub node_signature_2: Option<Signature>,
	/// Proof of funding UTXO ownership by the first public node
	pub bitcoin_signature_1: Option<Signature>,
	/// Proof of funding UTXO ownership by the second public node
	pub bitcoin_signature_2: Option<Signature>,
	/// The channel flags, which this channel's feature bits live in
	pub features: ChannelFeatures,
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// The short channel ID
	pub short_channel_id: u64,
	/// One of the two node_ids which are endpoints of this channel
	pub node_id_1: PublicKey,
	/// The other of the two node_ids which are endpoints of this channel
	pub node_id_2: PublicKey,
	/// The funding key for the first node
	pub bitcoin_key_1: Option<PublicKey>,
	/// The funding key for the second node
	pub bitcoin_key_2: Option<PublicKey>,
}

impl PartialEq for ChannelAnnouncement {
	fn eq(&self, other: &Self) -> bool {
		self.short_channel_id == other.short_channel_id
			&& self.node_id_1 == other.node_id_1
			&& self.node_id_2 == other.node_id_2
	}
}

impl Eq for ChannelAnnouncement {}

impl core::hash::Hash for ChannelAnnouncement {
	fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
		self.short_channel_id.hash(state);
		self.node_id_1.hash(state);
		self.node_id_2.hash(state);
	}
}

impl ChannelAnnouncement {
	/// A copy with signature material dropped, which is all the router needs
	/// once admission is decided.
	pub fn lite(&self) -> ChannelAnnouncement {
		ChannelAnnouncement {
			node_signature_1: None,
			node_signature_2: None,
			bitcoin_signature_1: None,
			bitcoin_signature_2: None,
			features: self.features.clone(),
			chain_hash: self.chain_hash,
			short_channel_id: self.short_channel_id,
			node_id_1: self.node_id_1,
			node_id_2: self.node_id_2,
			bitcoin_key_1: None,
			bitcoin_key_2: None,
		}
	}

	/// Whether this announces a private hosted channel.
	pub fn is_phc(&self) -> bool {
		self.features.supports_hosted_channels()
	}
}

/// The policy under which a node relays payments over one direction of a
/// channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUpdate {
	/// A signature of the channel update
	pub signature: Option<Signature>,
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// The short channel ID
	pub short_channel_id: u64,
	/// A strictly monotonic announcement counter, with gossip query support
	/// this also needs to be a valid posix timestamp
	pub timestamp: u32,
	/// Presence flags for optional fields (bit 0: htlc_maximum_msat)
	pub message_flags: u8,
	/// Direction (bit 0) and disable (bit 1) flags
	pub channel_flags: u8,
	/// The number of blocks such that if:
	/// `incoming_htlc.cltv_expiry < outgoing_htlc.cltv_expiry + cltv_expiry_delta`
	/// then we need to fail the HTLC backwards.
	pub cltv_expiry_delta: u16,
	/// The minimum HTLC size incoming to sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The base HTLC fee charged by sender, in milli-satoshi
	pub fee_base_msat: u32,
	/// The amount to fee multiplier, in micro-satoshi
	pub fee_proportional_millionths: u32,
	/// The maximum HTLC value incoming to sender, in milli-satoshi.
	pub htlc_maximum_msat: Option<u64>,
}

/// The policy portion of a [`ChannelUpdate`], identifying a logically equal
/// update regardless of timestamp and signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpdateCore {
	/// Which direction of the channel the update governs, one or two.
	pub position: u8,
	/// The short channel ID
	pub short_channel_id: u64,
	/// The base HTLC fee, in milli-satoshi
	pub fee_base_msat: u32,
	/// The amount to fee multiplier, in micro-satoshi
	pub fee_proportional_millionths: u32,
	/// The relay CLTV delta
	pub cltv_expiry_delta: u16,
	/// The minimum HTLC size, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The maximum HTLC value, in milli-satoshi
	pub htlc_maximum_msat: Option<u64>,
}

impl ChannelUpdate {
	/// Which direction this update governs: one when it is signed by the
	/// lexicographically lesser node id, two otherwise.
	pub fn position(&self) -> u8 {
		if self.channel_flags & 1 == 0 { 1 } else { 2 }
	}

	/// Whether the originator has disabled relaying over this direction.
	pub fn is_disabled(&self) -> bool {
		self.channel_flags & 2 != 0
	}

	/// The policy portion of this update.
	pub fn core(&self) -> UpdateCore {
		UpdateCore {
			position: self.position(),
			short_channel_id: self.short_channel_id,
			fee_base_msat: self.fee_base_msat,
			fee_proportional_millionths: self.fee_proportional_millionths,
			cltv_expiry_delta: self.cltv_expiry_delta,
			htlc_minimum_msat: self.htlc_minimum_msat,
			htlc_maximum_msat: self.htlc_maximum_msat,
		}
	}

	/// A copy with the signature dropped.
	pub fn lite(&self) -> ChannelUpdate {
		ChannelUpdate { signature: None, ..self.clone() }
	}

	/// The canonical bytes the originator signed: every field after the
	/// signature, in wire order.
	pub fn signed_data(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(72);
		buf.extend_from_slice(self.chain_hash.as_ref());
		write_u64(&mut buf, self.short_channel_id);
		write_u32(&mut buf, self.timestamp);
		buf.push(self.message_flags);
		buf.push(self.channel_flags);
		write_u16(&mut buf, self.cltv_expiry_delta);
		write_u64(&mut buf, self.htlc_minimum_msat);
		write_u32(&mut buf, self.fee_base_msat);
		write_u32(&mut buf, self.fee_proportional_millionths);
		if let Some(max) = self.htlc_maximum_msat {
			write_u64(&mut buf, max);
		}
		buf
	}

	/// Checks the update's signature against the claimed originator.
	pub fn verify_signature<C: Verification>(&self, secp_ctx: &Secp256k1<C>, node_id: &PublicKey) -> bool {
		let sig = match self.signature {
			Some(sig) => sig,
			None => return false,
		};
		let digest = sha256d::Hash::hash(&self.signed_data());
		let msg = match Message::from_slice(digest.as_ref()) {
			Ok(msg) => msg,
			Err(_) => return false,
		};
		secp_ctx.verify_ecdsa(&msg, &sig, node_id).is_ok()
	}

	/// Full wire payload, signature included (zeroed when absent). Used for
	/// byte-level comparison against updates carried inside failure onions.
	pub fn write(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(136);
		match self.signature {
			Some(sig) => buf.extend_from_slice(&sig.serialize_compact()),
			None => buf.extend_from_slice(&[0u8; 64]),
		}
		buf.extend_from_slice(&self.signed_data());
		buf
	}

	/// Parses a wire payload produced by [`ChannelUpdate::write`].
	pub fn read(data: &[u8]) -> Result<ChannelUpdate, DecodeError> {
		let mut cursor = Cursor::new(data);
		let sig_bytes = cursor.read_bytes(64)?;
		let signature = if sig_bytes.iter().all(|b| *b == 0) {
			None
		} else {
			Some(Signature::from_compact(sig_bytes)?)
		};
		let chain_hash = BlockHash::from_slice(cursor.read_bytes(32)?).map_err(|_| DecodeError::InvalidValue)?;
		let short_channel_id = cursor.read_u64()?;
		let timestamp = cursor.read_u32()?;
		let message_flags = cursor.read_u8()?;
		let channel_flags = cursor.read_u8()?;
		let cltv_expiry_delta = cursor.read_u16()?;
		let htlc_minimum_msat = cursor.read_u64()?;
		let fee_base_msat = cursor.read_u32()?;
		let fee_proportional_millionths = cursor.read_u32()?;
		let htlc_maximum_msat = if message_flags & 1 != 0 { Some(cursor.read_u64()?) } else { None };
		Ok(ChannelUpdate {
			signature, chain_hash, short_channel_id, timestamp, message_flags, channel_flags,
			cltv_expiry_delta, htlc_minimum_msat, fee_base_msat, fee_proportional_millionths,
			htlc_maximum_msat,
		})
	}
}

/// Metadata a node publishes about itself: alias, color, addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAnnouncement {
	/// The advertising node's signature over the rest of the message.
	pub signature: Option<Signature>,
	/// The advertised features
	pub features: InitFeatures,
	/// A strictly monotonic announcement counter, with gossip query support
	/// this also needs to be a valid posix timestamp
	pub timestamp: u32,
	/// The node_id this announcement describes
	pub node_id: PublicKey,
	/// An RGB color for UI purposes
	pub rgb: [u8; 3],
	/// An alias, for UI purposes. This should be sanitized before use. There
	/// is no guarantee of uniqueness.
	pub alias: [u8; 32],
	/// List of addresses on which this node is reachable
	pub addresses: Vec<NetAddress>,
}

impl NodeAnnouncement {
	/// The canonical bytes the node signed: every field after the signature,
	/// in wire order.
	pub fn signed_data(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		write_u16(&mut buf, self.features.flags.len() as u16);
		buf.extend_from_slice(&self.features.flags);
		write_u32(&mut buf, self.timestamp);
		buf.extend_from_slice(&self.node_id.serialize());
		buf.extend_from_slice(&self.rgb);
		buf.extend_from_slice(&self.alias);
		let mut addrs = Vec::new();
		for addr in self.addresses.iter() {
			addr.write(&mut addrs);
		}
		write_u16(&mut buf, addrs.len() as u16);
		buf.extend_from_slice(&addrs);
		buf
	}

	/// Checks the announcement's signature against the announced node id.
	pub fn verify_signature<C: Verification>(&self, secp_ctx: &Secp256k1<C>) -> bool {
		let sig = match self.signature {
			Some(sig) => sig,
			None => return false,
		};
		let digest = sha256d::Hash::hash(&self.signed_data());
		let msg = match Message::from_slice(digest.as_ref()) {
			Ok(msg) => msg,
			Err(_) => return false,
		};
		secp_ctx.verify_ecdsa(&msg, &sig, &self.node_id).is_ok()
	}
}

/// Everything a sync connection can carry, for batched sends through the
/// transport and typed dispatch of inbound traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LightningMessage {
	Init(Init),
	QueryChannelRange(QueryChannelRange),
	ReplyChannelRange(ReplyChannelRange),
	QueryShortChannelIds(QueryShortChannelIds),
	ReplyShortChannelIdsEnd(ReplyShortChannelIdsEnd),
	QueryPublicHostedChannels(QueryPublicHostedChannels),
	ReplyPublicHostedChannelsEnd(ReplyPublicHostedChannelsEnd),
	ChannelAnnouncement(ChannelAnnouncement),
	ChannelUpdate(ChannelUpdate),
	NodeAnnouncement(NodeAnnouncement),
}

/// An update_fail_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailHtlc {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The reason field, an encrypted failure onion.
	pub reason: Vec<u8>,
}

/// An update_fail_malformed_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailMalformedHtlc {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The SHA256 of the onion the origin could not parse
	pub sha256_of_onion: [u8; 32],
	/// The failure code
	pub failure_code: u16,
}

const UPDATE: u16 = 0x1000;
const PERM: u16 = 0x4000;
const NODE: u16 = 0x2000;
const BADONION: u16 = 0x8000;

/// A decoded BOLT 4 failure message.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum FailureMessage {
	InvalidRealm,
	TemporaryNodeFailure,
	PermanentNodeFailure,
	RequiredNodeFeatureMissing,
	InvalidOnionVersion,
	InvalidOnionHmac,
	InvalidOnionKey,
	TemporaryChannelFailure { update: ChannelUpdate },
	PermanentChannelFailure,
	RequiredChannelFeatureMissing,
	UnknownNextPeer,
	AmountBelowMinimum { htlc_msat: u64, update: ChannelUpdate },
	FeeInsufficient { htlc_msat: u64, update: ChannelUpdate },
	IncorrectCltvExpiry { cltv_expiry: u32, update: ChannelUpdate },
	ExpiryTooSoon { update: ChannelUpdate },
	IncorrectOrUnknownPaymentDetails { htlc_msat: u64, height: u32 },
	FinalIncorrectCltvExpiry { cltv_expiry: u32 },
	FinalIncorrectHtlcAmount { htlc_msat: u64 },
	ChannelDisabled { flags: u16, update: ChannelUpdate },
	ExpiryTooFar,
	InvalidOnionPayload { tlv_type: u64, offset: u16 },
	PaymentTimeout,
	/// A failure code this implementation does not interpret further.
	Unknown { code: u16 },
}

impl FailureMessage {
	/// The channel update carried by `UPDATE`-class failures.
	pub fn channel_update(&self) -> Option<&ChannelUpdate> {
		match self {
			FailureMessage::TemporaryChannelFailure { update } => Some(update),
			FailureMessage::AmountBelowMinimum { update, .. } => Some(update),
			FailureMessage::FeeInsufficient { update, .. } => Some(update),
			FailureMessage::IncorrectCltvExpiry { update, .. } => Some(update),
			FailureMessage::ExpiryTooSoon { update } => Some(update),
			FailureMessage::ChannelDisabled { update, .. } => Some(update),
			_ => None,
		}
	}

	/// Whether the failure blames the reporting node itself.
	pub fn is_node_class(&self) -> bool {
		self.code() & NODE != 0
	}

	/// The wire code of this failure.
	pub fn code(&self) -> u16 {
		match self {
			FailureMessage::InvalidRealm => PERM | 1,
			FailureMessage::TemporaryNodeFailure => NODE | 2,
			FailureMessage::PermanentNodeFailure => PERM | NODE | 2,
			FailureMessage::RequiredNodeFeatureMissing => PERM | NODE | 3,
			FailureMessage::InvalidOnionVersion => BADONION | PERM | 4,
			FailureMessage::InvalidOnionHmac => BADONION | PERM | 5,
			FailureMessage::InvalidOnionKey => BADONION | PERM | 6,
			FailureMessage::TemporaryChannelFailure { .. } => UPDATE | 7,
			FailureMessage::PermanentChannelFailure => PERM | 8,
			FailureMessage::RequiredChannelFeatureMissing => PERM | 9,
			FailureMessage::UnknownNextPeer => PERM | 10,
			FailureMessage::AmountBelowMinimum { .. } => UPDATE | 11,
			FailureMessage::FeeInsufficient { .. } => UPDATE | 12,
			FailureMessage::IncorrectCltvExpiry { .. } => UPDATE | 13,
			FailureMessage::ExpiryTooSoon { .. } => UPDATE | 14,
			FailureMessage::IncorrectOrUnknownPaymentDetails { .. } => PERM | 15,
			FailureMessage::FinalIncorrectCltvExpiry { .. } => 18,
			FailureMessage::FinalIncorrectHtlcAmount { .. } => 19,
			FailureMessage::ChannelDisabled { .. } => UPDATE | 20,
			FailureMessage::ExpiryTooFar => 21,
			FailureMessage::InvalidOnionPayload { .. } => PERM | 22,
			FailureMessage::PaymentTimeout => 23,
			FailureMessage::Unknown { code } => *code,
		}
	}

	/// Encodes the failure body: code followed by code-specific fields.
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		write_u16(&mut buf, self.code());
		let write_update = |buf: &mut Vec<u8>, update: &ChannelUpdate| {
			let bytes = update.write();
			write_u16(buf, bytes.len() as u16);
			buf.extend_from_slice(&bytes);
		};
		match self {
			FailureMessage::TemporaryChannelFailure { update } => write_update(&mut buf, update),
			FailureMessage::AmountBelowMinimum { htlc_msat, update } => {
				write_u64(&mut buf, *htlc_msat);
				write_update(&mut buf, update);
			},
			FailureMessage::FeeInsufficient { htlc_msat, update } => {
				write_u64(&mut buf, *htlc_msat);
				write_update(&mut buf, update);
			},
			FailureMessage::IncorrectCltvExpiry { cltv_expiry, update } => {
				write_u32(&mut buf, *cltv_expiry);
				write_update(&mut buf, update);
			},
			FailureMessage::ExpiryTooSoon { update } => write_update(&mut buf, update),
			FailureMessage::ChannelDisabled { flags, update } => {
				write_u16(&mut buf, *flags);
				write_update(&mut buf, update);
			},
			FailureMessage::IncorrectOrUnknownPaymentDetails { htlc_msat, height } => {
				write_u64(&mut buf, *htlc_msat);
				write_u32(&mut buf, *height);
			},
			FailureMessage::FinalIncorrectCltvExpiry { cltv_expiry } => write_u32(&mut buf, *cltv_expiry),
			FailureMessage::FinalIncorrectHtlcAmount { htlc_msat } => write_u64(&mut buf, *htlc_msat),
			FailureMessage::InvalidOnionPayload { tlv_type, offset } => {
				write_bigsize(&mut buf, *tlv_type);
				write_u16(&mut buf, *offset);
			},
			_ => {},
		}
		buf
	}

	/// Decodes a failure body. Unknown codes are preserved, not rejected:
	/// the sender must still account for the failed shard.
	pub fn decode(data: &[u8]) -> Result<FailureMessage, DecodeError> {
		let mut cursor = Cursor::new(data);
		let code = cursor.read_u16()?;
		let read_update = |cursor: &mut Cursor| -> Result<ChannelUpdate, DecodeError> {
			let len = cursor.read_u16()? as usize;
			let mut bytes = cursor.read_bytes(len)?;
			// Some implementations prefix the embedded update with its wire
			// type, some do not.
			if bytes.len() >= 2 && bytes[0] == 0x01 && bytes[1] == 0x02 {
				bytes = &bytes[2..];
			}
			ChannelUpdate::read(bytes)
		};
		let msg = match code {
			c if c == PERM | 1 => FailureMessage::InvalidRealm,
			c if c == NODE | 2 => FailureMessage::TemporaryNodeFailure,
			c if c == PERM | NODE | 2 => FailureMessage::PermanentNodeFailure,
			c if c == PERM | NODE | 3 => FailureMessage::RequiredNodeFeatureMissing,
			c if c == BADONION | PERM | 4 => FailureMessage::InvalidOnionVersion,
			c if c == BADONION | PERM | 5 => FailureMessage::InvalidOnionHmac,
			c if c == BADONION | PERM | 6 => FailureMessage::InvalidOnionKey,
			c if c == UPDATE | 7 => FailureMessage::TemporaryChannelFailure { update: read_update(&mut cursor)? },
			c if c == PERM | 8 => FailureMessage::PermanentChannelFailure,
			c if c == PERM | 9 => FailureMessage::RequiredChannelFeatureMissing,
			c if c == PERM | 10 => FailureMessage::UnknownNextPeer,
			c if c == UPDATE | 11 => {
				let htlc_msat = cursor.read_u64()?;
				FailureMessage::AmountBelowMinimum { htlc_msat, update: read_update(&mut cursor)? }
			},
			c if c == UPDATE | 12 => {
				let htlc_msat = cursor.read_u64()?;
				FailureMessage::FeeInsufficient { htlc_msat, update: read_update(&mut cursor)? }
			},
			c if c == UPDATE | 13 => {
				let cltv_expiry = cursor.read_u32()?;
				FailureMessage::IncorrectCltvExpiry { cltv_expiry, update: read_update(&mut cursor)? }
			},
			c if c == UPDATE | 14 => FailureMessage::ExpiryTooSoon { update: read_update(&mut cursor)? },
			c if c == PERM | 15 => {
				let htlc_msat = cursor.read_u64()?;
				let height = cursor.read_u32()?;
				FailureMessage::IncorrectOrUnknownPaymentDetails { htlc_msat, height }
			},
			18 => FailureMessage::FinalIncorrectCltvExpiry { cltv_expiry: cursor.read_u32()? },
			19 => FailureMessage::FinalIncorrectHtlcAmount { htlc_msat: cursor.read_u64()? },
			c if c == UPDATE | 20 => {
				let flags = cursor.read_u16()?;
				FailureMessage::ChannelDisabled { flags, update: read_update(&mut cursor)? }
			},
			21 => FailureMessage::ExpiryTooFar,
			23 => FailureMessage::PaymentTimeout,
			code => FailureMessage::Unknown { code },
		};
		Ok(msg)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils;

	#[test]
	fn feature_bits_grow_from_the_back() {
		let mut features = InitFeatures::empty();
		assert!(!features.supports_extended_gossip_queries());
		features.set_feature_bit(11);
		assert!(features.has_feature_bit(11));
		assert!(!features.has_feature_bit(10));
		assert!(features.supports_extended_gossip_queries());
		assert_eq!(features.flags.len(), 2);
	}

	#[test]
	fn update_position_follows_direction_bit() {
		let update = test_utils::dummy_channel_update(42, 1, 0);
		assert_eq!(update.position(), 1);
		let update = test_utils::dummy_channel_update(42, 1, 1);
		assert_eq!(update.position(), 2);
		assert!(!update.is_disabled());
	}

	#[test]
	fn update_roundtrips_through_wire_form() {
		let (secret, _) = test_utils::test_key(7);
		let update = test_utils::signed_channel_update(&secret, 42, 700_000, 0);
		let decoded = ChannelUpdate::read(&update.write()).unwrap();
		assert_eq!(update, decoded);
	}

	#[test]
	fn update_signature_checks_out() {
		let secp_ctx = Secp256k1::new();
		let (secret, node_id) = test_utils::test_key(9);
		let (_, other_id) = test_utils::test_key(10);
		let update = test_utils::signed_channel_update(&secret, 42, 700_000, 0);
		assert!(update.verify_signature(&secp_ctx, &node_id));
		assert!(!update.verify_signature(&secp_ctx, &other_id));
		assert!(!update.lite().verify_signature(&secp_ctx, &node_id));
	}

	#[test]
	fn failure_messages_roundtrip() {
		let (secret, _) = test_utils::test_key(3);
		let update = test_utils::signed_channel_update(&secret, 7, 1, 0);
		let cases = vec![
			FailureMessage::TemporaryNodeFailure,
			FailureMessage::PermanentNodeFailure,
			FailureMessage::TemporaryChannelFailure { update: update.clone() },
			FailureMessage::AmountBelowMinimum { htlc_msat: 1_000, update: update.clone() },
			FailureMessage::ChannelDisabled { flags: 0, update },
			FailureMessage::IncorrectOrUnknownPaymentDetails { htlc_msat: 5, height: 100 },
			FailureMessage::PaymentTimeout,
		];
		for case in cases {
			let decoded = FailureMessage::decode(&case.encode()).unwrap();
			assert_eq!(case, decoded);
		}
	}

	#[test]
	fn node_class_detection() {
		assert!(FailureMessage::TemporaryNodeFailure.is_node_class());
		assert!(FailureMessage::PermanentNodeFailure.is_node_class());
		assert!(!FailureMessage::UnknownNextPeer.is_node_class());
		assert!(!FailureMessage::PaymentTimeout.is_node_class());
	}
}
