// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The vetted gossip data model: what the sync engine distills out of raw
//! peer traffic and hands to the router database, plus the read-only view of
//! that database the engine needs while deciding what to ask peers for.

use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::secp256k1::PublicKey;

use crate::ln::msgs::{ChannelAnnouncement, ChannelUpdate, Checksums, Timestamps, UpdateCore};

/// One direction of one channel: the edge a payment hop traverses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelDesc {
	/// The channel's short id.
	pub short_channel_id: u64,
	/// The node relaying into the channel.
	pub from: PublicKey,
	/// The node being relayed to.
	pub to: PublicKey,
}

/// A [`ChannelDesc`] paired with the channel's capacity, which failure
/// bookkeeping is relative to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescAndCapacity {
	/// The edge.
	pub desc: ChannelDesc,
	/// Channel capacity in milli-satoshi.
	pub capacity_msat: u64,
}

/// The direction a [`ChannelUpdate`] at the given position governs, oriented
/// by the announced endpoint ordering.
pub fn update_desc(update: &ChannelUpdate, node_id_1: &PublicKey, node_id_2: &PublicKey) -> ChannelDesc {
	if update.position() == 1 {
		ChannelDesc { short_channel_id: update.short_channel_id, from: *node_id_1, to: *node_id_2 }
	} else {
		ChannelDesc { short_channel_id: update.short_channel_id, from: *node_id_2, to: *node_id_1 }
	}
}

/// A batch of cross-validated public gossip: everything in here was
/// independently confirmed by strictly more than the configured number of
/// sync peers.
#[derive(Clone, Debug, Default)]
pub struct PureRoutingData {
	/// Confirmed channel announcements, signature material dropped.
	pub announces: Vec<ChannelAnnouncement>,
	/// One representative update per confirmed update core.
	pub updates: Vec<ChannelUpdate>,
	/// Update cores proven to exist but excluded for advertising too little
	/// capacity; the router remembers these so they are not asked for again.
	pub excluded: Vec<UpdateCore>,
	/// How many query batches remain outstanding across all sync peers.
	pub queries_left: usize,
}

/// The result of one full private-hosted-channel sync round against a single
/// peer.
#[derive(Clone, Debug, Default)]
pub struct CompleteHostedRoutingData {
	/// Accepted hosted channel announcements.
	pub announces: Vec<ChannelAnnouncement>,
	/// Accepted hosted channel updates, at most one per direction.
	pub updates: Vec<ChannelUpdate>,
}

/// Per-direction digests of the updates the local router already has for one
/// channel, in the shape extended range replies carry them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpdateDigests {
	/// Both directions' update timestamps.
	pub timestamps: Timestamps,
	/// Both directions' update checksums.
	pub checksums: Checksums,
}

/// Read-only view of the persistent router database. Gossip sync consults it
/// to decide which channels are news and which updates are stale; the
/// payment engine never writes to it directly.
pub trait GraphSource: Send + Sync {
	/// Whether the graph already contains this channel.
	fn contains_channel(&self, short_channel_id: u64) -> bool;
	/// Update digests for a known channel, if any updates were ever stored.
	fn channel_digests(&self, short_channel_id: u64) -> Option<UpdateDigests>;
	/// Whether an earlier sync excluded this channel (for example, for
	/// advertising less capacity than we bother with).
	fn is_excluded(&self, short_channel_id: u64) -> bool;
	/// How many public channels a node participates in.
	fn node_adjacency_count(&self, node_id: &PublicKey) -> usize;
}

/// BOLT 7 `should_request_update`: their copy of an update is worth fetching
/// when it is newer, or equally fresh but different.
pub fn should_request_update(our_timestamp: u32, our_checksum: u32, their_timestamp: u32, their_checksum: u32) -> bool {
	their_timestamp > our_timestamp || (their_timestamp == our_timestamp && their_checksum != our_checksum)
}

/// Whether a proven update must be excluded: it advertises no maximum HTLC at
/// all, a maximum below the configured floor, or a maximum not strictly above
/// its own minimum.
pub fn has_capacity_issues(update: &ChannelUpdate, min_capacity_msat: u64) -> bool {
	match update.htlc_maximum_msat {
		Some(max) => max < min_capacity_msat || max <= update.htlc_minimum_msat,
		None => true,
	}
}

/// The deterministic short channel id of a hosted channel: the first eight
/// bytes of sha256 over both endpoint keys in ascending key order.
pub fn hosted_short_channel_id(node_id_1: &PublicKey, node_id_2: &PublicKey) -> u64 {
	let (lesser, greater) = if node_id_1.serialize() <= node_id_2.serialize() {
		(node_id_1, node_id_2)
	} else {
		(node_id_2, node_id_1)
	};
	let mut engine = Vec::with_capacity(66);
	engine.extend_from_slice(&lesser.serialize());
	engine.extend_from_slice(&greater.serialize());
	let digest = Sha256::hash(&engine).to_byte_array();
	u64::from_be_bytes([digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7]])
}
