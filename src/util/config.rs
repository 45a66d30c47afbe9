// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Tunable knobs for the sync and payment engines. Defaults here are sensible
//! for a mobile-class client talking to the public network.

use bitcoin::BlockHash;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::network::constants::Network;

/// Parameters of the multi-peer gossip synchronization engine.
#[derive(Clone, Debug)]
pub struct SyncConfig {
	/// Hash of the genesis block of the chain we gossip about.
	pub chain_hash: BlockHash,
	/// How many peers to sync from in parallel.
	pub max_connections: usize,
	/// A gossip fact is admitted once strictly more than this many distinct
	/// peers have confirmed it.
	pub accept_threshold: usize,
	/// How many short channel ids to put into a single query batch.
	pub messages_to_ask: usize,
	/// How many completed chunks to accumulate before emitting one vetted
	/// routing snapshot.
	pub chunks_to_wait: usize,
	/// Channels advertising a maximum HTLC below this are excluded outright.
	pub min_capacity_msat: u64,
	/// How long to wait before replacing a disconnected sync peer.
	pub reconnect_delay_msec: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig {
			chain_hash: genesis_block(Network::Bitcoin).block_hash(),
			max_connections: 3,
			accept_threshold: 1,
			messages_to_ask: 500,
			chunks_to_wait: 4,
			min_capacity_msat: 1_000_000,
			reconnect_delay_msec: 5_000,
		}
	}
}

/// Parameters of private hosted channel gossip.
#[derive(Clone, Debug)]
pub struct PhcConfig {
	/// Hash of the genesis block of the chain we gossip about.
	pub chain_hash: BlockHash,
	/// Smallest advertised hosted channel capacity we accept.
	pub min_capacity_msat: u64,
	/// Largest advertised hosted channel capacity we accept.
	pub max_capacity_msat: u64,
	/// How many hosted channels a single node may appear in.
	pub max_per_node: usize,
	/// Both endpoints of a hosted channel must have at least this many normal
	/// channels in the public graph before we take their word for anything.
	pub min_normal_chans: usize,
	/// How many reconnection attempts to make before giving up silently.
	pub sync_attempts: u32,
	/// How long to wait between reconnection attempts.
	pub reconnect_delay_msec: u64,
}

impl Default for PhcConfig {
	fn default() -> Self {
		PhcConfig {
			chain_hash: genesis_block(Network::Bitcoin).block_hash(),
			min_capacity_msat: 50_000_000,
			max_capacity_msat: 100_000_000_000,
			max_per_node: 2,
			min_normal_chans: 5,
			sync_attempts: 5,
			reconnect_delay_msec: 5_000,
		}
	}
}

/// Parameters of the outgoing payment engine.
#[derive(Clone, Debug)]
pub struct PaymentConfig {
	/// A channel direction with this many accumulated failures is excluded
	/// from route searches.
	pub max_direction_failures: u32,
	/// A node with this many accumulated failures is excluded from route
	/// searches. Misbehaving nodes are brought to this ceiling at once.
	pub max_strange_node_failures: u32,
	/// How many times a single shard may be re-sent after remote failures.
	pub max_remote_attempts: u32,
	/// How many shards of one payment a single local channel may carry.
	pub max_in_channel_htlcs: usize,
	/// Time constant of empirical channel ceiling recovery: after this many
	/// milliseconds a recorded capacity failure has fully healed.
	pub failed_chan_recovery_msec: u64,
	/// How long a payment may hold an unassigned shard waiting for a sleeping
	/// channel to come back online.
	pub wait_for_chan_online_msec: u64,
}

impl Default for PaymentConfig {
	fn default() -> Self {
		PaymentConfig {
			max_direction_failures: 4,
			max_strange_node_failures: 6,
			max_remote_attempts: 12,
			max_in_channel_htlcs: 10,
			failed_chan_recovery_msec: 3_600_000,
			wait_for_chan_online_msec: 60_000,
		}
	}
}
