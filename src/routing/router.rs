// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various types which describe routes or information about partial routes
//! within the lightning network, and the call surface of the external
//! path-finder.

use bitcoin::secp256k1::PublicKey;

use crate::ln::msgs::ChannelUpdate;
use crate::ln::FullPaymentTag;
use crate::routing::gossip::{ChannelDesc, DescAndCapacity};

use std::collections::HashSet;

/// One relayable edge of the public graph: a directed channel together with
/// the policy its relaying node last advertised.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphEdge {
	/// The directed channel.
	pub desc: ChannelDesc,
	/// Channel capacity in milli-satoshi.
	pub capacity_msat: u64,
	/// The relaying node's advertised policy.
	pub update: ChannelUpdate,
}

impl GraphEdge {
	/// The fee the relaying node charges for forwarding `amount_msat`.
	pub fn fee_msat(&self, amount_msat: u64) -> u64 {
		self.update.fee_base_msat as u64
			+ amount_msat * self.update.fee_proportional_millionths as u64 / 1_000_000
	}

	/// The edge's identity for failure bookkeeping.
	pub fn desc_and_capacity(&self) -> DescAndCapacity {
		DescAndCapacity { desc: self.desc, capacity_msat: self.capacity_msat }
	}
}

/// A payment path: edges from the sender's channel peer through to the payee.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
	/// The edges traversed, in forwarding order. The first edge leaves one of
	/// our own channels.
	pub hops: Vec<GraphEdge>,
}

impl Route {
	/// The payee.
	pub fn final_node(&self) -> Option<PublicKey> {
		self.hops.last().map(|edge| edge.desc.to)
	}

	/// The edge a given transit node forwards over, when it is on this route.
	pub fn edge_from(&self, node_id: &PublicKey) -> Option<&GraphEdge> {
		self.hops.iter().find(|edge| edge.desc.from == *node_id)
	}

	/// Transit nodes: everyone on the route except ourselves and the payee.
	pub fn internal_nodes(&self) -> Vec<PublicKey> {
		self.hops.iter().skip(1).map(|edge| edge.desc.from).collect()
	}
}

/// A request for one route for one payment shard. At most one of these is
/// outstanding against the path-finder at any time, enforced by the payment
/// master's state.
#[derive(Clone, Debug)]
pub struct RouteRequest {
	/// The payment the shard belongs to.
	pub full_tag: FullPaymentTag,
	/// The shard's id: its onion session public key.
	pub part_id: PublicKey,
	/// The node the search starts from: the peer on the local channel chosen
	/// for this shard.
	pub source: PublicKey,
	/// The payee.
	pub target: PublicKey,
	/// The shard amount, in milli-satoshi.
	pub amount_msat: u64,
	/// How much fee the shard may still spend, in milli-satoshi.
	pub fee_reserve_msat: u64,
	/// Nodes the search must avoid.
	pub ignore_nodes: HashSet<PublicKey>,
	/// Directed channels the search must avoid.
	pub ignore_channels: HashSet<ChannelDesc>,
}

/// The path-finder's answer to a [`RouteRequest`].
#[derive(Clone, Debug)]
pub enum RouteResponse {
	/// A usable route was found for the shard.
	Found {
		/// The payment the shard belongs to.
		full_tag: FullPaymentTag,
		/// The shard the route is for.
		part_id: PublicKey,
		/// The route itself.
		route: Route,
	},
	/// No route satisfies the request under its constraints.
	NoRouteAvailable {
		/// The payment the shard belongs to.
		full_tag: FullPaymentTag,
		/// The shard no route was found for.
		part_id: PublicKey,
	},
}

/// The call surface of the external path-finder. Requests are asynchronous:
/// answers come back as [`RouteResponse`] messages posted to the payment
/// master's mailbox.
pub trait PathFinder: Send + Sync {
	/// Starts a route search. Exactly one search runs at a time.
	fn find_route(&self, request: RouteRequest);
	/// Feeds a loose channel update learned outside of gossip sync (for
	/// example, carried inside a payment failure) into the online graph.
	fn inform_update(&self, update: &ChannelUpdate);
	/// The node that advertised a given update, when the graph knows the
	/// channel.
	fn node_id_from_update(&self, update: &ChannelUpdate) -> Option<PublicKey>;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils;

	#[test]
	fn fees_are_base_plus_proportional() {
		let (_, a) = test_utils::test_key(1);
		let (_, b) = test_utils::test_key(2);
		let mut edge = test_utils::graph_edge(100, a, b, 1_000_000_000);
		edge.update.fee_base_msat = 1_000;
		edge.update.fee_proportional_millionths = 100;
		assert_eq!(edge.fee_msat(1_000_000), 1_000 + 100);
		assert_eq!(edge.fee_msat(0), 1_000);
	}

	#[test]
	fn route_accessors() {
		let (_, us) = test_utils::test_key(1);
		let (_, b) = test_utils::test_key(2);
		let (_, c) = test_utils::test_key(3);
		let (_, payee) = test_utils::test_key(4);
		let route = Route {
			hops: vec![
				test_utils::graph_edge(1, us, b, 1_000_000),
				test_utils::graph_edge(2, b, c, 1_000_000),
				test_utils::graph_edge(3, c, payee, 1_000_000),
			],
		};
		assert_eq!(route.final_node(), Some(payee));
		assert_eq!(route.edge_from(&c).unwrap().desc.short_channel_id, 3);
		assert_eq!(route.internal_nodes(), vec![b, c]);
		assert!(route.edge_from(&payee).is_none());
	}
}
