// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Recording doubles for every external collaborator, plus factories for the
//! gossip and routing structs tests build over and over.

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::network::constants::Network;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::ln::msgs::{
	ChannelAnnouncement, ChannelFeatures, ChannelUpdate, LightningMessage, NetAddress,
	NodeAnnouncement,
};
use crate::ln::outbound_payment::{
	CmdAddHtlc, OutgoingChannel, OutgoingPaymentListener, OutgoingPaymentSenderData, RemoteFulfill,
};
use crate::ln::ChannelId;
use crate::routing::gossip::{
	ChannelDesc, CompleteHostedRoutingData, GraphSource, PureRoutingData, UpdateDigests,
};
use crate::routing::router::{GraphEdge, PathFinder, RouteRequest};
use crate::routing::sync::{
	GossipTransport, PhcSyncListener, RemoteNodeInfo, SessionPair, SyncListener, WorkerMsg,
};
use crate::util::logger::{Logger, Record};
use crate::util::mailbox::Mailbox;
use crate::util::time::TimeProvider;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A deterministic keypair from a one-byte seed. Zero is not a valid secret,
/// so pass anything else.
pub fn test_key(seed: u8) -> (SecretKey, PublicKey) {
	let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
	let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
	(secret, public)
}

/// An unsigned channel update with boring defaults.
pub fn dummy_channel_update(short_channel_id: u64, htlc_minimum_msat: u64, channel_flags: u8) -> ChannelUpdate {
	ChannelUpdate {
		signature: None,
		chain_hash: genesis_block(Network::Bitcoin).block_hash(),
		short_channel_id,
		timestamp: 700_000,
		message_flags: 1,
		channel_flags,
		cltv_expiry_delta: 40,
		htlc_minimum_msat,
		fee_base_msat: 0,
		fee_proportional_millionths: 0,
		htlc_maximum_msat: Some(100_000_000),
	}
}

/// Signs (or re-signs) an update with the given originator key.
pub fn resign_channel_update(secret: &SecretKey, mut update: ChannelUpdate) -> ChannelUpdate {
	let secp_ctx = Secp256k1::new();
	let digest = sha256d::Hash::hash(&update.signed_data());
	let msg = Message::from_slice(digest.as_ref()).unwrap();
	update.signature = Some(secp_ctx.sign_ecdsa(&msg, secret));
	update
}

/// A properly signed channel update.
pub fn signed_channel_update(secret: &SecretKey, short_channel_id: u64, timestamp: u32, channel_flags: u8) -> ChannelUpdate {
	let mut update = dummy_channel_update(short_channel_id, 1, channel_flags);
	update.timestamp = timestamp;
	resign_channel_update(secret, update)
}

/// A node announcement signed by the announcing node's key.
pub fn signed_node_announcement(secret: &SecretKey) -> NodeAnnouncement {
	let secp_ctx = Secp256k1::new();
	let mut ann = NodeAnnouncement {
		signature: None,
		features: crate::ln::msgs::InitFeatures::empty(),
		timestamp: 700_000,
		node_id: PublicKey::from_secret_key(&secp_ctx, secret),
		rgb: [0; 3],
		alias: [0; 32],
		addresses: vec![NetAddress::IPv4 { addr: [127, 0, 0, 1], port: 9735 }],
	};
	let digest = sha256d::Hash::hash(&ann.signed_data());
	let msg = Message::from_slice(digest.as_ref()).unwrap();
	ann.signature = Some(secp_ctx.sign_ecdsa(&msg, secret));
	ann
}

/// An unsigned channel announcement between the two given nodes.
pub fn channel_announcement(short_channel_id: u64, node_id_1: PublicKey, node_id_2: PublicKey) -> ChannelAnnouncement {
	ChannelAnnouncement {
		node_signature_1: None,
		node_signature_2: None,
		bitcoin_signature_1: None,
		bitcoin_signature_2: None,
		features: ChannelFeatures::empty(),
		chain_hash: genesis_block(Network::Bitcoin).block_hash(),
		short_channel_id,
		node_id_1,
		node_id_2,
		bitcoin_key_1: None,
		bitcoin_key_2: None,
	}
}

/// A graph edge with a default update oriented `from -> to`.
pub fn graph_edge(short_channel_id: u64, from: PublicKey, to: PublicKey, capacity_msat: u64) -> GraphEdge {
	GraphEdge {
		desc: ChannelDesc { short_channel_id, from, to },
		capacity_msat,
		update: dummy_channel_update(short_channel_id, 1, 0),
	}
}

/// Peer addressing material with a placeholder address.
pub fn remote_info(node_id: PublicKey) -> RemoteNodeInfo {
	RemoteNodeInfo { node_id, address: NetAddress::IPv4 { addr: [127, 0, 0, 1], port: 9735 } }
}

/// A logger which stores formatted lines for assertions.
pub struct TestLogger {
	/// Every line logged so far.
	pub lines: Mutex<Vec<String>>,
}

impl TestLogger {
	pub fn new() -> Self {
		TestLogger { lines: Mutex::new(Vec::new()) }
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		self.lines.lock().unwrap().push(format!("{} {}", record.level, record.args));
	}
}

/// A transport recording every call made against it.
pub struct TestTransport {
	/// Sessions opened, with the worker mailbox attached to each.
	pub listens: Mutex<Vec<(SessionPair, RemoteNodeInfo, Mailbox<WorkerMsg>)>>,
	/// Batches sent, newest last.
	pub sent: Mutex<Vec<(Vec<LightningMessage>, SessionPair)>>,
	/// Sessions torn down.
	pub forgotten: Mutex<Vec<SessionPair>>,
}

impl TestTransport {
	pub fn new() -> Self {
		TestTransport {
			listens: Mutex::new(Vec::new()),
			sent: Mutex::new(Vec::new()),
			forgotten: Mutex::new(Vec::new()),
		}
	}
}

impl GossipTransport for TestTransport {
	fn listen(&self, pair: SessionPair, info: RemoteNodeInfo, worker: Mailbox<WorkerMsg>) {
		self.listens.lock().unwrap().push((pair, info, worker));
	}

	fn send_many(&self, msgs: Vec<LightningMessage>, pair: &SessionPair) {
		self.sent.lock().unwrap().push((msgs, pair.clone()));
	}

	fn forget(&self, pair: &SessionPair) {
		self.forgotten.lock().unwrap().push(pair.clone());
	}
}

/// An in-memory stand-in for the router database.
pub struct TestGraph {
	channels: Mutex<HashMap<u64, UpdateDigests>>,
	excluded: Mutex<HashSet<u64>>,
	adjacency: Mutex<HashMap<PublicKey, usize>>,
}

impl TestGraph {
	pub fn new() -> Self {
		TestGraph {
			channels: Mutex::new(HashMap::new()),
			excluded: Mutex::new(HashSet::new()),
			adjacency: Mutex::new(HashMap::new()),
		}
	}

	pub fn insert_channel(&self, short_channel_id: u64, digests: UpdateDigests) {
		self.channels.lock().unwrap().insert(short_channel_id, digests);
	}

	pub fn exclude(&self, short_channel_id: u64) {
		self.excluded.lock().unwrap().insert(short_channel_id);
	}

	pub fn set_adjacency(&self, node_id: PublicKey, count: usize) {
		self.adjacency.lock().unwrap().insert(node_id, count);
	}
}

impl GraphSource for TestGraph {
	fn contains_channel(&self, short_channel_id: u64) -> bool {
		self.channels.lock().unwrap().contains_key(&short_channel_id)
	}

	fn channel_digests(&self, short_channel_id: u64) -> Option<UpdateDigests> {
		self.channels.lock().unwrap().get(&short_channel_id).copied()
	}

	fn is_excluded(&self, short_channel_id: u64) -> bool {
		self.excluded.lock().unwrap().contains(&short_channel_id)
	}

	fn node_adjacency_count(&self, node_id: &PublicKey) -> usize {
		self.adjacency.lock().unwrap().get(node_id).copied().unwrap_or(0)
	}
}

/// A sync listener recording everything it is told.
pub struct TestSyncListener {
	/// Vetted snapshots, oldest first.
	pub snapshots: Mutex<Vec<PureRoutingData>>,
	/// Set when the full round completed.
	pub total_complete: Mutex<bool>,
	/// Valid node announcements seen.
	pub node_announcements: Mutex<Vec<NodeAnnouncement>>,
}

impl TestSyncListener {
	pub fn new() -> Self {
		TestSyncListener {
			snapshots: Mutex::new(Vec::new()),
			total_complete: Mutex::new(false),
			node_announcements: Mutex::new(Vec::new()),
		}
	}
}

impl SyncListener for TestSyncListener {
	fn on_chunk_sync_complete(&self, data: PureRoutingData) {
		self.snapshots.lock().unwrap().push(data);
	}

	fn on_total_sync_complete(&self) {
		*self.total_complete.lock().unwrap() = true;
	}

	fn on_node_announcement(&self, ann: NodeAnnouncement) {
		self.node_announcements.lock().unwrap().push(ann);
	}
}

/// A hosted-channel sync listener recording completions.
pub struct TestPhcListener {
	/// Completed hosted sync rounds.
	pub completions: Mutex<Vec<CompleteHostedRoutingData>>,
}

impl TestPhcListener {
	pub fn new() -> Self {
		TestPhcListener { completions: Mutex::new(Vec::new()) }
	}
}

impl PhcSyncListener for TestPhcListener {
	fn on_phc_sync_complete(&self, data: CompleteHostedRoutingData) {
		self.completions.lock().unwrap().push(data);
	}
}

/// A path-finder double: records requests and loose updates, answers nothing
/// by itself (tests post `RouteResponse`s by hand).
pub struct TestPathFinder {
	/// Requests received, oldest first.
	pub requests: Mutex<Vec<RouteRequest>>,
	/// Loose updates fed into the graph.
	pub informed: Mutex<Vec<ChannelUpdate>>,
	/// Known update originators by short channel id.
	pub known_updates: Mutex<HashMap<u64, PublicKey>>,
}

impl TestPathFinder {
	pub fn new() -> Self {
		TestPathFinder {
			requests: Mutex::new(Vec::new()),
			informed: Mutex::new(Vec::new()),
			known_updates: Mutex::new(HashMap::new()),
		}
	}
}

impl PathFinder for TestPathFinder {
	fn find_route(&self, request: RouteRequest) {
		self.requests.lock().unwrap().push(request);
	}

	fn inform_update(&self, update: &ChannelUpdate) {
		self.informed.lock().unwrap().push(update.clone());
	}

	fn node_id_from_update(&self, update: &ChannelUpdate) -> Option<PublicKey> {
		self.known_updates.lock().unwrap().get(&update.short_channel_id).copied()
	}
}

struct TestChannelState {
	operational: bool,
	sleeping: bool,
	available_msat: u64,
	max_in_flight_msat: u64,
	min_sendable_msat: u64,
	slots_left: usize,
}

/// A local channel double. Starts operational with nothing to spend.
pub struct TestChannel {
	channel_id: ChannelId,
	peer: PublicKey,
	state: Mutex<TestChannelState>,
	/// HTLC commands submitted to this channel, oldest first.
	pub sent: Mutex<Vec<CmdAddHtlc>>,
}

impl TestChannel {
	pub fn new(id_byte: u8, peer: PublicKey) -> Self {
		TestChannel {
			channel_id: ChannelId([id_byte; 32]),
			peer,
			state: Mutex::new(TestChannelState {
				operational: true,
				sleeping: false,
				available_msat: 0,
				max_in_flight_msat: u64::MAX / 2,
				min_sendable_msat: 1_000,
				slots_left: 10,
			}),
			sent: Mutex::new(Vec::new()),
		}
	}

	pub fn set_available(&self, amount_msat: u64) {
		self.state.lock().unwrap().available_msat = amount_msat;
	}

	pub fn set_operational(&self, operational: bool) {
		self.state.lock().unwrap().operational = operational;
	}

	pub fn set_sleeping(&self, sleeping: bool) {
		self.state.lock().unwrap().sleeping = sleeping;
	}

	pub fn set_slots_left(&self, slots_left: usize) {
		self.state.lock().unwrap().slots_left = slots_left;
	}
}

impl OutgoingChannel for TestChannel {
	fn channel_id(&self) -> ChannelId {
		self.channel_id
	}

	fn peer_node_id(&self) -> PublicKey {
		self.peer
	}

	fn is_operational(&self) -> bool {
		self.state.lock().unwrap().operational
	}

	fn is_sleeping(&self) -> bool {
		self.state.lock().unwrap().sleeping
	}

	fn available_for_send_msat(&self) -> u64 {
		self.state.lock().unwrap().available_msat
	}

	fn max_send_in_flight_msat(&self) -> u64 {
		self.state.lock().unwrap().max_in_flight_msat
	}

	fn min_sendable_msat(&self) -> u64 {
		self.state.lock().unwrap().min_sendable_msat
	}

	fn outgoing_htlc_slots_left(&self) -> usize {
		self.state.lock().unwrap().slots_left
	}

	fn send_add_htlc(&self, cmd: CmdAddHtlc) {
		self.sent.lock().unwrap().push(cmd);
	}
}

/// A clock tests can move by hand.
pub struct TestClock {
	now: Mutex<u64>,
}

impl TestClock {
	pub fn new(start_msec: u64) -> Self {
		TestClock { now: Mutex::new(start_msec) }
	}

	pub fn advance(&self, by_msec: u64) {
		*self.now.lock().unwrap() += by_msec;
	}
}

impl TimeProvider for TestClock {
	fn now_millis(&self) -> u64 {
		*self.now.lock().unwrap()
	}
}

/// A payment listener counting lifecycle events.
pub struct TestPaymentListener {
	/// How many first-preimage events arrived.
	pub preimages: Mutex<u32>,
	/// How many whole-payment-succeeded events arrived.
	pub whole_succeeded: Mutex<u32>,
	/// How many whole-payment-failed events arrived.
	pub whole_failed: Mutex<u32>,
}

impl TestPaymentListener {
	pub fn new() -> Self {
		TestPaymentListener {
			preimages: Mutex::new(0),
			whole_succeeded: Mutex::new(0),
			whole_failed: Mutex::new(0),
		}
	}
}

impl OutgoingPaymentListener for TestPaymentListener {
	fn got_first_preimage(&self, _data: &OutgoingPaymentSenderData, _fulfill: &RemoteFulfill) {
		*self.preimages.lock().unwrap() += 1;
	}

	fn whole_payment_succeeded(&self, _data: &OutgoingPaymentSenderData) {
		*self.whole_succeeded.lock().unwrap() += 1;
	}

	fn whole_payment_failed(&self, _data: &OutgoingPaymentSenderData) {
		*self.whole_failed.lock().unwrap() += 1;
	}
}
