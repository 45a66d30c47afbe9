// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The gossip synchronization engine. A [`SyncMaster`] supervises several
//! [`SyncWorker`]s, each driving one peer over one Noise connection through
//! the BOLT 7 query protocol. Nothing a single peer says is trusted: a
//! channel or update only reaches the router once strictly more than
//! `accept_threshold` distinct peers confirmed it. [`PhcSyncMaster`] is the
//! single-peer variant for private hosted channel gossip.

use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::BlockHash;

use rand::seq::SliceRandom;
use rand::{thread_rng, RngCore};

use crate::ln::msgs::{
	ChannelAnnouncement, ChannelUpdate, Init, LightningMessage, NetAddress, NodeAnnouncement,
	QueryChannelRange, QueryPublicHostedChannels, QueryShortChannelIds, ReplyChannelRange,
	UpdateCore, INCLUDE_CHANNEL_ANNOUNCEMENT, INCLUDE_CHANNEL_UPDATE_1, INCLUDE_CHANNEL_UPDATE_2,
	INCLUDE_NODE_ANNOUNCEMENT_1, INCLUDE_NODE_ANNOUNCEMENT_2, QUERY_FLAG_ALL,
};
use crate::routing::gossip::{
	has_capacity_issues, hosted_short_channel_id, should_request_update, CompleteHostedRoutingData,
	GraphSource, PureRoutingData,
};
use crate::util::config::{PhcConfig, SyncConfig};
use crate::util::logger::Logger;
use crate::util::mailbox::{self, Actor, Mailbox, MessageSink};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Addressing material for one candidate gossip peer.
#[derive(Clone, Debug)]
pub struct RemoteNodeInfo {
	/// The peer's node id.
	pub node_id: PublicKey,
	/// Where the peer can be reached.
	pub address: NetAddress,
}

/// One Noise session: a throwaway local keypair paired with a remote node.
/// Every worker gets a fresh random keypair so sync sessions cannot be linked
/// to our node identity or to each other.
#[derive(Clone, Debug)]
pub struct SessionPair {
	/// Our ephemeral secret for this session.
	pub local_secret: SecretKey,
	/// Public form of [`SessionPair::local_secret`].
	pub local_id: PublicKey,
	/// The remote peer's node id.
	pub remote_id: PublicKey,
}

impl SessionPair {
	/// A session with a fresh random keypair towards `remote_id`.
	pub fn random<C: secp256k1::Signing>(secp_ctx: &Secp256k1<C>, remote_id: PublicKey) -> SessionPair {
		let mut bytes = [0u8; 32];
		thread_rng().fill_bytes(&mut bytes);
		let local_secret = SecretKey::from_slice(&bytes).expect("RNG is busted");
		SessionPair { local_secret, local_id: PublicKey::from_secret_key(secp_ctx, &local_secret), remote_id }
	}
}

impl PartialEq for SessionPair {
	fn eq(&self, other: &Self) -> bool {
		self.local_id == other.local_id && self.remote_id == other.remote_id
	}
}

impl Eq for SessionPair {}

/// The call surface of the Noise transport layer. `listen` attaches a worker
/// mailbox to a session; from then on the transport posts
/// [`WorkerMsg::Operational`], [`WorkerMsg::Message`],
/// [`WorkerMsg::HostedMessage`] and [`WorkerMsg::Disconnected`] into it.
pub trait GossipTransport: Send + Sync {
	/// Opens (or begins opening) a session and wires its events to `worker`.
	fn listen(&self, pair: SessionPair, info: RemoteNodeInfo, worker: Mailbox<WorkerMsg>);
	/// Sends a batch of messages over an established session.
	fn send_many(&self, msgs: Vec<LightningMessage>, pair: &SessionPair);
	/// Tears the session down and forgets the pairing.
	fn forget(&self, pair: &SessionPair);
}

/// Messages a [`SyncWorker`] consumes: transport callbacks plus supervisor
/// commands.
pub enum WorkerMsg {
	/// The Noise handshake finished and `init` messages were exchanged.
	Operational {
		/// The peer's advertised features.
		init: Init,
	},
	/// A message arrived over the session.
	Message(LightningMessage),
	/// A hosted-channel extension message arrived over the session.
	HostedMessage(LightningMessage),
	/// The session died.
	Disconnected,
	/// The supervisor moves the worker into a phase by handing it that
	/// phase's working data.
	Start(SyncWorkerData),
	/// Terminal: clear local state and forget the session.
	Shutdown,
}

/// Per-phase working data, injected by the supervisor.
pub enum SyncWorkerData {
	/// Collect `reply_channel_range` blocks.
	ShortIdSync(SyncWorkerShortIdsData),
	/// Drain a queue of short-id queries and collect the gossip they elicit.
	GossipSync(SyncWorkerGossipData),
	/// Collect private hosted channel gossip.
	PhcSync(SyncWorkerPhcData),
}

/// Working data of the short-id phase.
#[derive(Default)]
pub struct SyncWorkerShortIdsData {
	/// Received reply blocks, most recent first.
	pub ranges: Vec<ReplyChannelRange>,
}

/// Working data of the gossip phase.
pub struct SyncWorkerGossipData {
	/// Short ids proven by peer majority; gossip about anything else is
	/// dropped on the floor.
	pub proven_short_ids: Arc<HashSet<u64>>,
	/// Query batches still to be sent, front first.
	pub queue: VecDeque<QueryShortChannelIds>,
	/// Announcements collected since the last chunk boundary.
	pub announces: Vec<ChannelAnnouncement>,
	/// Updates collected since the last chunk boundary.
	pub updates: Vec<ChannelUpdate>,
	/// Update cores excluded for capacity reasons since the last boundary.
	pub excluded: HashSet<UpdateCore>,
}

impl SyncWorkerGossipData {
	/// Fresh gossip-phase data over a query queue.
	pub fn new(proven_short_ids: Arc<HashSet<u64>>, queue: VecDeque<QueryShortChannelIds>) -> Self {
		SyncWorkerGossipData {
			proven_short_ids,
			queue,
			announces: Vec::new(),
			updates: Vec::new(),
			excluded: HashSet::new(),
		}
	}
}

/// Working data of the private hosted channel phase.
#[derive(Default)]
pub struct SyncWorkerPhcData {
	/// Accepted announcements by short id.
	pub announces: HashMap<u64, ChannelAnnouncement>,
	/// Accepted updates, at most one per direction of each channel.
	pub updates: Vec<ChannelUpdate>,
	/// Directions still awaited per short id.
	pub expected_positions: HashMap<u64, HashSet<u8>>,
	/// How many hosted channels each node already appears in.
	pub node_id_to_short_ids: HashMap<PublicKey, HashSet<u64>>,
}

/// The gossip collected between two chunk boundaries, reported upward.
#[derive(Default)]
pub struct GossipChunk {
	/// Announcements seen in this chunk, signature material dropped.
	pub announces: Vec<ChannelAnnouncement>,
	/// Updates seen in this chunk, signature material dropped.
	pub updates: Vec<ChannelUpdate>,
	/// Updates excluded for capacity reasons in this chunk.
	pub excluded: Vec<UpdateCore>,
}

/// Events a worker reports to its supervisor.
pub enum WorkerEvent {
	/// The peer completed its answer to our channel range query.
	ShortIdsComplete {
		/// Reporting peer.
		peer: PublicKey,
		/// All reply blocks, most recent first.
		ranges: Vec<ReplyChannelRange>,
	},
	/// One query batch was fully answered.
	ChunkComplete {
		/// Reporting peer.
		peer: PublicKey,
		/// What the batch elicited.
		chunk: GossipChunk,
		/// Batches still queued on this worker.
		queries_left: usize,
	},
	/// The query queue is drained; the worker has shut itself down.
	GossipComplete {
		/// Reporting peer.
		peer: PublicKey,
	},
	/// A node announcement with a valid signature came through.
	NodeAnnouncement(NodeAnnouncement),
	/// The hosted channel stream ended; the worker has shut itself down.
	PhcComplete {
		/// Reporting peer.
		peer: PublicKey,
		/// Everything that passed admission.
		data: CompleteHostedRoutingData,
	},
	/// The session died, or the peer turned out to be useless for extended
	/// queries and was dropped.
	Disconnected {
		/// Reporting peer.
		peer: PublicKey,
		/// False when the peer lacked `gossip_queries_ex` and should be
		/// evicted from the candidate pool.
		supports_extended_queries: bool,
	},
}

enum WorkerState {
	Waiting,
	ShortIdSync(SyncWorkerShortIdsData),
	GossipSync(SyncWorkerGossipData),
	PhcSync(SyncWorkerPhcData),
	ShutDown,
}

/// Hosted-channel admission context handed to workers doing a PHC phase.
pub struct PhcContext {
	/// Admission bounds.
	pub conf: PhcConfig,
	/// The public graph, consulted for the normal-channel prerequisite.
	pub graph: Arc<dyn GraphSource>,
}

/// Drives one peer through one phase of gossip sync. Created by a master on
/// demand, terminates on completion or disconnect, and is replaced (fresh
/// random keypair, different peer) if capacity is needed.
pub struct SyncWorker {
	pair: SessionPair,
	info: RemoteNodeInfo,
	transport: Arc<dyn GossipTransport>,
	events: MessageSink<WorkerEvent>,
	chain_hash: BlockHash,
	min_capacity_msat: u64,
	phc: Option<PhcContext>,
	state: WorkerState,
	operational: bool,
	secp_ctx: Secp256k1<secp256k1::VerifyOnly>,
	logger: Arc<dyn Logger>,
}

impl SyncWorker {
	/// A worker in the `Waiting` state. The caller attaches the returned
	/// worker's mailbox to the transport.
	pub fn new(
		pair: SessionPair, info: RemoteNodeInfo, transport: Arc<dyn GossipTransport>,
		events: MessageSink<WorkerEvent>, chain_hash: BlockHash, min_capacity_msat: u64,
		phc: Option<PhcContext>, logger: Arc<dyn Logger>,
	) -> Self {
		SyncWorker {
			pair,
			info,
			transport,
			events,
			chain_hash,
			min_capacity_msat,
			phc,
			state: WorkerState::Waiting,
			operational: false,
			secp_ctx: Secp256k1::verification_only(),
			logger,
		}
	}

	fn send(&self, msg: LightningMessage) {
		self.transport.send_many(vec![msg], &self.pair);
	}

	// Fires the current phase's opening query. Called when the phase and the
	// connection are both ready, in either order.
	fn kick_off(&self) {
		if !self.operational {
			return;
		}
		match &self.state {
			WorkerState::ShortIdSync(_) => {
				self.send(LightningMessage::QueryChannelRange(QueryChannelRange {
					chain_hash: self.chain_hash,
					first_blocknum: 0,
					number_of_blocks: u32::MAX,
					query_flags: Some(QUERY_FLAG_ALL),
				}));
			},
			WorkerState::GossipSync(data) => {
				if let Some(query) = data.queue.front() {
					self.send(LightningMessage::QueryShortChannelIds(query.clone()));
				}
			},
			WorkerState::PhcSync(_) => {
				self.send(LightningMessage::QueryPublicHostedChannels(QueryPublicHostedChannels {
					chain_hash: self.chain_hash,
				}));
			},
			WorkerState::Waiting | WorkerState::ShutDown => {},
		}
	}

	fn process_gossip_message(&mut self, msg: LightningMessage) {
		let events = self.events.clone();
		let transport = Arc::clone(&self.transport);
		let peer = self.pair.remote_id;
		let min_capacity_msat = self.min_capacity_msat;
		let data = match &mut self.state {
			WorkerState::GossipSync(data) => data,
			_ => return,
		};
		match msg {
			LightningMessage::ChannelAnnouncement(ann)
				if data.proven_short_ids.contains(&ann.short_channel_id) =>
			{
				data.announces.push(ann.lite());
			},
			LightningMessage::ChannelUpdate(update)
				if data.proven_short_ids.contains(&update.short_channel_id) =>
			{
				if has_capacity_issues(&update, min_capacity_msat) {
					data.excluded.insert(update.core());
				} else {
					data.updates.push(update.lite());
				}
			},
			LightningMessage::NodeAnnouncement(ann) => {
				if ann.verify_signature(&self.secp_ctx) {
					events.deliver(WorkerEvent::NodeAnnouncement(ann));
				}
			},
			LightningMessage::ReplyShortChannelIdsEnd(_) => {
				data.queue.pop_front();
				let chunk = GossipChunk {
					announces: std::mem::take(&mut data.announces),
					updates: std::mem::take(&mut data.updates),
					excluded: data.excluded.drain().collect(),
				};
				events.deliver(WorkerEvent::ChunkComplete { peer, chunk, queries_left: data.queue.len() });
				match data.queue.front() {
					Some(query) => {
						let query = LightningMessage::QueryShortChannelIds(query.clone());
						transport.send_many(vec![query], &self.pair);
					},
					None => {
						events.deliver(WorkerEvent::GossipComplete { peer });
						self.state = WorkerState::ShutDown;
						transport.forget(&self.pair);
					},
				}
			},
			_ => {},
		}
	}

	fn process_phc_message(&mut self, msg: LightningMessage) {
		let events = self.events.clone();
		let transport = Arc::clone(&self.transport);
		let peer = self.pair.remote_id;
		let phc = match &self.phc {
			Some(phc) => phc,
			None => return,
		};
		let data = match &mut self.state {
			WorkerState::PhcSync(data) => data,
			_ => return,
		};
		match msg {
			LightningMessage::ChannelAnnouncement(ann) => {
				let scid = ann.short_channel_id;
				let id_matches = scid == hosted_short_channel_id(&ann.node_id_1, &ann.node_id_2);
				let caps_ok = [ann.node_id_1, ann.node_id_2].iter().all(|node_id| {
					data.node_id_to_short_ids.get(node_id).map_or(0, |ids| ids.len()) < phc.conf.max_per_node
				});
				let grounded = [ann.node_id_1, ann.node_id_2].iter().all(|node_id| {
					phc.graph.node_adjacency_count(node_id) >= phc.conf.min_normal_chans
				});
				if ann.is_phc() && id_matches && caps_ok && grounded {
					data.node_id_to_short_ids.entry(ann.node_id_1).or_default().insert(scid);
					data.node_id_to_short_ids.entry(ann.node_id_2).or_default().insert(scid);
					data.expected_positions.insert(scid, [1u8, 2u8].into_iter().collect());
					data.announces.insert(scid, ann.lite());
				}
			},
			LightningMessage::ChannelUpdate(update) => {
				let ann = match data.announces.get(&update.short_channel_id) {
					Some(ann) => ann,
					None => return,
				};
				let capacity_ok = match update.htlc_maximum_msat {
					Some(capacity) => {
						capacity >= phc.conf.min_capacity_msat
							&& capacity <= phc.conf.max_capacity_msat
							&& capacity > update.htlc_minimum_msat
					},
					None => false,
				};
				let position = update.position();
				let awaited = data
					.expected_positions
					.get(&update.short_channel_id)
					.map_or(false, |positions| positions.contains(&position));
				let signer = if position == 1 { &ann.node_id_1 } else { &ann.node_id_2 };
				if capacity_ok && awaited && update.verify_signature(&self.secp_ctx, signer) {
					if let Some(positions) = data.expected_positions.get_mut(&update.short_channel_id) {
						positions.remove(&position);
					}
					data.updates.push(update.lite());
				}
			},
			LightningMessage::ReplyPublicHostedChannelsEnd(_) => {
				let complete = CompleteHostedRoutingData {
					announces: data.announces.drain().map(|(_, ann)| ann).collect(),
					updates: std::mem::take(&mut data.updates),
				};
				events.deliver(WorkerEvent::PhcComplete { peer, data: complete });
				self.state = WorkerState::ShutDown;
				transport.forget(&self.pair);
			},
			_ => {},
		}
	}
}

impl Actor for SyncWorker {
	type Message = WorkerMsg;

	fn process(&mut self, msg: WorkerMsg) {
		if let WorkerState::ShutDown = self.state {
			return;
		}
		match msg {
			WorkerMsg::Operational { init } => {
				if !init.features.supports_extended_gossip_queries() {
					log_info!(
						self.logger,
						"peer {} lacks extended gossip queries, evicting",
						self.info.node_id
					);
					self.transport.forget(&self.pair);
					self.state = WorkerState::ShutDown;
					self.events.deliver(WorkerEvent::Disconnected {
						peer: self.pair.remote_id,
						supports_extended_queries: false,
					});
					return;
				}
				self.operational = true;
				self.kick_off();
			},
			WorkerMsg::Start(data) => {
				self.state = match data {
					SyncWorkerData::ShortIdSync(data) => WorkerState::ShortIdSync(data),
					SyncWorkerData::GossipSync(data) => WorkerState::GossipSync(data),
					SyncWorkerData::PhcSync(data) => WorkerState::PhcSync(data),
				};
				self.kick_off();
			},
			WorkerMsg::Message(msg) => match &mut self.state {
				WorkerState::ShortIdSync(data) => {
					if let LightningMessage::ReplyChannelRange(reply) = msg {
						let complete = reply.sync_complete;
						data.ranges.insert(0, reply);
						if complete {
							self.events.deliver(WorkerEvent::ShortIdsComplete {
								peer: self.pair.remote_id,
								ranges: data.ranges.clone(),
							});
						}
					}
				},
				WorkerState::GossipSync(_) => self.process_gossip_message(msg),
				WorkerState::PhcSync(_) => self.process_phc_message(msg),
				_ => {},
			},
			WorkerMsg::HostedMessage(msg) => self.process_phc_message(msg),
			WorkerMsg::Disconnected => {
				log_debug!(self.logger, "sync peer {} disconnected", self.info.node_id);
				self.state = WorkerState::ShutDown;
				self.events.deliver(WorkerEvent::Disconnected {
					peer: self.pair.remote_id,
					supports_extended_queries: true,
				});
			},
			WorkerMsg::Shutdown => {
				self.state = WorkerState::ShutDown;
				self.transport.forget(&self.pair);
			},
		}
	}
}

/// Callbacks the sync master invokes as vetted data becomes available.
pub trait SyncListener: Send + Sync {
	/// A vetted routing snapshot is ready for the router database.
	fn on_chunk_sync_complete(&self, data: PureRoutingData);
	/// The whole sync round is finished.
	fn on_total_sync_complete(&self);
	/// A transit node announced its metadata with a valid signature.
	fn on_node_announcement(&self, ann: NodeAnnouncement) {
		let _ = ann;
	}
}

/// Messages the [`SyncMaster`] consumes.
pub enum MasterMsg {
	/// Initial configuration: candidate peers (at least `max_connections` of
	/// them) and the set of short ids whose endpoints' node announcements are
	/// wanted too.
	Start {
		/// Peers to draw sync connections from.
		candidates: Vec<RemoteNodeInfo>,
		/// Short ids to also request node announcements for.
		request_node_announce: HashSet<u64>,
	},
	/// Spawn one replacement worker, if a fresh peer is available.
	AddSync,
	/// An event reported by one of our workers.
	Worker(WorkerEvent),
}

enum MasterState {
	Waiting,
	ShortIdSync,
	GossipSync,
	ShutDown,
}

struct WorkerHandle {
	mailbox: Mailbox<WorkerMsg>,
	#[allow(dead_code)]
	pair: SessionPair,
}

struct ConfirmedUpdate {
	update: ChannelUpdate,
	reporters: HashSet<PublicKey>,
}

/// Supervises `max_connections` parallel [`SyncWorker`]s, cross-validates
/// what they report, and emits vetted [`PureRoutingData`] snapshots in
/// batches of `chunks_to_wait` completed chunks.
pub struct SyncMaster {
	conf: SyncConfig,
	graph: Arc<dyn GraphSource>,
	transport: Arc<dyn GossipTransport>,
	listener: Arc<dyn SyncListener>,
	logger: Arc<dyn Logger>,
	self_mailbox: Mailbox<MasterMsg>,
	secp_ctx: Secp256k1<secp256k1::SignOnly>,
	state: MasterState,
	candidates: Vec<RemoteNodeInfo>,
	used_peers: HashSet<PublicKey>,
	request_node_announce: HashSet<u64>,
	workers: HashMap<PublicKey, WorkerHandle>,
	ranges: HashMap<PublicKey, Vec<ReplyChannelRange>>,
	proven_short_ids: Arc<HashSet<u64>>,
	gossip_queues: HashMap<PublicKey, VecDeque<QueryShortChannelIds>>,
	orphaned_queues: Vec<VecDeque<QueryShortChannelIds>>,
	confirmed_announces: HashMap<ChannelAnnouncement, HashSet<PublicKey>>,
	confirmed_updates: HashMap<UpdateCore, ConfirmedUpdate>,
	excluded_updates: HashSet<UpdateCore>,
	chunks_left: usize,
}

impl SyncMaster {
	/// Builds a master around an externally created mailbox. Use
	/// [`SyncMaster::spawn`] unless you are driving the machine by hand.
	pub fn new(
		conf: SyncConfig, graph: Arc<dyn GraphSource>, transport: Arc<dyn GossipTransport>,
		listener: Arc<dyn SyncListener>, logger: Arc<dyn Logger>, self_mailbox: Mailbox<MasterMsg>,
	) -> Self {
		let chunks_left = conf.chunks_to_wait;
		SyncMaster {
			conf,
			graph,
			transport,
			listener,
			logger,
			self_mailbox,
			secp_ctx: Secp256k1::signing_only(),
			state: MasterState::Waiting,
			candidates: Vec::new(),
			used_peers: HashSet::new(),
			request_node_announce: HashSet::new(),
			workers: HashMap::new(),
			ranges: HashMap::new(),
			proven_short_ids: Arc::new(HashSet::new()),
			gossip_queues: HashMap::new(),
			orphaned_queues: Vec::new(),
			confirmed_announces: HashMap::new(),
			confirmed_updates: HashMap::new(),
			excluded_updates: HashSet::new(),
			chunks_left,
		}
	}

	/// Spawns the master on its own mailbox. Must be called within a tokio
	/// runtime.
	pub fn spawn(
		conf: SyncConfig, graph: Arc<dyn GraphSource>, transport: Arc<dyn GossipTransport>,
		listener: Arc<dyn SyncListener>, logger: Arc<dyn Logger>,
	) -> Mailbox<MasterMsg> {
		mailbox::spawn(move |self_mailbox| {
			SyncMaster::new(conf, graph, transport, listener, logger, self_mailbox)
		})
	}

	fn add_sync(&mut self) {
		let unused: Vec<&RemoteNodeInfo> =
			self.candidates.iter().filter(|info| !self.used_peers.contains(&info.node_id)).collect();
		let info = match unused.choose(&mut thread_rng()) {
			Some(info) => (*info).clone(),
			None => {
				log_warn!(self.logger, "no unused sync peer candidates left");
				return;
			},
		};
		self.used_peers.insert(info.node_id);
		let pair = SessionPair::random(&self.secp_ctx, info.node_id);
		let worker = SyncWorker::new(
			pair.clone(),
			info.clone(),
			Arc::clone(&self.transport),
			self.self_mailbox.sink_map(MasterMsg::Worker),
			self.conf.chain_hash,
			self.conf.min_capacity_msat,
			None,
			Arc::clone(&self.logger),
		);
		let worker_mailbox = mailbox::spawn(move |_| worker);
		self.transport.listen(pair.clone(), info.clone(), worker_mailbox.clone());

		let phase_data = match self.state {
			MasterState::GossipSync => {
				let queue = self.orphaned_queues.pop().unwrap_or_default();
				self.gossip_queues.insert(info.node_id, queue.clone());
				SyncWorkerData::GossipSync(SyncWorkerGossipData::new(
					Arc::clone(&self.proven_short_ids),
					queue,
				))
			},
			_ => SyncWorkerData::ShortIdSync(SyncWorkerShortIdsData::default()),
		};
		worker_mailbox.send(WorkerMsg::Start(phase_data));
		self.workers.insert(info.node_id, WorkerHandle { mailbox: worker_mailbox, pair });
		log_debug!(self.logger, "added sync worker for peer {}", info.node_id);
	}

	// Runs once all peers answered the range query: establishes which short
	// ids are proven, derives the query list, and moves every worker to the
	// gossip phase. Proven ids are computed first since query derivation
	// consults them.
	fn compute_proofs_and_start_gossip(&mut self) {
		let mut counts: HashMap<u64, usize> = HashMap::new();
		for replies in self.ranges.values() {
			let per_peer: HashSet<u64> = replies
				.iter()
				.filter(|reply| reply.is_holistic())
				.flat_map(|reply| reply.short_channel_ids.iter().copied())
				.collect();
			for short_channel_id in per_peer {
				*counts.entry(short_channel_id).or_insert(0) += 1;
			}
		}
		let proven: HashSet<u64> = counts
			.into_iter()
			.filter(|(_, count)| *count > self.conf.accept_threshold)
			.map(|(short_channel_id, _)| short_channel_id)
			.collect();
		log_info!(self.logger, "{} short channel ids proven by peer majority", proven.len());
		self.proven_short_ids = Arc::new(proven);

		let template_peer = self
			.ranges
			.iter()
			.max_by_key(|(_, replies)| {
				replies
					.iter()
					.filter(|reply| reply.is_holistic())
					.map(|reply| reply.short_channel_ids.len())
					.sum::<usize>()
			})
			.map(|(peer, _)| *peer);
		let queries: VecDeque<QueryShortChannelIds> = match template_peer {
			Some(peer) => self.reply2query(&self.ranges[&peer]).into(),
			None => VecDeque::new(),
		};

		self.state = MasterState::GossipSync;
		self.chunks_left = self.conf.chunks_to_wait;
		self.ranges.clear();
		for (peer, handle) in self.workers.iter() {
			self.gossip_queues.insert(*peer, queries.clone());
			let data = SyncWorkerGossipData::new(Arc::clone(&self.proven_short_ids), queries.clone());
			handle.mailbox.send(WorkerMsg::Start(SyncWorkerData::GossipSync(data)));
		}
	}

	// Turns the largest holistic reply-set into the queries worth asking:
	// everything proven which we either lack entirely or hold stale updates
	// for, chunked into batches of `messages_to_ask`.
	fn reply2query(&self, template: &[ReplyChannelRange]) -> Vec<QueryShortChannelIds> {
		let mut queries = Vec::new();
		for reply in template.iter().filter(|reply| reply.is_holistic()) {
			let mut wanted: Vec<(u64, u8)> = Vec::new();
			for ((short_channel_id, timestamps), checksums) in reply
				.short_channel_ids
				.iter()
				.zip(reply.timestamps.iter())
				.zip(reply.checksums.iter())
			{
				if !self.proven_short_ids.contains(short_channel_id)
					|| self.graph.is_excluded(*short_channel_id)
				{
					continue;
				}
				let mut flag = if !self.graph.contains_channel(*short_channel_id) {
					INCLUDE_CHANNEL_ANNOUNCEMENT | INCLUDE_CHANNEL_UPDATE_1 | INCLUDE_CHANNEL_UPDATE_2
				} else {
					match self.graph.channel_digests(*short_channel_id) {
						Some(ours) => {
							let mut flag = 0u8;
							if should_request_update(
								ours.timestamps.timestamp_1,
								ours.checksums.checksum_1,
								timestamps.timestamp_1,
								checksums.checksum_1,
							) {
								flag |= INCLUDE_CHANNEL_UPDATE_1;
							}
							if should_request_update(
								ours.timestamps.timestamp_2,
								ours.checksums.checksum_2,
								timestamps.timestamp_2,
								checksums.checksum_2,
							) {
								flag |= INCLUDE_CHANNEL_UPDATE_2;
							}
							flag
						},
						None => INCLUDE_CHANNEL_UPDATE_1 | INCLUDE_CHANNEL_UPDATE_2,
					}
				};
				if self.request_node_announce.contains(short_channel_id) {
					flag |= INCLUDE_NODE_ANNOUNCEMENT_1 | INCLUDE_NODE_ANNOUNCEMENT_2;
				}
				if flag != 0 {
					wanted.push((*short_channel_id, flag));
				}
			}
			for batch in wanted.chunks(self.conf.messages_to_ask) {
				queries.push(QueryShortChannelIds {
					chain_hash: self.conf.chain_hash,
					encoding: reply.encoding,
					short_channel_ids: batch.iter().map(|(short_channel_id, _)| *short_channel_id).collect(),
					query_flags: batch.iter().map(|(_, flag)| *flag).collect(),
				});
			}
		}
		queries
	}

	fn fold_chunk(&mut self, peer: PublicKey, chunk: GossipChunk) {
		for ann in chunk.announces {
			self.confirmed_announces.entry(ann).or_default().insert(peer);
		}
		for update in chunk.updates {
			let entry = self
				.confirmed_updates
				.entry(update.core())
				.or_insert_with(|| ConfirmedUpdate { update: update.clone(), reporters: HashSet::new() });
			// Keep one representative update, preferring the freshest copy.
			if update.timestamp > entry.update.timestamp {
				entry.update = update;
			}
			entry.reporters.insert(peer);
		}
		self.excluded_updates.extend(chunk.excluded);
		if let Some(queue) = self.gossip_queues.get_mut(&peer) {
			queue.pop_front();
		}
	}

	// Distills everything that reached the confirmation threshold into one
	// snapshot and evicts it from the accumulators.
	fn emit_snapshot(&mut self, queries_left: usize) {
		let threshold = self.conf.accept_threshold;
		let mut announces = Vec::new();
		self.confirmed_announces.retain(|ann, reporters| {
			if reporters.len() > threshold {
				announces.push(ann.clone());
				false
			} else {
				true
			}
		});
		let mut updates = Vec::new();
		self.confirmed_updates.retain(|_, confirmed| {
			if confirmed.reporters.len() > threshold {
				updates.push(confirmed.update.clone());
				false
			} else {
				true
			}
		});
		let excluded: Vec<UpdateCore> = self.excluded_updates.drain().collect();
		log_info!(
			self.logger,
			"emitting routing snapshot: {} announces, {} updates, {} excluded, {} queries left",
			announces.len(),
			updates.len(),
			excluded.len(),
			queries_left
		);
		self.listener.on_chunk_sync_complete(PureRoutingData { announces, updates, excluded, queries_left });
	}

	fn queries_left_total(&self) -> usize {
		self.gossip_queues.values().map(|queue| queue.len()).sum()
	}
}

impl Actor for SyncMaster {
	type Message = MasterMsg;

	fn process(&mut self, msg: MasterMsg) {
		match msg {
			MasterMsg::Start { candidates, request_node_announce } => {
				if !matches!(self.state, MasterState::Waiting) {
					return;
				}
				if candidates.len() < self.conf.max_connections {
					log_error!(
						self.logger,
						"need at least {} candidate peers, got {}",
						self.conf.max_connections,
						candidates.len()
					);
					return;
				}
				self.candidates = candidates;
				self.request_node_announce = request_node_announce;
				self.state = MasterState::ShortIdSync;
				for _ in 0..self.conf.max_connections {
					self.add_sync();
				}
			},
			MasterMsg::AddSync => self.add_sync(),
			MasterMsg::Worker(event) => match event {
				WorkerEvent::ShortIdsComplete { peer, ranges } => {
					if !matches!(self.state, MasterState::ShortIdSync) {
						return;
					}
					self.ranges.insert(peer, ranges);
					if self.ranges.len() == self.conf.max_connections {
						self.compute_proofs_and_start_gossip();
					}
				},
				WorkerEvent::ChunkComplete { peer, chunk, queries_left: _ } => {
					self.fold_chunk(peer, chunk);
					self.chunks_left = self.chunks_left.saturating_sub(1);
					if self.chunks_left == 0 {
						let queries_left = self.queries_left_total();
						self.emit_snapshot(queries_left);
						self.chunks_left = self.conf.chunks_to_wait;
					}
				},
				WorkerEvent::GossipComplete { peer } => {
					self.workers.remove(&peer);
					self.gossip_queues.remove(&peer);
					if self.workers.is_empty() {
						self.emit_snapshot(0);
						self.confirmed_announces.clear();
						self.confirmed_updates.clear();
						self.excluded_updates.clear();
						self.listener.on_total_sync_complete();
						self.state = MasterState::ShutDown;
						log_info!(self.logger, "gossip sync complete");
					}
				},
				WorkerEvent::NodeAnnouncement(ann) => self.listener.on_node_announcement(ann),
				WorkerEvent::Disconnected { peer, supports_extended_queries } => {
					if self.workers.remove(&peer).is_none() {
						return;
					}
					self.ranges.remove(&peer);
					if let Some(queue) = self.gossip_queues.remove(&peer) {
						self.orphaned_queues.push(queue);
					}
					if !supports_extended_queries {
						self.candidates.retain(|info| info.node_id != peer);
					}
					if matches!(self.state, MasterState::ShortIdSync | MasterState::GossipSync) {
						self.self_mailbox.send_delayed(
							MasterMsg::AddSync,
							Duration::from_millis(self.conf.reconnect_delay_msec),
						);
					}
				},
				WorkerEvent::PhcComplete { .. } => {},
			},
		}
	}
}

/// Callback the hosted-channel sync master invokes on completion.
pub trait PhcSyncListener: Send + Sync {
	/// One full hosted channel sync round finished.
	fn on_phc_sync_complete(&self, data: CompleteHostedRoutingData);
}

/// Messages the [`PhcSyncMaster`] consumes.
pub enum PhcMasterMsg {
	/// Begin syncing from the given hosted-channel-aware peer.
	Start(RemoteNodeInfo),
	/// Spawn a replacement worker towards the same peer.
	AddSync,
	/// An event reported by the worker.
	Worker(WorkerEvent),
}

enum PhcMasterState {
	Waiting,
	Syncing,
	ShutDown,
}

/// Single-worker sync supervisor for private hosted channels. Retries a
/// bounded number of times with a backoff, then gives up silently: hosted
/// gossip is a nicety, not a necessity.
pub struct PhcSyncMaster {
	conf: PhcConfig,
	graph: Arc<dyn GraphSource>,
	transport: Arc<dyn GossipTransport>,
	listener: Arc<dyn PhcSyncListener>,
	logger: Arc<dyn Logger>,
	self_mailbox: Mailbox<PhcMasterMsg>,
	secp_ctx: Secp256k1<secp256k1::SignOnly>,
	state: PhcMasterState,
	info: Option<RemoteNodeInfo>,
	attempts_left: u32,
}

impl PhcSyncMaster {
	/// Builds a master around an externally created mailbox.
	pub fn new(
		conf: PhcConfig, graph: Arc<dyn GraphSource>, transport: Arc<dyn GossipTransport>,
		listener: Arc<dyn PhcSyncListener>, logger: Arc<dyn Logger>,
		self_mailbox: Mailbox<PhcMasterMsg>,
	) -> Self {
		let attempts_left = conf.sync_attempts;
		PhcSyncMaster {
			conf,
			graph,
			transport,
			listener,
			logger,
			self_mailbox,
			secp_ctx: Secp256k1::signing_only(),
			state: PhcMasterState::Waiting,
			info: None,
			attempts_left,
		}
	}

	/// Spawns the master on its own mailbox. Must be called within a tokio
	/// runtime.
	pub fn spawn(
		conf: PhcConfig, graph: Arc<dyn GraphSource>, transport: Arc<dyn GossipTransport>,
		listener: Arc<dyn PhcSyncListener>, logger: Arc<dyn Logger>,
	) -> Mailbox<PhcMasterMsg> {
		mailbox::spawn(move |self_mailbox| {
			PhcSyncMaster::new(conf, graph, transport, listener, logger, self_mailbox)
		})
	}

	fn add_sync(&mut self) {
		let info = match &self.info {
			Some(info) => info.clone(),
			None => return,
		};
		let pair = SessionPair::random(&self.secp_ctx, info.node_id);
		let worker = SyncWorker::new(
			pair.clone(),
			info.clone(),
			Arc::clone(&self.transport),
			self.self_mailbox.sink_map(PhcMasterMsg::Worker),
			self.conf.chain_hash,
			0,
			Some(PhcContext { conf: self.conf.clone(), graph: Arc::clone(&self.graph) }),
			Arc::clone(&self.logger),
		);
		let worker_mailbox = mailbox::spawn(move |_| worker);
		self.transport.listen(pair, info, worker_mailbox.clone());
		worker_mailbox.send(WorkerMsg::Start(SyncWorkerData::PhcSync(SyncWorkerPhcData::default())));
	}
}

impl Actor for PhcSyncMaster {
	type Message = PhcMasterMsg;

	fn process(&mut self, msg: PhcMasterMsg) {
		match msg {
			PhcMasterMsg::Start(info) => {
				if !matches!(self.state, PhcMasterState::Waiting) {
					return;
				}
				self.info = Some(info);
				self.state = PhcMasterState::Syncing;
				self.add_sync();
			},
			PhcMasterMsg::AddSync => {
				if matches!(self.state, PhcMasterState::Syncing) {
					self.add_sync();
				}
			},
			PhcMasterMsg::Worker(WorkerEvent::PhcComplete { data, .. }) => {
				if matches!(self.state, PhcMasterState::Syncing) {
					self.state = PhcMasterState::ShutDown;
					self.listener.on_phc_sync_complete(data);
				}
			},
			PhcMasterMsg::Worker(WorkerEvent::Disconnected { .. }) => {
				if !matches!(self.state, PhcMasterState::Syncing) {
					return;
				}
				self.attempts_left = self.attempts_left.saturating_sub(1);
				if self.attempts_left > 0 {
					self.self_mailbox.send_delayed(
						PhcMasterMsg::AddSync,
						Duration::from_millis(self.conf.reconnect_delay_msec),
					);
				} else {
					log_debug!(self.logger, "hosted channel sync out of attempts, giving up");
					self.state = PhcMasterState::ShutDown;
				}
			},
			PhcMasterMsg::Worker(_) => {},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::msgs::{Checksums, InitFeatures, ReplyShortChannelIdsEnd, ShortIdEncoding, Timestamps};
	use crate::util::test_utils::{self, TestGraph, TestLogger, TestSyncListener, TestTransport};

	fn worker_for_tests(
		transport: Arc<TestTransport>, events: MessageSink<WorkerEvent>, phc: Option<PhcContext>,
	) -> SyncWorker {
		let secp_ctx = Secp256k1::new();
		let (_, peer) = test_utils::test_key(99);
		SyncWorker::new(
			SessionPair::random(&secp_ctx, peer),
			test_utils::remote_info(peer),
			transport,
			events,
			SyncConfig::default().chain_hash,
			1_000_000,
			phc,
			Arc::new(TestLogger::new()),
		)
	}

	fn extended_init() -> Init {
		let mut features = InitFeatures::empty();
		features.set_feature_bit(11);
		Init { features }
	}

	fn range_reply(short_channel_ids: Vec<u64>, sync_complete: bool) -> ReplyChannelRange {
		let len = short_channel_ids.len();
		ReplyChannelRange {
			chain_hash: SyncConfig::default().chain_hash,
			first_blocknum: 0,
			number_of_blocks: u32::MAX,
			sync_complete,
			encoding: ShortIdEncoding::Uncompressed,
			short_channel_ids,
			timestamps: vec![Timestamps { timestamp_1: 1, timestamp_2: 1 }; len],
			checksums: vec![Checksums { checksum_1: 1, checksum_2: 1 }; len],
		}
	}

	#[test]
	fn worker_evicts_peer_without_extended_queries() {
		let transport = Arc::new(TestTransport::new());
		let events = Mailbox::<WorkerEvent>::collector();
		let mut worker = worker_for_tests(Arc::clone(&transport), events.sink(), None);
		worker.process(WorkerMsg::Start(SyncWorkerData::ShortIdSync(Default::default())));
		worker.process(WorkerMsg::Operational { init: Init { features: InitFeatures::empty() } });
		assert_eq!(transport.forgotten.lock().unwrap().len(), 1);
		match events.drain().as_slice() {
			[WorkerEvent::Disconnected { supports_extended_queries: false, .. }] => {},
			other => panic!("unexpected events: {}", other.len()),
		}
		// Terminal: later traffic is ignored.
		worker.process(WorkerMsg::Message(LightningMessage::ReplyChannelRange(range_reply(vec![1], true))));
		assert!(events.drain().is_empty());
	}

	#[test]
	fn worker_short_id_phase_accumulates_and_completes() {
		let transport = Arc::new(TestTransport::new());
		let events = Mailbox::<WorkerEvent>::collector();
		let mut worker = worker_for_tests(Arc::clone(&transport), events.sink(), None);
		worker.process(WorkerMsg::Start(SyncWorkerData::ShortIdSync(Default::default())));
		worker.process(WorkerMsg::Operational { init: extended_init() });
		// Becoming operational fires the opening range query.
		let sent = transport.sent.lock().unwrap().clone();
		assert!(matches!(sent[0].0[0], LightningMessage::QueryChannelRange(_)));

		worker.process(WorkerMsg::Message(LightningMessage::ReplyChannelRange(range_reply(vec![1, 2], false))));
		assert!(events.drain().is_empty());
		worker.process(WorkerMsg::Message(LightningMessage::ReplyChannelRange(range_reply(vec![3], true))));
		match events.drain().as_slice() {
			[WorkerEvent::ShortIdsComplete { ranges, .. }] => {
				// Prepending puts the final block first.
				assert_eq!(ranges.len(), 2);
				assert_eq!(ranges[0].short_channel_ids, vec![3]);
			},
			_ => panic!("expected short ids completion"),
		}
	}

	fn gossip_data_with_queries(proven: Vec<u64>, batches: usize) -> SyncWorkerGossipData {
		let queue: VecDeque<QueryShortChannelIds> = (0..batches)
			.map(|_| QueryShortChannelIds {
				chain_hash: SyncConfig::default().chain_hash,
				encoding: ShortIdEncoding::Uncompressed,
				short_channel_ids: proven.clone(),
				query_flags: vec![INCLUDE_CHANNEL_ANNOUNCEMENT; proven.len()],
			})
			.collect();
		SyncWorkerGossipData::new(Arc::new(proven.into_iter().collect()), queue)
	}

	#[test]
	fn worker_gossip_phase_filters_by_proven_ids() {
		let transport = Arc::new(TestTransport::new());
		let events = Mailbox::<WorkerEvent>::collector();
		let mut worker = worker_for_tests(Arc::clone(&transport), events.sink(), None);
		worker.process(WorkerMsg::Operational { init: extended_init() });
		worker.process(WorkerMsg::Start(SyncWorkerData::GossipSync(gossip_data_with_queries(vec![42], 2))));

		let (_, a) = test_utils::test_key(1);
		let (_, b) = test_utils::test_key(2);
		// Announcement for a proven id is kept, an unproven one is dropped.
		worker.process(WorkerMsg::Message(LightningMessage::ChannelAnnouncement(
			test_utils::channel_announcement(42, a, b),
		)));
		worker.process(WorkerMsg::Message(LightningMessage::ChannelAnnouncement(
			test_utils::channel_announcement(43, a, b),
		)));
		// A proven update below the capacity floor lands in excluded.
		let mut poor = test_utils::dummy_channel_update(42, 1, 0);
		poor.htlc_maximum_msat = Some(1_000);
		worker.process(WorkerMsg::Message(LightningMessage::ChannelUpdate(poor)));
		let good = test_utils::dummy_channel_update(42, 1, 1);
		worker.process(WorkerMsg::Message(LightningMessage::ChannelUpdate(good)));

		// Node announcements pass through only with a valid signature.
		let (node_secret, _) = test_utils::test_key(3);
		worker.process(WorkerMsg::Message(LightningMessage::NodeAnnouncement(
			test_utils::signed_node_announcement(&node_secret),
		)));
		let mut forged = test_utils::signed_node_announcement(&node_secret);
		forged.timestamp += 1;
		worker.process(WorkerMsg::Message(LightningMessage::NodeAnnouncement(forged)));
		match events.drain().as_slice() {
			[WorkerEvent::NodeAnnouncement(ann)] => {
				assert!(ann.signature.is_some());
			},
			other => panic!("expected one valid node announcement, got {}", other.len()),
		}

		worker.process(WorkerMsg::Message(LightningMessage::ReplyShortChannelIdsEnd(
			ReplyShortChannelIdsEnd { chain_hash: SyncConfig::default().chain_hash, full_information: true },
		)));
		match events.drain().as_slice() {
			[WorkerEvent::ChunkComplete { chunk, queries_left, .. }] => {
				assert_eq!(chunk.announces.len(), 1);
				assert_eq!(chunk.announces[0].short_channel_id, 42);
				assert!(chunk.announces[0].node_signature_1.is_none());
				assert_eq!(chunk.updates.len(), 1);
				assert_eq!(chunk.excluded.len(), 1);
				assert_eq!(*queries_left, 1);
			},
			_ => panic!("expected chunk completion"),
		}
		// The next batch went out by itself.
		let sent = transport.sent.lock().unwrap().clone();
		assert!(matches!(sent.last().unwrap().0[0], LightningMessage::QueryShortChannelIds(_)));

		// Draining the queue completes gossip and shuts the worker down.
		worker.process(WorkerMsg::Message(LightningMessage::ReplyShortChannelIdsEnd(
			ReplyShortChannelIdsEnd { chain_hash: SyncConfig::default().chain_hash, full_information: true },
		)));
		let drained = events.drain();
		assert!(matches!(drained[0], WorkerEvent::ChunkComplete { .. }));
		assert!(matches!(drained[1], WorkerEvent::GossipComplete { .. }));
		assert_eq!(transport.forgotten.lock().unwrap().len(), 1);
	}

	#[test]
	fn phc_worker_admission() {
		let transport = Arc::new(TestTransport::new());
		let events = Mailbox::<WorkerEvent>::collector();
		let graph = Arc::new(TestGraph::new());
		let (secret_a, a) = test_utils::test_key(1);
		let (_, b) = test_utils::test_key(2);
		let (_, c) = test_utils::test_key(3);
		graph.set_adjacency(a, 10);
		graph.set_adjacency(b, 10);
		// c has too few public channels to be taken seriously.
		graph.set_adjacency(c, 1);
		let phc = PhcContext { conf: PhcConfig::default(), graph };
		let mut worker = worker_for_tests(Arc::clone(&transport), events.sink(), Some(phc));
		worker.process(WorkerMsg::Operational { init: extended_init() });
		worker.process(WorkerMsg::Start(SyncWorkerData::PhcSync(Default::default())));

		let good_scid = hosted_short_channel_id(&a, &b);
		let mut ann = test_utils::channel_announcement(good_scid, a, b);
		ann.features.set_feature_bit(crate::ln::msgs::HOSTED_CHANNELS_OPTIONAL);
		worker.process(WorkerMsg::HostedMessage(LightningMessage::ChannelAnnouncement(ann.clone())));

		// Wrong scid hash: rejected outright.
		let mut bad = test_utils::channel_announcement(12345, a, b);
		bad.features.set_feature_bit(crate::ln::msgs::HOSTED_CHANNELS_OPTIONAL);
		worker.process(WorkerMsg::HostedMessage(LightningMessage::ChannelAnnouncement(bad)));

		// Under-connected endpoint: rejected.
		let mut weak = test_utils::channel_announcement(hosted_short_channel_id(&a, &c), a, c);
		weak.features.set_feature_bit(crate::ln::msgs::HOSTED_CHANNELS_OPTIONAL);
		worker.process(WorkerMsg::HostedMessage(LightningMessage::ChannelAnnouncement(weak)));

		// A correctly signed update for the accepted channel, direction one,
		// with capacity inside the window.
		let mut update = test_utils::signed_channel_update(&secret_a, good_scid, 700_000, 0);
		update.htlc_maximum_msat = Some(PhcConfig::default().min_capacity_msat + 1);
		let update = test_utils::resign_channel_update(&secret_a, update);
		worker.process(WorkerMsg::HostedMessage(LightningMessage::ChannelUpdate(update.clone())));
		// The same direction twice: second copy ignored.
		worker.process(WorkerMsg::HostedMessage(LightningMessage::ChannelUpdate(update)));

		worker.process(WorkerMsg::HostedMessage(LightningMessage::ReplyPublicHostedChannelsEnd(
			crate::ln::msgs::ReplyPublicHostedChannelsEnd { chain_hash: SyncConfig::default().chain_hash },
		)));
		match events.drain().as_slice() {
			[WorkerEvent::PhcComplete { data, .. }] => {
				assert_eq!(data.announces.len(), 1);
				assert_eq!(data.announces[0].short_channel_id, good_scid);
				assert_eq!(data.updates.len(), 1);
			},
			_ => panic!("expected phc completion"),
		}
	}

	struct MasterRig {
		master: SyncMaster,
		mailbox: Mailbox<MasterMsg>,
		transport: Arc<TestTransport>,
		listener: Arc<TestSyncListener>,
	}

	fn master_rig(conf: SyncConfig) -> MasterRig {
		let transport = Arc::new(TestTransport::new());
		let listener = Arc::new(TestSyncListener::new());
		let mailbox = Mailbox::<MasterMsg>::collector();
		let master = SyncMaster::new(
			conf,
			Arc::new(TestGraph::new()),
			Arc::clone(&transport) as Arc<dyn GossipTransport>,
			Arc::clone(&listener) as Arc<dyn SyncListener>,
			Arc::new(TestLogger::new()),
			mailbox.clone(),
		);
		MasterRig { master, mailbox, transport, listener }
	}

	fn start_master(rig: &mut MasterRig, candidates: usize) -> Vec<PublicKey> {
		let candidates: Vec<RemoteNodeInfo> = (0..candidates)
			.map(|i| {
				let (_, node_id) = test_utils::test_key(50 + i as u8);
				test_utils::remote_info(node_id)
			})
			.collect();
		rig.master.process(MasterMsg::Start { candidates, request_node_announce: HashSet::new() });
		rig.transport.listens.lock().unwrap().iter().map(|(pair, ..)| pair.remote_id).collect()
	}

	#[tokio::test]
	async fn majority_proof_drives_query_derivation() {
		// Four peers, threshold two: an id reported by three peers is proven,
		// an id reported by one is not even asked about.
		let conf = SyncConfig { max_connections: 4, accept_threshold: 2, ..Default::default() };
		let mut rig = master_rig(conf);
		let peers = start_master(&mut rig, 4);
		assert_eq!(peers.len(), 4);

		for (i, peer) in peers.iter().enumerate() {
			let ids = if i < 3 { vec![0xA] } else { vec![0xB] };
			rig.master.process(MasterMsg::Worker(WorkerEvent::ShortIdsComplete {
				peer: *peer,
				ranges: vec![range_reply(ids, true)],
			}));
		}
		assert_eq!(rig.master.proven_short_ids.as_ref(), &[0xA].into_iter().collect::<HashSet<u64>>());
		for queue in rig.master.gossip_queues.values() {
			// 0xB appears in no emitted query.
			for query in queue.iter() {
				assert!(!query.short_channel_ids.contains(&0xB));
			}
		}
	}

	#[tokio::test]
	async fn reply2query_compares_digests_and_adds_node_announce_flags() {
		let conf = SyncConfig { max_connections: 2, accept_threshold: 1, ..Default::default() };
		let transport = Arc::new(TestTransport::new());
		let listener = Arc::new(TestSyncListener::new());
		let graph = Arc::new(TestGraph::new());
		// 0xA is known with digests matching the peer's exactly, 0xB is known
		// but stale in direction one.
		let same = Timestamps { timestamp_1: 1, timestamp_2: 1 };
		let checks = Checksums { checksum_1: 1, checksum_2: 1 };
		graph.insert_channel(0xA, crate::routing::gossip::UpdateDigests { timestamps: same, checksums: checks });
		graph.insert_channel(0xB, crate::routing::gossip::UpdateDigests {
			timestamps: Timestamps { timestamp_1: 0, timestamp_2: 1 },
			checksums: checks,
		});
		// 0xD was excluded by an earlier sync round.
		graph.exclude(0xD);
		let mailbox = Mailbox::<MasterMsg>::collector();
		let mut master = SyncMaster::new(
			conf,
			graph,
			Arc::clone(&transport) as Arc<dyn GossipTransport>,
			listener as Arc<dyn SyncListener>,
			Arc::new(TestLogger::new()),
			mailbox,
		);
		let candidates: Vec<RemoteNodeInfo> = (0..2)
			.map(|i| {
				let (_, node_id) = test_utils::test_key(50 + i as u8);
				test_utils::remote_info(node_id)
			})
			.collect();
		master.process(MasterMsg::Start {
			candidates,
			request_node_announce: [0xA].into_iter().collect(),
		});
		let peers: Vec<PublicKey> =
			transport.listens.lock().unwrap().iter().map(|(pair, ..)| pair.remote_id).collect();
		for peer in peers {
			master.process(MasterMsg::Worker(WorkerEvent::ShortIdsComplete {
				peer,
				ranges: vec![range_reply(vec![0xA, 0xB, 0xC, 0xD], true)],
			}));
		}

		let queue = master.gossip_queues.values().next().unwrap();
		assert_eq!(queue.len(), 1);
		let query = &queue[0];
		let flags: std::collections::HashMap<u64, u8> = query
			.short_channel_ids
			.iter()
			.copied()
			.zip(query.query_flags.iter().copied())
			.collect();
		// Fresh on both sides, but its node announcements were asked for.
		assert_eq!(flags[&0xA], INCLUDE_NODE_ANNOUNCEMENT_1 | INCLUDE_NODE_ANNOUNCEMENT_2);
		// Known channel, stale copy of direction one only.
		assert_eq!(flags[&0xB], INCLUDE_CHANNEL_UPDATE_1);
		// Unknown channel: ask for everything.
		assert_eq!(
			flags[&0xC],
			INCLUDE_CHANNEL_ANNOUNCEMENT | INCLUDE_CHANNEL_UPDATE_1 | INCLUDE_CHANNEL_UPDATE_2
		);
		// Previously excluded channels are never asked about again.
		assert!(!flags.contains_key(&0xD));
	}

	#[tokio::test]
	async fn non_holistic_ranges_are_discarded() {
		let conf = SyncConfig { max_connections: 2, accept_threshold: 1, ..Default::default() };
		let mut rig = master_rig(conf);
		let peers = start_master(&mut rig, 2);

		let mut broken = range_reply(vec![0xC], true);
		broken.timestamps.pop();
		rig.master.process(MasterMsg::Worker(WorkerEvent::ShortIdsComplete {
			peer: peers[0],
			ranges: vec![broken],
		}));
		rig.master.process(MasterMsg::Worker(WorkerEvent::ShortIdsComplete {
			peer: peers[1],
			ranges: vec![range_reply(vec![0xC], true)],
		}));
		// Only one holistic report: below the threshold of two distinct peers.
		assert!(rig.master.proven_short_ids.is_empty());
	}

	#[tokio::test]
	async fn chunk_folding_is_idempotent_per_reporter() {
		let conf = SyncConfig { max_connections: 2, accept_threshold: 1, chunks_to_wait: 100, ..Default::default() };
		let mut rig = master_rig(conf);
		let peers = start_master(&mut rig, 2);
		let (_, a) = test_utils::test_key(1);
		let (_, b) = test_utils::test_key(2);
		let ann = test_utils::channel_announcement(7, a, b);

		let chunk = |ann: &ChannelAnnouncement| GossipChunk {
			announces: vec![ann.clone()],
			updates: vec![test_utils::dummy_channel_update(7, 1, 0)],
			excluded: Vec::new(),
		};
		// The same peer reporting twice counts once.
		rig.master.process(MasterMsg::Worker(WorkerEvent::ChunkComplete {
			peer: peers[0], chunk: chunk(&ann), queries_left: 0,
		}));
		rig.master.process(MasterMsg::Worker(WorkerEvent::ChunkComplete {
			peer: peers[0], chunk: chunk(&ann), queries_left: 0,
		}));
		assert_eq!(rig.master.confirmed_announces[&ann].len(), 1);

		rig.master.process(MasterMsg::Worker(WorkerEvent::ChunkComplete {
			peer: peers[1], chunk: chunk(&ann), queries_left: 0,
		}));
		assert_eq!(rig.master.confirmed_announces[&ann].len(), 2);
	}

	#[tokio::test]
	async fn snapshots_emit_only_confirmed_data() {
		let conf = SyncConfig { max_connections: 2, accept_threshold: 1, chunks_to_wait: 2, ..Default::default() };
		let mut rig = master_rig(conf);
		let peers = start_master(&mut rig, 2);
		let (_, a) = test_utils::test_key(1);
		let (_, b) = test_utils::test_key(2);
		let confirmed_ann = test_utils::channel_announcement(7, a, b);
		let lone_ann = test_utils::channel_announcement(8, a, b);

		rig.master.process(MasterMsg::Worker(WorkerEvent::ChunkComplete {
			peer: peers[0],
			chunk: GossipChunk {
				announces: vec![confirmed_ann.clone(), lone_ann.clone()],
				updates: vec![test_utils::dummy_channel_update(7, 1, 0)],
				excluded: Vec::new(),
			},
			queries_left: 0,
		}));
		rig.master.process(MasterMsg::Worker(WorkerEvent::ChunkComplete {
			peer: peers[1],
			chunk: GossipChunk {
				announces: vec![confirmed_ann.clone()],
				updates: vec![test_utils::dummy_channel_update(7, 1, 0)],
				excluded: Vec::new(),
			},
			queries_left: 0,
		}));
		let snapshots = rig.listener.snapshots.lock().unwrap();
		assert_eq!(snapshots.len(), 1);
		// P1: only the announcement confirmed by two distinct peers made it.
		assert_eq!(snapshots[0].announces, vec![confirmed_ann.clone()]);
		// P2: the update core had two reporters as well.
		assert_eq!(snapshots[0].updates.len(), 1);
		drop(snapshots);

		// Emitted entries were evicted: the lone announcement is still
		// pending, the confirmed one is gone.
		assert!(rig.master.confirmed_announces.contains_key(&lone_ann));
		assert!(!rig.master.confirmed_announces.contains_key(&confirmed_ann));
	}

	#[tokio::test]
	async fn disconnect_schedules_replacement_and_evicts_non_extended_peers() {
		let conf = SyncConfig { max_connections: 2, accept_threshold: 1, ..Default::default() };
		let mut rig = master_rig(conf);
		let peers = start_master(&mut rig, 3);
		assert_eq!(rig.master.workers.len(), 2);

		rig.master.process(MasterMsg::Worker(WorkerEvent::Disconnected {
			peer: peers[0],
			supports_extended_queries: false,
		}));
		assert_eq!(rig.master.workers.len(), 1);
		// Evicted from the candidate pool entirely.
		assert!(rig.master.candidates.iter().all(|info| info.node_id != peers[0]));
		// A replacement was scheduled on our own mailbox.
		let queued = rig.mailbox.drain();
		assert!(matches!(queued.as_slice(), [MasterMsg::AddSync]));
	}

	#[tokio::test]
	async fn completion_flushes_and_notifies() {
		let conf = SyncConfig { max_connections: 1, accept_threshold: 0, chunks_to_wait: 100, ..Default::default() };
		let mut rig = master_rig(conf);
		let peers = start_master(&mut rig, 1);
		let (_, a) = test_utils::test_key(1);
		let (_, b) = test_utils::test_key(2);

		rig.master.process(MasterMsg::Worker(WorkerEvent::ChunkComplete {
			peer: peers[0],
			chunk: GossipChunk {
				announces: vec![test_utils::channel_announcement(7, a, b)],
				updates: Vec::new(),
				excluded: Vec::new(),
			},
			queries_left: 0,
		}));
		rig.master.process(MasterMsg::Worker(WorkerEvent::GossipComplete { peer: peers[0] }));

		let snapshots = rig.listener.snapshots.lock().unwrap();
		assert_eq!(snapshots.len(), 1);
		assert_eq!(snapshots[0].queries_left, 0);
		assert_eq!(snapshots[0].announces.len(), 1);
		assert!(*rig.listener.total_complete.lock().unwrap());
	}

	#[tokio::test]
	async fn node_announcements_are_forwarded_to_the_listener() {
		let conf = SyncConfig { max_connections: 1, ..Default::default() };
		let mut rig = master_rig(conf);
		start_master(&mut rig, 1);
		let (node_secret, _) = test_utils::test_key(3);
		rig.master.process(MasterMsg::Worker(WorkerEvent::NodeAnnouncement(
			test_utils::signed_node_announcement(&node_secret),
		)));
		assert_eq!(rig.listener.node_announcements.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn phc_master_retries_then_gives_up() {
		let transport = Arc::new(TestTransport::new());
		let listener = Arc::new(test_utils::TestPhcListener::new());
		let mailbox = Mailbox::<PhcMasterMsg>::collector();
		let conf = PhcConfig { sync_attempts: 2, ..Default::default() };
		let mut master = PhcSyncMaster::new(
			conf,
			Arc::new(TestGraph::new()),
			Arc::clone(&transport) as Arc<dyn GossipTransport>,
			Arc::clone(&listener) as Arc<dyn PhcSyncListener>,
			Arc::new(TestLogger::new()),
			mailbox.clone(),
		);
		let (_, peer) = test_utils::test_key(60);
		master.process(PhcMasterMsg::Start(test_utils::remote_info(peer)));
		assert_eq!(transport.listens.lock().unwrap().len(), 1);

		// First disconnect schedules a retry.
		master.process(PhcMasterMsg::Worker(WorkerEvent::Disconnected {
			peer,
			supports_extended_queries: true,
		}));
		assert!(matches!(mailbox.drain().as_slice(), [PhcMasterMsg::AddSync]));

		// Second disconnect exhausts the budget: silence.
		master.process(PhcMasterMsg::Worker(WorkerEvent::Disconnected {
			peer,
			supports_extended_queries: true,
		}));
		assert!(mailbox.drain().is_empty());
		assert!(listener.completions.lock().unwrap().is_empty());
	}
}
