// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-payment state machine. A payment is split into shards, each shard
//! carried by its own onion with a fresh random session key whose public form
//! doubles as the shard id. Shards are assigned to local channels, retried
//! across channels on local failures, retried across routes on remote
//! failures, subdivided when capacity is fragmented, and reconciled against
//! channel HTLC snapshots before the payment is declared settled.

use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};

use rand::seq::SliceRandom;
use rand::{thread_rng, RngCore};

use crate::ln::msgs::{UpdateFailHtlc, UpdateFailMalformedHtlc};
use crate::ln::onion_utils::{
	build_payment_payloads, create_payment_packet, process_onion_failure, DecodedFailurePacket,
	PacketAndSecrets,
};
use crate::ln::payment_master::OutgoingPaymentMaster;
use crate::ln::{ChannelId, FullPaymentTag, PaymentHash, PaymentPreimage, PaymentSecret};
use crate::routing::router::{Route, RouteRequest};

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

/// How a payment's amount is shared between this node and other contributors
/// (for our own payments `my_part` is the whole sum).
#[derive(Copy, Clone, Debug)]
pub struct SplitInfo {
	/// The payment's full amount across every contributor, in milli-satoshi.
	pub total_sum_msat: u64,
	/// The portion this node must deliver, in milli-satoshi.
	pub my_part_msat: u64,
}

/// A local channel able to carry outgoing shards, together with its current
/// commitment view. The channel actor itself is external; this is the call
/// surface the payment engine needs from it.
pub trait OutgoingChannel: Send + Sync {
	/// The channel's funding-derived id.
	fn channel_id(&self) -> ChannelId;
	/// The peer on the other side.
	fn peer_node_id(&self) -> PublicKey;
	/// Whether the channel is connected and usable right now.
	fn is_operational(&self) -> bool;
	/// Whether the channel exists but its peer is offline, with a chance of
	/// coming back.
	fn is_sleeping(&self) -> bool;
	/// Spendable balance right now, in milli-satoshi.
	fn available_for_send_msat(&self) -> u64;
	/// Policy ceiling on the total in-flight amount, in milli-satoshi.
	fn max_send_in_flight_msat(&self) -> u64;
	/// Smallest HTLC the peer accepts, in milli-satoshi.
	fn min_sendable_msat(&self) -> u64;
	/// How many more outgoing HTLCs the commitment can hold.
	fn outgoing_htlc_slots_left(&self) -> usize;
	/// Submits an HTLC. The channel answers through its event stream.
	fn send_add_htlc(&self, cmd: CmdAddHtlc);
}

/// Shared handle to an [`OutgoingChannel`].
pub type OutgoingChannelRef = Arc<dyn OutgoingChannel>;

/// The command handed to a channel to launch one shard.
#[derive(Clone)]
pub struct CmdAddHtlc {
	/// The payment this shard belongs to.
	pub full_tag: FullPaymentTag,
	/// The shard's id: its onion session public key.
	pub part_id: PublicKey,
	/// The hash the HTLC settles against.
	pub payment_hash: PaymentHash,
	/// First-hop amount: the shard amount plus all routing fees.
	pub first_amount_msat: u64,
	/// First-hop CLTV expiry, absolute block height.
	pub cltv_expiry: u32,
	/// The onion and the secrets to read failures with.
	pub packet_and_secrets: PacketAndSecrets,
}

/// Why the local channel refused to launch a shard.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LocalRejectReason {
	/// The command can never succeed no matter the channel state.
	InPrincipleNotSendable,
	/// The channel's peer is not connected.
	ChannelOffline,
	/// The channel cannot take this HTLC right now.
	NotAbleToSend,
}

/// A channel's refusal to launch a shard.
#[derive(Clone)]
pub struct LocalReject {
	/// Why.
	pub reason: LocalRejectReason,
	/// The refused command.
	pub local_add: CmdAddHtlc,
}

/// The remote end settled a shard with its preimage.
#[derive(Clone)]
pub struct RemoteFulfill {
	/// The settled command.
	pub our_add: CmdAddHtlc,
	/// The revealed preimage.
	pub preimage: PaymentPreimage,
}

/// The remote end failed a shard with an encrypted failure onion.
#[derive(Clone)]
pub struct RemoteUpdateFail {
	/// The failed command.
	pub our_add: CmdAddHtlc,
	/// The raw failure message.
	pub fail: UpdateFailHtlc,
}

/// The direct peer could not parse a shard's onion at all.
#[derive(Clone)]
pub struct RemoteUpdateMalform {
	/// The failed command.
	pub our_add: CmdAddHtlc,
	/// The raw failure message.
	pub fail: UpdateFailMalformedHtlc,
}

/// A snapshot of outstanding HTLCs across every local channel, keyed by
/// payment tag. Snapshots are strictly ordered after the channel events that
/// produced them, which is what makes "nothing left anywhere" a safe success
/// finalization signal.
#[derive(Clone, Debug, Default)]
pub struct InFlightPayments {
	/// Outgoing HTLC counts per payment tag.
	pub out: HashMap<FullPaymentTag, u32>,
}

impl InFlightPayments {
	/// Whether any channel still holds an HTLC for the tag.
	pub fn has_out_leftovers(&self, tag: &FullPaymentTag) -> bool {
		self.out.get(tag).copied().unwrap_or(0) > 0
	}
}

/// User-visible reasons a payment failed without a remote message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LocalFailureReason {
	/// The path-finder ran dry for a shard with no channels left to try.
	NoRoutesFound,
	/// Local balance cannot cover the payment.
	NotEnoughFunds,
	/// A channel judged the payment impossible in principle.
	PaymentNotSendable,
	/// A shard exhausted its remote retry budget.
	RunOutOfRetryAttempts,
	/// Every capable local channel rejected a shard.
	RunOutOfCapableChannels,
	/// The direct peer could not parse the onion we gave it.
	NodeCouldNotParseOnion,
	/// Something failed and retrying is pointless.
	NotRetryingNoDetails,
	/// Waiting for a sleeping channel to come online timed out.
	TimedOut,
}

impl fmt::Display for LocalFailureReason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			LocalFailureReason::NoRoutesFound => "no-routes-found",
			LocalFailureReason::NotEnoughFunds => "not-enough-funds",
			LocalFailureReason::PaymentNotSendable => "payment-not-sendable",
			LocalFailureReason::RunOutOfRetryAttempts => "run-out-of-retry-attempts",
			LocalFailureReason::RunOutOfCapableChannels => "run-out-of-capable-channels",
			LocalFailureReason::NodeCouldNotParseOnion => "node-could-not-parse-onion",
			LocalFailureReason::NotRetryingNoDetails => "not-retrying-no-details",
			LocalFailureReason::TimedOut => "timed-out",
		})
	}
}

/// One recorded shard failure.
#[derive(Clone, Debug)]
pub enum PaymentFailure {
	/// A failure generated locally.
	Local {
		/// Why.
		reason: LocalFailureReason,
		/// The shard amount affected, in milli-satoshi.
		amount_msat: u64,
	},
	/// A decrypted failure from a route node, BOLT 4 message intact.
	RemoteFailure {
		/// The decrypted failure.
		packet: DecodedFailurePacket,
		/// The route the shard took.
		route: Route,
	},
	/// A failure onion no hop's secrets could open.
	UnreadableRemoteFailure {
		/// The route the shard took.
		route: Route,
	},
}

/// An HTLC attempt attached to a shard.
#[derive(Clone)]
pub struct InFlightInfo {
	/// The submitted command.
	pub cmd: CmdAddHtlc,
	/// The route it took.
	pub route: Route,
}

/// A shard assigned to a channel, possibly with an HTLC in the air.
#[derive(Clone)]
pub struct WaitForRouteOrInFlight {
	/// The onion session key; its public form is the shard id.
	pub onion_key: SecretKey,
	/// The shard amount, in milli-satoshi.
	pub amount_msat: u64,
	/// The local channel carrying the shard.
	pub chan: OutgoingChannelRef,
	/// The HTLC attempt, once a route was found and submitted.
	pub flight: Option<InFlightInfo>,
	/// Channels which already rejected this shard locally.
	pub local_failed: Vec<ChannelId>,
	/// How many times the shard was re-sent after remote failures.
	pub remote_attempts: u32,
}

impl WaitForRouteOrInFlight {
	/// The fee locked up by the current attempt, in milli-satoshi.
	pub fn fee_paid_msat(&self) -> u64 {
		self.flight.as_ref().map_or(0, |flight| {
			flight.cmd.first_amount_msat.saturating_sub(self.amount_msat)
		})
	}
}

/// The lifecycle position of one shard.
#[derive(Clone)]
pub enum PartStatus {
	/// No channel can carry the shard right now; waiting for one to wake up.
	WaitForChanOnline {
		/// The onion session key reserved for the shard.
		onion_key: SecretKey,
		/// The shard amount, in milli-satoshi.
		amount_msat: u64,
	},
	/// Assigned to a channel; awaiting a route, or in the air.
	WaitForRouteOrInFlight(WaitForRouteOrInFlight),
}

/// Everything one payment accumulates over its lifetime.
#[derive(Clone)]
pub struct OutgoingPaymentSenderData {
	/// The active command.
	pub cmd: SendMultiPart,
	/// Shards by id. Ids are unique with overwhelming probability since they
	/// are fresh random public keys.
	pub parts: HashMap<PublicKey, PartStatus>,
	/// Failures, most recent first.
	pub failures: Vec<PaymentFailure>,
}

impl OutgoingPaymentSenderData {
	fn new(cmd: SendMultiPart) -> Self {
		OutgoingPaymentSenderData { cmd, parts: HashMap::new(), failures: Vec::new() }
	}

	fn record_failure(&mut self, failure: PaymentFailure) {
		self.failures.insert(0, failure);
	}

	/// Fees currently locked up by in-flight shards, in milli-satoshi.
	pub fn used_fee_msat(&self) -> u64 {
		self.parts
			.values()
			.map(|part| match part {
				PartStatus::WaitForRouteOrInFlight(wait) => wait.fee_paid_msat(),
				PartStatus::WaitForChanOnline { .. } => 0,
			})
			.sum()
	}

	/// What is left of the fee budget, in milli-satoshi.
	pub fn fee_leftover_msat(&self) -> u64 {
		self.cmd.total_fee_reserve_msat.saturating_sub(self.used_fee_msat())
	}

	fn parts_on_chan(&self, channel_id: ChannelId) -> usize {
		self.parts
			.values()
			.filter(|part| match part {
				PartStatus::WaitForRouteOrInFlight(wait) => wait.chan.channel_id() == channel_id,
				PartStatus::WaitForChanOnline { .. } => false,
			})
			.count()
	}
}

/// The command that launches (or relaunches) a multi-part payment.
#[derive(Clone)]
pub struct SendMultiPart {
	/// Uniquely keys the payment across retries.
	pub full_tag: FullPaymentTag,
	/// Absolute block height the final HTLC must expire at.
	pub chain_expiry: u32,
	/// The amount split between contributors.
	pub split: SplitInfo,
	/// The payee.
	pub target_node_id: PublicKey,
	/// Ceiling on total routing fees, in milli-satoshi.
	pub total_fee_reserve_msat: u64,
	/// Local channels shards may be assigned to.
	pub allowed_chans: Vec<OutgoingChannelRef>,
	/// The payment secret carried in final payloads. For trampoline payments
	/// this is a random outer secret, never the invoice secret, so transit
	/// trampolines cannot settle the invoice themselves.
	pub outer_payment_secret: PaymentSecret,
	/// Opaque payment metadata for the recipient.
	pub payment_metadata: Option<Vec<u8>>,
	/// Extra final-payload records: the trampoline onion, invoice features
	/// and routing hints for trampoline relays.
	pub extra_final_tlvs: Vec<(u64, Vec<u8>)>,
	/// Invoice routing hints handed to the path-finder.
	pub assisted_edges: Vec<crate::routing::router::GraphEdge>,
	/// Apply one failure-statistics decay step before this send.
	pub clear_failures: bool,
}

/// Listener surface for payment outcomes. Terminal events fire once and only
/// once per payment lifecycle.
pub trait OutgoingPaymentListener: Send + Sync {
	/// The first preimage for the payment arrived; the payment is settled
	/// economically even though some shards may still be in flight.
	fn got_first_preimage(&self, data: &OutgoingPaymentSenderData, fulfill: &RemoteFulfill) {
		let _ = (data, fulfill);
	}
	/// Every shard settled and no channel holds leftovers for the payment.
	fn whole_payment_succeeded(&self, data: &OutgoingPaymentSenderData) {
		let _ = data;
	}
	/// The payment failed terminally and nothing remains in flight.
	fn whole_payment_failed(&self, data: &OutgoingPaymentSenderData) {
		let _ = data;
	}
}

/// Sender lifecycle. `Init → Pending` and `Pending → Aborted | Succeeded` are
/// the only transitions; terminality is absorbing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SenderState {
	/// Created, nothing assigned yet.
	Init,
	/// Shards assigned, work ongoing.
	Pending,
	/// Failed terminally. Still drains channel events to keep accounting
	/// honest.
	Aborted,
	/// Settled. Still prunes shards as channel events drain.
	Succeeded,
}

/// The per-payment state machine. Lives inside the payment master's actor
/// and is dispatched synchronously from it; see the master for the messaging
/// surface.
pub struct OutgoingPaymentSender {
	/// The payment this machine exists for.
	pub full_tag: FullPaymentTag,
	pub(crate) listeners: Vec<Arc<dyn OutgoingPaymentListener>>,
	pub(crate) state: SenderState,
	pub(crate) data: Option<OutgoingPaymentSenderData>,
	pub(crate) abort_timer_gen: u64,
	terminal_event_sent: bool,
	secp_ctx: Secp256k1<secp256k1::All>,
}

fn random_session_key() -> SecretKey {
	let mut bytes = [0u8; 32];
	thread_rng().fill_bytes(&mut bytes);
	SecretKey::from_slice(&bytes).expect("RNG is busted")
}

impl OutgoingPaymentSender {
	pub(crate) fn new(full_tag: FullPaymentTag, listeners: Vec<Arc<dyn OutgoingPaymentListener>>) -> Self {
		OutgoingPaymentSender {
			full_tag,
			listeners,
			state: SenderState::Init,
			data: None,
			abort_timer_gen: 0,
			terminal_event_sent: false,
			secp_ctx: Secp256k1::new(),
		}
	}

	/// Accepts a send command, fresh or as a retry of an aborted payment.
	pub(crate) fn process_send(&mut self, master: &mut OutgoingPaymentMaster, cmd: SendMultiPart) {
		if !matches!(self.state, SenderState::Init | SenderState::Aborted) {
			return;
		}
		self.state = SenderState::Init;
		self.terminal_event_sent = false;
		let amount_msat = cmd.split.my_part_msat;
		self.data = Some(OutgoingPaymentSenderData::new(cmd.clone()));
		let sendable = master.sendable(&cmd.allowed_chans, cmd.total_fee_reserve_msat, self.data.as_ref());
		self.assign_to_chans(master, sendable, amount_msat);
	}

	/// Emits one route request for the largest shard still lacking one.
	pub(crate) fn ask_for_route(&self) -> Option<RouteRequest> {
		if self.state != SenderState::Pending {
			return None;
		}
		let data = self.data.as_ref()?;
		let mut waiting: Vec<(&PublicKey, &WaitForRouteOrInFlight)> = data
			.parts
			.iter()
			.filter_map(|(part_id, part)| match part {
				PartStatus::WaitForRouteOrInFlight(wait) if wait.flight.is_none() => Some((part_id, wait)),
				_ => None,
			})
			.collect();
		waiting.sort_by(|a, b| b.1.amount_msat.cmp(&a.1.amount_msat));
		waiting.first().map(|(part_id, wait)| RouteRequest {
			full_tag: self.full_tag,
			part_id: **part_id,
			source: wait.chan.peer_node_id(),
			target: data.cmd.target_node_id,
			amount_msat: wait.amount_msat,
			fee_reserve_msat: data.fee_leftover_msat(),
			ignore_nodes: Default::default(),
			ignore_channels: Default::default(),
		})
	}

	/// A route arrived: build the onion, attach the flight, hand the HTLC to
	/// the channel.
	pub(crate) fn found_route(&mut self, part_id: PublicKey, route: Route) {
		if self.state != SenderState::Pending {
			return;
		}
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		let wait = match data.parts.get(&part_id) {
			Some(PartStatus::WaitForRouteOrInFlight(wait)) if wait.flight.is_none() => wait.clone(),
			_ => return,
		};
		let (first_amount_msat, cltv_expiry, payloads) = build_payment_payloads(
			&route,
			wait.amount_msat,
			data.cmd.chain_expiry,
			data.cmd.outer_payment_secret,
			data.cmd.split.total_sum_msat,
			data.cmd.payment_metadata.clone(),
			data.cmd.extra_final_tlvs.clone(),
		);
		let mut prng_seed = [0u8; 32];
		thread_rng().fill_bytes(&mut prng_seed);
		let packet_and_secrets = match create_payment_packet(
			&self.secp_ctx,
			&wait.onion_key,
			&route,
			payloads,
			prng_seed,
			&self.full_tag.payment_hash,
		) {
			Ok(packet_and_secrets) => packet_and_secrets,
			Err(_) => {
				data.record_failure(PaymentFailure::Local {
					reason: LocalFailureReason::NotRetryingNoDetails,
					amount_msat: wait.amount_msat,
				});
				data.parts.remove(&part_id);
				self.abort_maybe_notify();
				return;
			},
		};
		let cmd_add = CmdAddHtlc {
			full_tag: self.full_tag,
			part_id,
			payment_hash: self.full_tag.payment_hash,
			first_amount_msat,
			cltv_expiry,
			packet_and_secrets,
		};
		let chan = wait.chan.clone();
		data.parts.insert(
			part_id,
			PartStatus::WaitForRouteOrInFlight(WaitForRouteOrInFlight {
				flight: Some(InFlightInfo { cmd: cmd_add.clone(), route }),
				..wait
			}),
		);
		chan.send_add_htlc(cmd_add);
	}

	/// No route exists for a shard: move it to another capable channel,
	/// subdivide it, or give up on the payment.
	pub(crate) fn no_route(&mut self, master: &mut OutgoingPaymentMaster, part_id: PublicKey) {
		if self.state != SenderState::Pending {
			return;
		}
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		let wait = match data.parts.get(&part_id) {
			Some(PartStatus::WaitForRouteOrInFlight(wait)) if wait.flight.is_none() => wait.clone(),
			_ => return,
		};
		let fee_leftover_msat = data.fee_leftover_msat();
		let mut sendable = master.sendable(&data.cmd.allowed_chans, fee_leftover_msat, Some(&*data));
		sendable.shuffle(&mut thread_rng());
		let current = wait.chan.channel_id();
		let candidate = sendable.into_iter().find(|(chan, amount)| {
			let channel_id = chan.channel_id();
			channel_id != current
				&& !wait.local_failed.contains(&channel_id)
				&& *amount >= wait.amount_msat
		});
		match candidate {
			Some((chan, _)) => {
				let mut moved = wait;
				moved.local_failed.push(current);
				moved.chan = chan;
				data.parts.insert(part_id, PartStatus::WaitForRouteOrInFlight(moved));
				master.trigger_ask_for_route();
			},
			None if Self::htlc_slots_left(data) >= 1 => {
				let amount_msat = wait.amount_msat;
				data.parts.remove(&part_id);
				master.trigger_cut_into_halves(self.full_tag, amount_msat);
			},
			None => {
				data.record_failure(PaymentFailure::Local {
					reason: LocalFailureReason::NoRoutesFound,
					amount_msat: wait.amount_msat,
				});
				data.parts.remove(&part_id);
				self.abort_maybe_notify();
			},
		}
	}

	/// The local channel refused to launch a shard.
	pub(crate) fn local_reject(&mut self, master: &mut OutgoingPaymentMaster, reject: LocalReject) {
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		let part_id = reject.local_add.part_id;
		let wait = match data.parts.get(&part_id) {
			Some(PartStatus::WaitForRouteOrInFlight(wait)) => wait.clone(),
			_ => return,
		};
		if matches!(self.state, SenderState::Aborted | SenderState::Succeeded) {
			// Terminal states only keep the books straight.
			data.parts.remove(&part_id);
			return;
		}
		match reject.reason {
			LocalRejectReason::InPrincipleNotSendable => {
				data.record_failure(PaymentFailure::Local {
					reason: LocalFailureReason::PaymentNotSendable,
					amount_msat: wait.amount_msat,
				});
				data.parts.remove(&part_id);
				self.abort_maybe_notify();
			},
			LocalRejectReason::ChannelOffline => {
				data.parts.remove(&part_id);
				let fee_leftover_msat = data.fee_leftover_msat();
				let sendable = master.sendable(&data.cmd.allowed_chans, fee_leftover_msat, Some(&*data));
				self.assign_to_chans(master, sendable, wait.amount_msat);
			},
			LocalRejectReason::NotAbleToSend => {
				let fee_leftover_msat = data.fee_leftover_msat();
				let mut sendable = master.sendable(&data.cmd.allowed_chans, fee_leftover_msat, Some(&*data));
				sendable.shuffle(&mut thread_rng());
				let rejected = wait.chan.channel_id();
				let candidate = sendable.into_iter().find(|(chan, amount)| {
					let channel_id = chan.channel_id();
					channel_id != rejected
						&& !wait.local_failed.contains(&channel_id)
						&& *amount >= wait.amount_msat
				});
				match candidate {
					Some((chan, _)) => {
						let mut moved = wait;
						moved.local_failed.push(rejected);
						moved.chan = chan;
						moved.flight = None;
						data.parts.insert(part_id, PartStatus::WaitForRouteOrInFlight(moved));
						master.trigger_ask_for_route();
					},
					None => {
						data.record_failure(PaymentFailure::Local {
							reason: LocalFailureReason::RunOutOfCapableChannels,
							amount_msat: wait.amount_msat,
						});
						data.parts.remove(&part_id);
						self.abort_maybe_notify();
					},
				}
			},
		}
	}

	/// A transit or final node failed a shard; decrypt, attribute, penalise,
	/// and retry or give up.
	pub(crate) fn remote_fail(&mut self, master: &mut OutgoingPaymentMaster, fail: RemoteUpdateFail) {
		let part_id = fail.our_add.part_id;
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		let wait = match data.parts.get(&part_id) {
			Some(PartStatus::WaitForRouteOrInFlight(wait)) if wait.flight.is_some() => wait.clone(),
			_ => return,
		};
		if matches!(self.state, SenderState::Aborted | SenderState::Succeeded) {
			data.parts.remove(&part_id);
			return;
		}
		let flight = wait.flight.as_ref().expect("checked above");
		let route = flight.route.clone();
		match process_onion_failure(&flight.cmd.packet_and_secrets.shared_secrets, &fail.fail.reason) {
			Ok(decoded) => {
				let origin = decoded.origin_node_id;
				let is_final = route.final_node() == Some(origin);
				let is_timeout =
					matches!(decoded.failure, crate::ln::msgs::FailureMessage::PaymentTimeout);
				if is_final || is_timeout {
					// The recipient itself spoke, or time ran out everywhere:
					// no amount of rerouting helps.
					data.record_failure(PaymentFailure::RemoteFailure { packet: decoded, route });
					data.parts.remove(&part_id);
					self.abort_maybe_notify();
					return;
				}
				self.apply_transit_failure(master, &decoded, &route, origin, wait.amount_msat);
				let data = self.data.as_mut().expect("still present");
				data.record_failure(PaymentFailure::RemoteFailure { packet: decoded, route });
				self.resolve_remote_fail(master, part_id, wait);
			},
			Err(()) => {
				// Unattributable: punish a random transit hop, sparing the
				// first and last nodes.
				let internal = route.internal_nodes();
				if let Some(node_id) = internal.choose(&mut thread_rng()) {
					master.node_failed(*node_id, master.conf.max_strange_node_failures);
				}
				data.record_failure(PaymentFailure::UnreadableRemoteFailure { route });
				self.resolve_remote_fail(master, part_id, wait);
			},
		}
	}

	// Attribution rules for a failure from a transit node. `amount_msat` is
	// the failed shard's amount, which the master cannot see on its own while
	// this sender is detached for dispatch.
	fn apply_transit_failure(
		&self, master: &mut OutgoingPaymentMaster, decoded: &DecodedFailurePacket, route: &Route,
		origin: PublicKey, amount_msat: u64,
	) {
		let our_edge = route.edge_from(&origin).cloned();
		if let Some(update) = decoded.failure.channel_update() {
			let signer = master.path_finder.node_id_from_update(update).unwrap_or(origin);
			if update.verify_signature(&self.secp_ctx, &signer) {
				master.path_finder.inform_update(update);
				match our_edge {
					Some(edge) if update.short_channel_id != edge.desc.short_channel_id => {
						// The node is talking about some other channel of its
						// own; distrust the edge we used and the originator's
						// claim alike.
						master.mark_chan_not_routable(edge.desc);
						master.node_failed(origin, 1);
					},
					Some(edge) if update.signed_data() == edge.update.signed_data() => {
						// Same update we routed with: the channel is fine on
						// paper, it simply lacks balance at this amount.
						master.channel_failed_at_amount(edge.desc_and_capacity(), amount_msat);
					},
					Some(edge) if update.is_disabled() => {
						master.mark_chan_not_routable(edge.desc);
					},
					Some(_) => {
						// A fresh plausible update. The path-finder has it
						// now, but nodes oscillating updates to draw traffic
						// are a real thing, so the originator pays a little.
						master.node_failed(origin, 1);
					},
					None => {
						master.node_failed(origin, master.conf.max_strange_node_failures);
					},
				}
			} else {
				// A forged update is as hostile as it gets.
				master.node_failed(origin, master.conf.max_strange_node_failures * 32);
			}
		} else if decoded.failure.is_node_class() {
			master.node_failed(origin, master.conf.max_strange_node_failures);
		} else if let Some(edge) = our_edge {
			master.mark_chan_not_routable(edge.desc);
		} else {
			master.node_failed(origin, master.conf.max_strange_node_failures);
		}
	}

	/// The direct peer could not even parse the onion.
	pub(crate) fn remote_malform(&mut self, master: &mut OutgoingPaymentMaster, malform: RemoteUpdateMalform) {
		let part_id = malform.our_add.part_id;
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		let wait = match data.parts.get(&part_id) {
			Some(PartStatus::WaitForRouteOrInFlight(wait)) if wait.flight.is_some() => wait.clone(),
			_ => return,
		};
		if matches!(self.state, SenderState::Aborted | SenderState::Succeeded) {
			data.parts.remove(&part_id);
			return;
		}
		data.record_failure(PaymentFailure::Local {
			reason: LocalFailureReason::NodeCouldNotParseOnion,
			amount_msat: wait.amount_msat,
		});
		self.resolve_remote_fail(master, part_id, wait);
	}

	// After any remote failure was recorded: retry the amount elsewhere,
	// subdivide, or give up.
	fn resolve_remote_fail(
		&mut self, master: &mut OutgoingPaymentMaster, part_id: PublicKey, wait: WaitForRouteOrInFlight,
	) {
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		data.parts.remove(&part_id);
		let fee_leftover_msat = data.fee_leftover_msat();
		let mut sendable = master.sendable(&data.cmd.allowed_chans, fee_leftover_msat, Some(&*data));
		sendable.shuffle(&mut thread_rng());
		let candidate =
			sendable.into_iter().find(|(_, amount)| *amount >= wait.amount_msat).map(|(chan, _)| chan);
		let slots_available = Self::htlc_slots_left(data) >= 1;
		match (candidate, slots_available) {
			(Some(chan), _) if wait.remote_attempts < master.conf.max_remote_attempts => {
				data.parts.insert(
					part_id,
					PartStatus::WaitForRouteOrInFlight(WaitForRouteOrInFlight {
						chan,
						flight: None,
						remote_attempts: wait.remote_attempts + 1,
						..wait
					}),
				);
				master.trigger_ask_for_route();
			},
			// Reassignment is blocked, whether by missing capacity or an
			// exhausted retry budget: smaller shards may still travel.
			(_, true) => {
				master.trigger_cut_into_halves(self.full_tag, wait.amount_msat);
			},
			_ => {
				data.record_failure(PaymentFailure::Local {
					reason: LocalFailureReason::RunOutOfRetryAttempts,
					amount_msat: wait.amount_msat,
				});
				self.abort_maybe_notify();
			},
		}
	}

	/// The first fulfill settles the payment; everything after is cleanup.
	pub(crate) fn fulfill(&mut self, fulfill: RemoteFulfill) {
		match self.state {
			SenderState::Init | SenderState::Pending => {
				self.state = SenderState::Succeeded;
				if let Some(data) = &self.data {
					for listener in self.listeners.iter() {
						listener.got_first_preimage(data, &fulfill);
					}
				}
			},
			SenderState::Succeeded | SenderState::Aborted => {
				if let Some(data) = &mut self.data {
					data.parts.remove(&fulfill.our_add.part_id);
				}
			},
		}
	}

	/// A sleeping channel woke up: give unassigned shards another try.
	pub(crate) fn chan_got_online(&mut self, master: &mut OutgoingPaymentMaster) {
		if self.state != SenderState::Pending {
			return;
		}
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		let placeholders: Vec<(PublicKey, u64)> = data
			.parts
			.iter()
			.filter_map(|(part_id, part)| match part {
				PartStatus::WaitForChanOnline { amount_msat, .. } => Some((*part_id, *amount_msat)),
				_ => None,
			})
			.collect();
		for (part_id, amount_msat) in placeholders {
			let (chans, fee_leftover_msat) = {
				let data = self.data.as_mut().expect("still present");
				data.parts.remove(&part_id);
				(data.cmd.allowed_chans.clone(), data.fee_leftover_msat())
			};
			let sendable = master.sendable(&chans, fee_leftover_msat, self.data.as_ref());
			self.assign_to_chans(master, sendable, amount_msat);
		}
	}

	/// The wait-for-channel timer fired.
	pub(crate) fn abort_timeout(&mut self, gen: u64) {
		if gen != self.abort_timer_gen {
			return;
		}
		if !matches!(self.state, SenderState::Init | SenderState::Pending) {
			return;
		}
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		let any_in_flight = data.parts.values().any(|part| {
			matches!(part, PartStatus::WaitForRouteOrInFlight(wait) if wait.flight.is_some())
		});
		if any_in_flight {
			// Too late to walk away cheaply; the shards in the air decide.
			return;
		}
		let placeholders: Vec<PublicKey> = data
			.parts
			.iter()
			.filter_map(|(part_id, part)| match part {
				PartStatus::WaitForChanOnline { .. } => Some(*part_id),
				_ => None,
			})
			.collect();
		if placeholders.is_empty() {
			return;
		}
		let mut amount_msat = 0;
		for part_id in placeholders {
			if let Some(PartStatus::WaitForChanOnline { amount_msat: amount, .. }) =
				data.parts.remove(&part_id)
			{
				amount_msat += amount;
			}
		}
		data.record_failure(PaymentFailure::Local { reason: LocalFailureReason::TimedOut, amount_msat });
		self.abort_maybe_notify();
	}

	/// Reconciliation against the channels' own HTLC view: the only signal
	/// trusted for terminal notification once HTLCs went out.
	pub(crate) fn in_flight_snapshot(&mut self, snapshot: &InFlightPayments) {
		if self.terminal_event_sent || snapshot.has_out_leftovers(&self.full_tag) {
			return;
		}
		let data = match &self.data {
			Some(data) => data,
			None => return,
		};
		match self.state {
			SenderState::Succeeded => {
				for listener in self.listeners.iter() {
					listener.whole_payment_succeeded(data);
				}
				self.terminal_event_sent = true;
			},
			SenderState::Aborted => {
				for listener in self.listeners.iter() {
					listener.whole_payment_failed(data);
				}
				self.terminal_event_sent = true;
			},
			_ => {},
		}
	}

	/// Greedy shard assignment over currently sendable channels, preferring
	/// channels straight to the payee. Commits nothing unless the amount is
	/// fully covered or coverable after a reconnect.
	pub(crate) fn assign_to_chans(
		&mut self, master: &mut OutgoingPaymentMaster, sendable: Vec<(OutgoingChannelRef, u64)>,
		amount_msat: u64,
	) {
		let data = match &mut self.data {
			Some(data) => data,
			None => return,
		};
		let mut ordered = sendable;
		ordered.shuffle(&mut thread_rng());
		// Stable sort: randomized order within each class survives.
		ordered.sort_by_key(|(chan, _)| {
			if chan.peer_node_id() == data.cmd.target_node_id { 0 } else { 1 }
		});

		let mut leftover_msat = amount_msat;
		let mut assigned: Vec<(PublicKey, PartStatus)> = Vec::new();
		for (chan, sendable_msat) in ordered {
			if leftover_msat == 0 {
				break;
			}
			let channel_id = chan.channel_id();
			let already = data.parts_on_chan(channel_id)
				+ assigned
					.iter()
					.filter(|(_, part)| match part {
						PartStatus::WaitForRouteOrInFlight(wait) => wait.chan.channel_id() == channel_id,
						_ => false,
					})
					.count();
			if already >= master.conf.max_in_channel_htlcs {
				continue;
			}
			let take_msat = leftover_msat.min(sendable_msat);
			if take_msat == 0 {
				continue;
			}
			let onion_key = random_session_key();
			let part_id = PublicKey::from_secret_key(&self.secp_ctx, &onion_key);
			assigned.push((
				part_id,
				PartStatus::WaitForRouteOrInFlight(WaitForRouteOrInFlight {
					onion_key,
					amount_msat: take_msat,
					chan,
					flight: None,
					local_failed: Vec::new(),
					remote_attempts: 0,
				}),
			));
			leftover_msat -= take_msat;
		}

		if leftover_msat == 0 {
			data.parts.extend(assigned);
			self.state = SenderState::Pending;
		} else {
			let sleeping_total_msat: u64 = data
				.cmd
				.allowed_chans
				.iter()
				.filter(|chan| chan.is_sleeping())
				.map(|chan| chan.available_for_send_msat().min(chan.max_send_in_flight_msat()))
				.sum();
			if sleeping_total_msat >= leftover_msat {
				// Some sleeping channel could cover the rest: hold a
				// placeholder and hope for a reconnect.
				data.parts.extend(assigned);
				let onion_key = random_session_key();
				let part_id = PublicKey::from_secret_key(&self.secp_ctx, &onion_key);
				data.parts.insert(
					part_id,
					PartStatus::WaitForChanOnline { onion_key, amount_msat: leftover_msat },
				);
				self.state = SenderState::Pending;
			} else {
				data.record_failure(PaymentFailure::Local {
					reason: LocalFailureReason::NotEnoughFunds,
					amount_msat,
				});
				self.abort_maybe_notify();
				return;
			}
		}

		self.abort_timer_gen += 1;
		master.schedule_abort_timeout(self.full_tag, self.abort_timer_gen);
	}

	fn htlc_slots_left(data: &OutgoingPaymentSenderData) -> usize {
		data.cmd
			.allowed_chans
			.iter()
			.filter(|chan| chan.is_operational())
			.map(|chan| chan.outgoing_htlc_slots_left())
			.sum()
	}

	// Terminal failure. Absorbing: an already settled payment can never be
	// demoted. The terminal listener event waits for the channels to report
	// empty if anything was ever submitted.
	fn abort_maybe_notify(&mut self) {
		if self.state == SenderState::Succeeded {
			return;
		}
		self.state = SenderState::Aborted;
		let data = match &self.data {
			Some(data) => data,
			None => return,
		};
		let any_in_flight = data.parts.values().any(|part| {
			matches!(part, PartStatus::WaitForRouteOrInFlight(wait) if wait.flight.is_some())
		});
		if !any_in_flight && !self.terminal_event_sent {
			for listener in self.listeners.iter() {
				listener.whole_payment_failed(data);
			}
			self.terminal_event_sent = true;
		}
	}
}
