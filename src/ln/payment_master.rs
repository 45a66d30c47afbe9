// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The payment supervisor. Owns every in-flight payment's state machine,
//! holds the only mutable copy of the global failure statistics, serializes
//! all route requests through a single-slot mutex, and applies time-decayed
//! penalties so that yesterday's bad luck does not condemn a channel forever.

use bitcoin::secp256k1::PublicKey;

use crate::ln::outbound_payment::{
	InFlightPayments, LocalReject, OutgoingChannelRef, OutgoingPaymentListener,
	OutgoingPaymentSender, OutgoingPaymentSenderData, PartStatus, RemoteFulfill, RemoteUpdateFail,
	RemoteUpdateMalform, SendMultiPart,
};
use crate::ln::{ChannelId, FullPaymentTag};
use crate::routing::gossip::{ChannelDesc, DescAndCapacity};
use crate::routing::router::{PathFinder, RouteRequest, RouteResponse};
use crate::util::config::PaymentConfig;
use crate::util::logger::Logger;
use crate::util::mailbox::{self, Actor, Mailbox};
use crate::util::time::TimeProvider;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Relay parameters a trampoline-capable peer advertises.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrampolineOn {
	/// Flat relay fee in milli-satoshi.
	pub fee_base_msat: u32,
	/// Proportional relay fee in millionths of the routed amount.
	pub fee_proportional_millionths: u32,
	/// CLTV delta the relay demands.
	pub cltv_expiry_delta: u16,
}

/// An empirical per-channel ceiling: the amount at which a channel last
/// failed to carry a shard, healing towards full capacity over time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StampedChannelFailed {
	/// The ceiling, in milli-satoshi.
	pub amount_msat: u64,
	/// When the failure was recorded, wall-clock milliseconds.
	pub stamp_msec: u64,
}

/// Messages the [`OutgoingPaymentMaster`] consumes.
pub enum OutgoingMsg {
	/// Creates an empty sender for a payment unless one already exists.
	CreateSenderFSM {
		/// The payment to prepare for.
		full_tag: FullPaymentTag,
		/// Who to tell about the payment's fate.
		listeners: Vec<Arc<dyn OutgoingPaymentListener>>,
	},
	/// Drops a sender. Only safe once all of its HTLCs have resolved.
	RemoveSenderFSM(FullPaymentTag),
	/// Launches or relaunches a payment.
	SendMultiPart(SendMultiPart),
	/// Poll every sender for a shard needing a route.
	AskForRoute,
	/// The path-finder's verdict on the one outstanding request.
	RouteResponse(RouteResponse),
	/// Some channel came back online.
	ChanGotOnline,
	/// A local channel refused a shard.
	LocalReject(LocalReject),
	/// A shard settled.
	RemoteFulfill(RemoteFulfill),
	/// A shard failed remotely.
	RemoteUpdateFail(RemoteUpdateFail),
	/// The direct peer could not parse a shard's onion.
	RemoteUpdateMalform(RemoteUpdateMalform),
	/// The channels' collective view of outstanding HTLCs.
	InFlightPayments(InFlightPayments),
	/// A shard could not travel whole; retry it as two halves, assigned
	/// sequentially so the second assignment sees the first one's
	/// reservations.
	CutIntoHalves {
		/// The payment to subdivide within.
		full_tag: FullPaymentTag,
		/// The amount to split, in milli-satoshi.
		amount_msat: u64,
	},
	/// A payment's wait-for-channel timer fired.
	AbortTimeout {
		/// The payment whose timer fired.
		full_tag: FullPaymentTag,
		/// Matches the timer generation, so stale timers are ignored.
		gen: u64,
	},
	/// A peer's trampoline relay parameters changed (or vanished).
	TrampolineUpdate {
		/// The advertising peer.
		peer: PublicKey,
		/// Fresh parameters, or `None` when the peer stopped relaying.
		params: Option<TrampolineOn>,
	},
}

enum RouteState {
	ExpectingPayments,
	WaitingForRoute,
}

/// Supervisor of all outgoing payments. The `WaitingForRoute` state is a
/// mutex over the external path-finder: at most one route request is
/// outstanding system-wide, which keeps the path-finder's view of exclusions
/// coherent between answers.
pub struct OutgoingPaymentMaster {
	pub(crate) conf: PaymentConfig,
	pub(crate) path_finder: Arc<dyn PathFinder>,
	clock: Arc<dyn TimeProvider>,
	logger: Arc<dyn Logger>,
	self_mailbox: Mailbox<OutgoingMsg>,
	state: RouteState,
	pub(crate) payments: HashMap<FullPaymentTag, OutgoingPaymentSender>,
	pub(crate) chan_failed_at_amount: HashMap<DescAndCapacity, StampedChannelFailed>,
	pub(crate) node_failed_times: HashMap<PublicKey, u32>,
	pub(crate) direction_failed_times: HashMap<ChannelDesc, u32>,
	pub(crate) chan_not_routable: HashSet<ChannelDesc>,
	pub(crate) trampoline_routing: HashMap<PublicKey, TrampolineOn>,
}

impl OutgoingPaymentMaster {
	/// Builds a master around an externally created mailbox. Use
	/// [`OutgoingPaymentMaster::spawn`] unless you are driving the machine by
	/// hand.
	pub fn new(
		conf: PaymentConfig, path_finder: Arc<dyn PathFinder>, clock: Arc<dyn TimeProvider>,
		logger: Arc<dyn Logger>, self_mailbox: Mailbox<OutgoingMsg>,
	) -> Self {
		OutgoingPaymentMaster {
			conf,
			path_finder,
			clock,
			logger,
			self_mailbox,
			state: RouteState::ExpectingPayments,
			payments: HashMap::new(),
			chan_failed_at_amount: HashMap::new(),
			node_failed_times: HashMap::new(),
			direction_failed_times: HashMap::new(),
			chan_not_routable: HashSet::new(),
			trampoline_routing: HashMap::new(),
		}
	}

	/// Spawns the master on its own mailbox. Must be called within a tokio
	/// runtime.
	pub fn spawn(
		conf: PaymentConfig, path_finder: Arc<dyn PathFinder>, clock: Arc<dyn TimeProvider>,
		logger: Arc<dyn Logger>,
	) -> Mailbox<OutgoingMsg> {
		mailbox::spawn(move |self_mailbox| {
			OutgoingPaymentMaster::new(conf, path_finder, clock, logger, self_mailbox)
		})
	}

	/// What each of `chans` could carry for a new shard right now: the
	/// channel's own ceiling, minus the fee reserve, minus every shard across
	/// all payments already promised to the channel but not yet handed over.
	/// A shard the channel has accepted is already subtracted from the
	/// channel's own balance figure, so subtracting it here again would count
	/// it twice.
	pub(crate) fn sendable(
		&self, chans: &[OutgoingChannelRef], max_fee_msat: u64,
		extra: Option<&OutgoingPaymentSenderData>,
	) -> Vec<(OutgoingChannelRef, u64)> {
		let mut waits: HashMap<ChannelId, u64> = HashMap::new();
		let datas = self.payments.values().filter_map(|sender| sender.data.as_ref()).chain(extra);
		for data in datas {
			for part in data.parts.values() {
				if let PartStatus::WaitForRouteOrInFlight(wait) = part {
					if wait.flight.is_none() {
						*waits.entry(wait.chan.channel_id()).or_insert(0) += wait.amount_msat;
					}
				}
			}
		}
		let mut out = Vec::new();
		for chan in chans.iter().filter(|chan| chan.is_operational()) {
			let ceiling = chan.available_for_send_msat().min(chan.max_send_in_flight_msat());
			let waiting = waits.get(&chan.channel_id()).copied().unwrap_or(0);
			let sendable = ceiling.saturating_sub(max_fee_msat).saturating_sub(waiting);
			if sendable >= chan.min_sendable_msat() {
				out.push((Arc::clone(chan), sendable));
			}
		}
		out
	}

	/// In-flight load per directed graph edge, summed over every hop of every
	/// in-flight shard's route.
	pub(crate) fn used_capacities(&self) -> HashMap<DescAndCapacity, u64> {
		let mut used = HashMap::new();
		for sender in self.payments.values() {
			let data = match &sender.data {
				Some(data) => data,
				None => continue,
			};
			for part in data.parts.values() {
				if let PartStatus::WaitForRouteOrInFlight(wait) = part {
					if let Some(flight) = &wait.flight {
						for edge in flight.route.hops.iter() {
							*used.entry(edge.desc_and_capacity()).or_insert(0) += wait.amount_msat;
						}
					}
				}
			}
		}
		used
	}

	/// Records that a channel failed to carry the current load plus
	/// `in_flight_hint_msat` (the triggering shard, invisible in
	/// [`OutgoingPaymentMaster::used_capacities`] while its sender is
	/// detached for dispatch). The recorded ceiling only ever moves down
	/// within one attempt. Also bumps the direction's failure counter.
	pub(crate) fn channel_failed_at_amount(&mut self, dac: DescAndCapacity, in_flight_hint_msat: u64) {
		let used =
			self.used_capacities().get(&dac).copied().unwrap_or(0).saturating_add(in_flight_hint_msat);
		let now = self.clock.now_millis();
		let entry = self
			.chan_failed_at_amount
			.entry(dac)
			.or_insert(StampedChannelFailed { amount_msat: u64::MAX, stamp_msec: now });
		if used < entry.amount_msat {
			entry.amount_msat = used;
			entry.stamp_msec = now;
		}
		*self.direction_failed_times.entry(dac.desc).or_insert(0) += 1;
	}

	/// Bumps a node's penalty counter by `times`.
	pub(crate) fn node_failed(&mut self, node_id: PublicKey, times: u32) {
		let entry = self.node_failed_times.entry(node_id).or_insert(0);
		*entry = entry.saturating_add(times);
	}

	/// Hard-excludes a directed channel for the rest of the current attempt.
	pub(crate) fn mark_chan_not_routable(&mut self, desc: ChannelDesc) {
		self.chan_not_routable.insert(desc);
	}

	/// Relay parameters last advertised by a trampoline peer, if any.
	pub fn trampoline_params(&self, peer: &PublicKey) -> Option<TrampolineOn> {
		self.trampoline_routing.get(peer).copied()
	}

	pub(crate) fn trigger_ask_for_route(&self) {
		self.self_mailbox.send(OutgoingMsg::AskForRoute);
	}

	pub(crate) fn trigger_cut_into_halves(&self, full_tag: FullPaymentTag, amount_msat: u64) {
		self.self_mailbox.send(OutgoingMsg::CutIntoHalves { full_tag, amount_msat });
	}

	pub(crate) fn schedule_abort_timeout(&self, full_tag: FullPaymentTag, gen: u64) {
		self.self_mailbox.send_delayed(
			OutgoingMsg::AbortTimeout { full_tag, gen },
			Duration::from_millis(self.conf.wait_for_chan_online_msec),
		);
	}

	/// One decay step, applied before a fresh send: penalty counters halve,
	/// empirical channel ceilings heal towards capacity proportionally to the
	/// time since they were stamped, and the hard-exclusion set resets.
	pub(crate) fn with_failures_reduced(&mut self) {
		for times in self.node_failed_times.values_mut() {
			*times /= 2;
		}
		self.node_failed_times.retain(|_, times| *times > 0);
		for times in self.direction_failed_times.values_mut() {
			*times /= 2;
		}
		self.direction_failed_times.retain(|_, times| *times > 0);
		let now = self.clock.now_millis();
		let recovery_msec = self.conf.failed_chan_recovery_msec;
		self.chan_failed_at_amount.retain(|dac, stamped| {
			let elapsed = now.saturating_sub(stamped.stamp_msec);
			let headroom = dac.capacity_msat.saturating_sub(stamped.amount_msat);
			let healed =
				(headroom as u128).saturating_mul(elapsed as u128) / recovery_msec.max(1) as u128;
			let amount_msat = stamped.amount_msat.saturating_add(healed as u64);
			if amount_msat >= dac.capacity_msat {
				false
			} else {
				stamped.amount_msat = amount_msat;
				true
			}
		});
		self.chan_not_routable.clear();
	}

	// Attaches the current exclusion view to a request and dispatches it,
	// unless another request is already outstanding.
	fn handle_route_request(&mut self, mut request: RouteRequest) {
		if !matches!(self.state, RouteState::ExpectingPayments) {
			// The requesting sender is re-polled after the outstanding
			// request resolves, so dropping here loses nothing.
			log_trace!(self.logger, "route request dropped while waiting for a route");
			return;
		}
		let used = self.used_capacities();
		let mut ignore_channels: HashSet<ChannelDesc> = self.chan_not_routable.clone();
		for (dac, used_msat) in used.iter() {
			if used_msat + request.amount_msat >= dac.capacity_msat.saturating_sub(request.amount_msat / 32) {
				ignore_channels.insert(dac.desc);
			}
		}
		for (desc, times) in self.direction_failed_times.iter() {
			if *times >= self.conf.max_direction_failures {
				ignore_channels.insert(*desc);
			}
		}
		for (dac, stamped) in self.chan_failed_at_amount.iter() {
			let used_here = used.get(dac).copied().unwrap_or(0);
			let margin = stamped
				.amount_msat
				.saturating_sub(used_here)
				.saturating_sub(request.amount_msat / 8);
			if margin <= request.amount_msat {
				ignore_channels.insert(dac.desc);
			}
		}
		let ignore_nodes: HashSet<PublicKey> = self
			.node_failed_times
			.iter()
			.filter(|(_, times)| **times >= self.conf.max_strange_node_failures)
			.map(|(node_id, _)| *node_id)
			.collect();
		request.ignore_channels.extend(ignore_channels);
		request.ignore_nodes.extend(ignore_nodes);
		self.state = RouteState::WaitingForRoute;
		self.path_finder.find_route(request);
	}

	fn with_sender<F: FnOnce(&mut OutgoingPaymentSender, &mut Self)>(&mut self, tag: FullPaymentTag, f: F) {
		if let Some(mut sender) = self.payments.remove(&tag) {
			f(&mut sender, self);
			self.payments.insert(tag, sender);
		}
	}
}

impl Actor for OutgoingPaymentMaster {
	type Message = OutgoingMsg;

	fn process(&mut self, msg: OutgoingMsg) {
		match msg {
			OutgoingMsg::CreateSenderFSM { full_tag, listeners } => {
				self.payments
					.entry(full_tag)
					.or_insert_with(|| OutgoingPaymentSender::new(full_tag, listeners));
			},
			OutgoingMsg::RemoveSenderFSM(full_tag) => {
				self.payments.remove(&full_tag);
			},
			OutgoingMsg::SendMultiPart(cmd) => {
				if cmd.clear_failures {
					self.with_failures_reduced();
				}
				// Invoice routing hints enter the online graph like any other
				// loose update.
				for edge in cmd.assisted_edges.iter() {
					self.path_finder.inform_update(&edge.update);
				}
				let full_tag = cmd.full_tag;
				self.payments
					.entry(full_tag)
					.or_insert_with(|| OutgoingPaymentSender::new(full_tag, Vec::new()));
				self.with_sender(full_tag, |sender, master| sender.process_send(master, cmd));
				self.trigger_ask_for_route();
			},
			OutgoingMsg::AskForRoute => {
				if !matches!(self.state, RouteState::ExpectingPayments) {
					return;
				}
				// Every sender gets a say; the route mutex means only the
				// first request in this round actually travels.
				let requests: Vec<RouteRequest> =
					self.payments.values().filter_map(|sender| sender.ask_for_route()).collect();
				for request in requests {
					self.handle_route_request(request);
				}
			},
			OutgoingMsg::RouteResponse(response) => {
				self.state = RouteState::ExpectingPayments;
				match response {
					RouteResponse::Found { full_tag, part_id, route } => {
						self.with_sender(full_tag, |sender, _| sender.found_route(part_id, route));
					},
					RouteResponse::NoRouteAvailable { full_tag, part_id } => {
						self.with_sender(full_tag, |sender, master| sender.no_route(master, part_id));
					},
				}
				self.trigger_ask_for_route();
			},
			OutgoingMsg::ChanGotOnline => {
				let tags: Vec<FullPaymentTag> = self.payments.keys().copied().collect();
				for tag in tags {
					self.with_sender(tag, |sender, master| sender.chan_got_online(master));
				}
				self.trigger_ask_for_route();
			},
			OutgoingMsg::LocalReject(reject) => {
				let tag = reject.local_add.full_tag;
				self.with_sender(tag, |sender, master| sender.local_reject(master, reject));
				self.trigger_ask_for_route();
			},
			OutgoingMsg::RemoteFulfill(fulfill) => {
				let tag = fulfill.our_add.full_tag;
				if let Some(sender) = self.payments.get_mut(&tag) {
					sender.fulfill(fulfill);
				}
			},
			OutgoingMsg::RemoteUpdateFail(fail) => {
				let tag = fail.our_add.full_tag;
				self.with_sender(tag, |sender, master| sender.remote_fail(master, fail));
				self.trigger_ask_for_route();
			},
			OutgoingMsg::RemoteUpdateMalform(malform) => {
				let tag = malform.our_add.full_tag;
				self.with_sender(tag, |sender, master| sender.remote_malform(master, malform));
				self.trigger_ask_for_route();
			},
			OutgoingMsg::InFlightPayments(snapshot) => {
				for sender in self.payments.values_mut() {
					sender.in_flight_snapshot(&snapshot);
				}
			},
			OutgoingMsg::CutIntoHalves { full_tag, amount_msat } => {
				let first_msat = amount_msat / 2;
				let halves = [first_msat, amount_msat - first_msat];
				self.with_sender(full_tag, |sender, master| {
					for half_msat in halves {
						let (chans, fee_leftover_msat) = match &sender.data {
							Some(data) => (data.cmd.allowed_chans.clone(), data.fee_leftover_msat()),
							None => return,
						};
						let sendable = master.sendable(&chans, fee_leftover_msat, sender.data.as_ref());
						sender.assign_to_chans(master, sendable, half_msat);
					}
				});
				self.trigger_ask_for_route();
			},
			OutgoingMsg::AbortTimeout { full_tag, gen } => {
				if let Some(sender) = self.payments.get_mut(&full_tag) {
					sender.abort_timeout(gen);
				}
			},
			OutgoingMsg::TrampolineUpdate { peer, params } => match params {
				Some(params) => {
					self.trampoline_routing.insert(peer, params);
				},
				None => {
					self.trampoline_routing.remove(&peer);
				},
			},
		}
	}
}
