// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-payment execution loop.
//!
//! A [`PaymentSession`] owns one [`Payment`] from intent to outcome. Each call to
//! [`PaymentSession::drive`] drains resolved parts from the [`FlowDispatcher`], folds what each
//! failure taught us into the [`UncertaintyMap`], and dispatches new parts for whatever amount
//! is still missing, until a preimage arrives, the destination refuses, no route remains, or
//! the deadline passes. The session never blocks; the caller decides when to poll.

use core::ops::Deref;
use std::time::Instant;

use crate::ln::onion_errors::{classify_failure, BlamePolicy, FailureAction};
use crate::ln::pay_flow::{get_pay_flows, PayFlow};
use crate::ln::payment::{
	Payment, PaymentError, PaymentHash, PaymentParams, PaymentPreimage, PaymentStatus,
};
use crate::prelude::*;
use crate::routing::gossip::{NetworkGraph, NodeId};
use crate::routing::uncertainty::UncertaintyMap;
use crate::util::logger::{Logger, WithContext};

/// A first-hop rejection, reported synchronously by [`FlowDispatcher::send_flow`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchError {
	/// Why the first hop refused the HTLC.
	pub reason: String,
}

/// How one dispatched part resolved.
#[derive(Clone, Debug)]
pub enum DispatchResult {
	/// The destination released the preimage; the payment as a whole has succeeded.
	Fulfilled(PaymentPreimage),
	/// A node along the path failed the HTLC and its error report was decrypted.
	OnionFailure {
		/// The reporting node's position along the path, counting the sender as 0. Equal to
		/// the hop count when the destination itself reported. Hops before this index carried
		/// the HTLC; for forwarding failures, the hop at this index is the one that refused.
		erring_index: usize,
		/// The BOLT 4 failure code.
		failcode: u16,
		/// The raw `channel_update` attached to the failure, if any.
		channel_update: Option<Vec<u8>>,
	},
	/// The HTLC failed but the error report could not be decrypted or attributed.
	Unparseable,
}

/// The HTLC layer, as the session sees it: takes constructed parts, reports resolutions.
pub trait FlowDispatcher {
	/// Hands a part to the HTLC layer. An `Err` means the first hop refused synchronously and
	/// nothing left this node.
	fn send_flow(&mut self, flow: &PayFlow, payment_hash: &PaymentHash)
		-> Result<(), DispatchError>;
	/// Polls for the next resolved part, by part id. `None` means nothing has resolved since
	/// the last call.
	fn next_result(&mut self) -> Option<(u64, DispatchResult)>;
}

/// Receives `channel_update`s extracted from onion failures, typically forwarding them into
/// the node's gossip store.
pub trait GossipSink {
	/// Returns whether the update was accepted. A rejected update leaves the session no wiser,
	/// so it disables the channel instead.
	fn submit_channel_update(&mut self, update: &[u8]) -> bool;
}

/// The session's answer to "where does this payment stand".
#[derive(Clone, Debug, PartialEq)]
pub enum SessionStatus {
	/// Parts are in flight or remain to be dispatched; poll again.
	Pending,
	/// The destination released the preimage.
	Success(PaymentPreimage),
	/// The payment cannot complete.
	Failure(PaymentError),
}

/// Bounds dispatch rounds within one `drive` call. Each extra round is caused by a first-hop
/// rejection, which disables a channel, so the graph bounds this long before we do.
const MAX_DISPATCH_ROUNDS: usize = 100;

/// Drives one payment to completion across repeated polls.
pub struct PaymentSession<D: FlowDispatcher, G: GossipSink, B: BlamePolicy> {
	payment: Payment,
	source: NodeId,
	dispatcher: D,
	gossip: G,
	blame: B,
	live_parts: HashMap<u64, PayFlow>,
	preimage: Option<PaymentPreimage>,
	fatal: Option<PaymentError>,
}

impl<D: FlowDispatcher, G: GossipSink, B: BlamePolicy> PaymentSession<D, G, B> {
	/// Validates the payment parameters and builds a session around them. No search or
	/// dispatch happens until the first [`Self::drive`] call.
	pub fn new(
		params: &PaymentParams, source: NodeId, dispatcher: D, gossip: G, blame: B,
	) -> Result<Self, PaymentError> {
		if params.amount_msat == 0 {
			return Err(PaymentError::InvalidAmount);
		}
		if params.destination == source {
			return Err(PaymentError::SelfPayment);
		}
		let mut groupid_bytes = [0u8; 8];
		possiblyrandom::getpossiblyrandom(&mut groupid_bytes);
		let payment = Payment::new(params, u64::from_le_bytes(groupid_bytes));
		if params.amount_msat.checked_add(payment.fee_budget_msat).is_none() {
			return Err(PaymentError::InvalidAmount);
		}
		Ok(PaymentSession {
			payment,
			source,
			dispatcher,
			gossip,
			blame,
			live_parts: new_hash_map(),
			preimage: None,
			fatal: None,
		})
	}

	/// A point-in-time view of the payment.
	pub fn status(&self) -> PaymentStatus {
		PaymentStatus {
			destination: self.payment.destination,
			amount_msat: self.payment.amount_msat,
			total_sent_msat: self.payment.total_sent_msat,
			total_delivering_msat: self.payment.total_delivering_msat,
			notes: self.payment.notes().to_vec(),
		}
	}

	/// Absorbs every resolution the dispatcher has queued, updating beliefs and the payment's
	/// accounting.
	fn drain_results<L: Deref>(&mut self, uncertainty: &mut UncertaintyMap<L>, logger: &L)
	where
		L::Target: Logger,
	{
		let ctx_logger = WithContext::from(logger, Some(self.payment.payment_hash));
		while let Some((partid, result)) = self.dispatcher.next_result() {
			let part = match self.live_parts.remove(&partid) {
				Some(part) => part,
				None => {
					log_warn!(ctx_logger, "Dispatcher reported unknown part {}, ignoring", partid);
					continue;
				},
			};
			uncertainty.remove_flow(&part.flow);
			match result {
				DispatchResult::Fulfilled(preimage) => {
					self.payment
						.note(format!("part {} fulfilled, preimage received", partid));
					log_info!(ctx_logger, "Part {} fulfilled, preimage received", partid);
					// The whole path demonstrably carried the amount.
					for hop in part.flow.hops.iter() {
						uncertainty.tighten_min(
							hop.scid, hop.direction, hop.capacity_msat, hop.amount_msat,
						);
					}
					self.preimage = Some(preimage);
				},
				DispatchResult::OnionFailure { erring_index, failcode, channel_update } => {
					self.payment.total_sent_msat =
						self.payment.total_sent_msat.saturating_sub(part.sent_msat());
					self.payment.total_delivering_msat = self
						.payment
						.total_delivering_msat
						.saturating_sub(part.delivered_msat());
					self.handle_onion_failure(
						&part, erring_index, failcode, channel_update, uncertainty, logger,
					);
				},
				DispatchResult::Unparseable => {
					self.payment.total_sent_msat =
						self.payment.total_sent_msat.saturating_sub(part.sent_msat());
					self.payment.total_delivering_msat = self
						.payment
						.total_delivering_msat
						.saturating_sub(part.delivered_msat());
					let hop_idx = self.blame.blame_hop(part.flow.hops.len());
					let scid = part.flow.hops[hop_idx.min(part.flow.hops.len() - 1)].scid;
					self.payment.note(format!(
						"part {} failed with an unreadable error, blaming channel {}",
						partid, scid
					));
					log_debug!(
						ctx_logger,
						"Part {} failed unattributably, disabling channel {} on a guess",
						partid, scid
					);
					self.payment.disabled_scids.insert(scid);
				},
			}
		}
	}

	fn handle_onion_failure<L: Deref>(
		&mut self, part: &PayFlow, erring_index: usize, failcode: u16,
		channel_update: Option<Vec<u8>>, uncertainty: &mut UncertaintyMap<L>, logger: &L,
	) where
		L::Target: Logger,
	{
		let ctx_logger = WithContext::from(logger, Some(self.payment.payment_hash));
		let hop_count = part.flow.hops.len();
		let erring_index = erring_index.min(hop_count);
		let from_destination = erring_index == hop_count;

		// Every hop before the reporter demonstrably forwarded its amount.
		for hop in part.flow.hops[..erring_index].iter() {
			uncertainty.tighten_min(hop.scid, hop.direction, hop.capacity_msat, hop.amount_msat);
		}

		let action = classify_failure(failcode, from_destination);
		let erring_hop = &part.flow.hops[erring_index.min(hop_count - 1)];
		log_debug!(
			ctx_logger,
			"Part {} failed with code {:#06x} at hop {} (channel {}): {:?}",
			part.partid, failcode, erring_index, erring_hop.scid, action
		);
		match action {
			FailureAction::TightenMax => {
				self.payment.note(format!(
					"channel {} lacked liquidity for {} msat",
					erring_hop.scid, erring_hop.amount_msat
				));
				uncertainty.tighten_max(
					erring_hop.scid,
					erring_hop.direction,
					erring_hop.capacity_msat,
					erring_hop.amount_msat.saturating_sub(1),
				);
			},
			FailureAction::DisableChannel => {
				self.payment
					.note(format!("disabling channel {} (code {:#06x})", erring_hop.scid, failcode));
				self.payment.disabled_scids.insert(erring_hop.scid);
			},
			FailureAction::ForwardUpdate => {
				let accepted = match channel_update {
					Some(update) => self.gossip.submit_channel_update(&update),
					None => false,
				};
				if accepted {
					self.payment.note(format!(
						"channel {} sent a policy update, forwarded to gossip",
						erring_hop.scid
					));
				} else {
					self.payment.note(format!(
						"channel {} failed with code {:#06x} but provided no usable update, disabling",
						erring_hop.scid, failcode
					));
					self.payment.disabled_scids.insert(erring_hop.scid);
				}
			},
			FailureAction::ContinueMpp => {
				self.payment
					.note(format!("part {} timed out at the destination, retrying", part.partid));
			},
			FailureAction::FatalDestination { failcode } => {
				self.payment
					.note(format!("destination refused the payment with code {:#06x}", failcode));
				self.fatal = Some(PaymentError::DestinationFailure { failcode });
			},
		}
	}

	/// Polls the dispatcher, updates beliefs, and dispatches new parts for any undelivered
	/// amount. `now` is compared against the payment's deadline: past it, no new parts are
	/// created but in-flight ones are still drained to their resolution.
	pub fn drive<L: Deref>(
		&mut self, graph: &NetworkGraph, uncertainty: &mut UncertaintyMap<L>, now: Instant,
		logger: &L,
	) -> SessionStatus
	where
		L::Target: Logger,
	{
		self.drain_results(uncertainty, logger);

		if let Some(preimage) = self.preimage {
			return SessionStatus::Success(preimage);
		}
		if let Some(err) = &self.fatal {
			return SessionStatus::Failure(err.clone());
		}
		if now >= self.payment.stop_time {
			if self.live_parts.is_empty() {
				self.payment.note("deadline expired with amount undelivered".to_string());
				return SessionStatus::Failure(PaymentError::DeadlineExpired);
			}
			// Parts already in flight may yet succeed; keep draining.
			return SessionStatus::Pending;
		}

		let ctx_logger = WithContext::from(logger, Some(self.payment.payment_hash));
		for _ in 0..MAX_DISPATCH_ROUNDS {
			let remaining_msat = self.payment.remaining_msat();
			if remaining_msat == 0 {
				return SessionStatus::Pending;
			}
			let parts = match get_pay_flows(
				&mut self.payment,
				graph,
				uncertainty,
				&self.source,
				remaining_msat,
				logger,
			) {
				Ok(parts) => parts,
				Err(err) => {
					if self.live_parts.is_empty() {
						return SessionStatus::Failure(err);
					}
					// In-flight parts may fail and release budget and liquidity; search again
					// on a later poll.
					return SessionStatus::Pending;
				},
			};

			let mut rejected = false;
			for part in parts {
				uncertainty.commit_flow(&part.flow);
				match self.dispatcher.send_flow(&part, &self.payment.payment_hash) {
					Ok(()) => {
						self.payment.total_sent_msat += part.sent_msat();
						self.payment.total_delivering_msat += part.delivered_msat();
						log_info!(
							ctx_logger,
							"Dispatched part {} delivering {} msat over {} hops",
							part.partid, part.delivered_msat(), part.flow.hops.len()
						);
						self.live_parts.insert(part.partid, part);
					},
					Err(err) => {
						uncertainty.remove_flow(&part.flow);
						let first_scid = part.flow.hops[0].scid;
						self.payment.note(format!(
							"first hop over channel {} rejected part {}: {}",
							first_scid, part.partid, err.reason
						));
						log_debug!(
							ctx_logger,
							"First hop rejected part {} ({}), disabling channel {}",
							part.partid, err.reason, first_scid
						);
						self.payment.disabled_scids.insert(first_scid);
						rejected = true;
					},
				}
			}
			if !rejected {
				return SessionStatus::Pending;
			}
		}
		SessionStatus::Pending
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::onion_errors::{
		FEE_INSUFFICIENT, INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS, MPP_TIMEOUT,
		TEMPORARY_CHANNEL_FAILURE,
	};
	use crate::util::test_utils::{add_test_channel, test_node_id, three_hop_line, TestLogger};
	use std::collections::VecDeque;
	use std::time::{Duration, Instant};

	#[derive(Default)]
	struct TestDispatcher {
		sent: Vec<PayFlow>,
		results: VecDeque<(u64, DispatchResult)>,
		reject_first_scids: HashSet<u64>,
	}

	impl FlowDispatcher for TestDispatcher {
		fn send_flow(
			&mut self, flow: &PayFlow, _payment_hash: &PaymentHash,
		) -> Result<(), DispatchError> {
			if self.reject_first_scids.contains(&flow.flow.hops[0].scid) {
				return Err(DispatchError { reason: "peer disconnected".to_string() });
			}
			self.sent.push(flow.clone());
			Ok(())
		}

		fn next_result(&mut self) -> Option<(u64, DispatchResult)> {
			self.results.pop_front()
		}
	}

	#[derive(Default)]
	struct TestGossip {
		accept: bool,
		received: Vec<Vec<u8>>,
	}

	impl GossipSink for TestGossip {
		fn submit_channel_update(&mut self, update: &[u8]) -> bool {
			self.received.push(update.to_vec());
			self.accept
		}
	}

	/// Always blames the same hop index (clamped by the session).
	struct FixedBlame(usize);
	impl BlamePolicy for FixedBlame {
		fn blame_hop(&mut self, _path_len: usize) -> usize {
			self.0
		}
	}

	fn test_params(destination: NodeId, amount_msat: u64) -> PaymentParams {
		PaymentParams {
			destination,
			payment_hash: PaymentHash([42; 32]),
			amount_msat,
			max_fee_msat: None,
			max_delay: 2016,
			final_cltv_delta: 18,
			stop_time: Instant::now() + Duration::from_secs(60),
			prob_floor: 0.01,
			accept_risky: false,
		}
	}

	fn new_session(
		destination: NodeId, amount_msat: u64,
	) -> PaymentSession<TestDispatcher, TestGossip, FixedBlame> {
		PaymentSession::new(
			&test_params(destination, amount_msat),
			test_node_id(1),
			TestDispatcher::default(),
			TestGossip::default(),
			FixedBlame(0),
		)
		.unwrap()
	}

	/// A diamond: node 1 reaches node 4 through node 2 (channels 1, 2) or node 3
	/// (channels 3, 4). The route through node 2 is cheaper.
	fn diamond_graph(capacity_msat: u64) -> (NetworkGraph, Vec<NodeId>) {
		let mut graph = NetworkGraph::new();
		let nodes: Vec<NodeId> = (1..=4).map(test_node_id).collect();
		add_test_channel(&mut graph, 1, nodes[0], nodes[1], capacity_msat, 0, 100, 6);
		add_test_channel(&mut graph, 2, nodes[1], nodes[3], capacity_msat, 0, 100, 6);
		add_test_channel(&mut graph, 3, nodes[0], nodes[2], capacity_msat, 0, 1000, 6);
		add_test_channel(&mut graph, 4, nodes[2], nodes[3], capacity_msat, 0, 1000, 6);
		(graph, nodes)
	}

	#[test]
	fn rejects_bad_parameters() {
		let err = PaymentSession::new(
			&test_params(test_node_id(2), 0),
			test_node_id(1),
			TestDispatcher::default(),
			TestGossip::default(),
			FixedBlame(0),
		)
		.err()
		.unwrap();
		assert_eq!(err, PaymentError::InvalidAmount);

		let err = PaymentSession::new(
			&test_params(test_node_id(1), 1_000),
			test_node_id(1),
			TestDispatcher::default(),
			TestGossip::default(),
			FixedBlame(0),
		)
		.err()
		.unwrap();
		assert_eq!(err, PaymentError::SelfPayment);
	}

	#[test]
	fn single_part_success() {
		let logger = TestLogger::new();
		let (graph, nodes) = three_hop_line(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);

		let status = session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		assert_eq!(status, SessionStatus::Pending);
		assert_eq!(session.dispatcher.sent.len(), 1);
		let part = session.dispatcher.sent[0].clone();
		assert_eq!(part.delivered_msat(), 1_000_000);
		// The dispatched amounts are registered as in flight.
		let hop = &part.flow.hops[0];
		assert_eq!(
			uncertainty.half(hop.scid, hop.direction).unwrap().htlc_total_msat,
			hop.amount_msat
		);

		let preimage = PaymentPreimage([9; 32]);
		session.dispatcher.results.push_back((part.partid, DispatchResult::Fulfilled(preimage)));
		let status = session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		assert_eq!(status, SessionStatus::Success(preimage));
		// The HTLC resolved; nothing stays in flight, but the path's liquidity floor is now
		// known.
		assert_eq!(uncertainty.half(hop.scid, hop.direction).unwrap().htlc_total_msat, 0);
		assert!(uncertainty.half(hop.scid, hop.direction).unwrap().known_min_msat >= 1_000_000);
		// One dispatch log and one fulfillment log, both tagged with the payment's hash.
		logger.assert_log_context_contains(
			"lightning_flowpay::ln::session",
			Some(PaymentHash([42; 32])),
			2,
		);
	}

	#[test]
	fn liquidity_failure_tightens_and_reroutes() {
		let logger = TestLogger::new();
		let (graph, nodes) = diamond_graph(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);

		assert_eq!(
			session.drive(&graph, &mut uncertainty, Instant::now(), &&logger),
			SessionStatus::Pending
		);
		let part = session.dispatcher.sent[0].clone();
		// The cheaper route through channels 1 and 2 wins the first search.
		assert_eq!(part.flow.hops.iter().map(|h| h.scid).collect::<Vec<_>>(), vec![1, 2]);

		// Node 2 reports it could not forward over channel 2.
		session.dispatcher.results.push_back((
			part.partid,
			DispatchResult::OnionFailure {
				erring_index: 1,
				failcode: TEMPORARY_CHANNEL_FAILURE,
				channel_update: None,
			},
		));
		assert_eq!(
			session.drive(&graph, &mut uncertainty, Instant::now(), &&logger),
			SessionStatus::Pending
		);

		// Channel 1 carried the HTLC, channel 2 could not: both beliefs updated, neither
		// channel disabled.
		let first_hop = &part.flow.hops[0];
		let second_hop = &part.flow.hops[1];
		let new_max_msat = second_hop.amount_msat - 1;
		assert!(
			uncertainty.half(first_hop.scid, first_hop.direction).unwrap().known_min_msat
				>= first_hop.amount_msat
		);
		assert_eq!(
			uncertainty.half(second_hop.scid, second_hop.direction).unwrap().known_max_msat,
			new_max_msat
		);
		assert!(session.payment.disabled_scids.is_empty());

		// Channel 2 can no longer carry the full amount alone, so the retry splits: part of
		// the amount still flows over it (within the tightened bound) and the rest detours
		// through node 3.
		let retries = session.dispatcher.sent[1..].to_vec();
		assert!(!retries.is_empty());
		assert_eq!(retries.iter().map(|p| p.delivered_msat()).sum::<u64>(), 1_000_000);
		assert!(retries.iter().any(|p| p.flow.hops.iter().all(|h| h.scid != 2)));
		for retry in retries.iter() {
			for hop in retry.flow.hops.iter().filter(|h| h.scid == 2) {
				assert!(hop.amount_msat <= new_max_msat);
			}
		}

		for retry in retries {
			session
				.dispatcher
				.results
				.push_back((retry.partid, DispatchResult::Fulfilled(PaymentPreimage([9; 32]))));
		}
		assert_eq!(
			session.drive(&graph, &mut uncertainty, Instant::now(), &&logger),
			SessionStatus::Success(PaymentPreimage([9; 32]))
		);
	}

	#[test]
	fn liquidity_failure_deep_in_a_path_updates_every_hop() {
		let logger = TestLogger::new();
		let (graph, nodes) = three_hop_line(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);

		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		let part = session.dispatcher.sent[0].clone();
		assert_eq!(part.flow.hops.len(), 3);

		// Node 3 could not forward over the last channel.
		session.dispatcher.results.push_back((
			part.partid,
			DispatchResult::OnionFailure {
				erring_index: 2,
				failcode: TEMPORARY_CHANNEL_FAILURE,
				channel_update: None,
			},
		));
		let status = session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);

		// The first two hops carried the HTLC; the third could not.
		for hop in &part.flow.hops[..2] {
			assert!(
				uncertainty.half(hop.scid, hop.direction).unwrap().known_min_msat
					>= hop.amount_msat
			);
		}
		let failed_hop = &part.flow.hops[2];
		assert_eq!(
			uncertainty.half(failed_hop.scid, failed_hop.direction).unwrap().known_max_msat,
			failed_hop.amount_msat - 1
		);
		// The channel was capped, not disabled; the payment fails only because the sole route
		// can no longer carry the amount.
		assert!(session.payment.disabled_scids.is_empty());
		assert!(matches!(
			status,
			SessionStatus::Failure(PaymentError::RouteNotFound { .. })
		));
	}

	#[test]
	fn destination_refusal_is_fatal() {
		let logger = TestLogger::new();
		let (graph, nodes) = three_hop_line(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);

		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		let part = session.dispatcher.sent[0].clone();
		session.dispatcher.results.push_back((
			part.partid,
			DispatchResult::OnionFailure {
				erring_index: part.flow.hops.len(),
				failcode: INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS,
				channel_update: None,
			},
		));
		let status = session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		assert_eq!(
			status,
			SessionStatus::Failure(PaymentError::DestinationFailure {
				failcode: INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS
			})
		);
		// Every hop along the way did forward.
		for hop in part.flow.hops.iter() {
			assert!(
				uncertainty.half(hop.scid, hop.direction).unwrap().known_min_msat
					>= hop.amount_msat
			);
		}
	}

	#[test]
	fn mpp_timeout_retries_without_belief_changes() {
		let logger = TestLogger::new();
		let (graph, nodes) = three_hop_line(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);

		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		let part = session.dispatcher.sent[0].clone();
		session.dispatcher.results.push_back((
			part.partid,
			DispatchResult::OnionFailure {
				erring_index: part.flow.hops.len(),
				failcode: MPP_TIMEOUT,
				channel_update: None,
			},
		));
		assert_eq!(
			session.drive(&graph, &mut uncertainty, Instant::now(), &&logger),
			SessionStatus::Pending
		);
		// A fresh part went out for the full amount, and no channel was disabled or capped.
		assert_eq!(session.dispatcher.sent.len(), 2);
		assert_eq!(session.dispatcher.sent[1].delivered_msat(), 1_000_000);
		assert!(session.payment.disabled_scids.is_empty());
		for hop in part.flow.hops.iter() {
			let half = uncertainty.half(hop.scid, hop.direction).unwrap();
			assert_eq!(half.known_max_msat, hop.capacity_msat);
		}
	}

	#[test]
	fn policy_update_forwards_to_gossip_or_disables() {
		let logger = TestLogger::new();
		let (graph, nodes) = diamond_graph(100_000_000);

		// Accepting sink: the update lands in gossip and the channel stays usable.
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);
		session.gossip.accept = true;
		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		let part = session.dispatcher.sent[0].clone();
		session.dispatcher.results.push_back((
			part.partid,
			DispatchResult::OnionFailure {
				erring_index: 1,
				failcode: FEE_INSUFFICIENT,
				channel_update: Some(vec![1, 2, 3]),
			},
		));
		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		assert_eq!(session.gossip.received, vec![vec![1, 2, 3]]);
		assert!(session.payment.disabled_scids.is_empty());

		// Rejecting sink: we learn nothing from the update, so the channel gets disabled.
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);
		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		let part = session.dispatcher.sent[0].clone();
		let erring_scid = part.flow.hops[1].scid;
		session.dispatcher.results.push_back((
			part.partid,
			DispatchResult::OnionFailure {
				erring_index: 1,
				failcode: FEE_INSUFFICIENT,
				channel_update: Some(vec![1, 2, 3]),
			},
		));
		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		assert!(session.payment.disabled_scids.contains(&erring_scid));
	}

	#[test]
	fn unparseable_error_disables_the_blamed_channel() {
		let logger = TestLogger::new();
		let (graph, nodes) = diamond_graph(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);
		session.blame = FixedBlame(1);

		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		let part = session.dispatcher.sent[0].clone();
		let blamed_scid = part.flow.hops[1].scid;
		session.dispatcher.results.push_back((part.partid, DispatchResult::Unparseable));
		assert_eq!(
			session.drive(&graph, &mut uncertainty, Instant::now(), &&logger),
			SessionStatus::Pending
		);
		assert!(session.payment.disabled_scids.contains(&blamed_scid));
		// The retry routes around the blamed channel.
		let retry = session.dispatcher.sent[1].clone();
		assert!(retry.flow.hops.iter().all(|h| h.scid != blamed_scid));
	}

	#[test]
	fn first_hop_rejection_disables_and_reroutes() {
		let logger = TestLogger::new();
		let (graph, nodes) = diamond_graph(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);
		// The cheap route's first hop refuses everything.
		session.dispatcher.reject_first_scids.insert(1);

		let status = session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		assert_eq!(status, SessionStatus::Pending);
		assert!(session.payment.disabled_scids.contains(&1));
		assert_eq!(session.dispatcher.sent.len(), 1);
		assert_eq!(session.dispatcher.sent[0].flow.hops[0].scid, 3);
		// The rejected part never counts as in flight.
		assert_eq!(
			session.payment.total_delivering_msat,
			session.dispatcher.sent[0].delivered_msat()
		);
	}

	#[test]
	fn deadline_stops_new_dispatches_but_drains_in_flight() {
		let logger = TestLogger::new();
		let (graph, nodes) = three_hop_line(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);
		let deadline = session.payment.stop_time;

		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		assert_eq!(session.dispatcher.sent.len(), 1);
		let part = session.dispatcher.sent[0].clone();

		// Past the deadline with the part still out: keep waiting, dispatch nothing new.
		let late = deadline + Duration::from_secs(1);
		assert_eq!(
			session.drive(&graph, &mut uncertainty, late, &&logger),
			SessionStatus::Pending
		);
		assert_eq!(session.dispatcher.sent.len(), 1);

		// An in-flight part may still succeed after the deadline.
		session
			.dispatcher
			.results
			.push_back((part.partid, DispatchResult::Fulfilled(PaymentPreimage([9; 32]))));
		assert_eq!(
			session.drive(&graph, &mut uncertainty, late, &&logger),
			SessionStatus::Success(PaymentPreimage([9; 32]))
		);
	}

	#[test]
	fn deadline_fails_once_nothing_is_in_flight() {
		let logger = TestLogger::new();
		let (graph, nodes) = three_hop_line(100_000_000);
		let mut uncertainty = UncertaintyMap::new(&logger);
		let mut session = new_session(nodes[3], 1_000_000);
		let late = session.payment.stop_time + Duration::from_secs(1);

		session.drive(&graph, &mut uncertainty, Instant::now(), &&logger);
		let part = session.dispatcher.sent[0].clone();
		session.dispatcher.results.push_back((
			part.partid,
			DispatchResult::OnionFailure {
				erring_index: 1,
				failcode: TEMPORARY_CHANNEL_FAILURE,
				channel_update: None,
			},
		));
		assert_eq!(
			session.drive(&graph, &mut uncertainty, late, &&logger),
			SessionStatus::Failure(PaymentError::DeadlineExpired)
		);
	}
}
