// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Turning raw flows into dispatchable payment parts.
//!
//! [`minflow`] optimizes a fixed tradeoff between fees and reliability, weighted by `mu`. The
//! right weight is not knowable up front, so [`get_pay_flows`] searches over it: a flow set
//! that busts the fee budget doubles `mu` (chase cheaper routes), one whose aggregate success
//! probability is too low halves it (chase likelier routes). When the two constraints pull in
//! opposite directions the search has proven that no flow set satisfies both, and either gives
//! up or, if the caller opted in, accepts the affordable-but-unlikely candidate.

use core::ops::Deref;

use crate::ln::payment::{Payment, PaymentError};
use crate::prelude::*;
use crate::routing::flow::{flow_set_probability, Flow};
use crate::routing::gossip::{NetworkGraph, NodeId};
use crate::routing::minflow::minflow;
use crate::routing::uncertainty::UncertaintyMap;
use crate::util::logger::Logger;

/// Above this, stop doubling `delay_feefactor` and conclude no route meets the delay bound.
const DELAY_FEEFACTOR_LIMIT: f64 = 1_000.0;
/// Bounds on `mu` beyond which further adjustment cannot change the outcome.
const MIN_MU: f64 = 0.01;
const MAX_MU: f64 = 1_000_000.0;
/// Hard cap on search iterations, against pathological graphs. Each iteration either adjusts a
/// weight (bounded by the limits above) or disables at least one channel (bounded by the
/// graph), so this should never be hit.
const MAX_SEARCH_ITERATIONS: usize = 100;

/// One dispatchable part of a payment: a [`Flow`] annotated with the identifiers and CLTV
/// schedule the HTLC layer needs.
#[derive(Clone, Debug)]
pub struct PayFlow {
	/// Identifies this part within its payment attempt. Assigned sequentially from 1.
	pub partid: u64,
	/// Ties all parts of one attempt together; shared with every sibling part.
	pub groupid: u64,
	/// The path and per-hop amounts.
	pub flow: Flow,
	/// The node each hop delivers to; the last entry is the destination.
	pub path_nodes: Vec<NodeId>,
	/// The CLTV delta still ahead of the payment at each hop. The last entry is the invoice's
	/// final delta; earlier entries accumulate the downstream channels' deltas on top.
	pub cltv_delays: Vec<u32>,
}

impl PayFlow {
	/// The amount this part delivers to the destination.
	pub fn delivered_msat(&self) -> u64 {
		self.flow.delivered_msat()
	}

	/// The amount this part removes from our first-hop channel, fees included.
	pub fn sent_msat(&self) -> u64 {
		self.flow.sent_msat()
	}
}

fn channel_cltv_delta(graph: &NetworkGraph, scid: u64, direction: u8) -> u32 {
	graph
		.channel(scid)
		.and_then(|chan| chan.update_info(direction))
		.map(|info| info.cltv_expiry_delta as u32)
		.unwrap_or(0)
}

/// Worst-case total CLTV delay of any flow in the set, including the final delta.
fn flows_worst_delay(flows: &[Flow], graph: &NetworkGraph, final_cltv_delta: u32) -> u32 {
	flows
		.iter()
		.map(|flow| {
			flow.hops
				.iter()
				.map(|hop| channel_cltv_delta(graph, hop.scid, hop.direction))
				.sum::<u32>()
				.saturating_add(final_cltv_delta)
		})
		.max()
		.unwrap_or(final_cltv_delta)
}

/// Disables any channel a flow uses in violation of its announced HTLC policy and returns
/// whether it did. The flow search cannot express `htlc_minimum_msat` (a lower bound on a
/// variable it is minimizing), so violations are filtered here and the search rerun.
fn disable_htlc_violations<L: Deref>(
	flows: &[Flow], graph: &NetworkGraph, disabled: &mut HashSet<u64>, logger: &L,
) -> bool
where
	L::Target: Logger,
{
	let mut disabled_any = false;
	for flow in flows.iter() {
		for hop in flow.hops.iter() {
			let info = match graph.channel(hop.scid).and_then(|c| c.update_info(hop.direction)) {
				Some(info) => info,
				None => continue,
			};
			let violation = if !info.enabled {
				"is disabled"
			} else if hop.amount_msat < info.htlc_minimum_msat {
				"violates htlc_minimum_msat"
			} else if hop.amount_msat > info.htlc_maximum_msat {
				"violates htlc_maximum_msat"
			} else {
				continue;
			};
			log_debug!(
				logger,
				"Channel {}/{} {} for {} msat, disabling for this payment",
				hop.scid, hop.direction, violation, hop.amount_msat
			);
			disabled.insert(hop.scid);
			disabled_any = true;
		}
	}
	disabled_any
}

/// Converts accepted flows into [`PayFlow`]s, assigning part ids and building each part's node
/// path and CLTV schedule.
fn convert_flows(
	flows: Vec<Flow>, graph: &NetworkGraph, payment: &mut Payment,
) -> Vec<PayFlow> {
	let mut pay_flows = Vec::with_capacity(flows.len());
	for flow in flows {
		let plen = flow.hops.len();
		let mut path_nodes = Vec::with_capacity(plen);
		for hop in flow.hops.iter() {
			match graph.channel(hop.scid) {
				Some(chan) => path_nodes.push(*chan.destination(hop.direction)),
				None => debug_assert!(false, "flow hop over unknown channel"),
			}
		}
		let mut cltv_delays = vec![0u32; plen];
		cltv_delays[plen - 1] = payment.final_cltv_delta;
		for i in (0..plen - 1).rev() {
			let hop = &flow.hops[i + 1];
			cltv_delays[i] = cltv_delays[i + 1]
				.saturating_add(channel_cltv_delta(graph, hop.scid, hop.direction));
		}
		let partid = payment.next_partid;
		payment.next_partid += 1;
		pay_flows.push(PayFlow {
			partid,
			groupid: payment.groupid,
			flow,
			path_nodes,
			cltv_delays,
		});
	}
	pay_flows
}

/// Finds a set of parts delivering `amount_msat` that fits the payment's remaining fee budget,
/// delay bound and probability floor, adjusting the search weights until it does or until the
/// constraints are proven incompatible.
///
/// Weight adjustments persist in `payment.flow_params`, so later calls for the same payment
/// start from what the earlier ones learned.
pub fn get_pay_flows<L: Deref>(
	payment: &mut Payment, graph: &NetworkGraph, uncertainty: &UncertaintyMap<L>,
	source: &NodeId, amount_msat: u64, logger: &L,
) -> Result<Vec<PayFlow>, PaymentError>
where
	L::Target: Logger,
{
	let fee_budget_msat = payment.remaining_fee_budget_msat();
	let no_route = |remaining_msat| PaymentError::RouteNotFound {
		remaining_msat,
		fee_budget_msat,
	};

	let mut raised_mu = false;
	let mut lowered_mu = false;
	// The cheapest flow set seen that fit the fee budget, kept in case we end up settling for
	// an unlikely-but-affordable answer.
	let mut risky_candidate: Option<(Vec<Flow>, f64)> = None;

	for _ in 0..MAX_SEARCH_ITERATIONS {
		let destination = payment.destination;
		let flows = match minflow(
			graph,
			source,
			&destination,
			amount_msat,
			uncertainty,
			&payment.disabled_scids,
			&payment.flow_params,
			logger,
		) {
			Ok(flows) => flows,
			Err(err) => {
				payment.note(format!(
					"no route for {} msat of {} msat",
					err.remaining_msat, amount_msat
				));
				return Err(no_route(err.remaining_msat));
			},
		};

		if disable_htlc_violations(&flows, graph, &mut payment.disabled_scids, logger) {
			continue;
		}

		let delay = flows_worst_delay(&flows, graph, payment.final_cltv_delta);
		if delay > payment.max_delay {
			payment.flow_params.delay_feefactor *= 2.0;
			payment.note(format!(
				"worst delay {} exceeds bound {}, doubling delay weight to {}",
				delay, payment.max_delay, payment.flow_params.delay_feefactor
			));
			if payment.flow_params.delay_feefactor > DELAY_FEEFACTOR_LIMIT {
				payment.note("no route within the delay bound".to_string());
				return Err(no_route(amount_msat));
			}
			continue;
		}

		let fee_msat: u64 = flows.iter().map(|f| f.fee_msat()).sum();
		let prob = flow_set_probability(&flows, uncertainty);
		log_debug!(
			logger,
			"Flow set of {} parts: fee {} msat (budget {}), success probability {:.4}",
			flows.len(), fee_msat, fee_budget_msat, prob
		);

		let affordable = fee_msat <= fee_budget_msat;
		let likely = prob >= payment.prob_floor;

		if affordable && likely {
			return Ok(convert_flows(flows, graph, payment));
		}

		if !affordable {
			// Busted the budget while an earlier round was too unlikely: cheaper and likelier
			// cannot both be had.
			let bounced = lowered_mu || payment.flow_params.mu * 2.0 > MAX_MU;
			if !bounced {
				raised_mu = true;
				payment.flow_params.mu *= 2.0;
				payment.note(format!(
					"fee {} msat exceeds budget {} msat, doubling mu to {}",
					fee_msat, fee_budget_msat, payment.flow_params.mu
				));
				continue;
			}
		} else {
			risky_candidate = Some((flows, prob));
			let bounced = raised_mu || payment.flow_params.mu / 2.0 < MIN_MU;
			if !bounced {
				lowered_mu = true;
				payment.flow_params.mu /= 2.0;
				payment.note(format!(
					"success probability {:.4} below floor {:.4}, halving mu to {}",
					prob, payment.prob_floor, payment.flow_params.mu
				));
				continue;
			}
		}

		// The fee and probability constraints pull in opposite directions.
		if payment.accept_risky {
			if let Some((flows, prob)) = risky_candidate {
				payment.note(format!(
					"accepting flow set with success probability {:.4} below floor {:.4}: \
					 it fits the fee budget and nothing likelier does",
					prob, payment.prob_floor
				));
				return Ok(convert_flows(flows, graph, payment));
			}
		}
		payment.note(format!(
			"no flow set fits both fee budget {} msat and probability floor {:.4}",
			fee_budget_msat, payment.prob_floor
		));
		return Err(no_route(amount_msat));
	}

	Err(no_route(amount_msat))
}
