// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! An approximation to min-cost flow via repeated shortest-path searches.
//!
//! See <https://arxiv.org/abs/2107.05322> for the problem statement. Rather than solving it
//! exactly, [`minflow`] splits the amount into bounded increments and routes each over the
//! currently-cheapest path with a Dijkstra run backwards from the destination. Because the
//! per-channel cost is convex in the planned amount (see
//! [`CapacityRange`]), each increment observes the congestion earlier increments created and the
//! result approaches the convex-cost optimum as increments shrink.
//!
//! [`CapacityRange`]: crate::routing::flow::CapacityRange

use core::cmp::Ordering;
use core::ops::Deref;
use std::collections::BinaryHeap;

use crate::prelude::*;
use crate::routing::flow::{CapacityRange, Flow, FlowHop, DEFAULT_LINEARIZATION_PIVOTS};
use crate::routing::flow::edge_probability;
use crate::routing::gossip::{NetworkGraph, NodeId};
use crate::routing::uncertainty::UncertaintyMap;
use crate::util::logger::Logger;

/// Tuning knobs for one flow search. [`minflow`] is deterministic for a given set of values.
#[derive(Clone, Debug)]
pub struct FlowParams {
	/// The frugality weight: how much a millisatoshi of fee costs relative to `-log P`
	/// reliability cost. Higher values chase cheaper, riskier routes.
	pub mu: f64,
	/// Weight converting a hop's CLTV delta into fee-equivalent cost, in effective
	/// millionths per block.
	pub delay_feefactor: f64,
	/// Smallest amount one increment may carry. Protects against pathological splitting of
	/// small payments.
	pub min_increment_msat: u64,
	/// Target number of increments the amount is split into.
	pub increment_count: u64,
	/// Fractions of the uncertain liquidity range at which the piecewise-linear cost changes
	/// slope. The last entry is also the fraction beyond which a channel is not planned at all.
	pub linearization_pivots: Vec<f64>,
}

impl Default for FlowParams {
	fn default() -> Self {
		FlowParams {
			mu: 10.0,
			delay_feefactor: 1.0,
			min_increment_msat: 5_000,
			increment_count: 50,
			linearization_pivots: DEFAULT_LINEARIZATION_PIVOTS.to_vec(),
		}
	}
}

/// No feasible path carried the next increment; the whole search fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoRouteError {
	/// How much of the requested amount had no route.
	pub remaining_msat: u64,
}

struct PathHop {
	cost: f64,
	// First channel on the cheapest known path from this node to the target.
	best_scid: u64,
	best_dir: u8,
}

struct HeapEntry {
	cost: f64,
	node: NodeId,
}

impl PartialEq for HeapEntry {
	fn eq(&self, other: &Self) -> bool {
		self.cost == other.cost && self.node == other.node
	}
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for HeapEntry {
	fn cmp(&self, other: &Self) -> Ordering {
		// Reversed so the max-heap pops the cheapest entry, tie-breaking on node id to keep
		// the search deterministic.
		other
			.cost
			.total_cmp(&self.cost)
			.then_with(|| other.node.cmp(&self.node))
	}
}

struct SearchCtx<'a, L: Deref>
where
	L::Target: Logger,
{
	graph: &'a NetworkGraph,
	uncertainty: &'a UncertaintyMap<L>,
	disabled: &'a HashSet<u64>,
	params: &'a FlowParams,
	// Effective ppm penalty standing in for base fees, tuned to be exact at amount / 5.
	basefee_penalty: f64,
	// Linearized cost per directed channel, built lazily and reused across increments.
	ranges: HashMap<(u64, u8), CapacityRange>,
	// Amounts earlier increments of this search already planned per directed channel.
	overlay: HashMap<(u64, u8), u64>,
}

impl<'a, L: Deref> SearchCtx<'a, L>
where
	L::Target: Logger,
{
	fn range(&mut self, scid: u64, direction: u8, capacity_msat: u64) -> &CapacityRange {
		let uncertainty = self.uncertainty;
		let pivots = &self.params.linearization_pivots;
		self.ranges.entry((scid, direction)).or_insert_with(|| {
			let (min, max, in_flight) = match uncertainty.half(scid, direction) {
				Some(h) => (h.known_min_msat, h.known_max_msat, h.htlc_total_msat),
				None => (0, capacity_msat, 0),
			};
			CapacityRange::new(min, max, in_flight, pivots)
		})
	}

	/// The cost of pushing `amount_msat` more over the given directed channel, or `None` if the
	/// channel cannot carry it.
	fn edge_cost(&mut self, scid: u64, direction: u8, amount_msat: u64) -> Option<f64> {
		if self.disabled.contains(&scid) {
			return None;
		}
		let chan = self.graph.channel(scid)?;
		let info = chan.update_info(direction)?;
		if !info.enabled || amount_msat > info.htlc_maximum_msat {
			return None;
		}
		let prev = self.overlay.get(&(scid, direction)).copied().unwrap_or(0);
		let prob_cost =
			self.range(scid, direction, chan.capacity_msat).marginal_cost(prev, amount_msat)?;
		let effective_ppm = info.fees.proportional_millionths as f64
			+ info.fees.base_msat as f64 * self.basefee_penalty;
		let fee_cost = amount_msat as f64 * effective_ppm / 1_000_000.0;
		let delay_cost = info.cltv_expiry_delta as f64 * self.params.delay_feefactor;
		Some(prob_cost + self.params.mu * (fee_cost + delay_cost))
	}

	/// Dijkstra backwards from `target`, pricing one increment of `amount_msat`. Returns the
	/// cheapest path from `source` as `(scid, direction)` hops, or `None`.
	fn shortest_path(
		&mut self, source: &NodeId, target: &NodeId, amount_msat: u64,
	) -> Option<Vec<(u64, u8)>> {
		let mut dist: HashMap<NodeId, PathHop> = new_hash_map();
		let mut heap = BinaryHeap::new();
		dist.insert(*target, PathHop { cost: 0.0, best_scid: 0, best_dir: 0 });
		heap.push(HeapEntry { cost: 0.0, node: *target });

		while let Some(HeapEntry { cost, node }) = heap.pop() {
			if node == *source {
				break;
			}
			match dist.get(&node) {
				Some(d) if d.cost < cost => continue,
				_ => {},
			}
			let node_info = match self.graph.node(&node) {
				Some(info) => info,
				None => continue,
			};
			for scid in node_info.channels.clone() {
				let chan = match self.graph.channel(scid) {
					Some(chan) => chan,
					None => continue,
				};
				// We search backwards, so we want the direction that forwards *into* `node`.
				let neighbor = if chan.node_one == node { chan.node_two } else { chan.node_one };
				let direction = match chan.direction_from(&neighbor) {
					Some(dir) => dir,
					None => continue,
				};
				let edge = match self.edge_cost(scid, direction, amount_msat) {
					Some(c) => c,
					None => continue,
				};
				let total = cost + edge;
				let better = match dist.get(&neighbor) {
					Some(d) => total < d.cost,
					None => true,
				};
				if better {
					dist.insert(
						neighbor,
						PathHop { cost: total, best_scid: scid, best_dir: direction },
					);
					heap.push(HeapEntry { cost: total, node: neighbor });
				}
			}
		}

		if !dist.contains_key(source) {
			return None;
		}
		let mut path = Vec::new();
		let mut node = *source;
		while node != *target {
			let hop = dist.get(&node)?;
			let chan = self.graph.channel(hop.best_scid)?;
			path.push((hop.best_scid, hop.best_dir));
			node = *chan.destination(hop.best_dir);
		}
		Some(path)
	}

	/// Fills in per-hop amounts, sender-first, so the destination receives exactly
	/// `delivered_msat`, and computes the flow's stand-alone success probability.
	fn complete_flow(&self, path: &[(u64, u8)], delivered_msat: u64) -> Option<Flow> {
		let mut hops = Vec::with_capacity(path.len());
		let mut amount_msat = delivered_msat;
		let mut success_prob = 1.0;
		for (i, &(scid, direction)) in path.iter().enumerate().rev() {
			let chan = self.graph.channel(scid)?;
			let (min, max, in_flight) = match self.uncertainty.half(scid, direction) {
				Some(h) => (h.known_min_msat, h.known_max_msat, h.htlc_total_msat),
				None => (0, chan.capacity_msat, 0),
			};
			success_prob *= edge_probability(min, max, in_flight, amount_msat);
			hops.push(FlowHop {
				scid,
				direction,
				capacity_msat: chan.capacity_msat,
				amount_msat,
			});
			// The node forwarding over this channel charges its fee to whoever comes before it;
			// the first hop is our own and charges nothing.
			if i > 0 {
				let info = chan.update_info(direction)?;
				amount_msat = amount_msat.checked_add(info.fees.fee_msat(amount_msat)?)?;
			}
		}
		hops.reverse();
		Some(Flow { hops, success_prob })
	}

	fn add_to_overlay(&mut self, flow: &Flow, previous_amounts: &[u64]) {
		debug_assert!(previous_amounts.is_empty() || previous_amounts.len() == flow.hops.len());
		for (i, hop) in flow.hops.iter().enumerate() {
			let prev = previous_amounts.get(i).copied().unwrap_or(0);
			let entry = self.overlay.entry((hop.scid, hop.direction)).or_insert(0);
			*entry = entry.saturating_add(hop.amount_msat.saturating_sub(prev));
		}
	}
}

/// Finds a set of [`Flow`]s which together deliver `amount_msat` from `source` to `target`,
/// trading fees against reliability according to `params`.
///
/// The amount is split into increments of roughly `amount / increment_count` (never below the
/// minimum quantum); each is routed independently over the cheapest path given everything planned
/// so far, and increments whose path exactly matches an existing flow are merged into it. The
/// sum of delivered amounts always equals `amount_msat` exactly.
///
/// Channels in `disabled` are not considered at all; use this for the per-payment disabled set.
pub fn minflow<L: Deref>(
	graph: &NetworkGraph, source: &NodeId, target: &NodeId, amount_msat: u64,
	uncertainty: &UncertaintyMap<L>, disabled: &HashSet<u64>, params: &FlowParams, logger: &L,
) -> Result<Vec<Flow>, NoRouteError>
where
	L::Target: Logger,
{
	debug_assert!(source != target);
	let mut ctx = SearchCtx {
		graph,
		uncertainty,
		disabled,
		params,
		basefee_penalty: 5_000_000.0 / amount_msat.max(1) as f64,
		ranges: new_hash_map(),
		overlay: new_hash_map(),
	};

	let step = (amount_msat / params.increment_count.max(1)).max(params.min_increment_msat);
	let mut flows: Vec<Flow> = Vec::new();
	let mut remaining_msat = amount_msat;
	while remaining_msat > 0 {
		let this_amount = step.min(remaining_msat);
		let path = match ctx.shortest_path(source, target, this_amount) {
			Some(path) => path,
			None => {
				log_debug!(
					logger,
					"No path for increment of {} msat ({} of {} remaining)",
					this_amount, remaining_msat, amount_msat
				);
				return Err(NoRouteError { remaining_msat });
			},
		};

		if let Some(existing) = flows.iter_mut().find(|f| f.same_path(&path)) {
			let old_amounts: Vec<u64> = existing.hops.iter().map(|h| h.amount_msat).collect();
			let merged = ctx
				.complete_flow(&path, existing.delivered_msat() + this_amount)
				.ok_or(NoRouteError { remaining_msat })?;
			*existing = merged;
			let existing = existing.clone();
			ctx.add_to_overlay(&existing, &old_amounts);
		} else {
			let flow =
				ctx.complete_flow(&path, this_amount).ok_or(NoRouteError { remaining_msat })?;
			ctx.add_to_overlay(&flow, &[]);
			flows.push(flow);
		}
		remaining_msat -= this_amount;
	}

	log_trace!(logger, "Split {} msat into {} flow(s):\n{}", amount_msat, flows.len(),
		log_flows!(flows));
	Ok(flows)
}
