// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Flows and the probability math priced into them.
//!
//! A [`Flow`] is one path plus the amount assigned to it as part of a multi-part payment. Under
//! the uniform-liquidity assumption, the chance a directed channel with bounds
//! `[known_min, known_max]` forwards an amount `f` is 1 below `known_min`, 0 above `known_max`,
//! and linear in between; [`edge_probability`] computes the conditional form of this given
//! amounts already in flight. `-log` of that probability is a convex cost, which
//! [`CapacityRange`] approximates with a small number of linear pieces so the path search can
//! price partial use of a channel without re-evaluating a logarithm per relaxation.

use core::ops::Deref;

use crate::prelude::*;
use crate::routing::uncertainty::UncertaintyMap;
use crate::util::logger::Logger;

/// The default fractions of `known_max - known_min` at which the piecewise-linear `-log P`
/// approximation changes slope. The final pivot doubles as a cut-off: a search never plans more
/// than 95% of a channel's uncertain range, where success probability drops below 5%.
pub const DEFAULT_LINEARIZATION_PIVOTS: [f64; 4] = [0.0, 0.5, 0.8, 0.95];

/// One hop of a [`Flow`].
#[derive(Clone, Debug, PartialEq)]
pub struct FlowHop {
	/// The channel this hop forwards over.
	pub scid: u64,
	/// 0 if this hop travels from the channel's `node_one` to `node_two`, else 1.
	pub direction: u8,
	/// The channel's total capacity, carried so belief entries can be created lazily.
	pub capacity_msat: u64,
	/// The amount forwarded over this channel (the downstream amount plus downstream fees).
	pub amount_msat: u64,
}

/// One path and the amount assigned to it, as produced by the flow search. Hops are ordered from
/// the sender towards the destination; per-hop amounts shrink toward the destination as fees
/// peel off.
#[derive(Clone, Debug, PartialEq)]
pub struct Flow {
	/// The hops of this flow, sender first.
	pub hops: Vec<FlowHop>,
	/// Estimated success probability of this flow in isolation.
	pub success_prob: f64,
}

impl Flow {
	/// The amount the destination receives.
	pub fn delivered_msat(&self) -> u64 {
		self.hops.last().map(|h| h.amount_msat).unwrap_or(0)
	}

	/// The amount the sender puts in.
	pub fn sent_msat(&self) -> u64 {
		self.hops.first().map(|h| h.amount_msat).unwrap_or(0)
	}

	/// The routing fee this flow pays, the difference between sent and delivered.
	pub fn fee_msat(&self) -> u64 {
		self.sent_msat().saturating_sub(self.delivered_msat())
	}

	/// Whether `other` uses exactly the same hop sequence (ignoring amounts).
	pub fn same_path(&self, path: &[(u64, u8)]) -> bool {
		self.hops.len() == path.len()
			&& self.hops.iter().zip(path.iter()).all(|(h, (scid, dir))| {
				h.scid == *scid && h.direction == *dir
			})
	}
}

/// Probability that a directed channel with liquidity known to lie in
/// `[known_min_msat, known_max_msat]` forwards `amount_msat`, conditioned on `in_flight_msat`
/// of our own HTLCs already (assumed) successfully placed on it.
///
/// Conditioning shifts the effective bounds down by the in-flight amount: succeeding with `x` in
/// flight and then `f` more is exactly as likely as succeeding with `x + f` at once.
pub fn edge_probability(
	known_min_msat: u64, known_max_msat: u64, in_flight_msat: u64, amount_msat: u64,
) -> f64 {
	debug_assert!(known_min_msat <= known_max_msat);
	// One past the largest plausible liquidity, which keeps the uniform-distribution width
	// nonzero even when min == max.
	let b = (known_max_msat + 1).saturating_sub(in_flight_msat);
	let a = known_min_msat.saturating_sub(in_flight_msat);
	if b <= a {
		// In-flight already exceeds everything we believe the channel has.
		return 0.0;
	}
	if amount_msat <= a {
		1.0
	} else {
		b.saturating_sub(amount_msat) as f64 / (b - a) as f64
	}
}

/// A per-search, linearized view of one directed channel's liquidity range.
///
/// `-log P(x)` is convex in the planned amount `x`; this type approximates it with linear
/// pieces whose boundaries sit at configurable fractions of the uncertain range, so that
/// cost-per-unit-flow is monotonically non-decreasing and a shortest-path search on increments
/// approximates a convex-cost flow. Not persisted; rebuilt from the beliefs for every search.
#[derive(Clone, Debug)]
pub struct CapacityRange {
	/// Effective lower bound after shifting by committed in-flight amounts.
	a_msat: u64,
	/// One past the effective upper bound.
	b_msat: u64,
	/// `(upper_amount_msat, cost_slope_per_msat)` per piece, in increasing order. Amounts beyond
	/// the last entry are treated as infeasible.
	pieces: Vec<(u64, f64)>,
}

impl CapacityRange {
	/// Builds the linearized view for bounds `[known_min, known_max]` with `in_flight` already
	/// committed. `pivots` must start at 0.0 and increase strictly towards (but not reach) 1.0.
	pub fn new(
		known_min_msat: u64, known_max_msat: u64, in_flight_msat: u64, pivots: &[f64],
	) -> Self {
		debug_assert!(known_min_msat <= known_max_msat);
		debug_assert!(pivots.first() == Some(&0.0));
		let b = (known_max_msat + 1).saturating_sub(in_flight_msat);
		let a = known_min_msat.saturating_sub(in_flight_msat).min(b);
		let range = (b - a) as f64;
		let mut pieces = Vec::with_capacity(pivots.len());
		// Everything below the known minimum is free: P = 1.
		pieces.push((a, 0.0));
		for w in pivots.windows(2) {
			let (lo, hi) = (w[0], w[1]);
			debug_assert!(lo < hi && hi < 1.0);
			let upper = a + (range * hi) as u64;
			// Average slope of -log(1 - x) over [lo, hi), scaled to msat of range.
			let slope = ((1.0 - lo).ln() - (1.0 - hi).ln()) / ((hi - lo) * range);
			pieces.push((upper, slope));
		}
		CapacityRange { a_msat: a, b_msat: b, pieces }
	}

	/// The approximate `-log P` of this channel forwarding a cumulative `amount_msat`, or `None`
	/// when the amount lies beyond the final pivot and we refuse to plan it.
	pub fn prob_cost(&self, amount_msat: u64) -> Option<f64> {
		if amount_msat >= self.b_msat {
			return None;
		}
		let mut cost = 0.0;
		let mut covered = 0u64;
		for &(upper, slope) in self.pieces.iter() {
			let in_piece = amount_msat.min(upper).saturating_sub(covered);
			cost += in_piece as f64 * slope;
			covered = covered.max(upper);
			if amount_msat <= upper {
				return Some(cost);
			}
		}
		None
	}

	/// The marginal cost of adding `amount_msat` on top of `prev_msat` already planned, `None`
	/// if infeasible.
	pub fn marginal_cost(&self, prev_msat: u64, amount_msat: u64) -> Option<f64> {
		let total = prev_msat.checked_add(amount_msat)?;
		Some(self.prob_cost(total)? - self.prob_cost(prev_msat)?)
	}
}

/// Success probability of a whole flow set.
///
/// Not the naive product of per-flow probabilities: flows sharing a directed channel are
/// dependent events, so each flow's hops are evaluated conditioned on the amounts all earlier
/// flows in the set (and previously-committed HTLCs) already place on that channel.
pub fn flow_set_probability<L: Deref>(
	flows: &[Flow], uncertainty: &UncertaintyMap<L>,
) -> f64
where
	L::Target: Logger,
{
	let mut prob = 1.0;
	let mut in_flight: HashMap<(u64, u8), u64> = new_hash_map();
	for flow in flows.iter() {
		for hop in flow.hops.iter() {
			let (min, max, committed) = match uncertainty.half(hop.scid, hop.direction) {
				Some(h) => (h.known_min_msat, h.known_max_msat, h.htlc_total_msat),
				None => (0, hop.capacity_msat, 0),
			};
			let overlay = in_flight.entry((hop.scid, hop.direction)).or_insert(0);
			prob *= edge_probability(min, max, committed + *overlay, hop.amount_msat);
			*overlay += hop.amount_msat;
		}
	}
	prob
}
