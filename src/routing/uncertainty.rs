// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! What we have learned about channel liquidity.
//!
//! Gossip tells us a channel's total capacity but not how the funds are split between its two
//! ends. Every payment attempt teaches us something, though: a hop that forwarded an amount
//! proves at least that much liquidity towards the next node, and a hop that failed with a
//! temporary failure proves there was less than the amount we tried. [`UncertaintyMap`] records
//! this as a `[known_min, known_max]` interval per channel direction, refined monotonically over
//! the life of the process and shared by all payments.
//!
//! The map also tracks the amounts our own in-flight HTLCs currently occupy on each directed
//! channel, so concurrent parts of a payment (or concurrent payments) don't double-count the
//! same liquidity.

use core::fmt;
use core::ops::Deref;

use crate::prelude::*;
use crate::routing::flow::Flow;
use crate::util::logger::Logger;

/// Liquidity knowledge for one direction of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeliefHalf {
	/// Proven lower bound on the liquidity available in this direction, in millisatoshi.
	pub known_min_msat: u64,
	/// Proven upper bound on the liquidity available in this direction, in millisatoshi.
	pub known_max_msat: u64,
	/// Total amount of our own HTLCs currently in flight over this half.
	pub htlc_total_msat: u64,
	/// Number of our own HTLCs currently in flight over this half.
	pub num_htlcs: u32,
}

impl BeliefHalf {
	fn new(capacity_msat: u64) -> Self {
		BeliefHalf {
			known_min_msat: 0,
			known_max_msat: capacity_msat,
			htlc_total_msat: 0,
			num_htlcs: 0,
		}
	}
}

/// Liquidity knowledge for both directions of a channel.
#[derive(Clone, Debug)]
pub struct ChannelKnowledge {
	/// The channel's total capacity as reported by gossip.
	pub capacity_msat: u64,
	halves: [BeliefHalf; 2],
}

impl ChannelKnowledge {
	/// The belief for the given direction.
	pub fn half(&self, direction: u8) -> &BeliefHalf {
		&self.halves[(direction & 1) as usize]
	}
}

impl fmt::Display for ChannelKnowledge {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"[{},{}]/[{},{}] of {}",
			self.halves[0].known_min_msat,
			self.halves[0].known_max_msat,
			self.halves[1].known_min_msat,
			self.halves[1].known_max_msat,
			self.capacity_msat
		)
	}
}

/// Per-direction channel liquidity bounds, learned from payment attempts.
///
/// Entries are created lazily on first reference and never deleted; beliefs persist (in memory
/// only) and are refined for the life of the process. Instantiate one per node, not per payment,
/// and pass it by reference to searches and sessions so tests can use isolated instances.
pub struct UncertaintyMap<L: Deref>
where
	L::Target: Logger,
{
	channels: HashMap<u64, ChannelKnowledge>,
	logger: L,
}

impl<L: Deref> UncertaintyMap<L>
where
	L::Target: Logger,
{
	/// Creates a new, empty map.
	pub fn new(logger: L) -> Self {
		UncertaintyMap { channels: new_hash_map(), logger }
	}

	/// The knowledge entry for `short_channel_id`, created as the fully-uncertain
	/// `[0, capacity]` in both directions if we have never seen the channel before.
	pub fn get_or_create(
		&mut self, short_channel_id: u64, capacity_msat: u64,
	) -> &mut ChannelKnowledge {
		Self::entry(&mut self.channels, short_channel_id, capacity_msat)
	}

	fn entry(
		channels: &mut HashMap<u64, ChannelKnowledge>, short_channel_id: u64, capacity_msat: u64,
	) -> &mut ChannelKnowledge {
		channels.entry(short_channel_id).or_insert_with(|| ChannelKnowledge {
			capacity_msat,
			halves: [BeliefHalf::new(capacity_msat), BeliefHalf::new(capacity_msat)],
		})
	}

	/// The belief for one direction of a channel, if any attempt has touched it.
	pub fn half(&self, short_channel_id: u64, direction: u8) -> Option<&BeliefHalf> {
		self.channels.get(&short_channel_id).map(|k| k.half(direction))
	}

	/// Raises `known_min` to `amount_msat`: we observed the channel forward that much.
	///
	/// Narrowing only; a smaller amount than the current bound is a no-op, which makes the
	/// update idempotent. If the new minimum contradicts `known_max`, the maximum is the bound
	/// without direct evidence behind it, so it resets to the full capacity and we log the
	/// stale-knowledge event.
	pub fn tighten_min(
		&mut self, short_channel_id: u64, direction: u8, capacity_msat: u64, amount_msat: u64,
	) {
		let knowledge = Self::entry(&mut self.channels, short_channel_id, capacity_msat);
		let cap_msat = knowledge.capacity_msat;
		let amount_msat = amount_msat.min(cap_msat);
		let half = &mut knowledge.halves[(direction & 1) as usize];
		if amount_msat <= half.known_min_msat {
			return;
		}
		half.known_min_msat = amount_msat;
		if half.known_min_msat > half.known_max_msat {
			half.known_max_msat = cap_msat;
			log_warn!(
				self.logger,
				"Liquidity knowledge for channel {}/{} was stale: observed min {} above known max, resetting max to capacity {}",
				short_channel_id, direction & 1, amount_msat, cap_msat
			);
		}
		debug_assert!(half.known_min_msat <= half.known_max_msat);
	}

	/// Lowers `known_max` to `amount_msat`: we observed the channel fail to forward more.
	///
	/// Narrowing only, like [`Self::tighten_min`]. On contradiction the minimum resets to zero,
	/// since the failure is the evidence we trust now.
	pub fn tighten_max(
		&mut self, short_channel_id: u64, direction: u8, capacity_msat: u64, amount_msat: u64,
	) {
		let knowledge = Self::entry(&mut self.channels, short_channel_id, capacity_msat);
		let amount_msat = amount_msat.min(knowledge.capacity_msat);
		let half = &mut knowledge.halves[(direction & 1) as usize];
		if amount_msat >= half.known_max_msat {
			return;
		}
		half.known_max_msat = amount_msat;
		if half.known_min_msat > half.known_max_msat {
			half.known_min_msat = 0;
			log_warn!(
				self.logger,
				"Liquidity knowledge for channel {}/{} was stale: observed max {} below known min, resetting min to 0",
				short_channel_id, direction & 1, amount_msat
			);
		}
		debug_assert!(half.known_min_msat <= half.known_max_msat);
	}

	/// Pins both bounds to an exactly-known liquidity, e.g. for our own channels whose balance
	/// we can read locally.
	pub fn set_liquidity(
		&mut self, short_channel_id: u64, direction: u8, capacity_msat: u64, amount_msat: u64,
	) {
		let knowledge = self.get_or_create(short_channel_id, capacity_msat);
		let amount_msat = amount_msat.min(knowledge.capacity_msat);
		let half = &mut knowledge.halves[(direction & 1) as usize];
		half.known_min_msat = amount_msat;
		half.known_max_msat = amount_msat;
	}

	/// Registers the per-hop amounts of a dispatched flow as in-flight, so later searches see
	/// the occupied liquidity. Must be balanced by [`Self::remove_flow`] when the flow resolves.
	pub fn commit_flow(&mut self, flow: &Flow) {
		for hop in flow.hops.iter() {
			let knowledge = self.get_or_create(hop.scid, hop.capacity_msat);
			let half = &mut knowledge.halves[(hop.direction & 1) as usize];
			half.htlc_total_msat = half.htlc_total_msat.saturating_add(hop.amount_msat);
			half.num_htlcs += 1;
		}
	}

	/// Removes a previously-committed flow's amounts from the in-flight totals.
	pub fn remove_flow(&mut self, flow: &Flow) {
		for hop in flow.hops.iter() {
			let knowledge = self.get_or_create(hop.scid, hop.capacity_msat);
			let half = &mut knowledge.halves[(hop.direction & 1) as usize];
			debug_assert!(half.htlc_total_msat >= hop.amount_msat);
			debug_assert!(half.num_htlcs > 0);
			half.htlc_total_msat = half.htlc_total_msat.saturating_sub(hop.amount_msat);
			half.num_htlcs = half.num_htlcs.saturating_sub(1);
		}
	}

	#[cfg(test)]
	pub(crate) fn check_invariants(&self) {
		for (scid, knowledge) in self.channels.iter() {
			for half in knowledge.halves.iter() {
				assert!(
					half.known_min_msat <= half.known_max_msat,
					"channel {}: min {} > max {}",
					scid,
					half.known_min_msat,
					half.known_max_msat
				);
				assert!(half.known_max_msat <= knowledge.capacity_msat);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::routing::flow::{Flow, FlowHop};
	use crate::util::test_utils::TestLogger;

	const CAP: u64 = 1_000_000;

	#[test]
	fn lazy_creation_is_fully_uncertain() {
		let logger = TestLogger::new();
		let mut map = UncertaintyMap::new(&logger);
		let knowledge = map.get_or_create(1, CAP);
		for dir in 0..2 {
			assert_eq!(knowledge.half(dir).known_min_msat, 0);
			assert_eq!(knowledge.half(dir).known_max_msat, CAP);
		}
	}

	#[test]
	fn tighten_narrows_monotonically() {
		let logger = TestLogger::new();
		let mut map = UncertaintyMap::new(&logger);
		map.tighten_min(1, 0, CAP, 300_000);
		map.tighten_max(1, 0, CAP, 700_000);
		// Weaker observations leave the bounds alone.
		map.tighten_min(1, 0, CAP, 100_000);
		map.tighten_max(1, 0, CAP, 900_000);
		let half = map.half(1, 0).unwrap();
		assert_eq!(half.known_min_msat, 300_000);
		assert_eq!(half.known_max_msat, 700_000);
		// The other direction is untouched.
		assert_eq!(map.half(1, 1).unwrap().known_max_msat, CAP);
	}

	#[test]
	fn contradiction_resets_unevidenced_bound() {
		let logger = TestLogger::new();
		let mut map = UncertaintyMap::new(&logger);
		map.tighten_max(1, 0, CAP, 200_000);
		// Observing a forward of 500k contradicts max=200k; max resets to capacity.
		map.tighten_min(1, 0, CAP, 500_000);
		let half = map.half(1, 0).unwrap();
		assert_eq!(half.known_min_msat, 500_000);
		assert_eq!(half.known_max_msat, CAP);
		logger.assert_log_contains(
			"lightning_flowpay::routing::uncertainty",
			"stale",
			1,
		);

		// And the mirror case: a failure below a known min resets min to zero.
		map.tighten_max(1, 0, CAP, 100_000);
		let half = map.half(1, 0).unwrap();
		assert_eq!(half.known_min_msat, 0);
		assert_eq!(half.known_max_msat, 100_000);
	}

	#[test]
	fn randomized_interleavings_preserve_invariant() {
		let logger = TestLogger::new();
		let mut map = UncertaintyMap::new(&logger);
		// Cheap deterministic LCG so the test doesn't need an RNG dependency.
		let mut state: u64 = 0x5deece66d;
		let mut next = move || {
			state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
			state >> 33
		};
		for _ in 0..10_000 {
			let scid = next() % 7;
			let dir = (next() & 1) as u8;
			let amount = next() % (CAP + CAP / 2);
			if next() & 1 == 0 {
				map.tighten_min(scid, dir, CAP, amount);
			} else {
				map.tighten_max(scid, dir, CAP, amount);
			}
			map.check_invariants();
		}
	}

	#[test]
	fn in_flight_accounting_balances() {
		let logger = TestLogger::new();
		let mut map = UncertaintyMap::new(&logger);
		let flow = Flow {
			hops: vec![
				FlowHop { scid: 1, direction: 0, capacity_msat: CAP, amount_msat: 10_500 },
				FlowHop { scid: 2, direction: 1, capacity_msat: CAP, amount_msat: 10_000 },
			],
			success_prob: 1.0,
		};
		map.commit_flow(&flow);
		assert_eq!(map.half(1, 0).unwrap().htlc_total_msat, 10_500);
		assert_eq!(map.half(2, 1).unwrap().htlc_total_msat, 10_000);
		assert_eq!(map.half(2, 1).unwrap().num_htlcs, 1);
		map.commit_flow(&flow);
		assert_eq!(map.half(1, 0).unwrap().htlc_total_msat, 21_000);
		map.remove_flow(&flow);
		map.remove_flow(&flow);
		assert_eq!(map.half(1, 0).unwrap().htlc_total_msat, 0);
		assert_eq!(map.half(2, 1).unwrap().num_htlcs, 0);
	}

	#[test]
	fn set_liquidity_pins_both_bounds() {
		let logger = TestLogger::new();
		let mut map = UncertaintyMap::new(&logger);
		map.set_liquidity(9, 0, CAP, 123_456);
		let half = map.half(9, 0).unwrap();
		assert_eq!(half.known_min_msat, 123_456);
		assert_eq!(half.known_max_msat, 123_456);
	}
}
