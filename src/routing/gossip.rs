// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The [`NetworkGraph`] is a snapshot of the publicly-visible channel topology, fed to the crate
//! by whatever gossip layer the caller runs. The graph tells us which channels exist, who they
//! connect, and the forwarding policy each endpoint has announced; what it cannot tell us is how
//! the channel's funds are split between the two ends, which is the business of
//! [`UncertaintyMap`].
//!
//! [`UncertaintyMap`]: crate::routing::uncertainty::UncertaintyMap

use bitcoin::secp256k1::constants::PUBLIC_KEY_SIZE;
use bitcoin::secp256k1::PublicKey;

use core::cmp;
use core::fmt;

use crate::prelude::*;

/// Represents the compressed public key of a node
#[derive(Clone, Copy)]
pub struct NodeId([u8; PUBLIC_KEY_SIZE]);

impl NodeId {
	/// Create a new NodeId from a public key
	pub fn from_pubkey(pubkey: &PublicKey) -> Self {
		NodeId(pubkey.serialize())
	}

	/// Create a new NodeId from a slice of bytes
	pub fn from_slice(bytes: &[u8]) -> Result<Self, ()> {
		if bytes.len() != PUBLIC_KEY_SIZE {
			return Err(());
		}
		let mut data = [0; PUBLIC_KEY_SIZE];
		data.copy_from_slice(bytes);
		Ok(NodeId(data))
	}

	/// Get the public key slice from this NodeId
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "NodeId({})", log_bytes!(self.0))
	}
}
impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", log_bytes!(self.0))
	}
}

impl core::hash::Hash for NodeId {
	fn hash<H: core::hash::Hasher>(&self, hasher: &mut H) {
		self.0.hash(hasher);
	}
}

impl Eq for NodeId {}

impl PartialEq for NodeId {
	fn eq(&self, other: &Self) -> bool {
		self.0[..] == other.0[..]
	}
}

impl cmp::PartialOrd for NodeId {
	fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for NodeId {
	fn cmp(&self, other: &Self) -> cmp::Ordering {
		self.0[..].cmp(&other.0[..])
	}
}

/// Fees for routing via a given channel.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash)]
pub struct RoutingFees {
	/// Flat routing fee in millisatoshis.
	pub base_msat: u32,
	/// Liquidity-based routing fee in millionths of a routed amount. In other words, 10000 is 1%.
	pub proportional_millionths: u32,
}

impl RoutingFees {
	/// The fee charged for forwarding `amount_msat` through a channel with these fees, or `None`
	/// on overflow.
	pub fn fee_msat(&self, amount_msat: u64) -> Option<u64> {
		let prop = amount_msat.checked_mul(self.proportional_millionths as u64)? / 1_000_000;
		prop.checked_add(self.base_msat as u64)
	}
}

/// Details about one direction of a channel as received within a channel update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUpdateInfo {
	/// Whether the channel can be currently used for payments (in this one direction).
	pub enabled: bool,
	/// The difference in CLTV values that you must have when routing through this channel.
	pub cltv_expiry_delta: u16,
	/// The minimum value, which must be relayed to the next hop via the channel
	pub htlc_minimum_msat: u64,
	/// The maximum value which may be relayed to the next hop via the channel.
	pub htlc_maximum_msat: u64,
	/// Fees charged when the channel is used for routing
	pub fees: RoutingFees,
}

/// Details about a channel (both directions).
#[derive(Clone, Debug)]
pub struct ChannelInfo {
	/// Source node of the first direction of a channel
	pub node_one: NodeId,
	/// Source node of the second direction of a channel
	pub node_two: NodeId,
	/// The channel's total capacity, in millisatoshi. An upper bound on the liquidity available
	/// in either direction.
	pub capacity_msat: u64,
	/// Details about the first direction of a channel
	pub one_to_two: Option<ChannelUpdateInfo>,
	/// Details about the second direction of a channel
	pub two_to_one: Option<ChannelUpdateInfo>,
}

impl ChannelInfo {
	/// The forwarding policy for the given direction, if an update has been received for it.
	/// Direction 0 forwards from [`Self::node_one`] towards [`Self::node_two`].
	pub fn update_info(&self, direction: u8) -> Option<&ChannelUpdateInfo> {
		if direction == 0 {
			self.one_to_two.as_ref()
		} else {
			self.two_to_one.as_ref()
		}
	}

	/// The direction in which `source` forwards over this channel, or `None` if `source` is not
	/// an endpoint.
	pub fn direction_from(&self, source: &NodeId) -> Option<u8> {
		if *source == self.node_one {
			Some(0)
		} else if *source == self.node_two {
			Some(1)
		} else {
			None
		}
	}

	/// The node a payment travelling in `direction` arrives at.
	pub fn destination(&self, direction: u8) -> &NodeId {
		if direction == 0 {
			&self.node_two
		} else {
			&self.node_one
		}
	}

}

/// Details about a node in the network.
#[derive(Clone, Debug, Default)]
pub struct NodeInfo {
	/// All valid channels a node has announced, by short channel id.
	pub channels: Vec<u64>,
}

/// Represents the network as nodes and channels between them.
///
/// Unlike a full gossip store this is a plain snapshot: the caller builds it (or rebuilds it) from
/// their gossip source and hands it to the router by reference. No signature checking happens
/// here; the graph is trusted as given.
pub struct NetworkGraph {
	channels: HashMap<u64, ChannelInfo>,
	nodes: HashMap<NodeId, NodeInfo>,
}

impl NetworkGraph {
	/// Creates a new, empty [`NetworkGraph`].
	pub fn new() -> Self {
		NetworkGraph { channels: new_hash_map(), nodes: new_hash_map() }
	}

	/// Adds a channel between the given nodes with the given total capacity. The lower-keyed
	/// node becomes `node_one` regardless of argument order, matching the direction convention
	/// used in channel updates.
	///
	/// Replaces any channel previously known under the same short channel id.
	pub fn add_channel(&mut self, short_channel_id: u64, a: NodeId, b: NodeId, capacity_msat: u64) {
		let (node_one, node_two) = if a < b { (a, b) } else { (b, a) };
		self.channels.insert(
			short_channel_id,
			ChannelInfo { node_one, node_two, capacity_msat, one_to_two: None, two_to_one: None },
		);
		self.nodes.entry(node_one).or_insert_with(NodeInfo::default).channels.push(short_channel_id);
		self.nodes.entry(node_two).or_insert_with(NodeInfo::default).channels.push(short_channel_id);
	}

	/// Sets the forwarding policy for one direction of an existing channel. Does nothing if the
	/// channel is unknown.
	pub fn update_channel(
		&mut self, short_channel_id: u64, direction: u8, info: ChannelUpdateInfo,
	) {
		if let Some(chan) = self.channels.get_mut(&short_channel_id) {
			if direction == 0 {
				chan.one_to_two = Some(info);
			} else {
				chan.two_to_one = Some(info);
			}
		}
	}

	/// Looks up a channel by short channel id.
	pub fn channel(&self, short_channel_id: u64) -> Option<&ChannelInfo> {
		self.channels.get(&short_channel_id)
	}

	/// Looks up a node.
	pub fn node(&self, node_id: &NodeId) -> Option<&NodeInfo> {
		self.nodes.get(node_id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{add_test_channel, test_node_id};

	#[test]
	fn node_ordering_fixes_direction() {
		let (a, b) = (test_node_id(1), test_node_id(2));
		let mut graph = NetworkGraph::new();
		// Add with arguments in both orders; node_one must always be the lesser id.
		graph.add_channel(1, a, b, 1_000_000);
		graph.add_channel(2, b, a, 1_000_000);
		let (lesser, greater) = if a < b { (a, b) } else { (b, a) };
		for scid in 1..=2 {
			let chan = graph.channel(scid).unwrap();
			assert_eq!(chan.node_one, lesser);
			assert_eq!(chan.node_two, greater);
			assert_eq!(chan.direction_from(&lesser), Some(0));
			assert_eq!(chan.direction_from(&greater), Some(1));
			assert_eq!(chan.destination(0), &greater);
		}
	}

	#[test]
	fn update_info_per_direction() {
		let (a, b) = (test_node_id(1), test_node_id(2));
		let mut graph = NetworkGraph::new();
		add_test_channel(&mut graph, 42, a, b, 5_000_000, 1, 100, 6);
		let chan = graph.channel(42).unwrap();
		assert!(chan.update_info(0).unwrap().enabled);
		assert!(chan.update_info(1).unwrap().enabled);
		assert_eq!(chan.update_info(0).unwrap().htlc_maximum_msat, 5_000_000);
	}

	#[test]
	fn fee_computation() {
		let fees = RoutingFees { base_msat: 10, proportional_millionths: 1000 };
		// 1000 ppm of 1M msat is 1000 msat plus the base fee.
		assert_eq!(fees.fee_msat(1_000_000), Some(1010));
		assert_eq!(fees.fee_msat(0), Some(10));
		let max = RoutingFees { base_msat: 0, proportional_millionths: u32::MAX };
		assert!(max.fee_msat(u64::MAX).is_none());
	}
}
