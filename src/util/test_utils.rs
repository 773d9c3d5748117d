// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::ln::payment::PaymentHash;
use crate::prelude::*;
use crate::routing::gossip::{ChannelUpdateInfo, NetworkGraph, NodeId, RoutingFees};
use crate::util::logger::{Level, Logger, Record};

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use std::sync::Mutex;

pub struct TestLogger {
	level: Level,
	id: String,
	pub lines: Mutex<HashMap<(String, String), usize>>,
	pub context: Mutex<HashMap<(String, Option<PaymentHash>), usize>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}
	pub fn with_id(id: String) -> TestLogger {
		TestLogger {
			level: Level::Trace,
			id,
			lines: Mutex::new(new_hash_map()),
			context: Mutex::new(new_hash_map()),
		}
	}
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}
	pub fn assert_log(&self, module: &str, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		assert_eq!(log_entries.get(&(module.to_string(), line)), Some(&count));
	}

	/// Search for the number of occurrence of the logged lines which
	/// 1. belongs to the specified module and
	/// 2. contains `line` in it.
	/// And asserts if the number of occurrences is the same with the given `count`
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == module && l.contains(line))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count, "{} part lines containing {}", l, line);
	}

	pub fn assert_log_context_contains(
		&self, module: &str, payment_hash: Option<PaymentHash>, count: usize,
	) {
		let context_entries = self.context.lock().unwrap();
		let l = context_entries.get(&(module.to_string(), payment_hash)).unwrap();
		assert_eq!(*l, count)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: Record) {
		let context = (record.module_path.to_string(), record.payment_hash);
		let s = format!("{}", record.args);
		*self.lines.lock().unwrap().entry((record.module_path.to_string(), s.clone())).or_insert(0) += 1;
		*self.context.lock().unwrap().entry(context).or_insert(0) += 1;
		if record.level >= self.level {
			println!(
				"{:<5} {} [{} : {}] {}",
				record.level.to_string(),
				self.id,
				record.module_path,
				record.line,
				s
			);
		}
	}
}

/// A deterministic node id for tests, derived from a small integer.
pub fn test_node_id(i: u8) -> NodeId {
	NodeId::from_pubkey(&test_node_pubkey(i))
}

pub fn test_node_pubkey(i: u8) -> PublicKey {
	let secp_ctx = Secp256k1::new();
	PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[i; 32]).unwrap())
}

/// Adds a channel between `a` and `b` with symmetric updates using the given fees and limits,
/// enabled in both directions.
pub fn add_test_channel(
	graph: &mut NetworkGraph, scid: u64, a: NodeId, b: NodeId, capacity_msat: u64,
	base_msat: u32, proportional_millionths: u32, cltv_expiry_delta: u16,
) {
	graph.add_channel(scid, a, b, capacity_msat);
	let info = ChannelUpdateInfo {
		enabled: true,
		cltv_expiry_delta,
		htlc_minimum_msat: 0,
		htlc_maximum_msat: capacity_msat,
		fees: RoutingFees { base_msat, proportional_millionths },
	};
	graph.update_channel(scid, 0, info.clone());
	graph.update_channel(scid, 1, info);
}

/// Builds the standard three-hop line topology used across tests:
/// `node(1) -- scid 1 -- node(2) -- scid 2 -- node(3) -- scid 3 -- node(4)`,
/// each channel with the given capacity and 1000ppm proportional fee.
pub fn three_hop_line(capacity_msat: u64) -> (NetworkGraph, Vec<NodeId>) {
	let mut graph = NetworkGraph::new();
	let nodes: Vec<NodeId> = (1..=4).map(|i| test_node_id(i)).collect();
	for i in 0..3 {
		add_test_channel(
			&mut graph,
			(i + 1) as u64,
			nodes[i],
			nodes[i + 1],
			capacity_msat,
			0,
			1000,
			6,
		);
	}
	(graph, nodes)
}
