//! This crate uses `hashbrown`'s `HashMap`s with the `std` `RandomState` hasher throughout, which
//! randomizes hashing and so is not vulnerable to HashDoS from attacker-controlled channel ids.
//!
//! This module simply re-exports the `HashMap` used here for public consumption.

pub use std::collections::hash_map::RandomState;

/// The HashMap type used in this crate.
pub type HashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;
/// The HashSet type used in this crate.
pub type HashSet<K> = hashbrown::HashSet<K, RandomState>;

/// Builds a new [`HashMap`].
pub fn new_hash_map<K, V>() -> HashMap<K, V> {
	HashMap::with_hasher(RandomState::new())
}
/// Builds a new [`HashSet`].
pub fn new_hash_set<K>() -> HashSet<K> {
	HashSet::with_hasher(RandomState::new())
}
