// SPDX-License-Identifier: Apache-2.0

//! Rendezvous (highest random weight, "HRW") hashing over an ordered set of
//! `(hostname, hostport)` entries (spec §4.1).
//!
//! This is the only building block the rest of the cluster uses to answer
//! "which node owns repository R" or "which node owns cache key K". Its
//! defining property (spec §8.1) is that adding or removing one entry moves
//! at most `1/n` of keys — unlike a modulo-based hash ring, there's no need
//! to rebalance a whole keyspace on membership change.

use beskar_common::HostPort;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// One contributor to the hash ring: the stable hostname used as the HRW
/// hash key, and the hostport clients actually dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
	pub hostname: String,
	pub hostport: HostPort,
}

/// A rendezvous hash over a mutable set of [`HashEntry`] values.
///
/// Protected by an internal `RwLock` per spec §5 ("`NodeHash`: protected by
/// an internal RW mutex."); `Get` takes the read lock, `Add`/`Remove` take
/// the write lock.
pub struct NodeHash {
	entries: RwLock<Vec<HashEntry>>,
}

impl Default for NodeHash {
	fn default() -> Self {
		Self::new()
	}
}

impl NodeHash {
	pub fn new() -> Self {
		NodeHash {
			entries: RwLock::new(Vec::new()),
		}
	}

	pub fn with_entries(entries: Vec<HashEntry>) -> Self {
		NodeHash {
			entries: RwLock::new(entries),
		}
	}

	/// `H(key, hostname)`: any fast, non-cryptographic 64-bit hash suffices
	/// (spec §4.1). `DefaultHasher` (SipHash-1-3 with fixed keys) is
	/// deterministic across calls and processes, which is the only property
	/// this needs — it doesn't need to resist adversarial input, since
	/// hostnames and repository names are both trusted, cluster-internal
	/// strings.
	fn weight(key: &str, hostname: &str) -> u64 {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		hostname.hash(&mut hasher);
		hasher.finish()
	}

	/// Returns the entry maximizing `H(key, hostname)`, ties broken by
	/// lexicographically smallest hostname. `None` if the ring is empty.
	pub fn get(&self, key: &str) -> Option<HashEntry> {
		let entries = self.entries.read();
		entries
			.iter()
			.map(|entry| (Self::weight(key, &entry.hostname), entry))
			.max_by(|(wa, ea), (wb, eb)| wa.cmp(wb).then_with(|| eb.hostname.cmp(&ea.hostname)))
			.map(|(_, entry)| entry.clone())
	}

	/// Adds an entry, replacing any existing entry with the same hostname.
	pub fn add(&self, entry: HashEntry) {
		let mut entries = self.entries.write();
		if let Some(existing) = entries.iter_mut().find(|e| e.hostname == entry.hostname) {
			*existing = entry;
		} else {
			entries.push(entry);
		}
	}

	/// Removes the entry for `hostname`, if present.
	pub fn remove(&self, hostname: &str) {
		let mut entries = self.entries.write();
		entries.retain(|e| e.hostname != hostname);
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}

	pub fn hostnames(&self) -> Vec<String> {
		self.entries.read().iter().map(|e| e.hostname.clone()).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(hostname: &str) -> HashEntry {
		HashEntry {
			hostname: hostname.to_string(),
			hostport: HostPort {
				host: hostname.to_string(),
				port: 9010,
			},
		}
	}

	#[test]
	fn get_is_deterministic_for_a_fixed_ring() {
		let ring = NodeHash::new();
		for n in ["a", "b", "c", "d"] {
			ring.add(entry(n));
		}
		let first = ring.get("repo/key").unwrap();
		for _ in 0..20 {
			assert_eq!(ring.get("repo/key").unwrap(), first);
		}
	}

	#[test]
	fn empty_ring_returns_none() {
		let ring = NodeHash::new();
		assert!(ring.get("anything").is_none());
	}

	#[test]
	fn remove_then_add_can_change_owner_but_not_unrelated_keys() {
		let ring = NodeHash::new();
		for n in ["a", "b", "c", "d", "e"] {
			ring.add(entry(n));
		}

		let keys: Vec<String> = (0..2000).map(|i| format!("repo/{i}")).collect();
		let before: Vec<String> = keys.iter().map(|k| ring.get(k).unwrap().hostname).collect();

		ring.remove("c");

		let after: Vec<String> = keys.iter().map(|k| ring.get(k).unwrap().hostname).collect();

		let moved = before.iter().zip(after.iter()).filter(|(b, a)| b != a).count();
		// spec §8.1: removing one of n nodes moves at most |keys|/n keys.
		// Allow slack since this is an empirical, not exact, bound for a
		// single fixed-size sample.
		let bound = keys.len() / 5 + keys.len() / 20;
		assert!(
			moved <= bound,
			"moved {moved} of {} keys, expected at most ~{bound}",
			keys.len()
		);

		// every key that *did* move must have been owned by the removed node.
		for ((b, a), key) in before.iter().zip(after.iter()).zip(keys.iter()) {
			if b != a {
				assert_eq!(b, "c", "key {key} moved away from a node that wasn't removed");
			}
		}
	}

	#[test]
	fn tie_break_prefers_lexicographically_smaller_hostname() {
		// construct a ring where we can force a collision isn't needed: this
		// test only checks the comparator direction is well-defined and
		// stable, not a specific collision.
		let ring = NodeHash::new();
		ring.add(entry("b"));
		ring.add(entry("a"));
		let first = ring.get("k").unwrap();
		let second = ring.get("k").unwrap();
		assert_eq!(first, second);
	}
}
