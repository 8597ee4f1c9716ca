//! Ordered host list arithmetic.
//!
//! Addresses are compared by their canonical form, so `::ffff:10.0.0.1` and
//! `10.0.0.1` name the same host.

use std::{collections::HashSet, net::IpAddr};

fn key(ip: &IpAddr) -> IpAddr {
	ip.to_canonical()
}

pub fn contains(list: &[IpAddr], ip: &IpAddr) -> bool {
	list.iter().any(|other| key(other) == key(ip))
}

/// Returns `(joined, departed)`: hosts only in `new` in `new`'s order, and
/// hosts only in `old` in `old`'s order. Duplicates are reported once.
pub fn diff(old: &[IpAddr], new: &[IpAddr]) -> (Vec<IpAddr>, Vec<IpAddr>) {
	let old_keys: HashSet<IpAddr> = old.iter().map(key).collect();
	let new_keys: HashSet<IpAddr> = new.iter().map(key).collect();
	let mut seen = HashSet::new();
	let joined = new
		.iter()
		.filter(|ip| !old_keys.contains(&key(ip)) && seen.insert(key(ip)))
		.copied()
		.collect();
	seen.clear();
	let departed = old
		.iter()
		.filter(|ip| !new_keys.contains(&key(ip)) && seen.insert(key(ip)))
		.copied()
		.collect();
	(joined, departed)
}

/// `list` without anything in `remove`, order kept.
pub fn remove(list: &[IpAddr], remove: &[IpAddr]) -> Vec<IpAddr> {
	let drop: HashSet<IpAddr> = remove.iter().map(key).collect();
	list.iter().filter(|ip| !drop.contains(&key(ip))).copied().collect()
}

/// `list` followed by the entries of `extra` it does not already hold.
pub fn union(list: &[IpAddr], extra: &[IpAddr]) -> Vec<IpAddr> {
	let mut seen: HashSet<IpAddr> = HashSet::new();
	list.iter()
		.chain(extra)
		.filter(|ip| seen.insert(key(ip)))
		.copied()
		.collect()
}
