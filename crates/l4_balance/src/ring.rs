use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Virtual nodes placed on the ring per backend.
pub(crate) const VIRTUAL_NODES: u32 = 160;

/// A consistent-hash ring over backend slot indices.
///
/// Each backend contributes `VIRTUAL_NODES` points keyed by its address
/// label, so removing one backend only vacates that backend's arcs; keys
/// landing on surviving backends keep their assignment.
#[derive(Debug, Default)]
pub(crate) struct HashRing {
    // (point hash, slot index), sorted by hash.
    points: Vec<(u64, u16)>,
}

impl HashRing {
    pub(crate) fn build(labels: &[String]) -> Self {
        let mut points = Vec::with_capacity(labels.len() * VIRTUAL_NODES as usize);
        for (idx, label) in labels.iter().enumerate() {
            for vnode in 0..VIRTUAL_NODES {
                points.push((point_hash(label, vnode), idx as u16));
            }
        }
        points.sort_unstable();
        Self { points }
    }

    /// First eligible slot at or clockwise from `key`.
    pub(crate) fn select<F>(&self, key: u64, eligible: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        if self.points.is_empty() {
            return None;
        }
        let start = self.points.partition_point(|(hash, _)| *hash < key);
        for offset in 0..self.points.len() {
            let (_, idx) = self.points[(start + offset) % self.points.len()];
            if eligible(idx as usize) {
                return Some(idx as usize);
            }
        }
        None
    }
}

// DefaultHasher::new() uses fixed keys, so point and key hashes are stable
// for the lifetime of the process.
fn point_hash(label: &str, vnode: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    label.hash(&mut hasher);
    vnode.hash(&mut hasher);
    hasher.finish()
}

/// Hash of the client IP only; the port is deliberately excluded so one
/// client maps to one backend across reconnects.
pub(crate) fn hash_ip(ip: IpAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    match ip {
        IpAddr::V4(addr) => addr.octets().hash(&mut hasher),
        IpAddr::V6(addr) => addr.octets().hash(&mut hasher),
    }
    hasher.finish()
}
