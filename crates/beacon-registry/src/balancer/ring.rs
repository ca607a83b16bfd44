//! Consistent hash ring
//!
//! TigerStyle: Deterministic hashing, sorted points, binary search lookup.

use sha2::{Digest, Sha256};

/// Hash a key onto the ring: first 4 bytes of SHA-256, big-endian
pub fn ring_hash(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Ring of virtual nodes over a fixed set of instance IDs
#[derive(Debug, Clone)]
pub struct HashRing {
    /// (point hash, index into `nodes`), sorted
    points: Vec<(u32, usize)>,
    nodes: Vec<String>,
    virtual_nodes_count: u32,
}

impl HashRing {
    /// Place `virtual_nodes_count` points per node at `ring_hash("{id}:{i}")`
    pub fn new(nodes: &[String], virtual_nodes_count: u32) -> Self {
        assert!(virtual_nodes_count > 0, "virtual node count must be positive");
        let mut points = Vec::with_capacity(nodes.len() * virtual_nodes_count as usize);
        for (index, node) in nodes.iter().enumerate() {
            for i in 0..virtual_nodes_count {
                points.push((ring_hash(&format!("{}:{}", node, i)), index));
            }
        }
        // Tie-break colliding points by node ID so lookups do not depend on input order.
        points.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| nodes[a.1].cmp(&nodes[b.1])));

        debug_assert_eq!(points.len(), nodes.len() * virtual_nodes_count as usize);
        Self {
            points,
            nodes: nodes.to_vec(),
            virtual_nodes_count,
        }
    }

    /// Node owning the first point at or after the key's hash, wrapping around
    pub fn lookup(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = ring_hash(key);
        let position = self.points.partition_point(|(point, _)| *point < hash);
        let (_, index) = self.points[position % self.points.len()];
        Some(self.nodes[index].as_str())
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn virtual_nodes_count(&self) -> u32 {
        self.virtual_nodes_count
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn nodes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ring_hash_is_stable() {
        assert_eq!(ring_hash("user-1"), ring_hash("user-1"));
        assert_ne!(ring_hash("user-1"), ring_hash("user-2"));
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(&[], 150);
        assert!(ring.is_empty());
        assert_eq!(ring.lookup("key"), None);
    }

    #[test]
    fn test_point_count() {
        let ring = HashRing::new(&nodes(&["a", "b", "c"]), 150);
        assert_eq!(ring.point_count(), 450);
    }

    #[test]
    fn test_lookup_independent_of_node_order() {
        let forward = HashRing::new(&nodes(&["a", "b", "c"]), 150);
        let reverse = HashRing::new(&nodes(&["c", "b", "a"]), 150);
        for i in 0..200 {
            let key = format!("key-{}", i);
            assert_eq!(forward.lookup(&key), reverse.lookup(&key));
        }
    }

    #[test]
    fn test_distribution_covers_all_nodes() {
        let ring = HashRing::new(&nodes(&["a", "b", "c", "d"]), 150);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for i in 0..4000 {
            let key = format!("session-{}", i);
            *counts.entry(ring.lookup(&key).unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        for (node, count) in counts {
            assert!(count > 500, "node {} only received {} keys", node, count);
        }
    }

    #[test]
    fn test_removing_node_only_remaps_its_keys() {
        let before = HashRing::new(&nodes(&["a", "b", "c", "d"]), 150);
        let after = HashRing::new(&nodes(&["a", "b", "c"]), 150);
        for i in 0..1000 {
            let key = format!("key-{}", i);
            let owner = before.lookup(&key).unwrap();
            if owner != "d" {
                assert_eq!(after.lookup(&key), Some(owner));
            }
        }
    }
}
