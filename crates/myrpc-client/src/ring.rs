//! Consistent-hash routing.
//!
//! Each backend owns `replicas` points on a ring of 32-bit CRC hashes; a key
//! routes to the owner of the first point strictly greater than the key's
//! hash, wrapping to the smallest point. Adding or removing one backend only
//! moves the keys adjacent to its points.

use std::collections::HashMap;

/// Points per backend when none is specified.
pub const DEFAULT_REPLICAS: usize = 5;

/// A consistent-hash ring over backend addresses.
pub struct HashRing {
    replicas: usize,
    /// Ring point → owning backend.
    nodes: HashMap<u32, String>,
    /// All ring points, sorted ascending.
    sorted: Vec<u32>,
}

impl HashRing {
    /// Builds a ring holding `nodes`, each with `replicas` points
    /// (0 means [`DEFAULT_REPLICAS`]).
    pub fn new<S: AsRef<str>>(nodes: &[S], replicas: usize) -> Self {
        let mut ring = Self {
            replicas: if replicas == 0 { DEFAULT_REPLICAS } else { replicas },
            nodes: HashMap::new(),
            sorted: Vec::new(),
        };
        for node in nodes {
            ring.add_node(node.as_ref());
        }
        ring
    }

    /// Adds a backend and its replica points.
    pub fn add_node(&mut self, addr: &str) {
        for i in 0..self.replicas {
            let key = hash_key(&format!("{}{}", i, addr));
            self.nodes.insert(key, addr.to_string());
            self.sorted.push(key);
        }
        self.sorted.sort_unstable();
    }

    /// Removes a backend and its replica points.
    pub fn remove_node(&mut self, addr: &str) {
        for i in 0..self.replicas {
            let key = hash_key(&format!("{}{}", i, addr));
            self.nodes.remove(&key);
            if let Ok(pos) = self.sorted.binary_search(&key) {
                self.sorted.remove(pos);
            }
        }
    }

    /// Routes a key to a backend; `None` on an empty ring.
    ///
    /// The owner is the first ring point strictly greater than the key's
    /// hash, wrapping around to the first point.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        if self.sorted.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let pos = self.sorted.partition_point(|&point| point <= hash);
        let point = if pos == self.sorted.len() {
            self.sorted[0]
        } else {
            self.sorted[pos]
        };
        self.nodes.get(&point).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_ring_routes_nowhere() {
        let ring = HashRing::new::<&str>(&[], 5);
        assert!(ring.is_empty());
        assert_eq!(ring.get_node("anything"), None);
    }

    #[test]
    fn lookups_are_deterministic() {
        let ring = HashRing::new(&["tcp@a", "tcp@b", "tcp@c"], 5);
        for key in ["k1", "k2", "some-longer-key"] {
            let first = ring.get_node(key).unwrap().to_string();
            for _ in 0..10 {
                assert_eq!(ring.get_node(key).unwrap(), first);
            }
        }
    }

    #[test]
    fn every_backend_owns_exactly_replica_count_points() {
        let backends = ["tcp@a", "tcp@b", "tcp@c", "tcp@d"];
        let replicas = 7;
        let ring = HashRing::new(&backends, replicas);

        assert_eq!(ring.sorted.len(), backends.len() * replicas);
        let mut owned: HashMap<&str, usize> = HashMap::new();
        for addr in ring.nodes.values() {
            *owned.entry(addr.as_str()).or_default() += 1;
        }
        for backend in backends {
            assert_eq!(owned[backend], replicas, "{}", backend);
        }
        // And each point is exactly crc32("<i><addr>").
        for backend in backends {
            for i in 0..replicas {
                let key = hash_key(&format!("{}{}", i, backend));
                assert_eq!(ring.nodes[&key], backend);
            }
        }
    }

    #[test]
    fn zero_replicas_falls_back_to_default() {
        let ring = HashRing::new(&["tcp@a"], 0);
        assert_eq!(ring.len(), DEFAULT_REPLICAS);
    }

    #[test]
    fn removing_a_backend_reroutes_only_its_keys() {
        let ring_before = HashRing::new(&["tcp@a", "tcp@b", "tcp@c"], 20);
        let mut ring_after = HashRing::new(&["tcp@a", "tcp@b", "tcp@c"], 20);
        ring_after.remove_node("tcp@b");
        assert_eq!(ring_after.len(), 2 * 20);

        let mut moved = 0usize;
        let total = 2000usize;
        for i in 0..total {
            let key = format!("key-{}", i);
            let before = ring_before.get_node(&key).unwrap();
            let after = ring_after.get_node(&key).unwrap();
            if before == "tcp@b" {
                // Keys owned by the removed backend must move...
                assert_ne!(after, "tcp@b");
                moved += 1;
            } else {
                // ...and nobody else's may.
                assert_eq!(before, after);
            }
        }
        assert!(moved > 0);
    }

    #[test]
    fn add_and_remove_round_trips_the_ring() {
        let mut ring = HashRing::new(&["tcp@a", "tcp@b"], 5);
        let baseline: Vec<u32> = ring.sorted.clone();

        ring.add_node("tcp@c");
        assert_eq!(ring.len(), 15);
        ring.remove_node("tcp@c");
        assert_eq!(ring.sorted, baseline);
    }

    #[test]
    fn keys_spread_across_all_backends() {
        // Distribution scenario: 5 backends, 10k keys; every backend ends up
        // with a 10%-30% share. Replica count is high enough to keep arc
        // lengths well concentrated.
        let backends = [
            "tcp@10.0.0.1:8001",
            "tcp@10.0.0.2:8002",
            "tcp@10.0.0.3:8003",
            "tcp@10.0.0.4:8004",
            "tcp@10.0.0.5:8005",
        ];
        let ring = HashRing::new(&backends, 50);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..10_000 {
            let node = ring.get_node(&format!("client-key-{}", i)).unwrap();
            *counts.entry(node.to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), backends.len());
        for (backend, count) in counts {
            assert!(
                (1_000..=3_000).contains(&count),
                "{} got {} keys",
                backend,
                count
            );
        }
    }
}
