use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};

/// The routing table of a consistent-hash exchange.
///
/// Each bound queue owns `weight` points on a 64-bit ring. A routing key is
/// hashed onto the ring and lands on the first point at or after it,
/// wrapping around at the top. The same key always lands on the same queue
/// as long as the bindings don't change, which is what keeps per-key ordering
/// intact downstream.
#[derive(Clone, Debug, Default)]
pub struct HashRing {
    points: BTreeMap<u64, String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `weight` points for `queue`. Binding the same queue again adds
    /// the same points, so it is idempotent for equal weights.
    pub fn bind(&mut self, queue: &str, weight: u32) {
        for index in 0..weight {
            self.points.insert(Self::point_for_binding(queue, index), queue.to_owned());
        }
    }

    #[cfg(test)]
    fn unbind(&mut self, queue: &str) {
        self.points.retain(|_, bound| bound != queue);
    }

    /// Returns the queue a routing key maps to, or `None` with no bindings.
    pub fn route(&self, routing_key: &str) -> Option<&str> {
        let point = Self::point(routing_key.as_bytes());
        self.points
            .range(point..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, queue)| queue.as_str())
    }

    /// Returns every bound queue once, in ring order of their first point.
    #[cfg(test)]
    fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = Vec::new();
        for queue in self.points.values() {
            if !queues.contains(&queue.as_str()) {
                queues.push(queue);
            }
        }
        queues
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn point_for_binding(queue: &str, index: u32) -> u64 {
        let mut buf = Vec::with_capacity(queue.len() + 4);
        buf.extend_from_slice(queue.as_bytes());
        buf.extend_from_slice(&index.to_le_bytes());
        Self::point(&buf)
    }

    fn point(bytes: &[u8]) -> u64 {
        LittleEndian::read_u64(&blake3::hash(bytes).as_bytes()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn ring(queues: usize, weight: u32) -> HashRing {
        let mut ring = HashRing::new();
        for i in 1..=queues {
            ring.bind(&format!("q{i:03}"), weight);
        }
        ring
    }

    #[test]
    fn empty_ring_routes_nowhere() {
        assert_eq!(HashRing::new().route("1"), None);
    }

    #[test]
    fn same_key_same_queue() {
        let ring = ring(5, 10);
        for key in 0..100 {
            let key = key.to_string();
            assert_eq!(ring.route(&key), ring.route(&key));
        }
    }

    #[test]
    fn keys_spread_over_every_queue() {
        let ring = ring(4, 10);
        let mut hits: HashMap<&str, usize> = HashMap::new();
        for key in 0..10_000 {
            *hits.entry(ring.route(&key.to_string()).unwrap()).or_default() += 1;
        }
        assert_eq!(hits.len(), 4);
        for (queue, count) in hits {
            assert!(count > 500, "{queue} only got {count} of 10000 keys");
        }
    }

    #[test]
    fn unbind_moves_only_that_queues_keys() {
        let mut ring = ring(3, 10);
        let before: Vec<_> = (0..300)
            .map(|k| ring.route(&k.to_string()).unwrap().to_owned())
            .collect();
        ring.unbind("q002");
        assert_eq!(ring.queues().len(), 2);
        for (k, old) in before.iter().enumerate() {
            let new = ring.route(&k.to_string()).unwrap();
            assert_ne!(new, "q002");
            if old != "q002" {
                assert_eq!(new, old);
            }
        }
    }
}
