//! Destination partition selection for produced messages.
//!
//! Keyed messages hash with Kafka's murmur2 so that any producer, in any process or
//! language using the Java client's default partitioner, sends a key to the same partition.
//! Keyless messages rotate through every partition of the topic, available or not, so the
//! sequence only depends on the partition count.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

pub trait Partitioner: Send + Sync {
    fn partition(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        partition_count: i32,
    ) -> i32;
}

#[derive(Default)]
pub struct DefaultPartitioner {
    counters: DashMap<String, AtomicU32>,
}

impl DefaultPartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_round_robin(&self, topic: &str) -> u32 {
        if let Some(counter) = self.counters.get(topic) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }

        self.counters
            .entry(topic.to_string())
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl Partitioner for DefaultPartitioner {
    fn partition(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        _value: &[u8],
        partition_count: i32,
    ) -> i32 {
        if partition_count <= 0 {
            return 0;
        }

        let hash = match key {
            Some(key) => to_positive(murmur2(key)),
            None => self.next_round_robin(topic) & 0x7fff_ffff,
        };

        (hash % partition_count.unsigned_abs()) as i32
    }
}

fn to_positive(hash: u32) -> u32 {
    hash & 0x7fff_ffff
}

/// 32-bit murmur2 with the seed used by Kafka clients
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // Reference values from the Java client's murmur2 tests
    #[test_case(b"21", -973932308; "short key")]
    #[test_case(b"foobar", -790332482; "six bytes")]
    #[test_case(b"a-little-bit-long-string", -985981536; "aligned")]
    #[test_case(b"a-little-bit-longer-string", -1486304829; "two byte tail")]
    #[test_case(b"lkjh234lh9fiuh90y23oiuhsafujhadof229phr9h19h89h8", -58897971; "long key")]
    fn test_murmur2_matches_kafka(key: &[u8], expected: i32) {
        assert_eq!(murmur2(key) as i32, expected);
    }

    #[test]
    fn test_keyless_round_robin() {
        let partitioner = DefaultPartitioner::new();

        let partitions: Vec<i32> = (0..12)
            .map(|_| partitioner.partition("events", None, b"", 5))
            .collect();

        assert_eq!(partitions, vec![0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1]);
    }

    #[test]
    fn test_round_robin_counters_are_per_topic() {
        let partitioner = DefaultPartitioner::new();

        assert_eq!(partitioner.partition("events", None, b"", 3), 0);
        assert_eq!(partitioner.partition("events", None, b"", 3), 1);
        assert_eq!(partitioner.partition("alerts", None, b"", 3), 0);
        assert_eq!(partitioner.partition("events", None, b"", 3), 2);
    }

    #[test]
    fn test_keyed_partition_is_stable() {
        let key = "311dd383-5430-412d-acd6-8b2c9ba3c226".as_bytes();

        let first = DefaultPartitioner::new().partition("events", Some(key), b"{}", 5);
        assert_eq!(first, 0);

        // A fresh partitioner stands in for another producer or a restart
        let partitioner = DefaultPartitioner::new();
        for _ in 0..10 {
            assert_eq!(partitioner.partition("events", Some(key), b"{}", 5), first);
        }
    }

    #[test]
    fn test_keyed_partitions_stay_in_range() {
        let partitioner = DefaultPartitioner::new();
        for i in 0..1000 {
            let key = format!("key-{i}");
            let partition = partitioner.partition("events", Some(key.as_bytes()), b"", 16);
            assert!((0..16).contains(&partition));
        }
    }
}
