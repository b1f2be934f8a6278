use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{Delivery, MessageQueue};
use crate::kafka::types::RawRecord;

struct InFlight {
    delivery: Delivery,
    /// The record is handed out again once this passes without it being consumed
    redeliver_at: Instant,
}

/// Keeps a single record in flight per partition.
///
/// Later records wait in an offset-ordered backlog. A record whose handling ends without
/// being consumed, or that stays in flight past the retry window, is redelivered: the
/// partition is blocked on that offset until it is consumed.
pub struct PriorityQueue {
    retry_window: Duration,
    in_flight: Option<InFlight>,
    backlog: BTreeMap<i64, RawRecord>,
}

impl PriorityQueue {
    pub fn new(retry_window: Duration) -> Self {
        Self {
            retry_window,
            in_flight: None,
            backlog: BTreeMap::new(),
        }
    }

    pub fn in_flight_offset(&self) -> Option<i64> {
        self.in_flight.as_ref().map(|f| f.delivery.offset())
    }
}

impl MessageQueue for PriorityQueue {
    fn add(&mut self, record: RawRecord, _now: Instant) {
        if self.in_flight_offset() == Some(record.offset) {
            return;
        }
        self.backlog.entry(record.offset).or_insert(record);
    }

    fn next_ready(&mut self, now: Instant) -> Option<Delivery> {
        if let Some(in_flight) = &mut self.in_flight {
            if in_flight.redeliver_at > now {
                return None;
            }
            in_flight.delivery.attempt += 1;
            in_flight.redeliver_at = now + self.retry_window;
            return Some(in_flight.delivery.clone());
        }

        let (_, record) = self.backlog.pop_first()?;
        let delivery = Delivery {
            record: Arc::new(record),
            attempt: 1,
        };
        self.in_flight = Some(InFlight {
            delivery: delivery.clone(),
            redeliver_at: now + self.retry_window,
        });
        Some(delivery)
    }

    fn consumed(&mut self, offset: i64) {
        if self.in_flight_offset() == Some(offset) {
            self.in_flight = None;
        }
    }

    fn processing_ended(&mut self, offset: i64, now: Instant) {
        if let Some(in_flight) = &mut self.in_flight {
            if in_flight.delivery.offset() == offset {
                in_flight.redeliver_at = now + self.retry_window;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.redeliver_at)
    }

    fn len(&self) -> usize {
        self.backlog.len() + usize::from(self.in_flight.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: i64) -> RawRecord {
        RawRecord::new("events", 0, offset, None, Some(b"{}".to_vec()))
    }

    #[test]
    fn test_backlog_is_ordered_by_offset() {
        let now = Instant::now();
        let mut queue = PriorityQueue::new(Duration::from_secs(1));

        queue.add(record(5), now);
        queue.add(record(3), now);
        queue.add(record(4), now);

        let mut order = Vec::new();
        while let Some(delivery) = queue.next_ready(now) {
            order.push(delivery.offset());
            queue.consumed(delivery.offset());
        }
        assert_eq!(order, vec![3, 4, 5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_retries_target_the_same_record() {
        let now = Instant::now();
        let window = Duration::from_millis(500);
        let mut queue = PriorityQueue::new(window);

        queue.add(record(0), now);
        queue.add(record(1), now);
        assert_eq!(queue.next_ready(now).map(|d| d.attempt), Some(1));

        let mut at = now;
        for attempt in 2..=4 {
            queue.processing_ended(0, at);
            assert!(queue.next_ready(at).is_none());
            assert_eq!(queue.next_deadline(), Some(at + window));

            at += window;
            let delivery = queue.next_ready(at).unwrap();
            assert_eq!((delivery.offset(), delivery.attempt), (0, attempt));
        }

        queue.consumed(0);
        assert_eq!(queue.next_ready(at).map(|d| d.offset()), Some(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stuck_record_is_redelivered_after_window() {
        let now = Instant::now();
        let window = Duration::from_secs(1);
        let mut queue = PriorityQueue::new(window);

        queue.add(record(7), now);
        queue.add(record(8), now);
        assert_eq!(queue.next_ready(now).map(|d| d.offset()), Some(7));

        // no completion reported at all
        let retry = queue.next_ready(now + window).unwrap();
        assert_eq!((retry.offset(), retry.attempt), (7, 2));
    }

    #[test]
    fn test_duplicate_adds_are_ignored() {
        let now = Instant::now();
        let mut queue = PriorityQueue::new(Duration::from_secs(1));

        queue.add(record(1), now);
        queue.next_ready(now);
        queue.add(record(1), now);
        queue.add(record(2), now);
        queue.add(record(2), now);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.in_flight_offset(), Some(1));
    }

    #[test]
    fn test_stale_reports_are_ignored() {
        let now = Instant::now();
        let mut queue = PriorityQueue::new(Duration::from_secs(1));

        queue.add(record(1), now);
        queue.next_ready(now);

        queue.consumed(0);
        queue.processing_ended(9, now);
        assert_eq!(queue.in_flight_offset(), Some(1));
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
    }
}
