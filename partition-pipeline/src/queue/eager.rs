use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{Delivery, MessageQueue};
use crate::kafka::types::RawRecord;

/// Dispatches every record as soon as it arrives, in arrival order.
///
/// Completion is bookkeeping only. A record whose handling ended without being consumed
/// is scheduled for redelivery after the retry window while later records keep flowing.
pub struct EagerQueue {
    retry_window: Duration,
    ready: VecDeque<Delivery>,
    outstanding: BTreeMap<i64, Delivery>,
    redeliveries: BTreeMap<(Instant, i64), Delivery>,
}

impl EagerQueue {
    pub fn new(retry_window: Duration) -> Self {
        Self {
            retry_window,
            ready: VecDeque::new(),
            outstanding: BTreeMap::new(),
            redeliveries: BTreeMap::new(),
        }
    }
}

impl MessageQueue for EagerQueue {
    fn add(&mut self, record: RawRecord, _now: Instant) {
        self.ready.push_back(Delivery {
            record: Arc::new(record),
            attempt: 1,
        });
    }

    fn next_ready(&mut self, now: Instant) -> Option<Delivery> {
        let delivery = match self.ready.pop_front() {
            Some(delivery) => delivery,
            None => {
                let (&(due, _), _) = self.redeliveries.first_key_value()?;
                if due > now {
                    return None;
                }
                let (_, mut delivery) = self.redeliveries.pop_first()?;
                delivery.attempt += 1;
                delivery
            }
        };

        self.outstanding.insert(delivery.offset(), delivery.clone());
        Some(delivery)
    }

    fn consumed(&mut self, offset: i64) {
        self.outstanding.remove(&offset);
    }

    fn processing_ended(&mut self, offset: i64, now: Instant) {
        if let Some(delivery) = self.outstanding.remove(&offset) {
            self.redeliveries
                .insert((now + self.retry_window, offset), delivery);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.redeliveries
            .first_key_value()
            .map(|(&(due, _), _)| due)
    }

    fn len(&self) -> usize {
        self.ready.len() + self.outstanding.len() + self.redeliveries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: i64) -> RawRecord {
        RawRecord::new("events", 0, offset, None, Some(b"{}".to_vec()))
    }

    #[test]
    fn test_dispatches_in_arrival_order_without_waiting() {
        let now = Instant::now();
        let mut queue = EagerQueue::new(Duration::from_secs(1));

        for offset in 10..13 {
            queue.add(record(offset), now);
        }

        let offsets: Vec<i64> = std::iter::from_fn(|| queue.next_ready(now))
            .map(|d| d.offset())
            .collect();
        assert_eq!(offsets, vec![10, 11, 12]);
        assert_eq!(queue.len(), 3);

        queue.consumed(11);
        queue.consumed(10);
        queue.consumed(12);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failed_record_is_redelivered_after_window() {
        let now = Instant::now();
        let window = Duration::from_secs(2);
        let mut queue = EagerQueue::new(window);

        queue.add(record(0), now);
        queue.add(record(1), now);

        let first = queue.next_ready(now).unwrap();
        queue.processing_ended(first.offset(), now);

        // later records are not held back
        assert_eq!(queue.next_ready(now).map(|d| d.offset()), Some(1));
        queue.consumed(1);

        assert!(queue.next_ready(now).is_none());
        assert_eq!(queue.next_deadline(), Some(now + window));

        let retry = queue.next_ready(now + window).unwrap();
        assert_eq!((retry.offset(), retry.attempt), (0, 2));
        queue.consumed(0);
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
    }
}
