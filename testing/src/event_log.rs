//! In-memory event source.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use projector_core::event::{Event, EventError};
use projector_core::{BoxFuture, EventNotifications, EventSource, EventSourceError, RecordedEvent};
use serde::Serialize;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

/// Ordered in-memory event log implementing [`EventSource`].
///
/// Appends assign the next `global_sequence` and notify subscribers, just like
/// a commit on a real store. [`insert_at`](Self::insert_at) places an event at
/// an explicit sequence so tests can open and later fill gaps.
///
/// # Example
///
/// ```
/// use projector_testing::InMemoryEventLog;
/// use projector_core::EventSource;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryEventLog::new();
/// log.append("plan-1", "PlanCreated", vec![1, 2, 3]);
///
/// assert_eq!(log.head().await?, 1);
/// assert!(log.next_after(0).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<RecordedEvent>>,
    head: watch::Sender<u64>,
    failing_reads: AtomicUsize,
}

impl InMemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            events: RwLock::new(Vec::new()),
            head,
            failing_reads: AtomicUsize::new(0),
        }
    }

    /// Append an event at the next sequence and return that sequence.
    pub fn append(
        &self,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> u64 {
        let mut events = self.events.write().unwrap();
        let sequence = events.last().map_or(1, |e| e.global_sequence + 1);
        events.push(RecordedEvent::new(
            aggregate_id.into(),
            sequence,
            event_type.into(),
            payload,
            Utc::now(),
        ));
        drop(events);

        self.notify(sequence);
        sequence
    }

    /// Encode and append a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the event cannot be serialized.
    pub fn append_event<E: Event + Serialize>(
        &self,
        aggregate_id: impl Into<String>,
        event: &E,
    ) -> Result<u64, EventError> {
        let payload = event.to_bytes()?;
        Ok(self.append(aggregate_id, event.event_type(), payload))
    }

    /// Place an event at an explicit sequence.
    ///
    /// # Panics
    ///
    /// Panics if the sequence is 0 or already taken.
    pub fn insert_at(
        &self,
        sequence: u64,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) {
        assert!(sequence > 0, "global sequences start at 1");
        let mut events = self.events.write().unwrap();
        let index = match events.binary_search_by_key(&sequence, |e| e.global_sequence) {
            Ok(_) => unreachable!("sequence {sequence} already taken"),
            Err(index) => index,
        };
        events.insert(
            index,
            RecordedEvent::new(
                aggregate_id.into(),
                sequence,
                event_type.into(),
                payload,
                Utc::now(),
            ),
        );
        drop(events);

        self.notify(sequence);
    }

    /// Make the next `count` reads fail with a database error.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Number of events in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    /// Check if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every event, in order.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().unwrap().clone()
    }

    fn notify(&self, sequence: u64) {
        // Always wakes subscribers, even when filling a gap below the head.
        self.head.send_modify(|head| *head = (*head).max(sequence));
    }

    fn check_read(&self) -> Result<(), EventSourceError> {
        let failed = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(EventSourceError::Database("injected read failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for InMemoryEventLog {
    fn head(&self) -> BoxFuture<'_, Result<u64, EventSourceError>> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self
                .events
                .read()
                .unwrap()
                .last()
                .map_or(0, |e| e.global_sequence))
        })
    }

    fn next_after(
        &self,
        sequence: u64,
    ) -> BoxFuture<'_, Result<Option<RecordedEvent>, EventSourceError>> {
        Box::pin(async move {
            self.check_read()?;
            let events = self.events.read().unwrap();
            let index = events.partition_point(|e| e.global_sequence <= sequence);
            Ok(events.get(index).cloned())
        })
    }

    fn replay_from(
        &self,
        sequence: u64,
    ) -> BoxStream<'_, Result<RecordedEvent, EventSourceError>> {
        if let Err(e) = self.check_read() {
            return stream::once(async move { Err(e) }).boxed();
        }

        let events = self.events.read().unwrap();
        let start = events.partition_point(|e| e.global_sequence < sequence);
        let snapshot: Vec<_> = events[start..].iter().cloned().map(Ok).collect();
        stream::iter(snapshot).boxed()
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<EventNotifications, EventSourceError>> {
        Box::pin(async move { Ok(self.head.subscribe()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn append_assigns_contiguous_sequences() {
        let log = InMemoryEventLog::new();
        assert_eq!(log.append("a", "Tick", Vec::new()), 1);
        assert_eq!(log.append("a", "Tick", Vec::new()), 2);
        assert_eq!(log.head().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn next_after_skips_to_first_higher_sequence() {
        let log = InMemoryEventLog::new();
        log.insert_at(1, "a", "Tick", Vec::new());
        log.insert_at(3, "a", "Tick", Vec::new());

        let next = log.next_after(1).await.unwrap().unwrap();
        assert_eq!(next.global_sequence, 3);
        assert!(log.next_after(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_from_is_inclusive() {
        let log = InMemoryEventLog::new();
        for _ in 0..4 {
            log.append("a", "Tick", Vec::new());
        }

        let sequences: Vec<u64> = log
            .replay_from(2)
            .map(|e| e.unwrap().global_sequence)
            .collect()
            .await;
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn subscribers_see_gap_fills() {
        let log = InMemoryEventLog::new();
        log.insert_at(2, "a", "Tick", Vec::new());
        let mut notifications = log.subscribe().await.unwrap();
        notifications.borrow_and_update();

        log.insert_at(1, "a", "Tick", Vec::new());
        assert!(notifications.has_changed().unwrap());
        assert_eq!(*notifications.borrow(), 2);
    }

    #[tokio::test]
    async fn injected_read_failures_are_consumed() {
        let log = InMemoryEventLog::new();
        log.fail_next_reads(1);

        assert!(log.head().await.is_err());
        assert_eq!(log.head().await.unwrap(), 0);
    }

    proptest! {
        #[test]
        fn replay_is_ordered_whatever_the_insert_order(
            sequences in proptest::sample::subsequence((1..=40u64).collect::<Vec<_>>(), 0..=40)
                .prop_shuffle()
        ) {
            let log = InMemoryEventLog::new();
            for sequence in &sequences {
                log.insert_at(*sequence, "a", "Tick", Vec::new());
            }

            let replayed: Vec<u64> = tokio_test::block_on(
                log.replay_from(1).map(|e| e.unwrap().global_sequence).collect(),
            );
            let mut expected = sequences.clone();
            expected.sort_unstable();
            prop_assert_eq!(replayed, expected);
        }
    }
}
