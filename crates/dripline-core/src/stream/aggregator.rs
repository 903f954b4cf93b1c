//! Event Aggregator - Bounded, newest-first buffer of live delivery events

use super::connection::{ConnectionState, EventConsumer};
use chrono::{DateTime, Utc};
use dripline_common::types::{EventPayload, EventType, LiveEvent};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Running per-event-type counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    /// Total events ingested since the last clear (survives eviction)
    pub total: u64,
    /// Count per event type
    pub counts: HashMap<EventType, u64>,
}

/// Aggregates inbound delivery events into a bounded, paginated view.
///
/// One mutex guards the buffer and the counters together so counts are never
/// observed inconsistent with the buffer contents.
pub struct EventAggregator {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Newest-first; front is the most recent event
    buffer: VecDeque<LiveEvent>,
    counts: HashMap<EventType, u64>,
    total: u64,
    next_id: u64,
    capacity: usize,
}

impl EventAggregator {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY)),
                counts: HashMap::new(),
                total: 0,
                next_id: 0,
                capacity,
            }),
        }
    }

    /// Ingest a single delivery event
    pub fn ingest(&self, payload: EventPayload) {
        self.lock().push(payload);
    }

    /// Ingest a batch of delivery events, preserving order.
    ///
    /// Equivalent to calling [`ingest`](Self::ingest) for each element.
    pub fn ingest_batch<I>(&self, payloads: I)
    where
        I: IntoIterator<Item = EventPayload>,
    {
        let mut inner = self.lock();
        for payload in payloads {
            inner.push(payload);
        }
    }

    /// A contiguous slice of the newest-first buffer.
    ///
    /// Pages are 1-based; an out-of-range page returns an empty slice.
    pub fn page(&self, page: usize, page_size: usize) -> Vec<LiveEvent> {
        if page == 0 || page_size == 0 {
            return Vec::new();
        }

        let inner = self.lock();
        inner
            .buffer
            .iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .cloned()
            .collect()
    }

    /// Snapshot of the running counters
    pub fn stats(&self) -> EventStats {
        let inner = self.lock();
        EventStats {
            total: inner.total,
            counts: inner.counts.clone(),
        }
    }

    /// Empty the buffer and reset all counters.
    ///
    /// Ids stay monotonic across clears.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.buffer.clear();
        inner.counts.clear();
        inner.total = 0;
    }

    /// Number of events currently held in the buffer
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn push(&mut self, payload: EventPayload) {
        let event_type = payload.event.unwrap_or_else(EventType::unknown);

        self.next_id += 1;
        let event = LiveEvent {
            id: self.next_id,
            email: payload.email.unwrap_or_default(),
            event: event_type.clone(),
            subject: payload.subject,
            date: resolve_date(payload.date.as_deref()),
        };

        self.buffer.push_front(event);
        if self.buffer.len() > self.capacity {
            self.buffer.pop_back();
        }

        *self.counts.entry(event_type).or_insert(0) += 1;
        self.total += 1;
    }
}

/// RFC 3339 wire date, falling back to the ingestion instant
fn resolve_date(date: Option<&str>) -> DateTime<Utc> {
    date.and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

impl EventConsumer for EventAggregator {
    fn on_event(&self, event: EventPayload) {
        self.ingest(event);
    }

    fn on_state_change(&self, state: ConnectionState) {
        // Stale aggregates must not be shown as live
        if state != ConnectionState::Open {
            self.clear();
        }
    }
}
