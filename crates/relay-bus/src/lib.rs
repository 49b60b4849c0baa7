//! In-process Event Bus (C8): fans `ask.created`/`answer.recorded`/
//! `job.state` notifications from the Job Manager out to the Ask/Answer
//! HTTP Bridge's long-poll waiters and SSE clients (spec.md §4.8).
//!
//! Generalized from this codebase's broadcast-based event bus: same
//! `tokio::sync::broadcast` channel, publish/drop statistics, and filtered
//! subscriptions, retargeted from `AgentEvent` to [`relay_core::RelayEvent`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use relay_core::RelayEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    dropped_events: AtomicU64,
}

/// Broadcast-based event bus distributing [`RelayEvent`]s to every
/// subscriber, with publish/drop statistics.
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
    stats: Arc<StatsInner>,
}

impl EventBus {
    /// Create a new event bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the given channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Subscribe to every event published from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Subscribe, yielding only events whose `job_id()` matches `job_id`.
    /// Used by the SSE endpoint (`GET /jobs/{id}/events`, spec.md §4.5) and
    /// by the long-poll endpoint waiting on a single Ask.
    #[must_use]
    pub fn subscribe_job(&self, job_id: relay_core::JobId) -> FilteredSubscription {
        FilteredSubscription::new(
            self.subscribe(),
            Box::new(move |ev: &RelayEvent| *ev.job_id() == job_id),
        )
    }

    /// Publish an event to all current subscribers.
    ///
    /// If nobody is listening the event is silently dropped and counted in
    /// [`EventBusStats::dropped_events`] — the durable [`relay_core::Event`]
    /// audit row, written separately by the Job Manager, is the permanent
    /// record; this bus only carries live notifications.
    pub fn publish(&self, event: RelayEvent) {
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event).is_err() {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of subscribers currently listening.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of current bus statistics.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            active_subscribers: self.tx.receiver_count(),
            dropped_events: self.stats.dropped_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle for receiving events from an [`EventBus`].
pub struct EventSubscription {
    rx: broadcast::Receiver<RelayEvent>,
    stats: Arc<StatsInner>,
}

impl EventSubscription {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` when the bus is closed. A lagged subscriber's missed
    /// events are counted in [`EventBusStats::dropped_events`] and skipped
    /// transparently rather than surfaced as an error.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        match self.rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                self.rx.try_recv().ok()
            }
            Err(_) => None,
        }
    }
}

/// Wraps an [`EventSubscription`] with a predicate so only matching events
/// are yielded — used for per-job SSE fan-out.
pub struct FilteredSubscription {
    inner: EventSubscription,
    filter: Box<dyn Fn(&RelayEvent) -> bool + Send + Sync>,
}

impl FilteredSubscription {
    /// Wrap a subscription with an arbitrary predicate.
    pub fn new(sub: EventSubscription, filter: Box<dyn Fn(&RelayEvent) -> bool + Send + Sync>) -> Self {
        Self { inner: sub, filter }
    }

    /// Receive the next matching event, waiting asynchronously.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.inner.recv().await {
                Some(ev) if (self.filter)(&ev) => return Some(ev),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Try to receive the next matching event without blocking.
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.inner.try_recv() {
                Some(ev) if (self.filter)(&ev) => return Some(ev),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

/// Snapshot of event bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusStats {
    /// Total number of events published to the bus.
    pub total_published: u64,
    /// Number of subscribers currently listening.
    pub active_subscribers: usize,
    /// Events lost to no-subscriber drops or subscriber lag.
    pub dropped_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Ask, AskStatus, AskType, JobId};

    fn sample_ask(job_id: &str) -> Ask {
        Ask {
            ask_id: relay_core::AskId::new("ask_1"),
            job_id: JobId::new(job_id),
            step_id: "s1".to_string(),
            ask_type: AskType::Clarification,
            prompt: "p".to_string(),
            context_envelope: serde_json::json!({}),
            context_hash: "h".to_string(),
            constraints: None,
            role_id: None,
            meta: None,
            created_at: 0,
            status: AskStatus::Pending,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(RelayEvent::AskCreated {
            ask: Box::new(sample_ask("job_1")),
        });
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.event_type(), "ask.created");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_counts_as_dropped() {
        let bus = EventBus::new();
        bus.publish(RelayEvent::AskCreated {
            ask: Box::new(sample_ask("job_1")),
        });
        assert_eq!(bus.stats().dropped_events, 1);
    }

    #[tokio::test]
    async fn job_filtered_subscription_ignores_other_jobs() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_job(JobId::new("job_1"));
        bus.publish(RelayEvent::AskCreated {
            ask: Box::new(sample_ask("job_2")),
        });
        bus.publish(RelayEvent::AskCreated {
            ask: Box::new(sample_ask("job_1")),
        });
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.job_id(), &JobId::new("job_1"));
    }

    #[tokio::test]
    async fn stats_track_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.stats().active_subscribers, 1);
    }
}
