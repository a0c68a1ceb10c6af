//! Bounded multicast event bus.
//!
//! One [`EventBus`] carries one event kind. Every subscriber gets its own
//! bounded queue (capacity [`EVENT_QUEUE_CAPACITY`]), so a slow subscriber
//! saturates only itself. `fire` is non-blocking: fan-out runs under a short
//! lock so all subscribers observe the same fire order, and the result code
//! tells the caller whether anything was dropped. At-most-once, no replay,
//! no retry.

use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::Stream;
use tracing::warn;

/// Pending-item capacity of each subscriber queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Outcome of one `fire` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EmitResult {
    /// Delivered to every subscriber with queue capacity (trivially true
    /// with zero subscribers).
    Delivered,
    /// At least one subscriber queue was full; the event was dropped for it
    /// but still delivered to the rest.
    Saturated,
    /// The bus is closed; the event went nowhere.
    Terminated,
}

impl EmitResult {
    /// True when nothing was dropped.
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Saturated => "saturated",
            Self::Terminated => "terminated",
        }
    }
}

type Selector<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct Subscriber<E> {
    tx: mpsc::Sender<E>,
    selector: Option<Selector<E>>,
}

/// Typed multicast channel for one event kind.
pub struct EventBus<E> {
    name: &'static str,
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber<E>>>,
    closed: AtomicBool,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Bus with the default per-subscriber capacity. `name` labels logs and
    /// the drop counter.
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, EVENT_QUEUE_CAPACITY)
    }

    /// Bus with an explicit per-subscriber capacity.
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Multicast one event to the subscribers active right now.
    pub fn fire(&self, event: E) -> EmitResult {
        if self.closed.load(Ordering::Acquire) {
            return EmitResult::Terminated;
        }

        let mut saturated = false;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if let Some(selector) = &sub.selector {
                if !selector(&event) {
                    return true;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    saturated = true;
                    true
                }
                // Receiver dropped: prune the subscription.
                Err(TrySendError::Closed(_)) => false,
            }
        });
        drop(subscribers);

        if saturated {
            metrics::counter!("patchbay_event_drops_total", "bus" => self.name).increment(1);
            warn!(bus = self.name, "event dropped: subscriber queue saturated");
            EmitResult::Saturated
        } else {
            EmitResult::Delivered
        }
    }

    /// Subscribe to every event fired from now on.
    pub fn subscribe(&self) -> EventStream<E> {
        self.subscribe_inner(None)
    }

    /// Subscribe with a delivery-time selector; non-matching events are
    /// skipped for this subscriber without counting as drops.
    pub fn subscribe_where(
        &self,
        selector: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> EventStream<E> {
        self.subscribe_inner(Some(Arc::new(selector)))
    }

    fn subscribe_inner(&self, selector: Option<Selector<E>>) -> EventStream<E> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.closed.load(Ordering::Acquire) {
            // Closed bus: hand back an already-ended stream.
            drop(tx);
        } else {
            self.subscribers.lock().push(Subscriber { tx, selector });
        }
        EventStream { rx }
    }

    /// Close the bus: later fires return [`EmitResult::Terminated`] and live
    /// subscriber streams end once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.lock().clear();
    }

    /// Subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Bus label.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A subscriber's live view of one bus: a multi-value [`Stream`], with
/// [`EventStream::into_first`] as the single-value view.
pub struct EventStream<E> {
    rx: mpsc::Receiver<E>,
}

impl<E> EventStream<E> {
    /// Next event, or `None` once the bus has closed and the queue drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by tests and shutdown paths.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Consume the stream, yielding only its first event.
    pub async fn into_first(mut self) -> Option<E> {
        self.rx.recv().await
    }
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_subscriber_fire_is_trivial_success() {
        let bus: EventBus<u32> = EventBus::new("test");
        assert_eq!(bus.fire(1), EmitResult::Delivered);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn events_arrive_in_fire_order() {
        let bus: EventBus<u32> = EventBus::new("test");
        let mut stream = bus.subscribe();

        for n in 0..10 {
            assert_eq!(bus.fire(n), EmitResult::Delivered);
        }
        for n in 0..10 {
            assert_eq!(stream.recv().await, Some(n));
        }
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let bus: EventBus<u32> = EventBus::new("test");
        let _ = bus.fire(1);
        let mut stream = bus.subscribe();
        assert_eq!(stream.try_recv(), None);

        let _ = bus.fire(2);
        assert_eq!(stream.recv().await, Some(2));
    }

    #[tokio::test]
    async fn saturation_returns_non_success_without_blocking() {
        let bus: EventBus<u32> = EventBus::new("test");
        let mut stream = bus.subscribe();

        for n in 0..EVENT_QUEUE_CAPACITY as u32 {
            assert_eq!(bus.fire(n), EmitResult::Delivered);
        }
        // Queue full, nothing consumed: overflow is reported, not buffered.
        assert_eq!(bus.fire(999), EmitResult::Saturated);

        // The first capacity-worth of events is still intact and ordered.
        assert_eq!(stream.recv().await, Some(0));
    }

    #[tokio::test]
    async fn saturated_subscriber_does_not_starve_others() {
        let bus: EventBus<u32> = EventBus::with_capacity("test", 1);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        assert_eq!(bus.fire(1), EmitResult::Delivered);
        assert_eq!(fast.recv().await, Some(1));

        // `slow` never consumed; its queue (capacity 1) is now full.
        assert_eq!(bus.fire(2), EmitResult::Saturated);
        assert_eq!(fast.recv().await, Some(2));
        assert_eq!(slow.recv().await, Some(1));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus: EventBus<u32> = EventBus::new("test");
        let stream = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(stream);
        assert_eq!(bus.fire(1), EmitResult::Delivered);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_terminates_fires_and_ends_streams() {
        let bus: EventBus<u32> = EventBus::new("test");
        let mut stream = bus.subscribe();
        let _ = bus.fire(1);

        bus.close();
        assert_eq!(bus.fire(2), EmitResult::Terminated);

        // Queued events drain, then the stream ends.
        assert_eq!(stream.recv().await, Some(1));
        assert_eq!(stream.recv().await, None);

        let mut late = bus.subscribe();
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn selector_filters_without_drop_accounting() {
        let bus: EventBus<u32> = EventBus::new("test");
        let mut evens = bus.subscribe_where(|n| n % 2 == 0);
        let mut all = bus.subscribe();

        for n in 1..=4 {
            assert_eq!(bus.fire(n), EmitResult::Delivered);
        }
        assert_eq!(evens.recv().await, Some(2));
        assert_eq!(evens.recv().await, Some(4));
        assert_eq!(all.recv().await, Some(1));
    }

    #[tokio::test]
    async fn into_first_is_the_single_value_view() {
        let bus: EventBus<u32> = EventBus::new("test");
        let stream = bus.subscribe();
        let _ = bus.fire(7);
        let _ = bus.fire(8);
        assert_eq!(stream.into_first().await, Some(7));
    }

    #[tokio::test]
    async fn concurrent_fires_reach_all_subscribers_in_one_order() {
        let bus = Arc::new(EventBus::<u32>::with_capacity("test", 512));
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let bus_a = Arc::clone(&bus);
        let bus_b = Arc::clone(&bus);
        let a = tokio::spawn(async move {
            for n in 0..100 {
                assert_eq!(bus_a.fire(n), EmitResult::Delivered);
                tokio::task::yield_now().await;
            }
        });
        let b = tokio::spawn(async move {
            for n in 100..200 {
                assert_eq!(bus_b.fire(n), EmitResult::Delivered);
                tokio::task::yield_now().await;
            }
        });
        a.await.unwrap();
        b.await.unwrap();

        let mut seq_first = Vec::new();
        let mut seq_second = Vec::new();
        for _ in 0..200 {
            seq_first.push(tokio::time::timeout(Duration::from_secs(1), first.recv()).await.unwrap().unwrap());
            seq_second.push(tokio::time::timeout(Duration::from_secs(1), second.recv()).await.unwrap().unwrap());
        }
        assert_eq!(seq_first, seq_second);
    }
}
