//! Coalesces routed events into one store mutation per short window.
//!
//! Every [`BatchQueue::enqueue`] restarts a single flush timer, so a burst
//! arriving faster than [`FLUSH_DELAY`] lands in the store in one
//! [`BatchSink::apply`] call, in enqueue order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::router::RoutedEvent;
use crate::store::{ConversationStore, TargetState};
use crate::target::ConversationTarget;

/// Quiet period after the last enqueue before a flush.
pub const FLUSH_DELAY: Duration = Duration::from_millis(16);

/// Receiver of flushed batches.
pub trait BatchSink: Send + Sync {
    fn apply(&self, events: Vec<RoutedEvent>);
}

/// Writes batches into a [`ConversationStore`].
pub struct StoreSink {
    store: Arc<dyn ConversationStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }
}

impl BatchSink for StoreSink {
    fn apply(&self, events: Vec<RoutedEvent>) {
        for ev in &events {
            // Any delivery implies the network has a server tab, unless the
            // user closed it.
            let server = ConversationTarget::server(&ev.target.network);
            if self.store.target_state(&server) == TargetState::Unknown {
                self.store.find_or_create(&server);
            }
            let tab = self.store.find_or_create(&ev.target);
            self.store.append(tab, ev);
            if !ev.local_echo {
                self.store.mark_activity(tab, ev.highlight);
            }
        }
    }
}

#[derive(Default)]
struct Pending {
    events: Vec<RoutedEvent>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    sink: Arc<dyn BatchSink>,
    delay: Duration,
    pending: Mutex<Pending>,
    /// Serializes flushes so batches reach the sink in order.
    flushing: Mutex<()>,
}

impl Inner {
    fn flush(&self) {
        let _order = self.flushing.lock();
        let events = {
            let mut p = self.pending.lock();
            p.timer = None;
            std::mem::take(&mut p.events)
        };
        if events.is_empty() {
            return;
        }
        tracing::trace!(count = events.len(), "Flushing batch");
        self.sink.apply(events);
    }
}

pub struct BatchQueue {
    inner: Arc<Inner>,
}

impl BatchQueue {
    pub fn new(sink: Arc<dyn BatchSink>) -> Self {
        Self::with_delay(sink, FLUSH_DELAY)
    }

    pub fn with_delay(sink: Arc<dyn BatchSink>, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                delay,
                pending: Mutex::new(Pending::default()),
                flushing: Mutex::new(()),
            }),
        }
    }

    /// Append and restart the flush timer. Must be called inside a tokio
    /// runtime.
    pub fn enqueue(&self, event: RoutedEvent) {
        let mut p = self.inner.pending.lock();
        p.events.push(event);
        if let Some(old) = p.timer.take() {
            old.abort();
        }
        let inner = Arc::clone(&self.inner);
        let delay = self.inner.delay;
        p.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush();
        }));
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().events.len()
    }

    /// Apply everything queued now. A no-op when nothing is queued.
    pub fn flush(&self) {
        if let Some(t) = self.inner.pending.lock().timer.take() {
            t.abort();
        }
        self.inner.flush();
    }

    /// Cancel the timer and flush synchronously.
    pub fn shutdown(&self) {
        self.flush();
    }
}

impl Drop for BatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DeliveryKind;
    use crate::store::MemoryStore;
    use crate::target::NetworkId;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl BatchSink for Recorder {
        fn apply(&self, events: Vec<RoutedEvent>) {
            self.batches
                .lock()
                .push(events.into_iter().map(|e| e.text).collect());
        }
    }

    fn event(text: &str) -> RoutedEvent {
        let net = NetworkId::from("libera");
        RoutedEvent::new(
            ConversationTarget::channel(&net, "#rust"),
            DeliveryKind::Message,
            Some("bob".into()),
            text.into(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_flush() {
        let rec = Arc::new(Recorder::default());
        let queue = BatchQueue::new(rec.clone());
        for i in 0..5 {
            queue.enqueue(event(&format!("m{i}")));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rec.batches.lock().is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let batches = rec.batches.lock().clone();
        assert_eq!(batches, vec![vec!["m0", "m1", "m2", "m3", "m4"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_is_idempotent() {
        let rec = Arc::new(Recorder::default());
        let queue = BatchQueue::new(rec.clone());
        queue.flush();
        queue.enqueue(event("a"));
        queue.flush();
        queue.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn drop_flushes_pending() {
        let rec = Arc::new(Recorder::default());
        {
            let queue = BatchQueue::new(rec.clone());
            queue.enqueue(event("last"));
        }
        assert_eq!(rec.batches.lock().clone(), vec![vec!["last"]]);
    }

    #[tokio::test]
    async fn store_sink_creates_tabs_and_marks_activity() {
        let store = Arc::new(MemoryStore::new());
        let queue = BatchQueue::new(Arc::new(StoreSink::new(store.clone())));
        let mut ev = event("hello");
        ev.highlight = true;
        queue.enqueue(ev);
        queue.shutdown();
        let net = NetworkId::from("libera");
        let chan = ConversationTarget::channel(&net, "#rust");
        assert_eq!(
            store.target_state(&ConversationTarget::server(&net)),
            TargetState::Open
        );
        let tab = store.tab(&chan).unwrap();
        assert_eq!(tab.lines.len(), 1);
        assert_eq!(tab.unread, 1);
        assert!(tab.highlighted);
    }
}
