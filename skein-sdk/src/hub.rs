//! Publish/subscribe primitive shared by every component.
//!
//! A [`Hub`] fans a value out to registered callbacks. Subscribing returns a
//! [`Subscription`]; dropping it (or calling [`Subscription::unsubscribe`])
//! removes the callback. Unsubscribing twice is a no-op.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Callback registry for values of type `T`.
pub struct Hub<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T> Clone for Hub<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> Default for Hub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Hub<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().entries.len()
    }
}

impl<T: 'static> Hub<T> {
    /// Register a callback. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut slots = self.slots.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.entries.push((id, Arc::new(cb)));
            id
        };
        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.slots);
        Subscription {
            id,
            cancel: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    slots.lock().entries.retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    /// Deliver `value` to every subscriber.
    ///
    /// The subscriber list is snapshotted before dispatch, so callbacks may
    /// subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .slots
            .lock()
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(value);
        }
    }
}

/// Handle to a registered callback.
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_reaches_subscribers() {
        let hub: Hub<u32> = Hub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let _sub = hub.subscribe(move |v| {
            s.fetch_add(*v as usize, Ordering::SeqCst);
        });
        hub.publish(&3);
        hub.publish(&4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let hub: Hub<()> = Hub::new();
        let mut sub = hub.subscribe(|_| {});
        assert_eq!(hub.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn drop_unsubscribes() {
        let hub: Hub<()> = Hub::new();
        {
            let _sub = hub.subscribe(|_| {});
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn subscription_outliving_hub() {
        let hub: Hub<()> = Hub::new();
        let mut sub = hub.subscribe(|_| {});
        drop(hub);
        sub.unsubscribe();
    }

    #[test]
    fn reentrant_subscribe_during_publish() {
        let hub: Hub<u8> = Hub::new();
        let inner = hub.clone();
        let held = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&held);
        let _sub = hub.subscribe(move |_| {
            h.lock().push(inner.subscribe(|_| {}));
        });
        hub.publish(&1);
        assert_eq!(hub.subscriber_count(), 2);
    }
}
