//! Last known value of every port, plus push subscriptions.
//!
//! The store is written by the poller, by push ingress and by running
//! transitions, and read by anyone. It is a pair of [`DashMap`]s, so readers
//! never block writers of other ports, and values are returned as clones.
//!
//! [`PortValue::Busy`] never overwrites a stored value: a busy device says
//! nothing about the port's state.
//!
//! ```rust
//! use rs_megad::{PortId, PortStateStore, PortValue};
//!
//! let store = PortStateStore::new();
//! assert!(store.set(PortId::from(7), PortValue::OnOff(true)));
//! assert!(!store.set(PortId::from(7), PortValue::Busy));
//! assert_eq!(store.get(&PortId::from(7)), Some(PortValue::OnOff(true)));
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::port::{PortId, PortValue};

/// Callback invoked with a pushed value.
pub type PushCallback = Arc<dyn Fn(&PortId, &PortValue) + Send + Sync>;

/// Handle returned by [`PortStateStore::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Concurrent port state map.
pub struct PortStateStore {
    values: DashMap<PortId, PortValue>,
    subscribers: DashMap<PortId, Vec<(SubscriptionId, PushCallback)>>,
    next_subscription: AtomicU64,
    last_push: Mutex<Option<Instant>>,
}

impl Default for PortStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PortStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            last_push: Mutex::new(None),
        }
    }

    /// Stores `value` for `port`. Returns false (and stores nothing) for `Busy`.
    pub fn set(&self, port: PortId, value: PortValue) -> bool {
        if value.is_busy() {
            trace!(%port, "ignoring busy value");
            return false;
        }
        self.values.insert(port, value);
        true
    }

    /// Last known value of `port`.
    pub fn get(&self, port: &PortId) -> Option<PortValue> {
        self.values.get(port).map(|v| v.value().clone())
    }

    /// Merges one field into the composite value at `port`.
    ///
    /// A non-composite value already stored there is replaced.
    pub fn merge_field(&self, port: PortId, key: &str, value: String) {
        let mut entry = self
            .values
            .entry(port)
            .or_insert_with(|| PortValue::Composite(BTreeMap::new()));
        match entry.value_mut() {
            PortValue::Composite(map) => {
                map.insert(key.to_string(), value);
            }
            other => {
                let mut map = BTreeMap::new();
                map.insert(key.to_string(), value);
                *other = PortValue::Composite(map);
            }
        }
    }

    /// Copy of every stored value, ordered by port.
    pub fn snapshot(&self) -> BTreeMap<PortId, PortValue> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of ports with a value.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when no port has a value.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Forgets every value. Subscriptions stay.
    pub fn clear(&self) {
        self.values.clear();
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Registers `callback` for pushes to `port`.
    pub fn subscribe(
        &self,
        port: PortId,
        callback: impl Fn(&PortId, &PortValue) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        debug!(%port, subscription = id.0, "subscribed");
        self.subscribers
            .entry(port)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sid, _)| *sid != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Calls every callback registered for `port`. Returns how many ran.
    ///
    /// Callbacks run on the caller's task, outside any lock.
    pub fn notify(&self, port: &PortId, value: &PortValue) -> usize {
        let callbacks: Vec<PushCallback> = match self.subscribers.get(port) {
            Some(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            callback(port, value);
        }
        callbacks.len()
    }

    // ========================================================================
    // Push bookkeeping
    // ========================================================================

    /// Records that a push just arrived.
    pub fn record_push(&self) {
        *self.last_push.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// When the last push arrived.
    pub fn last_push(&self) -> Option<Instant> {
        *self.last_push.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if a push arrived within `window`.
    pub fn pushed_within(&self, window: Duration) -> bool {
        self.last_push().is_some_and(|t| t.elapsed() <= window)
    }
}

impl core::fmt::Debug for PortStateStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PortStateStore")
            .field("ports", &self.values.len())
            .field("subscribed_ports", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn busy_never_stored() {
        let store = PortStateStore::new();
        assert!(!store.set(PortId::from(1), PortValue::Busy));
        assert!(store.is_empty());

        store.set(PortId::from(1), PortValue::Numeric(20.0));
        store.set(PortId::from(1), PortValue::Busy);
        assert_eq!(store.get(&PortId::from(1)), Some(PortValue::Numeric(20.0)));
    }

    #[test]
    fn last_write_wins() {
        let store = PortStateStore::new();
        store.set(PortId::from(2), PortValue::OnOff(true));
        store.set(PortId::from(2), PortValue::OnOff(false));
        assert_eq!(store.get(&PortId::from(2)), Some(PortValue::OnOff(false)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn merge_builds_composite() {
        let store = PortStateStore::new();
        let port = PortId::from(30);
        store.merge_field(port.clone(), "htu21d_humidity", "40".into());
        store.merge_field(port.clone(), "htu21d_temperature", "21.5".into());

        let value = store.get(&port).unwrap();
        assert_eq!(value.field("htu21d_humidity"), Some("40"));
        assert_eq!(value.field("htu21d_temperature"), Some("21.5"));

        store.set(port.clone(), PortValue::Numeric(1.0));
        store.merge_field(port.clone(), "k", "v".into());
        assert_eq!(store.get(&port).unwrap().field("k"), Some("v"));
    }

    #[test]
    fn snapshot_is_ordered_copy() {
        let store = PortStateStore::new();
        store.set(PortId::from(9), PortValue::OnOff(true));
        store.set(PortId::from(2), PortValue::OnOff(false));
        let snap = store.snapshot();
        let keys: Vec<_> = snap.keys().cloned().collect();
        assert_eq!(keys, vec![PortId::from(2), PortId::from(9)]);

        store.clear();
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn subscribe_notify_unsubscribe() {
        let store = PortStateStore::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let id = store.subscribe(PortId::from(5), move |port, value| {
            assert_eq!(port, &PortId::from(5));
            assert_eq!(value, &PortValue::OnOff(true));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(store.notify(&PortId::from(5), &PortValue::OnOff(true)), 1);
        assert_eq!(store.notify(&PortId::from(6), &PortValue::OnOff(true)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        assert_eq!(store.notify(&PortId::from(5), &PortValue::OnOff(true)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn push_window() {
        let store = PortStateStore::new();
        assert!(!store.pushed_within(Duration::from_secs(60)));

        store.record_push();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.pushed_within(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!store.pushed_within(Duration::from_secs(60)));
    }
}
