//! Observable containers the session is built from.
//!
//! [`ObservableProperty`] holds a single value and notifies subscribers
//! only when the stored value actually changes; this is what makes
//! replayed push messages safe to apply. [`ObservableEvent`] broadcasts
//! values without retaining one. Listener lists are snapshotted before
//! firing, so a callback may subscribe or unsubscribe without invalidating
//! the iteration in progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Token returned by `subscribe`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lock a mutex, recovering the data from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    listeners: Vec<(SubscriptionId, Listener<T>)>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    fn add(&mut self, listener: Listener<T>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.listeners.push((id, listener));
        id
    }

    fn remove(&mut self, id: SubscriptionId) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    fn snapshot(&self) -> Vec<Listener<T>> {
        self.listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

/// A single observable value.
pub struct ObservableProperty<T> {
    value: Mutex<T>,
    registry: Mutex<Registry<T>>,
}

impl<T: Clone + PartialEq> ObservableProperty<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: Mutex::new(initial),
            registry: Mutex::new(Registry::new()),
        }
    }

    /// Current value, cloned out.
    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }

    /// Replace the value. Listeners fire only if it changed; returns
    /// whether it did.
    pub fn set(&self, value: T) -> bool {
        {
            let mut guard = lock(&self.value);
            if *guard == value {
                return false;
            }
            *guard = value.clone();
        }
        self.notify(&value);
        true
    }

    /// Mutate the value in place. The closure reports whether anything
    /// changed; listeners fire only when it did.
    pub fn update(&self, mutate: impl FnOnce(&mut T) -> bool) -> bool {
        let snapshot = {
            let mut guard = lock(&self.value);
            if mutate(&mut guard) {
                Some(guard.clone())
            } else {
                None
            }
        };
        match snapshot {
            Some(value) => {
                self.notify(&value);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        lock(&self.registry).add(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.registry).remove(id);
    }

    fn notify(&self, value: &T) {
        // snapshot so listeners may (un)subscribe from within a callback
        let listeners = lock(&self.registry).snapshot();
        for listener in listeners {
            listener(value);
        }
    }
}

impl<T: Clone + PartialEq + Default> Default for ObservableProperty<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A broadcast channel with no retained value.
pub struct ObservableEvent<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> ObservableEvent<T> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        lock(&self.registry).add(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.registry).remove(id);
    }

    pub fn emit(&self, value: &T) {
        let listeners = lock(&self.registry).snapshot();
        for listener in listeners {
            listener(value);
        }
    }
}

impl<T> Default for ObservableEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_set_fires_only_on_change() {
        let prop = ObservableProperty::new(0u32);
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        prop.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(prop.set(5));
        assert!(!prop.set(5));
        assert!(prop.set(6));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(prop.get(), 6);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let prop = ObservableProperty::new(0u32);
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let id = prop.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        prop.set(1);
        prop.unsubscribe(id);
        prop.set(2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself_while_firing() {
        let event = Arc::new(ObservableEvent::<u32>::new());
        let fired = Arc::new(AtomicU32::new(0));

        let event_clone = event.clone();
        let fired_clone = fired.clone();
        let id_slot = Arc::new(Mutex::new(None::<SubscriptionId>));
        let id_slot_clone = id_slot.clone();
        let id = event.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *lock(&id_slot_clone) {
                event_clone.unsubscribe(id);
            }
        });
        *lock(&id_slot) = Some(id);

        event.emit(&1);
        event.emit(&2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_reports_change() {
        let prop = ObservableProperty::new(vec![1u32]);
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        prop.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(prop.update(|v| {
            v.push(2);
            true
        }));
        assert!(!prop.update(|_| false));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(prop.get(), vec![1, 2]);
    }
}
