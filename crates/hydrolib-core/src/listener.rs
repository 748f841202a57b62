//! Measurement listener dispatch.
//!
//! Each driver holds a [`ListenerSet`] parameterized over its measurement
//! type. Streaming drivers notify from the reader task the moment a record
//! is classified; request/response drivers return the measurement to the
//! caller and notify separately.
//!
//! Delivery is gated by a [`CollectingGate`]: a shared armed/collecting
//! flag owned by the broader system. Drivers consult it, never own it --
//! data read while the platform is not collecting is suppressed at this
//! level.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Observer of measurements of type `T`.
///
/// For streaming instruments `on_measurement` runs on the reader task and
/// must not block significantly.
pub trait Listener<T>: Send + Sync {
    /// Called once per delivered measurement.
    fn on_measurement(&self, data: &T);
}

/// Adapter implementing [`Listener`] for a plain closure.
pub struct FnListener<F>(pub F);

impl<T, F> Listener<T> for FnListener<F>
where
    F: Fn(&T) + Send + Sync,
{
    fn on_measurement(&self, data: &T) {
        (self.0)(data)
    }
}

/// Shared armed/collecting flag, owned by the broker and consulted here.
#[derive(Clone)]
pub struct CollectingGate {
    armed: Arc<AtomicBool>,
}

impl CollectingGate {
    /// Create a gate with the given initial setting.
    pub fn new(collecting: bool) -> Self {
        Self {
            armed: Arc::new(AtomicBool::new(collecting)),
        }
    }

    /// Change the collecting setting. All clones observe the change.
    pub fn set_collecting(&self, collecting: bool) {
        self.armed.store(collecting, Ordering::SeqCst);
    }

    /// Whether measurements should currently be delivered.
    pub fn is_collecting(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl Default for CollectingGate {
    /// A standalone gate that is always collecting. Builders use this when
    /// the application does not supply one.
    fn default() -> Self {
        Self::new(true)
    }
}

/// Ordered set of listeners for one driver instance.
///
/// Listeners are delivered to in registration order, synchronously on the
/// notifying task.
pub struct ListenerSet<T> {
    inner: Arc<Mutex<Vec<Arc<dyn Listener<T>>>>>,
}

impl<T> Clone for ListenerSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> ListenerSet<T> {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Listener<T>>>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a listener. Listeners are never removed; a driver instance
    /// and its observers share a lifetime.
    pub fn add(&self, listener: Arc<dyn Listener<T>>) {
        self.lock().push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver `data` to every listener in registration order, unless the
    /// gate says the system is not collecting.
    ///
    /// The lock is released before the callbacks run so a listener may
    /// register further listeners.
    pub fn notify(&self, data: &T, gate: &CollectingGate) {
        if !gate.is_collecting() {
            return;
        }
        let listeners: Vec<Arc<dyn Listener<T>>> = self.lock().clone();
        for listener in listeners {
            listener.on_measurement(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_in_registration_order() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = Arc::clone(&order);
            set.add(Arc::new(FnListener(move |_: &u32| {
                order.lock().unwrap().push(id);
            })));
        }

        set.notify(&7, &CollectingGate::default());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn gate_suppresses_delivery() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        set.add(Arc::new(FnListener(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let gate = CollectingGate::new(false);
        set.notify(&1, &gate);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        gate.set_collecting(true);
        set.notify(&1, &gate);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gate_clones_share_flag() {
        let gate = CollectingGate::new(false);
        let clone = gate.clone();
        clone.set_collecting(true);
        assert!(gate.is_collecting());
    }

    #[test]
    fn listener_set_len() {
        let set: ListenerSet<u32> = ListenerSet::new();
        assert!(set.is_empty());
        set.add(Arc::new(FnListener(|_: &u32| {})));
        assert_eq!(set.len(), 1);
    }
}
