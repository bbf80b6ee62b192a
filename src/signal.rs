//! Event sinks with multi-listener fan-out.
//!
//! Each socket/channel event kind owns one [`Signal`]. Registration hands
//! back a [`Listener`] guard that detaches the slot when dropped; call
//! [`Listener::forget`] to keep a registration alive for the lifetime of
//! the signal instead.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    slots: Mutex<Vec<(u64, Slot<T>)>>,
    next_id: AtomicU64,
}

/// A single event kind with any number of listeners.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                slots: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener. It fires for every emission until the returned
    /// guard is dropped or the signal itself goes away.
    pub fn connect(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Listener {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.slots.lock().push((id, Arc::new(f)));
        Listener {
            target: Some(Arc::downgrade(&self.inner) as Weak<dyn Detach + Send + Sync>),
            id,
        }
    }

    /// Invoke every registered listener, in registration order.
    ///
    /// Slots are snapshotted before invocation so listeners may register
    /// or detach listeners on this same signal without deadlocking.
    pub(crate) fn emit(&self, value: &T) {
        let slots: Vec<Slot<T>> = self
            .inner
            .slots
            .lock()
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in slots {
            slot(value);
        }
    }

    /// Drop every registered listener.
    pub(crate) fn clear(&self) {
        self.inner.slots.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

trait Detach {
    fn detach_slot(&self, id: u64);
}

impl<T> Detach for SignalInner<T> {
    fn detach_slot(&self, id: u64) {
        self.slots.lock().retain(|(slot_id, _)| *slot_id != id);
    }
}

/// Guard for one listener registration; detaches the listener on drop.
#[must_use = "dropping the listener immediately detaches it; call forget() to keep it"]
pub struct Listener {
    target: Option<Weak<dyn Detach + Send + Sync>>,
    id: u64,
}

impl Listener {
    /// Detach the listener now.
    pub fn detach(self) {
        drop(self);
    }

    /// Keep the listener registered for the lifetime of its signal.
    pub fn forget(mut self) {
        self.target = None;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(target) = self.target.take().and_then(|weak| weak.upgrade()) {
            target.detach_slot(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn listeners_fire_in_registration_order() {
        let signal: Signal<u32> = Signal::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_a = Arc::clone(&log);
        let _a = signal.connect(move |v| log_a.lock().push(("a", *v)));
        let log_b = Arc::clone(&log);
        let _b = signal.connect(move |v| log_b.lock().push(("b", *v)));

        signal.emit(&7);
        assert_eq!(*log.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn dropping_the_guard_detaches() {
        let signal: Signal<()> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let guard = signal.connect(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.emit(&());
        drop(guard);
        signal.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.len(), 0);
    }

    #[test]
    fn forget_keeps_the_listener() {
        let signal: Signal<()> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        signal
            .connect(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .forget();

        signal.emit(&());
        signal.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_detaches_everything() {
        let signal: Signal<u8> = Signal::new();
        signal.connect(|_| {}).forget();
        signal.connect(|_| {}).forget();
        assert_eq!(signal.len(), 2);

        signal.clear();
        assert_eq!(signal.len(), 0);
    }

    #[test]
    fn guard_outliving_signal_is_harmless() {
        let signal: Signal<u8> = Signal::new();
        let guard = signal.connect(|_| {});
        drop(signal);
        drop(guard);
    }

    #[test]
    fn listener_may_register_during_emit() {
        // Re-entrant registration must not deadlock.
        let signal: Signal<()> = Signal::new();
        let inner = signal.clone_for_test();
        signal
            .connect(move |_| {
                inner.connect(|_| {}).forget();
            })
            .forget();
        signal.emit(&());
        assert_eq!(signal.len(), 2);
    }
}

#[cfg(test)]
impl<T> Signal<T> {
    fn clone_for_test(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
