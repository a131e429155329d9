use std::sync::Mutex;

/// User or upper-layer callback installed on a component.
pub type Callback<T> = Box<dyn FnMut(T) + Send + 'static>;

/// Mutex-guarded callback slot.
///
/// Invocations through one slot are serialized; a callback must not call
/// back into its own setter.
pub(crate) struct CallbackSlot<T> {
    inner: Mutex<Option<Callback<T>>>,
}

impl<T> Default for CallbackSlot<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<T> CallbackSlot<T> {
    pub(crate) fn set(&self, callback: Option<Callback<T>>) {
        *self.inner.lock().unwrap() = callback;
    }

    pub(crate) fn is_set(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Invokes the installed callback, if any. Returns whether one ran.
    pub(crate) fn call(&self, value: T) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if let Some(callback) = guard.as_mut() {
            callback(value);
            true
        } else {
            false
        }
    }
}

/// Callback slot with a one-slot missed-event buffer.
///
/// Triggering without an installed callback latches the event; installing a
/// non-null callback while the slot is latched dispatches immediately and
/// clears the latch.
pub(crate) struct EventSlot {
    inner: Mutex<(Option<Callback<()>>, bool)>,
}

impl Default for EventSlot {
    fn default() -> Self {
        Self {
            inner: Mutex::new((None, false)),
        }
    }
}

impl EventSlot {
    pub(crate) fn set(&self, callback: Option<Callback<()>>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.0 = callback;
        if inner.1 {
            if let Some(callback) = inner.0.as_mut() {
                inner.1 = false;
                callback(());
            }
        }
    }

    pub(crate) fn trigger(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.0.as_mut() {
            Some(callback) => callback(()),
            None => inner.1 = true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callback_slot() {
        let slot: CallbackSlot<u32> = CallbackSlot::default();
        assert!(!slot.call(1));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        slot.set(Some(Box::new(move |v| {
            h.fetch_add(v as usize, Ordering::SeqCst);
        })));
        assert!(slot.call(2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        slot.set(None);
        assert!(!slot.call(3));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_slot_replays_missed_event() {
        let slot = EventSlot::default();
        slot.trigger();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        slot.set(Some(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(hits.load(Ordering::SeqCst), 1, "latched event replayed");

        slot.trigger();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_slot_latches_once() {
        let slot = EventSlot::default();
        slot.trigger();
        slot.trigger();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        slot.set(Some(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
