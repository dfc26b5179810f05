//! Single-callback slots for progress and log notifications.
//!
//! A slot holds at most one callback. Installing replaces whatever was there
//! and hands back a [`Subscription`]; dropping the subscription uninstalls
//! the callback, unless a newer one has replaced it in the meantime.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Callback receiving progress percentages.
pub type ProgressFn = dyn Fn(f64) + Send + Sync;

/// Callback receiving engine log lines.
pub type LoggerFn = dyn Fn(&str) + Send + Sync;

pub type ProgressSlot = CallbackSlot<ProgressFn>;
pub type LoggerSlot = CallbackSlot<LoggerFn>;

struct SlotState<F: ?Sized> {
    generation: u64,
    callback: Option<Arc<F>>,
}

/// Holds the current callback of one kind.
pub struct CallbackSlot<F: ?Sized> {
    state: Arc<Mutex<SlotState<F>>>,
}

impl<F: ?Sized + Send + Sync + 'static> CallbackSlot<F> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState {
                generation: 0,
                callback: None,
            })),
        }
    }

    /// Install `callback`, replacing the current one.
    pub fn install(&self, callback: Arc<F>) -> Subscription {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.callback = Some(callback);
            state.generation
        };

        let weak: Weak<Mutex<SlotState<F>>> = Arc::downgrade(&self.state);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    let mut state = state.lock();
                    if state.generation == generation {
                        state.callback = None;
                    }
                }
            })),
        }
    }

    /// The installed callback, cloned out so it can be invoked without
    /// holding the slot lock.
    pub fn current(&self) -> Option<Arc<F>> {
        self.state.lock().callback.clone()
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.callback = None;
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> Clone for CallbackSlot<F> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

/// Keeps a callback installed while alive.
#[must_use = "dropping a Subscription uninstalls its callback"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Keep the callback installed until it is replaced or the slot cleared.
    pub fn detach(mut self) {
        self.release = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<ProgressFn>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = Arc::clone(&hits);
        let cb: Arc<ProgressFn> = Arc::new(move |_| {
            cb_hits.fetch_add(1, Ordering::SeqCst);
        });
        (hits, cb)
    }

    #[test]
    fn test_last_installed_wins() {
        let slot = ProgressSlot::new();
        let (first_hits, first) = counter();
        let (second_hits, second) = counter();

        let _a = slot.install(first);
        let _b = slot.install(second);

        if let Some(cb) = slot.current() {
            cb(10.0);
        }
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_uninstalls() {
        let slot = ProgressSlot::new();
        let (_, cb) = counter();
        let sub = slot.install(cb);
        assert!(slot.is_installed());
        drop(sub);
        assert!(!slot.is_installed());
    }

    #[test]
    fn test_stale_subscription_keeps_newer_callback() {
        let slot = ProgressSlot::new();
        let (_, first) = counter();
        let (_, second) = counter();

        let stale = slot.install(first);
        let _current = slot.install(second);
        drop(stale);
        assert!(slot.is_installed());
    }

    #[test]
    fn test_detach_keeps_callback() {
        let slot = LoggerSlot::new();
        slot.install(Arc::new(|_line: &str| {})).detach();
        assert!(slot.is_installed());
        slot.clear();
        assert!(!slot.is_installed());
    }

    #[test]
    fn test_subscription_outliving_slot() {
        let slot = ProgressSlot::new();
        let (_, cb) = counter();
        let sub = slot.install(cb);
        drop(slot);
        drop(sub);
    }
}
