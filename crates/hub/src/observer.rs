//! Listener registry used by the connection manager, session coordinator and
//! usage aggregator to push state changes to the dashboard.
//!
//! `subscribe` hands back a [`Subscription`]. Once `unsubscribe` (or drop)
//! returns, the listener is never invoked again: removal waits for any call
//! of that listener that is running on another thread. A listener may
//! unsubscribe itself from inside its own callback.

use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    active: AtomicBool,
    call_lock: ReentrantMutex<()>,
    callback: Callback<T>,
}

struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Arc<Entry<T>>>>,
}

pub struct Observers<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            call_lock: ReentrantMutex::new(()),
            callback: Arc::new(callback),
        });
        self.registry.entries.lock().push(entry);

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.remove(id);
                }
            })),
        }
    }

    /// Deliver `value` to every live listener, in subscription order.
    pub fn notify(&self, value: &T) {
        // Snapshot so listeners can (un)subscribe while being notified.
        let entries: Vec<Arc<Entry<T>>> = self.registry.entries.lock().clone();
        for entry in entries {
            let _guard = entry.call_lock.lock();
            if entry.active.load(Ordering::Acquire) {
                (entry.callback)(value);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.registry.entries.lock().len()
    }
}

impl<T> Registry<T> {
    fn remove(&self, id: u64) {
        let removed = {
            let mut entries = self.entries.lock();
            let pos = entries.iter().position(|e| e.id == id);
            pos.map(|i| entries.remove(i))
        };
        if let Some(entry) = removed {
            entry.active.store(false, Ordering::Release);
            // Wait out a call in flight on another thread.
            drop(entry.call_lock.lock());
        }
    }
}

/// Handle returned by [`Observers::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
