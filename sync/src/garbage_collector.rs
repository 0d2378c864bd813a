use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::{query_cache::WeakQueryCache, util::spawn_local, Instant, QueryKey};

/// Removes a key's entry once it has been unobserved for `gc_time`.
pub(crate) type Evict = fn(&crate::query_cache::QueryCache, &QueryKey) -> bool;

pub(crate) struct GarbageCollector {
    key: QueryKey,
    cache: WeakQueryCache,
    evict: Evict,
    gc_time: Cell<Option<Duration>>,
    gc_at: Cell<Option<Instant>>,
    handle: RefCell<Option<JoinHandle<()>>>,
    disposed: Cell<bool>,
}

impl GarbageCollector {
    pub(crate) fn new(key: QueryKey, cache: WeakQueryCache, evict: Evict) -> Rc<Self> {
        Rc::new(Self {
            key,
            cache,
            evict,
            gc_time: Cell::new(None),
            gc_at: Cell::new(None),
            handle: RefCell::new(None),
            disposed: Cell::new(false),
        })
    }

    /// Keep max gc time.
    pub(crate) fn update_gc_time(&self, gc_time: Duration) {
        match self.gc_time.get() {
            Some(current) if gc_time <= current => {}
            _ => self.gc_time.set(Some(gc_time)),
        }
    }

    pub(crate) fn gc_at(&self) -> Option<Instant> {
        self.gc_at.get()
    }

    /// Schedules eviction `gc_time` from now, unless already scheduled.
    pub(crate) fn enable_gc(self: &Rc<Self>) {
        if self.disposed.get() || self.handle.borrow().is_some() {
            return;
        }

        let gc_time = self.gc_time.get().unwrap_or(DEFAULT_GC_TIME);
        if gc_time >= NEVER_EVICT {
            return;
        }
        let gc_at = Instant::now() + gc_time;

        let collector = Rc::downgrade(self);
        let handle = spawn_local(async move {
            tokio::time::sleep(gc_time).await;
            evict(collector);
        });

        self.gc_at.set(Some(gc_at));
        *self.handle.borrow_mut() = Some(handle);
    }

    pub(crate) fn disable_gc(&self) {
        if let Some(handle) = self.handle.borrow_mut().take() {
            handle.abort();
        }
        self.gc_at.set(None);
    }

    /// The entry left the cache. Its timer must never evict a successor
    /// registered under the same key.
    pub(crate) fn dispose(&self) {
        self.disposed.set(true);
        self.disable_gc();
    }
}

fn evict(collector: Weak<GarbageCollector>) {
    let Some(collector) = collector.upgrade() else {
        return;
    };
    // Detach our own handle so a later unsubscribe can reschedule.
    drop(collector.handle.borrow_mut().take());
    collector.gc_at.set(None);

    if let Some(cache) = collector.cache.upgrade() {
        if (collector.evict)(&cache, &collector.key) {
            log::debug!("Evicted query {} after gc time", collector.key);
        }
    }
}

const DEFAULT_GC_TIME: Duration = Duration::from_secs(60 * 5);

// Anything this long is treated as "keep forever" rather than a timer.
const NEVER_EVICT: Duration = Duration::from_secs(60 * 60 * 24 * 365);
