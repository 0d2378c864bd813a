use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use futures::FutureExt;
use slotmap::{new_key_type, SlotMap};

use crate::{
    garbage_collector::GarbageCollector,
    query_cache::{QueryCache, WeakQueryCache},
    query_executor::{execute_with_retry, FetchContext, Fetcher, SharedFetch},
    util::{spawn_local, time_until_stale},
    BusyIndicator, CacheEntry, Error, QueryData, QueryKey, QueryState, QueryValue,
};

new_key_type! {
    pub(crate) struct ObserverKey;
}

pub(crate) type Listener<V> = Rc<dyn Fn(&QueryState<V>)>;

/// One cache entry: state, the key's single in-flight request, subscribers
/// and eviction timer.
#[derive(Clone)]
pub(crate) struct Query<V> {
    pub(crate) key: QueryKey,

    // State
    state: Rc<RefCell<QueryState<V>>>,
    version: Rc<Cell<u64>>,
    stale_time: Rc<Cell<Option<Duration>>>,

    // Single flight
    current_request: Rc<RefCell<Option<SharedFetch<V>>>>,
    // Invalidated while a request was in flight.
    refetch_after_settle: Rc<Cell<bool>>,
    last_fetch: Rc<RefCell<Option<(Fetcher<V>, FetchContext)>>>,

    // Synchronization
    observers: Rc<RefCell<SlotMap<ObserverKey, Listener<V>>>>,
    garbage_collector: Rc<GarbageCollector>,
}

impl<V: QueryValue> Query<V> {
    pub(crate) fn new(key: QueryKey, cache: WeakQueryCache) -> Self {
        Query {
            garbage_collector: GarbageCollector::new(key.clone(), cache, evict_idle::<V>),
            key,
            state: Rc::new(RefCell::new(QueryState::Created)),
            version: Rc::new(Cell::new(0)),
            stale_time: Rc::new(Cell::new(None)),
            current_request: Rc::new(RefCell::new(None)),
            refetch_after_settle: Rc::new(Cell::new(false)),
            last_fetch: Rc::new(RefCell::new(None)),
            observers: Rc::new(RefCell::new(SlotMap::with_key())),
        }
    }

    // State
    pub(crate) fn get_state(&self) -> QueryState<V> {
        self.state.borrow().clone()
    }

    pub(crate) fn with_state<T>(&self, func: impl FnOnce(&QueryState<V>) -> T) -> T {
        func(&self.state.borrow())
    }

    /// Replaces the state and notifies subscribers.
    pub(crate) fn set_state(&self, state: QueryState<V>) {
        *self.state.borrow_mut() = state;
        self.notify();
    }

    pub(crate) fn update_state(&self, update_fn: impl FnOnce(QueryState<V>) -> QueryState<V>) {
        let current = std::mem::take(&mut *self.state.borrow_mut());
        self.set_state(update_fn(current));
    }

    /// If update returns Ok(_) the state will be updated and subscribers will be notified.
    /// If update returns Err(_) the state will not be updated and subscribers will not be notified.
    /// Err(_) should always contain the previous state.
    pub(crate) fn maybe_map_state(
        &self,
        update_fn: impl FnOnce(QueryState<V>) -> Result<QueryState<V>, QueryState<V>>,
    ) -> bool {
        let current = std::mem::take(&mut *self.state.borrow_mut());
        match update_fn(current) {
            Ok(new_state) => {
                self.set_state(new_state);
                true
            }
            Err(old_state) => {
                *self.state.borrow_mut() = old_state;
                false
            }
        }
    }

    /// Stores freshly obtained data, bumping the data version.
    pub(crate) fn set_data(&self, data: QueryData<V>) {
        self.version.set(next_version());
        self.set_state(QueryState::Loaded(data));
    }

    /// Replaces data from outside a fetch. A fetch in flight keeps running
    /// and its result overwrites this value when it settles.
    ///
    /// Returns false if `updater` bailed out with `None`.
    pub(crate) fn update_data(&self, updater: impl FnOnce(Option<&V>) -> Option<V>) -> bool {
        self.maybe_map_state(|state| {
            let Some(result) = updater(state.data()) else {
                return Err(state);
            };
            let data = QueryData::now(result);
            self.version.set(next_version());
            match state {
                QueryState::Loading | QueryState::Fetching(_) => Ok(QueryState::Fetching(data)),
                _ => Ok(QueryState::Loaded(data)),
            }
        })
    }

    /// Mutates data in place. Returns false when there is no data.
    pub(crate) fn mutate_data(&self, updater: impl FnOnce(&mut V)) -> bool {
        let updated = {
            let mut state = self.state.borrow_mut();
            match state.data_mut() {
                Some(data) => {
                    updater(data);
                    self.version.set(next_version());
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify();
        }
        updated
    }

    /// Changes whenever the data changes. Unique across queries, zero
    /// before any data was stored.
    pub(crate) fn data_version(&self) -> u64 {
        self.version.get()
    }

    /// Whether both handles point at the same cache entry.
    pub(crate) fn same_entry(&self, other: &Query<V>) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    fn notify(&self) {
        // Listeners may re-enter the query, so never call them under a borrow.
        let listeners: Vec<Listener<V>> = self.observers.borrow().values().cloned().collect();
        if listeners.is_empty() {
            return;
        }
        let state = self.get_state();
        for listener in listeners {
            listener(&state);
        }
    }

    /// Marks loaded data as invalid. Invalid queries with subscribers are
    /// refetched in the background.
    ///
    /// A request already in flight may predate the change that caused the
    /// invalidation, so its result is stored as invalid and refetched.
    pub(crate) fn mark_invalid(&self) -> bool {
        if self.is_fetching() {
            log::debug!("Query {} invalidated while fetching", self.key);
            self.refetch_after_settle.set(true);
            return true;
        }

        let updated = self.maybe_map_state(|state| {
            if let QueryState::Loaded(data) = state {
                Ok(QueryState::Invalid(data))
            } else {
                Err(state)
            }
        });

        if updated {
            self.refetch_if_observed();
        }
        updated
    }

    fn refetch_if_observed(&self) {
        if self.observer_count() == 0 || self.is_fetching() {
            return;
        }
        let last_fetch = self.last_fetch.borrow().clone();
        if let Some((fetcher, ctx)) = last_fetch {
            log::debug!("Refetching invalidated query {}", self.key);
            let _ = self.fetch(fetcher, ctx);
        }
    }

    // Subscription
    pub(crate) fn subscribe(&self, listener: Listener<V>) -> ObserverKey {
        let key = self.observers.borrow_mut().insert(listener);
        self.garbage_collector.disable_gc();
        key
    }

    pub(crate) fn unsubscribe(&self, observer: ObserverKey) {
        let now_empty = {
            let mut observers = self.observers.borrow_mut();
            observers.remove(observer);
            observers.is_empty()
        };
        if now_empty {
            self.garbage_collector.enable_gc();
        }
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    pub(crate) fn update_gc_time(&self, gc_time: Duration) {
        self.garbage_collector.update_gc_time(gc_time);
    }

    /// Schedules eviction if nobody is subscribed.
    pub(crate) fn enable_gc_if_unobserved(&self) {
        if self.observer_count() == 0 {
            self.garbage_collector.enable_gc();
        }
    }

    /// No subscribers and no request in flight.
    pub(crate) fn is_idle(&self) -> bool {
        self.observer_count() == 0 && !self.is_fetching()
    }

    // Freshness

    /// Whether cached data is older than `stale_time`, or invalidated, or failed.
    /// A query without data is not stale, it is empty.
    pub(crate) fn is_stale(&self, stale_time: Duration) -> bool {
        self.with_state(|state| match state {
            QueryState::Created | QueryState::Loading => false,
            QueryState::Invalid(_) | QueryState::Failed { .. } => true,
            QueryState::Fetching(data) | QueryState::Loaded(data) => {
                time_until_stale(data.updated_at, stale_time).is_zero()
            }
        })
    }

    pub(crate) fn has_data(&self) -> bool {
        self.with_state(|state| state.data().is_some())
    }

    /// Fresh data, if any.
    pub(crate) fn fresh_data(&self, stale_time: Duration) -> Option<V> {
        self.with_state(|state| match state {
            QueryState::Loaded(data) | QueryState::Fetching(data)
                if !time_until_stale(data.updated_at, stale_time).is_zero() =>
            {
                Some(data.data.clone())
            }
            _ => None,
        })
    }

    // Execution

    pub(crate) fn is_fetching(&self) -> bool {
        self.current_request.borrow().is_some()
    }

    pub(crate) fn current_request(&self) -> Option<SharedFetch<V>> {
        self.current_request.borrow().clone()
    }

    /// Starts a fetch, or joins the one already in flight.
    ///
    /// The request is driven by a background task, so dropping every awaiting
    /// caller does not cancel it.
    pub(crate) fn fetch(&self, fetcher: Fetcher<V>, ctx: FetchContext) -> SharedFetch<V> {
        if let Some(current) = self.current_request() {
            return current;
        }

        *self.last_fetch.borrow_mut() = Some((fetcher.clone(), ctx.clone()));
        self.stale_time.set(Some(ctx.stale_time));

        let busy = ctx.busy.as_ref().map(BusyIndicator::acquire);
        let query = self.clone();
        let request = async move {
            let _busy = busy;
            let result = execute_with_retry(&query.key, &fetcher, &ctx).await;
            query.settle(result.clone());
            result
        }
        .boxed_local()
        .shared();

        // Registered before notifying, so a listener reacting to the loading
        // state joins this request instead of starting another.
        *self.current_request.borrow_mut() = Some(request.clone());
        self.update_state(QueryState::into_fetching);
        log::debug!("Fetching query {}", self.key);

        spawn_local(request.clone().map(|_| ()));
        request
    }

    fn settle(&self, result: Result<V, Error>) {
        self.current_request.borrow_mut().take();
        let invalidated = self.refetch_after_settle.replace(false);
        match result {
            Ok(data) if invalidated => {
                self.version.set(next_version());
                self.set_state(QueryState::Invalid(QueryData::now(data)));
                self.refetch_if_observed();
            }
            Ok(data) => self.set_data(QueryData::now(data)),
            Err(error) => {
                log::warn!("Query {} failed: {error}", self.key);
                self.update_state(|state| state.into_failed(error));
            }
        }
        self.enable_gc_if_unobserved();
    }

    /// Snapshot of the entry.
    pub(crate) fn entry(&self) -> CacheEntry<V> {
        let stale_time = self.stale_time.get();
        self.with_state(|state| {
            let fetched_at = state.updated_at();
            CacheEntry {
                key: self.key.clone(),
                data: state.data().cloned(),
                status: state.status(),
                is_fetching: self.is_fetching(),
                fetched_at,
                stale_at: fetched_at
                    .zip(stale_time)
                    .and_then(|(fetched_at, stale)| fetched_at.checked_add(stale)),
                gc_at: self.garbage_collector.gc_at(),
                error: state.error().cloned(),
                observer_count: self.observer_count(),
            }
        })
    }

    pub(crate) fn dispose(&self) {
        self.garbage_collector.dispose();
    }
}

impl<V> PartialEq for Query<V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<V> Eq for Query<V> {}

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Removes `key` if it has no subscribers and no request in flight.
fn evict_idle<V: QueryValue>(cache: &QueryCache, key: &QueryKey) -> bool {
    let removed = cache.use_cache_option_mut::<V, _, _>(|queries| {
        let idle = queries.get(key).map_or(false, Query::is_idle);
        if idle {
            queries.remove(key)
        } else {
            None
        }
    });

    match removed {
        Some(query) => {
            query.dispose();
            true
        }
        None => false,
    }
}
