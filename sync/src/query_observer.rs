use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::{Rc, Weak},
};

use futures::{future::LocalBoxFuture, FutureExt};
use slotmap::{new_key_type, SlotMap};

use crate::{
    query::{ObserverKey, Query},
    query_executor::Fetcher,
    query_options::ResolvedOptions,
    CacheEntry, Error, QueryClient, QueryKey, QueryState, QueryStatus, QueryValue,
    RefetchOnMount,
};

new_key_type! {
    /// Handle returned by [`QueryObserver::add_listener`].
    pub struct ListenerKey;
}

type Listeners<V> = RefCell<SlotMap<ListenerKey, Rc<dyn Fn(&QueryState<V>)>>>;

/// A subscription to one cache entry, created by [`QueryClient::query`].
///
/// Clones share the subscription. Dropping the last clone unsubscribes: an
/// in-flight fetch keeps running, and the entry is evicted after its
/// `gc_time` once nobody else is subscribed.
pub struct QueryObserver<V: QueryValue> {
    inner: Rc<ObserverInner<V>>,
}

struct ObserverInner<V: QueryValue> {
    key: QueryKey,
    client: QueryClient,
    fetcher: Fetcher<V>,
    options: RefCell<ResolvedOptions<V>>,
    query: RefCell<Option<Query<V>>>,
    subscription: Cell<Option<ObserverKey>>,
    listeners: Rc<Listeners<V>>,
}

impl<V: QueryValue> Clone for QueryObserver<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: QueryValue> std::fmt::Debug for QueryObserver<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.inner.key)
            .field("subscribed", &self.inner.subscription.get().is_some())
            .field("fetcher", &"...")
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}

impl<V: QueryValue> QueryObserver<V> {
    pub(crate) fn new(
        client: QueryClient,
        key: QueryKey,
        fetcher: Fetcher<V>,
        options: ResolvedOptions<V>,
    ) -> Self {
        let observer = Self {
            inner: Rc::new(ObserverInner {
                key,
                client,
                fetcher,
                options: RefCell::new(options),
                query: RefCell::new(None),
                subscription: Cell::new(None),
                listeners: Rc::new(RefCell::new(SlotMap::with_key())),
            }),
        };
        observer.mount();
        observer
    }

    /// Subscribes to the cache entry and fetches if the entry warrants it.
    fn mount(&self) {
        if !self.inner.options.borrow().enabled {
            log::trace!("Query {} is disabled, not subscribing", self.inner.key);
            return;
        }

        let query = self.attach();
        if query.is_fetching() {
            return;
        }

        let (stale_time, refetch_on_mount) = {
            let options = self.inner.options.borrow();
            (options.stale_time, options.refetch_on_mount)
        };
        let should_fetch = !query.has_data()
            || match refetch_on_mount {
                RefetchOnMount::Always => true,
                RefetchOnMount::IfStale => query.is_stale(stale_time),
                RefetchOnMount::Never => false,
            };

        if should_fetch {
            let _ = self.start_fetch(&query);
        }
    }

    /// Returns the query currently cached under the key, moving the
    /// subscription over if the entry was removed and recreated.
    fn attach(&self) -> Query<V> {
        let cached = self
            .inner
            .client
            .cache
            .get_or_create_query::<V>(self.inner.key.clone());
        cached.update_gc_time(self.inner.options.borrow().gc_time);

        let current = self.inner.query.borrow().clone();
        if let Some(current) = current {
            if current.same_entry(&cached) {
                return current;
            }
            if let Some(subscription) = self.inner.subscription.take() {
                current.unsubscribe(subscription);
            }
        }

        let listeners = Rc::downgrade(&self.inner.listeners);
        let subscription = cached.subscribe(Rc::new(move |state: &QueryState<V>| {
            notify_listeners(&listeners, state)
        }));
        self.inner.subscription.set(Some(subscription));
        *self.inner.query.borrow_mut() = Some(cached.clone());
        cached
    }

    fn start_fetch(&self, query: &Query<V>) -> Result<LocalBoxFuture<'static, Result<V, Error>>, Error> {
        let options = self.inner.options.borrow().clone();
        let ctx = self.inner.client.fetch_context(&options);
        if !options.network_mode.can_start(ctx.connectivity.is_online()) {
            log::debug!("Query {} not started while offline", self.inner.key);
            return Err(Error::offline());
        }
        Ok(query.fetch(self.inner.fetcher.clone(), ctx).boxed_local())
    }

    fn query(&self) -> Option<Query<V>> {
        self.inner.query.borrow().clone()
    }

    /// The key this observer is subscribed to.
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// Current state of the entry. `Created` while disabled.
    pub fn state(&self) -> QueryState<V> {
        self.query()
            .map(|query| query.get_state())
            .unwrap_or_default()
    }

    /// Current data, falling back to the configured default value.
    pub fn data(&self) -> Option<V> {
        self.query()
            .and_then(|query| query.with_state(|state| state.data().cloned()))
            .or_else(|| self.inner.options.borrow().default_value.clone())
    }

    /// Flattened status.
    pub fn status(&self) -> QueryStatus {
        self.query()
            .map(|query| query.with_state(QueryState::status))
            .unwrap_or(QueryStatus::Idle)
    }

    /// Terminal error of the last fetch.
    pub fn error(&self) -> Option<Error> {
        self.query()
            .and_then(|query| query.with_state(|state| state.error().cloned()))
    }

    /// First fetch in progress, no data yet.
    pub fn is_loading(&self) -> bool {
        self.status() == QueryStatus::Loading
    }

    /// Any fetch in progress.
    pub fn is_fetching(&self) -> bool {
        self.query().is_some_and(|query| query.is_fetching())
    }

    /// Whether the data is older than this observer's `stale_time`.
    pub fn is_stale(&self) -> bool {
        let stale_time = self.inner.options.borrow().stale_time;
        self.query().is_some_and(|query| query.is_stale(stale_time))
    }

    /// Snapshot of the cache entry.
    pub fn entry(&self) -> Option<CacheEntry<V>> {
        self.query().map(|query| query.entry())
    }

    /// Version of the current data. Changes whenever the data changes.
    pub fn data_version(&self) -> u64 {
        self.query().map_or(0, |query| query.data_version())
    }

    /// Registers a callback invoked on every state change of the entry.
    pub fn add_listener(&self, listener: impl Fn(&QueryState<V>) + 'static) -> ListenerKey {
        self.inner.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        self.inner.listeners.borrow_mut().remove(key).is_some()
    }

    /// Fetches regardless of staleness, joining a fetch already in flight.
    ///
    /// The returned future does not borrow the observer, and dropping it
    /// does not cancel the fetch.
    pub fn refetch(&self) -> impl Future<Output = Result<V, Error>> + 'static {
        let request = if !self.inner.options.borrow().enabled {
            Err(Error::logic(format!("query {} is disabled", self.inner.key)))
        } else {
            let query = self.attach();
            match query.current_request() {
                Some(current) => Ok(current.boxed_local()),
                None => self.start_fetch(&query),
            }
        };

        async move { request?.await }
    }

    /// Resolves with the entry's state once no fetch is in flight.
    pub fn settled(&self) -> impl Future<Output = QueryState<V>> + 'static {
        let query = self.query();
        async move {
            let Some(query) = query else {
                return QueryState::Created;
            };
            while let Some(request) = query.current_request() {
                let _ = request.await;
            }
            query.get_state()
        }
    }

    /// Enables or disables fetching. Enabling subscribes and fetches if
    /// the entry warrants it.
    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = std::mem::replace(&mut self.inner.options.borrow_mut().enabled, enabled);
        if enabled && !was_enabled {
            self.mount();
        }
    }

    /// Projects the data through `select`. The projection is recomputed only
    /// when the data changes, and never triggers a fetch.
    pub fn select<R: Clone + 'static>(&self, select: impl Fn(&V) -> R + 'static) -> SelectedQuery<V, R> {
        SelectedQuery {
            observer: self.clone(),
            select: Rc::new(select),
            memo: RefCell::new(None),
        }
    }
}

fn notify_listeners<V>(listeners: &Weak<Listeners<V>>, state: &QueryState<V>) {
    let Some(listeners) = listeners.upgrade() else {
        return;
    };
    let listeners: Vec<_> = listeners.borrow().values().cloned().collect();
    for listener in listeners {
        listener(state);
    }
}

impl<V: QueryValue> Drop for ObserverInner<V> {
    fn drop(&mut self) {
        if let (Some(query), Some(subscription)) = (self.query.get_mut().take(), self.subscription.take()) {
            query.unsubscribe(subscription);
            log::trace!("Observer of {} unsubscribed", self.key);
        }
    }
}

/// A memoized projection of a [`QueryObserver`]'s data.
pub struct SelectedQuery<V: QueryValue, R> {
    observer: QueryObserver<V>,
    select: Rc<dyn Fn(&V) -> R>,
    memo: RefCell<Option<(u64, R)>>,
}

impl<V: QueryValue, R: Clone> SelectedQuery<V, R> {
    /// The projected data, if the query has data.
    pub fn get(&self) -> Option<R> {
        let query = self.observer.query()?;
        let version = query.data_version();

        if let Some((memo_version, selected)) = self.memo.borrow().as_ref() {
            if *memo_version == version {
                return Some(selected.clone());
            }
        }

        let selected = query.with_state(|state| state.data().map(|data| (self.select)(data)))?;
        *self.memo.borrow_mut() = Some((version, selected.clone()));
        Some(selected)
    }

    /// The underlying observer.
    pub fn observer(&self) -> &QueryObserver<V> {
        &self.observer
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{query_key, util::test_util::local, QueryOptions};

    fn courses_fetcher(
        calls: Rc<Cell<u32>>,
    ) -> impl Fn(QueryKey) -> LocalBoxFuture<'static, Result<Vec<String>, Error>> + 'static {
        move |key| {
            calls.set(calls.get() + 1);
            let call = calls.get();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec![format!("{key}#{call}")])
            }
            .boxed_local()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_screens_same_tick_share_one_call() {
        local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));

            let home = client.query(
                query_key!["courses", 5],
                courses_fetcher(calls.clone()),
                QueryOptions::default(),
            );
            let detail = client.query(
                query_key!["courses", 5],
                courses_fetcher(calls.clone()),
                QueryOptions::default(),
            );
            assert!(home.is_loading());
            assert!(detail.is_loading());

            home.settled().await;
            assert_eq!(1, calls.get());
            assert_eq!(home.data(), detail.data());
            assert_eq!(QueryStatus::Success, detail.status());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_data_is_served_without_refetch() {
        local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let options = || QueryOptions::default().set_stale_time(Duration::from_secs(10));

            let first = client.query(query_key!["courses"], courses_fetcher(calls.clone()), options());
            first.settled().await;
            let fetched_at = tokio::time::Instant::now();

            tokio::time::sleep_until(fetched_at + Duration::from_millis(9_999)).await;
            let second = client.query(query_key!["courses"], courses_fetcher(calls.clone()), options());
            assert!(!second.is_fetching());
            assert_eq!(1, calls.get());

            tokio::time::sleep_until(fetched_at + Duration::from_millis(10_001)).await;
            let third = client.query(query_key!["courses"], courses_fetcher(calls.clone()), options());
            assert!(third.is_fetching());
            assert_eq!(
                Some(vec!["[\"courses\"]#1".to_string()]),
                third.data(),
                "previous data stays visible while refetching"
            );
            third.settled().await;
            assert_eq!(2, calls.get());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_on_mount_always() {
        local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let options = || {
                QueryOptions::default()
                    .set_stale_time(Duration::from_secs(60))
                    .set_refetch_on_mount(RefetchOnMount::Always)
            };

            let first = client.query(query_key!["profile"], courses_fetcher(calls.clone()), options());
            first.settled().await;
            let second = client.query(query_key!["profile"], courses_fetcher(calls.clone()), options());
            second.settled().await;
            assert_eq!(2, calls.get());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_query_creates_no_entry() {
        local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));

            let observer = client.query(
                query_key!["teacher", NO_TEACHER_ID],
                courses_fetcher(calls.clone()),
                QueryOptions::default()
                    .set_enabled(false)
                    .set_default_value(Some(vec![])),
            );
            tokio::time::sleep(Duration::from_secs(1)).await;

            assert_eq!(0, calls.get());
            assert_eq!(0, client.size());
            assert_eq!(QueryStatus::Idle, observer.status());
            assert_eq!(Some(vec![]), observer.data(), "default value shown");
            assert!(observer.refetch().await.is_err());

            observer.set_enabled(true);
            observer.settled().await;
            assert_eq!(1, calls.get());
            assert_eq!(1, client.size());
        })
        .await;
    }

    // A key part that is absent until a route parameter arrives.
    const NO_TEACHER_ID: Option<i64> = None;

    #[tokio::test(start_paused = true)]
    async fn select_is_memoized_by_data_version() {
        local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let projections = Rc::new(Cell::new(0));

            let observer = client.query(
                query_key!["courses"],
                courses_fetcher(calls.clone()),
                QueryOptions::default(),
            );
            let count = {
                let projections = projections.clone();
                observer.select(move |courses: &Vec<String>| {
                    projections.set(projections.get() + 1);
                    courses.len()
                })
            };

            assert_eq!(None, count.get());
            observer.settled().await;
            assert_eq!(Some(1), count.get());
            assert_eq!(Some(1), count.get());
            assert_eq!(1, projections.get());

            client.set_query_data::<Vec<String>>(query_key!["courses"], vec!["a".into(), "b".into()]);
            assert_eq!(Some(2), count.get());
            assert_eq!(2, projections.get());
            assert_eq!(1, calls.get(), "select never fetches");
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_see_every_transition() {
        local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let observer = client.query(
                query_key!["banners"],
                courses_fetcher(calls.clone()),
                QueryOptions::default(),
            );

            let seen = Rc::new(RefCell::new(Vec::new()));
            let listener = {
                let seen = seen.clone();
                observer.add_listener(move |state| seen.borrow_mut().push(state.status()))
            };

            observer.settled().await;
            let _ = observer.refetch().await;
            assert_eq!(
                vec![
                    QueryStatus::Success,
                    QueryStatus::Success,
                    QueryStatus::Success
                ],
                *seen.borrow()
            );
            assert!(observer.remove_listener(listener));
            assert!(!observer.remove_listener(listener));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribing_does_not_cancel_fetch() {
        local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));

            let observer = client.query(
                query_key!["courses"],
                courses_fetcher(calls.clone()),
                QueryOptions::default().set_gc_time(Duration::from_secs(30)),
            );
            assert!(observer.is_fetching());
            drop(observer);

            tokio::time::sleep(Duration::from_millis(100)).await;
            let entry = client
                .get_entry::<Vec<String>>(&query_key!["courses"])
                .unwrap();
            assert_eq!(QueryStatus::Success, entry.status);
            assert_eq!(0, entry.observer_count);
            assert!(entry.gc_at.is_some());

            tokio::time::sleep(Duration::from_secs(31)).await;
            assert_eq!(0, client.size());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_after_entry_removed() {
        local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let observer = client.query(
                query_key!["courses"],
                courses_fetcher(calls.clone()),
                QueryOptions::default(),
            );
            observer.settled().await;

            assert!(client.remove_query::<Vec<String>>(&query_key!["courses"]));
            assert_eq!(0, client.size());

            observer.refetch().await.unwrap();
            assert_eq!(1, client.size());
            assert_eq!(
                1,
                client
                    .get_entry::<Vec<String>>(&query_key!["courses"])
                    .unwrap()
                    .observer_count
            );
        })
        .await;
    }
}
