use std::{cell::Cell, future::Future, rc::Rc, time::Duration};

use crate::{
    query_cache::QueryCache,
    query_executor::{into_fetcher, Connectivity, FetchContext},
    query_options::ResolvedOptions,
    BusyIndicator, CacheEntry, DefaultQueryOptions, Error, NetworkMode, QueryKey, QueryObserver,
    QueryOptions, QueryState, QueryValue,
};

/// The Cache Client to store query data.
/// Exposes utility functions to manage queries.
///
/// Queries can be:
/// - [Subscribed](Self::query)
///     - Returns an observer that exposes cached data immediately and refetches when stale.
/// - [Fetched](Self::fetch_query) and [Prefetched](Self::prefetch_query)
///     - Awaits the data, served from cache when fresh.
/// - [Invalidated](Self::invalidate_query)
///     - Query will refetch on next usage. Active queries are immediately refetched in the background.
/// - [Introspected](Self::peek_query_state)
///     - Lets you see the current state of a query without subscribing to it.
/// - [Manually updated](Self::set_query_data)
///     - Useful when you have updated a value and you want to manually set it in cache instead of waiting for query to refetch.
///
/// Clones share the same cache.
#[derive(Clone)]
pub struct QueryClient {
    pub(crate) cache: QueryCache,
    default_options: Rc<DefaultQueryOptions>,
    connectivity: Connectivity,
    busy: Option<BusyIndicator>,
    mutations: Rc<Cell<usize>>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(DefaultQueryOptions::default())
    }
}

impl QueryClient {
    /// Creates a new Query Client.
    pub fn new(default_options: DefaultQueryOptions) -> Self {
        Self {
            cache: QueryCache::new(),
            default_options: Rc::new(default_options),
            connectivity: Connectivity::new(),
            busy: None,
            mutations: Rc::new(Cell::new(0)),
        }
    }

    /// Fetches opted into `track_busy`, and every [`mutate`](Self::mutate),
    /// hold `busy` while they run.
    pub fn with_busy_indicator(self, busy: BusyIndicator) -> Self {
        Self {
            busy: Some(busy),
            ..self
        }
    }

    /// The client-wide defaults.
    pub fn default_options(&self) -> &DefaultQueryOptions {
        &self.default_options
    }

    /// The attached busy indicator.
    pub fn busy_indicator(&self) -> Option<&BusyIndicator> {
        self.busy.as_ref()
    }

    /// Subscribes to `key`.
    ///
    /// The returned observer exposes cached data immediately. When the entry
    /// is empty, stale, or invalid a fetch is started in the background (or
    /// the one in flight is joined), and the previous data stays visible
    /// until it settles.
    ///
    /// Example:
    /// ```
    /// use catalog_sync::*;
    ///
    /// async fn courses(key: QueryKey) -> Result<Vec<String>, Error> {
    ///     Ok(vec![format!("first course of {key}")])
    /// }
    ///
    /// async fn screen(client: QueryClient) {
    ///     let observer = client.query(query_key!["courses", 5], courses, QueryOptions::default());
    ///     observer.settled().await;
    ///     assert!(observer.data().is_some());
    /// }
    /// ```
    pub fn query<V, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(QueryKey) -> Fu + 'static,
        options: QueryOptions<V>,
    ) -> QueryObserver<V>
    where
        V: QueryValue,
        Fu: Future<Output = Result<V, Error>> + 'static,
    {
        let options = options.resolve(&self.default_options);
        QueryObserver::new(self.clone(), key, into_fetcher(fetcher), options)
    }

    /// Fetch a query and store it in cache. Fresh cached data is returned
    /// without a network call, and a fetch already in flight is joined.
    ///
    /// If you don't need the result opt for [`prefetch_query()`](Self::prefetch_query)
    pub async fn fetch_query<V, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(QueryKey) -> Fu + 'static,
        options: QueryOptions<V>,
    ) -> Result<V, Error>
    where
        V: QueryValue,
        Fu: Future<Output = Result<V, Error>> + 'static,
    {
        let options = options.resolve(&self.default_options);
        if !options.enabled {
            return Err(Error::logic(format!("query {key} is disabled")));
        }

        let query = self.cache.get_or_create_query::<V>(key);
        query.update_gc_time(options.gc_time);

        if let Some(data) = query.fresh_data(options.stale_time) {
            return Ok(data);
        }

        let request = match query.current_request() {
            Some(request) => request,
            None => {
                let online = self.connectivity.is_online();
                if !online && options.network_mode == NetworkMode::OfflineFirst {
                    if let Some(data) = query.with_state(|state| state.data().cloned()) {
                        log::debug!("Serving cached {} while offline", query.key);
                        return Ok(data);
                    }
                }
                if !options.network_mode.can_start(online) {
                    log::debug!("Query {} not started while offline", query.key);
                    query.enable_gc_if_unobserved();
                    return Err(Error::offline());
                }
                query.fetch(into_fetcher(fetcher), self.fetch_context(&options))
            }
        };

        request.await
    }

    /// Prefetch a query and store it in cache. Fresh entries are left alone.
    ///
    /// Failures are recorded in the entry's state.
    ///
    /// If you need the result opt for [`fetch_query()`](Self::fetch_query)
    pub async fn prefetch_query<V, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(QueryKey) -> Fu + 'static,
        options: QueryOptions<V>,
    ) where
        V: QueryValue,
        Fu: Future<Output = Result<V, Error>> + 'static,
    {
        if let Err(error) = self.fetch_query(key, fetcher, options).await {
            log::debug!("Prefetch failed: {error}");
        }
    }

    /// Retrieve the current state for an existing query.
    /// If the query does not exist, [`None`](Option::None) will be returned.
    /// Useful for when you want to introspect the state of a query without subscribing to it.
    pub fn peek_query_state<V: QueryValue>(&self, key: &QueryKey) -> Option<QueryState<V>> {
        self.cache.get_query::<V>(key).map(|q| q.get_state())
    }

    /// Snapshot of an existing entry, including freshness and eviction deadlines.
    pub fn get_entry<V: QueryValue>(&self, key: &QueryKey) -> Option<CacheEntry<V>> {
        self.cache.get_query::<V>(key).map(|q| q.entry())
    }

    /// Attempts to invalidate an entry in the Query Cache.
    /// Matching query is marked as invalid, and will be refetched in background once it's active.
    ///
    /// Returns true if the entry was successfully invalidated.
    pub fn invalidate_query<V: QueryValue>(&self, key: &QueryKey) -> bool {
        self.cache
            .get_query::<V>(key)
            .is_some_and(|query| query.mark_invalid())
    }

    /// Invalidates every entry whose key starts with `prefix`, whatever its
    /// value type. Active queries are refetched in the background.
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        self.cache
            .queries_matching(Some(prefix))
            .iter()
            .filter(|query| query.mark_invalid())
            .count()
    }

    /// Invalidates all queries in the cache.
    pub fn invalidate_all_queries(&self) -> usize {
        self.cache
            .queries_matching(None)
            .iter()
            .filter(|query| query.mark_invalid())
            .count()
    }

    /// Returns the current number of entries in the cache.
    pub fn size(&self) -> usize {
        self.cache.size()
    }

    /// A synchronous function that can be used to immediately set a query's data.
    ///
    /// If the query does not exist, it will be created.
    ///
    /// If the updater function returns [`None`](Option::None), the query data will not be updated.
    ///
    /// If the updater function receives [`None`](Option::None) as input, you can return [`None`](Option::None) to bail out of the update and thus not create a new cache entry.
    pub fn update_query_data<V: QueryValue>(
        &self,
        key: QueryKey,
        updater: impl FnOnce(Option<&V>) -> Option<V>,
    ) -> bool {
        if let Some(query) = self.cache.get_query::<V>(&key) {
            return query.update_data(updater);
        }

        let Some(data) = updater(None) else {
            return false;
        };
        let query = self.cache.get_or_create_query::<V>(key);
        let updated = query.update_data(|_| Some(data));
        query.update_gc_time(self.default_options.gc_time);
        query.enable_gc_if_unobserved();
        updated
    }

    /// Update the query's data.
    /// If the query does not exist, it will be created.
    pub fn set_query_data<V: QueryValue>(&self, key: QueryKey, data: V) {
        self.update_query_data(key, |_| Some(data));
    }

    /// Mutate the existing data if it exists.
    /// All listeners will be notified, regardless of whether the data was updated or not.
    pub fn update_query_data_mut<V: QueryValue>(
        &self,
        key: &QueryKey,
        updater: impl FnOnce(&mut V),
    ) -> bool {
        self.cache
            .get_query::<V>(key)
            .is_some_and(|query| query.mutate_data(updater))
    }

    /// Removes an entry immediately, even if subscribed.
    pub fn remove_query<V: QueryValue>(&self, key: &QueryKey) -> bool {
        self.cache.evict_query::<V>(key)
    }

    /// Clears the cache. All queries will be removed.
    pub fn clear(&self) {
        let removed = self.cache.clear_all();
        log::debug!("Cleared {removed} queries");
    }

    /// Number of entries with a fetch in flight.
    pub fn fetching_count(&self) -> usize {
        self.cache.fetching_count()
    }

    /// Number of [`mutate`](Self::mutate) calls still running.
    pub fn mutating_count(&self) -> usize {
        self.mutations.get()
    }

    /// Fetches and mutations currently running.
    pub fn pending_operations(&self) -> usize {
        self.fetching_count() + self.mutating_count()
    }

    /// Runs a write against the backend under the busy indicator. On success
    /// every entry under each of `invalidate` is invalidated.
    pub async fn mutate<T, Fu>(&self, mutation: Fu, invalidate: &[QueryKey]) -> Result<T, Error>
    where
        Fu: Future<Output = Result<T, Error>>,
    {
        let _pending = PendingMutation::start(&self.mutations);
        let _busy = self.busy.as_ref().map(BusyIndicator::acquire);

        let result = mutation.await;
        match &result {
            Ok(_) => {
                for prefix in invalidate {
                    let invalidated = self.invalidate_queries(prefix);
                    log::debug!("Mutation invalidated {invalidated} queries under {prefix}");
                }
            }
            Err(error) => log::warn!("Mutation failed: {error}"),
        }
        result
    }

    /// Reports device connectivity.
    pub fn set_online(&self, online: bool) {
        if self.connectivity.is_online() != online {
            log::debug!("Connectivity changed, online: {online}");
        }
        self.connectivity.set_online(online);
    }

    /// Last reported connectivity. Online until told otherwise.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Hides a busy indicator left visible with nothing pending.
    pub fn recover_busy_indicator(&self) -> bool {
        self.busy
            .as_ref()
            .is_some_and(|busy| busy.recover_if_stuck(self.pending_operations()))
    }

    /// [`recover_busy_indicator`](Self::recover_busy_indicator) after
    /// `delay`, for a view returning to the foreground.
    pub async fn recover_busy_indicator_after(&self, delay: Duration) -> bool {
        match &self.busy {
            Some(busy) => busy.recover_after(delay, || self.pending_operations()).await,
            None => false,
        }
    }

    pub(crate) fn fetch_context<V>(&self, options: &ResolvedOptions<V>) -> FetchContext {
        FetchContext {
            stale_time: options.stale_time,
            retry: options.retry.clone(),
            retry_delay: options.retry_delay.clone(),
            network_mode: options.network_mode,
            connectivity: self.connectivity.clone(),
            busy: self.busy.clone().filter(|_| options.track_busy),
        }
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("size", &self.size())
            .field("online", &self.is_online())
            .field("mutations", &self.mutating_count())
            .finish()
    }
}

struct PendingMutation(Rc<Cell<usize>>);

impl PendingMutation {
    fn start(mutations: &Rc<Cell<usize>>) -> Self {
        mutations.set(mutations.get() + 1);
        PendingMutation(mutations.clone())
    }
}

impl Drop for PendingMutation {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}
