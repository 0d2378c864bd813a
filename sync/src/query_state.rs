use crate::{Error, Instant, QueryKey};

/// The lifecycle of a query.
///
/// Each variant in the enum corresponds to a particular state of a query in its lifecycle,
/// starting from creation and covering all possible transitions up to invalidation and failure.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum QueryState<V> {
    /// The initial state of a Query upon its creation.
    ///
    /// No data has been requested or received yet.
    #[default]
    Created,

    /// Query is fetching for the first time.
    Loading,

    /// A Query is in the process of fetching, not being its first fetch.
    ///
    /// The associated `QueryData<V>` holds the previous data, which stays visible
    /// until the fetch settles.
    Fetching(QueryData<V>),

    /// The query has successfully completed a fetch operation.
    Loaded(QueryData<V>),

    /// The query has completed a fetch, but the fetched data is marked as invalid.
    ///
    /// Invalid data is still shown, and is refetched on next subscription.
    Invalid(QueryData<V>),

    /// The last fetch failed terminally (retries exhausted or not permitted).
    ///
    /// Data from an earlier successful fetch is kept for display.
    Failed {
        /// Data from the last successful fetch, if any.
        data: Option<QueryData<V>>,
        /// The classified failure.
        error: Error,
    },
}

/// Flattened status of a [`QueryState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// No fetch has started.
    Idle,
    /// A fetch is running and no data has ever been loaded.
    Loading,
    /// Data is available (possibly being refetched or invalidated).
    Success,
    /// The last fetch failed.
    Error,
}

impl<V> QueryState<V> {
    /// Returns the QueryData for the current QueryState, if present.
    pub fn query_data(&self) -> Option<&QueryData<V>> {
        match self {
            QueryState::Loading | QueryState::Created => None,
            QueryState::Fetching(data) | QueryState::Loaded(data) | QueryState::Invalid(data) => {
                Some(data)
            }
            QueryState::Failed { data, .. } => data.as_ref(),
        }
    }

    /// Returns the data contained within the QueryState, if present.
    pub fn data(&self) -> Option<&V> {
        self.query_data().map(|s| &s.data)
    }

    /// Returns the last updated timestamp for the QueryState, if present.
    pub fn updated_at(&self) -> Option<Instant> {
        self.query_data().map(|s| s.updated_at)
    }

    /// Returns the terminal error, if the last fetch failed.
    pub fn error(&self) -> Option<&Error> {
        match self {
            QueryState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Flattened status.
    pub fn status(&self) -> QueryStatus {
        match self {
            QueryState::Created => QueryStatus::Idle,
            QueryState::Loading => QueryStatus::Loading,
            QueryState::Fetching(_) | QueryState::Loaded(_) | QueryState::Invalid(_) => {
                QueryStatus::Success
            }
            QueryState::Failed { .. } => QueryStatus::Error,
        }
    }

    /// Whether a fetch is currently running.
    pub fn is_fetching(&self) -> bool {
        matches!(self, QueryState::Loading | QueryState::Fetching(_))
    }

    pub(crate) fn data_mut(&mut self) -> Option<&mut V> {
        match self {
            QueryState::Loading | QueryState::Created => None,
            QueryState::Fetching(data) | QueryState::Loaded(data) | QueryState::Invalid(data) => {
                Some(&mut data.data)
            }
            QueryState::Failed { data, .. } => data.as_mut().map(|d| &mut d.data),
        }
    }

    /// The state a fetch starts from: previous data is carried over.
    pub(crate) fn into_fetching(self) -> QueryState<V> {
        match self {
            QueryState::Created | QueryState::Loading | QueryState::Failed { data: None, .. } => {
                QueryState::Loading
            }
            QueryState::Fetching(data)
            | QueryState::Loaded(data)
            | QueryState::Invalid(data)
            | QueryState::Failed {
                data: Some(data), ..
            } => QueryState::Fetching(data),
        }
    }

    /// The state after a terminal failure.
    pub(crate) fn into_failed(self, error: Error) -> QueryState<V> {
        let data = match self {
            QueryState::Created | QueryState::Loading => None,
            QueryState::Fetching(data) | QueryState::Loaded(data) | QueryState::Invalid(data) => {
                Some(data)
            }
            QueryState::Failed { data, .. } => data,
        };
        QueryState::Failed { data, error }
    }
}

impl<V> std::fmt::Debug for QueryState<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Loading => write!(f, "Loading"),
            Self::Fetching(arg0) => f.debug_tuple("Fetching").field(arg0).finish(),
            Self::Loaded(arg0) => f.debug_tuple("Loaded").field(arg0).finish(),
            Self::Invalid(arg0) => f.debug_tuple("Invalid").field(arg0).finish(),
            Self::Failed { data, error } => f
                .debug_struct("Failed")
                .field("data", data)
                .field("error", error)
                .finish(),
        }
    }
}

/// The latest data for a Query.
#[derive(Clone, PartialEq, Eq)]
pub struct QueryData<V> {
    /// The Data.
    pub data: V,
    /// The instant this data was retrieved.
    pub updated_at: Instant,
}

impl<V> QueryData<V> {
    /// Creates a new QueryData with the given data and the current time as the updated_at timestamp.
    pub fn now(data: V) -> Self {
        Self {
            data,
            updated_at: Instant::now(),
        }
    }
}

impl<V> std::fmt::Debug for QueryData<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryData")
            .field("data", &self.data)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Point-in-time view of a cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The entry's key.
    pub key: QueryKey,
    /// Last successfully fetched data.
    pub data: Option<V>,
    /// Flattened status.
    pub status: QueryStatus,
    /// Whether a fetch is in flight.
    pub is_fetching: bool,
    /// When `data` was fetched.
    pub fetched_at: Option<Instant>,
    /// When `data` becomes stale. `None` with data present means never.
    pub stale_at: Option<Instant>,
    /// When the entry will be evicted, if eviction is scheduled.
    pub gc_at: Option<Instant>,
    /// Terminal error of the last fetch.
    pub error: Option<Error>,
    /// Number of active subscribers.
    pub observer_count: usize,
}
