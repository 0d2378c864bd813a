use std::{fmt, rc::Rc, time::Duration};

use crate::Error;

/// Default options for all queries under this client.
/// Individual queries override them through [`QueryOptions`].
#[derive(Debug, Clone)]
pub struct DefaultQueryOptions {
    /// Time before a query is considered stale.
    pub stale_time: Duration,
    /// Time before an inactive query is removed from cache.
    pub gc_time: Duration,
    /// Whether to retry a failed fetch.
    pub retry: RetryPolicy,
    /// Delay before each retry.
    pub retry_delay: RetryDelay,
    /// How fetches react to connectivity.
    pub network_mode: NetworkMode,
    /// Whether a new subscription refetches.
    pub refetch_on_mount: RefetchOnMount,
    /// Whether fetches hold the busy indicator.
    pub track_busy: bool,
}

impl Default for DefaultQueryOptions {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::default(),
            refetch_on_mount: RefetchOnMount::default(),
            track_busy: false,
        }
    }
}

const DEFAULT_STALE_TIME: Duration = Duration::from_secs(10);
const DEFAULT_GC_TIME: Duration = Duration::from_secs(60 * 5);

/// Options for a single query.
///
/// Every `None` inherits the client's [`DefaultQueryOptions`].
#[derive(Clone)]
pub struct QueryOptions<V> {
    /// Placeholder value to use while the query is loading for the first time.
    pub default_value: Option<V>,
    /// The duration that should pass before a query is considered stale.
    /// A stale query keeps showing its data but is refetched on next subscription.
    /// `Duration::MAX` means never stale.
    /// Stale time can never be greater than gc time.
    pub stale_time: Option<Duration>,
    /// How long a query without subscribers stays cached.
    /// `Duration::MAX` means never evicted.
    pub gc_time: Option<Duration>,
    /// When false, no fetch is issued and no cache entry is created or updated.
    pub enabled: bool,
    /// Retry policy.
    pub retry: Option<RetryPolicy>,
    /// Retry backoff.
    pub retry_delay: Option<RetryDelay>,
    /// Connectivity behavior.
    pub network_mode: Option<NetworkMode>,
    /// Refetch behavior on subscription.
    pub refetch_on_mount: Option<RefetchOnMount>,
    /// Whether this query's fetches hold the busy indicator.
    pub track_busy: Option<bool>,
}

impl<V> Default for QueryOptions<V> {
    fn default() -> Self {
        Self {
            default_value: None,
            stale_time: None,
            gc_time: None,
            enabled: true,
            retry: None,
            retry_delay: None,
            network_mode: None,
            refetch_on_mount: None,
            track_busy: None,
        }
    }
}

impl<V> QueryOptions<V> {
    /// Set the default value.
    pub fn set_default_value(self, default_value: Option<V>) -> Self {
        QueryOptions {
            default_value,
            ..self
        }
    }

    /// Set the stale_time.
    pub fn set_stale_time(self, stale_time: Duration) -> Self {
        QueryOptions {
            stale_time: Some(stale_time),
            ..self
        }
    }

    /// Set the gc time.
    pub fn set_gc_time(self, gc_time: Duration) -> Self {
        QueryOptions {
            gc_time: Some(gc_time),
            ..self
        }
    }

    /// Enable or disable the query.
    pub fn set_enabled(self, enabled: bool) -> Self {
        QueryOptions { enabled, ..self }
    }

    /// Set the retry policy.
    pub fn set_retry(self, retry: RetryPolicy) -> Self {
        QueryOptions {
            retry: Some(retry),
            ..self
        }
    }

    /// Set the retry delay.
    pub fn set_retry_delay(self, retry_delay: RetryDelay) -> Self {
        QueryOptions {
            retry_delay: Some(retry_delay),
            ..self
        }
    }

    /// Set the network mode.
    pub fn set_network_mode(self, network_mode: NetworkMode) -> Self {
        QueryOptions {
            network_mode: Some(network_mode),
            ..self
        }
    }

    /// Set the refetch on mount behavior.
    pub fn set_refetch_on_mount(self, refetch_on_mount: RefetchOnMount) -> Self {
        QueryOptions {
            refetch_on_mount: Some(refetch_on_mount),
            ..self
        }
    }

    /// Set whether fetches hold the busy indicator.
    pub fn set_track_busy(self, track_busy: bool) -> Self {
        QueryOptions {
            track_busy: Some(track_busy),
            ..self
        }
    }

    /// Fill every unset option from `defaults`, ensuring gc_time >= stale_time.
    pub(crate) fn resolve(self, defaults: &DefaultQueryOptions) -> ResolvedOptions<V> {
        let gc_time = self.gc_time.unwrap_or(defaults.gc_time);
        let stale_time = ensure_valid_stale_time(
            self.stale_time.unwrap_or(defaults.stale_time),
            gc_time,
        );
        ResolvedOptions {
            default_value: self.default_value,
            stale_time,
            gc_time,
            enabled: self.enabled,
            retry: self.retry.unwrap_or_else(|| defaults.retry.clone()),
            retry_delay: self
                .retry_delay
                .unwrap_or_else(|| defaults.retry_delay.clone()),
            network_mode: self.network_mode.unwrap_or(defaults.network_mode),
            refetch_on_mount: self.refetch_on_mount.unwrap_or(defaults.refetch_on_mount),
            track_busy: self.track_busy.unwrap_or(defaults.track_busy),
        }
    }
}

impl<V> fmt::Debug for QueryOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("has_default_value", &self.default_value.is_some())
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("enabled", &self.enabled)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("network_mode", &self.network_mode)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("track_busy", &self.track_busy)
            .finish()
    }
}

/// Options after merging with the client defaults.
#[derive(Clone)]
pub(crate) struct ResolvedOptions<V> {
    pub(crate) default_value: Option<V>,
    pub(crate) stale_time: Duration,
    pub(crate) gc_time: Duration,
    pub(crate) enabled: bool,
    pub(crate) retry: RetryPolicy,
    pub(crate) retry_delay: RetryDelay,
    pub(crate) network_mode: NetworkMode,
    pub(crate) refetch_on_mount: RefetchOnMount,
    pub(crate) track_busy: bool,
}

/// Decides whether a failed fetch is attempted again.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry.
    Never,
    /// Retry up to `n` times. Only server and network errors are retried.
    Count(u32),
    /// `retry(failure_count, error)`; `failure_count` is 0 on the first failure.
    Custom(Rc<dyn Fn(u32, &Error) -> bool>),
}

impl RetryPolicy {
    /// Wraps a custom predicate.
    pub fn custom(retry: impl Fn(u32, &Error) -> bool + 'static) -> Self {
        RetryPolicy::Custom(Rc::new(retry))
    }

    /// Whether to retry after `failure_count` previous failures ended in `error`.
    pub fn should_retry(&self, failure_count: u32, error: &Error) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Count(max) => failure_count < *max && error.is_retryable(),
            RetryPolicy::Custom(retry) => retry(failure_count, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Count(DEFAULT_RETRIES)
    }
}

const DEFAULT_RETRIES: u32 = 2;

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "Never"),
            RetryPolicy::Count(n) => f.debug_tuple("Count").field(n).finish(),
            RetryPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Delay before a retry attempt.
#[derive(Clone)]
pub enum RetryDelay {
    /// `min(base * 2^attempt, max)`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound.
        max: Duration,
    },
    /// Constant delay.
    Fixed(Duration),
    /// `retry_delay(attempt)`; `attempt` is 0 for the first retry.
    Custom(Rc<dyn Fn(u32) -> Duration>),
}

impl RetryDelay {
    /// Wraps a custom delay function.
    pub fn custom(delay: impl Fn(u32) -> Duration + 'static) -> Self {
        RetryDelay::Custom(Rc::new(delay))
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::Exponential { base, max } => {
                let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(*max).min(*max)
            }
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Custom(delay) => delay(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryDelay::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// How fetches react to the connectivity reported through
/// [`QueryClient::set_online`](crate::QueryClient::set_online).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Fetches are not started while offline.
    Online,
    /// Serve from cache first. The first attempt always goes to the network,
    /// retries only happen while online.
    #[default]
    OfflineFirst,
    /// Connectivity is ignored.
    Always,
}

impl NetworkMode {
    pub(crate) fn can_start(&self, online: bool) -> bool {
        match self {
            NetworkMode::Online => online,
            NetworkMode::OfflineFirst | NetworkMode::Always => true,
        }
    }

    pub(crate) fn can_retry(&self, online: bool) -> bool {
        match self {
            NetworkMode::Online | NetworkMode::OfflineFirst => online,
            NetworkMode::Always => true,
        }
    }
}

/// Whether a new subscription triggers a fetch for data that is already cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchOnMount {
    /// Refetch only stale or invalidated data.
    #[default]
    IfStale,
    /// Always refetch, regardless of staleness.
    Always,
    /// Only fetch when there is no data.
    Never,
}

fn ensure_valid_stale_time(stale_time: Duration, gc_time: Duration) -> Duration {
    if stale_time > gc_time {
        log::debug!(
            "stale_time is greater than gc_time. Using gc_time instead. stale_time: {}, gc_time: {}",
            stale_time.as_millis(),
            gc_time.as_millis()
        );
        gc_time
    } else {
        stale_time
    }
}
