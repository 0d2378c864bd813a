use std::{cell::Cell, future::Future, rc::Rc, time::Duration};

use futures::{
    future::{LocalBoxFuture, Shared},
    FutureExt,
};

use crate::{BusyIndicator, Error, NetworkMode, QueryKey, RetryDelay, RetryPolicy};

/// Type-erased fetch function shared by every subscriber of a key.
pub(crate) type Fetcher<V> = Rc<dyn Fn(QueryKey) -> LocalBoxFuture<'static, Result<V, Error>>>;

/// The single in-flight request of a key. Every caller awaiting the key
/// polls a clone of the same future.
pub(crate) type SharedFetch<V> = Shared<LocalBoxFuture<'static, Result<V, Error>>>;

pub(crate) fn into_fetcher<V, Fu>(fetcher: impl Fn(QueryKey) -> Fu + 'static) -> Fetcher<V>
where
    Fu: Future<Output = Result<V, Error>> + 'static,
{
    Rc::new(move |key| fetcher(key).boxed_local())
}

/// Connectivity reported by the host platform.
#[derive(Clone)]
pub(crate) struct Connectivity(Rc<Cell<bool>>);

impl Connectivity {
    pub(crate) fn new() -> Self {
        Connectivity(Rc::new(Cell::new(true)))
    }

    pub(crate) fn is_online(&self) -> bool {
        self.0.get()
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.0.set(online);
    }
}

/// Everything a fetch needs besides the fetcher itself.
#[derive(Clone)]
pub(crate) struct FetchContext {
    pub(crate) stale_time: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) retry_delay: RetryDelay,
    pub(crate) network_mode: NetworkMode,
    pub(crate) connectivity: Connectivity,
    pub(crate) busy: Option<BusyIndicator>,
}

/// Runs `fetcher` until it succeeds or the retry policy gives up.
pub(crate) async fn execute_with_retry<V>(
    key: &QueryKey,
    fetcher: &Fetcher<V>,
    ctx: &FetchContext,
) -> Result<V, Error> {
    let mut failure_count = 0;
    loop {
        let error = match fetcher(key.clone()).await {
            Ok(data) => return Ok(data),
            Err(error) => error,
        };

        if !ctx.retry.should_retry(failure_count, &error) {
            log::debug!(
                "Query {key} failed after {} attempt(s): {error}",
                failure_count + 1
            );
            return Err(error);
        }

        if !ctx.network_mode.can_retry(ctx.connectivity.is_online()) {
            log::debug!("Query {key} failed while offline, not retrying: {error}");
            return Err(error);
        }

        let delay = ctx.retry_delay.delay(failure_count);
        log::debug!(
            "Retrying query {key} in {}ms (failure {}): {error}",
            delay.as_millis(),
            failure_count + 1
        );
        tokio::time::sleep(delay).await;
        failure_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query_key, ErrorKind, StorageError};
    use std::cell::RefCell;

    fn context() -> FetchContext {
        FetchContext {
            stale_time: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::OfflineFirst,
            connectivity: Connectivity::new(),
            busy: None,
        }
    }

    /// Fails with `errors` in order, then succeeds. Records attempt instants.
    fn scripted(errors: Vec<Error>) -> (Fetcher<u32>, Rc<RefCell<Vec<tokio::time::Instant>>>) {
        let attempts = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(RefCell::new(errors.into_iter()));
        let fetcher = {
            let attempts = attempts.clone();
            into_fetcher(move |_key| {
                attempts.borrow_mut().push(tokio::time::Instant::now());
                let next = errors.borrow_mut().next();
                async move {
                    match next {
                        Some(error) => Err(error),
                        None => Ok(7),
                    }
                }
            })
        };
        (fetcher, attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_is_not_retried() {
        let (fetcher, attempts) = scripted(vec![Error::from_status(404, "no such course")]);
        let result = execute_with_retry(&query_key!["course", 9], &fetcher, &context()).await;

        assert_eq!(Some(404), result.unwrap_err().status());
        assert_eq!(1, attempts.borrow().len(), "zero additional attempts");
    }

    #[tokio::test(start_paused = true)]
    async fn logic_and_storage_errors_surface_immediately() {
        let (fetcher, attempts) = scripted(vec![Error::logic("missing course id")]);
        let result = execute_with_retry(&query_key!["course"], &fetcher, &context()).await;
        assert_eq!(ErrorKind::Logic, result.unwrap_err().kind());
        assert_eq!(1, attempts.borrow().len());

        let (fetcher, attempts) = scripted(vec![StorageError::io("userData", "disk full").into()]);
        let result = execute_with_retry(&query_key!["profile"], &fetcher, &context()).await;
        assert_eq!(ErrorKind::Storage, result.unwrap_err().kind());
        assert_eq!(1, attempts.borrow().len());
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_twice_with_backoff() {
        let (fetcher, attempts) = scripted(vec![
            Error::from_status(500, "boom"),
            Error::network("reset"),
            Error::from_status(503, "unavailable"),
        ]);
        let result = execute_with_retry(&query_key!["courses"], &fetcher, &context()).await;

        assert_eq!(Some(503), result.unwrap_err().status());
        let attempts = attempts.borrow();
        assert_eq!(3, attempts.len(), "two additional attempts");

        let first_gap = attempts[1] - attempts[0];
        let second_gap = attempts[2] - attempts[1];
        assert_eq!(Duration::from_millis(1000), first_gap);
        assert_eq!(Duration::from_millis(2000), second_gap);
        assert!(second_gap >= first_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let (fetcher, attempts) = scripted(vec![Error::network("reset")]);
        let result = execute_with_retry(&query_key!["courses"], &fetcher, &context()).await;

        assert_eq!(Ok(7), result);
        assert_eq!(2, attempts.borrow().len());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_first_does_not_retry_while_offline() {
        let ctx = context();
        ctx.connectivity.set_online(false);
        let (fetcher, attempts) = scripted(vec![Error::network("no route")]);

        let result = execute_with_retry(&query_key!["courses"], &fetcher, &ctx).await;

        assert!(result.is_err());
        assert_eq!(1, attempts.borrow().len(), "first attempt still goes out");
    }
}
