use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

use crate::Instant;

/// Zero once `updated_at + stale_time` has passed. `Duration::MAX` when the
/// deadline is unrepresentable (never stale).
pub(crate) fn time_until_stale(updated_at: Instant, stale_time: Duration) -> Duration {
    match updated_at.checked_add(stale_time) {
        Some(deadline) => deadline.saturating_until(),
        None => Duration::MAX,
    }
}

/// Background work runs on the current `LocalSet`.
pub(crate) fn spawn_local<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    tokio::task::spawn_local(fut)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stale_deadline() {
        let updated_at = Instant::now();
        let stale_time = Duration::from_secs(10);
        assert_eq!(stale_time, time_until_stale(updated_at, stale_time));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(Duration::from_secs(6), time_until_stale(updated_at, stale_time));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(time_until_stale(updated_at, stale_time).is_zero());

        assert_eq!(Duration::MAX, time_until_stale(updated_at, Duration::MAX));
    }
}
