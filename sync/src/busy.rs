use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::watch;

/// Reference-counted "is anything loading" signal driving a blocking overlay.
///
/// The overlay is visible while the counter is positive. Prefer
/// [`acquire`](Self::acquire) or [`track`](Self::track) over raw
/// [`show`](Self::show)/[`hide`](Self::hide) pairs: the guard releases exactly
/// once on every exit path.
#[derive(Clone)]
pub struct BusyIndicator {
    inner: Arc<BusyInner>,
}

struct BusyInner {
    count: AtomicUsize,
    // Publishing happens under the channel lock, which serializes every
    // counter update with its visibility projection.
    visible: watch::Sender<bool>,
}

impl Default for BusyIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl BusyIndicator {
    /// A hidden indicator.
    pub fn new() -> Self {
        let (visible, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusyInner {
                count: AtomicUsize::new(0),
                visible,
            }),
        }
    }

    /// Increments the counter and makes the overlay visible.
    pub fn show(&self) {
        self.update(|count| count.saturating_add(1));
    }

    /// Decrements the counter, hiding the overlay when it reaches zero.
    /// An unmatched call is clamped at zero and logged.
    pub fn hide(&self) {
        self.update(|count| {
            if count == 0 {
                log::warn!("BusyIndicator::hide called with no matching show");
            }
            count.saturating_sub(1)
        });
    }

    /// Unconditionally zeroes the counter.
    pub fn force_hide(&self) {
        self.update(|count| {
            if count > 0 {
                log::debug!("BusyIndicator force hidden with count {count}");
            }
            0
        });
    }

    /// Alias of [`force_hide`](Self::force_hide).
    pub fn reset(&self) {
        self.force_hide();
    }

    /// Shows the overlay until the returned guard is dropped.
    pub fn acquire(&self) -> BusyGuard {
        self.show();
        BusyGuard {
            indicator: self.clone(),
        }
    }

    /// Runs `fut` with the overlay shown, releasing on completion or cancellation.
    pub async fn track<F: Future>(&self, fut: F) -> F::Output {
        let _guard = self.acquire();
        fut.await
    }

    /// Current counter value.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Whether the overlay is visible (`count > 0`).
    pub fn is_visible(&self) -> bool {
        *self.inner.visible.borrow()
    }

    /// Receiver of visibility changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.visible.subscribe()
    }

    /// Force-hides when the counter is positive while `pending` reports no
    /// running operations. Returns whether a correction happened.
    pub fn recover_if_stuck(&self, pending: usize) -> bool {
        if pending == 0 && self.count() > 0 {
            log::warn!(
                "BusyIndicator stuck with count {} and no pending operations, forcing hide",
                self.count()
            );
            self.force_hide();
            true
        } else {
            false
        }
    }

    /// Waits `delay`, then applies [`recover_if_stuck`](Self::recover_if_stuck)
    /// with the pending count observed at that moment. Called when a view
    /// returns to the foreground.
    pub async fn recover_after(&self, delay: Duration, pending: impl Fn() -> usize) -> bool {
        tokio::time::sleep(delay).await;
        self.recover_if_stuck(pending())
    }

    fn update(&self, next: impl FnOnce(usize) -> usize) {
        let inner = &self.inner;
        inner.visible.send_if_modified(|visible| {
            let count = next(inner.count.load(Ordering::Acquire));
            inner.count.store(count, Ordering::Release);
            let now_visible = count > 0;
            if *visible != now_visible {
                *visible = now_visible;
                true
            } else {
                false
            }
        });
    }
}

impl std::fmt::Debug for BusyIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyIndicator")
            .field("count", &self.count())
            .field("visible", &self.is_visible())
            .finish()
    }
}

/// Keeps the overlay shown until dropped.
#[must_use = "the overlay is hidden as soon as the guard is dropped"]
pub struct BusyGuard {
    indicator: BusyIndicator,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.indicator.hide();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn show_hide() {
        let busy = BusyIndicator::new();
        assert!(!busy.is_visible());

        busy.show();
        busy.show();
        assert_eq!(2, busy.count());
        assert!(busy.is_visible());

        busy.hide();
        assert!(busy.is_visible(), "still one operation pending");

        busy.hide();
        assert!(!busy.is_visible());

        busy.hide();
        assert_eq!(0, busy.count(), "unmatched hide clamps at zero");
    }

    #[test]
    fn force_hide() {
        let busy = BusyIndicator::new();
        busy.show();
        busy.show();
        busy.force_hide();
        assert_eq!(0, busy.count());
        assert!(!busy.is_visible());
    }

    #[test]
    fn guard_releases_on_error_path() {
        let busy = BusyIndicator::new();

        fn load(busy: &BusyIndicator, fail: bool) -> Result<u32, &'static str> {
            let _guard = busy.acquire();
            if fail {
                return Err("failed");
            }
            Ok(1)
        }

        assert!(load(&busy, true).is_err());
        assert_eq!(0, busy.count());
        assert_eq!(Ok(1), load(&busy, false));
        assert_eq!(0, busy.count());
    }

    #[tokio::test]
    async fn track_releases_on_cancellation() {
        let busy = BusyIndicator::new();
        let tracked = busy.track(std::future::pending::<()>());
        {
            let mut tracked = Box::pin(tracked);
            let polled = futures::poll!(tracked.as_mut());
            assert!(polled.is_pending());
            assert!(busy.is_visible());
        }
        assert!(!busy.is_visible(), "dropping the future releases the guard");
    }

    #[tokio::test]
    async fn publishes_visibility_changes() {
        let busy = BusyIndicator::new();
        let mut rx = busy.subscribe();

        let guard = busy.acquire();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        busy.show();
        busy.hide();
        assert!(!rx.has_changed().unwrap(), "count changes above zero are silent");

        drop(guard);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }

    #[test]
    fn recovers_only_without_pending_operations() {
        let busy = BusyIndicator::new();
        busy.show();

        assert!(!busy.recover_if_stuck(1));
        assert!(busy.is_visible());

        assert!(busy.recover_if_stuck(0));
        assert!(!busy.is_visible());

        assert!(!busy.recover_if_stuck(0), "nothing to recover when hidden");
    }

    #[tokio::test(start_paused = true)]
    async fn recover_after_delay() {
        let busy = BusyIndicator::new();
        busy.show();

        let recovered = busy
            .recover_after(Duration::from_millis(500), || 0)
            .await;
        assert!(recovered);
        assert_eq!(0, busy.count());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Show,
        Hide,
        ForceHide,
        Acquire,
        Release,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Show),
            4 => Just(Op::Hide),
            1 => Just(Op::ForceHide),
            3 => Just(Op::Acquire),
            3 => Just(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn counter_never_negative_and_visibility_matches(ops in proptest::collection::vec(op(), 0..200)) {
            let busy = BusyIndicator::new();
            let mut guards = Vec::new();

            for op in ops {
                match op {
                    Op::Show => busy.show(),
                    Op::Hide => busy.hide(),
                    Op::ForceHide => busy.force_hide(),
                    Op::Acquire => guards.push(busy.acquire()),
                    Op::Release => { guards.pop(); }
                }
                prop_assert_eq!(busy.is_visible(), busy.count() > 0);
            }
        }

        #[test]
        fn paired_guards_always_settle_to_hidden(fails in proptest::collection::vec(any::<bool>(), 0..64)) {
            let busy = BusyIndicator::new();

            let results: Vec<Result<(), ()>> = fails
                .iter()
                .map(|fail| {
                    let _guard = busy.acquire();
                    if *fail { Err(()) } else { Ok(()) }
                })
                .collect();

            prop_assert_eq!(results.len(), fails.len());
            prop_assert_eq!(0, busy.count());
            prop_assert!(!busy.is_visible());
        }

        #[test]
        fn balanced_show_hide_returns_to_zero(n in 0_usize..100) {
            let busy = BusyIndicator::new();
            for _ in 0..n { busy.show(); }
            prop_assert_eq!(n > 0, busy.is_visible());
            for _ in 0..n { busy.hide(); }
            prop_assert_eq!(0, busy.count());
            prop_assert!(!busy.is_visible());
        }
    }
}
