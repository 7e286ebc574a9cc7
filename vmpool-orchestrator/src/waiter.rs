use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vmpool_common::{CpiError, CpiResult};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_OS_RELOAD_TIMEOUT: Duration = Duration::from_secs(10800);

/// Deadlines and poll cadence for every wait in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub timeout: Duration,
    pub interval: Duration,
    /// OS reloads are slow; the "reload finished" wait gets its own deadline.
    pub os_reload_timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            interval: DEFAULT_WAIT_INTERVAL,
            os_reload_timeout: DEFAULT_OS_RELOAD_TIMEOUT,
        }
    }
}

/// Polls a predicate until it holds, the deadline passes, or the token fires.
#[derive(Debug, Clone)]
pub struct Waiter {
    config: WaitConfig,
    cancel: CancellationToken,
}

impl Waiter {
    pub fn new(config: WaitConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Poll `predicate` every `interval` until it returns `Ok(true)`.
    ///
    /// The predicate is evaluated immediately, so a condition that already
    /// holds costs one call and no sleep. An `Err` from the predicate ends the
    /// wait; predicates that tolerate transient failures must map them to
    /// `Ok(false)` themselves. The last poll happens at the deadline.
    pub async fn wait_until<F, Fut>(
        &self,
        cid: u64,
        condition: &str,
        timeout: Duration,
        mut predicate: F,
    ) -> CpiResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CpiResult<bool>>,
    {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut polls: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(CpiError::cancelled(cid, condition));
            }

            polls += 1;
            match predicate().await {
                Ok(true) => {
                    tracing::debug!(cid, condition, polls, "wait condition reached");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    return Err(e.push_context(format!(
                        "waiting for instance {} condition '{}'",
                        cid, condition
                    )));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let elapsed = now - started;
                tracing::warn!(cid, condition, polls, ?elapsed, "wait timed out");
                return Err(CpiError::timeout(cid, condition, elapsed));
            }

            let nap = self.config.interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(cid, condition, polls, "wait cancelled");
                    return Err(CpiError::cancelled(cid, condition));
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use vmpool_common::ErrorKind;

    use super::*;

    fn waiter(timeout_secs: u64, interval_secs: u64) -> Waiter {
        Waiter::new(
            WaitConfig {
                timeout: Duration::from_secs(timeout_secs),
                interval: Duration::from_secs(interval_secs),
                os_reload_timeout: Duration::from_secs(timeout_secs),
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_condition_costs_one_poll() {
        let w = waiter(60, 5);
        let polls = AtomicU32::new(0);
        let started = Instant::now();
        w.wait_until(1, "ready", Duration::from_secs(60), || {
            polls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, CpiError>(true) }
        })
        .await
        .unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_poll() {
        let w = waiter(60, 5);
        let polls = AtomicU32::new(0);
        w.wait_until(1, "ready", Duration::from_secs(60), || {
            let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, CpiError>(n >= 3) }
        })
        .await
        .unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_cid_and_condition() {
        let w = waiter(12, 5);
        let started = Instant::now();
        let err = w
            .wait_until(42, "no active transactions", Duration::from_secs(12), || async {
                Ok::<_, CpiError>(false)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("no active transactions"));
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_error_is_fatal() {
        let w = waiter(60, 5);
        let polls = AtomicU32::new(0);
        let err = w
            .wait_until(7, "power state RUNNING", Duration::from_secs(60), || {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Err::<bool, _>(CpiError::cloud("boom")) }
            })
            .await
            .unwrap_err();
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(err.root_message(), "boom");
        assert_eq!(
            err.context_chain().next(),
            Some("waiting for instance 7 condition 'power state RUNNING'")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_sleep() {
        let token = CancellationToken::new();
        let w = Waiter::new(WaitConfig::default(), token.clone());
        let polls = Arc::new(AtomicU32::new(0));
        let seen = polls.clone();
        let handle = tokio::spawn(async move {
            w.wait_until(3, "pingable", Duration::from_secs(3600), move || {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CpiError>(false) }
            })
            .await
        });
        tokio::time::sleep(Duration::from_secs(7)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn defaults() {
        let c = WaitConfig::default();
        assert_eq!(c.timeout, Duration::from_secs(3600));
        assert_eq!(c.interval, Duration::from_secs(5));
        assert_eq!(c.os_reload_timeout, Duration::from_secs(10800));
    }
}
