//! Periodic background tasks

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A task that runs a closure on every tick until cancelled
///
/// The task owns a child of the caller's token, so cancelling either the
/// parent or the task itself stops it. A tick that is already running
/// finishes before the task exits; overrun ticks are skipped.
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(
        name: &'static str,
        interval: Duration,
        parent: &CancellationToken,
        tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_jittered(name, interval, Duration::ZERO, parent, tick)
    }

    /// Like [`PeriodicTask::spawn`], but the first tick is delayed by a random
    /// amount below `max_jitter` so that processes started together do not
    /// probe in lockstep
    pub fn spawn_jittered<F, Fut>(
        name: &'static str,
        interval: Duration,
        max_jitter: Duration,
        parent: &CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let task_token = token.clone();
        // tokio panics on a zero period
        let interval = interval.max(Duration::from_millis(1));
        let initial_delay = match max_jitter.as_millis() as u64 {
            0 => Duration::ZERO,
            max => Duration::from_millis(rand::thread_rng().gen_range(0..max)),
        };

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!(task = name, "Periodic task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        tick().await;
                    }
                }
            }
        });

        debug!(
            task = name,
            interval_ms = interval.as_millis() as u64,
            initial_delay_ms = initial_delay.as_millis() as u64,
            "Periodic task started"
        );
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request cancellation; idempotent
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }

    /// Cancel and wait for the current tick to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            debug!(task = self.name, error = %e, "Periodic task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let parent = CancellationToken::new();
        let counter = count.clone();
        let task = PeriodicTask::spawn("test", Duration::from_millis(100), &parent, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(task.is_running());
        task.stop();
        task.stop();
        let seen = count.load(Ordering::SeqCst);
        // First tick fires immediately, then every 100ms
        assert!((3..=4).contains(&seen), "unexpected tick count {}", seen);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_delays_first_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let parent = CancellationToken::new();
        let counter = count.clone();
        let task = PeriodicTask::spawn_jittered(
            "jittered",
            Duration::from_secs(10),
            Duration::from_secs(1),
            &parent,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        // The first tick lands somewhere in [0, 1s)
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        task.shutdown().await;
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_task() {
        let parent = CancellationToken::new();
        let task = PeriodicTask::spawn("child", Duration::from_secs(60), &parent, || async {});
        parent.cancel();
        assert!(!task.is_running());
        task.shutdown().await;
    }
}
