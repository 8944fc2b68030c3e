use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Stop handle for one recurring callback.
///
/// Dropping the handle does not stop the timer; it ends when
/// [`stop`](Self::stop) is called or when the owning session is torn down.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs `callback` every `period` until `token` is cancelled. The first
/// call happens one period after registration.
pub(crate) fn spawn_interval<F>(
    user_id: String,
    period: Duration,
    token: CancellationToken,
    mut callback: F,
) -> TimerHandle
where
    F: FnMut() + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    let task_token = token.clone();

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => callback(),
            }
        }
        tracing::debug!(user_id = %user_id, "session timer stopped");
    });

    TimerHandle { token }
}
