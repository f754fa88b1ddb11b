use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

enum TimerState {
    /// Nothing pending; the dispatcher may arm the timer.
    Disarmed,
    /// A sleeper task is running and will signal when the delay elapses.
    Armed(oneshot::Receiver<()>),
    /// The delay elapsed and a round has been requested. Stays here until the
    /// round it started has finished.
    Expired,
}

/// One-shot round timer used by the coordinator. Each arm spawns a short lived
/// task that sleeps for the snapshot delay, and the timer stays expired until
/// it is explicitly disarmed again after the requested round completes.
pub struct SnapshotTimer {
    delay: Duration,
    state: TimerState,
}

impl SnapshotTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: TimerState::Disarmed,
        }
    }

    /// Starts the countdown if nothing is pending. Returns whether it did.
    pub fn arm(&mut self) -> bool {
        if !matches!(self.state, TimerState::Disarmed) {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
        trace!("snapshot timer armed for {:?}", delay);
        self.state = TimerState::Armed(rx);
        true
    }

    #[cfg(test)]
    pub(crate) fn is_disarmed(&self) -> bool {
        matches!(self.state, TimerState::Disarmed)
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        matches!(self.state, TimerState::Armed(_))
    }

    /// Whether the delay has elapsed and a round is being requested.
    pub fn is_expired(&self) -> bool {
        matches!(self.state, TimerState::Expired)
    }

    /// Allows the timer to be armed again.
    pub fn disarm(&mut self) {
        self.state = TimerState::Disarmed;
    }

    /// Resolves once an armed timer expires and never otherwise, so it can sit
    /// in a `select!` unconditionally. Cancel safe.
    pub async fn expired(&mut self) {
        if let TimerState::Armed(rx) = &mut self.state {
            let _ = rx.await;
        } else {
            std::future::pending::<()>().await;
        }
        trace!("snapshot timer expired");
        self.state = TimerState::Expired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_once_after_delay() {
        let mut timer = SnapshotTimer::new(Duration::from_millis(100));
        assert!(timer.arm());
        assert!(!timer.arm());
        assert!(timer.is_armed());

        let started = tokio::time::Instant::now();
        timer.expired().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(timer.is_expired());

        // stays expired until disarmed, even though nothing is pending
        assert!(!timer.arm());
        timer.disarm();
        assert!(timer.arm());
    }

    #[tokio::test(start_paused = true)]
    async fn never_resolves_when_not_armed() {
        let mut timer = SnapshotTimer::new(Duration::from_millis(10));
        let result =
            tokio::time::timeout(Duration::from_secs(5), timer.expired()).await;
        assert!(result.is_err());
        assert!(timer.is_disarmed());
    }
}
