//! Periodic tick messages for controllers.

use std::time::Duration;

use ractor::{ActorRef, Message};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Handle for stopping a periodic timer. Dropping it stops the timer too.
#[derive(Debug)]
pub struct TimerHandle {
    stop_tx: watch::Sender<bool>,
}

impl TimerHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Send `make_msg()` to `target` every `interval`, starting one interval from now.
///
/// Returns `None` for a zero interval; such a timer is disabled.
pub fn start_periodic<M, F>(target: ActorRef<M>, interval: Duration, make_msg: F) -> Option<TimerHandle>
where
    M: Message,
    F: Fn() -> M + Send + 'static,
{
    if interval.is_zero() {
        return None;
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let start = Instant::now()
        .checked_add(interval)
        .unwrap_or_else(Instant::now);
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if target.send_message(make_msg()).is_err() {
                        break;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    Some(TimerHandle { stop_tx })
}

/// Tick period that checks a timeout often enough to fire close to it.
#[must_use]
pub fn check_interval(timeout: Duration) -> Duration {
    timeout.checked_div(2).unwrap_or(timeout)
}
