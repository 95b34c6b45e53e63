use tokio::time::{self, Duration, Interval};

/// Drives `Manager::on_tick` at `auto_update_rate`. A thin wrapper around
/// `tokio::time::interval` so tests can swap in `tokio::time::pause()` and
/// drive ticks deterministically without sleeping real wall-clock time.
pub struct Ticker {
    interval: Interval,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        Ticker { interval }
    }

    pub async fn tick(&mut self) -> tokio::time::Instant {
        self.interval.tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_advance_with_virtual_time() {
        let mut ticker = Ticker::new(Duration::from_millis(50));
        ticker.tick().await;
        let before = tokio::time::Instant::now();
        time::advance(Duration::from_millis(50)).await;
        let after = ticker.tick().await;
        assert!(after >= before);
    }
}
