use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// tokio の単調時計に追従する壁時計。
///
/// 生成時の `Utc::now()` を基点にし、以後の経過は [`Instant`] で測る。
/// 永続化した時刻から残り時間を求める処理が、一時停止した tokio の時計でも同じように動く。
#[derive(Debug, Clone, Copy)]
pub(crate) struct MonotonicClock {
    base: DateTime<Utc>,
    origin: Instant,
}

impl MonotonicClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::zero());
        self.base
            .checked_add_signed(elapsed)
            .unwrap_or(self.base)
    }

    /// `since` から数えて `budget` のうち残っている時間。使い切っていればゼロ。
    pub(crate) fn remaining(&self, since: DateTime<Utc>, budget: Duration) -> Duration {
        let age = (self.now() - since).to_std().unwrap_or_default();
        budget.saturating_sub(age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_the_tokio_clock() {
        let clock = MonotonicClock::new();
        let start = clock.now();

        tokio::time::advance(Duration::from_secs(90)).await;

        assert_eq!(clock.now() - start, TimeDelta::seconds(90));
        assert_eq!(
            clock.remaining(start, Duration::from_secs(300)),
            Duration::from_secs(210)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_zero() {
        let clock = MonotonicClock::new();
        let long_ago = clock.now() - TimeDelta::minutes(20);

        assert_eq!(clock.remaining(long_ago, Duration::from_secs(300)), Duration::ZERO);
        assert_eq!(
            clock.remaining(clock.now() + TimeDelta::seconds(5), Duration::from_secs(300)),
            Duration::from_secs(300)
        );
    }
}
