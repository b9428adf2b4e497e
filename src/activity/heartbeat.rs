use std::sync::Arc;

use prometheus::Counter;
use tokio::sync::watch;
use tracing::trace;

/// 実行中のアクティビティが生存を知らせるためのハンドル。
///
/// 監視側は [`watch::Receiver`] で通知を受け、一定時間通知がなければ試行を打ち切る。
#[derive(Debug, Clone)]
pub struct Heartbeat {
    beats: Arc<watch::Sender<u64>>,
    counter: Option<Counter>,
}

impl Heartbeat {
    #[must_use]
    pub fn channel(counter: Option<Counter>) -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (
            Self {
                beats: Arc::new(tx),
                counter,
            },
            rx,
        )
    }

    pub fn beat(&self, detail: &str) {
        self.beats.send_modify(|count| *count = count.wrapping_add(1));
        if let Some(counter) = &self.counter {
            counter.inc();
        }
        trace!(detail, "heartbeat");
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        *self.beats.borrow()
    }
}
