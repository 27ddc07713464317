//! Connectivity polling

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::scheduler::SchedulerHandle;
use crate::store::StatementBackend;

/// Polls a backend's availability and reports transitions to the scheduler.
#[derive(Debug)]
pub struct NetworkWatcher<B> {
    backend: B,
    interval: Duration,
    scheduler: SchedulerHandle,
}

impl<B: StatementBackend + 'static> NetworkWatcher<B> {
    pub const fn new(backend: B, interval: Duration, scheduler: SchedulerHandle) -> Self {
        Self {
            backend,
            interval,
            scheduler,
        }
    }

    /// Poll until the scheduler shuts down. The first check is always reported.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = None;

        loop {
            ticker.tick().await;
            if self.scheduler.is_closed() {
                break;
            }

            let online = self.backend.is_available().await;
            if last == Some(online) {
                continue;
            }
            last = Some(online);

            tracing::debug!(online, "Connectivity changed");
            if online {
                self.scheduler.on_connectivity_restored();
            } else {
                self.scheduler.on_connectivity_lost();
            }
        }
    }
}
