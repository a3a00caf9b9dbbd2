// Interval-driven cycle scheduler.
//
// One task per process fires runCycle at the configured cadence and
// persists the ledger snapshot on its own slower ticker. Cycles never
// overlap: the loop awaits each run and the controller carries its own
// process-local flag besides.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hybrid::HybridController;

pub struct CycleScheduler {
    controller: Arc<HybridController>,
    interval: Duration,
    snapshot_interval: Duration,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CycleScheduler {
    pub fn new(
        controller: Arc<HybridController>,
        interval: Duration,
        snapshot_interval: Duration,
    ) -> Self {
        Self {
            controller,
            interval,
            snapshot_interval,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Cancellation handle passed down into every cycle.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start the interval loop. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let controller = Arc::clone(&self.controller);
        let token = self.token.clone();
        let interval = self.interval;
        let snapshot_interval = self.snapshot_interval;

        *handle = Some(tokio::spawn(async move {
            let mut cycle_tick = tokio::time::interval(interval);
            cycle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut snapshot_tick = tokio::time::interval(snapshot_interval);
            snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(interval_secs = interval.as_secs(), "cycle scheduler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("cycle scheduler stopping");
                        break;
                    }
                    _ = cycle_tick.tick() => {
                        let outcome = controller.run_cycle(&token).await;
                        debug!(
                            success = outcome.success,
                            records = outcome.total_records,
                            ms = outcome.processing_ms,
                            "scheduled cycle finished"
                        );
                    }
                    _ = snapshot_tick.tick() => {
                        controller.new_flow().ledger().persist().await;
                    }
                }
            }
        }));
    }

    /// Stop the loop and persist a final ledger snapshot.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.controller.new_flow().ledger().persist().await;
        info!("cycle scheduler stopped");
    }
}
