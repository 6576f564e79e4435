//! ==============================================================================
//! scheduler.rs - fixed-cadence detection cycles
//! ==============================================================================
//!
//! purpose:
//!     runs a detection + dispatch cycle every `interval`, after an initial
//!     `first_delay`, independent of how fast readings arrive.
//!
//! overlap:
//!     the cycle is awaited inline in the loop, so cycle k+1 cannot start
//!     before cycle k has finished dispatching. ticks missed while a cycle
//!     overruns are delayed (MissedTickBehavior::Delay), never burst.
//!
//! ==============================================================================

use crate::pipeline::Pipeline;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub struct Scheduler {
    pipeline: Pipeline,
    interval: Duration,
    first_delay: Duration,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, interval: Duration, first_delay: Duration) -> Self {
        Self { pipeline, interval, first_delay }
    }

    pub async fn run(self) {
        tracing::info!(
            interval_s = self.interval.as_secs(),
            first_delay_s = self.first_delay.as_secs(),
            "[SCHEDULER] Started"
        );
        tokio::time::sleep(self.first_delay).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.pipeline.run_cycle().await {
                Ok(summary) => tracing::info!(
                    triggered = summary.triggered,
                    delivered = summary.delivered,
                    failed = summary.failed,
                    registry_error = summary.registry_error.as_deref(),
                    "[SCHEDULER] Cycle complete"
                ),
                // the store may recover; try again next tick
                Err(e) => tracing::error!(error = %e, "[SCHEDULER] Cycle failed"),
            }
        }
    }
}
