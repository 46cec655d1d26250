// src/engine/mod.rs

//! The synthetic trade loop and its metrics.

pub mod metrics;
pub mod scheduler;

pub use metrics::{FlashSettings, MetricsAggregator, ThroughputSample};
pub use scheduler::{jittered_profit, ThroughputScheduler, WindowQuota, WindowReport};

use crate::models::SharedState;
use crate::simulation::ThreadRandom;
use log::info;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Length of one throughput window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Trade loop parameters.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub target_tps: u64,
    pub batch_size: u64,
    pub flash: FlashSettings,
}

/// Owns the scheduler and the metrics aggregator until they are spawned.
pub struct Engine {
    scheduler: ThroughputScheduler,
    metrics: MetricsAggregator,
}

/// Background tasks started by `Engine::spawn`.
pub struct EngineHandles {
    pub scheduler: JoinHandle<()>,
    pub flash: JoinHandle<()>,
}

impl EngineHandles {
    pub fn abort(&self) {
        self.scheduler.abort();
        self.flash.abort();
    }
}

impl Engine {
    pub fn new(state: SharedState, settings: EngineSettings) -> Self {
        let metrics = MetricsAggregator::new(state.clone(), settings.flash);
        let scheduler = ThroughputScheduler::new(
            state,
            settings.target_tps,
            settings.batch_size,
            WINDOW,
            Box::new(ThreadRandom::new()),
        );
        Self { scheduler, metrics }
    }

    /// Handle for on-demand flash credits and sampling.
    pub fn metrics(&self) -> MetricsAggregator {
        self.metrics.clone()
    }

    /// Starts the trade loop and the flash timer on the current runtime.
    pub fn spawn(self) -> EngineHandles {
        info!(
            "Engine: {} trades/sec target, flash every {:?}",
            self.scheduler.target(),
            self.metrics.flash_settings().interval
        );

        let flash = tokio::spawn(self.metrics.clone().run_flash_loop(Box::new(ThreadRandom::new())));
        let scheduler = tokio::spawn(self.scheduler.run(self.metrics));
        EngineHandles { scheduler, flash }
    }
}
