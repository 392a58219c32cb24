use std::sync::Arc;

use tracing::info;

use blockscript_core::SystemClock;
use blockscript_events::{BusConfig, EventBus, ScheduledTask};

use crate::error::RuntimeResult;
use crate::scheduler::{ThreadScheduler, ThreadSchedulerConfig};

/// An event bus on the system clock, backed by a [`ThreadScheduler`], with
/// the correlation sweep already running.
pub struct Runtime {
    bus: Arc<EventBus>,
    scheduler: Arc<ThreadScheduler>,
    sweep: ScheduledTask,
}

impl Runtime {
    pub fn start(config: BusConfig) -> RuntimeResult<Self> {
        Self::start_with(config, ThreadSchedulerConfig::default())
    }

    pub fn start_with(
        config: BusConfig,
        scheduler_config: ThreadSchedulerConfig,
    ) -> RuntimeResult<Self> {
        let scheduler = Arc::new(ThreadScheduler::spawn(scheduler_config)?);
        let bus = EventBus::new(config, Arc::new(SystemClock), scheduler.clone());
        let sweep = bus.start_correlation_sweep();
        info!(
            scheduler = %scheduler.name(),
            history_capacity = bus.config().history_capacity,
            max_dispatch_depth = bus.config().max_dispatch_depth,
            "runtime started"
        );
        Ok(Self {
            bus,
            scheduler,
            sweep,
        })
    }

    /// Start with [`BusConfig::from_env`].
    pub fn from_env() -> RuntimeResult<Self> {
        Self::start(BusConfig::from_env())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<ThreadScheduler> {
        &self.scheduler
    }

    /// Stop the sweep and the scheduler thread. Pending delayed work is dropped.
    pub fn shutdown(self) -> RuntimeResult<()> {
        self.sweep.cancel();
        self.scheduler.shutdown()?;
        info!("runtime stopped");
        Ok(())
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("bus", &self.bus)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
