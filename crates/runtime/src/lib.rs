//! `blockscript-runtime`: host wiring for the event subsystem.
//!
//! - [`ThreadScheduler`]: a background timer thread implementing the events
//!   crate's `Scheduler` boundary
//! - [`Runtime`]: a bus on the system clock with the correlation sweep running

pub mod error;
pub mod runtime;
pub mod scheduler;

pub use error::{RuntimeError, RuntimeResult};
pub use runtime::Runtime;
pub use scheduler::{SchedulerStats, ThreadScheduler, ThreadSchedulerConfig};
