//! `blockscript-core`: shared building blocks for the trigger subsystem.
//!
//! This crate has no knowledge of events or dispatch; it only provides the
//! identifiers and the time source every other crate agrees on.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{ActorId, HandlerId, InstanceId, PatternId, ScopeId, TriggerId};
