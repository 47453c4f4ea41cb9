//! Vote & Election (C2) and Application Lifecycle Engine (C3) plus
//! Capacity Accounting (C4).
//!
//! Grounded on `convex-engine`'s shape: a builder-constructed
//! long-lived [`lifecycle::Engine`] that spawns one task per tracked
//! entity (here, per in-flight Application, mirroring
//! `convex_engine::scheduler::IntervalScheduler`'s per-node interval
//! tasks), with the election and capacity concerns split into their
//! own modules the way the teacher splits pricing, scheduling, and
//! risk into separate files under one crate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod capacity;
pub mod election;
pub mod error;
pub mod lifecycle;

pub mod prelude {
    //! Convenience re-exports for downstream crates.
    pub use crate::capacity::{node_local_slots, RemoteCapacityCache};
    pub use crate::election::{Election, ElectionConfig, ElectionOutcome};
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::lifecycle::{DeferredApplicationStates, Engine, EngineBuilder, EngineConfig};
}
