//! slotsched-scheduler: Session scheduler for slotsched
//!
//! This crate provides the scheduling side of slotsched:
//! - Device slot allocation maps (discrete and fractional)
//! - Per-agent allocation across several maps
//! - Scheduling policies (FIFO, LIFO, DRF, MOF)
//! - Predicates and the per-tick dispatcher
//! - The async scheduling loop

pub mod agent;
pub mod alloc_map;
pub mod dispatcher;
pub mod policy;
pub mod predicates;
pub mod runner;

pub use agent::AgentAllocator;
pub use alloc_map::{
    build_alloc_map, AllocMap, AllocMapState, AllocateOptions, DiscretePropertyAllocMap,
    FractionAllocMap,
};
pub use dispatcher::{
    Cancellation, Dispatcher, KernelPlacement, PendingUpdate, ScheduleDecision, TickOutcome,
};
pub use policy::{load_scheduler, FifoConfig, Scheduler};
pub use runner::{InMemoryRepository, SchedulerLoop, SchedulingRepository, ScalingGroupSnapshot};
