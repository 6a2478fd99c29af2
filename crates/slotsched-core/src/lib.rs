//! slotsched-core: Core types for the slotsched session scheduler
//!
//! This crate provides the fundamental types shared by the scheduler and CLI:
//! - Resource slots with exact decimal arithmetic
//! - Device slot descriptions and allocation strategies
//! - Session, kernel and agent snapshots
//! - Configuration types
//! - Error handling

pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod slot;

pub use config::*;
pub use device::*;
pub use error::*;
pub use session::*;
pub use slot::*;
