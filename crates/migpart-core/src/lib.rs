//! migpart-core: Core types and host discovery for migpart
//!
//! This crate provides the fundamental types used throughout migpart:
//! - Topology, partition and plan definitions
//! - CPU / memory-node id sets in kernel list format
//! - Launch records and their state machine
//! - Configuration types
//! - Error handling
//! - Topology discovery (sysfs, cgroup scope, GPU compute slices)

pub mod config;
pub mod error;
pub mod gpu;
pub mod idset;
pub mod model;
pub mod topology;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use idset::IdSet;
pub use model::*;
pub use topology::*;
