//! migpart-planner: Partition planning for migpart
//!
//! This crate turns a host topology and a partition count into a plan:
//! - CPU distribution (contiguous ranges, remainder to the lowest indices)
//! - Memory node placement
//! - GPU slice assignment

pub mod placement;
pub mod planner;
pub mod slice_allocator;

pub use placement::{split_cpus, LocalPlacement, MemoryPlacement, RoundRobinPlacement};
pub use planner::{plan, Planner};
pub use slice_allocator::SliceAllocator;
