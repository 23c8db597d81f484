//! migpart-store: Partition persistence
//!
//! This crate provides the persisted side of a plan:
//! - One cgroup v2 group per partition (cpuset.mems / cpuset.cpus / cgroup.procs)
//! - A plan manifest marking which plan is complete
//! - systemd slice units for supervisors that apply the plan themselves

pub mod cgroup;
pub mod manifest;
pub mod systemd;

pub use cgroup::{CgroupStore, StoredPartition};
pub use manifest::PlanManifest;
pub use systemd::{render_slice_unit, slice_unit_name};
