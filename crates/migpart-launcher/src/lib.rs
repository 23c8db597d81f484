//! migpart-launcher: Partition-confined workload launcher
//!
//! This crate starts workloads inside a persisted partition:
//! - CPU affinity applied in the exec path
//! - GPU visibility scoped to the partition's slice
//! - Optional privilege drop
//! - Bounded-retry attachment to the partition's isolation group
//! - Inspection of a running process's effective isolation

pub mod attach;
pub mod inspect;
pub mod process;
pub mod traits;
pub mod user;

pub use attach::AttachPolicy;
pub use inspect::{Finding, ProcessIsolation};
pub use process::{LaunchOutcome, LaunchRequest, ProcessLauncher, ResolvedPartition};
pub use traits::PartitionRegistry;
pub use user::{lookup_user, UserIdentity};
