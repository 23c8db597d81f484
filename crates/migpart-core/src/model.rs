//! Topology, Partition, Plan and LaunchRecord type definitions

use crate::{IdSet, PartitionError, PartitionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A NUMA node and the CPUs local to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNode {
    /// Node id as numbered by the kernel
    pub id: u32,
    /// CPUs local to this node
    pub cpus: IdSet,
}

/// Immutable snapshot of host resources at plan time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Logical CPUs available to the allocator
    pub cpu_ids: IdSet,
    /// NUMA nodes in ascending id order; empty when undiscoverable
    pub numa_nodes: Vec<NumaNode>,
    /// GPU compute slice identifiers, in the order the device reports them
    pub gpu_slices: Vec<String>,
}

impl Topology {
    /// Whether NUMA layout was discovered
    pub fn has_numa(&self) -> bool {
        !self.numa_nodes.is_empty()
    }
}

/// One row of the allocation plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Stable, human-facing partition number
    pub index: u32,
    /// CPUs owned exclusively by this partition
    pub cpu_range: IdSet,
    /// NUMA nodes whose memory the partition may use
    pub mem_nodes: IdSet,
    /// GPU compute slice identifier
    pub gpu_slice: String,
}

/// Ordered allocation plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Partition count the caller asked for
    pub requested: u32,
    /// Planned partitions, indexed `0..len`
    pub partitions: Vec<Partition>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&Partition> {
        self.partitions.get(index as usize)
    }

    /// Union of every partition's CPUs
    pub fn cpu_union(&self) -> IdSet {
        self.partitions
            .iter()
            .flat_map(|p| p.cpu_range.iter())
            .collect()
    }

    /// Check index continuity, CPU disjointness and GPU slice uniqueness
    pub fn validate(&self) -> PartitionResult<()> {
        let mut seen_cpus = IdSet::new();
        let mut seen_slices = HashSet::new();

        for (position, partition) in self.partitions.iter().enumerate() {
            if partition.index as usize != position {
                return Err(PartitionError::InvalidPlan(format!(
                    "partition at position {} has index {}",
                    position, partition.index
                )));
            }
            if partition.cpu_range.is_empty() {
                return Err(PartitionError::InvalidPlan(format!(
                    "partition {} has no CPUs",
                    partition.index
                )));
            }
            if partition.mem_nodes.is_empty() {
                return Err(PartitionError::InvalidPlan(format!(
                    "partition {} has no memory nodes",
                    partition.index
                )));
            }
            if !seen_cpus.is_disjoint(&partition.cpu_range) {
                return Err(PartitionError::InvalidPlan(format!(
                    "partition {} shares CPUs {} with an earlier partition",
                    partition.index,
                    seen_cpus.intersection(&partition.cpu_range)
                )));
            }
            if !seen_slices.insert(partition.gpu_slice.as_str()) {
                return Err(PartitionError::InvalidPlan(format!(
                    "GPU slice {} assigned to more than one partition",
                    partition.gpu_slice
                )));
            }
            for cpu in partition.cpu_range.iter() {
                seen_cpus.insert(cpu);
            }
        }

        Ok(())
    }
}

/// Per-launch state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    /// Child process created
    Spawned,
    /// CPU affinity applied in the exec path
    AffinitySet,
    /// Waiting to join the partition's group
    CgroupAttachPending,
    /// Child is a member of the partition's group
    CgroupAttached,
    /// Every attach attempt failed; child runs without the group
    CgroupAttachFailed,
    /// Child is running
    Running,
    /// Child exited with this code
    Exited(i32),
    /// Handed back to the caller without waiting
    Detached,
}

impl LaunchState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: LaunchState) -> bool {
        use LaunchState::*;
        matches!(
            (self, next),
            (Spawned, AffinitySet)
                | (AffinitySet, CgroupAttachPending)
                | (CgroupAttachPending, CgroupAttached)
                | (CgroupAttachPending, CgroupAttachFailed)
                | (CgroupAttached, Running)
                | (CgroupAttachFailed, Running)
                | (Running, Exited(_))
                | (Running, Detached)
        )
    }
}

impl std::fmt::Display for LaunchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchState::Spawned => write!(f, "Spawned"),
            LaunchState::AffinitySet => write!(f, "AffinitySet"),
            LaunchState::CgroupAttachPending => write!(f, "CgroupAttachPending"),
            LaunchState::CgroupAttached => write!(f, "CgroupAttached"),
            LaunchState::CgroupAttachFailed => write!(f, "CgroupAttachFailed"),
            LaunchState::Running => write!(f, "Running"),
            LaunchState::Exited(code) => write!(f, "Exited({})", code),
            LaunchState::Detached => write!(f, "Detached"),
        }
    }
}

/// Record of one launched workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRecord {
    /// Unique launch identifier
    pub id: Uuid,
    /// Partition the workload runs in
    pub partition_index: u32,
    /// Process id of the workload
    pub pid: u32,
    /// Spawn timestamp
    pub started_at: DateTime<Utc>,
    /// Current state
    pub state: LaunchState,
}

impl LaunchRecord {
    /// Create a record for a freshly spawned process
    pub fn new(partition_index: u32, pid: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            partition_index,
            pid,
            started_at: Utc::now(),
            state: LaunchState::Spawned,
        }
    }

    /// Advance the state machine
    pub fn advance(&mut self, next: LaunchState) -> PartitionResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(PartitionError::Internal(format!(
                "launch {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}
