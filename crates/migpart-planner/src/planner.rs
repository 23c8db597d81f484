//! Plan computation

use migpart_core::{IdSet, NumaPolicy, Partition, PartitionError, PartitionResult, Plan, Topology};
use tracing::{debug, info, warn};

use crate::placement::{placement_for, split_cpus, MemoryPlacement};
use crate::slice_allocator::SliceAllocator;

/// Memory node every partition uses when NUMA layout is unknown
const IMPLICIT_NODE: u32 = 0;

/// Computes deterministic partition plans
pub struct Planner {
    placement: Box<dyn MemoryPlacement>,
}

impl Planner {
    /// Create a planner using the given memory node policy
    pub fn new(policy: NumaPolicy) -> Self {
        Self {
            placement: placement_for(policy),
        }
    }

    /// Plan `requested` partitions over `topology`.
    ///
    /// The effective count is capped at the number of GPU slices; a capped
    /// plan is logged, not rejected. The same inputs always give the same plan.
    pub fn plan(&self, topology: &Topology, requested: u32) -> PartitionResult<Plan> {
        let allocator = SliceAllocator::new(&topology.gpu_slices)?;
        if requested == 0 {
            return Err(PartitionError::InsufficientResources {
                resource: "partitions",
                available: allocator.total_count(),
                requested: 0,
                hint: "request at least one partition",
            });
        }
        let count = (requested as usize).min(allocator.total_count());

        if count == 0 {
            return Err(PartitionError::InsufficientResources {
                resource: "GPU slices",
                available: 0,
                requested: requested as usize,
                hint: "create MIG compute instances first",
            });
        }
        if count < requested as usize {
            warn!(
                requested = requested,
                effective = count,
                "Only {} GPU slices instantiated, {} requested; planning {} partitions",
                count,
                requested,
                count
            );
        }
        if topology.cpu_ids.len() < count {
            return Err(PartitionError::InsufficientResources {
                resource: "CPUs",
                available: topology.cpu_ids.len(),
                requested: count,
                hint: "request fewer partitions or widen the cpuset of the enclosing cgroup",
            });
        }

        let slices = allocator.assign(count)?;
        let cpu_ranges = split_cpus(&topology.cpu_ids, count);
        if topology.cpu_ids.is_contiguous() {
            debug_assert!(cpu_ranges.iter().all(IdSet::is_contiguous));
        } else {
            debug!(
                cpus = %topology.cpu_ids,
                "CPU ids have holes, partition ranges follow ascending id order"
            );
        }

        let partitions: Vec<Partition> = cpu_ranges
            .into_iter()
            .zip(slices)
            .enumerate()
            .map(|(i, (cpu_range, gpu_slice))| {
                let mem_nodes = if topology.has_numa() {
                    self.placement.place(i, &cpu_range, &topology.numa_nodes)
                } else {
                    std::iter::once(IMPLICIT_NODE).collect::<IdSet>()
                };
                Partition {
                    index: i as u32,
                    cpu_range,
                    mem_nodes,
                    gpu_slice,
                }
            })
            .collect();

        let plan = Plan {
            requested,
            partitions,
        };
        plan.validate()?;

        info!(
            requested = requested,
            partitions = plan.len(),
            cpus = topology.cpu_ids.len(),
            "Plan computed"
        );

        Ok(plan)
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(NumaPolicy::RoundRobin)
    }
}

/// Plan with the default round-robin memory node policy
pub fn plan(topology: &Topology, requested: u32) -> PartitionResult<Plan> {
    Planner::default().plan(topology, requested)
}
