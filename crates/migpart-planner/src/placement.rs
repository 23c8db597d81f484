//! CPU distribution and memory node placement

use migpart_core::{IdSet, NumaNode, NumaPolicy};

/// Split `cpu_ids` into `count` runs taken in ascending order.
///
/// With `total = len(cpu_ids)`, the first `total % count` runs get
/// `total / count + 1` CPUs and the rest get `total / count`.
/// `count` must be non-zero and no larger than `cpu_ids.len()`.
pub fn split_cpus(cpu_ids: &IdSet, count: usize) -> Vec<IdSet> {
    debug_assert!(count > 0 && count <= cpu_ids.len());

    let base = cpu_ids.len() / count;
    let rem = cpu_ids.len() % count;
    let mut cpus = cpu_ids.iter();

    (0..count)
        .map(|i| {
            let take = if i < rem { base + 1 } else { base };
            cpus.by_ref().take(take).collect()
        })
        .collect()
}

/// Strategy for choosing a partition's memory nodes
pub trait MemoryPlacement: Send + Sync {
    /// Memory nodes for partition `index` owning `cpus`.
    /// `nodes` is never empty.
    fn place(&self, index: usize, cpus: &IdSet, nodes: &[NumaNode]) -> IdSet;
}

/// Partition `i` gets node `i % node_count`
pub struct RoundRobinPlacement;

impl MemoryPlacement for RoundRobinPlacement {
    fn place(&self, index: usize, _cpus: &IdSet, nodes: &[NumaNode]) -> IdSet {
        std::iter::once(nodes[index % nodes.len()].id).collect()
    }
}

/// Partition gets the node holding most of its CPUs; ties go to the lower node id
pub struct LocalPlacement;

impl MemoryPlacement for LocalPlacement {
    fn place(&self, index: usize, cpus: &IdSet, nodes: &[NumaNode]) -> IdSet {
        let mut best: Option<(usize, u32)> = None;
        for node in nodes {
            let overlap = node.cpus.intersection(cpus).len();
            if overlap > 0 && best.map_or(true, |(count, _)| overlap > count) {
                best = Some((overlap, node.id));
            }
        }
        match best {
            Some((_, id)) => std::iter::once(id).collect(),
            None => RoundRobinPlacement.place(index, cpus, nodes),
        }
    }
}

/// Placement strategy for a configured policy
pub fn placement_for(policy: NumaPolicy) -> Box<dyn MemoryPlacement> {
    match policy {
        NumaPolicy::RoundRobin => Box::new(RoundRobinPlacement),
        NumaPolicy::Local => Box::new(LocalPlacement),
    }
}
