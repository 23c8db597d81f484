//! Host topology discovery

use crate::{IdSet, MigpartConfig, NumaNode, PartitionError, PartitionResult, SliceSource, Topology};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reads CPUs, NUMA nodes and GPU slices from the host
#[derive(Debug, Clone)]
pub struct TopologyReader {
    /// cgroup v2 mount; its effective cpuset bounds the usable CPUs
    cgroup_root: PathBuf,
    /// sysfs mount
    sysfs_root: PathBuf,
}

impl TopologyReader {
    pub fn new(cgroup_root: impl Into<PathBuf>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            sysfs_root: sysfs_root.into(),
        }
    }

    pub fn from_config(config: &MigpartConfig) -> Self {
        Self::new(&config.cgroup.root, &config.topology.sysfs_root)
    }

    /// Take a fresh snapshot of host resources
    pub fn read(&self, slices: &dyn SliceSource) -> PartitionResult<Topology> {
        let cpu_ids = self.read_cpus()?;
        let numa_nodes = match self.read_numa(&cpu_ids) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "NUMA discovery failed, using a single implicit node");
                Vec::new()
            }
        };
        let gpu_slices = slices.list_slices()?;

        info!(
            cpus = %cpu_ids,
            numa_nodes = numa_nodes.len(),
            gpu_slices = gpu_slices.len(),
            source = slices.name(),
            "Topology read"
        );

        Ok(Topology {
            cpu_ids,
            numa_nodes,
            gpu_slices,
        })
    }

    /// CPUs of the enclosing scope, falling back to every online CPU
    fn read_cpus(&self) -> PartitionResult<IdSet> {
        let scoped = self.cgroup_root.join("cpuset.cpus.effective");
        let online = self.sysfs_root.join("devices/system/cpu/online");

        for path in [&scoped, &online] {
            match read_id_list(path) {
                Ok(cpus) if !cpus.is_empty() => {
                    debug!(path = %path.display(), cpus = %cpus, "Read CPU list");
                    return Ok(cpus);
                }
                Ok(_) => debug!(path = %path.display(), "CPU list empty"),
                Err(e) => debug!(path = %path.display(), error = %e, "CPU list unreadable"),
            }
        }

        Err(PartitionError::Topology(format!(
            "no CPUs found in {} or {}; check that sysfs and cgroup2 are mounted",
            scoped.display(),
            online.display()
        )))
    }

    /// NUMA nodes with their CPUs restricted to `cpu_ids`
    fn read_numa(&self, cpu_ids: &IdSet) -> PartitionResult<Vec<NumaNode>> {
        let node_dir = self.sysfs_root.join("devices/system/node");
        let mut nodes = Vec::new();

        for entry in fs::read_dir(&node_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let cpus = read_id_list(&entry.path().join("cpulist"))?.intersection(cpu_ids);
            if cpus.is_empty() {
                debug!(node = id, "Skipping NUMA node without usable CPUs");
                continue;
            }
            nodes.push(NumaNode { id, cpus });
        }

        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }
}

fn read_id_list(path: &Path) -> PartitionResult<IdSet> {
    fs::read_to_string(path)?.parse()
}
