//! CLI commands implementation

use anyhow::{Context, Result};
use migpart_core::{slice_source, MigpartConfig, Partition, SliceSource, TopologyReader};
use migpart_launcher::{LaunchRequest, ProcessIsolation, ProcessLauncher};
use migpart_planner::Planner;
use migpart_store::{render_slice_unit, slice_unit_name, CgroupStore, StoredPartition};
use std::sync::Arc;

/// Open the partition store.
///
/// Read-only commands skip the root requirement; they only need the
/// hierarchy to be mounted.
fn open_store(config: &MigpartConfig, write: bool) -> Result<CgroupStore> {
    let mut cgroup = config.cgroup.clone();
    if !write {
        cgroup.require_root = false;
    }
    Ok(CgroupStore::new(&cgroup, &config.state)?)
}

fn print_partitions(partitions: &[Partition]) {
    println!("{:<6} {:<24} {:<10} {}", "INDEX", "CPUS", "MEMS", "GPU SLICE");
    println!("{}", "-".repeat(80));
    for p in partitions {
        println!(
            "{:<6} {:<24} {:<10} {}",
            p.index,
            p.cpu_range.to_string(),
            p.mem_nodes.to_string(),
            p.gpu_slice
        );
    }
}

/// Plan partitions and persist them
pub async fn setup(config: &MigpartConfig, count: u32, dry_run: bool) -> Result<i32> {
    let source = slice_source(&config.gpu);
    let topology = TopologyReader::from_config(config).read(source.as_ref())?;
    let plan = Planner::new(config.topology.numa_policy).plan(&topology, count)?;

    if plan.len() < count as usize {
        eprintln!(
            "Warning: {} partitions requested, only {} GPU slices available; planned {}",
            count,
            topology.gpu_slices.len(),
            plan.len()
        );
    }

    print_partitions(&plan.partitions);

    if dry_run {
        println!();
        println!("Dry run, nothing written");
        return Ok(0);
    }

    let store = open_store(config, true)?;
    store.persist(&plan).await?;

    println!();
    println!("{} partitions persisted", plan.len());
    Ok(0)
}

/// Run a command inside a partition
pub async fn launch(
    config: &MigpartConfig,
    index: u32,
    user: Option<String>,
    detach: bool,
    command: String,
    args: Vec<String>,
) -> Result<i32> {
    let store = open_store(config, true)?;
    let slices: Arc<dyn SliceSource> = Arc::from(slice_source(&config.gpu));
    let launcher = ProcessLauncher::new(Arc::new(store), slices, config.launch.clone());

    let mut request = LaunchRequest::new(index, command).args(args).detached(detach);
    if let Some(user) = user {
        request = request.run_as(user);
    }

    let outcome = launcher.launch(request).await?;

    if let Some(e) = &outcome.attach_error {
        eprintln!("Warning: {}", e);
        eprintln!("Warning: CPU affinity and GPU visibility are applied, memory-node binding is not");
    }

    match outcome.exit_code {
        Some(code) => Ok(code),
        None => {
            println!(
                "Partition {}: pid {} running on GPU slice {}",
                index, outcome.record.pid, outcome.gpu_slice
            );
            Ok(0)
        }
    }
}

/// List persisted partitions
pub async fn list(config: &MigpartConfig, json: bool) -> Result<i32> {
    let store = open_store(config, false)?;
    let entries = store.list().await?;

    if json {
        let present: Vec<&Partition> = entries
            .iter()
            .filter_map(|e| match e {
                StoredPartition::Present(p) => Some(p),
                StoredPartition::Absent { .. } => None,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&present)?);
        return Ok(0);
    }

    if entries.is_empty() {
        println!("No partitions persisted");
        return Ok(0);
    }

    let mut present = Vec::new();
    for entry in entries {
        match entry {
            StoredPartition::Present(p) => present.push(p),
            StoredPartition::Absent { index, reason } => {
                eprintln!("Partition {} unavailable: {}", index, reason);
            }
        }
    }
    print_partitions(&present);
    Ok(0)
}

/// Show the discovered host topology
pub async fn topology(config: &MigpartConfig, json: bool) -> Result<i32> {
    let source = slice_source(&config.gpu);
    let topology = TopologyReader::from_config(config).read(source.as_ref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&topology)?);
        return Ok(0);
    }

    println!("CPUs: {} ({})", topology.cpu_ids, topology.cpu_ids.len());
    if topology.has_numa() {
        println!("NUMA nodes:");
        for node in &topology.numa_nodes {
            println!("  node{}: {}", node.id, node.cpus);
        }
    } else {
        println!("NUMA nodes: unknown, node 0 assumed");
    }
    println!("GPU slices ({}):", source.name());
    if topology.gpu_slices.is_empty() {
        println!("  none instantiated");
    }
    for (i, slice) in topology.gpu_slices.iter().enumerate() {
        println!("  {}: {}", i, slice);
    }
    Ok(0)
}

/// Check a running process against partition `index`
pub async fn check(config: &MigpartConfig, index: u32, pid: u32) -> Result<i32> {
    let store = Arc::new(open_store(config, false)?);
    let cgroup_path = store.cgroup_path(index);
    let slices: Arc<dyn SliceSource> = Arc::from(slice_source(&config.gpu));
    let launcher = ProcessLauncher::new(store, slices, config.launch.clone());

    let resolved = launcher.resolve(index).await?;
    let isolation = ProcessIsolation::inspect(pid, &config.launch.visibility_env)
        .with_context(|| format!("inspecting pid {}", pid))?;

    let findings = isolation.verify(&resolved.partition, &cgroup_path, &resolved.gpu_slice);
    if findings.is_empty() {
        println!("pid {} is confined to partition {}", pid, index);
        return Ok(0);
    }

    println!("pid {} deviates from partition {}:", pid, index);
    for finding in &findings {
        println!("  - {}", finding);
    }
    Ok(1)
}

/// Print a systemd slice unit for partition `index`
pub async fn slice_unit(config: &MigpartConfig, index: u32) -> Result<i32> {
    let store = open_store(config, false)?;
    let partition = store.load(index).await?.into_partition()?;

    println!("# {}", slice_unit_name(index));
    print!("{}", render_slice_unit(&partition));
    Ok(0)
}

/// Remove every partition group
pub async fn teardown(config: &MigpartConfig) -> Result<i32> {
    let store = open_store(config, true)?;
    store.teardown().await?;
    println!("Partition groups removed");
    Ok(0)
}
