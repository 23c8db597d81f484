//! cgroup v2 partition store
//!
//! Layout: `<root>/<group_root>/<prefix><index>/` with the partition's
//! `cpuset.mems`, `cpuset.cpus` and `cgroup.procs`.

use migpart_core::{
    CgroupConfig, IdSet, Partition, PartitionError, PartitionResult, Plan, StateConfig,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::manifest::PlanManifest;

const CONTROLLERS: &str = "cgroup.controllers";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";
const PROCS: &str = "cgroup.procs";
const CPUS: &str = "cpuset.cpus";
const MEMS: &str = "cpuset.mems";

/// Result of looking up one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPartition {
    /// Group and manifest entry both exist
    Present(Partition),
    /// Partition cannot be used; `reason` says what is missing
    Absent { index: u32, reason: String },
}

impl StoredPartition {
    pub fn index(&self) -> u32 {
        match self {
            StoredPartition::Present(p) => p.index,
            StoredPartition::Absent { index, .. } => *index,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, StoredPartition::Present(_))
    }

    /// The partition, or `UnknownPartition` naming what is missing
    pub fn into_partition(self) -> PartitionResult<Partition> {
        match self {
            StoredPartition::Present(p) => Ok(p),
            StoredPartition::Absent { index, reason } => {
                Err(PartitionError::UnknownPartition { index, reason })
            }
        }
    }
}

/// Control-file writes for one partition, in the order they must happen.
///
/// A new cpuset group rejects tasks and some kernels reject `cpuset.cpus`
/// until `cpuset.mems` is populated, so memory nodes go first.
pub fn control_writes(partition: &Partition) -> [(&'static str, String); 2] {
    [
        (MEMS, partition.mem_nodes.to_string()),
        (CPUS, partition.cpu_range.to_string()),
    ]
}

/// Partition store backed by a cgroup v2 hierarchy
pub struct CgroupStore {
    /// cgroup v2 mount point
    root: PathBuf,
    /// Directory holding every partition group
    group_root: PathBuf,
    /// `group_root` relative to the mount, as `/proc/<pid>/cgroup` shows it
    group_root_name: String,
    /// Group name prefix
    prefix: String,
    /// Plan manifest location
    manifest_path: PathBuf,
    /// Move existing members out before rewriting a group
    evict_on_persist: bool,
}

impl CgroupStore {
    /// Open the store.
    ///
    /// Fails with `PermissionDenied` when root is required and the caller is
    /// not root, and with `StoreUnavailable` when no cgroup v2 hierarchy is
    /// mounted at the configured root.
    pub fn new(cgroup: &CgroupConfig, state: &StateConfig) -> PartitionResult<Self> {
        if cgroup.require_root && !is_root() {
            return Err(PartitionError::PermissionDenied(format!(
                "writing isolation groups under {} requires root",
                cgroup.root.display()
            )));
        }
        if !cgroup.root.join(CONTROLLERS).exists() {
            return Err(PartitionError::StoreUnavailable {
                root: cgroup.root.clone(),
            });
        }

        Ok(Self {
            root: cgroup.root.clone(),
            group_root: cgroup.root.join(&cgroup.group_root),
            group_root_name: cgroup.group_root.trim_matches('/').to_string(),
            prefix: cgroup.group_prefix.clone(),
            manifest_path: state.manifest_path(),
            evict_on_persist: cgroup.evict_on_persist,
        })
    }

    /// Directory of partition `index`'s group
    pub fn group_path(&self, index: u32) -> PathBuf {
        self.group_root.join(format!("{}{}", self.prefix, index))
    }

    /// Path of partition `index`'s group relative to the mount (`/mig/mig0`)
    pub fn cgroup_path(&self, index: u32) -> String {
        format!("/{}/{}{}", self.group_root_name, self.prefix, index)
    }

    /// Persist every partition of `plan`.
    ///
    /// The manifest is dropped first and written last, so a failure part way
    /// leaves no plan marked complete. Re-persisting replaces each group's
    /// CPU and memory sets outright and removes groups beyond the plan.
    pub async fn persist(&self, plan: &Plan) -> PartitionResult<()> {
        plan.validate()?;
        PlanManifest::remove(&self.manifest_path).await?;

        self.enable_cpuset(&self.root).await?;
        tokio::fs::create_dir_all(&self.group_root).await?;
        self.enable_cpuset(&self.group_root).await?;

        for partition in &plan.partitions {
            let group = self.group_path(partition.index);
            tokio::fs::create_dir_all(&group).await?;

            if self.evict_on_persist {
                self.evict(partition.index, &group).await?;
            }

            for (file, value) in control_writes(partition) {
                write_control(&group.join(file), &value).await?;
            }

            debug!(
                partition = partition.index,
                group = %group.display(),
                cpus = %partition.cpu_range,
                mems = %partition.mem_nodes,
                "Group written"
            );
        }

        for index in self.group_indices().await? {
            if index as usize >= plan.len() {
                info!(partition = index, "Removing group from an earlier, larger plan");
                remove_group(&self.group_path(index)).await?;
            }
        }

        PlanManifest::new(plan.clone())
            .write(&self.manifest_path)
            .await?;

        info!(
            partitions = plan.len(),
            root = %self.group_root.display(),
            "Plan persisted"
        );
        Ok(())
    }

    /// Look up partition `index`
    pub async fn load(&self, index: u32) -> PartitionResult<StoredPartition> {
        let manifest = PlanManifest::read(&self.manifest_path).await?;
        self.load_with(manifest.as_ref(), index).await
    }

    /// Every partition of the persisted plan, present or not.
    ///
    /// Without a completed plan, any groups left by an interrupted setup are
    /// reported as absent.
    pub async fn list(&self) -> PartitionResult<Vec<StoredPartition>> {
        let manifest = PlanManifest::read(&self.manifest_path).await?;

        match manifest {
            Some(manifest) => {
                let mut entries = Vec::with_capacity(manifest.plan.len());
                for index in 0..manifest.plan.len() as u32 {
                    entries.push(self.load_with(Some(&manifest), index).await?);
                }
                Ok(entries)
            }
            None => Ok(self
                .group_indices()
                .await?
                .into_iter()
                .map(|index| StoredPartition::Absent {
                    index,
                    reason: "setup did not complete".to_string(),
                })
                .collect()),
        }
    }

    /// The persisted plan, if every partition is present
    pub async fn plan(&self) -> PartitionResult<Option<Plan>> {
        let Some(manifest) = PlanManifest::read(&self.manifest_path).await? else {
            return Ok(None);
        };
        let mut partitions = Vec::with_capacity(manifest.plan.len());
        for entry in self.list().await? {
            partitions.push(entry.into_partition()?);
        }
        Ok(Some(Plan {
            requested: manifest.plan.requested,
            partitions,
        }))
    }

    /// Add `pid` to partition `index`'s group
    pub async fn attach(&self, index: u32, pid: u32) -> PartitionResult<()> {
        let group = self.group_path(index);
        if !group.is_dir() {
            return Err(PartitionError::UnknownPartition {
                index,
                reason: format!("group {} is missing", group.display()),
            });
        }
        append_pid(&group.join(PROCS), pid).await
    }

    /// Process ids currently in partition `index`'s group
    pub async fn members(&self, index: u32) -> PartitionResult<Vec<u32>> {
        read_pids(&self.group_path(index).join(PROCS)).await
    }

    /// Remove every partition group and the manifest
    pub async fn teardown(&self) -> PartitionResult<()> {
        PlanManifest::remove(&self.manifest_path).await?;

        for index in self.group_indices().await? {
            remove_group(&self.group_path(index)).await?;
        }
        if self.group_root.is_dir() {
            remove_group(&self.group_root).await?;
        }

        info!(root = %self.group_root.display(), "Partition groups removed");
        Ok(())
    }

    async fn load_with(
        &self,
        manifest: Option<&PlanManifest>,
        index: u32,
    ) -> PartitionResult<StoredPartition> {
        let Some(manifest) = manifest else {
            return Ok(StoredPartition::Absent {
                index,
                reason: "no completed plan has been persisted".to_string(),
            });
        };
        let Some(planned) = manifest.plan.get(index) else {
            return Ok(StoredPartition::Absent {
                index,
                reason: format!("the persisted plan has {} partitions", manifest.plan.len()),
            });
        };

        let group = self.group_path(index);
        if !group.is_dir() {
            return Ok(StoredPartition::Absent {
                index,
                reason: format!("group {} is missing", group.display()),
            });
        }

        let cpu_range = read_ids(&group.join(CPUS)).await?;
        let mem_nodes = read_ids(&group.join(MEMS)).await?;
        if cpu_range.is_empty() {
            return Ok(StoredPartition::Absent {
                index,
                reason: format!("group {} has no CPUs assigned", group.display()),
            });
        }
        if cpu_range != planned.cpu_range || mem_nodes != planned.mem_nodes {
            warn!(
                partition = index,
                planned_cpus = %planned.cpu_range,
                cpus = %cpu_range,
                planned_mems = %planned.mem_nodes,
                mems = %mem_nodes,
                "Group differs from the persisted plan, using the group's values"
            );
        }

        Ok(StoredPartition::Present(Partition {
            index,
            cpu_range,
            mem_nodes,
            gpu_slice: planned.gpu_slice.clone(),
        }))
    }

    /// Indices of existing groups, ascending
    async fn group_indices(&self) -> PartitionResult<Vec<u32>> {
        let mut entries = match tokio::fs::read_dir(&self.group_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(index) = name
                .to_str()
                .and_then(|n| n.strip_prefix(self.prefix.as_str()))
                .and_then(|n| n.parse::<u32>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    async fn enable_cpuset(&self, dir: &Path) -> PartitionResult<()> {
        write_control(&dir.join(SUBTREE_CONTROL), "+cpuset").await
    }

    /// Move the group's current members to the root group
    async fn evict(&self, index: u32, group: &Path) -> PartitionResult<()> {
        let pids = read_pids(&group.join(PROCS)).await?;
        for pid in pids {
            match append_pid(&self.root.join(PROCS), pid).await {
                Ok(()) => info!(partition = index, pid = pid, "Evicted process from group"),
                Err(e) => warn!(partition = index, pid = pid, error = %e, "Failed to evict process"),
            }
        }
        Ok(())
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

async fn write_control(path: &Path, value: &str) -> PartitionResult<()> {
    tokio::fs::write(path, value)
        .await
        .map_err(|source| PartitionError::ControlWrite {
            path: path.to_path_buf(),
            value: value.to_string(),
            source,
        })
}

async fn append_pid(path: &Path, pid: u32) -> PartitionResult<()> {
    let value = format!("{}\n", pid);
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await
    }
    .await;

    result.map_err(|source| PartitionError::ControlWrite {
        path: path.to_path_buf(),
        value: pid.to_string(),
        source,
    })
}

async fn read_ids(path: &Path) -> PartitionResult<IdSet> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content.parse(),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(IdSet::new()),
        Err(e) => Err(e.into()),
    }
}

async fn read_pids(path: &Path) -> PartitionResult<Vec<u32>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// Remove a group directory.
///
/// On cgroupfs a group is removed with rmdir even though it lists control
/// files. Plain directories (a staged tree) need a recursive removal.
async fn remove_group(path: &Path) -> PartitionResult<()> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
            tokio::fs::remove_dir_all(path).await?;
            Ok(())
        }
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
            warn!(
                group = %path.display(),
                "Group still has member processes; stop them before removing it"
            );
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        cgroup: CgroupConfig,
        state: StateConfig,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cgroup");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(CONTROLLERS), "cpuset cpu io memory pids\n").unwrap();
        Fixture {
            cgroup: CgroupConfig {
                root,
                require_root: false,
                ..CgroupConfig::default()
            },
            state: StateConfig {
                dir: dir.path().join("state"),
            },
            _dir: dir,
        }
    }

    fn plan(ranges: &[&str]) -> Plan {
        Plan {
            requested: ranges.len() as u32,
            partitions: ranges
                .iter()
                .enumerate()
                .map(|(i, cpus)| Partition {
                    index: i as u32,
                    cpu_range: cpus.parse().unwrap(),
                    mem_nodes: ((i % 2) as u32..(i % 2) as u32 + 1).collect(),
                    gpu_slice: format!("g{}", i),
                })
                .collect(),
        }
    }

    fn snapshot(root: &Path) -> Vec<(PathBuf, String)> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.push((path.clone(), std::fs::read_to_string(&path).unwrap()));
                }
            }
        }
        files.sort();
        files
    }

    #[test]
    fn test_unavailable_without_cgroup2() {
        let dir = TempDir::new().unwrap();
        let cgroup = CgroupConfig {
            root: dir.path().to_path_buf(),
            require_root: false,
            ..CgroupConfig::default()
        };
        let err = CgroupStore::new(&cgroup, &StateConfig::default()).err().unwrap();
        assert!(matches!(err, PartitionError::StoreUnavailable { .. }));
    }

    #[test]
    fn test_mems_written_before_cpus() {
        let partition = plan(&["0-3"]).partitions.remove(0);
        let writes = control_writes(&partition);
        assert_eq!(writes[0], (MEMS, "0".to_string()));
        assert_eq!(writes[1], (CPUS, "0-3".to_string()));
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();
        let plan = plan(&["0-10", "11-21", "22-31"]);

        store.persist(&plan).await.unwrap();

        let group = store.group_path(1);
        assert!(group.ends_with("mig/mig1"));
        assert_eq!(store.cgroup_path(1), "/mig/mig1");
        assert_eq!(std::fs::read_to_string(group.join(CPUS)).unwrap(), "11-21");
        assert_eq!(std::fs::read_to_string(group.join(MEMS)).unwrap(), "1");
        assert_eq!(
            std::fs::read_to_string(fx.cgroup.root.join("mig").join(SUBTREE_CONTROL)).unwrap(),
            "+cpuset"
        );

        let loaded = store.load(1).await.unwrap().into_partition().unwrap();
        assert_eq!(loaded, plan.partitions[1]);
        assert_eq!(store.plan().await.unwrap(), Some(plan));
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();
        let plan = plan(&["0-3", "4-7"]);

        store.persist(&plan).await.unwrap();
        let once = (snapshot(fx.cgroup.root.as_path()), store.list().await.unwrap());
        store.persist(&plan).await.unwrap();
        let twice = (snapshot(fx.cgroup.root.as_path()), store.list().await.unwrap());

        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_persist_replaces_cpu_sets() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();

        store.persist(&plan(&["0-5", "6-11"])).await.unwrap();
        store.persist(&plan(&["0-2", "3-11"])).await.unwrap();

        let cpus = std::fs::read_to_string(store.group_path(1).join(CPUS)).unwrap();
        assert_eq!(cpus, "3-11");
    }

    #[tokio::test]
    async fn test_persist_removes_stale_groups() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();

        store.persist(&plan(&["0", "1", "2", "3"])).await.unwrap();
        store.persist(&plan(&["0-1", "2-3"])).await.unwrap();

        assert!(!store.group_path(2).exists());
        assert!(!store.group_path(3).exists());
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_plan_not_persisted() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();

        let err = store.persist(&plan(&["0-5", "5-9"])).await.unwrap_err();
        assert!(matches!(err, PartitionError::InvalidPlan(_)));
        assert!(!store.group_path(0).exists());
    }

    #[tokio::test]
    async fn test_missing_group_reported_absent() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();
        store.persist(&plan(&["0-3", "4-7", "8-11"])).await.unwrap();

        std::fs::remove_dir_all(store.group_path(1)).unwrap();

        let entries = store.list().await.unwrap();
        assert!(entries[0].is_present());
        assert!(!entries[1].is_present());
        assert!(entries[2].is_present());

        let err = store.load(1).await.unwrap().into_partition().unwrap_err();
        match err {
            PartitionError::UnknownPartition { index, reason } => {
                assert_eq!(index, 1);
                assert!(reason.contains("mig1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.plan().await.is_err());
    }

    #[tokio::test]
    async fn test_load_before_setup() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();

        assert!(!store.load(0).await.unwrap().is_present());
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.plan().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_beyond_plan() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();
        store.persist(&plan(&["0-3"])).await.unwrap();

        let entry = store.load(5).await.unwrap();
        assert_eq!(entry.index(), 5);
        assert!(!entry.is_present());
    }

    #[tokio::test]
    async fn test_interrupted_setup_listed_absent() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();
        store.persist(&plan(&["0-3", "4-7"])).await.unwrap();
        PlanManifest::remove(&fx.state.manifest_path()).await.unwrap();

        let entries = store.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| !e.is_present()));
    }

    #[tokio::test]
    async fn test_attach_and_members() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();
        store.persist(&plan(&["0-3", "4-7"])).await.unwrap();

        store.attach(0, 4242).await.unwrap();
        store.attach(0, 4343).await.unwrap();
        assert_eq!(store.members(0).await.unwrap(), vec![4242, 4343]);
        assert!(store.members(1).await.unwrap().is_empty());

        let err = store.attach(9, 1).await.unwrap_err();
        assert!(matches!(err, PartitionError::UnknownPartition { index: 9, .. }));
    }

    #[tokio::test]
    async fn test_evict_on_persist() {
        let mut fx = fixture();
        fx.cgroup.evict_on_persist = true;
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();
        store.persist(&plan(&["0-3"])).await.unwrap();
        store.attach(0, 777).await.unwrap();

        store.persist(&plan(&["0-3"])).await.unwrap();

        let root_procs = std::fs::read_to_string(fx.cgroup.root.join(PROCS)).unwrap();
        assert_eq!(root_procs.trim(), "777");
    }

    #[tokio::test]
    async fn test_teardown() {
        let fx = fixture();
        let store = CgroupStore::new(&fx.cgroup, &fx.state).unwrap();
        store.persist(&plan(&["0-3", "4-7"])).await.unwrap();

        store.teardown().await.unwrap();

        assert!(!fx.cgroup.root.join("mig").exists());
        assert!(store.list().await.unwrap().is_empty());
    }
}
