//! Launcher trait definitions

use async_trait::async_trait;
use migpart_core::PartitionResult;
use migpart_store::{CgroupStore, StoredPartition};

/// Where the launcher looks up partitions and registers new members
#[async_trait]
pub trait PartitionRegistry: Send + Sync {
    /// Look up a persisted partition
    async fn load(&self, index: u32) -> PartitionResult<StoredPartition>;

    /// Make `pid` a member of partition `index`'s isolation group
    async fn attach(&self, index: u32, pid: u32) -> PartitionResult<()>;

    /// Group path of partition `index` as `/proc/<pid>/cgroup` reports it
    fn cgroup_path(&self, index: u32) -> String;

    /// Get the registry name
    fn name(&self) -> &'static str;
}

#[async_trait]
impl PartitionRegistry for CgroupStore {
    async fn load(&self, index: u32) -> PartitionResult<StoredPartition> {
        CgroupStore::load(self, index).await
    }

    async fn attach(&self, index: u32, pid: u32) -> PartitionResult<()> {
        CgroupStore::attach(self, index, pid).await
    }

    fn cgroup_path(&self, index: u32) -> String {
        CgroupStore::cgroup_path(self, index)
    }

    fn name(&self) -> &'static str {
        "cgroup2"
    }
}
