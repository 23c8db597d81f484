//! Plan manifest
//!
//! The manifest is written only after every group of a plan exists, so its
//! presence is what marks a persisted plan as complete.

use migpart_core::{Plan, PartitionResult};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

const MANIFEST_VERSION: u32 = 1;

/// On-disk record of the last completed plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanManifest {
    /// Format version
    pub version: u32,
    /// The persisted plan
    pub plan: Plan,
}

impl PlanManifest {
    pub fn new(plan: Plan) -> Self {
        Self {
            version: MANIFEST_VERSION,
            plan,
        }
    }

    /// Read the manifest; `None` when no plan has been completed
    pub async fn read(path: &Path) -> PartitionResult<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the manifest through a temporary file and rename
    pub async fn write(&self, path: &Path) -> PartitionResult<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), partitions = self.plan.len(), "Wrote plan manifest");
        Ok(())
    }

    /// Remove the manifest if present
    pub async fn remove(path: &Path) -> PartitionResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migpart_core::{IdSet, Partition};
    use tempfile::TempDir;

    fn plan() -> Plan {
        Plan {
            requested: 1,
            partitions: vec![Partition {
                index: 0,
                cpu_range: IdSet::range(0, 4),
                mem_nodes: IdSet::range(0, 1),
                gpu_slice: "MIG-a".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_manifest_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/plan.json");

        assert!(PlanManifest::read(&path).await.unwrap().is_none());

        PlanManifest::new(plan()).write(&path).await.unwrap();
        let manifest = PlanManifest::read(&path).await.unwrap().unwrap();
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.plan, plan());

        PlanManifest::remove(&path).await.unwrap();
        PlanManifest::remove(&path).await.unwrap();
        assert!(PlanManifest::read(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manifest_stores_cpu_lists_as_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        PlanManifest::new(plan()).write(&path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"cpu_range\": \"0-3\""));
    }
}
