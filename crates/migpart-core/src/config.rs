//! Configuration types for migpart

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/migpart/config.toml";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MigpartConfig {
    /// Isolation group (cgroup v2) configuration
    pub cgroup: CgroupConfig,
    /// Host topology discovery configuration
    pub topology: TopologyConfig,
    /// GPU slice discovery configuration
    pub gpu: GpuConfig,
    /// Launcher configuration
    pub launch: LaunchConfig,
    /// Persisted state configuration
    pub state: StateConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl MigpartConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, crate::PartitionError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::PartitionError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::PartitionError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from `path` if given, else from the default location if it
    /// exists, else built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self, crate::PartitionError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

/// Isolation group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Mount point of the cgroup v2 hierarchy
    pub root: PathBuf,
    /// Directory under `root` that holds every partition group
    pub group_root: String,
    /// Group name prefix; partition `i` lives in `<prefix><i>`
    pub group_prefix: String,
    /// Refuse to construct the store unless running as root
    pub require_root: bool,
    /// Move existing members out of a group before rewriting its CPU set
    pub evict_on_persist: bool,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/fs/cgroup"),
            group_root: "mig".to_string(),
            group_prefix: "mig".to_string(),
            require_root: true,
            evict_on_persist: false,
        }
    }
}

/// Topology discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Mount point of sysfs
    pub sysfs_root: PathBuf,
    /// How memory nodes are assigned to partitions
    pub numa_policy: NumaPolicy,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            numa_policy: NumaPolicy::RoundRobin,
        }
    }
}

/// Memory node assignment policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NumaPolicy {
    /// Partition `i` gets node `i % node_count`
    RoundRobin,
    /// Partition gets the node owning most of its CPUs
    Local,
}

/// GPU slice discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Path to the vendor query tool
    pub nvidia_smi: PathBuf,
    /// Fixed slice identifiers; when set the vendor tool is not queried
    pub slices: Option<Vec<String>>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            nvidia_smi: PathBuf::from("nvidia-smi"),
            slices: None,
        }
    }
}

/// Launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Maximum number of attempts to move a new process into its group
    pub attach_attempts: u32,
    /// Delay between attach attempts in milliseconds
    pub attach_backoff_ms: u64,
    /// Environment variables inherited from the caller
    pub env_allowlist: Vec<String>,
    /// Variable that scopes GPU visibility
    pub visibility_env: String,
}

impl LaunchConfig {
    pub fn attach_backoff(&self) -> Duration {
        Duration::from_millis(self.attach_backoff_ms)
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            attach_attempts: 20,
            attach_backoff_ms: 100,
            env_allowlist: [
                "PATH",
                "HOME",
                "USER",
                "LOGNAME",
                "SHELL",
                "LANG",
                "LC_ALL",
                "TERM",
                "TZ",
                "LD_LIBRARY_PATH",
                "PYTHONPATH",
                "VIRTUAL_ENV",
                "CONDA_PREFIX",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            visibility_env: "CUDA_VISIBLE_DEVICES".to_string(),
        }
    }
}

/// Persisted state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding the plan manifest. Under /run so that it is
    /// cleared on reboot together with the groups it describes.
    pub dir: PathBuf,
}

impl StateConfig {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("plan.json")
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/migpart"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
