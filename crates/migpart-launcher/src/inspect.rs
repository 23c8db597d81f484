//! Effective isolation of a running process
//!
//! Reads what the kernel reports for a pid and compares it with the
//! partition the process was meant to run in.

use migpart_core::{IdSet, Partition, PartitionError, PartitionResult};
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

/// What a running process is actually confined to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIsolation {
    pub pid: u32,
    pub cpus_allowed: IdSet,
    pub mems_allowed: IdSet,
    /// Unified-hierarchy group path, e.g. `/mig/mig0`
    pub cgroup: Option<String>,
    /// Value of the GPU visibility variable; `None` if unset or unreadable
    pub gpu_visibility: Option<String>,
}

/// One way a process differs from its partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    CpuMismatch { expected: IdSet, actual: IdSet },
    MemMismatch { expected: IdSet, actual: IdSet },
    CgroupMismatch { expected: String, actual: Option<String> },
    GpuVisibilityMismatch { expected: String, actual: String },
    GpuVisibilityUnknown,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::CpuMismatch { expected, actual } => {
                write!(f, "CPU affinity is {}, expected {}", actual, expected)
            }
            Finding::MemMismatch { expected, actual } => {
                write!(f, "memory nodes are {}, expected {}", actual, expected)
            }
            Finding::CgroupMismatch { expected, actual } => match actual {
                Some(actual) => write!(f, "in group {}, expected {}", actual, expected),
                None => write!(f, "no unified-hierarchy group, expected {}", expected),
            },
            Finding::GpuVisibilityMismatch { expected, actual } => {
                write!(f, "GPU visibility is {}, expected {}", actual, expected)
            }
            Finding::GpuVisibilityUnknown => {
                write!(f, "GPU visibility could not be read")
            }
        }
    }
}

impl ProcessIsolation {
    /// Inspect `pid` through `/proc`
    pub fn inspect(pid: u32, visibility_env: &str) -> PartitionResult<Self> {
        Self::inspect_at(Path::new("/proc"), pid, visibility_env)
    }

    /// Inspect `pid` through a proc filesystem mounted at `proc_root`
    pub fn inspect_at(proc_root: &Path, pid: u32, visibility_env: &str) -> PartitionResult<Self> {
        let dir = proc_root.join(pid.to_string());

        let status = std::fs::read_to_string(dir.join("status")).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                PartitionError::Parse(format!("no process with pid {}", pid))
            } else {
                e.into()
            }
        })?;
        let cpus_allowed = status_field(&status, "Cpus_allowed_list", &dir)?;
        let mems_allowed = status_field(&status, "Mems_allowed_list", &dir)?;

        let cgroup = std::fs::read_to_string(dir.join("cgroup"))
            .ok()
            .and_then(|text| unified_group(&text));

        // environ is only readable by the owner or root
        let gpu_visibility = std::fs::read(dir.join("environ"))
            .ok()
            .and_then(|bytes| environ_value(&bytes, visibility_env));

        Ok(Self {
            pid,
            cpus_allowed,
            mems_allowed,
            cgroup,
            gpu_visibility,
        })
    }

    /// Compare against the partition the process should be confined to
    pub fn verify(
        &self,
        partition: &Partition,
        expected_cgroup: &str,
        expected_slice: &str,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();

        if self.cpus_allowed != partition.cpu_range {
            findings.push(Finding::CpuMismatch {
                expected: partition.cpu_range.clone(),
                actual: self.cpus_allowed.clone(),
            });
        }
        if self.mems_allowed != partition.mem_nodes {
            findings.push(Finding::MemMismatch {
                expected: partition.mem_nodes.clone(),
                actual: self.mems_allowed.clone(),
            });
        }
        if self.cgroup.as_deref() != Some(expected_cgroup) {
            findings.push(Finding::CgroupMismatch {
                expected: expected_cgroup.to_string(),
                actual: self.cgroup.clone(),
            });
        }
        match &self.gpu_visibility {
            Some(actual) if actual != expected_slice => {
                findings.push(Finding::GpuVisibilityMismatch {
                    expected: expected_slice.to_string(),
                    actual: actual.clone(),
                });
            }
            Some(_) => {}
            None => findings.push(Finding::GpuVisibilityUnknown),
        }

        findings
    }
}

fn status_field(status: &str, key: &str, dir: &Path) -> PartitionResult<IdSet> {
    status
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            (name == key).then(|| value.trim())
        })
        .ok_or_else(|| {
            PartitionError::Parse(format!("{} missing from {}/status", key, dir.display()))
        })?
        .parse()
}

/// Group path from the `0::` line of `/proc/<pid>/cgroup`
fn unified_group(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| path.trim().to_string())
}

fn environ_value(environ: &[u8], key: &str) -> Option<String> {
    environ
        .split(|&b| b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .find_map(|entry| {
            let (name, value) = entry.split_once('=')?;
            (name == key).then(|| value.to_string())
        })
}
