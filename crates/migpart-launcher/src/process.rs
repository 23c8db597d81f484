//! Partition-confined process launcher
//!
//! A launch resolves the partition, applies CPU affinity between fork and
//! exec, scopes GPU visibility through the environment and then moves the
//! running child into the partition's group. Only affinity and visibility
//! are guaranteed; group membership is best effort.

use migpart_core::{
    LaunchConfig, LaunchRecord, LaunchState, Partition, PartitionError, PartitionResult,
    SliceSource,
};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};

use crate::attach::{attach_with_retry, AttachPolicy};
use crate::traits::PartitionRegistry;
use crate::user::{lookup_user, UserIdentity};

/// Time a cancelled workload gets between SIGTERM and SIGKILL
const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// What to run and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Partition index
    pub index: u32,
    /// Program to execute, looked up on PATH
    pub command: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Account to run as; requires root
    pub run_as: Option<String>,
    /// Return the running child instead of waiting for it
    pub detached: bool,
}

impl LaunchRequest {
    pub fn new(index: u32, command: impl Into<String>) -> Self {
        Self {
            index,
            command: command.into(),
            args: Vec::new(),
            run_as: None,
            detached: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }
}

/// A persisted partition paired with the GPU slice currently at its index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPartition {
    pub partition: Partition,
    /// Live slice identifier; may differ from the one recorded at setup
    pub gpu_slice: String,
}

/// Result of a launch
#[derive(Debug)]
pub struct LaunchOutcome {
    pub record: LaunchRecord,
    /// Slice the workload was given
    pub gpu_slice: String,
    /// Set when the workload runs without its group
    pub attach_error: Option<PartitionError>,
    /// Exit code of a foreground workload; 128 + signal when killed
    pub exit_code: Option<i32>,
    /// The running child of a detached launch
    pub child: Option<Child>,
}

/// Starts workloads inside persisted partitions
pub struct ProcessLauncher {
    registry: Arc<dyn PartitionRegistry>,
    slices: Arc<dyn SliceSource>,
    config: LaunchConfig,
    attach_policy: AttachPolicy,
    grace: Duration,
}

impl ProcessLauncher {
    /// Create a launcher over a registry and a live slice source
    pub fn new(
        registry: Arc<dyn PartitionRegistry>,
        slices: Arc<dyn SliceSource>,
        config: LaunchConfig,
    ) -> Self {
        let attach_policy = AttachPolicy::from_config(&config);
        Self {
            registry,
            slices,
            config,
            attach_policy,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_attach_policy(mut self, policy: AttachPolicy) -> Self {
        self.attach_policy = policy;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Look up partition `index` and the GPU slice currently at that index.
    ///
    /// The slice is re-read rather than taken from the stored plan because
    /// slices can be destroyed and recreated with new identifiers between
    /// setup and launch.
    pub async fn resolve(&self, index: u32) -> PartitionResult<ResolvedPartition> {
        let partition = self.registry.load(index).await?.into_partition()?;

        let slices = Arc::clone(&self.slices);
        let live = tokio::task::spawn_blocking(move || slices.list_slices())
            .await
            .map_err(|e| PartitionError::Internal(format!("slice query task failed: {}", e)))??;

        let gpu_slice = live
            .get(index as usize)
            .cloned()
            .ok_or(PartitionError::GpuSliceUnresolved {
                index,
                available: live.len(),
            })?;

        if gpu_slice != partition.gpu_slice {
            warn!(
                partition = index,
                recorded = %partition.gpu_slice,
                live = %gpu_slice,
                "GPU slice identifier changed since setup, using the live one"
            );
        }

        Ok(ResolvedPartition {
            partition,
            gpu_slice,
        })
    }

    /// Launch a workload in the requested partition.
    ///
    /// Foreground launches wait for the child and forward SIGINT / SIGTERM
    /// to it. Detached launches return as soon as the child is running.
    pub async fn launch(&self, request: LaunchRequest) -> PartitionResult<LaunchOutcome> {
        let identity = match &request.run_as {
            Some(name) => {
                // SAFETY: geteuid has no preconditions.
                if unsafe { libc::geteuid() } != 0 {
                    return Err(PartitionError::PermissionDenied(format!(
                        "running as {} needs root",
                        name
                    )));
                }
                Some(lookup_user(name)?)
            }
            None => None,
        };

        let resolved = self.resolve(request.index).await?;
        let mut cmd = self.build_command(&request, &resolved, identity.as_ref())?;

        let mut cancel = if request.detached {
            None
        } else {
            Some(Cancellation::install()?)
        };

        let mut child = cmd.spawn().map_err(|e| PartitionError::Spawn {
            command: request.command.clone(),
            source: e,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| PartitionError::Internal("spawned child has no pid".to_string()))?;

        let mut record = LaunchRecord::new(request.index, pid);
        info!(
            launch_id = %record.id,
            partition = request.index,
            pid = pid,
            command = %request.command,
            cpus = %resolved.partition.cpu_range,
            gpu_slice = %resolved.gpu_slice,
            "Workload spawned"
        );

        // The exec only happens once affinity was applied in the child.
        record.advance(LaunchState::AffinitySet)?;
        record.advance(LaunchState::CgroupAttachPending)?;

        let attach_error =
            match attach_with_retry(self.registry.as_ref(), request.index, pid, self.attach_policy)
                .await
            {
                Ok(_) => {
                    record.advance(LaunchState::CgroupAttached)?;
                    None
                }
                Err(e) => {
                    record.advance(LaunchState::CgroupAttachFailed)?;
                    Some(e)
                }
            };
        record.advance(LaunchState::Running)?;

        let cancel = match cancel.as_mut() {
            Some(cancel) => cancel,
            None => {
                record.advance(LaunchState::Detached)?;
                info!(launch_id = %record.id, pid = pid, "Workload detached");
                return Ok(LaunchOutcome {
                    record,
                    gpu_slice: resolved.gpu_slice,
                    attach_error,
                    exit_code: None,
                    child: Some(child),
                });
            }
        };

        let status = tokio::select! {
            status = child.wait() => status?,
            signal = cancel.recv() => {
                info!(pid = pid, signal = signal, "Cancellation requested, stopping workload");
                self.terminate(&mut child, pid).await?
            }
        };

        let code = exit_code(status);
        record.advance(LaunchState::Exited(code))?;
        info!(launch_id = %record.id, pid = pid, exit_code = code, "Workload exited");

        Ok(LaunchOutcome {
            record,
            gpu_slice: resolved.gpu_slice,
            attach_error,
            exit_code: Some(code),
            child: None,
        })
    }

    /// Build the confined command for a resolved partition
    fn build_command(
        &self,
        request: &LaunchRequest,
        resolved: &ResolvedPartition,
        identity: Option<&UserIdentity>,
    ) -> PartitionResult<Command> {
        let cpu_set = cpu_set(&resolved.partition)?;

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args);

        cmd.env_clear();
        for (key, value) in std::env::vars_os() {
            let allowed = key
                .to_str()
                .map(|k| self.config.env_allowlist.iter().any(|a| a == k))
                .unwrap_or(false);
            if allowed {
                cmd.env(key, value);
            }
        }

        if let Some(identity) = identity {
            cmd.uid(identity.uid);
            cmd.gid(identity.gid);
            cmd.env("HOME", &identity.home);
            cmd.env("USER", &identity.name);
            cmd.env("LOGNAME", &identity.name);
            debug!(user = %identity.name, uid = identity.uid, "Dropping privileges");
        }

        cmd.env(&self.config.visibility_env, &resolved.gpu_slice);

        // SAFETY: the closure only calls sched_setaffinity, which is
        // async-signal-safe, on a set built before fork.
        unsafe {
            cmd.pre_exec(move || {
                let rc = libc::sched_setaffinity(
                    0,
                    std::mem::size_of::<libc::cpu_set_t>(),
                    &cpu_set,
                );
                if rc != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        Ok(cmd)
    }

    /// SIGTERM the child, then SIGKILL it once the grace period runs out
    async fn terminate(&self, child: &mut Child, pid: u32) -> PartitionResult<ExitStatus> {
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
            debug!(pid = pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(
                    pid = pid,
                    grace_secs = self.grace.as_secs(),
                    "Workload ignored SIGTERM, killing"
                );
                child.kill().await?;
                Ok(child.wait().await?)
            }
        }
    }
}

/// Affinity mask for a partition's CPUs
fn cpu_set(partition: &Partition) -> PartitionResult<libc::cpu_set_t> {
    // SAFETY: an all-zero cpu_set_t is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in partition.cpu_range.iter() {
        let cpu = cpu as usize;
        if cpu >= libc::CPU_SETSIZE as usize {
            return Err(PartitionError::InvalidPlan(format!(
                "CPU {} of partition {} exceeds the affinity mask size {}",
                cpu,
                partition.index,
                libc::CPU_SETSIZE
            )));
        }
        // SAFETY: cpu is within the set's bounds.
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    Ok(set)
}

/// Shell-style exit code: the child's own code, or 128 + terminating signal
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// SIGINT / SIGTERM listeners installed before the child is spawned
struct Cancellation {
    interrupt: Signal,
    terminate: Signal,
}

impl Cancellation {
    fn install() -> PartitionResult<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for either signal; returns its name
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migpart_core::IdSet;

    #[test]
    fn test_cpu_set_contents() {
        let partition = Partition {
            index: 0,
            cpu_range: "1,3-4".parse().unwrap(),
            mem_nodes: IdSet::range(0, 1),
            gpu_slice: "g0".to_string(),
        };
        let set = cpu_set(&partition).unwrap();
        // SAFETY: set is initialised and indices are in bounds.
        let members: Vec<usize> = (0..8).filter(|&c| unsafe { libc::CPU_ISSET(c, &set) }).collect();
        assert_eq!(members, vec![1, 3, 4]);
    }

    #[test]
    fn test_cpu_set_rejects_out_of_range() {
        let partition = Partition {
            index: 2,
            cpu_range: std::iter::once(libc::CPU_SETSIZE as u32).collect(),
            mem_nodes: IdSet::range(0, 1),
            gpu_slice: "g2".to_string(),
        };
        assert!(matches!(
            cpu_set(&partition),
            Err(PartitionError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_exit_code_from_status() {
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 137);
    }

    #[test]
    fn test_request_builder() {
        let request = LaunchRequest::new(3, "python")
            .args(["train.py", "--epochs", "2"])
            .run_as("alice")
            .detached(true);
        assert_eq!(request.index, 3);
        assert_eq!(request.args, vec!["train.py", "--epochs", "2"]);
        assert_eq!(request.run_as.as_deref(), Some("alice"));
        assert!(request.detached);
    }
}
