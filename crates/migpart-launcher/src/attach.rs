//! Bounded-retry attachment of a new process to its partition group
//!
//! The process runs before it joins the group, and a short-lived one may be
//! gone before the first write lands. Attachment is therefore retried a
//! bounded number of times and failure only degrades isolation.

use migpart_core::{LaunchConfig, PartitionError, PartitionResult};
use std::time::Duration;
use tracing::{debug, warn};

use crate::traits::PartitionRegistry;

/// Retry bound and backoff for group attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachPolicy {
    /// Maximum number of attempts, at least one is always made
    pub attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl AttachPolicy {
    pub fn from_config(config: &LaunchConfig) -> Self {
        Self {
            attempts: config.attach_attempts,
            backoff: config.attach_backoff(),
        }
    }
}

impl Default for AttachPolicy {
    fn default() -> Self {
        Self::from_config(&LaunchConfig::default())
    }
}

/// Attach `pid` to partition `index`, retrying per `policy`.
///
/// Returns the number of attempts used, or `CgroupAttachFailed` carrying the
/// last error once every attempt failed.
pub async fn attach_with_retry(
    registry: &dyn PartitionRegistry,
    index: u32,
    pid: u32,
    policy: AttachPolicy,
) -> PartitionResult<u32> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match registry.attach(index, pid).await {
            Ok(()) => {
                debug!(partition = index, pid = pid, attempt = attempt, "Attached to group");
                return Ok(attempt);
            }
            Err(e) => {
                debug!(
                    partition = index,
                    pid = pid,
                    attempt = attempt,
                    error = %e,
                    "Group attach attempt failed"
                );
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    warn!(
        partition = index,
        pid = pid,
        attempts = attempts,
        reason = %reason,
        "Process runs without its isolation group; CPU affinity and GPU visibility still apply"
    );
    Err(PartitionError::CgroupAttachFailed {
        index,
        pid,
        attempts,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use migpart_store::StoredPartition;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attaches
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PartitionRegistry for Flaky {
        async fn load(&self, index: u32) -> PartitionResult<StoredPartition> {
            Ok(StoredPartition::Absent {
                index,
                reason: "test".to_string(),
            })
        }

        async fn attach(&self, _index: u32, _pid: u32) -> PartitionResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(std::io::Error::from_raw_os_error(libc::ESRCH).into())
            } else {
                Ok(())
            }
        }

        fn cgroup_path(&self, index: u32) -> String {
            format!("/test/{}", index)
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn fast(attempts: u32) -> AttachPolicy {
        AttachPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = AttachPolicy::default();
        assert_eq!(policy.attempts, 20);
        assert_eq!(policy.backoff, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let registry = Flaky {
            failures: 3,
            calls: AtomicU32::new(0),
        };
        let used = attach_with_retry(&registry, 0, 42, fast(10)).await.unwrap();
        assert_eq!(used, 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_bound() {
        let registry = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let err = attach_with_retry(&registry, 2, 42, fast(5)).await.unwrap_err();
        assert!(matches!(
            err,
            PartitionError::CgroupAttachFailed {
                index: 2,
                pid: 42,
                attempts: 5,
                ..
            }
        ));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let registry = Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        assert_eq!(attach_with_retry(&registry, 0, 1, fast(0)).await.unwrap(), 1);
    }
}
