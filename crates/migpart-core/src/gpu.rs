//! GPU compute slice discovery
//!
//! All knowledge of the vendor tool's text output stays in this module.
//! Everything else sees an ordered list of opaque slice identifiers.

use crate::{GpuConfig, PartitionResult};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

/// Source of instantiated GPU compute slice identifiers
pub trait SliceSource: Send + Sync {
    /// Identifiers in stable device order; empty when none are instantiated
    fn list_slices(&self) -> PartitionResult<Vec<String>>;

    /// Source name for diagnostics
    fn name(&self) -> &'static str;
}

/// Build the slice source described by the configuration
pub fn slice_source(config: &GpuConfig) -> Box<dyn SliceSource> {
    match &config.slices {
        Some(slices) => Box::new(StaticSlices::new(slices.clone())),
        None => Box::new(NvidiaSmi::new(config.nvidia_smi.clone())),
    }
}

/// Queries MIG instances through `nvidia-smi -L`
pub struct NvidiaSmi {
    path: PathBuf,
}

impl NvidiaSmi {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SliceSource for NvidiaSmi {
    fn list_slices(&self) -> PartitionResult<Vec<String>> {
        let output = match Command::new(&self.path).arg("-L").output() {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    tool = %self.path.display(),
                    error = %e,
                    "Failed to run GPU query tool, assuming no GPU slices"
                );
                return Ok(Vec::new());
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                tool = %self.path.display(),
                status = %output.status,
                stderr = %stderr.trim(),
                "GPU query tool failed, assuming no GPU slices"
            );
            return Ok(Vec::new());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let slices = parse_mig_listing(&stdout);
        debug!(count = slices.len(), slices = ?slices, "Discovered GPU slices");
        Ok(slices)
    }

    fn name(&self) -> &'static str {
        "nvidia-smi"
    }
}

/// Fixed list of slice identifiers
pub struct StaticSlices {
    slices: Vec<String>,
}

impl StaticSlices {
    pub fn new(slices: Vec<String>) -> Self {
        Self { slices }
    }
}

impl SliceSource for StaticSlices {
    fn list_slices(&self) -> PartitionResult<Vec<String>> {
        Ok(self.slices.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Extract MIG UUIDs from `nvidia-smi -L` output, in listing order.
///
/// Whole-GPU lines (`GPU 0: ... (UUID: GPU-...)`) are skipped; only the
/// indented `MIG <profile> Device <n>: (UUID: MIG-...)` lines count.
pub fn parse_mig_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("MIG "))
        .filter_map(|line| {
            let start = line.find("UUID: ")? + "UUID: ".len();
            let rest = &line[start..];
            let end = rest.find(')').unwrap_or(rest.len());
            let uuid = rest[..end].trim();
            (!uuid.is_empty()).then(|| uuid.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
GPU 0: NVIDIA A100-SXM4-80GB (UUID: GPU-5d5ba0d6-d33d-2b2c-524d-e63e1d5a8ab3)
  MIG 1g.10gb     Device  0: (UUID: MIG-c6d4f1ef-42e4-5de3-91c7-45d71c87eb3f)
  MIG 1g.10gb     Device  1: (UUID: MIG-cba663e8-9bed-5b25-b243-5985ef7c9beb)
GPU 1: NVIDIA A100-SXM4-80GB (UUID: GPU-b1f0a5c2-3d6e-4f1b-9a3c-0e2d4c6b8a10)
  MIG 3g.40gb     Device  0: (UUID: MIG-1a2b3c4d-0000-5111-8222-333344445555)
";

    #[test]
    fn test_parse_mig_listing() {
        let slices = parse_mig_listing(LISTING);
        assert_eq!(
            slices,
            vec![
                "MIG-c6d4f1ef-42e4-5de3-91c7-45d71c87eb3f",
                "MIG-cba663e8-9bed-5b25-b243-5985ef7c9beb",
                "MIG-1a2b3c4d-0000-5111-8222-333344445555",
            ]
        );
    }

    #[test]
    fn test_parse_without_mig() {
        let listing = "GPU 0: NVIDIA A100-SXM4-80GB (UUID: GPU-5d5ba0d6)\n";
        assert!(parse_mig_listing(listing).is_empty());
        assert!(parse_mig_listing("").is_empty());
    }

    #[test]
    fn test_missing_tool_yields_no_slices() {
        let source = NvidiaSmi::new(PathBuf::from("/nonexistent/nvidia-smi"));
        assert!(source.list_slices().unwrap().is_empty());
    }

    #[test]
    fn test_static_source_from_config() {
        let config = GpuConfig {
            slices: Some(vec!["g0".to_string(), "g1".to_string()]),
            ..GpuConfig::default()
        };
        let source = slice_source(&config);
        assert_eq!(source.name(), "static");
        assert_eq!(source.list_slices().unwrap(), vec!["g0", "g1"]);
    }
}
