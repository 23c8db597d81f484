//! GPU slice assignment

use migpart_core::{PartitionError, PartitionResult};
use std::collections::HashSet;
use tracing::debug;

/// Hands out GPU slices in the order the device reported them
pub struct SliceAllocator<'a> {
    slices: &'a [String],
}

impl<'a> SliceAllocator<'a> {
    /// Create an allocator over the reported slices.
    ///
    /// Fails if an identifier appears twice, since two partitions would
    /// then alias one slice.
    pub fn new(slices: &'a [String]) -> PartitionResult<Self> {
        let mut seen = HashSet::new();
        for slice in slices {
            if !seen.insert(slice.as_str()) {
                return Err(PartitionError::InvalidPlan(format!(
                    "GPU slice {} reported more than once; check the GPU query output",
                    slice
                )));
            }
        }
        Ok(Self { slices })
    }

    /// Number of slices available
    pub fn total_count(&self) -> usize {
        self.slices.len()
    }

    /// Slices for partitions `0..count`; partition `i` gets slice `i`
    pub fn assign(&self, count: usize) -> PartitionResult<Vec<String>> {
        if count > self.slices.len() {
            return Err(PartitionError::InsufficientResources {
                resource: "GPU slices",
                available: self.slices.len(),
                requested: count,
                hint: "create more MIG compute instances first",
            });
        }

        let assigned = self.slices[..count].to_vec();
        debug!(slices = ?assigned, "Assigned GPU slices");
        Ok(assigned)
    }
}
