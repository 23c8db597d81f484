//! systemd slice units
//!
//! For hosts where a service manager owns the cgroup tree, a partition can be
//! handed over as a `.slice` unit instead of being written directly.

use migpart_core::Partition;

/// Unit name for partition `index`; a child of `migpart.slice`
pub fn slice_unit_name(index: u32) -> String {
    format!("migpart-{}.slice", index)
}

/// Render the slice unit confining a partition's CPUs and memory nodes
pub fn render_slice_unit(partition: &Partition) -> String {
    format!(
        "[Unit]\n\
         Description=migpart partition {index} (GPU slice {slice})\n\
         \n\
         [Slice]\n\
         AllowedCPUs={cpus}\n\
         AllowedMemoryNodes={mems}\n",
        index = partition.index,
        slice = partition.gpu_slice,
        cpus = partition.cpu_range,
        mems = partition.mem_nodes,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use migpart_core::IdSet;

    #[test]
    fn test_render_slice_unit() {
        let partition = Partition {
            index: 6,
            cpu_range: IdSet::range(62, 72),
            mem_nodes: IdSet::range(0, 1),
            gpu_slice: "MIG-abc".to_string(),
        };
        let unit = render_slice_unit(&partition);
        assert_eq!(slice_unit_name(6), "migpart-6.slice");
        assert!(unit.contains("AllowedCPUs=62-71\n"));
        assert!(unit.contains("AllowedMemoryNodes=0\n"));
        assert!(unit.contains("Description=migpart partition 6 (GPU slice MIG-abc)"));
        assert!(unit.starts_with("[Unit]\n"));
    }
}
