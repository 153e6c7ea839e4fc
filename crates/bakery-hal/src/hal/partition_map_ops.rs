//! Partition mapping (kpartx) operations.

use crate::{HalError, HalResult, PartitionMap};

/// Exposes the partitions of a raw device as individually mountable
/// device-mapper nodes.
pub trait PartitionMapOps {
    /// Whether the mapping tool is installed on the host.
    fn partition_tool_installed(&self) -> HalResult<bool>;

    /// Create a mapping for every partition of `device`, in partition order.
    fn add_partition_maps(&self, device: &str) -> HalResult<Vec<PartitionMap>>;

    /// Remove every mapping previously created for `device`.
    fn delete_partition_maps(&self, device: &str) -> HalResult<()>;
}

/// Parse the output of `kpartx -asv <device>`.
///
/// Each line looks like `add map loop0p1 (253:0): 0 524288 linear 7:0 8192`.
/// Anything on stderr, or stdout that does not start with `add map `, is a
/// failure.
pub fn parse_kpartx_add(stdout: &str, stderr: &str) -> HalResult<Vec<PartitionMap>> {
    if !stderr.trim().is_empty() || !stdout.starts_with("add map ") {
        return Err(HalError::CommandFailed {
            program: "kpartx".to_string(),
            code: None,
            stderr: format!("{}{}", stderr.trim(), stdout.trim()),
        });
    }

    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(' ').collect();
            let name = fields
                .get(2)
                .ok_or_else(|| HalError::Parse(format!("kpartx line without map name: {line}")))?;
            let size_sectors = fields
                .get(5)
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| HalError::Parse(format!("kpartx line without size: {line}")))?;
            Ok(PartitionMap {
                name: name.to_string(),
                size_sectors,
            })
        })
        .collect()
}
