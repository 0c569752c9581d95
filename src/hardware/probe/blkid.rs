//! blkid Probe
//!
//! Low-level superblock probe (`blkid -p -o export`) for partition table
//! and filesystem signatures, plus the child partitions listed in sysfs.

use super::{non_empty, DeviceAttributes, DeviceHandle, ProbeContext, ProbeFailure, ProbeResult};
use std::io::ErrorKind;
use std::path::Path;
use tokio::process::Command;

/// blkid exit status when no signature was found
const BLKID_NOTHING_FOUND: i32 = 2;

pub async fn probe(handle: &DeviceHandle, ctx: &ProbeContext) -> ProbeResult {
    let output = Command::new(&ctx.blkid_path)
        .args(["-p", "-o", "export", &handle.dev_path])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                ProbeFailure::Unavailable(format!("{} not installed", ctx.blkid_path))
            }
            _ => ProbeFailure::Error(format!("blkid failed for {}: {}", handle.dev_path, e)),
        })?;

    let mut attrs = match output.status.code() {
        Some(0) => parse_blkid_export(&String::from_utf8_lossy(&output.stdout)),
        Some(BLKID_NOTHING_FOUND) => DeviceAttributes::default(),
        _ => {
            return Err(ProbeFailure::Error(format!(
                "blkid exited with {} for {}: {}",
                output.status,
                handle.dev_path,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    };

    attrs.partitions = Some(child_partitions(&handle.sysfs_path, &handle.name).await);
    Ok(attrs)
}

/// Parse `KEY=value` lines from `blkid -o export`
pub fn parse_blkid_export(output: &str) -> DeviceAttributes {
    let mut attrs = DeviceAttributes::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = non_empty(value);
        match key.trim() {
            "TYPE" => attrs.fs_type = value,
            "UUID" => attrs.fs_uuid = value,
            "PTTYPE" => attrs.partition_table_type = value,
            "PTUUID" => attrs.partition_table_uuid = value,
            _ => {}
        }
    }
    attrs
}

/// Kernel names of partitions nested under a disk's sysfs directory
pub(crate) async fn child_partitions(sysfs_path: &Path, name: &str) -> Vec<String> {
    let mut partitions = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(sysfs_path).await else {
        return partitions;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let child = entry.file_name().to_string_lossy().to_string();
        if child.starts_with(name)
            && tokio::fs::try_exists(entry.path().join("partition"))
                .await
                .unwrap_or(false)
        {
            partitions.push(child);
        }
    }
    partitions.sort();
    partitions
}
