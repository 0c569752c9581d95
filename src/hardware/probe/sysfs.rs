//! sysfs Probes
//!
//! Identification, rotational flag and capacity read straight from the
//! kernel's block device attributes.

use super::{non_empty, DeviceAttributes, DeviceHandle, ProbeContext, ProbeFailure, ProbeResult};
use crate::domain::{DeviceKind, DriveType};
use std::io::ErrorKind;
use std::path::Path;

/// Sector size the kernel uses for the `size` attribute
const SYSFS_SECTOR_SIZE: u64 = 512;

/// Serial, WWN, model, vendor, firmware, kind and rotational flag
pub async fn probe_identity(handle: &DeviceHandle, ctx: &ProbeContext) -> ProbeResult {
    ensure_device_dir(handle, ctx).await?;
    let dir = handle.sysfs_path.as_path();

    let kind = if tokio::fs::try_exists(dir.join("partition")).await.unwrap_or(false) {
        DeviceKind::Partition
    } else {
        DeviceKind::from_name(&handle.name)
    };

    let removable = read_attr(dir, "removable").await.map(|v| v == "1");

    Ok(DeviceAttributes {
        serial: first_attr(dir, &["device/serial", "serial"]).await,
        wwn: first_attr(dir, &["device/wwid", "wwid"]).await,
        model: first_attr(dir, &["device/model", "device/name"]).await,
        vendor: read_attr(dir, "device/vendor").await,
        firmware: first_attr(dir, &["device/firmware_rev", "device/rev"]).await,
        kind: Some(kind),
        removable,
        drive_type: detect_drive_type(dir).await,
        ..Default::default()
    })
}

/// Capacity and block sizes
pub async fn probe_capacity(handle: &DeviceHandle, ctx: &ProbeContext) -> ProbeResult {
    ensure_device_dir(handle, ctx).await?;
    let dir = handle.sysfs_path.as_path();

    let size = read_attr(dir, "size")
        .await
        .ok_or_else(|| ProbeFailure::Error(format!("no size attribute for {}", handle.name)))?;
    let sectors: u64 = size
        .parse()
        .map_err(|_| ProbeFailure::Error(format!("invalid size {:?} for {}", size, handle.name)))?;

    Ok(DeviceAttributes {
        capacity_bytes: Some(sectors.saturating_mul(SYSFS_SECTOR_SIZE)),
        logical_block_size: parse_attr(dir, "queue/logical_block_size").await,
        physical_block_size: parse_attr(dir, "queue/physical_block_size").await,
        ..Default::default()
    })
}

/// Detect whether a device is SSD or HDD from its rotational flag
async fn detect_drive_type(dir: &Path) -> Option<DriveType> {
    match read_attr(dir, "queue/rotational").await.as_deref() {
        Some("0") => Some(DriveType::Ssd),
        Some("1") => Some(DriveType::Hdd),
        _ => None,
    }
}

/// A missing sysfs tree means the probe cannot work on this host; a
/// missing device directory means the device went away under us
async fn ensure_device_dir(handle: &DeviceHandle, ctx: &ProbeContext) -> Result<(), ProbeFailure> {
    match tokio::fs::metadata(&handle.sysfs_path).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let class_block = ctx.sysfs_root.join("class/block");
            if tokio::fs::try_exists(&class_block).await.unwrap_or(false) {
                Err(ProbeFailure::Error(format!(
                    "{} not found",
                    handle.sysfs_path.display()
                )))
            } else {
                Err(ProbeFailure::Unavailable(format!(
                    "{} not present",
                    class_block.display()
                )))
            }
        }
        Err(e) => Err(ProbeFailure::Error(format!(
            "failed to stat {}: {}",
            handle.sysfs_path.display(),
            e
        ))),
    }
}

/// Read a sysfs attribute, trimmed; blank or unreadable yields `None`
pub(crate) async fn read_attr(base: &Path, attr: &str) -> Option<String> {
    tokio::fs::read_to_string(base.join(attr))
        .await
        .ok()
        .and_then(non_empty)
}

async fn first_attr(base: &Path, attrs: &[&str]) -> Option<String> {
    for attr in attrs {
        if let Some(value) = read_attr(base, attr).await {
            return Some(value);
        }
    }
    None
}

async fn parse_attr<T: std::str::FromStr>(base: &Path, attr: &str) -> Option<T> {
    read_attr(base, attr).await.and_then(|v| v.parse().ok())
}
