//! Mount Probe
//!
//! Mount points of a device and its partitions, matched against the mount
//! table by `major:minor`. Matching by device number rather than source
//! path also catches bind mounts such as a container's `/etc/hosts`.

use super::blkid::child_partitions;
use super::sysfs::read_attr;
use super::{DeviceAttributes, DeviceHandle, ProbeContext, ProbeFailure, ProbeResult};
use std::collections::BTreeSet;
use std::io::ErrorKind;

/// One line of `/proc/<pid>/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// `major:minor` of the backing device
    pub dev: String,
    pub mount_point: String,
    pub fs_type: String,
}

pub async fn probe(handle: &DeviceHandle, ctx: &ProbeContext) -> ProbeResult {
    let Some(dev) = read_attr(&handle.sysfs_path, "dev").await else {
        return Err(ProbeFailure::Error(format!(
            "no device number for {}",
            handle.name
        )));
    };

    let mount_info = tokio::fs::read_to_string(&ctx.mountinfo_path)
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ProbeFailure::Unavailable(format!(
                "{} not present",
                ctx.mountinfo_path.display()
            )),
            _ => ProbeFailure::Error(format!(
                "failed to read {}: {}",
                ctx.mountinfo_path.display(),
                e
            )),
        })?;
    let entries = parse_mountinfo(&mount_info);

    let mut devs = vec![dev.clone()];
    for part in child_partitions(&handle.sysfs_path, &handle.name).await {
        if let Some(part_dev) = read_attr(&handle.sysfs_path.join(&part), "dev").await {
            devs.push(part_dev);
        }
    }

    let mount_points: BTreeSet<String> = entries
        .iter()
        .filter(|entry| devs.contains(&entry.dev))
        .map(|entry| entry.mount_point.clone())
        .collect();

    let fs_type = entries
        .iter()
        .find(|entry| entry.dev == dev)
        .map(|entry| entry.fs_type.clone());

    Ok(DeviceAttributes {
        mount_points: Some(mount_points.into_iter().collect()),
        fs_type,
        ..Default::default()
    })
}

/// Parse mountinfo, skipping malformed lines
pub fn parse_mountinfo(input: &str) -> Vec<MountEntry> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_mountinfo_line)
        .collect()
}

fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let (left, right) = line.split_once(" - ")?;

    let mut left_fields = left.split_whitespace();
    let dev = left_fields.nth(2)?;
    let mount_point = left_fields.nth(1)?;
    let fs_type = right.split_whitespace().next()?;

    Some(MountEntry {
        dev: dev.to_string(),
        mount_point: unescape_mount_field(mount_point),
        fs_type: fs_type.to_string(),
    })
}

// Octal escapes (`\040` for space) used by the kernel in mount fields.
// Decoded at the byte level; the result is UTF-8 again.
fn unescape_mount_field(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..index + 4].iter().all(u8::is_ascii_digit)
        {
            if let Ok(num) = u8::from_str_radix(&value[index + 1..index + 4], 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}
