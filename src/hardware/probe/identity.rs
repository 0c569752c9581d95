//! Device Identity Resolution
//!
//! Derives the stable `blockdevice-<hex>` key from merged attributes. The
//! key must survive reboots and path reordering, so the OS path is only
//! ever used by the legacy scheme for devices without any hardware
//! identifier.

use super::DeviceAttributes;
use crate::config::{Feature, FeatureGates};
use crate::domain::DeviceIdentity;
use sha2::{Digest, Sha256};

/// Prefix of every device identity
pub const IDENTITY_PREFIX: &str = "blockdevice-";

/// Bytes of the digest kept in the identity
const IDENTITY_DIGEST_LEN: usize = 16;

/// Resolve the identity of a device, or `None` when the attributes carry
/// nothing stable enough to key on
pub fn resolve_identity(
    attrs: &DeviceAttributes,
    host: &str,
    path: &str,
    gates: &FeatureGates,
) -> Option<DeviceIdentity> {
    if gates.is_enabled(Feature::GptBasedUuid) {
        resolve_hardware_identity(attrs, gates)
    } else {
        Some(resolve_legacy_identity(attrs, host, path))
    }
}

fn resolve_hardware_identity(
    attrs: &DeviceAttributes,
    gates: &FeatureGates,
) -> Option<DeviceIdentity> {
    if let Some(wwn) = &attrs.wwn {
        let serial = attrs.serial.as_deref().unwrap_or_default();
        return Some(digest(&["wwn", wwn, serial]));
    }

    if let Some(serial) = &attrs.serial {
        return Some(digest(&[
            "serial",
            serial,
            attrs.model.as_deref().unwrap_or_default(),
            attrs.vendor.as_deref().unwrap_or_default(),
        ]));
    }

    if gates.is_enabled(Feature::PartitionTableUuid) {
        if let Some(pt_uuid) = &attrs.partition_table_uuid {
            return Some(digest(&["ptuuid", pt_uuid]));
        }
    }

    attrs
        .fs_uuid
        .as_deref()
        .map(|fs_uuid| digest(&["fsuuid", fs_uuid]))
}

fn resolve_legacy_identity(attrs: &DeviceAttributes, host: &str, path: &str) -> DeviceIdentity {
    let wwn = attrs.wwn.as_deref().unwrap_or_default();
    let serial = attrs.serial.as_deref().unwrap_or_default();
    let model = attrs.model.as_deref().unwrap_or_default();
    let vendor = attrs.vendor.as_deref().unwrap_or_default();

    if !wwn.is_empty() || !serial.is_empty() {
        digest(&[wwn, model, serial, vendor])
    } else {
        digest(&[host, path, model, vendor])
    }
}

// Parts are NUL separated so ("ab", "c") and ("a", "bc") differ
fn digest(parts: &[&str]) -> DeviceIdentity {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let hash = hasher.finalize();

    let hex: String = hash[..IDENTITY_DIGEST_LEN]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    DeviceIdentity::new(format!("{}{}", IDENTITY_PREFIX, hex))
}
