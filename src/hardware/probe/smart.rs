//! SMART Probe
//!
//! Identification and health data from smartmontools' JSON output.
//! Hosts without smartctl, or devices that do not speak SMART, yield
//! `Unavailable` rather than an error.

use super::{non_empty, DeviceAttributes, DeviceHandle, ProbeContext, ProbeFailure, ProbeResult};
use crate::domain::{DriveType, HealthAttributes};
use std::io::ErrorKind;
use tokio::process::Command;
use tracing::debug;

/// smartctl exit status bit: device open failed
const SMARTCTL_OPEN_FAILED: i32 = 1 << 1;

pub async fn probe(handle: &DeviceHandle, ctx: &ProbeContext) -> ProbeResult {
    let output = Command::new(&ctx.smartctl_path)
        .args(["-i", "-A", "-H", "-j", &handle.dev_path])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                ProbeFailure::Unavailable(format!("{} not installed", ctx.smartctl_path))
            }
            _ => ProbeFailure::Error(format!("smartctl failed for {}: {}", handle.dev_path, e)),
        })?;

    // smartctl sets status bits for warnings as well; only a failed open
    // means there is nothing to read
    if let Some(code) = output.status.code() {
        if code & SMARTCTL_OPEN_FAILED != 0 {
            debug!(device = %handle.dev_path, code, "smartctl could not open device");
            return Err(ProbeFailure::Unavailable(format!(
                "smartctl could not open {}",
                handle.dev_path
            )));
        }
    }

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|e| {
        ProbeFailure::Error(format!(
            "smartctl JSON parse error for {}: {}",
            handle.dev_path, e
        ))
    })?;

    Ok(parse_smartctl_json(&json))
}

/// Extract attributes from `smartctl -i -A -H -j` output
pub fn parse_smartctl_json(json: &serde_json::Value) -> DeviceAttributes {
    let device_type = json["device"]["type"].as_str().unwrap_or_default();
    let is_nvme = device_type == "nvme";

    let drive_type = if is_nvme {
        Some(DriveType::Ssd)
    } else {
        match json["rotation_rate"].as_u64() {
            Some(0) => Some(DriveType::Ssd),
            Some(_) => Some(DriveType::Hdd),
            None => None,
        }
    };

    let model = json["model_name"]
        .as_str()
        .or_else(|| json["scsi_model_name"].as_str())
        .and_then(non_empty);

    let vendor = json["vendor"]
        .as_str()
        .or_else(|| json["scsi_vendor"].as_str())
        .and_then(non_empty);

    DeviceAttributes {
        serial: json["serial_number"].as_str().and_then(non_empty),
        wwn: parse_wwn(&json["wwn"]),
        model,
        vendor,
        firmware: json["firmware_version"]
            .as_str()
            .or_else(|| json["scsi_revision"].as_str())
            .and_then(non_empty),
        capacity_bytes: json["user_capacity"]["bytes"].as_u64().filter(|b| *b > 0),
        logical_block_size: json["logical_block_size"].as_u64().map(|v| v as u32),
        physical_block_size: json["physical_block_size"].as_u64().map(|v| v as u32),
        drive_type,
        health: parse_health(json, is_nvme),
        ..Default::default()
    }
}

/// NAA formatted WWN from the `{naa, oui, id}` object
fn parse_wwn(wwn: &serde_json::Value) -> Option<String> {
    let naa = wwn["naa"].as_u64()?;
    let oui = wwn["oui"].as_u64()?;
    let id = wwn["id"].as_u64()?;
    Some(format!("0x{:x}{:06x}{:09x}", naa, oui, id))
}

fn parse_health(json: &serde_json::Value, is_nvme: bool) -> Option<HealthAttributes> {
    let passed = json["smart_status"]["passed"].as_bool();
    let attrs = &json["ata_smart_attributes"]["table"];
    let nvme_log = &json["nvme_smart_health_information_log"];

    let temperature_celsius = json["temperature"]["current"]
        .as_i64()
        .map(|v| v as i32)
        .or_else(|| find_smart_attr(attrs, &[194, 190]).map(|v| (v & 0xff) as i32));

    let percentage_used = if is_nvme {
        nvme_log["percentage_used"].as_u64().map(|v| v.min(255) as u8)
    } else {
        // Wear leveling attributes count down from 100
        find_smart_attr_value(attrs, &[177, 231, 233]).map(|v| 100u64.saturating_sub(v) as u8)
    };

    let power_on_hours = json["power_on_time"]["hours"]
        .as_u64()
        .or_else(|| find_smart_attr(attrs, &[9]));

    let health = HealthAttributes {
        passed,
        temperature_celsius,
        percentage_used,
        power_on_hours,
    };

    if health == HealthAttributes::default() {
        None
    } else {
        Some(health)
    }
}

// Raw value of the first matching SMART attribute
fn find_smart_attr(attrs: &serde_json::Value, ids: &[u32]) -> Option<u64> {
    find_attr(attrs, ids).and_then(|attr| attr["raw"]["value"].as_u64())
}

// Normalized value of the first matching SMART attribute
fn find_smart_attr_value(attrs: &serde_json::Value, ids: &[u32]) -> Option<u64> {
    find_attr(attrs, ids).and_then(|attr| attr["value"].as_u64())
}

fn find_attr<'a>(attrs: &'a serde_json::Value, ids: &[u32]) -> Option<&'a serde_json::Value> {
    attrs.as_array()?.iter().find(|attr| {
        attr["id"]
            .as_u64()
            .map(|id| ids.contains(&(id as u32)))
            .unwrap_or(false)
    })
}
