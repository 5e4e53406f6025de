//! Static device database: which peripheral sits on which RTIO channel.
//!
//! The database is keyed by device name; iteration order is the name order
//! (BTreeMap), which makes channel enumeration and therefore VCD/channel-list
//! output deterministic.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// DDS chip variants with distinct register maps.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DdsVariant {
    Ad9858,
    Ad9914,
}

/// One local device entry relevant to analyzer replay.
#[derive(Clone, Debug, PartialEq)]
pub enum Device {
    Core {
        ref_period: f64,
    },
    TtlOut {
        channel: u32,
    },
    TtlInOut {
        channel: u32,
    },
    TtlClockGen {
        channel: u32,
    },
    Dds {
        bus_channel: u32,
        channel: u32,
        variant: DdsVariant,
        sysclk: f64,
    },
    /// Wishbone SPI master, first revision.
    SpiMaster {
        channel: u32,
    },
    /// Second revision with the packed config register.
    SpiMaster2 {
        channel: u32,
    },
}

pub type DeviceDb = BTreeMap<String, Device>;

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    module: String,
    #[serde(default)]
    class: String,
    #[serde(default)]
    arguments: serde_json::Map<String, Value>,
}

fn argument_u32(entry: &RawEntry, name: &str) -> Result<u32> {
    entry
        .arguments
        .get(name)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .with_context(|| format!("device argument {name:?} missing or out of range"))
}

fn argument_f64(entry: &RawEntry, name: &str) -> Result<f64> {
    entry
        .arguments
        .get(name)
        .and_then(Value::as_f64)
        .with_context(|| format!("device argument {name:?} missing or not a number"))
}

/// Parse a device database file (JSON, one object per device name).
///
/// Entries that are not local devices, or devices this decoder knows nothing
/// about, are skipped; their channels simply get no handler.
pub fn parse_device_db(json: &str) -> Result<DeviceDb> {
    let raw: BTreeMap<String, Value> = serde_json::from_str(json).context("device database")?;

    let mut devices = DeviceDb::new();
    for (name, value) in raw {
        // Aliases and controller entries are irrelevant here.
        if !value.is_object() {
            continue;
        }
        let entry: RawEntry = serde_json::from_value(value)
            .with_context(|| format!("device database entry {name:?}"))?;
        if entry.ty != "local" {
            continue;
        }

        let device = match (entry.module.as_str(), entry.class.as_str()) {
            ("artiq.coredevice.core", "Core") => Device::Core {
                ref_period: argument_f64(&entry, "ref_period")?,
            },
            ("artiq.coredevice.ttl", "TTLOut") => Device::TtlOut {
                channel: argument_u32(&entry, "channel")?,
            },
            ("artiq.coredevice.ttl", "TTLInOut") => Device::TtlInOut {
                channel: argument_u32(&entry, "channel")?,
            },
            ("artiq.coredevice.ttl", "TTLClockGen") => Device::TtlClockGen {
                channel: argument_u32(&entry, "channel")?,
            },
            ("artiq.coredevice.ad9858", "AD9858") => Device::Dds {
                bus_channel: argument_u32(&entry, "bus_channel")?,
                channel: argument_u32(&entry, "channel")?,
                variant: DdsVariant::Ad9858,
                sysclk: argument_f64(&entry, "sysclk")?,
            },
            ("artiq.coredevice.ad9914", "AD9914") => Device::Dds {
                bus_channel: argument_u32(&entry, "bus_channel")?,
                channel: argument_u32(&entry, "channel")?,
                variant: DdsVariant::Ad9914,
                sysclk: argument_f64(&entry, "sysclk")?,
            },
            ("artiq.coredevice.spi", "SPIMaster") => Device::SpiMaster {
                channel: argument_u32(&entry, "channel")?,
            },
            ("artiq.coredevice.spi2", "SPIMaster") => Device::SpiMaster2 {
                channel: argument_u32(&entry, "channel")?,
            },
            _ => continue,
        };
        devices.insert(name, device);
    }
    Ok(devices)
}

/// Scan for the core device's `ref_period`. Returns None both when no core
/// device exists and when several disagree; callers fall back to a default
/// with a warning either way.
pub fn ref_period(devices: &DeviceDb) -> Option<f64> {
    let mut found = None;
    for device in devices.values() {
        if let Device::Core { ref_period } = device {
            match found {
                None => found = Some(*ref_period),
                Some(value) if value != *ref_period => return None,
                Some(_) => {}
            }
        }
    }
    found
}

/// Scan for the DDS system clock, with the same indeterminate-on-conflict
/// behaviour as [`ref_period`].
pub fn dds_sysclk(devices: &DeviceDb) -> Option<f64> {
    let mut found = None;
    for device in devices.values() {
        if let Device::Dds { sysclk, .. } = device {
            match found {
                None => found = Some(*sysclk),
                Some(value) if value != *sysclk => return None,
                Some(_) => {}
            }
        }
    }
    found
}
