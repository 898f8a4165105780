//! Major number to subsystem name resolution
//!
//! Mappings come from the kernel's registry of character and block majors
//! (`/proc/devices`). The same number can name different subsystems for the
//! two types, so lookups on behalf of a device are scoped by its type.

use crate::{
    error::Result,
    schema::{Device, DeviceType, Mapping},
    store::DeviceStore,
};
use tracing::warn;

/// Outcome of resolving a device's major number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subsystem {
    /// Sockets carry no numbers
    NotApplicable,
    /// Major parsed; the name may still be unknown to the store
    Resolved { major: u32, name: Option<String> },
    /// The scanned major could not be parsed
    Unmappable { raw: String },
}

/// Resolves major numbers against a store's `mappings` table
pub struct SubsystemMapper<'a> {
    store: &'a DeviceStore,
}

impl<'a> SubsystemMapper<'a> {
    pub fn new(store: &'a DeviceStore) -> Self {
        Self { store }
    }

    /// First mapping with this number, regardless of type
    pub async fn lookup(&self, major: u32) -> Result<Option<String>> {
        self.store.subsystem_name(major).await
    }

    /// First mapping with this number among mappings of `device_type`
    pub async fn lookup_typed(&self, major: u32, device_type: DeviceType) -> Result<Option<String>> {
        self.store.subsystem_name_for(major, device_type).await
    }

    /// Resolve the subsystem of a single device.
    ///
    /// A malformed major only affects this device and comes back as
    /// [`Subsystem::Unmappable`]; store failures are still errors.
    pub async fn resolve(&self, device: &Device) -> Result<Subsystem> {
        if !device.device_type.has_numbers() {
            return Ok(Subsystem::NotApplicable);
        }

        match device.major_number() {
            Ok(Some(major)) => {
                let name = self.lookup_typed(major, device.device_type).await?;
                Ok(Subsystem::Resolved { major, name })
            }
            Ok(None) => Ok(Subsystem::Unmappable { raw: String::new() }),
            Err(e) => {
                warn!(device = %device.name, error = %e, "cannot map device major");
                Ok(Subsystem::Unmappable {
                    raw: device.major.clone().unwrap_or_default(),
                })
            }
        }
    }
}

/// Parse the kernel registry of majors (`/proc/devices` format).
///
/// ```text
/// Character devices:
///   1 mem
///  10 misc
///
/// Block devices:
/// 179 mmc
/// ```
///
/// Lines outside a known section, or that do not start with a number, are
/// ignored.
pub fn parse_registry(text: &str) -> Vec<Mapping> {
    let mut section = DeviceType::Unknown;
    let mut mappings = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_suffix(':') {
            section = match header.to_ascii_lowercase().as_str() {
                "character devices" => DeviceType::Character,
                "block devices" => DeviceType::Block,
                _ => DeviceType::Unknown,
            };
            continue;
        }
        if section == DeviceType::Unknown {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(number), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(number) = number.parse::<u32>() {
            mappings.push(Mapping::new(name, number, section));
        }
    }

    mappings
}
