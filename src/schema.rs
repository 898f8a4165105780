//! Data model for device stores
//!
//! Rows are decoded into these types once, at the store boundary. Everything
//! downstream works on validated device types and permission digits.

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Store layout constants
pub mod layout {
    /// Directory holding the store, relative to a data directory
    pub const STORE_DIR: &str = ".dbs";
    /// Store file name inside [`STORE_DIR`]
    pub const STORE_FILE: &str = "dev.db";
}

/// Path of the device store kept under `dir` (`<dir>/.dbs/dev.db`)
pub fn store_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(layout::STORE_DIR).join(layout::STORE_FILE)
}

/// Device node type, matching the seeded rows of the `types` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Block,
    Character,
    Socket,
    Unknown,
}

impl DeviceType {
    /// Types that have a row in the `types` table
    pub const SEEDED: [DeviceType; 3] = [DeviceType::Block, DeviceType::Character, DeviceType::Socket];

    /// Row id in the `types` table (`-1` for [`DeviceType::Unknown`])
    pub fn id(self) -> i64 {
        match self {
            DeviceType::Block => 0,
            DeviceType::Character => 1,
            DeviceType::Socket => 2,
            DeviceType::Unknown => -1,
        }
    }

    pub fn from_id(id: i64) -> Self {
        match id {
            0 => DeviceType::Block,
            1 => DeviceType::Character,
            2 => DeviceType::Socket,
            _ => DeviceType::Unknown,
        }
    }

    /// Name stored in the `types` table
    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Block => "block",
            DeviceType::Character => "character",
            DeviceType::Socket => "socket",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Type from the first character of an `ls -l` mode column
    pub fn from_ls_letter(letter: char) -> Self {
        match letter {
            'b' => DeviceType::Block,
            'c' => DeviceType::Character,
            's' => DeviceType::Socket,
            _ => DeviceType::Unknown,
        }
    }

    /// Type from the `%F` field of `stat`
    pub fn from_stat_name(name: &str) -> Self {
        match name.trim() {
            "block special file" | "block device" => DeviceType::Block,
            "character special file" | "character device" => DeviceType::Character,
            "socket" => DeviceType::Socket,
            _ => DeviceType::Unknown,
        }
    }

    /// Sockets carry no major/minor numbers
    pub fn has_numbers(self) -> bool {
        matches!(self, DeviceType::Block | DeviceType::Character)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classic owner/group/other octal access bits, plus the optional leading
/// setuid/setgid/sticky digit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permissions {
    pub special: u8,
    pub owner: u8,
    pub group: u8,
    pub other: u8,
}

impl Permissions {
    pub fn new(owner: u8, group: u8, other: u8) -> Self {
        Self {
            special: 0,
            owner,
            group,
            other,
        }
    }

    /// Parse an octal digit string such as `"660"`, `"60"` or `"2750"`.
    ///
    /// Missing leading digits are zero, as `stat %a` drops them.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s.len() > 4 {
            return None;
        }
        let mut digits = [0u8; 4];
        let offset = 4 - s.len();
        for (i, c) in s.chars().enumerate() {
            let d = c.to_digit(8)?;
            digits[offset + i] = d as u8;
        }
        Some(Self {
            special: digits[0],
            owner: digits[1],
            group: digits[2],
            other: digits[3],
        })
    }

    /// Decode the integer stored in the `permissions` column
    pub fn from_stored(value: i64) -> Option<Self> {
        if !(0..=7777).contains(&value) {
            return None;
        }
        Self::parse(&value.to_string())
    }

    /// Integer written to the `permissions` column (`"660"` -> 660)
    pub fn to_stored(self) -> i64 {
        i64::from(self.special) * 1000
            + i64::from(self.owner) * 100
            + i64::from(self.group) * 10
            + i64::from(self.other)
    }

    /// `(owner, group, other)` digits
    pub fn digits(self) -> (u8, u8, u8) {
        (self.owner, self.group, self.other)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.special != 0 {
            write!(f, "{}", self.special)?;
        }
        write!(f, "{}{}{}", self.owner, self.group, self.other)
    }
}

impl TryFrom<String> for Permissions {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Permissions::parse(&value).ok_or_else(|| format!("invalid permissions: {value}"))
    }
}

impl From<Permissions> for String {
    fn from(p: Permissions) -> Self {
        p.to_string()
    }
}

/// One device node snapshot (a row of `devices`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Absolute path of the node
    pub name: String,
    pub device_type: DeviceType,
    pub permissions: Permissions,
    pub owner_name: String,
    pub group_name: String,
    /// Major number as scanned (hexadecimal), absent for sockets
    pub major: Option<String>,
    pub minor: Option<String>,
}

impl Device {
    /// Major number as an integer.
    ///
    /// `Ok(None)` for sockets and blank majors.
    pub fn major_number(&self) -> Result<Option<u32>> {
        match self.major.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(hex) => {
                let digits = hex
                    .strip_prefix("0x")
                    .or_else(|| hex.strip_prefix("0X"))
                    .unwrap_or(hex);
                u32::from_str_radix(digits, 16).map(Some).map_err(|e| {
                    AuditError::malformed(&self.name, format!("major {hex:?} is not hexadecimal: {e}"))
                })
            }
        }
    }
}

/// Major number to subsystem name association (a row of `mappings`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub name: String,
    pub number: u32,
    pub device_type: DeviceType,
}

impl Mapping {
    pub fn new(name: impl Into<String>, number: u32, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            number,
            device_type,
        }
    }
}
