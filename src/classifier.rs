//! Exposure classification
//!
//! A device is exposed to the acting identity when its access bits let that
//! identity (or anyone, through "other") open it:
//!
//! ```text
//! other != 0  ||  user == owner  ||  (group in groups && group_digit != 0)
//! ```
//!
//! With `new_only`, devices whose name also appears in the baseline store are
//! skipped before the predicate is evaluated.

use crate::{
    error::{AuditError, Result},
    mapper::{Subsystem, SubsystemMapper},
    schema::{Device, DeviceType, Permissions},
    store::DeviceStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    str::FromStr,
};
use tracing::{debug, info};

/// Identity of an unprivileged remote shell session
pub const DEFAULT_USER: &str = "shell";

/// Supplementary groups of a remote shell session
pub const DEFAULT_GROUPS: &[&str] = &[
    "shell",
    "input",
    "log",
    "adb",
    "sdcard_rw",
    "sdcard_r",
    "net_bt_admin",
    "net_bt",
    "inet",
    "net_bw_stats",
    "readproc",
    "uhid",
];

/// Device types a report can be filtered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFilter {
    Block,
    Char,
    Socket,
}

impl DeviceFilter {
    pub const ALL: [DeviceFilter; 3] = [DeviceFilter::Block, DeviceFilter::Char, DeviceFilter::Socket];

    pub fn device_type(self) -> DeviceType {
        match self {
            DeviceFilter::Block => DeviceType::Block,
            DeviceFilter::Char => DeviceType::Character,
            DeviceFilter::Socket => DeviceType::Socket,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            DeviceFilter::Block => "block",
            DeviceFilter::Char => "char",
            DeviceFilter::Socket => "socket",
        }
    }

    /// Parse a comma separated filter list such as `block,char`.
    ///
    /// Every token must be a known filter and the list must not be empty.
    /// Repeated tokens keep their first position.
    pub fn parse_list(list: &str) -> Result<Vec<DeviceFilter>> {
        let mut filters = Vec::new();
        for token in list.split(',') {
            let filter: DeviceFilter = token.parse()?;
            if !filters.contains(&filter) {
                filters.push(filter);
            }
        }
        Ok(filters)
    }
}

impl FromStr for DeviceFilter {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "block" => Ok(DeviceFilter::Block),
            "char" => Ok(DeviceFilter::Char),
            "socket" => Ok(DeviceFilter::Socket),
            "" => Err(AuditError::Validation("empty device filter".to_string())),
            other => Err(AuditError::Validation(format!(
                "unknown device filter {other:?} (expected block, char or socket)"
            ))),
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Who exposure is evaluated against, and which devices to report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposurePolicy {
    filters: Vec<DeviceFilter>,
    acting_user: String,
    acting_groups: BTreeSet<String>,
    new_only: bool,
}

impl ExposurePolicy {
    /// Build a policy; an empty filter list is rejected.
    pub fn new(
        filters: Vec<DeviceFilter>,
        acting_user: impl Into<String>,
        acting_groups: impl IntoIterator<Item = impl Into<String>>,
        new_only: bool,
    ) -> Result<Self> {
        if filters.is_empty() {
            return Err(AuditError::Validation("no device filters given".to_string()));
        }
        let acting_user = acting_user.into();
        if acting_user.trim().is_empty() {
            return Err(AuditError::Validation("acting user is empty".to_string()));
        }

        Ok(Self {
            filters,
            acting_user,
            acting_groups: acting_groups.into_iter().map(Into::into).collect(),
            new_only,
        })
    }

    pub fn filters(&self) -> &[DeviceFilter] {
        &self.filters
    }

    pub fn acting_user(&self) -> &str {
        &self.acting_user
    }

    pub fn acting_groups(&self) -> &BTreeSet<String> {
        &self.acting_groups
    }

    pub fn new_only(&self) -> bool {
        self.new_only
    }

    /// Whether the acting identity can access a node with these attributes
    pub fn is_exposed(&self, permissions: Permissions, owner: &str, group: &str) -> bool {
        let (_, group_digit, other_digit) = permissions.digits();
        other_digit != 0
            || self.acting_user == owner
            || (self.acting_groups.contains(group) && group_digit != 0)
    }

    pub fn exposes(&self, device: &Device) -> bool {
        self.is_exposed(device.permissions, &device.owner_name, &device.group_name)
    }
}

impl Default for ExposurePolicy {
    fn default() -> Self {
        Self {
            filters: DeviceFilter::ALL.to_vec(),
            acting_user: DEFAULT_USER.to_string(),
            acting_groups: DEFAULT_GROUPS.iter().map(|g| g.to_string()).collect(),
            new_only: false,
        }
    }
}

/// An exposed device as reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedDevice {
    pub name: String,
    pub permissions: Permissions,
    pub owner: String,
    pub group: String,
    /// Integer major, for block and character devices whose major parsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    /// The scanned major could not be parsed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unmappable: bool,
}

/// Exposed devices of one requested type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureGroup {
    pub filter: DeviceFilter,
    pub devices: Vec<ClassifiedDevice>,
}

/// Result of a classification pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureReport {
    pub generated_at: DateTime<Utc>,
    pub acting_user: String,
    pub acting_groups: Vec<String>,
    pub new_only: bool,
    pub groups: Vec<ExposureGroup>,
}

impl ExposureReport {
    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.devices.len()).sum()
    }

    pub fn group(&self, filter: DeviceFilter) -> Option<&ExposureGroup> {
        self.groups.iter().find(|g| g.filter == filter)
    }
}

/// Classify the devices of `local` against `policy`, using `baseline` for
/// the `new_only` diff.
pub async fn classify(
    local: &DeviceStore,
    baseline: &DeviceStore,
    policy: &ExposurePolicy,
) -> Result<ExposureReport> {
    let known: HashSet<String> = if policy.new_only() {
        baseline.device_names().await?
    } else {
        HashSet::new()
    };

    let mapper = SubsystemMapper::new(local);
    let mut groups = Vec::with_capacity(policy.filters().len());

    for &filter in policy.filters() {
        let devices = local.devices_by_type(filter.device_type()).await?;
        let scanned = devices.len();
        let mut exposed = Vec::new();

        for device in devices {
            if policy.new_only() && known.contains(&device.name) {
                continue;
            }
            if !policy.exposes(&device) {
                continue;
            }
            exposed.push(classify_device(&mapper, device).await?);
        }

        exposed.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(%filter, scanned, exposed = exposed.len(), "classified devices");
        groups.push(ExposureGroup {
            filter,
            devices: exposed,
        });
    }

    let report = ExposureReport {
        generated_at: Utc::now(),
        acting_user: policy.acting_user().to_string(),
        acting_groups: policy.acting_groups().iter().cloned().collect(),
        new_only: policy.new_only(),
        groups,
    };
    info!(exposed = report.total(), "classification finished");
    Ok(report)
}

async fn classify_device(mapper: &SubsystemMapper<'_>, device: Device) -> Result<ClassifiedDevice> {
    let (major, subsystem, unmappable) = match mapper.resolve(&device).await? {
        Subsystem::NotApplicable => (None, None, false),
        Subsystem::Resolved { major, name } => (Some(major), name, false),
        Subsystem::Unmappable { .. } => (None, None, true),
    };

    Ok(ClassifiedDevice {
        name: device.name,
        permissions: device.permissions,
        owner: device.owner_name,
        group: device.group_name,
        major,
        subsystem,
        unmappable,
    })
}
