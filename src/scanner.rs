//! Device scanning and inventory build
//!
//! The scanner reaches the target through a shell and returns raw `ls -ld`
//! and `stat` lines per node. Nodes are described in batches so a remote
//! target costs one round trip per batch instead of per node.

use crate::{
    error::{AuditError, Result},
    mapper::parse_registry,
    schema::{Device, DeviceType, Permissions},
    store::DeviceStore,
};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default number of nodes described per shell invocation
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default root walked for device nodes
pub const DEFAULT_ROOT: &str = "/dev";

const NODE_MARKER: &str = "@@node ";

/// Raw scanner output for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNode {
    pub path: String,
    /// `ls -ld` line: mode, links, owner, group, ...
    pub ls_line: String,
    /// `stat -c '%F %a %t %T'` line
    pub stat_line: String,
}

/// Access to the target whose device nodes are inventoried
#[async_trait]
pub trait DeviceScanner: Send + Sync {
    /// Platform (SDK/API) version of the target
    async fn platform_version(&self) -> Result<String>;

    /// Raw kernel registry of majors (`/proc/devices`)
    async fn subsystem_registry(&self) -> Result<String>;

    /// Paths of all block, character and socket nodes under `root`
    async fn list_nodes(&self, root: &str) -> Result<Vec<String>>;

    /// Describe the given nodes, in order
    async fn describe(&self, paths: &[String]) -> Result<Vec<RawNode>>;

    fn batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }
}

/// Scanner driving a shell command: `sh -c` locally, `adb shell` remotely
#[derive(Debug, Clone)]
pub struct ShellScanner {
    command: Vec<String>,
    batch_size: usize,
}

impl ShellScanner {
    /// `command` is split on whitespace; the script is appended as one argument.
    ///
    /// Quotes are not interpreted, so an argument containing spaces cannot be
    /// passed. Wrap such a command in a script and point `shell` at it.
    pub fn new(command: &str) -> Result<Self> {
        let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if command.is_empty() {
            return Err(AuditError::Config("empty shell command".to_string()));
        }
        Ok(Self {
            command,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn run(&self, script: &str) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AuditError::Config("empty shell command".to_string()))?;

        debug!(%program, bytes = script.len(), "running shell script");
        let output = Command::new(program)
            .args(args)
            .arg(script)
            .output()
            .await
            .map_err(|e| AuditError::Scanner(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            return Err(AuditError::Scanner(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DeviceScanner for ShellScanner {
    async fn platform_version(&self) -> Result<String> {
        let out = self.run("getprop ro.build.version.sdk").await?;
        let version = out.trim();
        if version.is_empty() {
            return Err(AuditError::Scanner("platform version unavailable".to_string()));
        }
        Ok(version.to_string())
    }

    async fn subsystem_registry(&self) -> Result<String> {
        self.run("cat /proc/devices").await
    }

    async fn list_nodes(&self, root: &str) -> Result<Vec<String>> {
        let script = format!(
            "find {} \\( -type b -o -type c -o -type s \\) 2>/dev/null; exit 0",
            shell_quote(root)
        );
        let out = self.run(&script).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn describe(&self, paths: &[String]) -> Result<Vec<RawNode>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let out = self.run(&describe_script(paths)).await?;
        Ok(parse_describe_output(&out))
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn describe_script(paths: &[String]) -> String {
    let mut script = String::new();
    for path in paths {
        let quoted = shell_quote(path);
        script.push_str(&format!(
            "echo {marker}{quoted}; ls -ld {quoted} 2>/dev/null; stat -c '%F %a %t %T' {quoted} 2>/dev/null; ",
            marker = shell_quote(NODE_MARKER),
        ));
    }
    script.push_str("exit 0");
    script
}

/// Split batched describe output into per-node records.
///
/// Lines missing for a node come back empty and fail to parse later.
pub fn parse_describe_output(out: &str) -> Vec<RawNode> {
    let mut nodes: Vec<(String, Vec<String>)> = Vec::new();
    for line in out.lines() {
        if let Some(path) = line.strip_prefix(NODE_MARKER) {
            nodes.push((path.to_string(), Vec::new()));
        } else if let Some((_, lines)) = nodes.last_mut() {
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
    }

    nodes
        .into_iter()
        .map(|(path, lines)| {
            let mut lines = lines.into_iter();
            RawNode {
                path,
                ls_line: lines.next().unwrap_or_default(),
                stat_line: lines.next().unwrap_or_default(),
            }
        })
        .collect()
}

/// Fields taken from an `ls -ld` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsFields {
    pub device_type: DeviceType,
    pub owner: String,
    pub group: String,
}

pub fn parse_ls_line(path: &str, line: &str) -> Result<LsFields> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 || fields[0].len() < 10 {
        return Err(AuditError::malformed(path, format!("bad ls line {line:?}")));
    }
    let letter = fields[0].chars().next().unwrap_or('?');

    Ok(LsFields {
        device_type: DeviceType::from_ls_letter(letter),
        owner: fields[2].to_string(),
        group: fields[3].to_string(),
    })
}

/// Fields taken from a `stat -c '%F %a %t %T'` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub device_type: DeviceType,
    pub permissions: Permissions,
    /// Hexadecimal, as printed by `%t`
    pub major: String,
    /// Hexadecimal, as printed by `%T`
    pub minor: String,
}

pub fn parse_stat_line(path: &str, line: &str) -> Result<StatFields> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let n = fields.len();
    if n < 4 {
        return Err(AuditError::malformed(path, format!("bad stat line {line:?}")));
    }
    // The file type may span several words
    let type_name = fields[..n - 3].join(" ");
    let permissions = Permissions::parse(fields[n - 3]).ok_or_else(|| {
        AuditError::malformed(path, format!("bad permissions {:?}", fields[n - 3]))
    })?;

    Ok(StatFields {
        device_type: DeviceType::from_stat_name(&type_name),
        permissions,
        major: fields[n - 2].to_string(),
        minor: fields[n - 1].to_string(),
    })
}

/// Turn one node's raw lines into a [`Device`]
pub fn to_device(node: &RawNode) -> Result<Device> {
    let ls = parse_ls_line(&node.path, &node.ls_line)?;
    let stat = parse_stat_line(&node.path, &node.stat_line)?;

    if ls.device_type == DeviceType::Unknown {
        return Err(AuditError::malformed(&node.path, "not a device node"));
    }
    if ls.device_type != stat.device_type {
        return Err(AuditError::malformed(
            &node.path,
            format!("ls reports {} but stat reports {}", ls.device_type, stat.device_type),
        ));
    }

    let (major, minor) = if ls.device_type.has_numbers() {
        (Some(stat.major), Some(stat.minor))
    } else {
        (None, None)
    };

    Ok(Device {
        name: node.path.clone(),
        device_type: ls.device_type,
        permissions: stat.permissions,
        owner_name: ls.owner,
        group_name: ls.group,
        major,
        minor,
    })
}

/// Counts from an inventory build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventorySummary {
    pub mappings: usize,
    pub devices: usize,
    pub skipped: usize,
}

/// Scan the target and fill an empty store.
///
/// Scanner failures abort; nodes whose lines cannot be parsed are skipped.
pub async fn populate(
    scanner: &dyn DeviceScanner,
    store: &DeviceStore,
    root: &str,
) -> Result<InventorySummary> {
    let registry = scanner.subsystem_registry().await?;
    let mappings = parse_registry(&registry);
    store.insert_mappings(&mappings).await?;
    info!(count = mappings.len(), "stored subsystem mappings");

    let paths = scanner.list_nodes(root).await?;
    if paths.is_empty() {
        warn!(%root, "no device nodes found");
    }

    let mut devices = Vec::with_capacity(paths.len());
    let mut skipped = 0;
    for batch in paths.chunks(scanner.batch_size().max(1)) {
        for node in scanner.describe(batch).await? {
            match to_device(&node) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    warn!(path = %node.path, error = %e, "skipping node");
                    skipped += 1;
                }
            }
        }
        debug!(scanned = devices.len() + skipped, total = paths.len(), "described batch");
    }

    store.insert_devices(&devices).await?;
    info!(count = devices.len(), skipped, "stored devices");

    Ok(InventorySummary {
        mappings: mappings.len(),
        devices: devices.len(),
        skipped,
    })
}

/// Reset the store's schema, then [`populate`] it
pub async fn build_inventory(
    scanner: &dyn DeviceScanner,
    store: &DeviceStore,
    root: &str,
) -> Result<InventorySummary> {
    store.reset_schema().await?;
    populate(scanner, store, root).await
}
