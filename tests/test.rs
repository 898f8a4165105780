//! End-to-end: inventory build through a scanner, baseline resolution and
//! exposure classification.

use async_trait::async_trait;
use devaudit::{
    baseline::{BaselineResolver, BaselineSource, DirectoryPackageProvider},
    classifier::{classify, DeviceFilter, ExposurePolicy, DEFAULT_GROUPS},
    scanner::{build_inventory, DeviceScanner, RawNode},
    schema::store_path,
    AuditError, DeviceStore, DeviceType,
};
use std::{
    collections::HashMap,
    path::Path,
    process::{Command, Output, Stdio},
};
use tempfile::tempdir;

const PROC_DEVICES: &str = "Character devices:
  1 mem
 10 misc
239 kgsl

Block devices:
  1 ramdisk
179 mmc
";

/// Canned target: path -> (ls line, stat line)
struct FakeScanner {
    version: String,
    nodes: Vec<(String, String, String)>,
}

impl FakeScanner {
    fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            nodes: Vec::new(),
        }
    }

    fn node(mut self, path: &str, ls: &str, stat: &str) -> Self {
        self.nodes.push((path.to_string(), ls.to_string(), stat.to_string()));
        self
    }

    fn android() -> Self {
        Self::new("33")
            .node(
                "/dev/binder",
                "crw-rw-rw- 1 root root 10, 98 2024-01-01 00:00 /dev/binder",
                "character special file 666 a 62",
            )
            .node(
                "/dev/kgsl-3d0",
                "crw-rw---- 1 system graphics 239, 0 2024-01-01 00:00 /dev/kgsl-3d0",
                "character special file 660 ef 0",
            )
            .node(
                "/dev/block/mmcblk0",
                "brw------- 1 root root 179, 0 2024-01-01 00:00 /dev/block/mmcblk0",
                "block special file 600 b3 0",
            )
            .node(
                "/dev/socket/adbd",
                "srw-rw---- 1 system system 0 2024-01-01 00:00 /dev/socket/adbd",
                "socket 660 0 0",
            )
            .node("/dev/garbled", "???", "")
    }
}

#[async_trait]
impl DeviceScanner for FakeScanner {
    async fn platform_version(&self) -> devaudit::Result<String> {
        Ok(self.version.clone())
    }

    async fn subsystem_registry(&self) -> devaudit::Result<String> {
        Ok(PROC_DEVICES.to_string())
    }

    async fn list_nodes(&self, root: &str) -> devaudit::Result<Vec<String>> {
        Ok(self
            .nodes
            .iter()
            .map(|(path, _, _)| path.clone())
            .filter(|path| path.starts_with(root))
            .collect())
    }

    async fn describe(&self, paths: &[String]) -> devaudit::Result<Vec<RawNode>> {
        let known: HashMap<&str, (&str, &str)> = self
            .nodes
            .iter()
            .map(|(p, ls, stat)| (p.as_str(), (ls.as_str(), stat.as_str())))
            .collect();
        Ok(paths
            .iter()
            .map(|path| {
                let (ls, stat) = known.get(path.as_str()).copied().unwrap_or(("", ""));
                RawNode {
                    path: path.clone(),
                    ls_line: ls.to_string(),
                    stat_line: stat.to_string(),
                }
            })
            .collect())
    }

    fn batch_size(&self) -> usize {
        2
    }
}

async fn inventory(dir: &Path, scanner: &FakeScanner) -> DeviceStore {
    let store = DeviceStore::create(store_path(dir)).await.unwrap();
    let summary = build_inventory(scanner, &store, "/dev").await.unwrap();
    assert_eq!(summary.skipped, 1);
    store
}

fn names(report: &devaudit::ExposureReport, filter: DeviceFilter) -> Vec<String> {
    report
        .group(filter)
        .map(|g| g.devices.iter().map(|d| d.name.clone()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_inventory_build_and_classification() {
    let root = tempdir().unwrap();
    let local_dir = root.path().join("local");
    let base_dir = root.path().join("base");

    let local = inventory(&local_dir, &FakeScanner::android()).await;
    assert_eq!(local.device_count().await.unwrap(), 4);
    assert_eq!(local.subsystem_name(179).await.unwrap().as_deref(), Some("mmc"));

    let baseline = inventory(&base_dir, &FakeScanner::android()).await;

    let report = classify(&local, &baseline, &ExposurePolicy::default())
        .await
        .unwrap();
    assert_eq!(names(&report, DeviceFilter::Char), vec!["/dev/binder"]);
    assert!(names(&report, DeviceFilter::Block).is_empty());
    assert!(names(&report, DeviceFilter::Socket).is_empty());

    let binder = &report.group(DeviceFilter::Char).unwrap().devices[0];
    assert_eq!(binder.major, Some(10));
    assert_eq!(binder.subsystem.as_deref(), Some("misc"));

    let mut groups: Vec<&str> = DEFAULT_GROUPS.to_vec();
    groups.push("graphics");
    let policy = ExposurePolicy::new(DeviceFilter::ALL.to_vec(), "system", groups, false).unwrap();
    let report = classify(&local, &baseline, &policy).await.unwrap();
    assert_eq!(
        names(&report, DeviceFilter::Char),
        vec!["/dev/binder", "/dev/kgsl-3d0"]
    );
    let kgsl = &report.group(DeviceFilter::Char).unwrap().devices[1];
    assert_eq!(kgsl.subsystem.as_deref(), Some("kgsl"));
    assert_eq!(names(&report, DeviceFilter::Socket), vec!["/dev/socket/adbd"]);

    // Identical inventories: nothing is new
    let new_only = ExposurePolicy::new(DeviceFilter::ALL.to_vec(), "system", ["graphics"], true).unwrap();
    let report = classify(&local, &baseline, &new_only).await.unwrap();
    assert_eq!(report.total(), 0);

    local.close().await;
    baseline.close().await;
}

#[tokio::test]
async fn test_new_devices_against_packaged_baseline() {
    let root = tempdir().unwrap();
    let packages = root.path().join("packages");
    let local_dir = root.path().join("local");

    let baseline = inventory(&packages.join("33"), &FakeScanner::android()).await;
    baseline.close().await;

    let scanner = FakeScanner::android().node(
        "/dev/new_dev",
        "crw-rw-rw- 1 root root 10, 120 2024-01-01 00:00 /dev/new_dev",
        "character special file 666 a 78",
    );
    let local = inventory(&local_dir, &scanner).await;

    let provider = DirectoryPackageProvider::new(&packages);
    let resolved = BaselineResolver::new()
        .with_provider(&provider)
        .with_platform_version(scanner.platform_version().await.unwrap())
        .resolve(None)
        .unwrap();
    assert_eq!(resolved.source, BaselineSource::Packaged);

    let baseline = DeviceStore::open(&resolved.path).await.unwrap();
    let policy = ExposurePolicy::new(vec![DeviceFilter::Char], "shell", ["shell"], true).unwrap();
    let report = classify(&local, &baseline, &policy).await.unwrap();
    assert_eq!(names(&report, DeviceFilter::Char), vec!["/dev/new_dev"]);
    assert_eq!(report.groups.len(), 1);

    local.close().await;
    baseline.close().await;
}

#[tokio::test]
async fn test_rebuild_replaces_previous_inventory() {
    let root = tempdir().unwrap();
    let store = inventory(root.path(), &FakeScanner::android()).await;

    let smaller = FakeScanner::new("33")
        .node(
            "/dev/null",
            "crw-rw-rw- 1 root root 1, 3 2024-01-01 00:00 /dev/null",
            "character special file 666 1 3",
        )
        .node("/dev/garbled", "", "");
    build_inventory(&smaller, &store, "/dev").await.unwrap();

    assert_eq!(store.device_count().await.unwrap(), 1);
    let chars = store.devices_by_type(DeviceType::Character).await.unwrap();
    assert_eq!(chars[0].name, "/dev/null");
    store.close().await;
}

#[tokio::test]
async fn test_missing_stores_are_reported() {
    let root = tempdir().unwrap();

    let err = DeviceStore::open(store_path(root.path())).await.err().unwrap();
    assert!(matches!(err, AuditError::StoreNotFound { .. }));

    let err = BaselineResolver::new()
        .resolve(Some(root.path()))
        .unwrap_err();
    assert!(matches!(err, AuditError::BaselineUnresolved(_)));
}

// =============================================================================
// Binary exit codes
// =============================================================================

/// Runs the binary with its own settings file and data directory under `root`
fn devaudit(root: &Path, data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_devaudit"))
        .arg("--config")
        .arg(root.join("settings.json"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .env_remove("DEVAUDIT_CONFIG")
        .env_remove("DEVAUDIT_DATA_DIR")
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .output()
        .unwrap()
}

/// Exit status as seen by the shell for a negative stage code
fn shell_code(code: i32) -> Option<i32> {
    Some(code & 0xff)
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

async fn empty_store(dir: &Path) {
    let store = DeviceStore::create(store_path(dir)).await.unwrap();
    store.reset_schema().await.unwrap();
    store.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_exposed_exit_codes() {
    let root = tempdir().unwrap();
    let base = root.path().join("base");
    let local = root.path().join("local");
    let base_arg = base.to_str().unwrap();

    let out = devaudit(root.path(), &local, &["exposed", "--filters", "char,tape"]);
    assert_eq!(out.status.code(), shell_code(-1));
    assert_eq!(stderr(&out).matches("validating filters").count(), 1);

    let out = devaudit(root.path(), &local, &["exposed", "--diff-dir", base_arg]);
    assert_eq!(out.status.code(), shell_code(-2));

    empty_store(&base).await;
    let out = devaudit(root.path(), &local, &["exposed", "--diff-dir", base_arg]);
    assert_eq!(out.status.code(), shell_code(-3));
    assert!(stderr(&out).contains("devaudit create"));

    let path = store_path(&local);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vec![b'x'; 4096]).unwrap();
    let out = devaudit(root.path(), &local, &["exposed", "--diff-dir", base_arg]);
    assert_eq!(out.status.code(), shell_code(-4));

    std::fs::remove_file(&path).unwrap();
    empty_store(&local).await;
    let out = devaudit(root.path(), &local, &["exposed", "--diff-dir", base_arg]);
    assert_eq!(out.status.code(), Some(0), "{}", stderr(&out));
    assert!(String::from_utf8_lossy(&out.stdout).contains("character devices (0)"));
}

#[cfg(unix)]
#[test]
fn test_create_exit_codes() {
    let root = tempdir().unwrap();

    // the store path is taken by a directory
    let blocked = root.path().join("blocked");
    std::fs::create_dir_all(store_path(&blocked)).unwrap();
    let out = devaudit(root.path(), &blocked, &["create", "--yes"]);
    assert_eq!(out.status.code(), shell_code(-1));

    // the target shell fails on every invocation
    let fresh = root.path().join("fresh");
    let out = devaudit(root.path(), &fresh, &["create", "--shell", "false"]);
    assert_eq!(out.status.code(), shell_code(-3));
    assert!(stderr(&out).contains("populating store"));
}

#[cfg(unix)]
#[test]
fn test_create_without_terminal_keeps_existing_store() {
    let root = tempdir().unwrap();
    let path = store_path(root.path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"junk").unwrap();

    let out = devaudit(root.path(), root.path(), &["create", "--shell", "false"]);
    assert_eq!(out.status.code(), shell_code(-1));
    assert!(stderr(&out).contains("--yes"));
    assert_eq!(std::fs::read(&path).unwrap(), b"junk");
}
