//! SQLite device store
//!
//! One store file holds a single device inventory: the `types` taxonomy, the
//! `devices` snapshot and the `mappings` from major numbers to subsystem names.
//! Each [`DeviceStore`] owns its connection pool; dropping or closing it
//! releases the file.

use crate::{
    error::{AuditError, Result},
    schema::{Device, DeviceType, Mapping, Permissions},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

const CREATE_SQL: &str = include_str!("../migrations/sqlite.sql");
const DROP_SQL: &str = include_str!("../migrations/drop.sql");

const SELECT_DEVICES: &str = "SELECT name, type, permissions, owner_name, group_name, major, minor \
     FROM devices WHERE type = ?";

/// Handle on a single device store file
pub struct DeviceStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl DeviceStore {
    /// Open an existing store.
    ///
    /// Never creates the file: a missing path is [`AuditError::StoreNotFound`],
    /// a file that is not a device store is [`AuditError::StoreCorrupt`].
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(AuditError::StoreNotFound {
                path: path.to_path_buf(),
            });
        }

        let store = Self::connect(path, false)
            .await
            .map_err(|e| AuditError::corrupt(path, e))?;

        // Probe the taxonomy so schema-less or foreign files fail here
        sqlx::query("SELECT COUNT(*) FROM types")
            .fetch_one(&store.pool)
            .await
            .map_err(|e| AuditError::corrupt(path, e))?;

        debug!(path = %path.display(), "opened device store");
        Ok(store)
    }

    /// Open a store for an inventory build, creating the file and its parent
    /// directories when missing. The schema is left untouched; call
    /// [`DeviceStore::reset_schema`] before populating.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self::connect(path, true).await?;
        debug!(path = %path.display(), "created device store");
        Ok(store)
    }

    async fn connect(path: &Path, create: bool) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .foreign_keys(true);

        // Single writer, single reader per invocation
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Location of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop and recreate all tables, re-seeding `types`.
    pub async fn reset_schema(&self) -> Result<()> {
        self.drop_schema().await?;
        self.create_schema().await
    }

    /// Drop `devices`, `mappings` and `types` if present
    pub async fn drop_schema(&self) -> Result<()> {
        self.run_script(DROP_SQL).await
    }

    /// Create the tables and seed the three fixed device types
    pub async fn create_schema(&self) -> Result<()> {
        self.run_script(CREATE_SQL).await?;
        info!(path = %self.path.display(), "device store schema created");
        Ok(())
    }

    async fn run_script(&self, sql: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        // Statements run one by one; comment lines are stripped first
        for statement in sql.split(';') {
            let statement: String = statement
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with("--")
                })
                .collect::<Vec<_>>()
                .join("\n");

            if statement.trim().is_empty() {
                continue;
            }

            sqlx::query(&statement).execute(&mut *conn).await?;
        }

        Ok(())
    }

    /// Insert devices in one transaction. On failure nothing is committed.
    pub async fn insert_devices(&self, devices: &[Device]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for device in devices {
            sqlx::query(
                "INSERT INTO devices (name, type, permissions, owner_name, group_name, major, minor) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&device.name)
            .bind(device.device_type.id())
            .bind(device.permissions.to_stored())
            .bind(&device.owner_name)
            .bind(&device.group_name)
            .bind(device.major.as_deref())
            .bind(device.minor.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = devices.len(), "inserted devices");
        Ok(())
    }

    /// Insert mappings in one transaction. On failure nothing is committed.
    pub async fn insert_mappings(&self, mappings: &[Mapping]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for mapping in mappings {
            sqlx::query("INSERT INTO mappings (name, number, type) VALUES (?, ?, ?)")
                .bind(&mapping.name)
                .bind(i64::from(mapping.number))
                .bind(mapping.device_type.id())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(count = mappings.len(), "inserted mappings");
        Ok(())
    }

    /// All devices of exactly `device_type`, in no particular order
    pub async fn devices_by_type(&self, device_type: DeviceType) -> Result<Vec<Device>> {
        let rows: Vec<SqliteRow> = sqlx::query(SELECT_DEVICES)
            .bind(device_type.id())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.corrupt(e))?;

        rows.iter().map(|row| self.decode_device(row)).collect()
    }

    /// Names of every device in the store
    pub async fn device_names(&self) -> Result<HashSet<String>> {
        let rows: Vec<SqliteRow> = sqlx::query("SELECT name FROM devices")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.corrupt(e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Option<String>, _>(0)
                    .map(Option::unwrap_or_default)
                    .map_err(|e| self.corrupt(e))
            })
            .collect()
    }

    pub async fn device_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get::<i64, _>(0))
            .map_err(|e| self.corrupt(e))?;
        Ok(count.max(0) as u64)
    }

    /// Name of the first-inserted mapping with this number, any type
    pub async fn subsystem_name(&self, major: u32) -> Result<Option<String>> {
        let row: Option<SqliteRow> =
            sqlx::query("SELECT name FROM mappings WHERE number = ? ORDER BY id ASC LIMIT 1")
                .bind(i64::from(major))
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| self.corrupt(e))?;

        self.decode_name(row)
    }

    /// Name of the first-inserted mapping with this number and type
    pub async fn subsystem_name_for(
        &self,
        major: u32,
        device_type: DeviceType,
    ) -> Result<Option<String>> {
        let row: Option<SqliteRow> = sqlx::query(
            "SELECT name FROM mappings WHERE number = ? AND type = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(i64::from(major))
        .bind(device_type.id())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.corrupt(e))?;

        self.decode_name(row)
    }

    /// Close the pool, waiting for the connection to be released
    pub async fn close(self) {
        self.pool.close().await;
    }

    fn decode_name(&self, row: Option<SqliteRow>) -> Result<Option<String>> {
        match row {
            Some(row) => row
                .try_get::<Option<String>, _>(0)
                .map_err(|e| self.corrupt(e)),
            None => Ok(None),
        }
    }

    fn decode_device(&self, row: &SqliteRow) -> Result<Device> {
        let name: Option<String> = row.try_get("name").map_err(|e| self.corrupt(e))?;
        let name = name.ok_or_else(|| self.corrupt("device row without a name"))?;

        let type_id: i64 = row.try_get("type").map_err(|e| self.corrupt(e))?;
        let device_type = DeviceType::from_id(type_id);
        if device_type == DeviceType::Unknown {
            return Err(self.corrupt(format!("{name}: unknown type id {type_id}")));
        }

        let stored: i64 = row.try_get("permissions").map_err(|e| self.corrupt(e))?;
        let permissions = Permissions::from_stored(stored)
            .ok_or_else(|| self.corrupt(format!("{name}: invalid permissions {stored}")))?;

        let text = |column: &str| -> Result<Option<String>> {
            row.try_get::<Option<String>, _>(column)
                .map_err(|e| self.corrupt(e))
        };

        Ok(Device {
            owner_name: text("owner_name")?.unwrap_or_default(),
            group_name: text("group_name")?.unwrap_or_default(),
            major: text("major")?.filter(|m| !m.trim().is_empty()),
            minor: text("minor")?.filter(|m| !m.trim().is_empty()),
            name,
            device_type,
            permissions,
        })
    }

    fn corrupt(&self, reason: impl ToString) -> AuditError {
        AuditError::corrupt(&self.path, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn device(name: &str, device_type: DeviceType, perms: &str, major: Option<&str>) -> Device {
        Device {
            name: name.to_string(),
            device_type,
            permissions: Permissions::parse(perms).unwrap(),
            owner_name: "root".to_string(),
            group_name: "root".to_string(),
            major: major.map(str::to_string),
            minor: major.map(|_| "0".to_string()),
        }
    }

    #[tokio::test]
    async fn test_mapping_round_trip() {
        let dir = tempdir().unwrap();
        let store = DeviceStore::create(dir.path().join("dev.db")).await.unwrap();

        store.reset_schema().await.unwrap();
        store
            .insert_mappings(&[Mapping::new("mmcblk", 179, DeviceType::Block)])
            .await
            .unwrap();

        assert_eq!(store.subsystem_name(179).await.unwrap().as_deref(), Some("mmcblk"));
        assert_eq!(store.subsystem_name(180).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_inserted_mapping_wins() {
        let dir = tempdir().unwrap();
        let store = DeviceStore::create(dir.path().join("dev.db")).await.unwrap();
        store.reset_schema().await.unwrap();
        store
            .insert_mappings(&[
                Mapping::new("mem", 1, DeviceType::Character),
                Mapping::new("ramdisk", 1, DeviceType::Block),
                Mapping::new("other", 1, DeviceType::Character),
            ])
            .await
            .unwrap();

        assert_eq!(store.subsystem_name(1).await.unwrap().as_deref(), Some("mem"));
        assert_eq!(
            store
                .subsystem_name_for(1, DeviceType::Block)
                .await
                .unwrap()
                .as_deref(),
            Some("ramdisk")
        );
        assert_eq!(
            store
                .subsystem_name_for(1, DeviceType::Character)
                .await
                .unwrap()
                .as_deref(),
            Some("mem")
        );
    }

    #[tokio::test]
    async fn test_reset_schema_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = DeviceStore::create(dir.path().join(".dbs/dev.db")).await.unwrap();

        store.reset_schema().await.unwrap();
        store
            .insert_devices(&[device("/dev/null", DeviceType::Character, "666", Some("1"))])
            .await
            .unwrap();
        store.reset_schema().await.unwrap();

        assert_eq!(store.device_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_devices_by_type_filters_exactly() {
        let dir = tempdir().unwrap();
        let store = DeviceStore::create(dir.path().join("dev.db")).await.unwrap();
        store.reset_schema().await.unwrap();
        store
            .insert_devices(&[
                device("/dev/block/sda", DeviceType::Block, "660", Some("8")),
                device("/dev/null", DeviceType::Character, "666", Some("1")),
                device("/dev/socket/adbd", DeviceType::Socket, "660", None),
            ])
            .await
            .unwrap();

        let blocks = store.devices_by_type(DeviceType::Block).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name, "/dev/block/sda");

        let sockets = store.devices_by_type(DeviceType::Socket).await.unwrap();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].major, None);

        let names = store.device_names().await.unwrap();
        assert_eq!(names.len(), 3);
        assert!(names.contains("/dev/null"));
    }

    #[tokio::test]
    async fn test_permissions_keep_leading_zero() {
        let dir = tempdir().unwrap();
        let store = DeviceStore::create(dir.path().join("dev.db")).await.unwrap();
        store.reset_schema().await.unwrap();
        store
            .insert_devices(&[device("/dev/hw_random", DeviceType::Character, "060", Some("a"))])
            .await
            .unwrap();

        let devices = store.devices_by_type(DeviceType::Character).await.unwrap();
        assert_eq!(devices[0].permissions.to_string(), "060");
        assert_eq!(devices[0].permissions.digits(), (0, 6, 0));
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let store = DeviceStore::create(dir.path().join("dev.db")).await.unwrap();
        store.reset_schema().await.unwrap();

        // Unknown (-1) has no row in `types`, so the foreign key rejects it
        let result = store
            .insert_mappings(&[
                Mapping::new("mem", 1, DeviceType::Character),
                Mapping::new("bogus", 2, DeviceType::Unknown),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(store.subsystem_name(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_missing_store() {
        let dir = tempdir().unwrap();
        let err = DeviceStore::open(dir.path().join("missing.db"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuditError::StoreNotFound { .. }));
    }

    #[tokio::test]
    async fn test_open_foreign_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        let err = DeviceStore::open(&path).await.err().unwrap();
        assert!(matches!(err, AuditError::StoreCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_open_after_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".dbs").join("dev.db");
        let store = DeviceStore::create(&path).await.unwrap();
        store.reset_schema().await.unwrap();
        store.close().await;

        let store = DeviceStore::open(&path).await.unwrap();
        assert_eq!(store.device_count().await.unwrap(), 0);
        assert_eq!(store.path(), path.as_path());
    }
}
