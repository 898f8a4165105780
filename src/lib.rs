//! # devaudit - Device Node Exposure Auditing
//!
//! devaudit inventories the block, character and socket nodes of a target
//! into a SQLite device store, then reports which of them an acting
//! user/group identity can open. Reports can be restricted to nodes that are
//! new since a baseline inventory.
//!
//! ## Modules
//!
//! - **store**: device store schema, bulk insert and typed queries (async via sqlx)
//! - **mapper**: major number to subsystem name resolution
//! - **baseline**: choice of the baseline store to diff against
//! - **classifier**: the exposure predicate and report
//! - **scanner**: shell-driven scanning and inventory build
//!
//! ## Example
//!
//! ```rust,ignore
//! use devaudit::{classify, DeviceStore, ExposurePolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let local = DeviceStore::open(".dbs/dev.db").await?;
//!     let baseline = DeviceStore::open("baseline/.dbs/dev.db").await?;
//!
//!     let report = classify(&local, &baseline, &ExposurePolicy::default()).await?;
//!     println!("{} exposed devices", report.total());
//!
//!     Ok(())
//! }
//! ```

pub mod baseline;
pub mod classifier;
pub mod config;
pub mod error;
pub mod mapper;
pub mod report;
pub mod scanner;
pub mod schema;
pub mod store;

pub use baseline::{BaselinePackageProvider, BaselineResolver, DirectoryPackageProvider};
pub use classifier::{classify, DeviceFilter, ExposurePolicy, ExposureReport};
pub use error::{AuditError, Result};
pub use mapper::SubsystemMapper;
pub use scanner::{DeviceScanner, ShellScanner};
pub use schema::{Device, DeviceType, Mapping, Permissions};
pub use store::DeviceStore;
