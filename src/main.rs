//! devaudit command line
//!
//! `create` builds the local device store, `exposed` classifies it against a
//! baseline, `config` edits the settings file. Failures exit with a negative
//! code identifying the failing stage.

use clap::{Args, Parser, Subcommand};
use devaudit::{
    baseline::{BaselineResolver, DirectoryPackageProvider},
    classifier::{classify, DeviceFilter, ExposurePolicy, DEFAULT_GROUPS, DEFAULT_USER},
    config::{SettingKey, Settings, DEFAULT_SETTINGS_FILE},
    report::{render, OutputFormat},
    scanner::{populate, DeviceScanner, ShellScanner, DEFAULT_BATCH_SIZE, DEFAULT_ROOT},
    schema::store_path,
    AuditError, DeviceStore,
};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// Exit codes
// =============================================================================

const SETTINGS_FAILED: i32 = 1;

const CREATE_DROP_FAILED: i32 = -1;
const CREATE_NOT_CONFIRMED: i32 = -1;
const CREATE_SCHEMA_FAILED: i32 = -2;
const CREATE_POPULATE_FAILED: i32 = -3;

const EXPOSED_INVALID_FILTER: i32 = -1;
const EXPOSED_NO_BASELINE: i32 = -2;
const EXPOSED_NO_LOCAL_STORE: i32 = -3;
const EXPOSED_STORE_FAILED: i32 = -4;

const CONFIG_SAVE_FAILED: i32 = -1;

// =============================================================================
// CLI Arguments
// =============================================================================

/// devaudit - find device nodes an unprivileged identity can open
#[derive(Parser, Debug)]
#[command(name = "devaudit", author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, env = "DEVAUDIT_CONFIG", default_value = DEFAULT_SETTINGS_FILE, global = true)]
    config: PathBuf,

    /// Directory holding the local store (<data-dir>/.dbs/dev.db)
    #[arg(long, env = "DEVAUDIT_DATA_DIR", default_value = ".", global = true)]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wipe and rebuild the local device store from a scan of the target
    Create(CreateArgs),
    /// List device nodes exposed to the acting identity
    Exposed(ExposedArgs),
    /// Read or change settings
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Directory walked for device nodes
    #[arg(long, default_value = DEFAULT_ROOT)]
    root: String,

    /// Command used to reach the target (overrides the `shell` setting; split on whitespace, quotes are not interpreted)
    #[arg(long)]
    shell: Option<String>,

    /// Nodes described per shell invocation
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Replace an existing store without asking
    #[arg(short, long)]
    yes: bool,
}

#[derive(Args, Debug)]
struct ExposedArgs {
    /// Data directory of the baseline to diff against
    #[arg(long)]
    diff_dir: Option<PathBuf>,

    /// Device types to report: block, char, socket
    #[arg(long, default_value = "block,char,socket")]
    filters: String,

    /// Acting user
    #[arg(long, default_value = DEFAULT_USER)]
    user: String,

    /// Groups of the acting user (comma separated; defaults to a shell session's groups)
    #[arg(long)]
    groups: Option<String>,

    /// Only report devices absent from the baseline
    #[arg(long)]
    new_only: bool,

    /// Platform version used to pick a packaged baseline (queried from the target if omitted)
    #[arg(long)]
    platform_version: Option<String>,

    /// Command used to reach the target (overrides the `shell` setting; split on whitespace, quotes are not interpreted)
    #[arg(long)]
    shell: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print a setting
    Get { key: SettingKey },
    /// Change a setting
    Set { key: SettingKey, value: String },
    /// Remove a setting
    Unset { key: SettingKey },
}

// =============================================================================
// Main
// =============================================================================

/// Failure of one command stage, with the exit code it maps to
#[derive(Debug)]
struct StageError {
    code: i32,
    error: anyhow::Error,
}

trait Stage<T> {
    fn stage(self, code: i32, what: &str) -> Result<T, StageError>;
}

impl<T> Stage<T> for devaudit::Result<T> {
    fn stage(self, code: i32, what: &str) -> Result<T, StageError> {
        self.map_err(|e| stage_error(code, what, e))
    }
}

fn stage_error(code: i32, what: &str, e: AuditError) -> StageError {
    StageError {
        code,
        error: anyhow::Error::new(e).context(what.to_string()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let outcome = match Settings::load(&cli.config).stage(SETTINGS_FAILED, "loading settings") {
        Ok(settings) => match &cli.command {
            Commands::Create(args) => create(&cli, &settings, args).await,
            Commands::Exposed(args) => exposed(&cli, &settings, args).await,
            Commands::Config(command) => config(&cli, settings, command),
        },
        Err(e) => Err(e),
    };

    if let Err(StageError { code, error }) = outcome {
        eprintln!("error: {error:#}");
        std::process::exit(code);
    }
}

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn scanner(settings: &Settings, shell: Option<&str>) -> devaudit::Result<ShellScanner> {
    ShellScanner::new(shell.unwrap_or_else(|| settings.shell()))
}

// =============================================================================
// create
// =============================================================================

async fn create(cli: &Cli, settings: &Settings, args: &CreateArgs) -> Result<(), StageError> {
    let path = store_path(&cli.data_dir);

    let confirmed = confirm_replace(&path, args.yes, |prompt| {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(anyhow::Error::from)
    })?;
    if !confirmed {
        info!("create cancelled");
        eprintln!("Kept the existing device store at {}", path.display());
        return Ok(());
    }

    let scanner = scanner(settings, args.shell.as_deref())
        .map(|s| s.with_batch_size(args.batch_size))
        .stage(CREATE_POPULATE_FAILED, "configuring scanner")?;

    let store = DeviceStore::create(&path).await.stage(CREATE_DROP_FAILED, "opening store")?;
    let outcome = rebuild(&store, &scanner, &args.root).await;
    store.close().await;

    let summary = outcome?;
    println!(
        "Stored {} devices and {} subsystem mappings in {} ({} nodes skipped)",
        summary.devices,
        summary.mappings,
        path.display(),
        summary.skipped
    );
    Ok(())
}

/// Whether `create` may replace the store at `path`.
///
/// Only an existing store is asked about. A prompt that cannot be shown is a
/// failure, not a refusal.
fn confirm_replace(
    path: &Path,
    yes: bool,
    ask: impl FnOnce(String) -> anyhow::Result<bool>,
) -> Result<bool, StageError> {
    if yes || !path.exists() {
        return Ok(true);
    }
    ask(format!("Replace the device store at {}?", path.display())).map_err(|e| StageError {
        code: CREATE_NOT_CONFIRMED,
        error: e.context("confirming store replacement (no terminal? pass --yes)"),
    })
}

async fn rebuild(
    store: &DeviceStore,
    scanner: &dyn DeviceScanner,
    root: &str,
) -> Result<devaudit::scanner::InventorySummary, StageError> {
    store
        .drop_schema()
        .await
        .stage(CREATE_DROP_FAILED, "dropping tables")?;
    store
        .create_schema()
        .await
        .stage(CREATE_SCHEMA_FAILED, "creating tables")?;
    populate(scanner, store, root)
        .await
        .stage(CREATE_POPULATE_FAILED, "populating store")
}

// =============================================================================
// exposed
// =============================================================================

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn exposed(cli: &Cli, settings: &Settings, args: &ExposedArgs) -> Result<(), StageError> {
    let filters = DeviceFilter::parse_list(&args.filters)
        .stage(EXPOSED_INVALID_FILTER, "validating filters")?;
    let groups: Vec<String> = match &args.groups {
        Some(list) => split_list(list),
        None => DEFAULT_GROUPS.iter().map(|g| g.to_string()).collect(),
    };
    let policy = ExposurePolicy::new(filters, args.user.as_str(), groups, args.new_only)
        .stage(EXPOSED_INVALID_FILTER, "validating policy")?;

    // Baseline
    let provider = settings
        .baseline_packages
        .as_ref()
        .map(DirectoryPackageProvider::new);
    let mut resolver = BaselineResolver::new().with_configured_dir(settings.diff_data_dir.clone());
    if let Some(provider) = &provider {
        resolver = resolver.with_provider(provider);
    }
    if resolver.needs_platform_version(args.diff_dir.as_deref()) {
        let version = match &args.platform_version {
            Some(version) => version.clone(),
            None => {
                let scanner = scanner(settings, args.shell.as_deref())
                    .stage(EXPOSED_NO_BASELINE, "configuring scanner")?;
                scanner
                    .platform_version()
                    .await
                    .stage(EXPOSED_NO_BASELINE, "querying platform version")?
            }
        };
        resolver = resolver.with_platform_version(version);
    }
    let resolved = resolver
        .resolve(args.diff_dir.as_deref())
        .stage(EXPOSED_NO_BASELINE, "resolving baseline")?;
    info!(path = %resolved.path.display(), source = ?resolved.source, "using baseline");

    // Stores
    let local = DeviceStore::open(store_path(&cli.data_dir))
        .await
        .map_err(|e| {
            stage_error(
                local_open_code(&e),
                "opening local store (run `devaudit create` first)",
                e,
            )
        })?;
    let baseline = match DeviceStore::open(&resolved.path).await {
        Ok(store) => store,
        Err(e) => {
            local.close().await;
            return Err(stage_error(baseline_open_code(&e), "opening baseline store", e));
        }
    };

    let outcome = classify(&local, &baseline, &policy).await;
    local.close().await;
    baseline.close().await;

    let report = outcome.stage(EXPOSED_STORE_FAILED, "classifying devices")?;
    let rendered = render(&report, args.format).stage(EXPOSED_STORE_FAILED, "rendering report")?;
    println!("{rendered}");
    Ok(())
}

fn local_open_code(e: &AuditError) -> i32 {
    match e {
        AuditError::StoreNotFound { .. } => EXPOSED_NO_LOCAL_STORE,
        _ => EXPOSED_STORE_FAILED,
    }
}

/// A baseline that vanished after resolution is still a resolution failure
fn baseline_open_code(e: &AuditError) -> i32 {
    match e {
        AuditError::StoreNotFound { .. } => EXPOSED_NO_BASELINE,
        _ => EXPOSED_STORE_FAILED,
    }
}

// =============================================================================
// config
// =============================================================================

fn config(cli: &Cli, mut settings: Settings, command: &ConfigCommand) -> Result<(), StageError> {
    match command {
        ConfigCommand::Get { key } => {
            match settings.get(*key) {
                Some(value) => println!("{value}"),
                None => println!("{key} is not set"),
            }
            return Ok(());
        }
        ConfigCommand::Set { key, value } => settings.set(*key, Some(value)),
        ConfigCommand::Unset { key } => settings.set(*key, None),
    }
    settings
        .save(&cli.config)
        .stage(CONFIG_SAVE_FAILED, "saving settings")
}
