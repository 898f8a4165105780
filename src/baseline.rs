//! Baseline store resolution
//!
//! Picks the prior inventory to diff against. Tiers are tried in order of
//! precedence, and the first tier whose input is present decides: it either
//! yields an existing store or resolution fails outright.
//!
//! 1. an explicit directory
//! 2. the configured `diff-data-dir`
//! 3. the packaged baseline for the target's platform version

use crate::{
    error::{AuditError, Result},
    schema::store_path,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of packaged baselines, keyed by platform version
pub trait BaselinePackageProvider {
    /// Directory of the installed package, or `None` when not installed
    fn package_dir(&self, platform_version: &str) -> Option<PathBuf>;
}

/// Packages laid out as `<root>/<platform-version>/.dbs/dev.db`
#[derive(Debug, Clone)]
pub struct DirectoryPackageProvider {
    root: PathBuf,
}

impl DirectoryPackageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BaselinePackageProvider for DirectoryPackageProvider {
    fn package_dir(&self, platform_version: &str) -> Option<PathBuf> {
        let version = platform_version.trim();
        if version.is_empty() || version.contains(['/', '\\']) || version == ".." {
            return None;
        }
        let dir = self.root.join(version);
        store_path(&dir).is_file().then_some(dir)
    }
}

/// Where a resolved baseline came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineSource {
    Explicit,
    Configured,
    Packaged,
}

/// A resolved baseline store path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBaseline {
    pub path: PathBuf,
    pub source: BaselineSource,
}

/// Resolves the baseline store for an `exposed` run
pub struct BaselineResolver<'a> {
    configured_dir: Option<PathBuf>,
    provider: Option<&'a dyn BaselinePackageProvider>,
    platform_version: Option<String>,
}

impl<'a> BaselineResolver<'a> {
    pub fn new() -> Self {
        Self {
            configured_dir: None,
            provider: None,
            platform_version: None,
        }
    }

    /// The configured `diff-data-dir` property
    pub fn with_configured_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.configured_dir = dir;
        self
    }

    pub fn with_provider(mut self, provider: &'a dyn BaselinePackageProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_platform_version(mut self, version: impl Into<String>) -> Self {
        self.platform_version = Some(version.into());
        self
    }

    /// Whether resolution will fall through to the packaged tier
    pub fn needs_platform_version(&self, explicit: Option<&Path>) -> bool {
        explicit.is_none() && self.configured_dir.is_none()
    }

    pub fn resolve(&self, explicit: Option<&Path>) -> Result<ResolvedBaseline> {
        if let Some(dir) = explicit {
            return existing(dir, BaselineSource::Explicit);
        }

        if let Some(dir) = &self.configured_dir {
            return existing(dir, BaselineSource::Configured);
        }

        let version = self.platform_version.as_deref().ok_or_else(|| {
            AuditError::BaselineUnresolved("platform version unknown".to_string())
        })?;
        let provider = self.provider.ok_or_else(|| {
            AuditError::BaselineUnresolved("no baseline package provider configured".to_string())
        })?;

        let dir = provider.package_dir(version).ok_or_else(|| {
            AuditError::BaselineUnresolved(format!(
                "no baseline available for platform version {version}"
            ))
        })?;
        existing(&dir, BaselineSource::Packaged)
    }
}

impl Default for BaselineResolver<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn existing(dir: &Path, source: BaselineSource) -> Result<ResolvedBaseline> {
    let path = store_path(dir);
    if !path.is_file() {
        return Err(AuditError::BaselineUnresolved(format!(
            "baseline not found: {}",
            path.display()
        )));
    }
    debug!(path = %path.display(), ?source, "resolved baseline");
    Ok(ResolvedBaseline { path, source })
}
