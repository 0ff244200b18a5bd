//! Profile configuration, loaded from `vault-lint.toml`.
//!
//! Every section and field is optional. Loading produces a [`VaultLintConfig`];
//! [`VaultLintConfig::resolve`] turns the active (or a requested) profile into
//! a [`ResolvedProfile`] carrying everything a run needs.

use crate::cache::CacheConfig;
use crate::dispatcher::{DispatcherConfig, cpu_count};
use crate::error::LintError;
use crate::file_writer::WriterConfig;
use crate::memory_governor::MemoryConfig;
use crate::orchestrator::RunOptions;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "vault-lint.toml";
pub const DEFAULT_PROFILE: &str = "default";
const CACHE_FILE_NAME: &str = "vault-lint-cache.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultLintConfig {
    pub general: GeneralSettings,
    pub profiles: ProfilesSettings,
    pub cache: CacheSettings,
    pub memory: MemorySettings,
    pub writer: WriterSettings,
    pub workers: WorkerSettings,
    /// Directory the config was loaded from. Relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub vault_root: Option<PathBuf>,
    pub dry_run: bool,
    pub fix: bool,
    pub parallel: bool,
    pub incremental: bool,
    pub verbose: bool,
    pub max_concurrency: Option<usize>,
    pub persist_cache: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            vault_root: None,
            dry_run: false,
            fix: false,
            parallel: true,
            incremental: true,
            verbose: false,
            max_concurrency: None,
            persist_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesSettings {
    pub active: String,
    #[serde(flatten)]
    pub profiles: BTreeMap<String, ProfileSettings>,
}

impl Default for ProfilesSettings {
    fn default() -> Self {
        Self {
            active: DEFAULT_PROFILE.to_string(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    pub name: Option<String>,
    pub description: Option<String>,
    pub rules_path: Option<PathBuf>,
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub max_memory_mb: f64,
    pub ttl_minutes: u64,
    pub path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_memory_mb: 100.0,
            ttl_minutes: 24 * 60,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub emergency_threshold: f64,
    pub max_batch_size: usize,
    pub sample_interval_ms: u64,
    pub max_memory_mb: Option<u64>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            warning_threshold: 70.0,
            critical_threshold: 85.0,
            emergency_threshold: 95.0,
            max_batch_size: 50,
            sample_interval_ms: 1_000,
            max_memory_mb: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    pub keep_backups: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub validate_writes: bool,
    pub verify_checksums: bool,
    pub backup_dir: Option<PathBuf>,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            keep_backups: 5,
            max_retries: 2,
            retry_base_delay_ms: 100,
            validate_writes: true,
            verify_checksums: true,
            backup_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_workers: Option<usize>,
    pub task_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: None,
            task_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// A profile resolved against its config file, ready to drive a run.
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub name: String,
    pub description: Option<String>,
    pub rules_dir: PathBuf,
    pub vault_root: Option<PathBuf>,
    pub ignore_patterns: Vec<String>,
    pub options: RunOptions,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub writer: WriterConfig,
    pub dispatcher: DispatcherConfig,
}

impl VaultLintConfig {
    /// Load and parse a config file. A missing or malformed file is fatal.
    pub fn load(path: &Path) -> Result<Self, LintError> {
        Self::read(path).map_err(|error| {
            LintError::config_with_source(
                format!("could not load configuration from {}", path.display()),
                error,
            )
        })
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::parse(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        log::info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Look for `vault-lint.toml` in `dir` and then its ancestors.
    pub fn discover(dir: &Path) -> Option<PathBuf> {
        dir.ancestors()
            .map(|ancestor| ancestor.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file())
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Resolve `profile`, or the active profile when `None`.
    pub fn resolve(&self, profile: Option<&str>) -> Result<ResolvedProfile, LintError> {
        let name = profile.unwrap_or(&self.profiles.active);
        let settings = self
            .profiles
            .profiles
            .get(name)
            .ok_or_else(|| LintError::config(format!("unknown profile `{name}`")))?;

        let rules_path = settings
            .rules_path
            .clone()
            .unwrap_or_else(|| Path::new("rules").join(name));
        let rules_dir = self.absolute(&rules_path);
        if !rules_dir.is_dir() {
            return Err(LintError::config(format!(
                "rules directory {} for profile `{name}` does not exist",
                rules_dir.display()
            )));
        }

        let general = &self.general;
        let vault_root = general.vault_root.as_deref().map(|root| self.absolute(root));
        let options = RunOptions {
            dry_run: general.dry_run,
            fix: general.fix,
            parallel: general.parallel,
            incremental: general.incremental,
            verbose: general.verbose,
            max_concurrency: general.max_concurrency,
        };

        let cache_path = match &self.cache.path {
            Some(path) => Some(self.absolute(path)),
            None => vault_root
                .as_ref()
                .map(|root| root.join(".vault-lint").join(CACHE_FILE_NAME)),
        };
        let cache = CacheConfig {
            max_entries: self.cache.max_entries.max(1),
            max_memory_mb: self.cache.max_memory_mb,
            ttl: Duration::from_secs(self.cache.ttl_minutes * 60),
            persist_path: cache_path.filter(|_| general.persist_cache),
        };

        let memory = MemoryConfig {
            warning_threshold: self.memory.warning_threshold,
            critical_threshold: self.memory.critical_threshold,
            emergency_threshold: self.memory.emergency_threshold,
            max_batch_size: self.memory.max_batch_size.max(1),
            sample_interval: Duration::from_millis(self.memory.sample_interval_ms),
            max_memory_mb: self.memory.max_memory_mb,
            ..MemoryConfig::default()
        };

        let mut writer = WriterConfig {
            keep_backups: self.writer.keep_backups,
            max_attempts: self.writer.max_retries + 1,
            retry_base_delay: Duration::from_millis(self.writer.retry_base_delay_ms),
            validate_writes: self.writer.validate_writes,
            verify_checksums: self.writer.verify_checksums,
            ..WriterConfig::default()
        };
        if let Some(backup_dir) = &self.writer.backup_dir {
            writer.backup_dir = self.absolute(backup_dir);
        } else if let Some(root) = &vault_root {
            writer.backup_dir = root.join(".vault-lint").join("backups");
        }

        let dispatcher = DispatcherConfig {
            max_workers: self
                .workers
                .max_workers
                .or(general.max_concurrency)
                .unwrap_or_else(cpu_count)
                .max(1),
            task_timeout: Duration::from_millis(self.workers.task_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.workers.shutdown_timeout_ms),
        };

        log::debug!("Resolved profile `{name}` with rules from {}", rules_dir.display());
        Ok(ResolvedProfile {
            name: settings.name.clone().unwrap_or_else(|| name.to_string()),
            description: settings.description.clone(),
            rules_dir,
            vault_root,
            ignore_patterns: settings.ignore_patterns.clone(),
            options,
            cache,
            memory,
            writer,
            dispatcher,
        })
    }
}

impl ResolvedProfile {
    /// A profile with default component settings, for callers that build
    /// their configuration in code rather than from a file.
    pub fn with_rules_dir(rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: DEFAULT_PROFILE.to_string(),
            description: None,
            rules_dir: rules_dir.into(),
            vault_root: None,
            ignore_patterns: Vec::new(),
            options: RunOptions::default(),
            cache: CacheConfig::default(),
            memory: MemoryConfig::default(),
            writer: WriterConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = VaultLintConfig::parse("").unwrap();
        assert_eq!(config.profiles.active, "default");
        assert!(config.general.incremental);
        assert!(config.general.parallel);
        assert_eq!(config.cache.ttl_minutes, 24 * 60);
        assert_eq!(config.writer.keep_backups, 5);
        assert!(config.profiles.profiles.is_empty());
    }

    #[test]
    fn test_resolve_active_profile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules/strict")).unwrap();
        let path = write_config(
            dir.path(),
            indoc! {r#"
                [general]
                vault_root = "vault"
                fix = true
                max_concurrency = 3

                [profiles]
                active = "strict"

                [profiles.strict]
                name = "Strict"
                rules_path = "rules/strict"
                ignore_patterns = [".obsidian/**"]

                [cache]
                ttl_minutes = 5

                [writer]
                max_retries = 4
            "#},
        );

        let config = VaultLintConfig::load(&path).unwrap();
        let profile = config.resolve(None).unwrap();
        assert_eq!(profile.name, "Strict");
        assert_eq!(profile.rules_dir, dir.path().join("rules/strict"));
        assert_eq!(profile.vault_root, Some(dir.path().join("vault")));
        assert_eq!(profile.ignore_patterns, vec![".obsidian/**".to_string()]);
        assert!(profile.options.fix);
        assert_eq!(profile.options.max_concurrency, Some(3));
        assert_eq!(profile.cache.ttl, Duration::from_secs(300));
        assert_eq!(
            profile.cache.persist_path,
            Some(dir.path().join("vault/.vault-lint").join(CACHE_FILE_NAME))
        );
        assert_eq!(profile.writer.max_attempts, 5);
        assert_eq!(profile.writer.backup_dir, dir.path().join("vault/.vault-lint/backups"));
        assert_eq!(profile.dispatcher.max_workers, 3);
    }

    #[test]
    fn test_resolve_errors_are_configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            indoc! {r#"
                [profiles.default]
                rules_path = "missing"
            "#},
        );
        let config = VaultLintConfig::load(&path).unwrap();

        assert!(matches!(config.resolve(None), Err(LintError::Config { .. })));
        assert!(matches!(
            config.resolve(Some("nope")),
            Err(LintError::Config { .. })
        ));
    }

    #[test]
    fn test_load_failures() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            VaultLintConfig::load(&dir.path().join("absent.toml")),
            Err(LintError::Config { .. })
        ));

        let path = write_config(dir.path(), "[general\nfix = ");
        assert!(matches!(VaultLintConfig::load(&path), Err(LintError::Config { .. })));
    }

    #[test]
    fn test_discover_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(
            VaultLintConfig::discover(&nested),
            Some(dir.path().join(CONFIG_FILE_NAME))
        );
    }
}
