//! Configuration loader with tier-based merging.
//!
//! Loads configuration from multiple tiers and merges them field-by-field.

use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONFIG_PATH_ENV: &str = "MISSION_CONTROL_CONFIG_PATH";
pub const DATA_PATH_ENV: &str = "MISSION_CONTROL_DATA_PATH";
pub const PORT_ENV: &str = "MISSION_CONTROL_PORT";
pub const USER_DIR_ENV: &str = "MISSION_CONTROL_USER_DIR";
pub const PROJECT_DIR_ENV: &str = "MISSION_CONTROL_PROJECT_DIR";
pub const GATEWAY_URL_ENV: &str = "OPENCLAW_GATEWAY_URL";
pub const GATEWAY_TOKEN_ENV: &str = "OPENCLAW_GATEWAY_TOKEN";

const CONFIG_FILE: &str = "config.yaml";

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Defaults = 0,
    Project = 1,
    User = 2,
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Project-level config directory (default: `./mission-control`).
    pub project_dir: Option<PathBuf>,
    /// User-level config directory (default: `~/.mission-control`).
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        let user_dir = std::env::var(USER_DIR_ENV)
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".mission-control")));

        let project_dir = std::env::var(PROJECT_DIR_ENV)
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("mission-control")));

        Self {
            project_dir,
            user_dir,
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }

    fn config_file(&self, tier: ConfigTier) -> Option<PathBuf> {
        let dir = match tier {
            ConfigTier::Project => self.project_dir.as_ref(),
            ConfigTier::User => self.user_dir.as_ref(),
            _ => None,
        }?;
        let file = dir.join(CONFIG_FILE);
        file.exists().then_some(file)
    }
}

/// Read one YAML tier. Unreadable or malformed files are skipped with a warning.
fn read_tier(tier: ConfigTier, path: &Path) -> Option<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(%tier, path = %path.display(), error = %e, "Skipping unreadable config file");
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => {
            debug!(%tier, path = %path.display(), "Loaded config tier");
            Some(value)
        }
        Err(e) => {
            warn!(%tier, path = %path.display(), error = %e, "Skipping malformed config file");
            None
        }
    }
}

/// Lay a higher tier over the merged lower tiers.
///
/// Sections merge key by key. A key left empty (`token:` or `~`) keeps the
/// lower tier's value. Anything else replaces it, lists included.
fn overlay_tier(merged: &mut Value, tier: Value) {
    match (merged, tier) {
        (Value::Object(lower), Value::Object(upper)) => {
            for (key, value) in upper {
                match lower.get_mut(&key) {
                    Some(slot) => overlay_tier(slot, value),
                    None => {
                        lower.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Highest-priority config file that contributed, if any.
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load configuration from one explicit file, skipping the tier merge.
    ///
    /// Environment overrides still apply.
    pub fn load_file(path: &Path) -> Result<Self> {
        let mut config = Config::load(path)?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(Self {
            paths: ConfigPaths::with_dirs(None, None),
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Load configuration with explicit paths.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        if let Ok(explicit_path) = std::env::var(CONFIG_PATH_ENV) {
            let mut loader = Self::load_file(Path::new(&explicit_path))?;
            loader.paths = paths;
            return Ok(loader);
        }

        let mut config = Self::merge_tiers(&paths)?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

        let config_path = paths
            .config_file(ConfigTier::User)
            .or_else(|| paths.config_file(ConfigTier::Project));

        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    /// Merge defaults, project and user tiers. Environment is not applied.
    pub fn merge_tiers(paths: &ConfigPaths) -> Result<Config> {
        let mut merged = serde_json::to_value(Config::default())?;

        for tier in [ConfigTier::Project, ConfigTier::User] {
            if let Some(file) = paths.config_file(tier)
                && let Some(value) = read_tier(tier, &file)
            {
                overlay_tier(&mut merged, value);
            }
        }

        serde_json::from_value(merged).context("merged configuration is invalid")
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to the configuration.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Get the config file path that was used.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Apply environment variable overrides to config.
///
/// `lookup` resolves a variable name; tests pass a map instead of the process
/// environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(data_path) = lookup(DATA_PATH_ENV) {
        config.server.data_path = PathBuf::from(data_path);
    }

    if let Some(port) = lookup(PORT_ENV) {
        config.server.port = port
            .trim()
            .parse()
            .with_context(|| format!("{PORT_ENV} must be a port number, got {port:?}"))?;
    }

    if let Some(url) = lookup(GATEWAY_URL_ENV) {
        config.gateway.url = url;
    }

    if let Some(token) = lookup(GATEWAY_TOKEN_ENV) {
        config.gateway.token = Some(token);
    }

    Ok(())
}
