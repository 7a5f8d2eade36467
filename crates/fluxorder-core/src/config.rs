use crate::error::{FluxError, Result};
use crate::image::ImagePolicy;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the scheduling loop. Per-unit intervals are checked on
    /// every tick, so this bounds how late an interval can fire.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_applies: usize,
    /// Consecutive failed applies before a unit is marked `Stalled`.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_seconds: u64,
}

fn default_tick_seconds() -> u64 {
    10
}

fn default_max_concurrent() -> usize {
    4
}

fn default_stall_threshold() -> u32 {
    3
}

fn default_apply_timeout() -> u64 {
    300
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            max_concurrent_applies: default_max_concurrent(),
            stall_threshold: default_stall_threshold(),
            apply_timeout_seconds: default_apply_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_seconds)
    }
}

// ---------------------------------------------------------------------------
// BackoffConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_seconds: u64,
    #[serde(default = "default_max_backoff")]
    pub max_seconds: u64,
}

fn default_initial_backoff() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    300
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_seconds: default_initial_backoff(),
            max_seconds: default_max_backoff(),
        }
    }
}

impl BackoffConfig {
    /// Delay before retrying after `failures` consecutive failures (1-indexed):
    /// `initial * 2^(failures - 1)`, capped at `max_seconds`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(32);
        let secs = self
            .initial_seconds
            .saturating_mul(1u64 << exp)
            .min(self.max_seconds);
        Duration::from_secs(secs)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Root that unit `spec.path` values are resolved against.
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,
    #[serde(default = "default_units_dir")]
    pub units_dir: PathBuf,
    /// Directory the bundled applier materializes resources into.
    #[serde(default = "default_target_dir")]
    pub target_dir: PathBuf,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_policies: Vec<ImagePolicy>,
}

fn default_version() -> u32 {
    1
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_units_dir() -> PathBuf {
    PathBuf::from(paths::UNITS_DIR)
}

fn default_target_dir() -> PathBuf {
    PathBuf::from(paths::CLUSTER_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            source_root: default_source_root(),
            units_dir: default_units_dir(),
            target_dir: default_target_dir(),
            scheduler: SchedulerConfig::default(),
            backoff: BackoffConfig::default(),
            image_policies: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(FluxError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn source_root(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.source_root)
    }

    pub fn units_dir(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.units_dir)
    }

    pub fn target_dir(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.target_dir)
    }

    pub fn image_policy(&self, name: &str) -> Option<&ImagePolicy> {
        self.image_policies.iter().find(|p| p.name == name)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.scheduler.max_concurrent_applies == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "scheduler.max_concurrent_applies is 0: no unit can ever apply"
                    .to_string(),
            });
        }

        if self.scheduler.stall_threshold == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "scheduler.stall_threshold is 0: the first failure stalls a unit"
                    .to_string(),
            });
        }

        if self.scheduler.apply_timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "scheduler.apply_timeout_seconds is 0: every apply times out"
                    .to_string(),
            });
        }

        if self.backoff.initial_seconds > self.backoff.max_seconds {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "backoff.initial_seconds ({}) exceeds backoff.max_seconds ({})",
                    self.backoff.initial_seconds, self.backoff.max_seconds
                ),
            });
        }

        let mut seen = HashSet::new();
        for policy in &self.image_policies {
            if !seen.insert(policy.name.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("duplicate image policy '{}'", policy.name),
                });
            }
            if let Err(e) = policy.check() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: e.to_string(),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
