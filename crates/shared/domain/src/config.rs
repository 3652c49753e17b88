use crate::engine::EngineSet;
use serde::Deserialize;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

/// Top-level configuration of a QuotaHub process.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfigInner {
    pub quota: QuotaConfig,
    pub runtime: RuntimeSettings,
    pub logging: LoggingSettings,
}

/// Thin Arc-wrapped config for inexpensive cloning into subsystems.
#[derive(Default, Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(flatten, default)]
    inner: Arc<AppConfigInner>,
}

impl Deref for AppConfig {
    type Target = AppConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for AppConfig {
    fn deref_mut(&mut self) -> &mut AppConfigInner {
        Arc::make_mut(&mut self.inner)
    }
}

/// Limits and layout of the quota-managed storage tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Root directory holding the `persistent`, `temporary`, `default` and `private` repositories.
    pub storage_dir: PathBuf,
    /// Global ceiling in bytes for all temporary storage.
    pub temporary_limit: u64,
    /// Share of the global ceiling a single group may use.
    pub group_limit_ratio: f64,
    /// Lower bound of the per-group ceiling in bytes, capped by the global ceiling.
    pub group_limit_floor: u64,
    /// Engines registered at startup.
    pub engines: EngineSet,
    /// Whether usage is cached across restarts instead of rescanning the disk.
    pub usage_cache: bool,
    /// LZ4-compress the usage cache file.
    pub cache_compression: bool,
    /// Size of the blocking pool used for directory mutation.
    pub io_threads: usize,
}

impl QuotaConfig {
    /// `min(max(global * ratio, floor), global)`.
    ///
    /// The ratio is resolved to parts per million and applied in integer math, so large limits
    /// keep every byte.
    #[must_use]
    pub fn group_limit(&self) -> u64 {
        let global = self.temporary_limit;
        let share = u128::from(global) * u128::from(ratio_ppm(self.group_limit_ratio)) / PPM;
        u64::try_from(share).unwrap_or(global).max(self.group_limit_floor).min(global)
    }
}

const PPM: u128 = 1_000_000;

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "the value is clamped to 0..=1_000_000 before the cast"
)]
fn ratio_ppm(ratio: f64) -> u64 {
    if ratio.is_nan() {
        return 0;
    }
    (ratio.clamp(0.0, 1.0) * 1_000_000.0).round() as u64
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("storage"),
            temporary_limit: 1024 * MIB,
            group_limit_ratio: 0.25,
            group_limit_floor: 8 * MIB,
            engines: EngineSet::ALL,
            usage_cache: true,
            cache_compression: true,
            io_threads: 4,
        }
    }
}

/// Runtime profile selected for the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeProfile {
    #[default]
    Default,
    HighPerformance,
    MemoryEfficient,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub profile: RuntimeProfile,
    pub worker_threads: Option<usize>,
}

/// Console and file logging.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub filter: Option<String>,
    pub console: bool,
    pub directory: Option<PathBuf>,
    pub rotation: String,
    pub max_files: usize,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            filter: None,
            console: true,
            directory: None,
            rotation: "daily".to_owned(),
            max_files: 10,
            json: false,
        }
    }
}
