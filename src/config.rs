use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV: &str = "RELAYHUB_CONFIG";

pub fn get_base_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".relayhub")
}

pub fn get_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => get_base_dir().join("config.json"),
    }
}

/// Tunables for the orchestration engine.
///
/// Every field has a default so a partial JSON file is enough to override a
/// single value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum planner response length (in chars, after trimming).
    pub min_plan_chars: usize,
    /// How many trailing history messages are sent to API responders.
    pub history_limit: usize,
    /// Delay between injecting text and forcing the submit.
    pub inject_settle_ms: u64,
    /// Inactivity durations at which an escalating warning is logged.
    pub inactivity_warning_secs: Vec<u64>,
    pub activity_check_interval_ms: u64,
    pub link_retry_attempts: u32,
    pub link_retry_backoff_ms: u64,
    pub api_timeout_secs: u64,
    /// Script run by `node` for each automation bridge process.
    pub bridge_script: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_plan_chars: 50,
            history_limit: 40,
            inject_settle_ms: 800,
            inactivity_warning_secs: vec![10, 30, 120],
            activity_check_interval_ms: 1000,
            link_retry_attempts: 3,
            link_retry_backoff_ms: 500,
            api_timeout_secs: 120,
            bridge_script: None,
        }
    }
}

impl EngineConfig {
    pub fn inject_settle(&self) -> Duration {
        Duration::from_millis(self.inject_settle_ms)
    }

    pub fn activity_check_interval(&self) -> Duration {
        // interval() panics on a zero period
        Duration::from_millis(self.activity_check_interval_ms.max(1))
    }

    pub fn link_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.link_retry_backoff_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Warning thresholds, sorted ascending with duplicates removed.
    pub fn inactivity_thresholds(&self) -> Vec<Duration> {
        let mut secs = self.inactivity_warning_secs.clone();
        secs.sort_unstable();
        secs.dedup();
        secs.into_iter().map(Duration::from_secs).collect()
    }

    pub fn load_from_path(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse {}: {e}", path.display())))
    }

    /// Load the config from the default location, falling back to defaults
    /// when no file exists.
    pub fn load() -> AppResult<Self> {
        let path = get_config_path();
        if !path.exists() {
            log::debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let config = Self::load_from_path(&path)?;
        log::info!("Loaded engine config from {:?}", path);
        Ok(config)
    }
}
