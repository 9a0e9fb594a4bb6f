//! Configuration snapshot: loaded once at startup, amended over the bus,
//! persisted pretty-printed on every amendment and on clean shutdown.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// Shared handle to the live configuration. Bus methods take the write side,
/// everything else reads.
pub type SharedConfig = Arc<RwLock<Config>>;

const CONFIG_ENV: &str = "GOIDLE_CONFIG";
const CONFIG_RELATIVE_PATH: &str = ".config/goidle.json";

/// Lockers probed on PATH when no lock_command is configured, in order of
/// preference.
const KNOWN_LOCKERS: [&str; 3] = ["hyprlock", "swaylock", "waylock"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backlight_curve_factor: f64,
    pub backlight_dim_ratio: f64,
    pub backlight_steps: usize,
    #[serde(with = "humantime_serde")]
    pub idle_grace_duration: Duration,
    pub lock_command: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub lock_init_ignore_input_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_active_dim: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_active_to_idle: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_idle_backlight_off: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_idle_to_suspend: Duration,
    pub suspend_command: Vec<String>,
    pub trusted_wifi_networks: Vec<String>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            backlight_curve_factor: 0.0,
            backlight_dim_ratio: 0.0,
            backlight_steps: 0,
            idle_grace_duration: Duration::ZERO,
            lock_command: Vec::new(),
            lock_init_ignore_input_timeout: Duration::ZERO,
            timeout_active_dim: Duration::ZERO,
            timeout_active_to_idle: Duration::ZERO,
            timeout_idle_backlight_off: Duration::ZERO,
            timeout_idle_to_suspend: Duration::ZERO,
            suspend_command: Vec::new(),
            trusted_wifi_networks: Vec::new(),
            path: PathBuf::new(),
        }
    }
}

/// Resolve the config file location from `GOIDLE_CONFIG`, falling back to
/// `$HOME/.config/goidle.json`.
pub fn config_path() -> PathBuf {
    if let Some(path) = env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let home = env::var_os("HOME").unwrap_or_default();
    Path::new(&home).join(CONFIG_RELATIVE_PATH)
}

impl Config {
    /// Load the configuration from `path`. Unreadable or unparsable files
    /// log a message and yield the defaults; a missing locker is the only
    /// startup-fatal condition.
    pub fn load(path: PathBuf) -> Result<Config> {
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Config>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("config file is not valid, using defaults: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                log::info!("could not read config, creating a new one: {}", e);
                Config::default()
            }
        };
        config.path = path;
        config.apply_defaults()?;
        Ok(config)
    }

    /// Fill every zero-valued field with its default. The active-to-idle and
    /// idle-to-suspend timeouts derive from the timeouts they follow.
    fn apply_defaults(&mut self) -> Result<()> {
        if self.backlight_curve_factor == 0.0 {
            self.backlight_curve_factor = 0.5;
        }
        if self.backlight_dim_ratio == 0.0 {
            self.backlight_dim_ratio = 0.2;
        }
        if self.backlight_steps == 0 {
            self.backlight_steps = 16;
        }
        if self.idle_grace_duration.is_zero() {
            self.idle_grace_duration = Duration::from_secs(30);
        }
        if self.lock_init_ignore_input_timeout.is_zero() {
            self.lock_init_ignore_input_timeout = Duration::from_secs(1);
        }
        if self.timeout_active_dim.is_zero() {
            self.timeout_active_dim = Duration::from_secs(150);
            log::info!("timeout_active_dim not set, using 150s");
        }
        if self.timeout_active_to_idle.is_zero() {
            self.timeout_active_to_idle = self.timeout_active_dim + Duration::from_secs(30);
            log::info!(
                "timeout_active_to_idle not set, using timeout_active_dim + 30s ({})",
                humantime::format_duration(self.timeout_active_to_idle)
            );
        }
        if self.timeout_idle_backlight_off.is_zero() {
            self.timeout_idle_backlight_off = Duration::from_secs(15);
            log::info!("timeout_idle_backlight_off not set, using 15s");
        }
        if self.timeout_idle_to_suspend.is_zero() {
            self.timeout_idle_to_suspend =
                self.timeout_idle_backlight_off + Duration::from_secs(5);
            log::info!(
                "timeout_idle_to_suspend not set, using timeout_idle_backlight_off + 5s ({})",
                humantime::format_duration(self.timeout_idle_to_suspend)
            );
        }
        if self.lock_command.is_empty() {
            self.lock_command = default_lock_command()?;
        }
        Ok(())
    }

    /// Add a trusted hardware address, deduplicating.
    pub fn trust_address(&mut self, address: String) {
        if self.trusted_wifi_networks.contains(&address) {
            return;
        }
        self.trusted_wifi_networks.push(address);
        log::debug!("added trusted network");
    }

    /// Remove a hardware address from the trusted list.
    pub fn distrust_address(&mut self, address: &str) {
        self.trusted_wifi_networks.retain(|known| known != address);
    }

    /// Rewrite the config file pretty-printed. Failures are logged; callers
    /// have nothing useful to do with them.
    pub async fn dump(&self) {
        log::debug!("dumping config to disk");
        let serialized = match serde_json::to_string_pretty(self) {
            Ok(serialized) => serialized,
            Err(e) => {
                log::error!("could not serialize config: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, serialized).await {
            log::error!("could not write config to {}: {}", self.path.display(), e);
        }
    }
}

fn default_lock_command() -> Result<Vec<String>> {
    let path_dirs: Vec<PathBuf> = env::split_paths(&env::var_os("PATH").unwrap_or_default())
        .collect();
    for locker in KNOWN_LOCKERS {
        if find_executable_in(&path_dirs, locker).is_some() {
            return Ok(vec![locker.to_string()]);
        }
    }
    Err(anyhow!("no screen locker found on PATH, not starting"))
}

fn find_executable_in(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
