use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::global::utils::{default_prefix, user_config_file};

/// User configuration, read from `config.toml`.
///
/// Every key is optional; missing keys take their defaults.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding formula files.
    pub formula_dir: PathBuf,
    /// Install prefix; binaries land in `<prefix>/<name>/<version>/bin`.
    pub prefix: PathBuf,
    /// Parallel pipelines; 0 lets the thread pool decide.
    pub jobs: usize,
    pub fetch_timeout_secs: u64,
    pub toolchain_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub upstream_timeout_secs: u64,
    /// Extra attempts for livecheck when the upstream host is unavailable.
    pub livecheck_retries: u32,
    pub github_api: String,
    pub cache_sources: bool,
}

impl Default for Config {
    fn default() -> Self {
        let prefix = default_prefix()
            .unwrap_or_else(|_| PathBuf::from(".formulary").join("Cellar"));
        Self {
            formula_dir: PathBuf::from("Formula"),
            prefix,
            jobs: 0,
            fetch_timeout_secs: 300,
            toolchain_timeout_secs: 1800,
            verify_timeout_secs: 30,
            upstream_timeout_secs: 30,
            livecheck_retries: 2,
            github_api: "https://api.github.com".to_string(),
            cache_sources: true,
        }
    }
}

impl Config {
    /// Loads a `Config` from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Loads `path` if given, else the per-user `config.toml` if it exists,
    /// else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
        if let Some(path) = path {
            return Config::load(path);
        }
        match user_config_file() {
            Ok(file) if file.exists() => Config::load(file),
            _ => {
                debug!("no config file, using defaults");
                Ok(Config::default())
            }
        }
    }

    /// Saves the `Config` to the given path in pretty TOML format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn toolchain_timeout(&self) -> Duration {
        Duration::from_secs(self.toolchain_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}
