use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::fetch::{DEFAULT_TIMEOUT, DEFAULT_USER_AGENT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the page database snapshot.
    pub data_dir: PathBuf,
    /// Root for downloaded files (default: `<data_dir>/downloads`).
    pub download_dir: Option<PathBuf>,
    pub tick_secs: u64,
    pub fetch_timeout_secs: u64,
    pub max_concurrent_downloads: usize,
    pub max_concurrent_checks: usize,
    pub user_agent: String,
    pub webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("pagewatch-data"),
            download_dir: None,
            tick_secs: 60,
            fetch_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            max_concurrent_downloads: 4,
            max_concurrent_checks: 2,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            webhook_url: None,
        }
    }
}

impl Config {
    /// Reads the YAML file (if given) and applies `PAGEWATCH_*` overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)
                    .with_context(|| format!("read config: {}", path.display()))?;
                serde_yaml::from_str(&yaml)
                    .with_context(|| format!("parse config: {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = var("PAGEWATCH_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PAGEWATCH_DOWNLOAD_DIR") {
            self.download_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PAGEWATCH_TICK_SECS") {
            self.tick_secs = parse_env("PAGEWATCH_TICK_SECS", &v)?;
        }
        if let Some(v) = var("PAGEWATCH_FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = parse_env("PAGEWATCH_FETCH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("PAGEWATCH_MAX_CONCURRENT_DOWNLOADS") {
            self.max_concurrent_downloads = parse_env("PAGEWATCH_MAX_CONCURRENT_DOWNLOADS", &v)?;
        }
        if let Some(v) = var("PAGEWATCH_MAX_CONCURRENT_CHECKS") {
            self.max_concurrent_checks = parse_env("PAGEWATCH_MAX_CONCURRENT_CHECKS", &v)?;
        }
        if let Some(v) = var("PAGEWATCH_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = var("PAGEWATCH_WEBHOOK_URL") {
            self.webhook_url = Some(v);
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.tick_secs == 0 {
            anyhow::bail!("tick_secs must be at least 1");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("fetch_timeout_secs must be at least 1");
        }
        if let Some(url) = &self.webhook_url {
            url::Url::parse(url).with_context(|| format!("invalid webhook_url {url:?}"))?;
        }
        Ok(())
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn parse_env<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| anyhow::anyhow!("invalid {key}={raw:?}: {err}"))
}
