use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::app::dispatcher::DispatchMode;

const ENV_PREFIX: &str = "NOVELINGEST_";

pub const DEFAULT_USER_AGENT: &str = concat!("novelingest/", env!("CARGO_PKG_VERSION"));

/// Runtime settings. Read from an optional YAML file, then overridden by
/// `NOVELINGEST_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub default_sync_interval_minutes: u32,
    pub max_backoff_minutes: u32,
    /// Consecutive sync failures before a source is disabled; 0 never disables.
    pub disable_after_failures: u32,
    pub stalled_job_after_minutes: u32,
    pub max_concurrent_syncs: usize,
    pub dispatch_mode: DispatchMode,
    pub audio_worker_url: Option<String>,
    pub audio_worker_token: Option<String>,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    /// CSS selector for chapter links on a source index page.
    pub chapter_link_selector: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("novelingest-data"),
            poll_interval_secs: 900,
            default_sync_interval_minutes: 60,
            max_backoff_minutes: 1440,
            disable_after_failures: 10,
            stalled_job_after_minutes: 360,
            max_concurrent_syncs: 4,
            dispatch_mode: DispatchMode::Outbox,
            audio_worker_url: None,
            audio_worker_token: None,
            fetch_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            chapter_link_selector: None,
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let settings = match config_path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        settings.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("parse yaml settings")
    }

    /// Applies `NOVELINGEST_<FIELD>` overrides resolved through `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (key, value))
        };

        if let Some((_, value)) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some((key, value)) = get("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = get("DEFAULT_SYNC_INTERVAL_MINUTES") {
            self.default_sync_interval_minutes = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_BACKOFF_MINUTES") {
            self.max_backoff_minutes = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = get("DISABLE_AFTER_FAILURES") {
            self.disable_after_failures = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = get("STALLED_JOB_AFTER_MINUTES") {
            self.stalled_job_after_minutes = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_CONCURRENT_SYNCS") {
            self.max_concurrent_syncs = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = get("DISPATCH_MODE") {
            self.dispatch_mode = DispatchMode::parse(&value).with_context(|| {
                format!("invalid {key}={value:?}. expected one of: outbox, worker, channel")
            })?;
        }
        if let Some((_, value)) = get("AUDIO_WORKER_URL") {
            self.audio_worker_url = Some(value);
        }
        if let Some((_, value)) = get("AUDIO_WORKER_TOKEN") {
            self.audio_worker_token = Some(value);
        }
        if let Some((key, value)) = get("FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = parse_number(&key, &value)?;
        }
        if let Some((_, value)) = get("USER_AGENT") {
            self.user_agent = value;
        }
        if let Some((_, value)) = get("CHAPTER_LINK_SELECTOR") {
            self.chapter_link_selector = Some(value);
        }

        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stalled_job_after(&self) -> Duration {
        Duration::from_secs(u64::from(self.stalled_job_after_minutes) * 60)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid {key}={value:?}: {err}"))
}
