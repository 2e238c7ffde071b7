use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::args::BaseArgs;
use crate::http::{DEFAULT_API_URL, DEFAULT_AUTHORIZE_URL};
use crate::pipeline::PipelineOptions;
use crate::throttle::ThrottleSettings;
use crate::ui::{print_command_status, CommandStatus};

/// On-disk settings. Every key is optional; missing keys fall through to
/// the next layer.
#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub workers: Option<usize>,
    pub quota_per_window: Option<u32>,
    pub quota_window_secs: Option<u64>,
    pub safety_margin_secs: Option<u64>,
    pub failure_threshold: Option<usize>,
    pub progress_every: Option<usize>,
    pub api_url: Option<String>,
    pub authorize_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConfigFile {
    /// Values set in `other` win.
    fn merge(&mut self, other: ConfigFile) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            workers,
            quota_per_window,
            quota_window_secs,
            safety_margin_secs,
            failure_threshold,
            progress_every,
            api_url,
            authorize_url
        );
    }
}

pub fn global_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()?.join(".config"),
    };
    Some(base.join("fitmigrate").join("config.json"))
}

/// Read a settings file. A missing file is an empty config; an unreadable
/// or malformed one is reported and ignored.
pub fn load_file(path: &Path) -> ConfigFile {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ConfigFile::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not read {}: {e}", path.display()),
            );
            return ConfigFile::default();
        }
    };

    let config: ConfigFile = match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not parse {}: {e}", path.display()),
            );
            return ConfigFile::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("unknown config key {key} in {}", path.display()),
        );
    }
    debug!(path = %path.display(), "loaded config");
    config
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub workers: usize,
    pub throttle: ThrottleSettings,
    pub progress_every: usize,
    pub api_url: String,
    pub authorize_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 4,
            throttle: ThrottleSettings::default(),
            progress_every: 5,
            api_url: DEFAULT_API_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then the global config file, then `--config`, then flags.
    pub fn resolve(base: &BaseArgs) -> Result<Self> {
        Self::resolve_with(global_path().as_deref(), base)
    }

    fn resolve_with(global: Option<&Path>, base: &BaseArgs) -> Result<Self> {
        let mut file = global.map(load_file).unwrap_or_default();
        if let Some(path) = &base.config {
            if !path.is_file() {
                bail!("config file {} does not exist", path.display());
            }
            file.merge(load_file(path));
        }
        if let Some(api_url) = &base.api_url {
            file.api_url = Some(api_url.clone());
        }
        if let Some(authorize_url) = &base.authorize_url {
            file.authorize_url = Some(authorize_url.clone());
        }
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let defaults = Settings::default();
        let settings = Settings {
            workers: file.workers.unwrap_or(defaults.workers),
            throttle: ThrottleSettings {
                quota_per_window: file
                    .quota_per_window
                    .unwrap_or(defaults.throttle.quota_per_window),
                window: file
                    .quota_window_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.throttle.window),
                safety_margin: file
                    .safety_margin_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.throttle.safety_margin),
                failure_threshold: file
                    .failure_threshold
                    .unwrap_or(defaults.throttle.failure_threshold),
            },
            progress_every: file.progress_every.unwrap_or(defaults.progress_every),
            api_url: file
                .api_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            authorize_url: file.authorize_url.unwrap_or(defaults.authorize_url),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Result<Self> {
        if let Some(workers) = workers {
            self.workers = workers;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.throttle.window.is_zero() {
            bail!("quota_window_secs must be greater than 0");
        }
        if self.api_url.is_empty() {
            bail!("api_url must not be empty");
        }
        reqwest::Url::parse(&self.authorize_url)
            .with_context(|| format!("invalid authorize_url {}", self.authorize_url))?;
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            workers: self.workers,
            progress_every: self.progress_every,
            throttle: self.throttle,
        }
    }
}
