//! Agent configuration: the YAML schema and the platform directories the
//! agent stores its state under.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

const APP_NAME: &str = "lognog-in";
const APP_AUTHOR: &str = "MachineKingLabs";

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file {}: {}", path.display(), source))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("could not determine a home directory for agent state"))]
    NoProjectDirs,
}

/// One root to watch: log tailing and FIM share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchPath {
    pub path: PathBuf,
    pub pattern: String,
    pub recursive: bool,
    pub enabled: bool,
}

impl Default for WatchPath {
    fn default() -> Self {
        WatchPath {
            path: PathBuf::new(),
            pattern: "*".to_owned(),
            recursive: true,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub api_key: String,
    pub hostname: String,

    pub watch_paths: Vec<WatchPath>,
    pub fim_paths: Vec<WatchPath>,
    pub fim_enabled: bool,

    pub batch_size: usize,
    pub batch_interval_seconds: f64,
    pub retry_max_attempts: u32,
    pub retry_backoff_seconds: f64,

    /// When set, the supervisor runs a full baseline verification pass on
    /// this interval. Unset means verification only happens on demand.
    pub fim_verify_interval_seconds: Option<u64>,

    pub debug_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_url: "http://localhost:4000".to_owned(),
            api_key: String::new(),
            hostname: default_hostname(),
            watch_paths: Vec::new(),
            fim_paths: Vec::new(),
            fim_enabled: false,
            batch_size: 100,
            batch_interval_seconds: 5.0,
            retry_max_attempts: 5,
            retry_backoff_seconds: 2.0,
            fim_verify_interval_seconds: None,
            debug_logging: false,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = fs::read_to_string(&path).context(ReadSnafu { path: &path })?;
        serde_yaml::from_str(&text).context(ParseSnafu { path: &path })
    }

    /// Whether the shipper has what it needs to authenticate against a
    /// server. Collectors run regardless; see the error handling design.
    pub fn is_configured(&self) -> bool {
        !self.server_url.is_empty() && !self.api_key.is_empty()
    }

    /// `config.yaml` under the per-user config directory.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs()?.config_dir().join("config.yaml"))
    }

    /// Per-user data directory holding `buffer.db`, `baseline.db`, and the
    /// single-instance lock.
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs()?.data_local_dir().to_path_buf())
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("", APP_AUTHOR, APP_NAME).context(NoProjectDirsSnafu)
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}
