#[macro_use]
extern crate tracing;

mod agents;
mod app_config;
mod remote_api;

pub use agents::{
    AgentKind,
    AgentSection,
    ModbusAgentConfig,
    ModbusPollingGroup,
    OidSpec,
    RegisterKind,
    RegisterSpec,
    RegisterVariable,
    SnmpAgentConfig,
    SnmpAuthGroup,
    SnmpPollingGroup,
};
pub use app_config::{
    get_config_dir,
    ENV_PREFIX,
};
pub use remote_api::RemoteApi;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    ops::Deref,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr as _,
    time::Duration,
};
use tracing::level_filters::LevelFilter;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{section}:{key} not defined in configuration")]
    Missing { section: &'static str, key: &'static str },
    #[error("{section}:{key} is invalid: {reason}")]
    Invalid {
        section: &'static str,
        key: &'static str,
        reason: String,
    },
    #[error("{key}: {:?} in configuration doesn't exist", .path.display().to_string())]
    DirectoryMissing { key: &'static str, path: PathBuf },
    #[error("failed to prepare {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

const DEFAULT_CONFIG: &str = include_str!("default-config.yaml");

#[derive(Debug, Deserialize)]
struct MainSection {
    interval: u64,
    fetch_timeout: u64,
    stop_timeout: u64,
    log_level: String,
    #[serde(default)]
    cache_directory: Option<String>,
    #[serde(default)]
    log_directory: Option<String>,
    #[serde(default)]
    daemon_directory: Option<String>,
}

/// Settings resolved from the configuration files.
///
/// Everything an agent needs except its identity, which lives in the daemon
/// directory and is attached with [`Settings::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub agent_name: String,
    pub poll_interval_seconds: u64,
    pub fetch_timeout_seconds: u64,
    pub stop_timeout_seconds: u64,
    pub log_level: String,
    pub cache_directory: PathBuf,
    pub daemon_directory: PathBuf,
    pub log_directory: PathBuf,
    pub remote_api: RemoteApi,
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    pub fn agent_cache_directory(&self) -> PathBuf {
        self.cache_directory.join(&self.agent_name)
    }

    pub fn agent_daemon_directory(&self) -> PathBuf {
        self.daemon_directory.join(&self.agent_name)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_directory.join(format!("{}.log", self.agent_name))
    }

    pub fn snapshot(self, agent_id: impl Into<String>) -> Result<ConfigSnapshot, ConfigError> {
        let agent_id = agent_id.into();
        if agent_id.trim().is_empty() || agent_id.contains('/') {
            return Err(ConfigError::Invalid {
                section: "daemon",
                key: "agent_id",
                reason: format!("{agent_id:?} cannot be used as an agent identity"),
            });
        }
        let endpoint = self.remote_api.receive_url(&agent_id)?;
        Ok(ConfigSnapshot {
            settings: self,
            agent_id,
            endpoint,
        })
    }
}

/// Fully resolved, read-only configuration of a running agent.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    #[serde(flatten)]
    pub settings: Settings,
    pub agent_id: String,
    /// Receive URL batches are posted to.
    pub endpoint: Url,
}

impl Deref for ConfigSnapshot {
    type Target = Settings;

    fn deref(&self) -> &Self::Target {
        &self.settings
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// Reads the embedded defaults, every YAML file of the configuration
/// directory and the `PATTOO_AGENT_*` environment, in that order.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: PathBuf,
    environment: bool,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment: true,
        }
    }

    /// Ignore environment overrides.
    pub fn without_environment(mut self) -> Self {
        self.environment = false;
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    #[instrument(level = "debug", skip(self), fields(config_dir = %self.config_dir.display(), section = A::SECTION))]
    pub fn load<A: AgentSection>(&self) -> Result<(Settings, A), ConfigError> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Yaml,
        ));

        for file in self.config_files()? {
            debug!(file = %file.display(), "adding configuration file");
            builder = builder.add_source(
                config::File::from(file)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        if self.environment {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let cfg = builder.build()?;

        let main: MainSection = cfg.get("main")?;
        let remote_api = cfg.get::<RemoteApi>("remote_api")?.normalize()?;
        let agent = match cfg.get::<A>(A::SECTION) {
            Ok(agent) => agent,
            Err(config::ConfigError::NotFound(_)) => {
                return Err(ConfigError::Missing {
                    section: A::SECTION,
                    key: "polling_groups",
                })
            }
            Err(err) => return Err(err.into()),
        };
        agent.validate()?;

        let log_level = main.log_level.trim().to_lowercase();
        if LevelFilter::from_str(&log_level).is_err() {
            return Err(ConfigError::Invalid {
                section: "main",
                key: "log_level",
                reason: format!("{log_level:?} is not a log level"),
            });
        }

        let cache_directory = ensure_directory("cache_directory", main.cache_directory)?;
        let daemon_directory = ensure_directory("daemon_directory", main.daemon_directory)?;
        let log_directory = existing_directory("log_directory", main.log_directory)?;

        let settings = Settings {
            agent_name: A::AGENT_NAME.to_string(),
            poll_interval_seconds: main.interval,
            fetch_timeout_seconds: main.fetch_timeout.max(1),
            stop_timeout_seconds: main.stop_timeout.max(1),
            log_level,
            cache_directory,
            daemon_directory,
            log_directory,
            remote_api,
        };
        debug!(?settings, "configuration resolved");
        Ok((settings, agent))
    }

    fn config_files(&self) -> Result<Vec<PathBuf>, ConfigError> {
        if !self.config_dir.is_dir() {
            return Err(ConfigError::DirectoryMissing {
                key: "config_directory",
                path: self.config_dir.clone(),
            });
        }
        let entries = std::fs::read_dir(&self.config_dir).map_err(|source| ConfigError::Io {
            path: self.config_dir.clone(),
            source,
        })?;

        let mut files = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }
}

fn required_directory(key: &'static str, value: Option<String>) -> Result<PathBuf, ConfigError> {
    let path = match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => app_config::expand_home(value),
        _ => return Err(ConfigError::Missing { section: "main", key }),
    };
    // the daemon changes its working directory
    std::path::absolute(&path).map_err(|source| ConfigError::Io { path, source })
}

fn ensure_directory(key: &'static str, value: Option<String>) -> Result<PathBuf, ConfigError> {
    let path = required_directory(key, value)?;
    std::fs::create_dir_all(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn existing_directory(key: &'static str, value: Option<String>) -> Result<PathBuf, ConfigError> {
    let path = required_directory(key, value)?;
    if !path.is_dir() {
        return Err(ConfigError::DirectoryMissing { key, path });
    }
    Ok(path)
}
