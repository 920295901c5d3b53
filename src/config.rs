use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// System-wide JSON configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/dockhosts.conf.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Directory handed to dnsmasq as `--hostsdir`. Created at startup and
    /// removed on shutdown.
    pub hosts_folder: PathBuf,
    /// Seconds to wait before retrying an unreachable container runtime.
    pub no_docker_wait: u64,
    /// Seconds between two container polls.
    pub between_updates_wait: u64,
    pub docker_socket: String,
    pub dnsmasq_executable: String,
    pub dnsmasq_parameters: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts_folder: PathBuf::from("/var/run/docker-hosts"),
            no_docker_wait: 60,
            between_updates_wait: 2,
            docker_socket: "unix:///var/run/docker.sock".into(),
            dnsmasq_executable: "/usr/sbin/dnsmasq".into(),
            dnsmasq_parameters: [
                "--no-daemon",
                "--clear-on-reload",
                "--no-resolv",
                "--no-hosts",
                "--listen-address=127.0.0.54",
                "--port=53",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Config {
    /// Loads defaults, then the JSON file (`DOCKHOSTS_CONFIG_FILE` or
    /// [`DEFAULT_CONFIG_FILE`]), then `dockhosts.toml`, then `DOCKHOSTS_*`
    /// environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let json = std::env::var("DOCKHOSTS_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let config = Self::extract(Self::figment(&json))?;
        Ok(config)
    }

    pub fn figment(json_file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Json::file(json_file))
            .merge(Toml::file("dockhosts.toml"))
            .merge(
                Env::prefixed("DOCKHOSTS_")
                    .ignore(&["CONFIG_FILE"])
                    .map(|key| key.as_str().replace('_', "-").into()),
            )
    }

    pub fn extract(figment: Figment) -> Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| Error::InvalidConfig(format!("failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hosts_folder.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("hosts-folder must not be empty".into()));
        }
        if self.between_updates_wait == 0 {
            return Err(Error::InvalidConfig(
                "between-updates-wait must be at least one second".into(),
            ));
        }
        if self.no_docker_wait == 0 {
            return Err(Error::InvalidConfig(
                "no-docker-wait must be at least one second".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.between_updates_wait)
    }

    pub fn runtime_backoff(&self) -> Duration {
        Duration::from_secs(self.no_docker_wait)
    }
}
