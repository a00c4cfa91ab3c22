use crate::transport::Credentials;
use http::Uri;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Error,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Driver not supported: {0}")]
    UnsupportedDriver(String),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Failed to read file")]
    ReadFailed(#[from] Error),
    #[error("Invalid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WlmConfig {
    // login used for every remote call
    pub credentials: Credentials,
    // remote working directory, the login directory if unset
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub drivers: DriversConfig,
}

/// read-only settings of every driver, shared by all calls into them
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DriversConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub spark: SparkConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ShellConfig {
    // durable `<job>,<exit code>` log, relative to the working directory
    #[serde(default = "default_monitor_log")]
    pub monitor_log: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            monitor_log: default_monitor_log(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SparkConfig {
    // Mesos master as seen from the login node
    #[serde(with = "http_serde::uri", default = "default_master")]
    pub master: Uri,
    #[serde(default = "default_submit")]
    pub submit: String,
    // secrets are looked up as `<secrets_dir>/<user>.<secret_scheme>`
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: String,
    #[serde(default = "default_secret_scheme")]
    pub secret_scheme: String,
}

impl Default for SparkConfig {
    fn default() -> Self {
        Self {
            master: default_master(),
            submit: default_submit(),
            secrets_dir: default_secrets_dir(),
            secret_scheme: default_secret_scheme(),
        }
    }
}

/// a single submission request as handed over by the orchestrator
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    pub name: String,
    // free-form, validated by the driver
    #[serde(default)]
    pub settings: serde_yaml::Value,
}

impl JobDescriptor {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(&read_file(path)?)?)
    }

    /// `type` token of the settings, if there is one
    pub fn job_type(&self) -> Option<&str> {
        self.settings.get("type").and_then(|value| value.as_str())
    }
}

impl WlmConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Self::from_yaml(&read_file(path)?)
    }

    pub fn from_yaml(source: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(source)?)
    }
}

impl DriversConfig {
    /// driver section of the config at `path`, the defaults if there is no such file
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigErrors> {
        if path.is_file() {
            WlmConfig::load(path).map(|config| config.drivers)
        } else {
            debug!(path = ?path, "No config found, using driver defaults");

            Ok(Self::default())
        }
    }
}

fn read_file(path: &Path) -> Result<String, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn default_monitor_log() -> String {
    String::from("monitor.data")
}

fn default_master() -> Uri {
    Uri::from_static("http://localhost:5050")
}

fn default_submit() -> String {
    String::from("spark-submit")
}

fn default_secrets_dir() -> String {
    String::from("/security/secrets")
}

fn default_secret_scheme() -> String {
    String::from("mesos")
}
