pub mod ssh;

use serde::{Deserialize, Serialize};
use std::{
    io,
    ops::{Deref, DerefMut},
    path::PathBuf,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to spawn remote command")]
    Spawn(#[source] io::Error),
    #[error("Remote command timed out")]
    Timeout,
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("I/O error while talking to the remote host")]
    Io(#[from] io::Error),
}

/// Where and as whom remote commands are executed
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    // seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    // seconds a waited command may run before it is killed
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Credentials {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: default_port(),
            key_path: None,
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    120
}

/// captured result of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// An open connection able to run shell commands on a remote host
pub trait Transport {
    /// remote user the session is authenticated as
    fn user(&self) -> &str;

    /// run `command` in `workdir`, `wait_result = false` does not capture any output
    fn execute(
        &mut self,
        command: &str,
        workdir: Option<&str>,
        wait_result: bool,
    ) -> Result<CommandOutput, TransportError>;

    fn close(&mut self);
}

/// Opens transports, one per call into a driver
pub trait Connector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, TransportError>;
}

/// Exclusively owned transport that is closed when dropped
pub struct Session {
    transport: Box<dyn Transport>,
}

impl Session {
    pub fn open(connector: &dyn Connector, credentials: &Credentials) -> Result<Self, TransportError> {
        debug!(host = %credentials.host, user = %credentials.user, "Opening session");

        Ok(Self {
            transport: connector.connect(credentials)?,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.transport.close();
        debug!("Closed session");
    }
}

impl Deref for Session {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        self.transport.as_ref()
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.transport.as_mut()
    }
}
