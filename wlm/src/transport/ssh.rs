use super::{CommandOutput, Connector, Credentials, Transport, TransportError};
use crate::command::shell_quote;
use std::{
    env,
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};
use tracing::{debug, instrument, trace, warn};
use wait_timeout::ChildExt;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opens sessions through the system `ssh` binary
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SshSession::open(credentials.clone())?))
    }
}

/// A multiplexed ssh connection, every command reuses the master opened in `open`
#[derive(Debug)]
pub struct SshSession {
    credentials: Credentials,
    control_path: PathBuf,
    open: bool,
}

impl SshSession {
    #[instrument(skip(credentials), fields(host = %credentials.host))]
    pub fn open(credentials: Credentials) -> Result<Self, TransportError> {
        let control_path = env::temp_dir().join(format!(
            "wlm-{}-{}.ssh",
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));

        let mut session = Self {
            credentials,
            control_path,
            open: false,
        };

        // -f returns once authenticated, the master stays in the background
        let output = Command::new("ssh")
            .args(session.base_args())
            .args(["-M", "-N", "-f"])
            .arg(session.destination())
            .stdin(Stdio::null())
            .output()
            .map_err(TransportError::Spawn)?;

        if !output.status.success() {
            return Err(TransportError::Connection(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        debug!(control_path = ?session.control_path, "Opened ssh master connection");
        session.open = true;

        Ok(session)
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.credentials.user, self.credentials.host)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.credentials.connect_timeout),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-p".to_string(),
            self.credentials.port.to_string(),
        ];

        if let Some(ref key_path) = self.credentials.key_path {
            args.push("-i".to_string());
            args.push(key_path.display().to_string());
        }

        args
    }
}

/// prefix `command` with a change into `workdir`
pub fn remote_command(command: &str, workdir: Option<&str>) -> String {
    match workdir {
        Some(workdir) if !workdir.is_empty() => format!("cd {} && {command}", shell_quote(workdir)),
        _ => command.to_string(),
    }
}

impl Transport for SshSession {
    fn user(&self) -> &str {
        &self.credentials.user
    }

    #[instrument(skip(self), level = "debug")]
    fn execute(
        &mut self,
        command: &str,
        workdir: Option<&str>,
        wait_result: bool,
    ) -> Result<CommandOutput, TransportError> {
        if !self.open {
            return Err(TransportError::Connection("session is closed".to_string()));
        }

        let mut child = Command::new("ssh")
            .args(self.base_args())
            .arg(self.destination())
            .arg(remote_command(command, workdir))
            .stdin(Stdio::null())
            .stdout(if wait_result {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::null())
            .spawn()
            .map_err(TransportError::Spawn)?;

        // drain stdout while waiting, large status documents would fill the pipe
        let reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buffer = String::new();
                stdout.read_to_string(&mut buffer).map(|_| buffer)
            })
        });

        let timeout = Duration::from_secs(self.credentials.command_timeout);
        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                warn!(timeout = ?timeout, "Remote command timed out, killing it");
                child.kill()?;
                child.wait()?;

                return Err(TransportError::Timeout);
            }
        };

        let stdout = match reader {
            Some(handle) => handle
                .join()
                .map_err(|_| TransportError::Connection("output reader panicked".to_string()))??,
            None => String::new(),
        };

        // ssh has no exit code of its own when killed by a signal
        let exit_code = status.code().unwrap_or(-1);
        trace!(exit_code = exit_code, output = %stdout, "Remote command finished");

        Ok(CommandOutput { stdout, exit_code })
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }

        self.open = false;

        match Command::new("ssh")
            .args(self.base_args())
            .args(["-O", "exit"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => debug!(success = status.success(), "Closed ssh master connection"),
            Err(error) => warn!(error = ?error, "Failed to close ssh master connection"),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}
