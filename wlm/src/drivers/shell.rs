use super::{
    check_descriptor, validate_name, JobCall, SubmissionError, SubmissionResult, WorkloadManager,
};
use crate::{
    command::{pattern_escape, shell_quote},
    config::ShellConfig,
    state::{JobState, ParsedStateMap},
    transport::Transport,
};
use itertools::Itertools;
use serde_yaml::Value;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

pub const IDENTITY: &str = "SHELL";

/// Runs jobs as detached background processes on the login node
///
/// Every job appends `<name>,<exit code>` to the monitor log in its working
/// directory once it ends, which is the only state the driver ever reads back.
#[derive(Clone, Debug)]
pub struct ShellDriver {
    monitor_log: String,
}

impl ShellDriver {
    pub fn load(config: &ShellConfig) -> Self {
        Self {
            monitor_log: config.monitor_log.clone(),
        }
    }
}

/// exit code recorded for a job killed through `build_job_cancellation_call`
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// The exit code append identifying a job's wrapper shell
///
/// Only the wrapper's own command line carries it unexpanded, so it selects the
/// job exactly, `job1` never matches `job10`.
fn exit_code_marker(name: &str) -> String {
    format!("echo {name},$?")
}

/// exit codes as written by the job's shell
pub fn state_from_exit_code(exit_code: i32) -> JobState {
    match exit_code {
        0 => JobState::Completed,
        1 => JobState::Failed,
        // cannot execute
        126 => JobState::Revoked,
        // command not found
        127 => JobState::BootFail,
        // SIGINT
        CANCELLED_EXIT_CODE => JobState::Cancelled,
        _ => JobState::Failed,
    }
}

impl WorkloadManager for ShellDriver {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    #[instrument(skip(self, settings), level = "debug")]
    fn build_job_submission_call(&self, name: &str, settings: &Value) -> SubmissionResult {
        let settings = check_descriptor(name, settings, IDENTITY)?;
        let command = settings
            .scalar("command")?
            .ok_or(SubmissionError::MissingField("command"))?;

        let statement = settings
            .list("pre")?
            .into_iter()
            .chain([
                command,
                format!("{} >> {}", exit_code_marker(name), shell_quote(&self.monitor_log)),
            ])
            .chain(settings.list("post")?)
            .map(|entry| entry + "; ")
            .collect::<String>();

        // the job's own shell has to expand `$?`, hence the single quotes.
        // setsid makes that shell the leader of the job's process group
        let call = format!(
            "nohup setsid sh -c {} > ./{name}.out 2>&1 &",
            shell_quote(&statement)
        );
        debug!(call = %call, "Built submission call");

        Ok(JobCall {
            call,
            warnings: Vec::new(),
        })
    }

    /// Kill the process group of every wrapper shell running `name`
    ///
    /// The job is recorded as cancelled in the monitor log if anything was
    /// killed. The call exits with 0 when the job already ended.
    fn build_job_cancellation_call(
        &self,
        name: &str,
        _transport: &mut dyn Transport,
    ) -> Option<String> {
        if let Err(error) = validate_name(name) {
            warn!(job = %name, error = ?error, "Can't cancel job: {error}");

            return None;
        }

        let pattern = shell_quote(&pattern_escape(&exit_code_marker(name)));
        let call = format!(
            "found=; for pid in $(pgrep -f {pattern}); do kill -s TERM -\"$pid\" 2>/dev/null && found=1; done; \
             test -z \"$found\" || echo {name},{CANCELLED_EXIT_CODE} >> {}",
            shell_quote(&self.monitor_log)
        );
        debug!(call = %call, "Built cancellation call");

        Some(call)
    }

    fn build_container_script(&self, name: &str, settings: &Value) -> Option<String> {
        let (image, command, volumes) = match container_settings(name, settings) {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                debug!(job = %name, "No image set, nothing to wrap");

                return None;
            }
            Err(error) => {
                warn!(job = %name, error = ?error, "Can't build container script: {error}");

                return None;
            }
        };

        let binds = volumes
            .iter()
            .map(|volume| format!("-B {} ", shell_quote(volume)))
            .join("");

        Some(format!(
            "#!/bin/bash -l\n\nsingularity exec {binds}{} {command}\n",
            shell_quote(&image)
        ))
    }

    fn states_query(&self, _user: &str) -> String {
        // a missing log only means no job has finished yet
        let log = shell_quote(&self.monitor_log);
        format!("test ! -e {log} || cat {log}")
    }

    /// Parse the two column monitor log
    ///
    /// Jobs without an entry have not finished yet and are reported as
    /// pending. A job that was run more than once keeps its last entry.
    fn parse_states(&self, raw: &str, job_names: &[String]) -> ParsedStateMap {
        let mut finished = BTreeMap::new();

        for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match line
                .split_once(',')
                .and_then(|(name, code)| code.trim().parse::<i32>().ok().map(|code| (name, code)))
            {
                Some((name, code)) => {
                    finished.insert(name.trim(), state_from_exit_code(code));
                }
                None => warn!(line = line, "Skipping malformed monitor log line"),
            }
        }

        job_names
            .iter()
            .map(|name| {
                let state = finished
                    .get(name.as_str())
                    .copied()
                    .unwrap_or(JobState::Pending);

                (name.clone(), state)
            })
            .collect()
    }
}

fn container_settings(
    name: &str,
    settings: &Value,
) -> Result<Option<(String, String, Vec<String>)>, SubmissionError> {
    let settings = check_descriptor(name, settings, IDENTITY)?;

    match settings.scalar("image")? {
        Some(image) => {
            let command = settings
                .scalar("command")?
                .ok_or(SubmissionError::MissingField("command"))?;

            Ok(Some((image, command, settings.list("volumes")?)))
        }
        None => Ok(None),
    }
}
