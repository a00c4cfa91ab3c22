use super::{check_descriptor, JobCall, SubmissionError, SubmissionResult, WorkloadManager};
use crate::{
    command::{render_flags, shell_quote, FlagSpec},
    config::SparkConfig,
    state::{prevailing, JobState, ParsedStateMap},
    transport::Transport,
};
use itertools::Itertools;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashMap;
use tracing::{debug, error, instrument, warn};

pub const IDENTITY: &str = "SPARK";

/// spark-submit flags in the order they are rendered
pub const SUBMIT_FLAGS: [FlagSpec; 5] = [
    FlagSpec::optional("class_name", "--class"),
    FlagSpec::with_default("total_executor_cores", "--total-executor-cores", "1"),
    FlagSpec::with_default("executor_memory", "--executor-memory", "2G"),
    FlagSpec::with_default("driver_cores", "--driver-cores", "1"),
    FlagSpec::with_default("driver_memory", "--driver-memory", "2G"),
];

/// Mesos task states mapped onto canonical job states
static TASK_STATES: Lazy<HashMap<&'static str, JobState>> = Lazy::new(|| {
    HashMap::from([
        ("TASK_STAGING", JobState::Pending),
        ("TASK_STARTING", JobState::Pending),
        ("TASK_UNREACHABLE", JobState::Pending),
        ("TASK_RUNNING", JobState::Running),
        ("TASK_KILLING", JobState::Running),
        ("TASK_FINISHED", JobState::Completed),
        ("TASK_KILLED", JobState::Cancelled),
        ("TASK_FAILED", JobState::Failed),
        ("TASK_ERROR", JobState::Failed),
        ("TASK_LOST", JobState::Failed),
        ("TASK_DROPPED", JobState::Failed),
        ("TASK_GONE", JobState::Failed),
        ("TASK_GONE_BY_OPERATOR", JobState::Failed),
    ])
});

/// Body of the master's `/frameworks` endpoint, reduced to what is needed here
#[derive(Deserialize, Debug, Clone, Default)]
pub struct FrameworksDocument {
    // running frameworks
    #[serde(default)]
    pub frameworks: Vec<Framework>,
    #[serde(default)]
    pub completed_frameworks: Vec<Framework>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Framework {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub completed_tasks: Vec<Task>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Task {
    pub state: String,
}

/// translate a native task state, anything unknown counts as failed
pub fn task_state(token: &str) -> JobState {
    match TASK_STATES.get(token) {
        Some(state) => *state,
        None => {
            warn!(state = token, "Unknown task state, treating it as failed");

            JobState::Failed
        }
    }
}

/// Submits through spark-submit against a Mesos master and reads states back
/// from the master's REST endpoint
#[derive(Clone, Debug)]
pub struct SparkDriver {
    config: SparkConfig,
}

impl SparkDriver {
    pub fn load(config: &SparkConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// master url carrying the user's secret, the secret is only read on the remote host
    fn endpoint(&self, user: &str, path: &str) -> String {
        let master = &self.config.master;
        let scheme = master.scheme_str().unwrap_or("http");
        let host = master.host().unwrap_or("localhost");
        let authority = match master.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        format!(
            "{scheme}://{user}:`cat {}/{user}.{}`@{authority}/{path}",
            self.config.secrets_dir, self.config.secret_scheme
        )
    }

    /// One teardown request per running framework called `name`
    ///
    /// Returns `None` when nothing by that name is running, cancelling a job
    /// that already ended is not an error.
    pub fn teardown_calls(&self, document: &FrameworksDocument, user: &str, name: &str) -> Option<String> {
        let teardown = self.endpoint(user, "teardown");
        let calls = document
            .frameworks
            .iter()
            .filter(|framework| framework.name == name)
            .map(|framework| {
                format!(
                    "curl -s -X POST {teardown} -d {}; ",
                    shell_quote(&format!("frameworkId={}", framework.id))
                )
            })
            .collect::<String>();

        debug!(job = %name, calls = %calls, "Built teardown calls");

        Some(calls).filter(|calls| !calls.is_empty())
    }

    /// Prevailing state of `job_name` across all frameworks carrying that name
    ///
    /// Completed frameworks contribute their completed tasks, running ones
    /// their active tasks. A running framework without an active task is
    /// pending, whatever its executors that already ended reported. A job no
    /// framework matches at all is considered failed.
    pub fn parse_frameworks_states(&self, document: &FrameworksDocument, job_name: &str) -> JobState {
        let completed = document
            .completed_frameworks
            .iter()
            .filter(|framework| framework.name == job_name)
            .flat_map(|framework| framework.completed_tasks.iter())
            .map(|task| task_state(&task.state));

        let running = document
            .frameworks
            .iter()
            .filter(|framework| framework.name == job_name)
            .flat_map(|framework| {
                framework
                    .tasks
                    .is_empty()
                    .then_some(JobState::Pending)
                    .into_iter()
                    .chain(framework.tasks.iter().map(|task| task_state(&task.state)))
            });

        match prevailing(completed.chain(running)) {
            Some(state) => state,
            None => {
                debug!(job = %job_name, "No framework matches the job");

                JobState::Failed
            }
        }
    }
}

impl WorkloadManager for SparkDriver {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    #[instrument(skip(self, settings), level = "debug")]
    fn build_job_submission_call(&self, name: &str, settings: &Value) -> SubmissionResult {
        let settings = check_descriptor(name, settings, IDENTITY)?;
        let application = settings
            .scalar("application")?
            .ok_or(SubmissionError::MissingField("application"))?;

        let mut warnings = Vec::new();
        let flags = render_flags(&settings, &SUBMIT_FLAGS, &mut warnings)?;
        let params = settings.list("application_params")?;

        let submit = [
            "nohup".to_string(),
            shell_quote(&self.config.submit),
            "--name".to_string(),
            name.to_string(),
        ]
        .into_iter()
        .chain(flags)
        .chain([shell_quote(&application)])
        .chain(params.iter().map(|param| shell_quote(param)))
        .chain([format!("> ./{name}.out 2>&1 &")])
        .join(" ");

        let call = settings
            .list("pre")?
            .into_iter()
            .map(|entry| entry + "; ")
            .chain([submit])
            .collect::<String>();
        debug!(call = %call, "Built submission call");

        Ok(JobCall { call, warnings })
    }

    #[instrument(skip(self, transport), level = "debug")]
    fn build_job_cancellation_call(
        &self,
        name: &str,
        transport: &mut dyn Transport,
    ) -> Option<String> {
        let user = transport.user().to_string();
        let query = self.states_query(&user);

        let output = match transport.execute(&query, None, true) {
            Ok(output) if output.exit_code == 0 => output,
            Ok(output) => {
                warn!(exit_code = output.exit_code, "Framework query for cancellation failed");

                return None;
            }
            Err(error) => {
                warn!(error = ?error, "Framework query for cancellation failed: {error}");

                return None;
            }
        };

        match serde_json::from_str::<FrameworksDocument>(&output.stdout) {
            Ok(document) => self.teardown_calls(&document, &user, name),
            Err(error) => {
                warn!(error = ?error, "Failed to read framework document: {error}");

                None
            }
        }
    }

    fn build_container_script(&self, name: &str, _settings: &Value) -> Option<String> {
        error!(job = %name, "Container scripts are not applicable to Spark jobs");

        None
    }

    fn states_query(&self, user: &str) -> String {
        format!("curl -s {}", self.endpoint(user, "frameworks"))
    }

    fn parse_states(&self, raw: &str, job_names: &[String]) -> ParsedStateMap {
        let document = match serde_json::from_str::<FrameworksDocument>(raw) {
            Ok(document) => document,
            Err(error) => {
                warn!(error = ?error, "Failed to read framework document: {error}");

                return ParsedStateMap::new();
            }
        };

        job_names
            .iter()
            .map(|name| (name.clone(), self.parse_frameworks_states(&document, name)))
            .collect()
    }
}
