pub mod shell;
pub mod spark;


use crate::{
    config::{ConfigErrors, DriversConfig},
    state::ParsedStateMap,
    transport::{Connector, Credentials, Session, Transport},
};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Reasons a job descriptor is rejected before anything is sent to a scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Job name '{0}' is not a valid identifier")]
    InvalidName(String),
    #[error("Job settings must be a mapping")]
    SettingsNotMapping,
    #[error("'type' must be defined in job settings")]
    MissingType,
    #[error("Job type '{found}' not supported by the {expected} driver")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("'{0}' must be defined in job settings")]
    MissingField(&'static str),
    #[error("Invalid value for '{key}': {reason}")]
    InvalidField { key: String, reason: &'static str },
}

/// A rendered remote command plus whatever the driver had to say while rendering it
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct JobCall {
    pub call: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub type SubmissionResult = Result<JobCall, SubmissionError>;

/// Wire view of a `SubmissionResult`: exactly one of `{"call": ..}` or `{"error": ..}`
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionResponse {
    Call(String),
    Error(String),
}

impl From<&SubmissionResult> for SubmissionResponse {
    fn from(result: &SubmissionResult) -> Self {
        match result {
            Ok(job_call) => Self::Call(job_call.call.clone()),
            Err(error) => Self::Error(error.to_string()),
        }
    }
}

/// job names end up in shell commands, kill patterns and the comma separated monitor log
pub fn validate_name(name: &str) -> Result<(), SubmissionError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(SubmissionError::InvalidName(name.to_string()))
    }
}

/// Read-only view over the free-form settings of a job descriptor
#[derive(Debug, Clone, Copy)]
pub struct Settings<'a> {
    mapping: &'a Mapping,
}

impl<'a> Settings<'a> {
    pub fn from_value(value: &'a Value) -> Result<Self, SubmissionError> {
        value
            .as_mapping()
            .map(|mapping| Self { mapping })
            .ok_or(SubmissionError::SettingsNotMapping)
    }

    pub fn job_type(&self) -> Result<&'a str, SubmissionError> {
        match self.mapping.get("type") {
            None | Some(Value::Null) => Err(SubmissionError::MissingType),
            Some(Value::String(job_type)) => Ok(job_type.as_str()),
            Some(_) => Err(SubmissionError::InvalidField {
                key: "type".to_string(),
                reason: "expected a string",
            }),
        }
    }

    /// scalar value rendered as text, blank strings count as absent
    pub fn scalar(&self, key: &str) -> Result<Option<String>, SubmissionError> {
        match self.mapping.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => scalar_to_string(key, value),
        }
    }

    /// sequence of scalars, a lone scalar is treated as a one element sequence
    pub fn list(&self, key: &str) -> Result<Vec<String>, SubmissionError> {
        match self.mapping.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Sequence(entries)) => {
                let mut values = Vec::with_capacity(entries.len());

                for entry in entries {
                    if let Some(value) = scalar_to_string(key, entry)? {
                        values.push(value);
                    }
                }

                Ok(values)
            }
            Some(value) => scalar_to_string(key, value).map(|value| value.into_iter().collect()),
        }
    }
}

fn scalar_to_string(key: &str, value: &Value) -> Result<Option<String>, SubmissionError> {
    let text = match value {
        Value::Null => return Ok(None),
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => {
            return Err(SubmissionError::InvalidField {
                key: key.to_string(),
                reason: "expected a scalar value",
            })
        }
    };

    Ok(Some(text).filter(|text| !text.is_empty()))
}

/// checks shared by every driver: name, settings shape and the type token
pub fn check_descriptor<'a>(
    name: &str,
    settings: &'a Value,
    identity: &'static str,
) -> Result<Settings<'a>, SubmissionError> {
    validate_name(name)?;
    let settings = Settings::from_value(settings)?;
    let job_type = settings.job_type()?;

    if job_type != identity {
        return Err(SubmissionError::TypeMismatch {
            expected: identity,
            found: job_type.to_string(),
        });
    }

    Ok(settings)
}

/// Capabilities every scheduler family has to provide
pub trait WorkloadManager {
    /// type token this driver answers to, compared case-sensitively
    fn identity(&self) -> &'static str;

    /// render the single line command that submits `name` detached from the terminal
    fn build_job_submission_call(&self, name: &str, settings: &Value) -> SubmissionResult;

    /// render the command that cancels `name`, `None` if there is nothing to cancel
    ///
    /// Drivers backed by a query API use `transport` to look up live job ids first.
    fn build_job_cancellation_call(&self, name: &str, transport: &mut dyn Transport)
        -> Option<String>;

    /// wrapper script running the job inside a container, `None` if not applicable
    fn build_container_script(&self, name: &str, settings: &Value) -> Option<String>;

    /// remote command printing the raw status document
    fn states_query(&self, user: &str) -> String;

    /// turn the raw status document into a state for every requested job
    fn parse_states(&self, raw: &str, job_names: &[String]) -> ParsedStateMap;

    /// Query the scheduler for the state of `job_names`
    ///
    /// Failures to connect or a non-zero exit code of the query yield an empty
    /// map, the caller is expected to poll again later.
    #[instrument(skip(self, connector, credentials), fields(driver = self.identity()))]
    fn get_states(
        &self,
        connector: &dyn Connector,
        workdir: Option<&str>,
        credentials: &Credentials,
        job_names: &[String],
    ) -> ParsedStateMap {
        let mut session = match Session::open(connector, credentials) {
            Ok(session) => session,
            Err(error) => {
                warn!(error = ?error, "Failed to open session for state query: {error}");

                return ParsedStateMap::new();
            }
        };

        let query = self.states_query(session.user());

        match session.execute(&query, workdir, true) {
            Ok(output) if output.exit_code == 0 => {
                let states = self.parse_states(&output.stdout, job_names);
                debug!(states = ?states, "Parsed job states");

                states
            }
            Ok(output) => {
                warn!(
                    exit_code = output.exit_code,
                    query = %query,
                    "State query exited with a non-zero code"
                );

                ParsedStateMap::new()
            }
            Err(error) => {
                warn!(error = ?error, query = %query, "State query failed: {error}");

                ParsedStateMap::new()
            }
        }
    }
}

/// All supported drivers, created through `Drivers::load`
#[derive(Clone, Debug)]
pub enum Drivers {
    Shell(shell::ShellDriver),
    Spark(spark::SparkDriver),
}

impl Drivers {
    /// resolve a scheduler type token to its driver
    pub fn load(token: &str, config: &DriversConfig) -> Result<Self, ConfigErrors> {
        match token {
            shell::IDENTITY => Ok(Self::Shell(shell::ShellDriver::load(&config.shell))),
            spark::IDENTITY => Ok(Self::Spark(spark::SparkDriver::load(&config.spark))),
            _ => Err(ConfigErrors::UnsupportedDriver(token.to_string())),
        }
    }

    /// `Drivers::load` with every driver on its default configuration
    pub fn factory(token: &str) -> Result<Self, ConfigErrors> {
        Self::load(token, &DriversConfig::default())
    }

    fn inner(&self) -> &dyn WorkloadManager {
        match self {
            Self::Shell(driver) => driver,
            Self::Spark(driver) => driver,
        }
    }
}

impl WorkloadManager for Drivers {
    fn identity(&self) -> &'static str {
        self.inner().identity()
    }

    fn build_job_submission_call(&self, name: &str, settings: &Value) -> SubmissionResult {
        self.inner().build_job_submission_call(name, settings)
    }

    fn build_job_cancellation_call(
        &self,
        name: &str,
        transport: &mut dyn Transport,
    ) -> Option<String> {
        self.inner().build_job_cancellation_call(name, transport)
    }

    fn build_container_script(&self, name: &str, settings: &Value) -> Option<String> {
        self.inner().build_container_script(name, settings)
    }

    fn states_query(&self, user: &str) -> String {
        self.inner().states_query(user)
    }

    fn parse_states(&self, raw: &str, job_names: &[String]) -> ParsedStateMap {
        self.inner().parse_states(raw, job_names)
    }
}
