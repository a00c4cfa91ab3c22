use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

/// map of job name -> canonical state, recomputed on every poll
pub type ParsedStateMap = BTreeMap<String, JobState>;

/// Canonical job state shared by all drivers
///
/// The declaration order is the merge precedence, lowest first: when two
/// observations of the same job disagree the later variant wins. A job only
/// stays `Completed` if every observation was `Completed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Completed,
    Pending,
    Running,
    Cancelled,
    Revoked,
    #[serde(alias = "BOOTFAIL")]
    BootFail,
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown job state '{0}'")]
pub struct UnknownState(pub String);

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Completed,
        JobState::Pending,
        JobState::Running,
        JobState::Cancelled,
        JobState::Revoked,
        JobState::BootFail,
        JobState::Failed,
    ];

    /// fold an incoming observation into the current aggregate
    pub fn merge(self, incoming: JobState) -> JobState {
        self.max(incoming)
    }

    /// true for states a job never leaves again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Cancelled => "CANCELLED",
            Self::Revoked => "REVOKED",
            Self::BootFail => "BOOT_FAIL",
            Self::Failed => "FAILED",
        }
    }
}

/// free function form of `JobState::merge`, usable as a fold reducer
pub fn merge(current: JobState, incoming: JobState) -> JobState {
    current.merge(incoming)
}

/// prevailing state over a sequence of observations, `None` if nothing was observed
pub fn prevailing<I: IntoIterator<Item = JobState>>(states: I) -> Option<JobState> {
    states.into_iter().reduce(merge)
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(Self::Completed),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "CANCELLED" => Ok(Self::Cancelled),
            "REVOKED" => Ok(Self::Revoked),
            "BOOT_FAIL" | "BOOTFAIL" => Ok(Self::BootFail),
            "FAILED" => Ok(Self::Failed),
            other => Err(UnknownState(other.to_string())),
        }
    }
}
