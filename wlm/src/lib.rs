//! Workload manager drivers: turn abstract job descriptions into scheduler
//! specific remote commands and scheduler status output into canonical job
//! states.

pub mod command;
pub mod config;
pub mod drivers;
pub mod naming;
pub mod state;
pub mod transport;

pub use config::{ConfigErrors, DriversConfig, JobDescriptor, WlmConfig};
pub use drivers::{Drivers, JobCall, SubmissionError, SubmissionResult, WorkloadManager};
pub use state::{JobState, ParsedStateMap};
pub use transport::{Connector, Credentials, Session, Transport, TransportError};
