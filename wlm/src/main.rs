use clap::{Parser, Subcommand};
use hpc_wlm::{
    config::{ConfigErrors, DriversConfig, JobDescriptor, WlmConfig},
    drivers::{Drivers, SubmissionResponse, WorkloadManager},
    naming::random_name,
    transport::{ssh::SshConnector, Session, TransportError},
};
use serde::Serialize;
use serde_json::json;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Submit, cancel and monitor jobs on HPC workload managers")]
struct Cli {
    /// YAML configuration with credentials and driver settings
    #[arg(short, long, default_value = "wlm.yaml")]
    config: PathBuf,
    /// log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit the job described by a YAML job file
    Submit {
        job: PathBuf,
        /// only print the rendered call
        #[arg(long)]
        dry_run: bool,
    },
    /// Cancel a running job
    Cancel {
        /// scheduler type, e.g. SHELL or SPARK
        driver: String,
        name: String,
        /// only print the rendered call
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the current state of jobs as JSON
    States {
        /// scheduler type, e.g. SHELL or SPARK
        driver: String,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Print the container wrapper script for a YAML job file
    Script { job: PathBuf },
    /// Generate a random job name
    Name { base: String },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigErrors),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Job file {0:?} has no 'type' in its settings")]
    MissingType(PathBuf),
    #[error("Failed to serialize output")]
    Output(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            error!(error = ?error, "{error}");

            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, CliError> {
    match cli.command {
        Commands::Submit { job, dry_run } => submit(&cli.config, &job, dry_run),
        Commands::Cancel {
            driver,
            name,
            dry_run,
        } => cancel(&cli.config, &driver, &name, dry_run),
        Commands::States { driver, names } => states(&cli.config, &driver, &names),
        Commands::Script { job } => script(&cli.config, &job),
        Commands::Name { base } => {
            println!("{}", random_name(&base));

            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);

    Ok(())
}

fn load_job(path: &Path) -> Result<(JobDescriptor, String), CliError> {
    let job = JobDescriptor::load(path)?;
    let token = job
        .job_type()
        .map(str::to_string)
        .ok_or_else(|| CliError::MissingType(path.to_path_buf()))?;

    Ok((job, token))
}

fn submit(config_path: &Path, job_path: &Path, dry_run: bool) -> Result<ExitCode, CliError> {
    let (job, token) = load_job(job_path)?;
    // a dry run never connects, so credentials are optional
    let config = if dry_run {
        None
    } else {
        Some(WlmConfig::load(config_path)?)
    };
    let drivers_config = match config {
        Some(ref config) => config.drivers.clone(),
        None => DriversConfig::load_or_default(config_path)?,
    };

    let driver = Drivers::load(&token, &drivers_config)?;
    let result = driver.build_job_submission_call(&job.name, &job.settings);
    print_json(&SubmissionResponse::from(&result))?;

    let job_call = match result {
        Ok(job_call) => job_call,
        Err(_) => return Ok(ExitCode::FAILURE),
    };

    let Some(config) = config else {
        return Ok(ExitCode::SUCCESS);
    };

    let mut session = Session::open(&SshConnector, &config.credentials)?;
    let output = session.execute(&job_call.call, config.workdir.as_deref(), false)?;

    if output.exit_code == 0 {
        info!(job = %job.name, "Submitted job");

        Ok(ExitCode::SUCCESS)
    } else {
        warn!(job = %job.name, exit_code = output.exit_code, "Submission call failed");

        Ok(ExitCode::FAILURE)
    }
}

fn cancel(config_path: &Path, token: &str, name: &str, dry_run: bool) -> Result<ExitCode, CliError> {
    let config = WlmConfig::load(config_path)?;
    let driver = Drivers::load(token, &config.drivers)?;

    let mut session = Session::open(&SshConnector, &config.credentials)?;
    let call = driver.build_job_cancellation_call(name, &mut *session);
    print_json(&json!({ "call": call }))?;

    match call {
        Some(call) if !dry_run => {
            let output = session.execute(&call, config.workdir.as_deref(), true)?;

            if output.exit_code != 0 {
                warn!(job = %name, exit_code = output.exit_code, "Cancellation call failed");

                return Ok(ExitCode::FAILURE);
            }

            info!(job = %name, "Cancelled job");
        }
        Some(_) => {}
        None => info!(job = %name, "Nothing to cancel"),
    }

    Ok(ExitCode::SUCCESS)
}

fn states(config_path: &Path, token: &str, names: &[String]) -> Result<ExitCode, CliError> {
    let config = WlmConfig::load(config_path)?;
    let driver = Drivers::load(token, &config.drivers)?;

    let states = driver.get_states(
        &SshConnector,
        config.workdir.as_deref(),
        &config.credentials,
        names,
    );
    print_json(&states)?;

    // an empty map means the query itself failed
    Ok(if states.is_empty() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn script(config_path: &Path, job_path: &Path) -> Result<ExitCode, CliError> {
    let (job, token) = load_job(job_path)?;
    let driver = Drivers::load(&token, &DriversConfig::load_or_default(config_path)?)?;

    match driver.build_container_script(&job.name, &job.settings) {
        Some(script) => {
            print!("{script}");

            Ok(ExitCode::SUCCESS)
        }
        None => Ok(ExitCode::FAILURE),
    }
}
