#![cfg(unix)]

use hpc_wlm::{
    drivers::{Drivers, WorkloadManager},
    transport::{CommandOutput, Transport, TransportError},
    JobState,
};
use std::{
    fs,
    path::Path,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tempfile::TempDir;

/// runs every command with the local `sh` inside `workdir`
struct LocalTransport<'a> {
    workdir: &'a Path,
}

impl Transport for LocalTransport<'_> {
    fn user(&self) -> &str {
        "hpcuser"
    }

    fn execute(
        &mut self,
        command: &str,
        _workdir: Option<&str>,
        _wait_result: bool,
    ) -> Result<CommandOutput, TransportError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.workdir)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn close(&mut self) {}
}

fn available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn running(pattern: &str) -> bool {
    Command::new("pgrep")
        .args(["-f", pattern])
        .stdout(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);

    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(50));
    }
}

fn submit(driver: &Drivers, transport: &mut LocalTransport, name: &str, command: &str) {
    let settings = serde_yaml::from_str(&format!("{{type: SHELL, command: '{command}'}}")).unwrap();
    let call = driver.build_job_submission_call(name, &settings).unwrap().call;

    assert_eq!(transport.execute(&call, None, false).unwrap().exit_code, 0);
}

fn states(driver: &Drivers, transport: &mut LocalTransport, names: &[&str]) -> Vec<JobState> {
    let output = transport
        .execute(&driver.states_query("hpcuser"), None, true)
        .unwrap();
    let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    let parsed = driver.parse_states(&output.stdout, &names);

    names.iter().map(|name| parsed[name]).collect()
}

#[test]
fn cancellation_kills_only_the_named_job() {
    if !available("setsid") || !available("pgrep") {
        eprintln!("setsid or pgrep missing, skipping");
        return;
    }

    let workdir = TempDir::new().unwrap();
    let driver = Drivers::factory("SHELL").unwrap();
    let mut transport = LocalTransport {
        workdir: workdir.path(),
    };

    submit(&driver, &mut transport, "job1", "sleep 4711");
    submit(&driver, &mut transport, "job10", "sleep 5711");
    wait_until("jobs to start", || {
        running("^sleep 4711$") && running("^sleep 5711$")
    });

    let call = driver
        .build_job_cancellation_call("job1", &mut transport)
        .unwrap();
    assert_eq!(transport.execute(&call, None, true).unwrap().exit_code, 0);

    wait_until("job1 to die", || !running("sleep 4711"));
    assert!(running("^sleep 5711$"), "job10 was killed along with job1");
    assert_eq!(
        states(&driver, &mut transport, &["job1", "job10"]),
        vec![JobState::Cancelled, JobState::Pending]
    );

    // a second cancellation finds nothing and succeeds without touching the log
    let log = fs::read_to_string(workdir.path().join("monitor.data")).unwrap();
    assert_eq!(transport.execute(&call, None, true).unwrap().exit_code, 0);
    assert_eq!(
        fs::read_to_string(workdir.path().join("monitor.data")).unwrap(),
        log
    );

    let call = driver
        .build_job_cancellation_call("job10", &mut transport)
        .unwrap();
    assert_eq!(transport.execute(&call, None, true).unwrap().exit_code, 0);
    wait_until("job10 to die", || !running("sleep 5711"));
    assert_eq!(
        states(&driver, &mut transport, &["job1", "job10"]),
        vec![JobState::Cancelled, JobState::Cancelled]
    );
}

#[test]
fn finished_jobs_record_their_exit_code() {
    if !available("setsid") {
        eprintln!("setsid missing, skipping");
        return;
    }

    let workdir = TempDir::new().unwrap();
    let driver = Drivers::factory("SHELL").unwrap();
    let mut transport = LocalTransport {
        workdir: workdir.path(),
    };

    submit(&driver, &mut transport, "ok", "echo hello");
    submit(&driver, &mut transport, "broken", "false");
    wait_until("both jobs to finish", || {
        fs::read_to_string(workdir.path().join("monitor.data"))
            .map(|log| log.lines().count() == 2)
            .unwrap_or(false)
    });

    assert_eq!(
        states(&driver, &mut transport, &["ok", "broken"]),
        vec![JobState::Completed, JobState::Failed]
    );

    wait_until("job output", || {
        fs::read_to_string(workdir.path().join("ok.out"))
            .map(|output| output.contains("hello"))
            .unwrap_or(false)
    });
}
