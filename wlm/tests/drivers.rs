use hpc_wlm::{
    drivers::{spark::SparkDriver, Drivers, WorkloadManager},
    transport::{CommandOutput, Connector, Credentials, Transport, TransportError},
    DriversConfig, JobState, ParsedStateMap,
};
use std::{
    sync::{Arc, Mutex},
    thread,
};

const FRAMEWORKS: &str = include_str!("fixtures/frameworks.json");

/// what a mock session observed
#[derive(Debug, Default)]
struct Record {
    commands: Vec<(String, Option<String>, bool)>,
    opened: usize,
    closed: usize,
}

/// Canned reply for every command, `None` makes `execute` fail
#[derive(Clone)]
struct MockTransport {
    reply: Option<CommandOutput>,
    record: Arc<Mutex<Record>>,
}

impl Transport for MockTransport {
    fn user(&self) -> &str {
        "hpcuser"
    }

    fn execute(
        &mut self,
        command: &str,
        workdir: Option<&str>,
        wait_result: bool,
    ) -> Result<CommandOutput, TransportError> {
        self.record.lock().unwrap().commands.push((
            command.to_string(),
            workdir.map(str::to_string),
            wait_result,
        ));

        self.reply.clone().ok_or(TransportError::Timeout)
    }

    fn close(&mut self) {
        self.record.lock().unwrap().closed += 1;
    }
}

struct MockConnector {
    reply: Option<CommandOutput>,
    refuse: bool,
    record: Arc<Mutex<Record>>,
}

impl MockConnector {
    fn replying(exit_code: i32, stdout: &str) -> Self {
        Self {
            reply: Some(CommandOutput {
                stdout: stdout.to_string(),
                exit_code,
            }),
            refuse: false,
            record: Arc::default(),
        }
    }

    fn failing() -> Self {
        Self {
            reply: None,
            refuse: false,
            record: Arc::default(),
        }
    }

    fn refusing() -> Self {
        Self {
            reply: None,
            refuse: true,
            record: Arc::default(),
        }
    }

    fn transport(&self) -> MockTransport {
        MockTransport {
            reply: self.reply.clone(),
            record: self.record.clone(),
        }
    }

    fn commands(&self) -> Vec<(String, Option<String>, bool)> {
        self.record.lock().unwrap().commands.clone()
    }

    fn sessions(&self) -> (usize, usize) {
        let record = self.record.lock().unwrap();

        (record.opened, record.closed)
    }
}

impl Connector for MockConnector {
    fn connect(&self, _credentials: &Credentials) -> Result<Box<dyn Transport>, TransportError> {
        if self.refuse {
            return Err(TransportError::Connection("permission denied".to_string()));
        }

        self.record.lock().unwrap().opened += 1;

        Ok(Box::new(self.transport()))
    }
}

fn credentials() -> Credentials {
    Credentials::new("login.cluster", "hpcuser")
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[test]
fn shell_states_from_monitor_log() {
    let driver = Drivers::factory("SHELL").unwrap();
    let connector = MockConnector::replying(0, "job1,0\njob2,130\njob4,42\n");

    let states = driver.get_states(
        &connector,
        Some("/scratch/run"),
        &credentials(),
        &names(&["job1", "job2", "job3", "job4"]),
    );

    assert_eq!(
        states,
        ParsedStateMap::from([
            ("job1".to_string(), JobState::Completed),
            ("job2".to_string(), JobState::Cancelled),
            ("job3".to_string(), JobState::Pending),
            ("job4".to_string(), JobState::Failed),
        ])
    );
    assert_eq!(
        connector.commands(),
        vec![(
            "test ! -e monitor.data || cat monitor.data".to_string(),
            Some("/scratch/run".to_string()),
            true
        )]
    );
    assert_eq!(connector.sessions(), (1, 1));
}

#[test]
fn failed_queries_yield_no_states() {
    let driver = Drivers::factory("SHELL").unwrap();
    let job_names = names(&["job1"]);

    let non_zero = MockConnector::replying(1, "job1,0\n");
    assert!(driver
        .get_states(&non_zero, None, &credentials(), &job_names)
        .is_empty());
    assert_eq!(non_zero.sessions(), (1, 1));

    let broken = MockConnector::failing();
    assert!(driver
        .get_states(&broken, None, &credentials(), &job_names)
        .is_empty());
    assert_eq!(broken.sessions(), (1, 1));

    let refused = MockConnector::refusing();
    assert!(driver
        .get_states(&refused, None, &credentials(), &job_names)
        .is_empty());
    assert_eq!(refused.sessions(), (0, 0));
}

#[test]
fn spark_states_for_every_requested_job() {
    let driver = Drivers::factory("SPARK").unwrap();
    let connector = MockConnector::replying(0, FRAMEWORKS);

    let states = driver.get_states(
        &connector,
        None,
        &credentials(),
        &names(&["SA_HPDA_HLRS849j32", "SA_HPDA_HLRS849j34", "SA_HPDA_done", "Simple"]),
    );

    assert_eq!(
        states,
        ParsedStateMap::from([
            ("SA_HPDA_HLRS849j32".to_string(), JobState::Running),
            ("SA_HPDA_HLRS849j34".to_string(), JobState::Pending),
            ("SA_HPDA_done".to_string(), JobState::Completed),
            ("Simple".to_string(), JobState::Failed),
        ])
    );

    let commands = connector.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(
        commands[0].0,
        "curl -s http://hpcuser:`cat /security/secrets/hpcuser.mesos`@localhost:5050/frameworks"
    );
    assert_eq!(connector.sessions(), (1, 1));
}

#[test]
fn spark_states_with_garbage_output() {
    let driver = Drivers::factory("SPARK").unwrap();
    let connector = MockConnector::replying(0, "curl: (7) Failed to connect");

    assert!(driver
        .get_states(&connector, None, &credentials(), &names(&["J"]))
        .is_empty());
}

#[test]
fn spark_cancellation_queries_running_frameworks() {
    let driver = Drivers::factory("SPARK").unwrap();
    let connector = MockConnector::replying(
        0,
        r#"{"frameworks": [
            {"id": "a", "name": "J", "tasks": [{"state": "TASK_RUNNING"}]},
            {"id": "b", "name": "J", "tasks": []},
            {"id": "c", "name": "K", "tasks": []}
        ], "completed_frameworks": [{"id": "d", "name": "J", "completed_tasks": []}]}"#,
    );
    let mut transport = connector.transport();

    let call = driver
        .build_job_cancellation_call("J", &mut transport)
        .unwrap();

    assert_eq!(call.matches("/teardown").count(), 2);
    assert!(call.contains("frameworkId=a; "));
    assert!(call.contains("frameworkId=b; "));
    assert!(!call.contains("frameworkId=c"));
    assert!(!call.contains("frameworkId=d"));

    let commands = connector.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].0.ends_with("@localhost:5050/frameworks"));
}

#[test]
fn spark_cancellation_of_finished_job_is_a_no_op() {
    let driver = Drivers::factory("SPARK").unwrap();

    let finished = MockConnector::replying(0, FRAMEWORKS);
    assert_eq!(
        driver.build_job_cancellation_call("SA_HPDA_done", &mut finished.transport()),
        None
    );

    let non_zero = MockConnector::replying(7, "");
    assert_eq!(
        driver.build_job_cancellation_call("J", &mut non_zero.transport()),
        None
    );

    let broken = MockConnector::failing();
    assert_eq!(
        driver.build_job_cancellation_call("J", &mut broken.transport()),
        None
    );
}

#[test]
fn shell_cancellation_targets_the_process_group() {
    let driver = Drivers::factory("SHELL").unwrap();
    let connector = MockConnector::replying(0, "");

    let call = driver
        .build_job_cancellation_call("job1", &mut connector.transport())
        .unwrap();

    assert!(call.contains("pgrep -f 'echo job1,\\$\\?'"));
    assert!(call.contains("kill -s TERM -\"$pid\""));
    assert!(call.ends_with("echo job1,130 >> monitor.data"));
    // no remote lookup needed
    assert!(connector.commands().is_empty());
}

#[test]
fn drivers_are_shared_between_threads() {
    let driver = Drivers::load("SPARK", &DriversConfig::default()).unwrap();
    let connector = MockConnector::replying(0, FRAMEWORKS);
    let job_names = names(&["SA_HPDA_HLRS849j32"]);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| driver.get_states(&connector, None, &credentials(), &job_names)))
            .collect();

        for handle in handles {
            assert_eq!(
                handle.join().unwrap()["SA_HPDA_HLRS849j32"],
                JobState::Running
            );
        }
    });

    assert_eq!(connector.sessions(), (4, 4));
}

#[test]
fn concrete_driver_matches_enum_dispatch() {
    let concrete = SparkDriver::load(&DriversConfig::default().spark);
    let dispatched = Drivers::factory("SPARK").unwrap();
    let settings = serde_yaml::from_str("{type: SPARK, application: app.jar}").unwrap();

    assert_eq!(
        concrete.build_job_submission_call("job", &settings),
        dispatched.build_job_submission_call("job", &settings)
    );
    assert_eq!(concrete.states_query("u"), dispatched.states_query("u"));
}
