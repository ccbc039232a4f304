//! Single-test execution on a simulator runner.
//!
//! A [`TestExecutor`] dispatches exactly one test per call to
//! `xcodebuild test-without-building`, follows its output through an
//! [`OutputParser`], and turns whatever happens into exactly one
//! [`TestCaseResult`]:
//!
//! ```text
//! Idle → Dispatched → Running → {Passed, Failed, Crashed, TimedOut, Errored} → Reported
//! ```
//!
//! # Idle Watchdog
//!
//! When no output line arrives for `idle_timeout`, the app under test is
//! terminated on the runner so the hang surfaces as a failure reported by
//! the tool. If the stream stays silent for another `idle_timeout`, the
//! command itself is killed through the channel.
//!
//! # Fabricated Results
//!
//! A process that exits without reporting the test yields a failed result
//! whose `started_at` equals its `ended_at`. The preview callback never
//! sees those.

pub mod parser;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelError, Command, OutputLine};
use crate::config::{Config, DriverConfig};
use crate::inventory::TestCase;
use crate::registry::{Registry, Runner};

pub use parser::{OutputEvent, OutputParser, XcodebuildParser};

/// Final status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Terminal state an attempt ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Passed,
    Failed,
    Crashed,
    TimedOut,
    Errored,
    NotExecuted,
}

impl TerminalReason {
    pub fn status(self) -> TestStatus {
        match self {
            TerminalReason::Passed => TestStatus::Passed,
            _ => TestStatus::Failed,
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminalReason::Passed => "passed",
            TerminalReason::Failed => "failed",
            TerminalReason::Crashed => "crashed",
            TerminalReason::TimedOut => "timed out",
            TerminalReason::Errored => "errored",
            TerminalReason::NotExecuted => "not executed",
        };
        f.write_str(s)
    }
}

/// States of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Dispatched,
    Running,
    Passed,
    Failed,
    Crashed,
    TimedOut,
    Errored,
    Reported,
}

impl From<TerminalReason> for RunState {
    fn from(reason: TerminalReason) -> Self {
        match reason {
            TerminalReason::Passed => RunState::Passed,
            TerminalReason::Failed | TerminalReason::NotExecuted => RunState::Failed,
            TerminalReason::Crashed => RunState::Crashed,
            TerminalReason::TimedOut => RunState::TimedOut,
            TerminalReason::Errored => RunState::Errored,
        }
    }
}

/// Result of one execution attempt of a test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    #[serde(flatten)]
    pub test: TestCase,
    pub node: String,
    pub runner_id: Option<String>,
    pub runner_name: Option<String>,
    /// Result bundle location, local when downloaded.
    pub xc_result_path: Option<String>,
    pub status: TestStatus,
    pub reason: TerminalReason,
    /// 1-based counted attempt number.
    pub attempt: usize,
    /// Failure of the transport or the runner rather than the test.
    pub infra: bool,
    /// Duration reported by the tool, in seconds.
    pub reported_duration: Option<f64>,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TestCaseResult {
    /// A test that never reached a runner.
    pub fn not_executed(
        test: &TestCase,
        node: impl Into<String>,
        attempt: usize,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            test: test.clone(),
            node: node.into(),
            runner_id: None,
            runner_name: None,
            xc_result_path: None,
            status: TestStatus::Failed,
            reason: TerminalReason::NotExecuted,
            attempt,
            infra: false,
            reported_duration: None,
            message: Some(message.into()),
            started_at: now,
            ended_at: now,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }

    /// Wall-clock duration between start and end.
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Node-level condition detected while running a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeFault {
    /// The node's disk is full; nothing more can run there.
    StorageExhausted(String),
    /// The node rejected our credentials.
    Unreachable(String),
}

/// What a single dispatch produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: TestCaseResult,
    pub fault: Option<NodeFault>,
    /// Terminal state reached before reporting.
    pub state: RunState,
}

/// Fires once the tool reports the test's verdict.
pub type PreviewCallback<'a> = Arc<dyn Fn(&TestCaseResult) + Send + Sync + 'a>;

/// Receives every output line together with the runner name.
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// Session-wide settings of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub driver: DriverConfig,
    pub idle_timeout: Duration,
    pub allowance_secs: Option<u64>,
    /// Local directory receiving result bundles.
    pub local_results_dir: PathBuf,
    pub download_result_bundles: bool,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            driver: config.driver.clone(),
            idle_timeout: config.simfleet.idle_timeout(),
            allowance_secs: config.simfleet.execution_time_allowance_secs,
            local_results_dir: config.report.output_dir.join("xcresults"),
            download_result_bundles: config.report.download_result_bundles,
        }
    }

    fn results_dir(&self, remote: bool) -> String {
        if remote {
            format!("{}/results", self.driver.remote_dir.trim_end_matches('/'))
        } else {
            self.local_results_dir.to_string_lossy().to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watchdog {
    Armed,
    AppTerminated,
    CommandTerminated,
}

/// Runs single tests on runners.
pub struct TestExecutor<'a> {
    registry: &'a Registry,
    settings: &'a ExecutorSettings,
    parser: Box<dyn OutputParser>,
    preview: Option<PreviewCallback<'a>>,
    output: Option<OutputCallback>,
}

impl<'a> TestExecutor<'a> {
    pub fn new(registry: &'a Registry, settings: &'a ExecutorSettings) -> Self {
        Self {
            registry,
            settings,
            parser: Box::new(XcodebuildParser::new()),
            preview: None,
            output: None,
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn OutputParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_preview(mut self, callback: PreviewCallback<'a>) -> Self {
        self.preview = Some(callback);
        self
    }

    pub fn with_output(mut self, callback: OutputCallback) -> Self {
        self.output = Some(callback);
        self
    }

    /// The `xcodebuild` invocation running `test` on `runner`.
    pub fn command(&self, test: &TestCase, runner: &Runner, bundle: &str, remote: bool) -> Command {
        let driver = &self.settings.driver;
        let mut cmd = Command::new("xcodebuild")
            .arg("test-without-building")
            .arg("-xctestrun")
            .arg(driver.xctestrun_on(remote))
            .arg("-destination")
            .arg(format!("id={}", runner.udid))
            .arg(format!(
                "-only-testing:{}/{}/{}",
                driver.target, test.suite, test.name
            ))
            .arg("-resultBundlePath")
            .arg(bundle);

        if let Some(language) = &runner.profile.language {
            cmd = cmd.arg("-testLanguage").arg(language);
        }
        if let Some(locale) = &runner.profile.locale {
            cmd = cmd.arg("-testRegion").arg(locale);
        }
        cmd = cmd.arg("-parallel-testing-enabled").arg("NO");
        if let Some(secs) = self.settings.allowance_secs {
            cmd = cmd
                .arg("-test-timeouts-enabled")
                .arg("YES")
                .arg("-maximum-test-execution-time-allowance")
                .arg(secs.to_string());
        }
        cmd = cmd.args(&driver.extra_args);

        let mut env: Vec<_> = driver.env.iter().collect();
        env.sort();
        for (key, value) in env {
            cmd = cmd.env(key, value);
        }
        cmd
    }

    fn is_remote(&self, runner: &Runner) -> bool {
        self.registry
            .node(&runner.node)
            .map(|n| !n.is_local())
            .unwrap_or(false)
    }

    /// Runs one attempt of `test` on `runner`.
    ///
    /// Always yields a result; failures of the channel become `errored`
    /// infrastructure results.
    pub async fn run(
        &self,
        test: &TestCase,
        attempt: usize,
        runner: &Runner,
        channel: &dyn Channel,
    ) -> RunOutcome {
        let remote = self.is_remote(runner);
        let bundle_name = format!("{}-{}-{}.xcresult", test.suite, test.name, Uuid::new_v4());
        let bundle = format!("{}/{}", self.settings.results_dir(remote), bundle_name);
        let cmd = self.command(test, runner, &bundle, remote);

        let mut run = Run::new(test, attempt, runner);
        run.transition(RunState::Dispatched);
        info!("Running {} on {} (attempt {})", test, runner.name, attempt);

        let mut stream = match channel.exec_stream(&cmd).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not start {} on {}: {}", test, runner.name, e);
                let fault = e.is_auth().then(|| NodeFault::Unreachable(e.to_string()));
                let result = run.fabricate(TerminalReason::Errored, true, e.to_string());
                return run.finish(result, fault);
            }
        };

        let idle = self.settings.idle_timeout;
        let mut watchdog = Watchdog::Armed;
        let mut exit_code: Option<i32> = None;
        let mut stderr = String::new();

        loop {
            let line = match tokio::time::timeout(idle, stream.next()).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) if watchdog == Watchdog::CommandTerminated => {
                    error!(
                        "{} on {} did not exit after being killed",
                        test, runner.name
                    );
                    break;
                }
                Err(_) => {
                    watchdog = self.on_idle(watchdog, test, runner, channel).await;
                    continue;
                }
            };

            if let Some(callback) = &self.output {
                callback(&runner.name, &line);
            }

            let text = match &line {
                OutputLine::Stdout(s) => s,
                OutputLine::Stderr(s) => {
                    stderr.push_str(s);
                    stderr.push('\n');
                    s
                }
                OutputLine::ExitCode(code) => {
                    exit_code = Some(*code);
                    continue;
                }
            };

            let Some(event) = self.parser.parse(text) else {
                continue;
            };
            match event {
                OutputEvent::Started { suite, name } if run.is_test(&suite, &name) => {
                    run.started_at = Some(Utc::now());
                    run.transition(RunState::Running);
                }
                OutputEvent::Passed {
                    suite,
                    name,
                    duration,
                } if run.is_test(&suite, &name) && run.terminal.is_none() => {
                    run.report(TerminalReason::Passed, duration, self.preview.as_ref());
                }
                OutputEvent::Failed {
                    suite,
                    name,
                    duration,
                } if run.is_test(&suite, &name) && run.terminal.is_none() => {
                    let reason = if run.timed_out || watchdog != Watchdog::Armed {
                        TerminalReason::TimedOut
                    } else if run.crash.is_some() {
                        TerminalReason::Crashed
                    } else {
                        TerminalReason::Failed
                    };
                    run.report(reason, duration, self.preview.as_ref());
                }
                OutputEvent::Crashed(message) => {
                    debug!("{} on {}: {}", test, runner.name, message);
                    run.crash.get_or_insert(message);
                }
                OutputEvent::AllowanceExceeded(message) => {
                    run.timed_out = true;
                    run.message.get_or_insert(message);
                }
                OutputEvent::FailureMessage(message) => {
                    run.message.get_or_insert(message);
                }
                OutputEvent::StorageExhausted(message) => {
                    if run.storage.is_none() {
                        error!("Node {} is out of disk space: {}", runner.node, message);
                        run.storage = Some(message);
                        channel.terminate();
                    }
                }
                _ => {}
            }
        }

        let mut fault = run.storage.clone().map(NodeFault::StorageExhausted);

        let result = match run.terminal.take() {
            Some(mut result) => {
                if result.message.is_none() {
                    result.message = run.message.clone();
                }
                result.xc_result_path = self.collect_bundle(channel, &bundle, &bundle_name, remote).await;
                result
            }
            None => {
                let classified = exit_code.and_then(|code| channel.classify_exit(code, &stderr));
                if let Some(message) = &run.storage {
                    run.fabricate(TerminalReason::Errored, true, message.clone())
                } else if watchdog != Watchdog::Armed || run.timed_out {
                    let message = run.message.clone().unwrap_or_else(|| {
                        format!("no output for {}s", idle.as_secs())
                    });
                    run.fabricate(TerminalReason::TimedOut, false, message)
                } else if let Some(err) = classified {
                    if err.is_auth() {
                        fault = Some(NodeFault::Unreachable(err.to_string()));
                    }
                    run.fabricate(TerminalReason::Errored, true, err.to_string())
                } else if let Some(crash) = run.crash.clone() {
                    run.fabricate(TerminalReason::Crashed, false, crash)
                } else {
                    let message = run.message.clone().unwrap_or_else(|| {
                        format!(
                            "xcodebuild exited with code {} before reporting a result",
                            exit_code.unwrap_or(-1)
                        )
                    });
                    run.fabricate(TerminalReason::Failed, false, message)
                }
            }
        };

        run.finish(result, fault)
    }

    async fn on_idle(
        &self,
        watchdog: Watchdog,
        test: &TestCase,
        runner: &Runner,
        channel: &dyn Channel,
    ) -> Watchdog {
        let secs = self.settings.idle_timeout.as_secs();
        match (watchdog, &self.settings.driver.bundle_id) {
            (Watchdog::Armed, Some(bundle_id)) => {
                warn!(
                    "{} on {} silent for {}s; terminating {}",
                    test, runner.name, secs, bundle_id
                );
                if let Err(e) = self.registry.terminate_app(runner, channel, bundle_id).await {
                    warn!("Could not terminate {} on {}: {}", bundle_id, runner.name, e);
                }
                Watchdog::AppTerminated
            }
            _ => {
                warn!(
                    "{} on {} still silent after {}s; killing xcodebuild",
                    test, runner.name, secs
                );
                channel.terminate();
                Watchdog::CommandTerminated
            }
        }
    }

    /// Location of the result bundle, downloading it from remote nodes when configured.
    async fn collect_bundle(
        &self,
        channel: &dyn Channel,
        bundle: &str,
        bundle_name: &str,
        remote: bool,
    ) -> Option<String> {
        if !remote || !self.settings.download_result_bundles {
            return Some(bundle.to_string());
        }

        let local = self.settings.local_results_dir.join(bundle_name);
        let downloaded: Result<(), ChannelError> = async {
            if channel.file_exists(bundle).await? {
                channel.download(bundle, &local).await?;
            }
            Ok(())
        }
        .await;

        match downloaded {
            Ok(()) => Some(local.to_string_lossy().to_string()),
            Err(e) => {
                warn!("Could not download {} from {}: {}", bundle, channel.node(), e);
                Some(bundle.to_string())
            }
        }
    }
}

/// Bookkeeping of a single dispatch.
struct Run<'r> {
    test: &'r TestCase,
    attempt: usize,
    runner: &'r Runner,
    state: RunState,
    dispatched_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    terminal: Option<TestCaseResult>,
    crash: Option<String>,
    storage: Option<String>,
    message: Option<String>,
    timed_out: bool,
}

impl<'r> Run<'r> {
    fn new(test: &'r TestCase, attempt: usize, runner: &'r Runner) -> Self {
        Self {
            test,
            attempt,
            runner,
            state: RunState::Idle,
            dispatched_at: Utc::now(),
            started_at: None,
            terminal: None,
            crash: None,
            storage: None,
            message: None,
            timed_out: false,
        }
    }

    fn transition(&mut self, to: RunState) {
        debug!(
            "{} on {}: {:?} -> {:?}",
            self.test, self.runner.name, self.state, to
        );
        self.state = to;
    }

    fn is_test(&self, suite: &str, name: &str) -> bool {
        self.test.suite == suite && self.test.name == name
    }

    fn result(&self, reason: TerminalReason, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> TestCaseResult {
        TestCaseResult {
            test: self.test.clone(),
            node: self.runner.node.clone(),
            runner_id: Some(self.runner.udid.clone()),
            runner_name: Some(self.runner.name.clone()),
            xc_result_path: None,
            status: reason.status(),
            reason,
            attempt: self.attempt,
            infra: false,
            reported_duration: None,
            message: None,
            started_at,
            ended_at,
        }
    }

    /// Records the verdict reported by the tool.
    fn report(&mut self, reason: TerminalReason, duration: Option<f64>, preview: Option<&PreviewCallback<'_>>) {
        let started_at = self.started_at.unwrap_or(self.dispatched_at);
        let mut result = self.result(reason, started_at, Utc::now());
        result.reported_duration = duration;
        if reason != TerminalReason::Passed {
            result.message = self.message.clone().or_else(|| self.crash.clone());
        }
        self.transition(reason.into());
        if let Some(preview) = preview {
            preview(&result);
        }
        self.terminal = Some(result);
    }

    fn fabricate(&mut self, reason: TerminalReason, infra: bool, message: String) -> TestCaseResult {
        let now = Utc::now();
        let mut result = self.result(reason, now, now);
        result.infra = infra;
        result.message = Some(message);
        self.transition(reason.into());
        result
    }

    fn finish(mut self, result: TestCaseResult, fault: Option<NodeFault>) -> RunOutcome {
        let state = self.state;
        self.transition(RunState::Reported);
        RunOutcome {
            result,
            fault,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::channel::mock::{MockChannel, Script, Step};
    use crate::config::{DeviceProfile, NodeConfig};

    const STARTED: &str = "Test Case '-[AppUITests.LoginTests testLogin]' started.";
    const PASSED: &str = "Test Case '-[AppUITests.LoginTests testLogin]' passed (4.250 seconds).";
    const FAILED: &str = "Test Case '-[AppUITests.LoginTests testLogin]' failed (31.000 seconds).";

    fn registry(address: &str) -> Registry {
        let node: NodeConfig = toml::from_str(&format!(
            "name = \"mac\"\naddress = \"{}\"\nuser = \"ci\"",
            address
        ))
        .unwrap();
        Registry::new(vec![node], 2).unwrap()
    }

    fn settings(idle_secs: u64) -> ExecutorSettings {
        ExecutorSettings {
            driver: toml::from_str(
                "xctestrun = \"/build/App.xctestrun\"\n\
                 target = \"AppUITests\"\n\
                 bundle_id = \"com.example.app\"\n\
                 products_dir = \"/build\"\n\
                 remote_dir = \"/tmp/sf\"",
            )
            .unwrap(),
            idle_timeout: Duration::from_secs(idle_secs),
            allowance_secs: None,
            local_results_dir: PathBuf::from("/results/xcresults"),
            download_result_bundles: false,
        }
    }

    fn runner() -> Runner {
        Runner {
            udid: "UDID-1".into(),
            node: "mac".into(),
            name: "iPhone 15 (simfleet 1)".into(),
            profile: DeviceProfile {
                name: "iPhone 15".into(),
                runtime: "17.2".into(),
                platform: "iOS".into(),
                language: Some("de".into()),
                locale: Some("de_DE".into()),
            },
        }
    }

    fn test_case() -> TestCase {
        TestCase::new("LoginTests", "testLogin")
    }

    fn channel(script: impl Fn(&Command) -> Script + Send + Sync + 'static) -> MockChannel {
        MockChannel::new(
            "mac",
            Arc::new(move |_, cmd| {
                if cmd.program == "xcodebuild" {
                    script(cmd)
                } else {
                    Script::ok("")
                }
            }),
        )
    }

    #[test]
    fn test_command_line() {
        let registry = registry("mac.lan");
        let mut settings = settings(300);
        settings.allowance_secs = Some(120);
        let executor = TestExecutor::new(&registry, &settings);

        let cmd = executor.command(&test_case(), &runner(), "/tmp/sf/results/x.xcresult", true);
        let line = cmd.to_shell_string();
        assert!(line.starts_with("xcodebuild test-without-building -xctestrun /tmp/sf/App.xctestrun"));
        assert!(line.contains("-destination id=UDID-1"));
        assert!(line.contains("-only-testing:AppUITests/LoginTests/testLogin"));
        assert!(line.contains("-resultBundlePath /tmp/sf/results/x.xcresult"));
        assert!(line.contains("-testLanguage de -testRegion de_DE"));
        assert!(line.contains("-parallel-testing-enabled NO"));
        assert!(line.contains(
            "-test-timeouts-enabled YES -maximum-test-execution-time-allowance 120"
        ));
    }

    #[tokio::test]
    async fn test_passed_run_fires_preview_before_exit() {
        let registry = registry("mac.lan");
        let settings = settings(300);
        let previews = Arc::new(Mutex::new(Vec::new()));
        let seen = previews.clone();
        let executor = TestExecutor::new(&registry, &settings).with_preview(Arc::new(move |r| {
            seen.lock().unwrap().push(r.reason);
        }));

        let channel = channel(|_| {
            Script::steps(
                vec![
                    Step::Out(STARTED.into()),
                    Step::Out(PASSED.into()),
                    Step::Out("** TEST EXECUTE SUCCEEDED **".into()),
                ],
                0,
            )
        });
        let outcome = executor.run(&test_case(), 1, &runner(), &channel).await;

        assert_eq!(outcome.state, RunState::Passed);
        assert!(outcome.result.passed());
        assert_eq!(outcome.result.reported_duration, Some(4.25));
        assert_eq!(outcome.result.runner_id.as_deref(), Some("UDID-1"));
        assert!(outcome.result.xc_result_path.unwrap().starts_with("/tmp/sf/results/LoginTests-testLogin-"));
        assert!(outcome.fault.is_none());
        assert_eq!(*previews.lock().unwrap(), vec![TerminalReason::Passed]);
    }

    #[tokio::test]
    async fn test_silent_exit_fabricates_failure_without_preview() {
        let registry = registry("mac.lan");
        let settings = settings(300);
        let previews = Arc::new(Mutex::new(0));
        let seen = previews.clone();
        let executor = TestExecutor::new(&registry, &settings)
            .with_preview(Arc::new(move |_| *seen.lock().unwrap() += 1));

        let channel = channel(|_| Script::exit(65));
        let outcome = executor.run(&test_case(), 1, &runner(), &channel).await;

        assert_eq!(outcome.result.status, TestStatus::Failed);
        assert_eq!(outcome.result.reason, TerminalReason::Failed);
        assert!(!outcome.result.infra);
        assert_eq!(outcome.result.started_at, outcome.result.ended_at);
        assert_eq!(*previews.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_terminates_hung_app() {
        let registry = registry("mac.lan");
        let settings = settings(30);
        let executor = TestExecutor::new(&registry, &settings);

        let channel = channel(|_| {
            Script::steps(
                vec![
                    Step::Out(STARTED.into()),
                    Step::UntilAppTerminated,
                    Step::Out(FAILED.into()),
                ],
                65,
            )
        });
        let outcome = executor.run(&test_case(), 1, &runner(), &channel).await;

        assert!(
            channel
                .calls()
                .iter()
                .any(|c| c == "xcrun simctl terminate UDID-1 com.example.app")
        );
        assert_eq!(outcome.result.status, TestStatus::Failed);
        assert_eq!(outcome.result.reason, TerminalReason::TimedOut);
        assert!(outcome.result.ended_at >= outcome.result.started_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_kills_command_after_second_silence() {
        let registry = registry("mac.lan");
        let settings = settings(30);
        let executor = TestExecutor::new(&registry, &settings);

        let channel = channel(|_| {
            Script::steps(
                vec![
                    Step::Out(STARTED.into()),
                    Step::Sleep(Duration::from_secs(3600)),
                ],
                0,
            )
        });
        let outcome = executor.run(&test_case(), 1, &runner(), &channel).await;

        assert_eq!(outcome.result.reason, TerminalReason::TimedOut);
        assert_eq!(outcome.result.started_at, outcome.result.ended_at);
    }

    #[tokio::test]
    async fn test_storage_exhaustion_is_a_node_fault() {
        let registry = registry("mac.lan");
        let settings = settings(300);
        let executor = TestExecutor::new(&registry, &settings);

        let channel = channel(|_| {
            Script::steps(
                vec![
                    Step::Out(STARTED.into()),
                    Step::Err("Error Domain=NSPOSIXErrorDomain Code=28 \"No space left on device\"".into()),
                ],
                70,
            )
        });
        let outcome = executor.run(&test_case(), 1, &runner(), &channel).await;

        assert!(matches!(outcome.fault, Some(NodeFault::StorageExhausted(_))));
        assert_eq!(outcome.result.reason, TerminalReason::Errored);
        assert!(outcome.result.infra);
    }

    #[tokio::test]
    async fn test_transport_failure_is_infra() {
        let registry = registry("mac.lan");
        let settings = settings(300);
        let executor = TestExecutor::new(&registry, &settings);

        let channel = channel(|_| {
            Script::steps(
                vec![Step::Err("ssh: connect to host mac.lan port 22: Connection refused".into())],
                255,
            )
        });
        let outcome = executor.run(&test_case(), 1, &runner(), &channel).await;

        assert_eq!(outcome.result.reason, TerminalReason::Errored);
        assert!(outcome.result.infra);
        assert!(outcome.fault.is_none());
    }

    #[tokio::test]
    async fn test_crash_then_failure_is_crashed() {
        let registry = registry("mac.lan");
        let settings = settings(300);
        let executor = TestExecutor::new(&registry, &settings);

        let channel = channel(|_| {
            Script::steps(
                vec![
                    Step::Out(STARTED.into()),
                    Step::Out("App (4242) crashed with signal SEGV".into()),
                    Step::Out(FAILED.into()),
                ],
                65,
            )
        });
        let outcome = executor.run(&test_case(), 2, &runner(), &channel).await;

        assert_eq!(outcome.result.reason, TerminalReason::Crashed);
        assert_eq!(outcome.result.attempt, 2);
        assert!(outcome.result.message.unwrap().contains("crashed with signal"));
    }

    #[tokio::test]
    async fn test_remote_bundle_downloaded() {
        let registry = registry("mac.lan");
        let mut settings = settings(300);
        settings.download_result_bundles = true;
        let executor = TestExecutor::new(&registry, &settings);

        let channel = channel(|_| Script::steps(vec![Step::Out(PASSED.into())], 0));
        let outcome = executor.run(&test_case(), 1, &runner(), &channel).await;

        let path = outcome.result.xc_result_path.unwrap();
        assert!(path.starts_with("/results/xcresults/LoginTests-testLogin-"));
        assert!(channel.calls().iter().any(|c| c.starts_with("download /tmp/sf/results/")));
    }
}
