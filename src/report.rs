//! Session reporting.
//!
//! Reporters observe a session as it runs and receive the final
//! [`SessionReport`] when it ends. Three are built in:
//!
//! - [`ConsoleReporter`]: progress bar and summary on the terminal
//! - [`JsonReporter`]: the full session document (`report.json`)
//! - [`JUnitReporter`]: `junit.xml` for CI dashboards

pub mod json;
pub mod junit;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::Snapshot;
use crate::collaborator::SessionSummary;
use crate::config::{DeviceProfile, RunMode};
use crate::executor::{TerminalReason, TestCaseResult};
use crate::inventory::TestCase;
use crate::registry::Runner;
use crate::retry::Verdict;

pub use json::JsonReporter;
pub use junit::JUnitReporter;

/// Everything a finished session produced.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub mode: RunMode,
    pub device: DeviceProfile,
    pub output_dir: PathBuf,
    /// Nodes taken out of the session, with the reason.
    pub degraded_nodes: BTreeMap<String, String>,
    pub exit_code: i32,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

impl SessionReport {
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Summary handed to the teardown collaborator.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            total: self.snapshot.total(),
            passed: self.snapshot.passed,
            failed: self.snapshot.failed,
            flaky: self.snapshot.flaky,
            not_run: self.snapshot.not_executed,
            exit_code: self.exit_code,
            output_dir: self.output_dir.clone(),
        }
    }
}

/// A test reporter receives events during a session.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the filtered, ordered inventory is known.
    async fn on_discovery_complete(&self, tests: &[TestCase]);

    /// Called when a test is dispatched to a runner.
    async fn on_test_start(&self, test: &TestCase, runner: &Runner);

    /// Called as soon as the tool reports a verdict, before it exits.
    fn on_test_preview(&self, _result: &TestCaseResult) {}

    /// Called for every counted attempt; `retrying` is set when another
    /// attempt of the same test follows.
    async fn on_test_complete(&self, result: &TestCaseResult, retrying: bool);

    /// Called when the session has ended.
    async fn on_run_complete(&self, report: &SessionReport);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_discovery_complete(&self, _tests: &[TestCase]) {}
    async fn on_test_start(&self, _test: &TestCase, _runner: &Runner) {}
    async fn on_test_complete(&self, _result: &TestCaseResult, _retrying: bool) {}
    async fn on_run_complete(&self, _report: &SessionReport) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_discovery_complete(&self, tests: &[TestCase]) {
        for reporter in &self.reporters {
            reporter.on_discovery_complete(tests).await;
        }
    }

    async fn on_test_start(&self, test: &TestCase, runner: &Runner) {
        for reporter in &self.reporters {
            reporter.on_test_start(test, runner).await;
        }
    }

    fn on_test_preview(&self, result: &TestCaseResult) {
        for reporter in &self.reporters {
            reporter.on_test_preview(result);
        }
    }

    async fn on_test_complete(&self, result: &TestCaseResult, retrying: bool) {
        for reporter in &self.reporters {
            reporter.on_test_complete(result, retrying).await;
        }
    }

    async fn on_run_complete(&self, report: &SessionReport) {
        for reporter in &self.reporters {
            reporter.on_run_complete(report).await;
        }
    }
}

fn reason_label(reason: TerminalReason) -> console::StyledObject<&'static str> {
    match reason {
        TerminalReason::Passed => console::style("PASS").green(),
        TerminalReason::Failed => console::style("FAIL").red(),
        TerminalReason::Crashed => console::style("CRSH").red().bold(),
        TerminalReason::TimedOut => console::style("TIME").red(),
        TerminalReason::Errored => console::style("ERR ").red().bold(),
        TerminalReason::NotExecuted => console::style("SKIP").yellow(),
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_bar(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = progress.as_ref() {
            f(pb);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_discovery_complete(&self, tests: &[TestCase]) {
        println!("Discovered {} tests", tests.len());

        let pb = indicatif::ProgressBar::new(tests.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(pb);
    }

    async fn on_test_start(&self, test: &TestCase, runner: &Runner) {
        if self.verbose {
            self.with_bar(|pb| pb.println(format!("Running: {} on {}", test, runner.name)));
        }
    }

    fn on_test_preview(&self, result: &TestCaseResult) {
        self.with_bar(|pb| {
            pb.set_message(format!("{} {}", reason_label(result.reason), result.test))
        });
    }

    async fn on_test_complete(&self, result: &TestCaseResult, retrying: bool) {
        self.with_bar(|pb| {
            if !retrying {
                pb.inc(1);
            }
            if self.verbose || !result.passed() {
                let suffix = if retrying && !result.passed() {
                    console::style(" (retrying)").dim().to_string()
                } else {
                    String::new()
                };
                pb.println(format!(
                    "{} {} [{}]{}",
                    reason_label(result.reason),
                    result.test,
                    result.runner_name.as_deref().unwrap_or(&result.node),
                    suffix
                ));
            }
        });
    }

    async fn on_run_complete(&self, report: &SessionReport) {
        if let Some(pb) = self.progress.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pb.finish_and_clear();
        }

        let snapshot = &report.snapshot;
        println!();
        println!("Test Results:");
        println!("  Total:   {}", snapshot.total());
        println!("  Passed:  {}", console::style(snapshot.passed).green());
        println!("  Failed:  {}", console::style(snapshot.failed).red());

        if snapshot.not_executed > 0 {
            println!(
                "  Not Run: {}",
                console::style(snapshot.not_executed).red().bold()
            );
        }

        if snapshot.flaky > 0 {
            println!("  Flaky:   {}", console::style(snapshot.flaky).yellow());
        }

        if !snapshot.infra.is_empty() {
            println!("  Infra:   {}", console::style(snapshot.infra.len()).dim());
        }

        println!("  Duration: {:?}", report.duration());

        for (node, reason) in &report.degraded_nodes {
            println!(
                "  {} {}: {}",
                console::style("Degraded").yellow(),
                node,
                reason
            );
        }

        println!();
        match report.exit_code {
            0 => println!("{}", console::style("All tests passed!").green().bold()),
            2 => println!(
                "{}",
                console::style("All tests passed, some only after a retry.")
                    .yellow()
                    .bold()
            ),
            _ => {
                println!("{}", console::style("Some tests failed.").red().bold());
                println!();
                println!("Failed tests:");
                for summary in &snapshot.tests {
                    if summary.verdict.is_passing() {
                        continue;
                    }
                    println!("  - {} ({})", summary.test, verdict_label(summary.verdict));
                    let last = snapshot
                        .results
                        .iter()
                        .rev()
                        .find(|r| r.test == summary.test && !r.passed());
                    if let Some(msg) = last.and_then(|r| r.message.as_deref()) {
                        println!("    {}", console::style(msg).dim());
                    }
                }
            }
        }

        println!();
        println!("Reports written to {}", report.output_dir.display());
    }
}

fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Passed => "passed",
        Verdict::Flaky => "flaky",
        Verdict::Unstable => "unstable",
        Verdict::Failed => "failed",
        Verdict::NotExecuted => "not executed",
    }
}

/// Creates the parent directory of `path` and writes `contents`.
pub(crate) fn write_artifact(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::aggregator::TestSummary;

    pub fn result(suite: &str, name: &str, reason: TerminalReason, attempt: usize) -> TestCaseResult {
        let started_at = Utc::now();
        TestCaseResult {
            test: TestCase::new(suite, name).with_tag("smoke"),
            node: "mac".into(),
            runner_id: Some("UDID-1".into()),
            runner_name: Some("iPhone 15 (simfleet 1)".into()),
            xc_result_path: Some(format!("/tmp/{}-{}.xcresult", suite, name)),
            status: reason.status(),
            reason,
            attempt,
            infra: false,
            reported_duration: Some(1.5),
            message: (reason != TerminalReason::Passed).then(|| "XCTAssertTrue failed <&>".to_string()),
            started_at,
            ended_at: started_at + chrono::Duration::milliseconds(1500),
        }
    }

    pub fn report(results: Vec<TestCaseResult>, tests: Vec<(TestCase, Verdict, usize)>) -> SessionReport {
        let count = |f: fn(Verdict) -> bool| tests.iter().filter(|t| f(t.1)).count();
        let snapshot = Snapshot {
            passed: count(|v| v == Verdict::Passed),
            failed: count(|v| matches!(v, Verdict::Failed | Verdict::Unstable)),
            flaky: count(|v| matches!(v, Verdict::Flaky | Verdict::Unstable)),
            not_executed: count(|v| v == Verdict::NotExecuted),
            tests: tests
                .iter()
                .map(|(test, verdict, attempts)| TestSummary {
                    test: test.clone(),
                    verdict: *verdict,
                    attempts: *attempts,
                })
                .collect(),
            results,
            infra: Vec::new(),
            timings: Vec::new(),
        };
        let now = Utc::now();
        SessionReport {
            session_id: "session".into(),
            started_at: now,
            ended_at: now,
            mode: RunMode::Retry { retries: 2 },
            device: DeviceProfile {
                name: "iPhone 15".into(),
                runtime: "17.2".into(),
                platform: "iOS".into(),
                language: None,
                locale: None,
            },
            output_dir: PathBuf::from("out"),
            degraded_nodes: BTreeMap::new(),
            exit_code: snapshot.exit_code(),
            snapshot,
        }
    }
}
