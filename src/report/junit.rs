//! JUnit XML report generation.
//!
//! One `<testsuite>` per test suite, one `<testcase>` per test. Failed
//! attempts show up as a `<failure>` block listing every failing attempt;
//! tests that only passed after a retry keep their failures in
//! `<system-out>`.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="simfleet" tests="2" failures="1" errors="0" time="12.500">
//!   <testsuite name="LoginTests" tests="2" failures="1" errors="0" skipped="0" time="12.500">
//!     <testcase classname="LoginTests" name="testLogin" time="4.250"/>
//!     <testcase classname="LoginTests" name="testLogout" time="8.250">
//!       <failure message="XCTAssertTrue failed" type="failed">attempt 1 on iPhone 15 (simfleet 1) [mac]: failed: XCTAssertTrue failed</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Reporter, SessionReport, write_artifact};
use crate::aggregator::TestSummary;
use crate::executor::TestCaseResult;
use crate::inventory::TestCase;
use crate::registry::Runner;
use crate::retry::Verdict;

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created automatically.
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuites_name: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuites_name: "simfleet".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.testsuites_name = name.into();
        self
    }

    /// Renders the report as JUnit XML.
    pub fn generate_xml(&self, report: &SessionReport) -> anyhow::Result<String> {
        let snapshot = &report.snapshot;
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        // Suites in first-seen order
        let mut suites: Vec<(&str, Vec<&TestSummary>)> = Vec::new();
        for summary in &snapshot.tests {
            match suites.iter_mut().find(|(name, _)| *name == summary.test.suite) {
                Some((_, tests)) => tests.push(summary),
                None => suites.push((summary.test.suite.as_str(), vec![summary])),
            }
        }

        let total_time: f64 = snapshot.results.iter().map(attempt_secs).sum();
        let failures = snapshot
            .tests
            .iter()
            .filter(|t| matches!(t.verdict, Verdict::Failed | Verdict::Unstable))
            .count();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.testsuites_name.as_str()));
        testsuites.push_attribute(("tests", snapshot.tests.len().to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("errors", snapshot.not_executed.to_string().as_str()));
        testsuites.push_attribute(("time", format!("{:.3}", total_time).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for (suite, tests) in suites {
            let attempts: Vec<Vec<&TestCaseResult>> = tests
                .iter()
                .map(|t| {
                    snapshot
                        .results
                        .iter()
                        .filter(|r| r.test == t.test)
                        .collect()
                })
                .collect();
            let time: f64 = attempts.iter().flatten().map(|r| attempt_secs(r)).sum();
            let failures = tests
                .iter()
                .filter(|t| matches!(t.verdict, Verdict::Failed | Verdict::Unstable))
                .count();
            let errors = tests
                .iter()
                .filter(|t| t.verdict == Verdict::NotExecuted)
                .count();

            let mut testsuite = BytesStart::new("testsuite");
            testsuite.push_attribute(("name", suite));
            testsuite.push_attribute(("tests", tests.len().to_string().as_str()));
            testsuite.push_attribute(("failures", failures.to_string().as_str()));
            testsuite.push_attribute(("errors", errors.to_string().as_str()));
            testsuite.push_attribute(("skipped", "0"));
            testsuite.push_attribute(("time", format!("{:.3}", time).as_str()));
            writer.write_event(Event::Start(testsuite))?;

            for (summary, attempts) in tests.iter().zip(&attempts) {
                write_testcase(&mut writer, summary, attempts)?;
            }

            writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn attempt_secs(result: &TestCaseResult) -> f64 {
    result
        .reported_duration
        .unwrap_or_else(|| result.duration().as_secs_f64())
}

fn describe(result: &TestCaseResult) -> String {
    let mut line = format!(
        "attempt {} on {} [{}]: {}",
        result.attempt,
        result.runner_name.as_deref().unwrap_or("-"),
        result.node,
        result.reason
    );
    if let Some(msg) = &result.message {
        line.push_str(": ");
        line.push_str(msg);
    }
    if let Some(path) = &result.xc_result_path {
        line.push_str(&format!(" ({})", path));
    }
    line
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    summary: &TestSummary,
    attempts: &[&TestCaseResult],
) -> anyhow::Result<()> {
    let time: f64 = attempts.iter().map(|r| attempt_secs(r)).sum();
    let failed: Vec<_> = attempts.iter().filter(|r| !r.passed()).collect();
    let details = failed
        .iter()
        .map(|r| describe(r))
        .collect::<Vec<_>>()
        .join("\n");
    let message = failed
        .last()
        .and_then(|r| r.message.clone())
        .unwrap_or_default();

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", summary.test.suite.as_str()));
    testcase.push_attribute(("name", summary.test.name.as_str()));
    testcase.push_attribute(("time", format!("{:.3}", time).as_str()));

    match summary.verdict {
        Verdict::Passed => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        Verdict::Flaky => {
            writer.write_event(Event::Start(testcase))?;
            writer.write_event(Event::Start(BytesStart::new("system-out")))?;
            let text = sanitize(&format!("flaky, passed after:\n{}", details));
            writer.write_event(Event::Text(BytesText::new(&text)))?;
            writer.write_event(Event::End(BytesEnd::new("system-out")))?;
        }
        Verdict::Failed | Verdict::Unstable => {
            writer.write_event(Event::Start(testcase))?;
            let kind = failed
                .last()
                .map(|r| r.reason.to_string())
                .unwrap_or_else(|| "failed".to_string());
            let mut failure = BytesStart::new("failure");
            failure.push_attribute(("message", sanitize(&message).as_str()));
            failure.push_attribute(("type", kind.as_str()));
            writer.write_event(Event::Start(failure))?;
            writer.write_event(Event::Text(BytesText::new(&sanitize(&details))))?;
            writer.write_event(Event::End(BytesEnd::new("failure")))?;
        }
        Verdict::NotExecuted => {
            writer.write_event(Event::Start(testcase))?;
            let mut error = BytesStart::new("error");
            error.push_attribute(("message", sanitize(&message).as_str()));
            error.push_attribute(("type", "not_executed"));
            writer.write_event(Event::Empty(error))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot carry; escaping is left to the writer.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_discovery_complete(&self, _tests: &[TestCase]) {}

    async fn on_test_start(&self, _test: &TestCase, _runner: &Runner) {}

    async fn on_test_complete(&self, _result: &TestCaseResult, _retrying: bool) {}

    async fn on_run_complete(&self, report: &SessionReport) {
        match self.generate_xml(report) {
            Ok(xml) => {
                if let Err(e) = write_artifact(&self.output_path, xml.as_bytes()) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TerminalReason;
    use crate::report::fixtures;

    fn xml(report: &SessionReport) -> String {
        JUnitReporter::new("junit.xml".into()).generate_xml(report).unwrap()
    }

    #[test]
    fn test_suites_and_failures() {
        let report = fixtures::report(
            vec![
                fixtures::result("LoginTests", "testLogin", TerminalReason::Passed, 1),
                fixtures::result("LoginTests", "testLogout", TerminalReason::Crashed, 1),
                fixtures::result("LoginTests", "testLogout", TerminalReason::Failed, 2),
                fixtures::result("CartTests", "testAdd", TerminalReason::Passed, 1),
            ],
            vec![
                (TestCase::new("LoginTests", "testLogin"), Verdict::Passed, 1),
                (TestCase::new("LoginTests", "testLogout"), Verdict::Failed, 2),
                (TestCase::new("CartTests", "testAdd"), Verdict::Passed, 1),
            ],
        );
        let xml = xml(&report);

        assert!(xml.contains(r#"<testsuites name="simfleet" tests="3" failures="1" errors="0""#));
        assert!(xml.contains(r#"<testsuite name="LoginTests" tests="2" failures="1""#));
        assert!(xml.contains(r#"<testsuite name="CartTests" tests="1" failures="0""#));
        assert!(xml.contains(r#"<testcase classname="LoginTests" name="testLogin" time="1.500"/>"#));
        assert!(xml.contains(r#"type="failed""#));
        assert!(xml.contains("attempt 1 on iPhone 15 (simfleet 1) [mac]: crashed"));
        assert!(xml.contains("attempt 2 on iPhone 15 (simfleet 1) [mac]: failed"));
    }

    #[test]
    fn test_special_characters_escaped_once() {
        let report = fixtures::report(
            vec![fixtures::result("S", "t", TerminalReason::Failed, 1)],
            vec![(TestCase::new("S", "t"), Verdict::Failed, 1)],
        );
        let xml = xml(&report);
        assert!(xml.contains("XCTAssertTrue failed &lt;&amp;&gt;"));
        assert!(!xml.contains("&amp;lt;"));
    }

    #[test]
    fn test_flaky_and_not_executed() {
        let skipped = TestCaseResult::not_executed(&TestCase::new("S", "gone"), "mac", 1, "node out of disk space");
        let report = fixtures::report(
            vec![
                fixtures::result("S", "flaky", TerminalReason::Failed, 1),
                fixtures::result("S", "flaky", TerminalReason::Passed, 2),
                skipped,
            ],
            vec![
                (TestCase::new("S", "flaky"), Verdict::Flaky, 2),
                (TestCase::new("S", "gone"), Verdict::NotExecuted, 1),
            ],
        );
        let xml = xml(&report);
        assert!(xml.contains("<system-out>flaky, passed after:"));
        assert!(xml.contains(r#"<error message="node out of disk space" type="not_executed"/>"#));
        assert!(xml.contains(r#"errors="1""#));
    }

    #[test]
    fn test_sanitize_drops_control_characters() {
        assert_eq!(sanitize("a\u{1b}[31mb\n"), "a[31mb\n");
    }
}
