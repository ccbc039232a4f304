//! JSON session report.
//!
//! `report.json` holds the whole [`SessionReport`]: every counted attempt,
//! the infrastructure log, per-test verdicts and stage timings.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{error, info};

use super::{Reporter, SessionReport, write_artifact};
use crate::executor::TestCaseResult;
use crate::inventory::TestCase;
use crate::registry::Runner;

/// Writes the session document when the run completes.
pub struct JsonReporter {
    output_path: PathBuf,
}

impl JsonReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    pub fn render(report: &SessionReport) -> serde_json::Result<String> {
        serde_json::to_string_pretty(report)
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_discovery_complete(&self, _tests: &[TestCase]) {}

    async fn on_test_start(&self, _test: &TestCase, _runner: &Runner) {}

    async fn on_test_complete(&self, _result: &TestCaseResult, _retrying: bool) {}

    async fn on_run_complete(&self, report: &SessionReport) {
        let json = match Self::render(report) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize session report: {}", e);
                return;
            }
        };
        match write_artifact(&self.output_path, json.as_bytes()) {
            Ok(()) => info!("Session report written to: {}", self.output_path.display()),
            Err(e) => error!("Failed to write {}: {}", self.output_path.display(), e),
        }
    }
}
