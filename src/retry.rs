//! Retry and stability policy.
//!
//! Two mutually exclusive modes:
//!
//! - **Retry**: a failed attempt is run again, up to `retries` more times;
//!   the first pass stops it. A test that failed and then passed is flaky.
//! - **Stability**: every test runs `repeats` times whatever the outcome.
//!   It passes only if every attempt passed.
//!
//! Infrastructure results are not attempts. They are retried under their
//! own `infra_retries` budget and only become a counted failure once that
//! budget is spent.

use serde::Serialize;

use crate::config::RunMode;
use crate::distributor::WorkItem;
use crate::executor::{TerminalReason, TestCaseResult};

/// What to do with a work item after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run again without counting the attempt.
    RetryInfra,
    /// Count the attempt and run again.
    Retry,
    /// Count the attempt; the test is finished.
    Done,
}

/// Final verdict of a test across its counted attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    /// Failed at least once but passed in retry mode.
    Flaky,
    /// Mixed outcomes in stability mode.
    Unstable,
    Failed,
    NotExecuted,
}

impl Verdict {
    pub fn is_passing(self) -> bool {
        matches!(self, Verdict::Passed | Verdict::Flaky)
    }
}

/// Retry decisions for a session.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    mode: RunMode,
    infra_retries: usize,
}

impl RetryPolicy {
    pub fn new(mode: RunMode, infra_retries: usize) -> Self {
        Self {
            mode,
            infra_retries,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn infra_retries(&self) -> usize {
        self.infra_retries
    }

    /// Upper bound of counted attempts per test.
    pub fn max_attempts(&self) -> usize {
        match self.mode {
            RunMode::Retry { retries } => retries + 1,
            RunMode::Stability { repeats } => repeats,
        }
    }

    /// Whether another counted attempt follows `attempt` (1-based).
    pub fn should_retry(&self, result: &TestCaseResult, attempt: usize) -> bool {
        if result.reason == TerminalReason::NotExecuted {
            return false;
        }
        match self.mode {
            RunMode::Retry { retries } => !result.passed() && attempt <= retries,
            RunMode::Stability { repeats } => attempt < repeats,
        }
    }

    /// Classifies the outcome of running `item` once more.
    pub fn decide(&self, item: &WorkItem, result: &TestCaseResult) -> Decision {
        if result.infra && item.infra_attempts < self.infra_retries {
            return Decision::RetryInfra;
        }
        if self.should_retry(result, item.attempt + 1) {
            Decision::Retry
        } else {
            Decision::Done
        }
    }

    /// Merges the counted attempts of one test into a verdict.
    pub fn finalize(&self, attempts: &[TestCaseResult]) -> Verdict {
        let executed: Vec<_> = attempts
            .iter()
            .filter(|r| r.reason != TerminalReason::NotExecuted)
            .collect();
        if executed.is_empty() {
            return Verdict::NotExecuted;
        }

        let passed = executed.iter().filter(|r| r.passed()).count();
        match self.mode {
            RunMode::Retry { .. } => {
                if passed == 0 {
                    Verdict::Failed
                } else if passed < executed.len() {
                    Verdict::Flaky
                } else {
                    Verdict::Passed
                }
            }
            RunMode::Stability { .. } => {
                if passed == executed.len() {
                    Verdict::Passed
                } else if passed == 0 {
                    Verdict::Failed
                } else {
                    Verdict::Unstable
                }
            }
        }
    }
}

/// Consecutive infrastructure failures of one runner slot.
#[derive(Debug, Clone)]
pub struct SlotHealth {
    consecutive: usize,
    limit: usize,
}

impl SlotHealth {
    pub fn new(infra_retries: usize) -> Self {
        Self {
            consecutive: 0,
            limit: infra_retries.max(1),
        }
    }

    /// Records an attempt; returns `true` once the slot's node should be degraded.
    pub fn record(&mut self, infra: bool) -> bool {
        if infra {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.consecutive >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::executor::TestStatus;
    use crate::inventory::TestCase;

    fn result(reason: TerminalReason, infra: bool) -> TestCaseResult {
        let now = Utc::now();
        TestCaseResult {
            test: TestCase::new("S", "t"),
            node: "n".into(),
            runner_id: Some("U".into()),
            runner_name: Some("r".into()),
            xc_result_path: None,
            status: reason.status(),
            reason,
            attempt: 1,
            infra,
            reported_duration: None,
            message: None,
            started_at: now,
            ended_at: now,
        }
    }

    fn item(attempt: usize, infra_attempts: usize) -> WorkItem {
        WorkItem {
            case: TestCase::new("S", "t"),
            slot: 0,
            position: 0,
            attempt,
            infra_attempts,
        }
    }

    #[test]
    fn test_retry_mode_stops_on_pass_and_budget() {
        let policy = RetryPolicy::new(RunMode::Retry { retries: 2 }, 1);
        let failed = result(TerminalReason::Failed, false);
        let passed = result(TerminalReason::Passed, false);

        assert!(policy.should_retry(&failed, 1));
        assert!(policy.should_retry(&failed, 2));
        assert!(!policy.should_retry(&failed, 3));
        assert!(!policy.should_retry(&passed, 1));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_counted_attempts_never_exceed_budget() {
        for retries in 0..5 {
            let policy = RetryPolicy::new(RunMode::Retry { retries }, 2);
            let mut item = item(0, 0);
            let mut counted = 0;
            loop {
                counted += 1;
                let decision = policy.decide(&item, &result(TerminalReason::Failed, false));
                if decision != Decision::Retry {
                    break;
                }
                item.attempt += 1;
            }
            assert_eq!(counted, retries + 1);
        }
    }

    #[test]
    fn test_infra_results_use_own_budget() {
        let policy = RetryPolicy::new(RunMode::Retry { retries: 0 }, 2);
        let infra = result(TerminalReason::Errored, true);

        assert_eq!(policy.decide(&item(0, 0), &infra), Decision::RetryInfra);
        assert_eq!(policy.decide(&item(0, 1), &infra), Decision::RetryInfra);
        // Budget spent: counted as a failed attempt
        assert_eq!(policy.decide(&item(0, 2), &infra), Decision::Done);
    }

    #[test]
    fn test_stability_runs_every_repeat() {
        let policy = RetryPolicy::new(RunMode::Stability { repeats: 3 }, 2);
        let passed = result(TerminalReason::Passed, false);
        assert_eq!(policy.decide(&item(0, 0), &passed), Decision::Retry);
        assert_eq!(policy.decide(&item(1, 0), &passed), Decision::Retry);
        assert_eq!(policy.decide(&item(2, 0), &passed), Decision::Done);
    }

    #[test]
    fn test_finalize() {
        let pass = result(TerminalReason::Passed, false);
        let fail = result(TerminalReason::Failed, false);

        let retry = RetryPolicy::new(RunMode::Retry { retries: 2 }, 2);
        assert_eq!(retry.finalize(&[pass.clone()]), Verdict::Passed);
        assert_eq!(retry.finalize(&[fail.clone(), pass.clone()]), Verdict::Flaky);
        assert_eq!(retry.finalize(&[fail.clone(), fail.clone(), fail.clone()]), Verdict::Failed);

        let stability = RetryPolicy::new(RunMode::Stability { repeats: 3 }, 2);
        let attempts = [pass.clone(), fail.clone(), pass.clone()];
        assert_eq!(stability.finalize(&attempts), Verdict::Unstable);
        assert!(!Verdict::Unstable.is_passing());
        assert_eq!(
            attempts.iter().map(|r| r.status).collect::<Vec<_>>(),
            vec![TestStatus::Passed, TestStatus::Failed, TestStatus::Passed]
        );
        assert_eq!(stability.finalize(&[pass.clone(), pass.clone(), pass]), Verdict::Passed);

        let skipped = TestCaseResult::not_executed(&TestCase::new("S", "t"), "n", 1, "node lost");
        assert_eq!(retry.finalize(&[skipped]), Verdict::NotExecuted);
    }

    #[test]
    fn test_slot_health_degrades_after_consecutive_infra() {
        let mut health = SlotHealth::new(2);
        assert!(!health.record(true));
        assert!(!health.record(false));
        assert!(!health.record(true));
        assert!(health.record(true));
    }
}
