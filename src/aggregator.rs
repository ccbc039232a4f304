//! Session-wide result collection and stage timings.
//!
//! Workers append results concurrently; reporters read snapshots. Nothing
//! recorded is ever removed or rewritten.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executor::TestCaseResult;
use crate::inventory::TestCase;
use crate::retry::{RetryPolicy, Verdict};

/// Phases of a session whose duration is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Build,
    Provisioning,
    Distribution,
    Execution,
    Teardown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Discovery => "discovery",
            Stage::Build => "build",
            Stage::Provisioning => "provisioning",
            Stage::Distribution => "distribution",
            Stage::Execution => "execution",
            Stage::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// One timed interval of a stage, optionally scoped to a node.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub node: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Verdict of one test over all its counted attempts.
#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    #[serde(flatten)]
    pub test: TestCase,
    pub verdict: Verdict,
    pub attempts: usize,
}

/// Point-in-time copy of everything recorded.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub passed: usize,
    pub failed: usize,
    pub flaky: usize,
    pub not_executed: usize,
    /// Tests in the order their first result arrived.
    pub tests: Vec<TestSummary>,
    pub results: Vec<TestCaseResult>,
    pub infra: Vec<TestCaseResult>,
    pub timings: Vec<StageTiming>,
}

impl Snapshot {
    pub fn total(&self) -> usize {
        self.tests.len()
    }

    /// 0 when everything passed, 1 on failures or tests not run, 2 when all
    /// passed but some only after a retry.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.not_executed > 0 {
            1
        } else if self.flaky > 0 {
            2
        } else {
            0
        }
    }
}

/// Thread-safe, append-only store of a session's results.
pub struct Aggregator {
    policy: RetryPolicy,
    results: RwLock<Vec<TestCaseResult>>,
    infra: RwLock<Vec<TestCaseResult>>,
    timings: RwLock<Vec<StageTiming>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Aggregator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            results: RwLock::new(Vec::new()),
            infra: RwLock::new(Vec::new()),
            timings: RwLock::new(Vec::new()),
        }
    }

    /// Records a counted attempt.
    pub fn record(&self, result: TestCaseResult) {
        write(&self.results).push(result);
    }

    /// Records an infrastructure result that did not count as an attempt.
    pub fn record_infra(&self, result: TestCaseResult) {
        write(&self.infra).push(result);
    }

    pub fn results(&self) -> Vec<TestCaseResult> {
        read(&self.results).clone()
    }

    pub fn infra_log(&self) -> Vec<TestCaseResult> {
        read(&self.infra).clone()
    }

    pub fn timings(&self) -> Vec<StageTiming> {
        read(&self.timings).clone()
    }

    /// Counted attempts recorded for `test` so far.
    pub fn attempts_of(&self, test: &TestCase) -> usize {
        read(&self.results).iter().filter(|r| &r.test == test).count()
    }

    /// Starts timing `stage` on `node`; the interval ends when the guard drops.
    ///
    /// An interval never starts before the previous one of the same stage
    /// and node has ended; a still open predecessor is closed first.
    pub fn begin(&self, stage: Stage, node: Option<&str>) -> StageGuard<'_> {
        let node = node.map(str::to_string);
        let mut timings = write(&self.timings);
        let mut started_at = Utc::now();

        if let Some(previous) = timings
            .iter_mut()
            .rev()
            .find(|t| t.stage == stage && t.node == node)
        {
            let ended = *previous.ended_at.get_or_insert(started_at.max(previous.started_at));
            started_at = started_at.max(ended);
        }

        timings.push(StageTiming {
            stage,
            node,
            started_at,
            ended_at: None,
        });
        StageGuard {
            aggregator: self,
            index: timings.len() - 1,
        }
    }

    fn end(&self, index: usize) {
        let mut timings = write(&self.timings);
        if let Some(timing) = timings.get_mut(index)
            && timing.ended_at.is_none()
        {
            timing.ended_at = Some(Utc::now().max(timing.started_at));
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let results = self.results();

        let mut order: Vec<TestCase> = Vec::new();
        let mut grouped: HashMap<String, Vec<TestCaseResult>> = HashMap::new();
        for result in &results {
            let attempts = grouped.entry(result.test.identifier()).or_default();
            if attempts.is_empty() {
                order.push(result.test.clone());
            }
            attempts.push(result.clone());
        }

        let tests: Vec<TestSummary> = order
            .into_iter()
            .map(|test| {
                let attempts = grouped.remove(&test.identifier()).unwrap_or_default();
                TestSummary {
                    verdict: self.policy.finalize(&attempts),
                    attempts: attempts.len(),
                    test,
                }
            })
            .collect();

        let count = |f: fn(Verdict) -> bool| tests.iter().filter(|t| f(t.verdict)).count();
        Snapshot {
            passed: count(|v| v == Verdict::Passed),
            failed: count(|v| matches!(v, Verdict::Failed | Verdict::Unstable)),
            flaky: count(|v| matches!(v, Verdict::Flaky | Verdict::Unstable)),
            not_executed: count(|v| v == Verdict::NotExecuted),
            tests,
            results,
            infra: self.infra_log(),
            timings: self.timings(),
        }
    }
}

/// Ends its stage interval on drop.
pub struct StageGuard<'a> {
    aggregator: &'a Aggregator,
    index: usize,
}

impl StageGuard<'_> {
    pub fn end(self) {}
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        self.aggregator.end(self.index);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::RunMode;
    use crate::executor::TerminalReason;

    fn result(suite: &str, name: &str, reason: TerminalReason) -> TestCaseResult {
        let now = Utc::now();
        TestCaseResult {
            test: TestCase::new(suite, name),
            node: "n".into(),
            runner_id: None,
            runner_name: None,
            xc_result_path: None,
            status: reason.status(),
            reason,
            attempt: 1,
            infra: false,
            reported_duration: None,
            message: None,
            started_at: now,
            ended_at: now,
        }
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(RetryPolicy::new(RunMode::Retry { retries: 2 }, 2))
    }

    #[test]
    fn test_snapshot_counts_and_exit_code() {
        let agg = aggregator();
        agg.record(result("A", "ok", TerminalReason::Passed));
        agg.record(result("A", "flaky", TerminalReason::Failed));
        agg.record(result("A", "flaky", TerminalReason::Passed));
        let snap = agg.snapshot();
        assert_eq!((snap.passed, snap.flaky, snap.failed), (1, 1, 0));
        assert_eq!(snap.exit_code(), 2);

        agg.record(result("B", "bad", TerminalReason::Crashed));
        agg.record_infra(result("B", "bad", TerminalReason::Errored));
        let snap = agg.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.infra.len(), 1);
        assert_eq!(snap.exit_code(), 1);
        assert_eq!(
            snap.tests.iter().map(|t| t.test.identifier()).collect::<Vec<_>>(),
            vec!["A/ok", "A/flaky", "B/bad"]
        );
    }

    #[test]
    fn test_not_executed_fails_session() {
        let agg = aggregator();
        agg.record(TestCaseResult::not_executed(&TestCase::new("A", "t"), "n", 1, "lost"));
        let snap = agg.snapshot();
        assert_eq!(snap.not_executed, 1);
        assert_eq!(snap.exit_code(), 1);
    }

    #[test]
    fn test_stage_intervals_do_not_overlap() {
        let agg = aggregator();
        let first = agg.begin(Stage::Provisioning, Some("mac"));
        // Opening the same key again closes the first interval
        let second = agg.begin(Stage::Provisioning, Some("mac"));
        drop(first);
        second.end();
        {
            let _other = agg.begin(Stage::Provisioning, Some("mini"));
        }

        let timings = agg.timings();
        assert_eq!(timings.len(), 3);
        let mac: Vec<_> = timings.iter().filter(|t| t.node.as_deref() == Some("mac")).collect();
        let first_end = mac[0].ended_at.unwrap();
        assert!(mac[1].started_at >= first_end);
        assert!(timings.iter().all(|t| t.ended_at.unwrap() >= t.started_at));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recording() {
        let agg = Arc::new(aggregator());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let agg = agg.clone();
                tokio::spawn(async move {
                    for j in 0..25 {
                        agg.record(result("S", &format!("t{}_{}", i, j), TerminalReason::Passed));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(agg.snapshot().passed, 200);
    }
}
