//! One worker per runner slot.
//!
//! A worker owns its runner and a duplicated channel. It pulls items from
//! the shared queues, runs them, and routes every outcome through the
//! retry policy into the aggregator and the reporter.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::channel::{Channel, OutputLine};
use crate::collaborator::{EventKind, EventSink};
use crate::distributor::{DrainMode, WorkItem, WorkQueues};
use crate::executor::{
    ExecutorSettings, NodeFault, OutputCallback, TestCaseResult, TestExecutor,
};
use crate::registry::{Registry, Runner};
use crate::report::Reporter;
use crate::retry::{Decision, RetryPolicy, SlotHealth};

/// State shared by all workers of a session.
pub struct Workers<'a, R> {
    pub registry: &'a Registry,
    pub queues: &'a WorkQueues,
    pub aggregator: &'a Aggregator,
    pub policy: RetryPolicy,
    pub reporter: &'a R,
    pub events: &'a EventSink,
    pub settings: &'a ExecutorSettings,
    pub stream_output: bool,
}

fn test_info(result: &TestCaseResult) -> serde_json::Value {
    json!({
        "suite": result.test.suite,
        "name": result.test.name,
        "node": result.node,
        "runner": result.runner_name,
    })
}

impl<R: Reporter> Workers<'_, R> {
    /// Records a counted attempt and tells the reporter.
    async fn finish(&self, result: TestCaseResult, retrying: bool) {
        if !retrying {
            self.events.emit(
                EventKind::TestFinished,
                test_info(&result),
                json!({
                    "status": result.status,
                    "reason": result.reason,
                    "attempt": result.attempt,
                    "duration": result.reported_duration.unwrap_or_else(|| result.duration().as_secs_f64()),
                }),
            );
        }
        self.reporter.on_test_complete(&result, retrying).await;
        self.aggregator.record(result);
    }

    /// Marks items that will never run.
    pub async fn abandon(&self, items: Vec<WorkItem>, node: &str, reason: &str) {
        for item in items {
            warn!("{} will not be executed: {}", item.case, reason);
            let result = TestCaseResult::not_executed(&item.case, node, item.attempt + 1, reason);
            self.finish(result, false).await;
        }
    }

    /// Takes a node out of the session and moves its pending work.
    async fn retire(&self, node: &str, reason: String, mode: DrainMode) {
        error!("Node {} degraded: {}", node, reason);
        self.registry.mark_degraded(node, reason.clone());
        let leftovers = self.queues.retire_node(node, mode);
        self.abandon(leftovers, node, &reason).await;
        info!(
            "{} runner slots left on {} viable nodes",
            self.queues.viable_slots(),
            self.registry.viable_nodes().len()
        );
    }

    /// Drives one runner slot until no work is left for it.
    pub async fn run_slot<C: Channel>(&self, slot: usize, runner: &Runner, channel: C) {
        let reporter = self.reporter;
        let mut executor = TestExecutor::new(self.registry, self.settings)
            .with_preview(Arc::new(move |result: &TestCaseResult| reporter.on_test_preview(result)));
        if self.stream_output {
            let callback: OutputCallback = Arc::new(|runner, line| match line {
                OutputLine::Stdout(s) => println!("[{}] {}", runner, s),
                OutputLine::Stderr(s) => eprintln!("[{}] {}", runner, s),
                OutputLine::ExitCode(_) => {}
            });
            executor = executor.with_output(callback);
        }

        let mut health = SlotHealth::new(self.policy.infra_retries());

        while let Some(mut item) = self.queues.next(slot).await {
            self.reporter.on_test_start(&item.case, runner).await;
            self.events.emit(
                EventKind::TestStarted,
                json!({
                    "suite": item.case.suite,
                    "name": item.case.name,
                    "node": runner.node,
                    "runner": runner.name,
                }),
                json!({ "attempt": item.attempt + 1 }),
            );

            let outcome = executor
                .run(&item.case, item.attempt + 1, runner, &channel)
                .await;
            let result = outcome.result;
            let infra = result.infra;

            match outcome.fault {
                Some(NodeFault::StorageExhausted(message)) => {
                    self.retire(&runner.node, message, DrainMode::Abandon).await;
                }
                Some(NodeFault::Unreachable(message)) => {
                    self.retire(&runner.node, message, DrainMode::Redistribute)
                        .await;
                }
                None => {}
            }

            match self.policy.decide(&item, &result) {
                Decision::RetryInfra => {
                    warn!(
                        "{} hit an infrastructure failure on {} ({}/{}): {}",
                        item.case,
                        runner.name,
                        item.infra_attempts + 1,
                        self.policy.infra_retries(),
                        result.message.as_deref().unwrap_or("no details")
                    );
                    self.aggregator.record_infra(result);
                    item.infra_attempts += 1;
                    if let Some(item) = self.queues.requeue(slot, item) {
                        self.abandon(vec![item], &runner.node, "no viable runner left").await;
                    }
                }
                Decision::Retry => {
                    debug!(
                        "{} queued for attempt {}/{}",
                        item.case,
                        item.attempt + 2,
                        self.policy.max_attempts()
                    );
                    self.finish(result, true).await;
                    item.attempt += 1;
                    if let Some(item) = self.queues.requeue(slot, item) {
                        self.abandon(vec![item], &runner.node, "no viable runner left").await;
                    }
                }
                Decision::Done => self.finish(result, false).await,
            }

            if health.record(infra) && !self.registry.is_degraded(&runner.node) {
                self.retire(
                    &runner.node,
                    format!(
                        "{} consecutive infrastructure failures on {}",
                        self.policy.infra_retries().max(1),
                        runner.name
                    ),
                    DrainMode::Redistribute,
                )
                .await;
            }

            self.queues.complete();
        }
    }
}
