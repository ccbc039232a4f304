//! Session orchestration.
//!
//! The [`Orchestrator`] owns one session from start to finish and ties the
//! other modules together.
//!
//! # Architecture
//!
//! ```text
//!   inventory            distributor              registry
//!       │                     │                       │
//!       │ discover()          │                       │ provision_runners()
//!       ▼                     │                       ▼
//!  Vec<TestCase> ────────────►│ plan()           Vec<Runner>
//!                             ▼                       │
//!                    Vec<Vec<TestCase>> ──► WorkQueues│
//!                                              │      │
//!                              one worker per slot ◄──┘
//!                                              │
//!                                   TestExecutor::run() over a Channel
//!                                              │
//!                                   RetryPolicy::decide()
//!                                              │
//!                               Aggregator ──► Reporter
//! ```
//!
//! # Session Flow
//!
//! 1. **Discovery**: collaborator or test list, include/exclude, sort hook
//! 2. **Build**: optional local build command, wrapped by the build hooks
//! 3. **Provisioning**: every node in parallel; failing nodes are degraded
//! 4. **Distribution**: contiguous partition or the distribution hook
//! 5. **Execution**: one worker per runner slot, retries requeued
//! 6. **Teardown**: runners shut down (or erased)
//! 7. **Reporting**: `report.json`, `junit.xml`, the teardown hook
//!
//! Configuration faults abort the session before any test is dispatched.
//! Infrastructure faults degrade single nodes; the session only fails when
//! no node is left.
//!
//! # Example
//!
//! ```no_run
//! use simfleet::channel::SystemChannels;
//! use simfleet::config::load_config;
//! use simfleet::orchestrator::Orchestrator;
//! use simfleet::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("simfleet.toml"))?;
//!     let orchestrator = Orchestrator::new(config, SystemChannels, ConsoleReporter::new(false));
//!     let report = orchestrator.run().await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod provision;
pub mod worker;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::{Aggregator, Stage};
use crate::channel::{self, Channel, ChannelProvider, OutputLine};
use crate::collaborator::{
    self, BuildCommand, BuildOutcome, Collaborators, EventKind, EventSink, SortRequest,
};
use crate::config::{BuildConfig, Config, RunMode};
use crate::distributor::{self, WorkQueues};
use crate::executor::{ExecutorSettings, TestCaseResult};
use crate::inventory::{self, TestCase};
use crate::registry::{Registry, Runner};
use crate::report::{JUnitReporter, JsonReporter, MultiReporter, Reporter, SessionReport};
use crate::retry::RetryPolicy;

pub use provision::NodePool;
pub use worker::Workers;

/// Discovers, filters and orders the tests of a configuration.
///
/// This is what `simfleet collect` prints and what a session runs.
pub async fn discover_tests(
    config: &Config,
    collaborators: &Collaborators,
) -> anyhow::Result<Vec<TestCase>> {
    let discoverer = inventory::discoverer_for(&config.tests, collaborators)?;
    let tests = inventory::discover(
        discoverer.as_ref(),
        &config.tests.include,
        &config.tests.exclude,
    )
    .await?;

    let request = SortRequest {
        tests: tests.clone(),
        device: config.device.clone(),
    };
    match collaborators
        .invoke::<collaborator::Sort>(&request)
        .await
        .context("Sort collaborator failed")?
    {
        Some(sorted) => Ok(inventory::apply_order(tests, sorted)),
        None => Ok(tests),
    }
}

/// Suites in first-seen order with their test counts.
fn suites(tests: &[TestCase]) -> Vec<(&str, usize)> {
    let mut suites: Vec<(&str, usize)> = Vec::new();
    for test in tests {
        match suites.iter_mut().find(|(name, _)| *name == test.suite) {
            Some((_, count)) => *count += 1,
            None => suites.push((test.suite.as_str(), 1)),
        }
    }
    suites
}

/// Per-session state.
struct Session {
    id: String,
    started_at: DateTime<Utc>,
    mode: RunMode,
    /// Configuration with `report.output_dir` made absolute.
    config: Config,
    settings: ExecutorSettings,
    policy: RetryPolicy,
    registry: Registry,
    aggregator: Aggregator,
}

impl Session {
    fn new(config: &Config) -> anyhow::Result<Self> {
        let mode = config.simfleet.run_mode()?;
        let mut config = config.clone();
        config.report.output_dir = std::path::absolute(&config.report.output_dir)
            .with_context(|| {
                format!(
                    "Invalid output directory: {}",
                    config.report.output_dir.display()
                )
            })?;

        let policy = RetryPolicy::new(mode, config.simfleet.infra_retries);
        let registry = Registry::new(config.nodes.clone(), config.simfleet.infra_retries)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            mode,
            settings: ExecutorSettings::from_config(&config),
            policy,
            registry,
            aggregator: Aggregator::new(policy),
            config,
        })
    }

    fn output_dir(&self) -> &PathBuf {
        &self.config.report.output_dir
    }

    fn report(&self) -> SessionReport {
        let snapshot = self.aggregator.snapshot();
        let degraded_nodes: BTreeMap<String, String> = self
            .registry
            .nodes()
            .iter()
            .filter_map(|n| {
                self.registry
                    .degraded_reason(&n.name)
                    .map(|reason| (n.name.clone(), reason))
            })
            .collect();

        SessionReport {
            session_id: self.id.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            mode: self.mode,
            device: self.config.device.clone(),
            output_dir: self.output_dir().clone(),
            degraded_nodes,
            exit_code: snapshot.exit_code(),
            snapshot,
        }
    }
}

/// Runs test sessions over a pool of nodes.
///
/// # Type Parameters
///
/// - `P`: opens channels to nodes ([`channel::SystemChannels`] in production)
/// - `R`: receives progress and the final report
pub struct Orchestrator<P, R> {
    config: Config,
    provider: P,
    reporter: R,
}

impl<P, R> Orchestrator<P, R>
where
    P: ChannelProvider,
    R: Reporter,
{
    pub fn new(config: Config, provider: P, reporter: R) -> Self {
        Self {
            config,
            provider,
            reporter,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs a full session and returns its report.
    ///
    /// Report artifacts are written to `report.output_dir` before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Configuration faults, fatal collaborator failures, a failed build, or
    /// no node left after provisioning.
    pub async fn run(&self) -> anyhow::Result<SessionReport> {
        let session = Session::new(&self.config)?;
        let collaborators = Collaborators::new(session.config.collaborators.clone());
        let events = EventSink::spawn(&collaborators);

        info!("Session {} started ({:?})", session.id, session.mode);
        events.emit(
            EventKind::Start,
            json!({ "session_id": session.id }),
            json!({ "mode": session.mode, "device": session.config.device }),
        );

        let outcome = self.run_session(&session, &collaborators, &events).await;

        match &outcome {
            Ok(report) => {
                events.emit(
                    EventKind::Stop,
                    json!({ "session_id": session.id }),
                    json!({ "exit_code": report.exit_code() }),
                );
            }
            Err(e) => {
                error!("Session {} failed: {:#}", session.id, e);
                events.emit(
                    EventKind::Error,
                    json!({ "session_id": session.id }),
                    json!({ "message": format!("{:#}", e) }),
                );
                events.emit(
                    EventKind::Stop,
                    json!({ "session_id": session.id }),
                    json!({ "exit_code": 1 }),
                );
            }
        }
        events.close().await;
        outcome
    }

    async fn run_session(
        &self,
        session: &Session,
        collaborators: &Collaborators,
        events: &EventSink,
    ) -> anyhow::Result<SessionReport> {
        std::fs::create_dir_all(session.output_dir()).with_context(|| {
            format!(
                "Failed to create output directory: {}",
                session.output_dir().display()
            )
        })?;

        let tests = {
            let _timing = session.aggregator.begin(Stage::Discovery, None);
            discover_tests(&session.config, collaborators).await?
        };
        self.reporter.on_discovery_complete(&tests).await;

        if let Some(build) = &session.config.build {
            let _timing = session.aggregator.begin(Stage::Build, None);
            build_products(build, collaborators).await?;
        }

        if tests.is_empty() {
            warn!("No tests to run");
        } else {
            let pools = provision::provision_all(
                &self.provider,
                &session.registry,
                &session.aggregator,
                &session.config.driver,
                &session.config.device,
            )
            .await
            .context("Provisioning failed")?;

            if pools.is_empty() {
                let reasons: Vec<String> = session
                    .registry
                    .nodes()
                    .iter()
                    .map(|n| match session.registry.degraded_reason(&n.name) {
                        Some(reason) => format!("{}: {}", n.name, reason),
                        None => format!("{}: no capacity", n.name),
                    })
                    .collect();
                bail!("No viable node left ({})", reasons.join("; "));
            }

            let executed = self
                .execute(session, &tests, &pools, collaborators, events)
                .await;
            provision::teardown_all(
                &pools,
                &session.registry,
                &session.aggregator,
                session.config.simfleet.erase_on_teardown,
            )
            .await;
            executed?;

            for test in &tests {
                if session.aggregator.attempts_of(test) == 0 {
                    let result =
                        TestCaseResult::not_executed(test, "-", 1, "no runner picked up the test");
                    self.reporter.on_test_complete(&result, false).await;
                    session.aggregator.record(result);
                }
            }
        }

        let report = session.report();
        self.publish(session, &report, collaborators).await;
        Ok(report)
    }

    async fn execute<C: Channel>(
        &self,
        session: &Session,
        tests: &[TestCase],
        pools: &[NodePool<C>],
        collaborators: &Collaborators,
        events: &EventSink,
    ) -> anyhow::Result<()> {
        let runners: Vec<Runner> = pools
            .iter()
            .flat_map(|p| p.runners.iter().cloned())
            .collect();

        events.emit(
            EventKind::StartTesting,
            json!({ "session_id": session.id }),
            json!({ "tests": tests.len(), "runners": runners.len() }),
        );
        for (suite, count) in suites(tests) {
            events.emit(
                EventKind::SuiteStarted,
                json!({ "suite": suite }),
                json!({ "tests": count }),
            );
        }

        let assignments = {
            let _timing = session.aggregator.begin(Stage::Distribution, None);
            distributor::plan(tests, &runners, &session.config.device, collaborators)
                .await
                .context("Distribution failed")?
        };
        info!(
            "Distributed {} tests over {} runners on {} nodes",
            tests.len(),
            runners.len(),
            pools.len()
        );

        let owners = runners.iter().map(|r| r.node.clone()).collect();
        let queues = WorkQueues::new(assignments, owners);
        let workers = Workers {
            registry: &session.registry,
            queues: &queues,
            aggregator: &session.aggregator,
            policy: session.policy,
            reporter: &self.reporter,
            events,
            settings: &session.settings,
            stream_output: session.config.simfleet.stream_output,
        };

        {
            let _timing = session.aggregator.begin(Stage::Execution, None);
            tokio_scoped::scope(|scope| {
                let mut slot = 0;
                for pool in pools {
                    for runner in &pool.runners {
                        let channel = pool.channel.duplicate();
                        let workers = &workers;
                        let index = slot;
                        scope.spawn(async move {
                            workers.run_slot(index, runner, channel).await;
                        });
                        slot += 1;
                    }
                }
            });
        }

        let results = session.aggregator.results();
        for (suite, count) in suites(tests) {
            let failed = results
                .iter()
                .filter(|r| r.test.suite == suite && !r.passed())
                .count();
            events.emit(
                EventKind::SuiteFinished,
                json!({ "suite": suite }),
                json!({ "tests": count, "failed_attempts": failed }),
            );
        }
        events.emit(
            EventKind::StopTesting,
            json!({ "session_id": session.id }),
            json!({ "results": results.len() }),
        );
        Ok(())
    }

    /// Writes the artifacts and hands the report to the reporter and the
    /// teardown hook.
    async fn publish(
        &self,
        session: &Session,
        report: &SessionReport,
        collaborators: &Collaborators,
    ) {
        let output_dir = session.output_dir();
        let report_config = &session.config.report;

        let mut artifacts = MultiReporter::new()
            .with_reporter(JsonReporter::new(output_dir.join(&report_config.json_file)));
        if report_config.junit {
            artifacts = artifacts
                .with_reporter(JUnitReporter::new(output_dir.join(&report_config.junit_file)));
        }
        artifacts.on_run_complete(report).await;
        self.reporter.on_run_complete(report).await;

        if let Err(e) = collaborators
            .invoke::<collaborator::Teardown>(&report.summary())
            .await
        {
            warn!("Teardown collaborator failed: {}", e);
        }
    }
}

/// Runs the build command locally, wrapped by the build hooks.
async fn build_products(build: &BuildConfig, collaborators: &Collaborators) -> anyhow::Result<()> {
    let mut command = build.command.clone();
    if let Some(rewritten) = collaborators
        .invoke::<collaborator::PreBuild>(&BuildCommand {
            command: command.clone(),
        })
        .await
        .context("Pre-build collaborator failed")?
    {
        debug!("Build command rewritten to: {}", rewritten.command);
        command = rewritten.command;
    }

    info!("Building: {}", command);
    let mut process = tokio::process::Command::new("sh");
    process.arg("-c").arg(&command);
    if let Some(dir) = &build.working_dir {
        process.current_dir(dir);
    }

    let mut stream = channel::spawn_streaming(process, CancellationToken::new())
        .with_context(|| format!("Failed to start build: {}", command))?;
    let mut exit_code = -1;
    while let Some(line) = stream.next().await {
        match line {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => debug!("[build] {}", s),
            OutputLine::ExitCode(code) => exit_code = code,
        }
    }

    collaborators
        .invoke::<collaborator::PostBuild>(&BuildOutcome {
            command: command.clone(),
            exit_code,
        })
        .await
        .context("Post-build collaborator failed")?;

    if exit_code != 0 {
        bail!("Build failed with exit code {}: {}", exit_code, command);
    }
    info!("Build finished");
    Ok(())
}
