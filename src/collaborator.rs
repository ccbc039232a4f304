//! External collaborator commands.
//!
//! Collaborators are user-supplied executables invoked at the extension
//! points of a session. They can be written in any language; the protocol is
//! a single JSON document on stdin and, when an answer is expected, JSON on
//! stdout.
//!
//! # Protocol
//!
//! ```text
//! stdin:  {"kind": "sort", "input": {"tests": [...], "device": {...}}}
//! stdout: [{"suite": "LoginTests", "name": "testLogin"}, ...]
//! ```
//!
//! When other output precedes the answer, the last line that parses as JSON
//! is used.
//!
//! | Kind | Input | Output | On error |
//! |------|-------|--------|----------|
//! | `discovery` | `{paths, base_class, include, exclude}` | `[TestCase]` | fatal |
//! | `sort` | `{tests, device}` | `[TestCase]` | fatal |
//! | `distribution` | `{tests, device, runners}` | `[[TestCase]]` | fatal |
//! | `pre_build` | `{command}` | `{command}` | fatal |
//! | `post_build` | `{command, exit_code}` | ignored | fatal |
//! | `event` | `{kind, info, values}` | ignored | logged |
//! | `teardown` | session summary | ignored | logged |

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{CollaboratorsConfig, DeviceProfile};
use crate::inventory::TestCase;

/// Errors from collaborator invocations.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The command string could not be split or spawned.
    #[error("Failed to run {kind} collaborator `{command}`: {message}")]
    Spawn {
        kind: CollaboratorKind,
        command: String,
        message: String,
    },

    /// The collaborator exited with a non-zero code.
    #[error("{kind} collaborator exited with code {exit_code}: {stderr}")]
    Failed {
        kind: CollaboratorKind,
        exit_code: i32,
        stderr: String,
    },

    /// The collaborator did not finish in time.
    #[error("{kind} collaborator timed out after {secs}s")]
    Timeout { kind: CollaboratorKind, secs: u64 },

    /// The collaborator's answer could not be decoded.
    #[error("Invalid output from {kind} collaborator: {message}")]
    InvalidOutput {
        kind: CollaboratorKind,
        message: String,
    },

    /// The request could not be encoded.
    #[error("Failed to encode {kind} request: {source}")]
    Encode {
        kind: CollaboratorKind,
        source: serde_json::Error,
    },
}

/// Extension points a collaborator can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    Discovery,
    Sort,
    Distribution,
    Event,
    PreBuild,
    PostBuild,
    Teardown,
}

impl std::fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CollaboratorKind::Discovery => "discovery",
            CollaboratorKind::Sort => "sort",
            CollaboratorKind::Distribution => "distribution",
            CollaboratorKind::Event => "event",
            CollaboratorKind::PreBuild => "pre_build",
            CollaboratorKind::PostBuild => "post_build",
            CollaboratorKind::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// A typed collaborator exchange.
pub trait Message {
    const KIND: CollaboratorKind;
    /// Whether stdout carries an answer; otherwise it is only logged.
    const ANSWERS: bool = true;
    type Input: Serialize + Send + Sync;
    type Output: DeserializeOwned + Send;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub paths: Vec<PathBuf>,
    pub base_class: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortRequest {
    pub tests: Vec<TestCase>,
    pub device: DeviceProfile,
}

/// A runner slot as seen by the distribution collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSlot {
    pub node: String,
    pub name: String,
    pub udid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionRequest {
    pub tests: Vec<TestCase>,
    pub device: DeviceProfile,
    pub runners: Vec<RunnerSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCommand {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub command: String,
    pub exit_code: i32,
}

/// Session events delivered to the event collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Start,
    Stop,
    StartTesting,
    StopTesting,
    SuiteStarted,
    SuiteFinished,
    TestStarted,
    TestFinished,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default)]
    pub info: serde_json::Value,
    #[serde(default)]
    pub values: serde_json::Value,
}

/// Summary handed to the teardown collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub flaky: usize,
    pub not_run: usize,
    pub exit_code: i32,
    pub output_dir: PathBuf,
}

pub struct Discovery;
pub struct Sort;
pub struct Distribution;
pub struct PreBuild;
pub struct PostBuild;
pub struct EventMessage;
pub struct Teardown;

impl Message for Discovery {
    const KIND: CollaboratorKind = CollaboratorKind::Discovery;
    type Input = DiscoveryRequest;
    type Output = Vec<TestCase>;
}

impl Message for Sort {
    const KIND: CollaboratorKind = CollaboratorKind::Sort;
    type Input = SortRequest;
    type Output = Vec<TestCase>;
}

impl Message for Distribution {
    const KIND: CollaboratorKind = CollaboratorKind::Distribution;
    type Input = DistributionRequest;
    type Output = Vec<Vec<TestCase>>;
}

impl Message for PreBuild {
    const KIND: CollaboratorKind = CollaboratorKind::PreBuild;
    type Input = BuildCommand;
    type Output = BuildCommand;
}

impl Message for PostBuild {
    const KIND: CollaboratorKind = CollaboratorKind::PostBuild;
    const ANSWERS: bool = false;
    type Input = BuildOutcome;
    type Output = IgnoredAny;
}

impl Message for EventMessage {
    const KIND: CollaboratorKind = CollaboratorKind::Event;
    const ANSWERS: bool = false;
    type Input = Event;
    type Output = IgnoredAny;
}

impl Message for Teardown {
    const KIND: CollaboratorKind = CollaboratorKind::Teardown;
    const ANSWERS: bool = false;
    type Input = SessionSummary;
    type Output = IgnoredAny;
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    kind: CollaboratorKind,
    input: &'a T,
}

/// The collaborator commands configured for a session.
#[derive(Debug, Clone)]
pub struct Collaborators {
    config: CollaboratorsConfig,
}

impl Collaborators {
    pub fn new(config: CollaboratorsConfig) -> Self {
        Self { config }
    }

    fn command_for(&self, kind: CollaboratorKind) -> Option<&str> {
        let command = match kind {
            CollaboratorKind::Discovery => &self.config.discovery,
            CollaboratorKind::Sort => &self.config.sort,
            CollaboratorKind::Distribution => &self.config.distribution,
            CollaboratorKind::Event => &self.config.event,
            CollaboratorKind::PreBuild => &self.config.pre_build,
            CollaboratorKind::PostBuild => &self.config.post_build,
            CollaboratorKind::Teardown => &self.config.teardown,
        };
        command.as_deref().filter(|c| !c.trim().is_empty())
    }

    /// Returns `true` if a command is attached to the extension point.
    pub fn has(&self, kind: CollaboratorKind) -> bool {
        self.command_for(kind).is_some()
    }

    /// Invokes the collaborator for `M`, or returns `None` if none is configured.
    pub async fn invoke<M: Message>(
        &self,
        input: &M::Input,
    ) -> Result<Option<M::Output>, CollaboratorError> {
        let Some(command) = self.command_for(M::KIND) else {
            return Ok(None);
        };

        let payload = serde_json::to_vec(&Envelope {
            kind: M::KIND,
            input,
        })
        .map_err(|source| CollaboratorError::Encode {
            kind: M::KIND,
            source,
        })?;

        let stdout = self.run(M::KIND, command, &payload).await?;
        if !M::ANSWERS {
            if !stdout.trim().is_empty() {
                debug!("{} collaborator output: {}", M::KIND, stdout.trim());
            }
            return parse_output::<M::Output>(M::KIND, "").map(Some);
        }
        parse_output::<M::Output>(M::KIND, &stdout).map(Some)
    }

    async fn run(
        &self,
        kind: CollaboratorKind,
        command: &str,
        payload: &[u8],
    ) -> Result<String, CollaboratorError> {
        let spawn_error = |message: String| CollaboratorError::Spawn {
            kind,
            command: command.to_string(),
            message,
        };

        let parts = shell_words::split(command).map_err(|e| spawn_error(e.to_string()))?;
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| spawn_error("empty command".to_string()))?;

        debug!("Running {} collaborator: {:?}", kind, parts);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A collaborator that ignores its input may close stdin early
            if let Err(e) = stdin.write_all(payload).await {
                debug!("{} collaborator did not read its input: {}", kind, e);
            }
        }

        let secs = self.config.timeout_secs;
        let output = tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
            .await
            .map_err(|_| CollaboratorError::Timeout { kind, secs })?
            .map_err(|e| spawn_error(e.to_string()))?;

        if !output.status.success() {
            return Err(CollaboratorError::Failed {
                kind,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Decodes the collaborator's answer: the whole output, else its last JSON line.
fn parse_output<T: DeserializeOwned>(
    kind: CollaboratorKind,
    stdout: &str,
) -> Result<T, CollaboratorError> {
    let trimmed = stdout.trim();
    let whole = if trimmed.is_empty() { "null" } else { trimmed };
    if let Ok(value) = serde_json::from_str(whole) {
        return Ok(value);
    }

    let last_json = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') || line.starts_with('['))
        .find_map(|line| serde_json::from_str(line).ok());

    last_json.ok_or_else(|| CollaboratorError::InvalidOutput {
        kind,
        message: format!(
            "expected JSON, got: {}",
            trimmed.chars().take(200).collect::<String>()
        ),
    })
}

/// Ordered, fire-and-forget delivery of session events.
///
/// Events are queued and handed to the event collaborator one at a time on a
/// background task; failures are logged and never reach the caller.
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<Event>>,
    task: Option<JoinHandle<()>>,
}

impl EventSink {
    /// Starts the delivery task, or a no-op sink if no event command is set.
    pub fn spawn(collaborators: &Collaborators) -> Self {
        if !collaborators.has(CollaboratorKind::Event) {
            return Self {
                sender: None,
                task: None,
            };
        }

        let collaborators = collaborators.clone();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = collaborators.invoke::<EventMessage>(&event).await {
                    warn!("Event collaborator failed for {:?}: {}", event.kind, e);
                }
            }
        });

        Self {
            sender: Some(sender),
            task: Some(task),
        }
    }

    pub fn emit(&self, kind: EventKind, info: serde_json::Value, values: serde_json::Value) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Event { kind, info, values });
        }
    }

    /// Flushes queued events and stops the delivery task.
    pub async fn close(mut self) {
        self.sender.take();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Event delivery task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collaborators(kind_toml: &str) -> Collaborators {
        Collaborators::new(toml::from_str(kind_toml).unwrap())
    }

    #[test]
    fn test_parse_output_last_json_line() {
        let tests: Vec<TestCase> = parse_output(
            CollaboratorKind::Sort,
            "sorting 2 tests\n[{\"suite\": \"A\", \"name\": \"t1\"}]\n",
        )
        .unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].identifier(), "A/t1");

        let ignored: Result<IgnoredAny, _> = parse_output(CollaboratorKind::Event, "");
        assert!(ignored.is_ok());

        let missing: Result<Vec<TestCase>, _> = parse_output(CollaboratorKind::Sort, "");
        assert!(matches!(
            missing,
            Err(CollaboratorError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn test_event_kind_names() {
        let json = serde_json::to_string(&EventKind::StartTesting).unwrap();
        assert_eq!(json, "\"startTesting\"");
        assert_eq!(CollaboratorKind::PreBuild.to_string(), "pre_build");
    }

    #[tokio::test]
    async fn test_unconfigured_returns_none() {
        let c = collaborators("");
        let result = c
            .invoke::<PreBuild>(&BuildCommand {
                command: "make".into(),
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_invoke_reads_stdin_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("pre_build.sh");
        std::fs::write(
            &script,
            "cat >/dev/null\necho building\necho '{\"command\": \"make test\"}'\n",
        )
        .unwrap();
        let c = collaborators(&format!("pre_build = \"sh {}\"", script.display()));
        let result = c
            .invoke::<PreBuild>(&BuildCommand {
                command: "make".into(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.command, "make test");
    }

    #[tokio::test]
    async fn test_failing_collaborator() {
        let c = collaborators(r#"sort = "sh -c 'echo nope >&2; exit 4'""#);
        let err = c
            .invoke::<Sort>(&SortRequest {
                tests: vec![],
                device: DeviceProfile {
                    name: "iPhone 15".into(),
                    runtime: "17.2".into(),
                    platform: "iOS".into(),
                    language: None,
                    locale: None,
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Failed { exit_code: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_event_sink_delivers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("events.jsonl");
        let c = collaborators(&format!(
            "event = \"sh -c 'cat >> {}; echo >> {}'\"",
            log.display(),
            log.display()
        ));

        let sink = EventSink::spawn(&c);
        sink.emit(EventKind::Start, serde_json::json!({}), serde_json::json!({}));
        sink.emit(
            EventKind::TestStarted,
            serde_json::json!({"test": "A/t1"}),
            serde_json::json!({}),
        );
        sink.emit(EventKind::Stop, serde_json::json!({}), serde_json::json!({}));
        sink.close().await;

        let content = std::fs::read_to_string(&log).unwrap();
        let kinds: Vec<String> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["input"]["kind"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(kinds, vec!["start", "testStarted", "stop"]);
    }
}
