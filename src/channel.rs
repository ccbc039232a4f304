//! Remote command channels to the nodes of the pool.
//!
//! A channel executes shell commands on a single named node and streams their
//! output back line by line. The local machine is reached through a plain
//! subprocess, remote Macs through the system `ssh` and `scp` binaries.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ChannelProvider                          │
//! │  connect(NodeConfig) ───────► Channel                        │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Channel                              │
//! │  exec_stream(Command) ───► OutputStream                      │
//! │  execute(Command, on_progress) ───► ExecResult               │
//! │  upload(local, remote) / download(remote, local)             │
//! │  file_exists(path)                                           │
//! │  terminate()  kills every in-flight command of this handle   │
//! │  duplicate()  fresh handle, same node and credentials        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Error Handling
//!
//! All channel operations return [`ChannelResult<T>`]. Authentication
//! failures are reported as [`ChannelError::Auth`] and are never retried;
//! transport failures ([`ChannelError::Connection`], [`ChannelError::Timeout`])
//! are infrastructure errors the caller may retry.

pub mod local;
pub mod ssh;

#[cfg(test)]
pub(crate) mod mock;

use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use futures::Stream;
use futures::stream::{self, StreamExt};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;

pub use local::LocalChannel;
pub use ssh::SshChannel;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur while talking to a node.
///
/// - **Fatal**: `Auth` - bad credentials never get better on retry
/// - **Infrastructure**: `Connection`, `Timeout`, `ExecFailed`, transfers
/// - **Command**: `NonZeroExit` - the command ran and failed
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Authentication against the node failed.
    #[error("Authentication failed for node {node}: {message}")]
    Auth { node: String, message: String },

    /// The transport to the node failed.
    #[error("Connection to node {node} failed: {message}")]
    Connection { node: String, message: String },

    /// The command could not be started.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// The command exited with a code its failure policy does not accept.
    #[error("Command `{command}` exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Failed to upload a file to the node.
    #[error("Failed to upload file: {0}")]
    UploadFailed(String),

    /// Failed to download a file from the node.
    #[error("Failed to download file: {0}")]
    DownloadFailed(String),

    /// I/O error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Returns `true` for failures of the transport rather than the command.
    pub fn is_infra(&self) -> bool {
        !matches!(self, ChannelError::Auth { .. } | ChannelError::NonZeroExit { .. })
    }

    /// Returns `true` for authentication failures.
    pub fn is_auth(&self) -> bool {
        matches!(self, ChannelError::Auth { .. })
    }
}

/// What a non-zero exit code means for [`Channel::execute`].
#[derive(Debug, Clone, Default)]
pub enum FailurePolicy {
    /// Non-zero exit is an error.
    #[default]
    Error,
    /// Exit codes are returned as-is.
    Ignore,
    /// Non-zero exit is accepted when the output matches one of the patterns.
    Tolerate(Vec<Regex>),
}

impl FailurePolicy {
    /// Tolerates output containing any of the given literal fragments.
    pub fn tolerate_literals(fragments: &[&str]) -> Self {
        FailurePolicy::Tolerate(
            fragments
                .iter()
                .filter_map(|f| Regex::new(&regex::escape(f)).ok())
                .collect(),
        )
    }

    fn accepts(&self, exit_code: i32, output: &str) -> bool {
        match self {
            _ if exit_code == 0 => true,
            FailurePolicy::Error => false,
            FailurePolicy::Ignore => true,
            FailurePolicy::Tolerate(patterns) => patterns.iter().any(|p| p.is_match(output)),
        }
    }
}

/// A command to execute on a node.
///
/// # Example
///
/// ```
/// use simfleet::channel::Command;
///
/// let cmd = Command::new("xcrun")
///     .args(["simctl", "boot", "0D1F3E2A"])
///     .working_dir("/tmp/simfleet")
///     .env("SIMCTL_CHILD_LANG", "en")
///     .timeout(120);
///
/// assert_eq!(cmd.program, "xcrun");
/// assert_eq!(cmd.to_shell_string(), "xcrun simctl boot 0D1F3E2A");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    pub working_dir: Option<String>,

    /// Environment variables for this command, applied after the node's.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds, enforced by [`Channel::execute`].
    pub timeout_secs: Option<u64>,

    /// How [`Channel::execute`] treats a non-zero exit code.
    pub failure_policy: FailurePolicy,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
            failure_policy: FailurePolicy::Error,
        }
    }

    /// Runs a script through `sh -c` on the node.
    pub fn script(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Converts the command to a shell-executable string.
    ///
    /// ```
    /// use simfleet::channel::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Result of executing a command on a node.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: std::time::Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A single line of output from a streaming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A line from standard output.
    Stdout(String),
    /// A line from standard error.
    Stderr(String),
    /// The exit code of the command (yielded last, after all output).
    ExitCode(i32),
}

/// A stream of output lines from a command.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// Callback receiving every output line of [`Channel::execute`] as it arrives.
pub type ProgressCallback<'a> = dyn Fn(&OutputLine) + Send + Sync + 'a;

/// A command channel bound to one node.
///
/// Handles are cheap. Every worker owns its own handle obtained through
/// [`duplicate`](Self::duplicate) so that [`terminate`](Self::terminate)
/// only affects the commands that worker started.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Name of the node this channel talks to.
    fn node(&self) -> &str;

    /// Starts a command and streams its output.
    ///
    /// The stream ends with exactly one [`OutputLine::ExitCode`].
    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream>;

    /// Runs a command to completion.
    ///
    /// Every line is handed to `on_progress` and accumulated in the result.
    /// Transport failures are classified with
    /// [`classify_exit`](Self::classify_exit) before the command's
    /// [`FailurePolicy`] is applied.
    async fn execute(
        &self,
        cmd: &Command,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> ChannelResult<ExecResult> {
        let start = Instant::now();
        let mut stream = self.exec_stream(cmd).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = -1;

        let collect = async {
            while let Some(line) = stream.next().await {
                if let Some(callback) = on_progress {
                    callback(&line);
                }
                match line {
                    OutputLine::Stdout(s) => {
                        stdout.push_str(&s);
                        stdout.push('\n');
                    }
                    OutputLine::Stderr(s) => {
                        stderr.push_str(&s);
                        stderr.push('\n');
                    }
                    OutputLine::ExitCode(code) => exit_code = code,
                }
            }
        };

        match cmd.timeout_secs {
            Some(secs) => tokio::time::timeout(std::time::Duration::from_secs(secs), collect)
                .await
                .map_err(|_| {
                    ChannelError::Timeout(format!(
                        "`{}` on {} after {}s",
                        cmd.to_shell_string(),
                        self.node(),
                        secs
                    ))
                })?,
            None => collect.await,
        }

        if let Some(err) = self.classify_exit(exit_code, &stderr) {
            return Err(err);
        }

        let combined = format!("{}{}", stdout, stderr);
        if !cmd.failure_policy.accepts(exit_code, &combined) {
            return Err(ChannelError::NonZeroExit {
                command: cmd.to_shell_string(),
                exit_code,
                stdout,
                stderr,
            });
        }

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    /// Copies a local file or directory to the node.
    async fn upload(&self, local: &Path, remote: &str) -> ChannelResult<()>;

    /// Copies a file or directory from the node to the local machine.
    async fn download(&self, remote: &str, local: &Path) -> ChannelResult<()>;

    /// Checks whether a path exists on the node.
    async fn file_exists(&self, path: &str) -> ChannelResult<bool> {
        let cmd = Command::new("test")
            .arg("-e")
            .arg(path)
            .policy(FailurePolicy::Ignore);
        Ok(self.execute(&cmd, None).await?.success())
    }

    /// Kills every in-flight command started through this handle.
    ///
    /// Commands started afterwards run normally.
    fn terminate(&self);

    /// A fresh handle bound to the same node and credentials.
    ///
    /// Cancellation state is not shared with this handle.
    fn duplicate(&self) -> Self
    where
        Self: Sized;

    /// Transport-level classification of a finished command.
    fn classify_exit(&self, _exit_code: i32, _stderr: &str) -> Option<ChannelError> {
        None
    }
}

/// Factory creating channels for configured nodes.
pub trait ChannelProvider: Send + Sync {
    /// The concrete [`Channel`] type created by this provider.
    type Channel: Channel + 'static;

    /// Opens a channel to the node.
    ///
    /// Fails with [`ChannelError::Auth`] when the node's credentials cannot
    /// be resolved.
    fn connect(&self, node: &NodeConfig) -> ChannelResult<Self::Channel>;
}

/// Channel to either the local machine or an SSH host.
pub enum NodeChannel {
    Local(LocalChannel),
    Ssh(SshChannel),
}

impl NodeChannel {
    /// Opens the channel matching the node's address.
    pub fn connect(node: &NodeConfig) -> ChannelResult<Self> {
        if node.is_local() {
            Ok(NodeChannel::Local(LocalChannel::new(node)))
        } else {
            Ok(NodeChannel::Ssh(SshChannel::new(node)?))
        }
    }
}

#[async_trait]
impl Channel for NodeChannel {
    fn node(&self) -> &str {
        match self {
            NodeChannel::Local(c) => c.node(),
            NodeChannel::Ssh(c) => c.node(),
        }
    }

    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream> {
        match self {
            NodeChannel::Local(c) => c.exec_stream(cmd).await,
            NodeChannel::Ssh(c) => c.exec_stream(cmd).await,
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> ChannelResult<()> {
        match self {
            NodeChannel::Local(c) => c.upload(local, remote).await,
            NodeChannel::Ssh(c) => c.upload(local, remote).await,
        }
    }

    async fn download(&self, remote: &str, local: &Path) -> ChannelResult<()> {
        match self {
            NodeChannel::Local(c) => c.download(remote, local).await,
            NodeChannel::Ssh(c) => c.download(remote, local).await,
        }
    }

    fn terminate(&self) {
        match self {
            NodeChannel::Local(c) => c.terminate(),
            NodeChannel::Ssh(c) => c.terminate(),
        }
    }

    fn duplicate(&self) -> Self {
        match self {
            NodeChannel::Local(c) => NodeChannel::Local(c.duplicate()),
            NodeChannel::Ssh(c) => NodeChannel::Ssh(c.duplicate()),
        }
    }

    fn classify_exit(&self, exit_code: i32, stderr: &str) -> Option<ChannelError> {
        match self {
            NodeChannel::Local(c) => c.classify_exit(exit_code, stderr),
            NodeChannel::Ssh(c) => c.classify_exit(exit_code, stderr),
        }
    }
}

/// Provider opening local or SSH channels from the node configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemChannels;

impl ChannelProvider for SystemChannels {
    type Channel = NodeChannel;

    fn connect(&self, node: &NodeConfig) -> ChannelResult<NodeChannel> {
        NodeChannel::connect(node)
    }
}

/// Cancellation scope shared by the commands of one channel handle.
///
/// `terminate` cancels the current token and installs a fresh one.
#[derive(Debug, Default)]
pub(crate) struct CancelScope {
    token: Mutex<CancellationToken>,
}

impl CancelScope {
    pub(crate) fn current(&self) -> CancellationToken {
        match self.token.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn cancel_all(&self) {
        let mut token = match self.token.lock() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// Spawns a process and streams its merged stdout/stderr.
///
/// The child is killed when `cancel` fires or the stream is dropped. The
/// exit code is always yielded last.
pub(crate) fn spawn_streaming(
    mut process: tokio::process::Command,
    cancel: CancellationToken,
) -> ChannelResult<OutputStream> {
    process
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = process
        .spawn()
        .map_err(|e| ChannelError::ExecFailed(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ChannelError::ExecFailed("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ChannelError::ExecFailed("stderr not captured".to_string()))?;

    let stdout_stream = lossy_lines(stdout).map(OutputLine::Stdout);
    let stderr_stream = lossy_lines(stderr).map(OutputLine::Stderr);
    let mut combined = Box::pin(stream::select(stdout_stream, stderr_stream));

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut killed = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !killed => {
                    let _ = child.start_kill();
                    killed = true;
                }
                _ = tx.closed() => {
                    let _ = child.start_kill();
                    return;
                }
                line = combined.next() => match line {
                    Some(line) => {
                        if tx.send(line).await.is_err() {
                            let _ = child.start_kill();
                            return;
                        }
                    }
                    None => break,
                },
            }
        }
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        };
        let _ = tx.send(OutputLine::ExitCode(code)).await;
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

/// Splits a byte stream into lines, replacing invalid UTF-8.
///
/// Line terminators (`\n` or `\r\n`) are stripped. The stream ends at EOF
/// or on the first read error.
fn lossy_lines<R>(reader: R) -> impl Stream<Item = String> + Send
where
    R: AsyncRead + Unpin + Send,
{
    stream::unfold(BufReader::new(reader), |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some((String::from_utf8_lossy(&buf).into_owned(), reader))
            }
            Err(e) => {
                tracing::debug!("Output stream read failed: {}", e);
                None
            }
        }
    })
}

/// Escape a string for use in a shell command.
pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@' | ',')
        })
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_string_escaping() {
        let cmd = Command::new("xcodebuild")
            .arg("-only-testing:AppUITests/LoginTests/testLogin")
            .arg("it's");
        assert_eq!(
            cmd.to_shell_string(),
            "xcodebuild -only-testing:AppUITests/LoginTests/testLogin 'it'\\''s'"
        );
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_failure_policy() {
        assert!(FailurePolicy::Error.accepts(0, ""));
        assert!(!FailurePolicy::Error.accepts(1, ""));
        assert!(FailurePolicy::Ignore.accepts(3, ""));

        let policy = FailurePolicy::tolerate_literals(&["current state: Booted"]);
        assert!(policy.accepts(149, "Unable to boot device in current state: Booted"));
        assert!(!policy.accepts(149, "Invalid device"));
    }

    #[test]
    fn test_error_classes() {
        let auth = ChannelError::Auth {
            node: "mini".into(),
            message: "Permission denied".into(),
        };
        assert!(auth.is_auth());
        assert!(!auth.is_infra());
        assert!(ChannelError::Timeout("x".into()).is_infra());
    }

    #[test]
    fn test_cancel_scope_resets() {
        let scope = CancelScope::default();
        let first = scope.current();
        scope.cancel_all();
        assert!(first.is_cancelled());
        assert!(!scope.current().is_cancelled());
    }
}
