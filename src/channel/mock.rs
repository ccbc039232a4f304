//! Scripted channel used by unit tests.
//!
//! Every command is answered by a handler returning a [`Script`]: a list of
//! steps (output lines, sleeps, waits) and an exit code. Steps run on a
//! spawned task so paused-clock tests observe real idle gaps.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use super::{
    CancelScope, Channel, ChannelError, ChannelProvider, ChannelResult, Command, OutputLine,
    OutputStream,
};
use crate::config::NodeConfig;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Out(String),
    Err(String),
    Sleep(Duration),
    /// Blocks until a `simctl terminate` command reaches the same node.
    UntilAppTerminated,
}

#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub steps: Vec<Step>,
    pub exit_code: i32,
}

impl Script {
    pub fn ok(stdout: &str) -> Self {
        Self {
            steps: stdout.lines().map(|l| Step::Out(l.to_string())).collect(),
            exit_code: 0,
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            steps: Vec::new(),
            exit_code: code,
        }
    }

    pub fn steps(steps: Vec<Step>, exit_code: i32) -> Self {
        Self { steps, exit_code }
    }
}

pub(crate) type Handler = Arc<dyn Fn(&str, &Command) -> Script + Send + Sync>;

/// State shared by every duplicate of a mock channel.
struct Shared {
    handler: Handler,
    calls: Mutex<Vec<String>>,
    app_terminated: Notify,
}

pub(crate) struct MockChannel {
    node: String,
    shared: Arc<Shared>,
    cancel: CancelScope,
}

impl MockChannel {
    pub fn new(node: &str, handler: Handler) -> Self {
        Self {
            node: node.to_string(),
            shared: Arc::new(Shared {
                handler,
                calls: Mutex::new(Vec::new()),
                app_terminated: Notify::new(),
            }),
            cancel: CancelScope::default(),
        }
    }

    /// Shell strings of every command seen by this channel and its duplicates.
    pub fn calls(&self) -> Vec<String> {
        self.shared.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn node(&self) -> &str {
        &self.node
    }

    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream> {
        let line = cmd.to_shell_string();
        self.shared.calls.lock().unwrap().push(line.clone());
        if line.contains("simctl terminate") {
            self.shared.app_terminated.notify_one();
        }

        let script = (self.shared.handler)(&self.node, cmd);
        let shared = self.shared.clone();
        let cancel = self.cancel.current();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            for step in script.steps {
                let line = match step {
                    Step::Out(s) => OutputLine::Stdout(s),
                    Step::Err(s) => OutputLine::Stderr(s),
                    Step::Sleep(d) => {
                        tokio::select! {
                            _ = tokio::time::sleep(d) => continue,
                            _ = cancel.cancelled() => {
                                let _ = tx.send(OutputLine::ExitCode(-1)).await;
                                return;
                            }
                        }
                    }
                    Step::UntilAppTerminated => {
                        tokio::select! {
                            _ = shared.app_terminated.notified() => continue,
                            _ = cancel.cancelled() => {
                                let _ = tx.send(OutputLine::ExitCode(-1)).await;
                                return;
                            }
                        }
                    }
                };
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(OutputLine::ExitCode(script.exit_code)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn upload(&self, local: &Path, remote: &str) -> ChannelResult<()> {
        self.shared
            .calls
            .lock()
            .unwrap()
            .push(format!("upload {} {}", local.display(), remote));
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> ChannelResult<()> {
        self.shared
            .calls
            .lock()
            .unwrap()
            .push(format!("download {} {}", remote, local.display()));
        Ok(())
    }

    fn terminate(&self) {
        self.cancel.cancel_all();
    }

    fn duplicate(&self) -> Self {
        Self {
            node: self.node.clone(),
            shared: self.shared.clone(),
            cancel: CancelScope::default(),
        }
    }

    fn classify_exit(&self, exit_code: i32, stderr: &str) -> Option<ChannelError> {
        (exit_code == 255).then(|| ChannelError::Connection {
            node: self.node.clone(),
            message: stderr.trim().to_string(),
        })
    }
}

/// Hands out mock channels sharing one handler.
pub(crate) struct MockProvider {
    handler: Handler,
}

impl MockProvider {
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }
}

impl ChannelProvider for MockProvider {
    type Channel = MockChannel;

    fn connect(&self, node: &NodeConfig) -> ChannelResult<MockChannel> {
        Ok(MockChannel::new(&node.name, self.handler.clone()))
    }
}
