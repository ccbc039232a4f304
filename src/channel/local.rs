//! Channel to the local machine.
//!
//! Commands run as child processes under the node's shell (`/bin/sh -c` by
//! default). The node environment is applied first, then the command's own.
//! File transfer is a local copy.
//!
//! | Feature | Support |
//! |---------|---------|
//! | Streaming output | Yes |
//! | Termination | Kills the child process |
//! | File transfer | Local copy operations |

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{
    CancelScope, Channel, ChannelError, ChannelResult, Command, OutputStream, spawn_streaming,
};
use crate::config::NodeConfig;

/// Runs commands as local child processes.
pub struct LocalChannel {
    node: String,
    shell: String,
    env: HashMap<String, String>,
    cancel: CancelScope,
}

impl LocalChannel {
    pub fn new(node: &NodeConfig) -> Self {
        Self {
            node: node.name.clone(),
            shell: node.shell.clone(),
            env: node.env.clone(),
            cancel: CancelScope::default(),
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn node(&self) -> &str {
        &self.node
    }

    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream> {
        // `exec` replaces the shell so a kill reaches the program itself
        let shell_cmd = format!("exec {}", cmd.to_shell_string());

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(&shell_cmd);

        for (key, value) in &self.env {
            process.env(key, value);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        if let Some(dir) = &cmd.working_dir {
            process.current_dir(shellexpand::tilde(dir).as_ref());
        }

        spawn_streaming(process, self.cancel.current())
    }

    async fn upload(&self, local: &Path, remote: &str) -> ChannelResult<()> {
        let dest = PathBuf::from(shellexpand::tilde(remote).as_ref());
        copy_path(local, &dest)
            .await
            .map_err(|e| ChannelError::UploadFailed(format!("{}: {}", local.display(), e)))
    }

    async fn download(&self, remote: &str, local: &Path) -> ChannelResult<()> {
        let src = PathBuf::from(shellexpand::tilde(remote).as_ref());
        copy_path(&src, local)
            .await
            .map_err(|e| ChannelError::DownloadFailed(format!("{}: {}", remote, e)))
    }

    async fn file_exists(&self, path: &str) -> ChannelResult<bool> {
        let path = PathBuf::from(shellexpand::tilde(path).as_ref());
        Ok(tokio::fs::try_exists(&path).await?)
    }

    fn terminate(&self) {
        self.cancel.cancel_all();
    }

    fn duplicate(&self) -> Self {
        Self {
            node: self.node.clone(),
            shell: self.shell.clone(),
            env: self.env.clone(),
            cancel: CancelScope::default(),
        }
    }
}

/// Copies a file or directory tree, creating parents as needed.
async fn copy_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src == dst {
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(src).await?.is_dir() {
        copy_dir_all(src, dst).await
    } else {
        tokio::fs::copy(src, dst).await.map(|_| ())
    }
}

/// Recursively copy a directory.
async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            Box::pin(copy_dir_all(&src_path, &dst_path)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}
