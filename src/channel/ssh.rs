//! Channel to a remote Mac over SSH.
//!
//! Uses the system `ssh` and `scp` binaries for maximum compatibility. Each
//! command spawns a fresh `ssh` process; environment exports and the working
//! directory change happen inside the remote command string:
//!
//! ```sh
//! ssh [options] user@host "export KEY='value'; cd '/path'; command"
//! ```
//!
//! # Authentication
//!
//! | `auth.type` | Mechanism |
//! |-------------|-----------|
//! | `none` | Whatever `ssh` picks up from its own configuration |
//! | `key` | `-i <path>` with `IdentitiesOnly=yes` |
//! | `agent` | Keys from `SSH_AUTH_SOCK` |
//! | `password` | `sshpass -e`, password read from the configured variable |
//!
//! # Security Considerations
//!
//! - Prefer key or agent authentication over passwords
//! - Keep `disable_host_key_check = false` outside of throwaway CI hosts

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use super::{
    CancelScope, Channel, ChannelError, ChannelResult, Command, FailurePolicy, OutputStream,
    spawn_streaming,
};
use crate::config::{AuthConfig, NodeConfig};

/// Markers `ssh` prints on stderr when authentication fails.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "Permission denied",
    "Too many authentication failures",
    "Host key verification failed",
];

/// Exit code `ssh` uses for its own errors.
const SSH_ERROR_EXIT: i32 = 255;

/// Executes commands on a remote host via SSH.
pub struct SshChannel {
    node: String,
    host: String,
    user: String,
    port: u16,
    /// `-o`/`-i` options shared by `ssh` and `scp`.
    opts: Vec<String>,
    password: Option<String>,
    env: HashMap<String, String>,
    cancel: CancelScope,
}

impl SshChannel {
    /// Builds a channel from the node's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Auth`] if password authentication is
    /// configured but the password variable is not set.
    pub fn new(node: &NodeConfig) -> ChannelResult<Self> {
        let mut opts = vec![
            "-o".to_string(),
            "ConnectTimeout=30".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
        ];

        if node.disable_host_key_check {
            opts.push("-o".to_string());
            opts.push("StrictHostKeyChecking=no".to_string());
            opts.push("-o".to_string());
            opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        let mut password = None;
        match &node.auth {
            AuthConfig::None | AuthConfig::Agent => {
                opts.push("-o".to_string());
                opts.push("BatchMode=yes".to_string());
            }
            AuthConfig::Key { path } => {
                let key = shellexpand::tilde(&path.to_string_lossy()).into_owned();
                opts.push("-o".to_string());
                opts.push("BatchMode=yes".to_string());
                opts.push("-o".to_string());
                opts.push("IdentitiesOnly=yes".to_string());
                opts.push("-i".to_string());
                opts.push(key);
            }
            AuthConfig::Password { password_env } => {
                let value = std::env::var(password_env).map_err(|_| ChannelError::Auth {
                    node: node.name.clone(),
                    message: format!("password variable {} is not set", password_env),
                })?;
                opts.push("-o".to_string());
                opts.push("PreferredAuthentications=password,keyboard-interactive".to_string());
                opts.push("-o".to_string());
                opts.push("PubkeyAuthentication=no".to_string());
                password = Some(value);
            }
        }

        Ok(Self {
            node: node.name.clone(),
            host: node.address.clone(),
            user: node.user.clone().unwrap_or_default(),
            port: node.port,
            opts,
            password,
            env: node.env.clone(),
            cancel: CancelScope::default(),
        })
    }

    /// Build the SSH destination string.
    fn ssh_dest(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    /// Starts `program`, going through `sshpass` for password auth.
    fn base_command(&self, program: &str) -> tokio::process::Command {
        match &self.password {
            Some(password) => {
                let mut cmd = tokio::process::Command::new("sshpass");
                cmd.arg("-e").arg(program);
                cmd.env("SSHPASS", password);
                cmd
            }
            None => tokio::process::Command::new(program),
        }
    }

    /// Wraps the command with env exports and `cd` for the remote shell.
    fn remote_command_string(&self, cmd: &Command) -> String {
        let mut full_cmd = String::new();

        let mut node_env: Vec<_> = self.env.iter().collect();
        node_env.sort();
        for (key, value) in node_env.into_iter().chain(cmd.env.iter().map(|(k, v)| (k, v))) {
            full_cmd.push_str(&format!(
                "export {}='{}'; ",
                key,
                value.replace('\'', "'\\''")
            ));
        }

        if let Some(dir) = &cmd.working_dir {
            full_cmd.push_str(&format!("cd '{}' && ", dir.replace('\'', "'\\''")));
        }

        full_cmd.push_str(&cmd.to_shell_string());
        full_cmd
    }

    async fn scp(&self, from: &str, to: &str) -> Result<(), String> {
        let mut scp = self.base_command("scp");
        scp.arg("-r")
            .arg("-P")
            .arg(self.port.to_string())
            .args(&self.opts)
            .arg(from)
            .arg(to)
            .kill_on_drop(true);

        let output = scp.output().await.map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    fn classify_transfer(&self, message: String, fallback: fn(String) -> ChannelError) -> ChannelError {
        if AUTH_FAILURE_MARKERS.iter().any(|m| message.contains(m)) {
            ChannelError::Auth {
                node: self.node.clone(),
                message,
            }
        } else {
            fallback(message)
        }
    }
}

#[async_trait]
impl Channel for SshChannel {
    fn node(&self) -> &str {
        &self.node
    }

    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream> {
        let mut ssh = self.base_command("ssh");
        ssh.arg("-T")
            .arg("-p")
            .arg(self.port.to_string())
            .args(&self.opts)
            .arg(self.ssh_dest())
            .arg(self.remote_command_string(cmd));

        spawn_streaming(ssh, self.cancel.current())
    }

    async fn upload(&self, local: &Path, remote: &str) -> ChannelResult<()> {
        if let Some(parent) = Path::new(remote).parent().filter(|p| !p.as_os_str().is_empty()) {
            let mkdir = Command::new("mkdir")
                .arg("-p")
                .arg(parent.to_string_lossy().to_string())
                .policy(FailurePolicy::Error);
            self.execute(&mkdir, None).await?;
        }

        let target = format!("{}:{}", self.ssh_dest(), remote);
        self.scp(&local.to_string_lossy(), &target)
            .await
            .map_err(|e| self.classify_transfer(e, ChannelError::UploadFailed))
    }

    async fn download(&self, remote: &str, local: &Path) -> ChannelResult<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ChannelError::DownloadFailed(e.to_string()))?;
        }

        let source = format!("{}:{}", self.ssh_dest(), remote);
        self.scp(&source, &local.to_string_lossy())
            .await
            .map_err(|e| self.classify_transfer(e, ChannelError::DownloadFailed))
    }

    fn terminate(&self) {
        self.cancel.cancel_all();
    }

    fn duplicate(&self) -> Self {
        Self {
            node: self.node.clone(),
            host: self.host.clone(),
            user: self.user.clone(),
            port: self.port,
            opts: self.opts.clone(),
            password: self.password.clone(),
            env: self.env.clone(),
            cancel: CancelScope::default(),
        }
    }

    fn classify_exit(&self, exit_code: i32, stderr: &str) -> Option<ChannelError> {
        if exit_code != SSH_ERROR_EXIT {
            return None;
        }
        let message = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("ssh exited with 255")
            .trim()
            .to_string();
        if AUTH_FAILURE_MARKERS.iter().any(|m| stderr.contains(m)) {
            Some(ChannelError::Auth {
                node: self.node.clone(),
                message,
            })
        } else {
            Some(ChannelError::Connection {
                node: self.node.clone(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(extra: &str) -> NodeConfig {
        toml::from_str(&format!(
            "name = \"mini\"\naddress = \"mini.lan\"\nuser = \"ci\"\nport = 2222\n{}",
            extra
        ))
        .unwrap()
    }

    #[test]
    fn test_key_auth_options() {
        let channel = SshChannel::new(&node(
            "auth = { type = \"key\", path = \"/keys/id_ed25519\" }",
        ))
        .unwrap();
        assert!(channel.opts.contains(&"BatchMode=yes".to_string()));
        assert!(channel.opts.contains(&"/keys/id_ed25519".to_string()));
        assert_eq!(channel.ssh_dest(), "ci@mini.lan");
        assert!(channel.password.is_none());
    }

    #[test]
    fn test_missing_password_variable_is_auth_error() {
        let err = SshChannel::new(&node(
            "auth = { type = \"password\", password_env = \"SIMFLEET_TEST_UNSET_PASSWORD_VAR\" }",
        ))
        .err()
        .unwrap();
        assert!(err.is_auth());
    }

    #[test]
    fn test_remote_command_string() {
        let channel = SshChannel::new(&node("[env]\nDEVELOPER_DIR = \"/Applications/Xcode.app\""))
            .unwrap();
        let cmd = Command::new("xcrun")
            .args(["simctl", "list"])
            .working_dir("/tmp/simfleet")
            .env("LANG", "en_US.UTF-8");
        assert_eq!(
            channel.remote_command_string(&cmd),
            "export DEVELOPER_DIR='/Applications/Xcode.app'; export LANG='en_US.UTF-8'; \
             cd '/tmp/simfleet' && xcrun simctl list"
        );
    }

    #[test]
    fn test_classify_exit() {
        let channel = SshChannel::new(&node("")).unwrap();
        assert!(channel.classify_exit(0, "").is_none());
        assert!(channel.classify_exit(65, "Permission denied").is_none());

        let auth = channel
            .classify_exit(255, "ci@mini.lan: Permission denied (publickey).\n")
            .unwrap();
        assert!(auth.is_auth());

        let conn = channel
            .classify_exit(255, "ssh: connect to host mini.lan port 2222: Connection refused\n")
            .unwrap();
        assert!(matches!(conn, ChannelError::Connection { .. }));
        assert!(conn.is_infra());
    }
}
