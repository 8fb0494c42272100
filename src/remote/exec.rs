//! Shell execution on remote hosts. The trait is the seam that tests mock;
//! production goes through `ssh`/`scp`.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Exit status and combined trimmed output of one remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one shell command on the remote host and wait for it to exit.
    async fn run(&self, cmd: &str) -> Result<ExecOutput>;

    /// Copy a local file to a path on the remote host.
    async fn copy_to(&self, local: &Path, remote: &str) -> Result<ExecOutput>;
}

/// Runs commands over ssh as `user@host`. Host key checking is disabled:
/// lab endpoints get reinstalled often enough that known_hosts churn would
/// break every run.
pub struct SshRunner {
    user: String,
    host: String,
}

const SSH_OPTIONS: [&str; 6] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=error",
];

impl SshRunner {
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, cmd: &str) -> Result<ExecOutput> {
        debug!(host = %self.host, %cmd, "running remote command");
        let out = tokio::process::Command::new("ssh")
            .args(SSH_OPTIONS)
            .arg(format!("{}@{}", self.user, self.host))
            .arg(cmd)
            .output()
            .await
            .with_context(|| format!("failed to run ssh to {}", self.host))?;

        let mut output = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if !out.status.success() && output.is_empty() {
            output = String::from_utf8_lossy(&out.stderr).trim().to_string();
        }
        Ok(ExecOutput {
            status: out.status.code().unwrap_or(-1),
            output,
        })
    }

    async fn copy_to(&self, local: &Path, remote: &str) -> Result<ExecOutput> {
        debug!(host = %self.host, local = %local.display(), %remote, "copying file to remote");
        let out = tokio::process::Command::new("scp")
            .args(SSH_OPTIONS)
            .arg(local)
            .arg(format!("{}@{}:{}", self.user, self.host, remote))
            .output()
            .await
            .with_context(|| format!("failed to run scp to {}", self.host))?;

        Ok(ExecOutput {
            status: out.status.code().unwrap_or(-1),
            output: String::from_utf8_lossy(&out.stdout).trim().to_string(),
        })
    }
}
