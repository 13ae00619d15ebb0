// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! OpenSSH-backed remote executor.
//!
//! Shells out to the system `ssh`/`scp` binaries in batch mode so host keys,
//! agents and `~/.ssh/config` behave exactly as they do for an operator.
//! Exit status 255 is ssh's own failure and is reported as unreachable.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::application::host_shell::quote;
use crate::domain::config::RemoteConfig;
use crate::domain::host::{CommandOutput, HostId};
use crate::domain::remote::{RemoteError, RemoteExecutor};

const SSH_FAILURE_EXIT_CODE: i32 = 255;

pub struct SshExecutor {
    config: RemoteConfig,
}

impl SshExecutor {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    fn common_options(&self, command: &mut Command) {
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs));
        if let Some(identity) = &self.config.identity_file {
            command.arg("-i").arg(identity);
        }
    }

    fn destination(&self, host: &HostId) -> String {
        format!("{}@{}", self.config.user, host)
    }

    fn ssh(&self, host: &HostId, remote_command: &str) -> Command {
        let mut command = Command::new(&self.config.ssh_binary);
        self.common_options(&mut command);
        command
            .arg(self.destination(host))
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn to_output(host: &HostId, output: std::process::Output) -> Result<CommandOutput, RemoteError> {
        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code == SSH_FAILURE_EXIT_CODE {
            return Err(RemoteError::Unreachable {
                host: host.clone(),
                cause: stderr.trim().to_string(),
            });
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code,
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &HostId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let child = self.ssh(host, command).output();
        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => Self::to_output(host, output),
            Ok(Err(e)) => Err(RemoteError::Io {
                host: host.clone(),
                cause: format!("failed to run {}: {}", self.config.ssh_binary, e),
            }),
            Err(_) => Err(RemoteError::Timeout {
                host: host.clone(),
                timeout,
            }),
        }
    }

    async fn copy_file(
        &self,
        host: &HostId,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        debug!(host = %host, "scp {:?} -> {}", local_path, remote_path);
        let mut command = Command::new(&self.config.scp_binary);
        self.common_options(&mut command);
        let output = command
            .arg("-q")
            .arg(local_path)
            .arg(format!("{}:{}", self.destination(host), remote_path))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let timeout = self.config.command_timeout;
        let output = match tokio::time::timeout(timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RemoteError::Io {
                    host: host.clone(),
                    cause: format!("failed to run {}: {}", self.config.scp_binary, e),
                })
            }
            Err(_) => {
                return Err(RemoteError::Timeout {
                    host: host.clone(),
                    timeout,
                })
            }
        };
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer {
                host: host.clone(),
                path: remote_path.to_string(),
                cause: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn write_file(
        &self,
        host: &HostId,
        remote_path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RemoteError> {
        let path = quote(remote_path);
        let script = format!("umask 077; cat > {p} && chmod {:o} {p}", mode, p = path);
        let io_error = |e: std::io::Error| RemoteError::Io {
            host: host.clone(),
            cause: e.to_string(),
        };

        let mut child = self
            .ssh(host, &script)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(io_error)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents).await.map_err(io_error)?;
            stdin.shutdown().await.map_err(io_error)?;
        }

        let timeout = self.config.command_timeout;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(io_error)?,
            Err(_) => {
                return Err(RemoteError::Timeout {
                    host: host.clone(),
                    timeout,
                })
            }
        };
        let output = Self::to_output(host, output)?;
        if output.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer {
                host: host.clone(),
                path: remote_path.to_string(),
                cause: output.describe(),
            })
        }
    }
}
