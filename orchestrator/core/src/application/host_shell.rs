// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Thin wrapper binding a [`RemoteExecutor`] to one host and the configured
//! command timeout, plus the quoting helpers every workflow step needs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain::error::EncryptionError;
use crate::domain::host::{CommandOutput, HostId};
use crate::domain::remote::RemoteExecutor;

pub struct HostShell<'a> {
    executor: &'a Arc<dyn RemoteExecutor>,
    host: &'a HostId,
    timeout: Duration,
}

impl<'a> HostShell<'a> {
    pub fn new(executor: &'a Arc<dyn RemoteExecutor>, host: &'a HostId, timeout: Duration) -> Self {
        Self {
            executor,
            host,
            timeout,
        }
    }

    pub fn host(&self) -> &HostId {
        self.host
    }

    /// Run a command; a non-zero exit code is returned, not raised.
    pub async fn run(&self, command: &str) -> Result<CommandOutput, EncryptionError> {
        debug!(host = %self.host, "exec: {}", command);
        let output = self
            .executor
            .execute(self.host, command, self.timeout)
            .await?;
        if !output.is_success() {
            debug!(host = %self.host, "exit {}: {}", output.exit_code, output.stderr.trim());
        }
        Ok(output)
    }

    /// Run a command and turn a non-zero exit code into the error built by
    /// `on_failure`.
    pub async fn run_checked<F>(&self, command: &str, on_failure: F) -> Result<CommandOutput, EncryptionError>
    where
        F: FnOnce(&CommandOutput) -> EncryptionError,
    {
        let output = self.run(command).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(on_failure(&output))
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, EncryptionError> {
        Ok(self.run(&format!("test -e {}", quote(path))).await?.is_success())
    }

    pub async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), EncryptionError> {
        debug!(host = %self.host, "copy {:?} -> {}", local, remote);
        self.executor.copy_file(self.host, local, remote).await?;
        Ok(())
    }

    pub async fn write_file(&self, remote: &str, contents: &[u8], mode: u32) -> Result<(), EncryptionError> {
        debug!(host = %self.host, "write {} ({} bytes, mode {:o})", remote, contents.len(), mode);
        self.executor
            .write_file(self.host, remote, contents, mode)
            .await?;
        Ok(())
    }
}

/// Single-quote `value` for a POSIX shell unless it is already safe.
pub fn quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/-_.,:=+@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// `bash -c '<script>'`
pub fn bash(script: &str) -> String {
    format!("bash -c {}", quote(script))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("/dev/mapper/VG-u02"), "/dev/mapper/VG-u02");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_exists_and_checked_failures() {
        use crate::infrastructure::remote::simulated::{SimulatedFleet, SimulatedHost};

        let fleet = SimulatedFleet::new();
        fleet.add_host(SimulatedHost::new("vm01"));
        let executor: Arc<dyn RemoteExecutor> = Arc::new(fleet);
        let host = HostId::new("vm01");
        let shell = HostShell::new(&executor, &host, Duration::from_secs(5));

        assert!(tokio_test::block_on(shell.exists("/etc/fstab")).unwrap());
        assert!(!tokio_test::block_on(shell.exists("/etc/missing")).unwrap());

        let err = tokio_test::block_on(shell.run_checked("test -e /etc/missing", |out| {
            EncryptionError::preparation(format!("exit {}", out.exit_code), "create it")
        }))
        .unwrap_err();
        assert_eq!(err.resolution(), "create it");
    }

    #[test]
    fn test_bash_wraps_script() {
        assert_eq!(
            bash(r#"echo "${PIPESTATUS[@]}""#),
            r#"bash -c 'echo "${PIPESTATUS[@]}"'"#
        );
    }
}
