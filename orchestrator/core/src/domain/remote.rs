// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote Executor Trait - Anti-Corruption Layer for host access
//!
//! The workflows only ever need "run this command on host X" and "place this
//! file on host X". Session management, authentication and transport live
//! behind this trait so the workflows can be driven against a simulated
//! fleet in tests.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::domain::host::{CommandOutput, HostId};

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` through the host's shell.
    ///
    /// A non-zero exit code is reported in [`CommandOutput`], not as an
    /// error. For pipelines the exit code is whatever the host shell
    /// reports, so callers that pipe must compute status themselves.
    async fn execute(
        &self,
        host: &HostId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    /// Copy a local file to `remote_path`.
    async fn copy_file(
        &self,
        host: &HostId,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError>;

    /// Write `contents` to `remote_path` with `mode`, streaming through stdin
    /// so the contents never appear on a command line.
    async fn write_file(
        &self,
        host: &HostId,
        remote_path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("cannot connect to {host}: {cause}")]
    Unreachable { host: HostId, cause: String },

    #[error("command on {host} timed out after {timeout:?}")]
    Timeout { host: HostId, timeout: Duration },

    #[error("file transfer to {host}:{path} failed: {cause}")]
    Transfer {
        host: HostId,
        path: String,
        cause: String,
    },

    #[error("local I/O error while talking to {host}: {cause}")]
    Io { host: HostId, cause: String },
}
