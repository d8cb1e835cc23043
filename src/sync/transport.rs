// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote transport.
//!
//! Everything the synchronizer does to a node goes through [`Transport`]:
//! run a command, upload a file, or mirror a set of directories. The default
//! implementation shells out to the OpenSSH client tools and rsync.
//!
//! # Login Failures
//!
//! Implementations must report "could not log in at all" as
//! [`TransportError::Login`], and nothing else. The synchronizer relies on
//! this to tell credential problems apart from privilege problems.

use crate::{config::KitchenConfig, path::default_ssh_config};

use async_trait::async_trait;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Output,
};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Exit status OpenSSH uses for its own failures.
const SSH_FAILURE: i32 = 255;

/// Remote host along with the way to log into it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    pub ssh_config: Option<PathBuf>,
    pub gateway: Option<String>,
}

impl Target {
    /// Construct new target with SSH defaults.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Construct target for host from kitchen configuration.
    pub fn from_config(host: impl Into<String>, config: &KitchenConfig) -> Self {
        Self {
            host: host.into(),
            user: config.userinfo.user.clone(),
            port: config.connection.port,
            identity: config.userinfo.keypair_file.clone(),
            ssh_config: config.userinfo.ssh_config.clone().or_else(default_ssh_config),
            gateway: config.connection.gateway.clone(),
        }
    }

    /// Check if target logs in as the superuser.
    pub fn is_root(&self) -> bool {
        self.user.as_deref() == Some("root")
    }

    /// SSH destination, e.g., `deploy@web1.example.com`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Combined result of a remote command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, absent if the command was killed by a signal.
    pub status: Option<i32>,

    /// Standard output followed by standard error.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Remote execution and file synchronization capability.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Run shell command on target, as superuser if `privileged` is set.
    ///
    /// A command that runs but fails is not an error, inspect the returned
    /// [`CommandOutput`] instead.
    async fn exec(&self, target: &Target, command: &str, privileged: bool)
        -> Result<CommandOutput>;

    /// Upload single local file to remote path as the login user.
    async fn put(&self, target: &Target, local: &Path, remote: &str) -> Result<()>;

    /// Mirror local directories into remote directory as superuser.
    ///
    /// Extraneous remote files inside mirrored directories are deleted.
    async fn mirror(
        &self,
        target: &Target,
        sources: &[PathBuf],
        remote_dir: &str,
        excludes: &[&str],
    ) -> Result<()>;
}

/// Transport through the OpenSSH client, scp, and rsync.
#[derive(Debug, Default, Clone)]
pub struct OpenSsh;

impl OpenSsh {
    /// Construct new OpenSSH transport.
    pub fn new() -> Self {
        Self
    }

    fn common_options(target: &Target) -> Vec<OsString> {
        let mut options: Vec<OsString> = vec!["-o".into(), "BatchMode=yes".into()];
        if let Some(identity) = &target.identity {
            options.extend(["-i".into(), identity.into()]);
        }
        if let Some(config) = &target.ssh_config {
            options.extend(["-F".into(), config.into()]);
        }
        if let Some(gateway) = &target.gateway {
            options.extend(["-J".into(), gateway.into()]);
        }

        options
    }

    fn ssh_options(target: &Target) -> Vec<OsString> {
        let mut options = Self::common_options(target);
        if let Some(port) = target.port {
            options.extend(["-p".into(), port.to_string().into()]);
        }

        options
    }

    fn login_error(target: &Target, output: &Output) -> TransportError {
        TransportError::Login {
            host: target.host.clone(),
            message: String::from_utf8_lossy(&output.stderr).trim_end().into(),
        }
    }
}

#[async_trait]
impl Transport for OpenSsh {
    #[instrument(skip(self, target), fields(host = %target.host), level = "debug")]
    async fn exec(
        &self,
        target: &Target,
        command: &str,
        privileged: bool,
    ) -> Result<CommandOutput> {
        let remote = if privileged && !target.is_root() {
            format!("sudo -n sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        };

        let mut args = Self::ssh_options(target);
        args.push(target.destination().into());
        args.push(remote.into());
        let output = syscall("ssh", args).await?;
        if output.status.code() == Some(SSH_FAILURE) {
            return Err(Self::login_error(target, &output));
        }

        Ok(CommandOutput {
            status: output.status.code(),
            output: combine(&output),
        })
    }

    #[instrument(skip(self, target), fields(host = %target.host), level = "debug")]
    async fn put(&self, target: &Target, local: &Path, remote: &str) -> Result<()> {
        let mut args = Self::common_options(target);
        if let Some(port) = target.port {
            args.extend(["-P".into(), port.to_string().into()]);
        }
        args.push(local.into());
        args.push(format!("{}:{remote}", target.destination()).into());

        let output = syscall("scp", args).await?;
        if !output.status.success() {
            return Err(TransportError::Failed {
                command: "scp".into(),
                message: combine(&output),
            });
        }

        Ok(())
    }

    #[instrument(skip(self, target, sources), fields(host = %target.host), level = "debug")]
    async fn mirror(
        &self,
        target: &Target,
        sources: &[PathBuf],
        remote_dir: &str,
        excludes: &[&str],
    ) -> Result<()> {
        let shell = std::iter::once(OsString::from("ssh"))
            .chain(Self::ssh_options(target))
            .map(|arg| shell_quote(&arg.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ");

        let mut args: Vec<OsString> = vec!["-az".into(), "--delete".into()];
        for exclude in excludes {
            args.push(format!("--exclude={exclude}").into());
        }
        args.extend(["-e".into(), shell.into()]);
        if !target.is_root() {
            args.extend(["--rsync-path".into(), "sudo rsync".into()]);
        }
        args.extend(sources.iter().map(OsString::from));
        args.push(format!("{}:{remote_dir}", target.destination()).into());

        let output = syscall("rsync", args).await?;
        if !output.status.success() {
            return Err(TransportError::Failed {
                command: "rsync".into(),
                message: combine(&output),
            });
        }

        Ok(())
    }
}

async fn syscall(cmd: &str, args: Vec<OsString>) -> Result<Output> {
    debug!("{cmd} {args:?}");
    Command::new(cmd)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| TransportError::Spawn {
            command: cmd.into(),
            source,
        })
}

fn combine(output: &Output) -> String {
    let mut message = String::from_utf8_lossy(&output.stdout).into_owned();
    message.push_str(&String::from_utf8_lossy(&output.stderr));

    message
}

/// Quote string for POSIX shell.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// All possible error types for remote transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Cannot log into target at all.
    #[error("cannot log in to {host:?}: {message}")]
    Login { host: String, message: String },

    /// Local helper program cannot be started.
    #[error("failed to run {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// Transfer ran but failed.
    #[error("{command} failed:\n{message}")]
    Failed { command: String, message: String },
}

/// Friendly result alias :3
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
