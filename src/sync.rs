// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Node synchronization.
//!
//! Configuring a node is a strictly ordered sequence of steps:
//!
//! 1. skip placeholder nodes marked as dummy,
//! 2. make sure the remote work path exists,
//! 3. write the Chef Solo configuration,
//! 4. discover the IP address of the node if unknown,
//! 5. persist the node configuration locally,
//! 6. upload node configuration and mirror the kitchen,
//! 7. run Chef Solo and classify its outcome,
//! 8. clean up transient remote and local state.
//!
//! Step 8 runs no matter how steps 3 through 7 went, see [`RemoteLease`].
//!
//! # Batches
//!
//! All nodes of a batch share one node data bag. It is built once before
//! any worker starts, and removed once after every worker finished. Workers
//! only share read-only state, and each one works on its own node, its own
//! staging files, and its own remote session.

pub mod solo;
pub mod transport;

pub use transport::{CommandOutput, OpenSsh, Target, Transport, TransportError};

use crate::{
    config::{KitchenConfig, SyncPackages},
    databag::{data_bag_id, DataBagError, NodeDataBag, NODE_DATA_BAG},
    kitchen::{write_json, Kitchen, KitchenError, Node},
    sync::{
        solo::{SoloConfig, NODE_CONFIG_PATH, SECRET_PATH, SHIM_COOKBOOKS, SOLO_CONFIG_PATH},
        transport::shell_quote,
    },
};

use indicatif::ProgressBar;
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, instrument, warn};

/// Version control directories never mirrored to nodes.
pub const EXCLUDES: [&str; 3] = [".git", ".svn", ".hg"];

/// Output markers of a successful Chef Solo run.
const SUCCESS_MARKERS: [&str; 2] = ["Chef Run complete", "Report handlers complete"];

/// Output marker of a crashed Chef Solo run.
const FAILURE_MARKER: &str = "Stacktrace dumped to";

const SOLO_BINARY: &str = "chef-solo";

/// Exit status of a shell that could not find a command.
const COMMAND_NOT_FOUND: i32 = 127;

/// Final state of a node that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Chef Solo ran successfully.
    Converged,

    /// Node is a dummy, nothing was done.
    Skipped,
}

/// Result of configuring one node of a batch.
#[derive(Debug)]
pub struct NodeReport {
    pub node: String,
    pub result: Result<NodeOutcome>,
}

/// Configures nodes through a [`Transport`].
pub struct Synchronizer<T = OpenSsh>
where
    T: Transport,
{
    kitchen: Kitchen,
    config: KitchenConfig,
    transport: T,
    force_save: bool,
    progress: ProgressBar,
}

impl<T> Synchronizer<T>
where
    T: Transport,
{
    /// Construct new synchronizer.
    pub fn new(kitchen: Kitchen, config: KitchenConfig, transport: T) -> Self {
        Self {
            kitchen,
            config,
            transport,
            force_save: false,
            progress: ProgressBar::hidden(),
        }
    }

    /// Always overwrite persisted node files.
    pub fn force_save(mut self, force: bool) -> Self {
        self.force_save = force;
        self
    }

    /// Report batch progress through target progress bar.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn kitchen(&self) -> &Kitchen {
        &self.kitchen
    }

    pub fn config(&self) -> &KitchenConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Login target of node.
    pub fn target(&self, node: &Node) -> Target {
        Target::from_config(node.name(), &self.config)
    }

    /// Configure every node, sharing one node data bag.
    ///
    /// The node data bag is built before any node is touched, and removed
    /// after the last node finished. Failure of one node does not affect the
    /// others, it is reported in its [`NodeReport`] instead.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Kitchen`] if the catalog cannot be loaded.
    /// - Return [`SyncError::DataBag`] if the node data bag cannot be built
    ///   or removed.
    #[instrument(skip(self, nodes), level = "debug")]
    pub async fn converge_all(self, nodes: Vec<Node>) -> Result<Vec<NodeReport>> {
        // Phase 1: shared state, before any remote connection.
        let catalog = self.kitchen.catalog()?;
        let guard = NodeDataBag::new(&self.kitchen).build(&self.kitchen, &catalog)?;

        // Phase 2: fan out, then join every worker.
        let limit = self.config.connection.concurrency.max(1);
        self.progress.set_length(nodes.len() as u64);
        let progress = self.progress.clone();
        let this = Arc::new(self);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut workers = JoinSet::new();
        let mut pending = BTreeSet::new();
        for node in nodes {
            let name = node.name().to_owned();
            pending.insert(name.clone());
            let this = Arc::clone(&this);
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                // Hold onto the permit until the node is done.
                let _permit = semaphore.acquire_owned().await;
                let result = this.converge_node(node).await;
                NodeReport { node: name, result }
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = workers.join_next().await {
            progress.inc(1);
            match joined {
                Ok(report) => {
                    pending.remove(&report.node);
                    reports.push(report);
                }
                Err(error) => warn!("node worker died: {error}"),
            }
        }
        // INVARIANT: Every node of the batch gets a report.
        reports.extend(pending.into_iter().map(|node| NodeReport {
            result: Err(SyncError::Worker(format!("worker of {node:?} did not finish"))),
            node,
        }));
        progress.finish_and_clear();

        // Phase 3: every worker is done with the data bag.
        guard.release()?;
        reports.sort_by(|a, b| a.node.cmp(&b.node));

        Ok(reports)
    }

    /// Configure single node.
    ///
    /// Expects the node data bag to be built already.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Login`] if node cannot be logged into.
    /// - Return [`SyncError::Permission`] if work path cannot be created.
    /// - Return [`SyncError::ToolMissing`] if Chef Solo is not installed.
    /// - Return [`SyncError::RunFailed`] if the Chef Solo run failed.
    #[instrument(skip(self, node), fields(node = %node.name()))]
    pub async fn converge_node(&self, mut node: Node) -> Result<NodeOutcome> {
        if node.is_dummy() {
            info!("skipping dummy node {:?}", node.name());
            return Ok(NodeOutcome::Skipped);
        }

        let target = self.target(&node);
        self.ensure_work_path(&target).await?;

        let mut lease = RemoteLease::new(target.clone(), &self.config.kitchen.node_work_path);
        let result = self.provision(&mut node, &target, &mut lease).await;
        lease.release(&self.transport, self.config.run.verbose).await;
        result?;

        info!("{}: node correctly configured", node.name());
        Ok(NodeOutcome::Converged)
    }

    async fn ensure_work_path(&self, target: &Target) -> Result<()> {
        let work_path = &self.config.kitchen.node_work_path;
        let command = format!("mkdir -p {} /etc/chef", shell_quote(work_path));
        match self.transport.exec(target, &command, true).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(SyncError::Permission {
                node: target.host.clone(),
                path: work_path.clone(),
                output: output.output.trim_end().into(),
            }),
            Err(TransportError::Login { message, .. }) => Err(SyncError::Login {
                node: target.host.clone(),
                message,
            }),
            Err(error) => Err(error.into()),
        }
    }

    async fn provision(&self, node: &mut Node, target: &Target, lease: &mut RemoteLease) -> Result<()> {
        let solo = self.solo_config(node);
        let solo_file = self.staging_path(&format!("tmp_solo_{}.rb", node.name()));
        lease.track_local(solo_file.clone());
        fs::write(&solo_file, solo.to_string()).map_err(|source| SyncError::Io {
            path: solo_file.clone(),
            source,
        })?;
        self.install(target, &solo_file, SOLO_CONFIG_PATH, "0400").await?;

        if node.ipaddress().is_none() {
            if let Some(address) = discover_ip(&self.transport, target).await {
                debug!("discovered ip address {address}");
                node.set_ipaddress(address);
            }
        }

        let node_file = self.staging_path(&format!("tmp_{}.json", node.name()));
        lease.track_local(node_file.clone());
        self.persist(node, &node_file)?;

        self.install(target, &node_file, NODE_CONFIG_PATH, "0400").await?;
        self.mirror_kitchen(node, target, lease).await?;
        if let Some(secret) = &self.config.userinfo.encrypted_data_bag_secret {
            lease.secret_uploaded = true;
            self.install(target, secret, SECRET_PATH, "0600").await?;
        }
        self.sync_packages(target).await;

        self.run_solo(node, target).await
    }

    fn solo_config(&self, node: &Node) -> SoloConfig {
        let mut solo = SoloConfig::new(
            self.config.kitchen.node_work_path.clone(),
            node.chef_environment(),
        );
        solo.cookbook_dirs = self
            .kitchen
            .cookbook_paths()
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        if self.config.run.legacy_environments {
            solo.cookbook_dirs.push(SHIM_COOKBOOKS.into());
        }
        solo.verbose = self.config.run.verbose;
        if self.config.userinfo.encrypted_data_bag_secret.is_some() {
            solo.secret_path = Some(SECRET_PATH.into());
        }

        solo
    }

    fn staging_path(&self, file_name: &str) -> PathBuf {
        self.kitchen.root().join(file_name)
    }

    /// Upload file, then hand it over to the superuser.
    async fn install(&self, target: &Target, local: &Path, dest: &str, mode: &str) -> Result<()> {
        let file_name = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        let staging = format!("/tmp/{file_name}");
        self.transport.put(target, local, &staging).await?;

        let dest_quoted = shell_quote(dest);
        let command = format!(
            "mv {} {dest_quoted} && chown root:root {dest_quoted} && chmod {mode} {dest_quoted}",
            shell_quote(&staging),
        );
        let output = self.transport.exec(target, &command, true).await?;
        if !output.success() {
            return Err(SyncError::Install {
                node: target.host.clone(),
                path: dest.into(),
                output: output.output.trim_end().into(),
            });
        }

        Ok(())
    }

    /// Write staging copy of node, and its persisted file if appropriate.
    fn persist(&self, node: &Node, staging: &Path) -> Result<()> {
        write_json(staging, node)?;

        let committed = self.kitchen.node_path(node.name());
        if self.force_save || !committed.exists() {
            self.kitchen.save_node(node)?;
            info!("saved node configuration to {}", committed.display());
        }

        Ok(())
    }

    async fn mirror_kitchen(
        &self,
        node: &Node,
        target: &Target,
        lease: &mut RemoteLease,
    ) -> Result<()> {
        let mut sources = self
            .kitchen
            .cookbook_paths()
            .iter()
            .cloned()
            .chain([
                self.kitchen.roles_dir(),
                self.kitchen.data_bags_dir(),
                self.kitchen.environments_dir(),
            ])
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();

        if self.config.run.legacy_environments {
            let staging = self.staging_path(&format!("tmp_shim_{}", data_bag_id(node.name())));
            lease.track_local(staging.clone());
            let shim = solo::write_shim(&staging).map_err(|source| SyncError::Io {
                path: staging.clone(),
                source,
            })?;
            sources.push(shim);
        }

        let work_path = format!("{}/", self.config.kitchen.node_work_path.trim_end_matches('/'));
        self.transport
            .mirror(target, &sources, &work_path, &EXCLUDES)
            .await?;

        Ok(())
    }

    /// Mirror package directory, a failure is only worth a warning.
    async fn sync_packages(&self, target: &Target) {
        let Some(packages) = &self.config.sync_packages else {
            return;
        };

        if let Err(message) = self.try_sync_packages(target, packages).await {
            warn!("package sync to {:?} failed: {message}", target.host);
        }
    }

    async fn try_sync_packages(
        &self,
        target: &Target,
        packages: &SyncPackages,
    ) -> Result<(), String> {
        let prepare = format!("mkdir -p {}", shell_quote(&packages.dest_dir));
        let output = self
            .transport
            .exec(target, &prepare, true)
            .await
            .map_err(|error| error.to_string())?;
        if !output.success() {
            return Err(output.output.trim_end().into());
        }

        // INVARIANT: Relative package directories belong to the kitchen.
        let local_dir = self.kitchen.root().join(&packages.local_dir);
        let local = PathBuf::from(format!(
            "{}/",
            local_dir.to_string_lossy().trim_end_matches('/')
        ));
        self.transport
            .mirror(target, &[local], &packages.dest_dir, &EXCLUDES)
            .await
            .map_err(|error| error.to_string())
    }

    async fn run_solo(&self, node: &Node, target: &Target) -> Result<()> {
        let log = &self.config.run.remote_log;
        let log_dir = Path::new(log)
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".into());
        let rotate = format!(
            "mkdir -p {dir} && if [ -f {log} ]; then mv {log} {backup}; fi",
            dir = shell_quote(&log_dir),
            log = shell_quote(log),
            backup = shell_quote(&format!("{log}.1")),
        );
        let output = self.transport.exec(target, &rotate, true).await?;
        if !output.success() {
            warn!("could not rotate {log} on {:?}", target.host);
        }

        let lookup = self
            .transport
            .exec(target, &format!("command -v {SOLO_BINARY}"), true)
            .await?;
        if !lookup.success() {
            return Err(SyncError::ToolMissing {
                node: target.host.clone(),
            });
        }

        let level = if self.config.run.verbose { "debug" } else { "info" };
        let mut command = format!("{SOLO_BINARY} -l {level} -c {SOLO_CONFIG_PATH} -j {NODE_CONFIG_PATH}");
        if self.config.run.why_run {
            command.push_str(" --why-run");
        }
        command.push_str(&format!(" 2>&1 | tee {}", shell_quote(log)));

        info!("running chef solo on {:?}", target.host);
        let output = self.transport.exec(target, &command, true).await?;
        for line in output.output.lines() {
            debug!("{line}");
        }
        self.write_local_log(node, &output.output);

        if output.status == Some(COMMAND_NOT_FOUND)
            || output.output.contains(&format!("{SOLO_BINARY}: command not found"))
        {
            return Err(SyncError::ToolMissing {
                node: target.host.clone(),
            });
        }

        if !run_succeeded(&output.output) {
            return Err(SyncError::RunFailed {
                node: target.host.clone(),
            });
        }

        Ok(())
    }

    /// Keep copy of run output in per-node local log, best effort.
    fn write_local_log(&self, node: &Node, output: &str) {
        let Some(dir) = &self.config.kitchen.log_dir else {
            return;
        };

        let dir = self.kitchen.root().join(dir);
        let log = dir.join(format!("{}.log", node.name()));
        let result = mkdirp::mkdirp(&dir).and_then(|_| {
            if log.exists() {
                fs::rename(&log, log.with_extension("log.1"))?;
            }
            fs::write(&log, output)
        });

        if let Err(error) = result {
            warn!("could not write local log {}: {error}", log.display());
        }
    }
}

/// Ask node for its IP address through ohai.
///
/// Every failure is swallowed, the address is simply unknown then.
pub async fn discover_ip<T>(transport: &T, target: &Target) -> Option<String>
where
    T: Transport + ?Sized,
{
    let output = transport
        .exec(target, "ohai -l warn ipaddress", true)
        .await
        .ok()
        .filter(CommandOutput::success)?;

    // ohai prints a JSON array, possibly surrounded by log noise.
    let start = output.output.find('[')?;
    let end = output.output.rfind(']')?;
    let addresses: Vec<String> = serde_json::from_str(output.output.get(start..=end)?).ok()?;
    addresses.into_iter().next()
}

/// Check Chef Solo output for success.
pub fn run_succeeded(output: &str) -> bool {
    !output.contains(FAILURE_MARKER) && SUCCESS_MARKERS.iter().any(|marker| output.contains(marker))
}

/// Transient state placed on a node for the duration of a run.
///
/// Call [`RemoteLease::release`] once the run is over, however it went.
#[derive(Debug)]
pub struct RemoteLease {
    target: Target,
    work_path: String,
    secret_uploaded: bool,
    local: Vec<PathBuf>,
}

impl RemoteLease {
    /// Construct new lease for target.
    pub fn new(target: Target, work_path: impl Into<String>) -> Self {
        Self {
            target,
            work_path: work_path.into(),
            secret_uploaded: false,
            local: Vec::new(),
        }
    }

    /// Remove local staging file or directory on release.
    pub fn track_local(&mut self, path: PathBuf) {
        self.local.push(path);
    }

    fn remote_cleanup_commands(&self) -> Vec<String> {
        let data_bag = format!(
            "{}/data_bags/{NODE_DATA_BAG}",
            self.work_path.trim_end_matches('/')
        );
        let mut commands = vec![
            format!("rm -rf {}", shell_quote(&data_bag)),
            format!("rm -f {NODE_CONFIG_PATH}"),
        ];
        if self.secret_uploaded {
            commands.push(format!("rm -f {SECRET_PATH}"));
        }

        commands
    }

    /// Remove transient remote and local state.
    ///
    /// Failures are swallowed, and only surfaced as warnings if `verbose`
    /// is set.
    pub async fn release<T: Transport>(self, transport: &T, verbose: bool) {
        let report = |what: &str, error: &dyn std::fmt::Display| {
            if verbose {
                warn!("cleanup of {what} failed: {error}");
            } else {
                debug!("cleanup of {what} failed: {error}");
            }
        };

        for command in self.remote_cleanup_commands() {
            match transport.exec(&self.target, &command, true).await {
                Ok(output) if output.success() => {}
                Ok(output) => report(&command, &output.output.trim_end()),
                Err(error) => report(&command, &error),
            }
        }

        for path in &self.local {
            if let Err(error) = remove_local(path) {
                report(&path.to_string_lossy(), &error);
            }
        }
    }
}

fn remove_local(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// All possible error types for node synchronization.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Cannot log into node at all.
    #[error("could not log in to {node:?}, check credentials and connectivity: {message}")]
    Login { node: String, message: String },

    /// Logged in, but remote work path cannot be created.
    #[error(
        "logged in to {node:?}, but could not create {path:?}, check the sudo rights of the \
         configured user: {output}"
    )]
    Permission {
        node: String,
        path: String,
        output: String,
    },

    /// Chef Solo is not installed on node.
    #[error("chef-solo is not installed on {node:?}, deploy Chef Solo to it first")]
    ToolMissing { node: String },

    /// Chef Solo ran, but did not succeed.
    #[error("chef solo run on {node:?} failed")]
    RunFailed { node: String },

    /// Uploaded file cannot be handed over to the superuser.
    #[error("failed to install {path:?} on {node:?}: {output}")]
    Install {
        node: String,
        path: String,
        output: String,
    },

    /// Worker task died.
    #[error("node worker failed: {0}")]
    Worker(String),

    /// Local staging file cannot be written.
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Kitchen(#[from] KitchenError),

    #[error(transparent)]
    DataBag(#[from] DataBagError),
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Transport that records every call, and fails on demand.
    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        login_fails: bool,
        sudo_denied: bool,
        solo_missing: bool,
        solo_output: String,
        data_bag: Option<PathBuf>,
        data_bag_seen: Arc<Mutex<Vec<bool>>>,
        mirror_fails_into: Option<String>,
        mirror_sources: Mutex<Vec<PathBuf>>,
    }

    impl Recorder {
        fn converging() -> Self {
            Self {
                solo_output: "Chef Run complete in 3.2 seconds".into(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn exec(
            &self,
            _target: &Target,
            command: &str,
            _privileged: bool,
        ) -> transport::Result<CommandOutput> {
            self.calls.lock().unwrap().push(format!("exec {command}"));
            if let Some(data_bag) = &self.data_bag {
                self.data_bag_seen.lock().unwrap().push(data_bag.is_dir());
            }
            if self.login_fails {
                return Err(TransportError::Login {
                    host: "x".into(),
                    message: "Permission denied (publickey)".into(),
                });
            }

            let (status, output) = if command.starts_with("mkdir -p") && self.sudo_denied {
                (1, "sudo: a password is required".to_string())
            } else if command.starts_with("command -v") && self.solo_missing {
                (1, String::new())
            } else if command.starts_with("ohai") {
                (0, "[\n  \"10.0.0.5\"\n]\n".to_string())
            } else if command.starts_with(SOLO_BINARY) {
                (0, self.solo_output.clone())
            } else {
                (0, String::new())
            };

            Ok(CommandOutput {
                status: Some(status),
                output,
            })
        }

        async fn put(&self, _target: &Target, _local: &Path, remote: &str) -> transport::Result<()> {
            self.calls.lock().unwrap().push(format!("put {remote}"));
            Ok(())
        }

        async fn mirror(
            &self,
            _target: &Target,
            sources: &[PathBuf],
            remote_dir: &str,
            _excludes: &[&str],
        ) -> transport::Result<()> {
            let names = sources
                .iter()
                .filter_map(|source| source.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            self.calls
                .lock()
                .unwrap()
                .push(format!("mirror {} -> {remote_dir}", names.join(",")));
            self.mirror_sources.lock().unwrap().extend(sources.iter().cloned());
            if self.mirror_fails_into.as_deref() == Some(remote_dir) {
                return Err(TransportError::Failed {
                    command: "rsync".into(),
                    message: "connection unexpectedly closed".into(),
                });
            }
            Ok(())
        }
    }

    fn kitchen() -> anyhow::Result<(tempfile::TempDir, Kitchen)> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        mkdirp::mkdirp(root.join("cookbooks/ntp"))?;
        fs::write(root.join("cookbooks/ntp/metadata.json"), r#"{"recipes": {"ntp": ""}}"#)?;
        mkdirp::mkdirp(root.join("roles"))?;
        fs::write(root.join("roles/base.json"), r#"{"name": "base", "run_list": ["recipe[ntp]"]}"#)?;
        mkdirp::mkdirp(root.join("nodes"))?;
        fs::write(
            root.join("nodes/web1.example.com.json"),
            r#"{"run_list": ["role[base]"]}"#,
        )?;
        fs::write(
            root.join("nodes/placeholder.example.com.json"),
            r#"{"run_list": ["role[base]"], "tags": ["dummy"]}"#,
        )?;
        let kitchen = Kitchen::new(root);

        Ok((dir, kitchen))
    }

    fn cleanup_attempted(calls: &[String]) -> bool {
        calls.iter().any(|call| call == "exec rm -rf '/tmp/chef-solo/data_bags/node'")
            && calls.iter().any(|call| call == "exec rm -f /etc/chef/node.json")
    }

    #[tokio::test]
    async fn dummy_nodes_are_never_touched() -> anyhow::Result<()> {
        let (_dir, kitchen) = kitchen()?;
        let node = kitchen.get_node("placeholder.example.com")?;
        let sync = Synchronizer::new(kitchen, KitchenConfig::default(), Recorder::converging());

        assert_eq!(sync.converge_node(node).await?, NodeOutcome::Skipped);
        assert!(sync.transport().calls().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn successful_run_discovers_ip_and_cleans_up() -> anyhow::Result<()> {
        let (dir, kitchen) = kitchen()?;
        let node = kitchen.get_node("fresh.example.com")?;
        let sync = Synchronizer::new(kitchen, KitchenConfig::default(), Recorder::converging());

        assert_eq!(sync.converge_node(node).await?, NodeOutcome::Converged);

        let calls = sync.transport().calls();
        assert_eq!(calls[0], "exec mkdir -p '/tmp/chef-solo' /etc/chef");
        assert!(calls.contains(&"put /tmp/tmp_solo_fresh.example.com.rb".to_string()));
        assert!(calls.contains(&"put /tmp/tmp_fresh.example.com.json".to_string()));
        assert!(calls.contains(&"mirror cookbooks,roles -> /tmp/chef-solo/".to_string()));
        assert!(cleanup_attempted(&calls));
        assert!(!calls.iter().any(|call| call.contains(SECRET_PATH)));

        let saved = sync.kitchen().get_node("fresh.example.com")?;
        assert_eq!(saved.ipaddress(), Some("10.0.0.5"));
        assert!(!dir.path().join("tmp_fresh.example.com.json").exists());
        assert!(!dir.path().join("tmp_solo_fresh.example.com.rb").exists());

        Ok(())
    }

    #[tokio::test]
    async fn existing_node_file_is_kept_unless_forced() -> anyhow::Result<()> {
        let (dir, kitchen) = kitchen()?;
        let path = dir.path().join("nodes/web1.example.com.json");
        let before = fs::read_to_string(&path)?;
        let node = kitchen.get_node("web1.example.com")?;

        let sync = Synchronizer::new(kitchen.clone(), KitchenConfig::default(), Recorder::converging());
        sync.converge_node(node.clone()).await?;
        assert_eq!(fs::read_to_string(&path)?, before);

        let sync = Synchronizer::new(kitchen, KitchenConfig::default(), Recorder::converging())
            .force_save(true);
        sync.converge_node(node).await?;
        assert_ne!(fs::read_to_string(&path)?, before);

        Ok(())
    }

    #[tokio::test]
    async fn failed_run_still_cleans_up() -> anyhow::Result<()> {
        let (_dir, kitchen) = kitchen()?;
        let node = kitchen.get_node("web1.example.com")?;
        let mut config = KitchenConfig::default();
        let secret = tempfile::NamedTempFile::new()?;
        config.userinfo.encrypted_data_bag_secret = Some(secret.path().to_path_buf());
        let recorder = Recorder {
            solo_output: "FATAL: Stacktrace dumped to /tmp/chef-stacktrace.out".into(),
            ..Default::default()
        };
        let sync = Synchronizer::new(kitchen, config, recorder);

        let result = sync.converge_node(node).await;
        assert!(matches!(result, Err(SyncError::RunFailed { .. })));

        let calls = sync.transport().calls();
        assert!(cleanup_attempted(&calls));
        assert!(calls.contains(&format!("exec rm -f {SECRET_PATH}")));

        Ok(())
    }

    #[tokio::test]
    async fn missing_chef_solo_is_reported() -> anyhow::Result<()> {
        let (_dir, kitchen) = kitchen()?;
        let node = kitchen.get_node("web1.example.com")?;
        let recorder = Recorder {
            solo_missing: true,
            ..Recorder::converging()
        };
        let sync = Synchronizer::new(kitchen, KitchenConfig::default(), recorder);

        let result = sync.converge_node(node).await;
        assert!(matches!(result, Err(SyncError::ToolMissing { .. })));
        assert!(cleanup_attempted(&sync.transport().calls()));

        Ok(())
    }

    #[tokio::test]
    async fn login_and_privilege_failures_are_distinct() -> anyhow::Result<()> {
        let (_dir, kitchen) = kitchen()?;
        let node = kitchen.get_node("web1.example.com")?;

        let recorder = Recorder {
            login_fails: true,
            ..Default::default()
        };
        let sync = Synchronizer::new(kitchen.clone(), KitchenConfig::default(), recorder);
        let result = sync.converge_node(node.clone()).await;
        assert!(matches!(result, Err(SyncError::Login { .. })));

        let recorder = Recorder {
            sudo_denied: true,
            ..Default::default()
        };
        let sync = Synchronizer::new(kitchen, KitchenConfig::default(), recorder);
        let error = sync.converge_node(node).await.unwrap_err();
        assert!(matches!(error, SyncError::Permission { .. }));
        assert!(error.to_string().contains("sudo rights"));
        assert_eq!(sync.transport().calls().len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn failed_kitchen_mirror_still_cleans_up() -> anyhow::Result<()> {
        let (dir, kitchen) = kitchen()?;
        let node = kitchen.get_node("web1.example.com")?;
        let recorder = Recorder {
            mirror_fails_into: Some("/tmp/chef-solo/".into()),
            ..Recorder::converging()
        };
        let sync = Synchronizer::new(kitchen, KitchenConfig::default(), recorder);

        let result = sync.converge_node(node).await;
        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Failed { .. }))
        ));

        let calls = sync.transport().calls();
        assert!(cleanup_attempted(&calls));
        assert!(!calls.iter().any(|call| call.starts_with("exec chef-solo")));
        assert!(!dir.path().join("tmp_web1.example.com.json").exists());
        assert!(!dir.path().join("tmp_solo_web1.example.com.rb").exists());

        Ok(())
    }

    #[tokio::test]
    async fn failed_package_sync_is_only_a_warning() -> anyhow::Result<()> {
        let (dir, kitchen) = kitchen()?;
        let node = kitchen.get_node("web1.example.com")?;
        let mut config = KitchenConfig::default();
        config.sync_packages = Some(SyncPackages {
            local_dir: "packages".into(),
            dest_dir: "/srv/repo".into(),
        });
        let recorder = Recorder {
            mirror_fails_into: Some("/srv/repo".into()),
            ..Recorder::converging()
        };
        let sync = Synchronizer::new(kitchen, config, recorder);

        assert_eq!(sync.converge_node(node).await?, NodeOutcome::Converged);

        let calls = sync.transport().calls();
        assert!(calls.contains(&"exec mkdir -p '/srv/repo'".to_string()));
        assert!(calls.contains(&"mirror packages -> /srv/repo".to_string()));
        assert!(calls.iter().any(|call| call.starts_with("exec chef-solo")));

        let sources = sync.transport().mirror_sources.lock().unwrap().clone();
        assert!(sources
            .iter()
            .any(|source| source.starts_with(dir.path()) && source.ends_with("packages")));

        Ok(())
    }

    #[tokio::test]
    async fn legacy_environments_ship_shim_cookbook() -> anyhow::Result<()> {
        let (dir, kitchen) = kitchen()?;
        let node = kitchen.get_node("web1.example.com")?;
        let mut config = KitchenConfig::default();
        config.run.legacy_environments = true;
        let sync = Synchronizer::new(kitchen, config, Recorder::converging());

        sync.converge_node(node).await?;
        let calls = sync.transport().calls();
        assert!(calls.contains(&format!("mirror cookbooks,roles,{SHIM_COOKBOOKS} -> /tmp/chef-solo/")));
        assert!(!dir.path().join("tmp_shim_web1_example_com").exists());

        Ok(())
    }

    #[test]
    fn run_classification() {
        assert!(run_succeeded("...\nChef Run complete in 1s\n"));
        assert!(run_succeeded("Report handlers complete\n"));
        assert!(!run_succeeded("Report handlers complete\nStacktrace dumped to /x\n"));
        assert!(!run_succeeded("ERROR: something\n"));
    }

    #[tokio::test]
    async fn batch_builds_data_bag_before_workers_and_removes_it_after() -> anyhow::Result<()> {
        let (_dir, kitchen) = kitchen()?;
        let nodes = kitchen.get_nodes(None)?;
        let data_bag = NodeDataBag::new(&kitchen);
        let recorder = Recorder {
            data_bag: Some(data_bag.path().to_path_buf()),
            ..Recorder::converging()
        };
        let mut config = KitchenConfig::default();
        config.connection.concurrency = 4;
        let seen = Arc::clone(&recorder.data_bag_seen);
        let sync = Synchronizer::new(kitchen, config, recorder);

        let reports = sync.converge_all(nodes).await?;
        let outcomes = reports
            .iter()
            .map(|report| (report.node.as_str(), report.result.as_ref().ok().copied()))
            .collect::<Vec<_>>();
        assert_eq!(
            outcomes,
            vec![
                ("placeholder.example.com", Some(NodeOutcome::Skipped)),
                ("web1.example.com", Some(NodeOutcome::Converged)),
            ]
        );
        assert!(!data_bag.path().exists());

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|present| *present));

        Ok(())
    }
}
