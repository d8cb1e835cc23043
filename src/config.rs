// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of `kitchen.toml`, the configuration file found at the
//! top-level of every kitchen. File I/O is left to the caller to figure out.
//!
//! # General Layout
//!
//! ```toml
//! [userinfo]
//! user = "deploy"
//! keypair_file = "~/.ssh/id_ed25519"
//!
//! [kitchen]
//! node_work_path = "/tmp/chef-solo"
//!
//! [connection]
//! concurrency = 4
//! ```
//!
//! Every section and key is optional. Path-valued keys are shell expanded.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Kitchen configuration layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct KitchenConfig {
    /// Login information for remote nodes.
    #[serde(default)]
    pub userinfo: UserInfo,

    /// Transport settings.
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Kitchen and remote layout.
    #[serde(default)]
    pub kitchen: KitchenSettings,

    /// Chef Solo run behavior.
    #[serde(default)]
    pub run: RunSettings,

    /// Optional package directory mirrored to every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_packages: Option<SyncPackages>,

    /// Plugin registry settings.
    #[serde(default)]
    pub plugins: PluginSettings,
}

impl KitchenConfig {
    /// Check settings that depend on the local file system.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingSecret`] if the configured encrypted
    ///   data bag secret does not exist.
    pub fn validate(&self) -> Result<()> {
        if let Some(secret) = &self.userinfo.encrypted_data_bag_secret {
            if !secret.is_file() {
                return Err(ConfigError::MissingSecret(secret.clone()));
            }
        }

        Ok(())
    }
}

impl FromStr for KitchenConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: KitchenConfig =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path-valued field.
        let userinfo = &mut config.userinfo;
        expand_optional(&mut userinfo.keypair_file)?;
        expand_optional(&mut userinfo.ssh_config)?;
        expand_optional(&mut userinfo.encrypted_data_bag_secret)?;
        expand_optional(&mut config.kitchen.log_dir)?;
        if let Some(packages) = &mut config.sync_packages {
            packages.local_dir = expand(&packages.local_dir)?;
        }

        Ok(config)
    }
}

impl Display for KitchenConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

fn expand_optional(path: &mut Option<PathBuf>) -> Result<()> {
    if let Some(inner) = path {
        *inner = expand(inner)?;
    }

    Ok(())
}

/// Login information.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct UserInfo {
    /// Remote user, defaults to whatever SSH decides.
    pub user: Option<String>,

    /// Private key used for authentication.
    pub keypair_file: Option<PathBuf>,

    /// Alternative SSH client configuration file.
    pub ssh_config: Option<PathBuf>,

    /// Secret uploaded to nodes for encrypted data bags.
    pub encrypted_data_bag_secret: Option<PathBuf>,
}

/// Transport settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Remote SSH port.
    pub port: Option<u16>,

    /// Jump host to reach nodes through.
    pub gateway: Option<String>,

    /// Maximum number of nodes configured at once.
    pub concurrency: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: None,
            gateway: None,
            concurrency: 1,
        }
    }
}

/// Kitchen and remote layout settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KitchenSettings {
    /// Remote directory the kitchen is mirrored into.
    pub node_work_path: String,

    /// Cookbook search paths relative to kitchen, highest priority first.
    pub cookbook_paths: Vec<PathBuf>,

    /// Regenerate stale metadata.json through knife.
    pub generate_metadata: bool,

    /// Local directory for per-node run logs.
    pub log_dir: Option<PathBuf>,
}

impl Default for KitchenSettings {
    fn default() -> Self {
        Self {
            node_work_path: "/tmp/chef-solo".into(),
            cookbook_paths: crate::kitchen::DEFAULT_COOKBOOK_PATHS
                .iter()
                .map(PathBuf::from)
                .collect(),
            generate_metadata: true,
            log_dir: None,
        }
    }
}

/// Chef Solo run behavior.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunSettings {
    /// Debug logging on the node, and surfaced cleanup failures.
    pub verbose: bool,

    /// Simulate the run without changing the node.
    pub why_run: bool,

    /// Ship environment support library for old Chef Solo releases.
    pub legacy_environments: bool,

    /// Remote log file of Chef Solo.
    pub remote_log: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            verbose: false,
            why_run: false,
            legacy_environments: false,
            remote_log: "/var/log/chef/solo.log".into(),
        }
    }
}

/// Package directory mirrored to every node.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SyncPackages {
    /// Local directory holding packages.
    pub local_dir: PathBuf,

    /// Remote destination directory.
    pub dest_dir: String,
}

/// Plugin registry settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Plugins allowed to run. Empty means every registered plugin.
    pub enabled: Vec<String>,
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Encrypted data bag secret is configured but absent.
    #[error("encrypted data bag secret {0:?} does not exist")]
    MissingSecret(PathBuf),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("SECRETS", "/home/blah/secrets")])]
    fn deserialize_kitchen_config() -> anyhow::Result<()> {
        let result: KitchenConfig = r#"
            [userinfo]
            user = "deploy"
            keypair_file = "$SECRETS/id_ed25519"
            encrypted_data_bag_secret = "$SECRETS/edbs"

            [connection]
            gateway = "bastion.example.com"
            concurrency = 4

            [kitchen]
            node_work_path = "/var/chef"

            [sync_packages]
            local_dir = "$SECRETS/packages"
            dest_dir = "/srv/repo"

            [plugins]
            enabled = ["save_ip"]
        "#
        .parse()?;

        let expect = KitchenConfig {
            userinfo: UserInfo {
                user: Some("deploy".into()),
                keypair_file: Some("/home/blah/secrets/id_ed25519".into()),
                ssh_config: None,
                encrypted_data_bag_secret: Some("/home/blah/secrets/edbs".into()),
            },
            connection: ConnectionSettings {
                port: None,
                gateway: Some("bastion.example.com".into()),
                concurrency: 4,
            },
            kitchen: KitchenSettings {
                node_work_path: "/var/chef".into(),
                ..Default::default()
            },
            run: RunSettings::default(),
            sync_packages: Some(SyncPackages {
                local_dir: "/home/blah/secrets/packages".into(),
                dest_dir: "/srv/repo".into(),
            }),
            plugins: PluginSettings {
                enabled: vec!["save_ip".into()],
            },
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn empty_config_uses_defaults() -> anyhow::Result<()> {
        let result: KitchenConfig = "".parse()?;
        assert_eq!(result, KitchenConfig::default());
        assert_eq!(result.kitchen.node_work_path, "/tmp/chef-solo");
        assert_eq!(result.connection.concurrency, 1);

        Ok(())
    }

    #[test]
    fn serialize_kitchen_config() {
        let mut config = KitchenConfig::default();
        config.userinfo.user = Some("deploy".into());
        config.kitchen.generate_metadata = false;
        let result = config.to_string();

        let expect = indoc! {r#"
            [userinfo]
            user = "deploy"

            [connection]
            concurrency = 1

            [kitchen]
            node_work_path = "/tmp/chef-solo"
            cookbook_paths = [
                "site-cookbooks",
                "cookbooks",
            ]
            generate_metadata = false

            [run]
            verbose = false
            why_run = false
            legacy_environments = false
            remote_log = "/var/log/chef/solo.log"

            [plugins]
            enabled = []
        "#};

        assert_eq!(result, expect);
    }

    #[test]
    fn missing_secret_fails_validation() {
        let mut config = KitchenConfig::default();
        config.userinfo.encrypted_data_bag_secret = Some("/nonexistent/edbs".into());
        assert!(matches!(config.validate(), Err(ConfigError::MissingSecret(_))));
    }
}
