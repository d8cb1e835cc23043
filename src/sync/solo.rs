// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Chef Solo configuration.
//!
//! Renders the `solo.rb` file that points Chef Solo at the kitchen mirrored
//! into the node work path, and provides the environment support shim for
//! old Chef Solo releases.
//!
//! # Cookbook Path Order
//!
//! Chef Solo lets later entries of `cookbook_path` override earlier ones.
//! Cookbook paths are therefore written lowest priority first, which puts
//! site cookbooks last so they win over plain cookbooks.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs, io,
    path::{Path, PathBuf},
};

/// Remote location of the Chef Solo configuration file.
pub const SOLO_CONFIG_PATH: &str = "/etc/chef/solo.rb";

/// Remote location of the node attributes file.
pub const NODE_CONFIG_PATH: &str = "/etc/chef/node.json";

/// Remote location of the encrypted data bag secret.
pub const SECRET_PATH: &str = "/etc/chef/encrypted_data_bag_secret";

/// Directory holding the environment shim cookbook.
pub const SHIM_COOKBOOKS: &str = "shim-cookbooks";

const SHIM_COOKBOOK: &str = "solo_environments";

const SHIM_LIBRARY: &str = r#"# Environment support for Chef Solo releases without it.
class Chef
  class Node
    def chef_environment(arg = nil)
      set_or_return(:chef_environment, arg, :kind_of => String) || "_default"
    end
  end
end
"#;

/// Settings of a single Chef Solo run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoloConfig {
    /// Remote directory holding the mirrored kitchen.
    pub work_path: String,

    /// Cookbook directory names under work path, highest priority first.
    pub cookbook_dirs: Vec<String>,

    pub environment: String,

    pub verbose: bool,

    /// Remote secret path, if a secret is shipped.
    pub secret_path: Option<String>,
}

impl SoloConfig {
    /// Construct new Chef Solo configuration.
    pub fn new(work_path: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            work_path: work_path.into(),
            cookbook_dirs: vec!["site-cookbooks".into(), "cookbooks".into()],
            environment: environment.into(),
            verbose: false,
            secret_path: None,
        }
    }

    fn remote(&self, dir: &str) -> String {
        format!("{}/{dir}", self.work_path.trim_end_matches('/'))
    }
}

impl Display for SoloConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let cookbook_paths = self
            .cookbook_dirs
            .iter()
            .rev()
            .map(|dir| ruby_string(&self.remote(dir)))
            .collect::<Vec<_>>()
            .join(", ");

        writeln!(fmt, "file_cache_path {}", ruby_string(&self.work_path))?;
        writeln!(fmt, "cookbook_path [{cookbook_paths}]")?;
        writeln!(fmt, "role_path {}", ruby_string(&self.remote("roles")))?;
        writeln!(fmt, "data_bag_path {}", ruby_string(&self.remote("data_bags")))?;
        writeln!(
            fmt,
            "environment_path {}",
            ruby_string(&self.remote("environments"))
        )?;
        writeln!(fmt, "environment {}", ruby_string(&self.environment))?;
        writeln!(fmt, "verbose_logging {}", self.verbose)?;
        if let Some(secret) = &self.secret_path {
            writeln!(fmt, "encrypted_data_bag_secret {}", ruby_string(secret))?;
        }

        Ok(())
    }
}

fn ruby_string(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', r"\\").replace('"', "\\\""))
}

/// Write environment shim cookbook under target directory.
///
/// Returns the path of the written [`SHIM_COOKBOOKS`] directory.
///
/// # Errors
///
/// - Return [`io::Error`] if shim files cannot be written.
pub fn write_shim(dir: &Path) -> io::Result<PathBuf> {
    let root = dir.join(SHIM_COOKBOOKS);
    let cookbook = root.join(SHIM_COOKBOOK);
    mkdirp::mkdirp(cookbook.join("libraries"))?;
    fs::write(
        cookbook.join("metadata.rb"),
        format!("name \"{SHIM_COOKBOOK}\"\nversion \"0.1.0\"\n"),
    )?;
    fs::write(cookbook.join("libraries").join("environment.rb"), SHIM_LIBRARY)?;

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn render_solo_config() {
        let mut config = SoloConfig::new("/tmp/chef-solo/", "production");
        config.cookbook_dirs.push(SHIM_COOKBOOKS.into());
        config.verbose = true;
        config.secret_path = Some(SECRET_PATH.into());

        let expect = indoc! {r#"
            file_cache_path "/tmp/chef-solo/"
            cookbook_path ["/tmp/chef-solo/shim-cookbooks", "/tmp/chef-solo/cookbooks", "/tmp/chef-solo/site-cookbooks"]
            role_path "/tmp/chef-solo/roles"
            data_bag_path "/tmp/chef-solo/data_bags"
            environment_path "/tmp/chef-solo/environments"
            environment "production"
            verbose_logging true
            encrypted_data_bag_secret "/etc/chef/encrypted_data_bag_secret"
        "#};

        assert_eq!(config.to_string(), expect);
    }

    #[test]
    fn ruby_strings_are_escaped() {
        assert_eq!(ruby_string(r#"we"ird\env"#), r#""we\"ird\\env""#);
    }

    #[test]
    fn shim_cookbook_layout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = write_shim(dir.path())?;

        assert_eq!(root, dir.path().join(SHIM_COOKBOOKS));
        assert!(root.join("solo_environments/libraries/environment.rb").is_file());
        assert!(root.join("solo_environments/metadata.rb").is_file());

        Ok(())
    }
}
