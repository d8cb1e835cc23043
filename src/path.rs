// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for the kitchen being worked on, and
//! for external files that the transport needs.

use std::path::{Path, PathBuf};

/// Name of kitchen configuration file.
pub const KITCHEN_CONFIG: &str = "kitchen.toml";

/// Locate kitchen root directory.
///
/// Walks from `start` up through its ancestors until a directory holding
/// [`KITCHEN_CONFIG`] is found.
///
/// # Errors
///
/// - Return [`NoKitchen`] if no ancestor holds a kitchen configuration file.
pub fn find_kitchen_root(start: impl AsRef<Path>) -> Result<PathBuf> {
    start
        .as_ref()
        .ancestors()
        .find(|dir| dir.join(KITCHEN_CONFIG).is_file())
        .map(Path::to_path_buf)
        .ok_or_else(|| NoKitchen(start.as_ref().to_path_buf()))
}

/// Determine default SSH client configuration file.
///
/// Only returns a path that actually exists.
pub fn default_ssh_config() -> Option<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .filter(|path| path.is_file())
}

/// No kitchen could be found.
#[derive(Clone, Debug, thiserror::Error)]
#[error("no {KITCHEN_CONFIG} found in {0:?} or any parent directory, is this a kitchen?")]
pub struct NoKitchen(pub PathBuf);

/// Friendly result alias :3
pub type Result<T, E = NoKitchen> = std::result::Result<T, E>;
