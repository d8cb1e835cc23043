// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use anyhow::Result;
use oxichef::Kitchen;
use serde_json::Value;
use std::{fs, path::Path};
use tempfile::TempDir;

/// Throwaway kitchen on disk.
pub(crate) struct KitchenFixture {
    dir: TempDir,
}

impl KitchenFixture {
    pub(crate) fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("kitchen.toml"), "")?;

        Ok(Self { dir })
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn kitchen(&self) -> Kitchen {
        Kitchen::new(self.root())
    }

    pub(crate) fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<str>) -> Result<()> {
        let path = self.root().join(path);
        if let Some(parent) = path.parent() {
            mkdirp::mkdirp(parent)?;
        }

        // INVARIANT: Fixture contents are always valid JSON.
        let _: Value = serde_json::from_str(contents.as_ref())?;
        fs::write(path, contents.as_ref())?;

        Ok(())
    }

    pub(crate) fn read(&self, path: impl AsRef<Path>) -> Result<Value> {
        Ok(serde_json::from_str(&fs::read_to_string(self.root().join(path))?)?)
    }
}
