// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Kitchen entity layout.
//!
//! Nodes are kept as raw JSON objects, because every key that is not
//! reserved is a user attribute. Roles and environments have a fixed shape
//! and are deserialized into proper structs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Environment every node belongs to unless it says otherwise.
pub const DEFAULT_ENVIRONMENT: &str = "_default";

/// One managed machine.
///
/// The name of a node is its identity. It is stamped from the file name of
/// `nodes/<name>.json` on load and is never changed afterwards.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Node(Map<String, Value>);

impl Node {
    /// Construct fresh node template with empty run list.
    pub fn new(name: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("run_list".into(), Value::Array(Vec::new()));
        Self::from_map(name, map)
    }

    /// Construct node from already parsed JSON object.
    ///
    /// Stamps the name, and defaults the environment to
    /// [`DEFAULT_ENVIRONMENT`] if absent.
    pub fn from_map(name: impl Into<String>, mut map: Map<String, Value>) -> Self {
        map.insert("name".into(), Value::String(name.into()));
        map.entry("chef_environment")
            .or_insert_with(|| Value::String(DEFAULT_ENVIRONMENT.into()));
        Self(map)
    }

    pub fn name(&self) -> &str {
        self.0.get("name").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn chef_environment(&self) -> &str {
        self.0
            .get("chef_environment")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_ENVIRONMENT)
    }

    /// Explicit run list of node.
    ///
    /// Non-string entries are dropped.
    pub fn run_list(&self) -> RunList {
        let entries = self
            .0
            .get("run_list")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        RunList(entries)
    }

    /// Replace run list of node.
    pub fn set_run_list(&mut self, entries: impl IntoIterator<Item = impl Into<String>>) {
        let entries = entries
            .into_iter()
            .map(|entry| Value::String(entry.into()))
            .collect();
        self.0.insert("run_list".into(), Value::Array(entries));
    }

    pub fn ipaddress(&self) -> Option<&str> {
        self.0.get("ipaddress").and_then(Value::as_str)
    }

    pub fn set_ipaddress(&mut self, address: impl Into<String>) {
        self.0
            .insert("ipaddress".into(), Value::String(address.into()));
    }

    /// List of tags attached to node.
    pub fn tags(&self) -> Vec<&str> {
        self.0
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Check if node is an inventory-only placeholder.
    pub fn is_dummy(&self) -> bool {
        matches!(self.0.get("dummy"), Some(Value::Bool(true))) || self.tags().contains(&"dummy")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// Ordered listing of role and recipe references.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunList(Vec<String>);

impl RunList {
    /// Construct new run list.
    pub fn new(entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(entries.into_iter().map(Into::into).collect())
    }

    /// Iterate through entries that are valid role or recipe references.
    pub fn items(&self) -> impl Iterator<Item = RunListItem<'_>> {
        self.0.iter().filter_map(|entry| RunListItem::parse(entry))
    }

    /// Names of roles referenced directly.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.items().filter_map(|item| match item {
            RunListItem::Role(name) => Some(name),
            RunListItem::Recipe(_) => None,
        })
    }

    /// Names of recipes referenced directly.
    pub fn recipes(&self) -> impl Iterator<Item = &str> {
        self.items().filter_map(|item| match item {
            RunListItem::Recipe(name) => Some(name),
            RunListItem::Role(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Single run list reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunListItem<'a> {
    /// A `role[NAME]` entry.
    Role(&'a str),

    /// A `recipe[NAME]` entry.
    Recipe(&'a str),
}

impl<'a> RunListItem<'a> {
    /// Parse run list entry.
    ///
    /// Returns [`None`] for anything that is not of the form `role[NAME]` or
    /// `recipe[NAME]`.
    pub fn parse(entry: &'a str) -> Option<Self> {
        let entry = entry.trim();
        if let Some(name) = bracketed(entry, "role[") {
            return Some(Self::Role(name));
        }

        bracketed(entry, "recipe[").map(Self::Recipe)
    }
}

fn bracketed<'a>(entry: &'a str, prefix: &str) -> Option<&'a str> {
    entry
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(']'))
        .filter(|name| !name.is_empty())
}

/// Reusable bundle of run list entries and attributes.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Path of role file relative to roles directory without extension.
    #[serde(skip)]
    pub fullname: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub run_list: RunList,

    #[serde(default)]
    pub default_attributes: Map<String, Value>,

    #[serde(default)]
    pub override_attributes: Map<String, Value>,
}

/// Deployment stage contributing default and override attributes.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub default_attributes: Map<String, Value>,

    #[serde(default)]
    pub override_attributes: Map<String, Value>,

    #[serde(default)]
    pub cookbook_versions: Map<String, Value>,
}

impl Environment {
    /// Construct empty environment, e.g., the implicit `_default` one.
    pub fn template(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Unit of configuration logic within a cookbook.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Recipe {
    /// Qualified name, `cookbook` or `cookbook::sub`.
    pub name: String,

    pub description: String,

    pub version: Option<String>,

    pub dependencies: Vec<String>,

    /// Attribute defaults keyed by `/` delimited compound key.
    ///
    /// Values are already normalized, see
    /// [`normalize_default`](crate::kitchen::cookbook::normalize_default).
    pub attributes: BTreeMap<String, Value>,
}
