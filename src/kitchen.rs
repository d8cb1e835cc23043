// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Kitchen repository reader.
//!
//! The __kitchen__ is the directory holding every declarative entity of a
//! fleet: nodes, roles, environments, cookbooks, and data bags. Reading it
//! has no side effects besides the occasional regeneration of cookbook
//! metadata.
//!
//! # Failure Semantics
//!
//! Malformed JSON anywhere is fatal and always reports the offending file
//! along with the parser message. A missing environment file is reported as
//! [`KitchenError::NotFound`] so callers can tell it apart from a broken one.

pub mod cookbook;
pub mod model;

pub use model::{Environment, Node, Recipe, Role, RunList, RunListItem, DEFAULT_ENVIRONMENT};

use crate::config::KitchenConfig;

use ignore::WalkBuilder;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Default cookbook search paths in priority order.
pub const DEFAULT_COOKBOOK_PATHS: [&str; 2] = ["site-cookbooks", "cookbooks"];

/// Directory based repository of a fleet.
#[derive(Debug, Clone)]
pub struct Kitchen {
    root: PathBuf,
    cookbook_paths: Vec<PathBuf>,
    generate_metadata: bool,
}

impl Kitchen {
    /// Construct new kitchen reader rooted at target path.
    ///
    /// Uses [`DEFAULT_COOKBOOK_PATHS`], and never regenerates metadata.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cookbook_paths = DEFAULT_COOKBOOK_PATHS
            .iter()
            .map(|path| root.join(path))
            .collect();

        Self {
            root,
            cookbook_paths,
            generate_metadata: false,
        }
    }

    /// Construct kitchen reader from kitchen configuration.
    pub fn from_config(root: impl Into<PathBuf>, config: &KitchenConfig) -> Self {
        let root = root.into();
        let cookbook_paths = config
            .kitchen
            .cookbook_paths
            .iter()
            .map(|path| root.join(path))
            .collect();

        Self {
            root,
            cookbook_paths,
            generate_metadata: config.kitchen.generate_metadata,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Cookbook search paths in priority order.
    pub fn cookbook_paths(&self) -> &[PathBuf] {
        &self.cookbook_paths
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn roles_dir(&self) -> PathBuf {
        self.root.join("roles")
    }

    pub fn environments_dir(&self) -> PathBuf {
        self.root.join("environments")
    }

    pub fn data_bags_dir(&self) -> PathBuf {
        self.root.join("data_bags")
    }

    /// Path of persisted node file.
    pub fn node_path(&self, name: &str) -> PathBuf {
        self.nodes_dir().join(format!("{name}.json"))
    }

    /// Load node by name.
    ///
    /// Never fails for a node without a file, a fresh template is returned
    /// instead.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::Parse`] if node file is malformed.
    /// - Return [`KitchenError::Io`] if node file cannot be read.
    pub fn get_node(&self, name: &str) -> Result<Node> {
        match read_json::<Map<String, Value>>(&self.node_path(name)) {
            Ok(map) => Ok(Node::from_map(name, map)),
            Err(KitchenError::NotFound { .. }) => Ok(Node::new(name)),
            Err(error) => Err(error),
        }
    }

    /// Load every node, optionally filtered by environment.
    ///
    /// Nodes are sorted by file name.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::Parse`] if any node file is malformed.
    pub fn get_nodes(&self, environment: Option<&str>) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for name in self.node_names()? {
            let node = self.get_node(&name)?;
            if environment.is_none_or(|env| node.chef_environment() == env) {
                nodes.push(node);
            }
        }

        Ok(nodes)
    }

    /// Names of all persisted nodes, sorted.
    pub fn node_names(&self) -> Result<Vec<String>> {
        let dir = self.nodes_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!("{}/*.json", glob::Pattern::escape(dir.to_string_lossy().as_ref()));
        let mut names = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|err| KitchenError::Io {
                path: err.path().to_path_buf(),
                source: err.into_error(),
            })?;
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().into_owned());
            }
        }
        names.sort();

        Ok(names)
    }

    /// Persist node into `nodes/<name>.json`.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::Io`] if node file cannot be written.
    pub fn save_node(&self, node: &Node) -> Result<PathBuf> {
        let path = self.node_path(node.name());
        write_json(&path, node)?;
        debug!("saved node {:?} to {}", node.name(), path.display());

        Ok(path)
    }

    /// Load environment by name.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::NotFound`] if environment file does not exist.
    /// - Return [`KitchenError::Parse`] if environment file is malformed.
    pub fn get_environment(&self, name: &str) -> Result<Environment> {
        if name == DEFAULT_ENVIRONMENT {
            return Ok(Environment::template(name));
        }

        let mut environment: Environment =
            read_json(&self.environments_dir().join(format!("{name}.json")))?;
        if environment.name.is_empty() {
            environment.name = name.into();
        }

        Ok(environment)
    }

    /// Load every environment, sorted by name.
    ///
    /// Files that vanish between directory walk and read are skipped.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::Parse`] if an environment file is malformed.
    pub fn get_environments(&self) -> Result<Vec<Environment>> {
        let mut environments = Vec::new();
        for name in walk_json_tree(&self.environments_dir())? {
            match self.get_environment(&name) {
                Ok(environment) => environments.push(environment),
                Err(KitchenError::NotFound { path }) => {
                    debug!("environment file {} vanished, skipping", path.display());
                }
                Err(error) => return Err(error),
            }
        }
        environments.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(environments)
    }

    /// Load single role by its path relative to the roles directory.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::NotFound`] if role file does not exist.
    /// - Return [`KitchenError::Parse`] if role file is malformed.
    pub fn get_role(&self, fullname: &str) -> Result<Role> {
        let mut role: Role = read_json(&self.roles_dir().join(format!("{fullname}.json")))?;
        role.fullname = fullname.into();
        if role.name.is_empty() {
            role.name = fullname.into();
        }

        Ok(role)
    }

    /// Load every role, sorted by full name.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::Parse`] if any role file is malformed.
    pub fn get_roles(&self) -> Result<Vec<Role>> {
        let mut roles = walk_json_tree(&self.roles_dir())?
            .iter()
            .map(|fullname| self.get_role(fullname))
            .collect::<Result<Vec<_>>>()?;
        roles.sort_by(|a, b| a.fullname.cmp(&b.fullname));

        Ok(roles)
    }

    /// Load every recipe of target cookbook.
    ///
    /// See [`cookbook`] for lookup rules.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::MissingCookbook`] if cookbook cannot be found.
    /// - Return [`KitchenError::MissingMetadata`] if cookbook lacks metadata.
    pub fn get_recipes_in_cookbook(&self, name: &str) -> Result<Vec<Recipe>> {
        cookbook::recipes_in_cookbook(&self.cookbook_paths, name, self.generate_metadata)
    }

    /// Load every recipe of every cookbook, sorted by qualified name.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError::MissingMetadata`] if a cookbook lacks metadata.
    pub fn get_recipes(&self) -> Result<Vec<Recipe>> {
        let mut cookbooks = BTreeSet::new();
        for cookbook_path in &self.cookbook_paths {
            let Ok(entries) = fs::read_dir(cookbook_path) else {
                continue;
            };

            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.path().is_dir() && !name.starts_with('.') {
                    cookbooks.insert(name);
                }
            }
        }

        let mut recipes = Vec::new();
        for cookbook in cookbooks {
            recipes.extend(self.get_recipes_in_cookbook(&cookbook)?);
        }
        recipes.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(recipes)
    }

    /// Load recipe and role catalog in one go.
    ///
    /// # Errors
    ///
    /// - Return [`KitchenError`] if any role or cookbook cannot be loaded.
    #[instrument(skip(self), level = "debug")]
    pub fn catalog(&self) -> Result<Catalog> {
        Ok(Catalog::new(self.get_recipes()?, self.get_roles()?))
    }
}

/// Read-only index of every recipe and role in a kitchen.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    recipes: BTreeMap<String, Recipe>,
    roles: BTreeMap<String, Role>,
}

impl Catalog {
    /// Construct new catalog.
    pub fn new(
        recipes: impl IntoIterator<Item = Recipe>,
        roles: impl IntoIterator<Item = Role>,
    ) -> Self {
        Self {
            recipes: recipes
                .into_iter()
                .map(|recipe| (recipe.name.clone(), recipe))
                .collect(),
            roles: roles
                .into_iter()
                .map(|role| (role.name.clone(), role))
                .collect(),
        }
    }

    pub fn recipe(&self, name: &str) -> Option<&Recipe> {
        self.recipes.get(name)
    }

    /// Look up role by name, falling back to its full name.
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles
            .get(name)
            .or_else(|| self.roles.values().find(|role| role.fullname == name))
    }

    pub fn recipes(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.values()
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }
}

/// Relative names of every JSON file in a directory tree.
fn walk_json_tree(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    let walker = WalkBuilder::new(dir)
        .standard_filters(false)
        .hidden(true)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let is_file = entry.file_type().is_some_and(|kind| kind.is_file());
        if !is_file || path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        // INVARIANT: Nested directories become '/' separated namespaces.
        let relative = path.strip_prefix(dir).unwrap_or(path).with_extension("");
        let name = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        names.push(name);
    }

    Ok(names)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => KitchenError::NotFound {
            path: path.to_path_buf(),
        },
        _ => KitchenError::Io {
            path: path.to_path_buf(),
            source: err,
        },
    })?;

    serde_json::from_str(&contents).map_err(|err| KitchenError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}

/// Write pretty JSON with trailing newline, creating parent directories.
pub(crate) fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let io_error = |source| KitchenError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent).map_err(io_error)?;
    }

    let mut contents =
        serde_json::to_string_pretty(value).map_err(|err| KitchenError::Serialize {
            path: path.to_path_buf(),
            source: err,
        })?;
    contents.push('\n');
    fs::write(path, contents).map_err(io_error)
}

/// All possible error types for kitchen reading.
#[derive(Debug, thiserror::Error)]
pub enum KitchenError {
    /// JSON file is malformed.
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Value cannot be serialized into JSON file.
    #[error("failed to serialize {path:?}: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Required file does not exist.
    #[error("file {path:?} not found")]
    NotFound { path: PathBuf },

    /// Cookbook is absent from every cookbook path.
    #[error("unable to find cookbook {name:?}")]
    MissingCookbook { name: String },

    /// Cookbook exists but has no metadata.json.
    #[error("cookbook {name:?} has no metadata.json")]
    MissingMetadata { name: String },

    /// File I/O fails.
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Directory walk fails.
    #[error(transparent)]
    Walk(#[from] ignore::Error),

    /// Glob pattern is invalid.
    #[error(transparent)]
    Glob(#[from] glob::PatternError),
}

/// Friendly result alias :3
pub type Result<T, E = KitchenError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn write(root: &Path, path: &str, contents: &str) {
        let path = root.join(path);
        mkdirp::mkdirp(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn get_node_falls_back_to_template() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let kitchen = Kitchen::new(dir.path());

        let node = kitchen.get_node("fresh.example.com")?;
        assert_eq!(
            Value::Object(node.into_map()),
            json!({"name": "fresh.example.com", "chef_environment": "_default", "run_list": []})
        );

        Ok(())
    }

    #[test]
    fn get_node_reports_parse_errors_with_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path(), "nodes/broken.json", "{\"run_list\": [");
        let kitchen = Kitchen::new(dir.path());

        let error = kitchen.get_node("broken").unwrap_err();
        assert!(matches!(error, KitchenError::Parse { .. }));
        assert!(error.to_string().contains("broken.json"));

        Ok(())
    }

    #[test]
    fn get_nodes_sorts_and_filters() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path(), "nodes/b.example.com.json", r#"{"chef_environment": "production"}"#);
        write(dir.path(), "nodes/a.example.com.json", r#"{"run_list": []}"#);
        write(dir.path(), "nodes/notes.txt", "ignored");
        let kitchen = Kitchen::new(dir.path());

        let all = kitchen.get_nodes(None)?;
        let names = all.iter().map(Node::name).collect::<Vec<_>>();
        assert_eq!(names, vec!["a.example.com", "b.example.com"]);

        let production = kitchen.get_nodes(Some("production"))?;
        assert_eq!(production.len(), 1);
        assert_eq!(production[0].name(), "b.example.com");

        Ok(())
    }

    #[test]
    fn environments_default_missing_and_nested() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(
            dir.path(),
            "environments/production.json",
            r#"{"name": "production", "default_attributes": {"a": 1}}"#,
        );
        write(dir.path(), "environments/eu/staging.json", r#"{"description": "eu"}"#);
        let kitchen = Kitchen::new(dir.path());

        assert_eq!(kitchen.get_environment("_default")?, Environment::template("_default"));
        assert!(matches!(
            kitchen.get_environment("qa"),
            Err(KitchenError::NotFound { .. })
        ));

        let names = kitchen
            .get_environments()?
            .into_iter()
            .map(|env| env.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["eu/staging", "production"]);

        Ok(())
    }

    #[test]
    fn malformed_environment_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path(), "environments/production.json", r#"{"name": "production"}"#);
        write(dir.path(), "environments/bad.json", r#"{"name": "bad", "default_attributes": "#);
        let kitchen = Kitchen::new(dir.path());

        let error = kitchen.get_environment("bad").unwrap_err();
        assert!(matches!(error, KitchenError::Parse { .. }));
        assert!(error.to_string().contains("bad.json"));

        let error = kitchen.get_environments().unwrap_err();
        assert!(matches!(error, KitchenError::Parse { .. }));
        assert!(error.to_string().contains("bad.json"));
        assert_eq!(kitchen.get_environment("production")?.name, "production");

        Ok(())
    }

    #[test]
    fn roles_are_namespaced_by_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path(), "roles/base.json", r#"{"name": "base", "run_list": ["recipe[ntp]"]}"#);
        write(dir.path(), "roles/web/frontend.json", r#"{"run_list": ["role[base]"]}"#);
        let kitchen = Kitchen::new(dir.path());

        let roles = kitchen.get_roles()?;
        let names = roles
            .iter()
            .map(|role| (role.fullname.as_str(), role.name.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(names, vec![("base", "base"), ("web/frontend", "web/frontend")]);

        let catalog = Catalog::new(Vec::new(), roles);
        assert!(catalog.role("web/frontend").is_some());

        Ok(())
    }

    #[test]
    fn malformed_role_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path(), "roles/bad.json", "not json");
        let kitchen = Kitchen::new(dir.path());

        let error = kitchen.get_roles().unwrap_err();
        assert!(error.to_string().contains("bad.json"));

        Ok(())
    }

    #[test]
    fn get_recipes_unions_cookbook_paths() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path(), "cookbooks/ntp/metadata.json", r#"{"recipes": {"ntp": ""}}"#);
        write(
            dir.path(),
            "site-cookbooks/apache2/metadata.json",
            r#"{"recipes": {"apache2": "", "apache2::mod_ssl": ""}}"#,
        );
        mkdirp::mkdirp(dir.path().join("cookbooks/.git"))?;
        let kitchen = Kitchen::new(dir.path());

        let names = kitchen
            .get_recipes()?
            .into_iter()
            .map(|recipe| recipe.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["apache2", "apache2::mod_ssl", "ntp"]);

        Ok(())
    }

    #[test]
    fn save_node_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let kitchen = Kitchen::new(dir.path());
        let mut node = Node::new("db1.example.com");
        node.set_run_list(["role[db]"]);

        kitchen.save_node(&node)?;
        assert_eq!(kitchen.get_node("db1.example.com")?, node);

        Ok(())
    }
}
