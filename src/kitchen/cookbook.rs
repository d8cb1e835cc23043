// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Cookbook metadata handling.
//!
//! A cookbook may live in more than one cookbook path. The first path, in
//! priority order, that holds the cookbook along with a `metadata.json` file
//! wins wholesale. Metadata is never merged between paths.
//!
//! Cookbook authors usually only write `metadata.rb`. The JSON form is
//! compiled from it through knife whenever the Ruby source is newer than the
//! compiled copy.

use crate::kitchen::{model::Recipe, KitchenError, Result};

use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, warn};

const METADATA_JSON: &str = "metadata.json";
const METADATA_RB: &str = "metadata.rb";
const KNIFE: &str = "knife";

#[derive(Debug, Default, Deserialize)]
struct CookbookMetadata {
    #[serde(default)]
    version: Option<String>,

    #[serde(default)]
    dependencies: Value,

    #[serde(default)]
    attributes: BTreeMap<String, Value>,

    #[serde(default)]
    recipes: BTreeMap<String, Value>,
}

impl CookbookMetadata {
    fn dependency_names(&self) -> Vec<String> {
        match &self.dependencies {
            Value::Object(map) => map.keys().cloned().collect(),
            Value::Array(list) => list
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn attribute_defaults(&self) -> BTreeMap<String, Value> {
        self.attributes
            .iter()
            .map(|(key, declaration)| (key.clone(), declared_default(declaration)))
            .collect()
    }

    fn recipe_template(&self) -> Recipe {
        Recipe {
            name: String::new(),
            description: String::new(),
            version: self.version.clone(),
            dependencies: self.dependency_names(),
            attributes: self.attribute_defaults(),
        }
    }
}

/// Default value of an attribute declaration.
///
/// Attributes typed as `"hash"` always start out as an empty object.
fn declared_default(declaration: &Value) -> Value {
    if declaration.get("type").and_then(Value::as_str) == Some("hash") {
        return Value::Object(Default::default());
    }

    normalize_default(declaration.get("default").cloned().unwrap_or(Value::Null))
}

/// Normalize cookbook attribute default.
///
/// Metadata commonly spells booleans as the strings `"true"` and `"false"`.
/// These become real JSON booleans. Everything else is left as is.
pub fn normalize_default(value: Value) -> Value {
    match value.as_str() {
        Some("true") => Value::Bool(true),
        Some("false") => Value::Bool(false),
        _ => value,
    }
}

/// Load every recipe of target cookbook.
///
/// # Errors
///
/// - Return [`KitchenError::MissingCookbook`] if no cookbook path contains
///   the cookbook.
/// - Return [`KitchenError::MissingMetadata`] if the cookbook exists, but
///   no cookbook path provides metadata for it.
/// - Return [`KitchenError::Parse`] if metadata is malformed.
pub(crate) fn recipes_in_cookbook(
    cookbook_paths: &[PathBuf],
    name: &str,
    generate_metadata: bool,
) -> Result<Vec<Recipe>> {
    load_recipes(cookbook_paths, name, generate_metadata.then_some(KNIFE))
}

fn load_recipes(
    cookbook_paths: &[PathBuf],
    name: &str,
    knife: Option<&str>,
) -> Result<Vec<Recipe>> {
    let mut exists = false;
    let mut winner = None;

    for cookbook_path in cookbook_paths {
        let path = cookbook_path.join(name);
        if !path.is_dir() {
            continue;
        }
        exists = true;

        if let Some(knife) = knife {
            regenerate_metadata(knife, cookbook_path, name);
        }

        let metadata_path = path.join(METADATA_JSON);
        match super::read_json::<CookbookMetadata>(&metadata_path) {
            Ok(found) => {
                debug!("use metadata at {}", metadata_path.display());
                winner = Some((path, found));
                break;
            }
            // INVARIANT: Missing metadata means try the next cookbook path.
            Err(KitchenError::NotFound { .. }) => continue,
            Err(error) => return Err(error),
        }
    }

    if !exists {
        return Err(KitchenError::MissingCookbook { name: name.into() });
    }
    let (cookbook_dir, metadata) =
        winner.ok_or_else(|| KitchenError::MissingMetadata { name: name.into() })?;

    let template = metadata.recipe_template();
    let mut recipes = metadata
        .recipes
        .iter()
        .map(|(recipe, description)| Recipe {
            name: recipe.clone(),
            description: description.as_str().unwrap_or_default().into(),
            ..template.clone()
        })
        .collect::<Vec<_>>();

    for recipe in undeclared_recipe_files(&cookbook_dir, name)? {
        if !recipes.iter().any(|known| known.name == recipe) {
            recipes.push(Recipe {
                name: recipe,
                ..template.clone()
            });
        }
    }

    if recipes.is_empty() {
        recipes.push(Recipe {
            name: name.into(),
            description: "This cookbook has no default recipe".into(),
            ..template
        });
    }

    Ok(recipes)
}

/// Qualified names of recipe files found under `recipes/` of a cookbook.
///
/// Only the cookbook directory that won metadata lookup is scanned.
fn undeclared_recipe_files(cookbook_dir: &Path, name: &str) -> Result<Vec<String>> {
    let recipes_dir = cookbook_dir.join("recipes");
    if !recipes_dir.is_dir() {
        return Ok(Vec::new());
    }

    let pattern = format!(
        "{}/*.rb",
        glob::Pattern::escape(recipes_dir.to_string_lossy().as_ref())
    );
    let mut found = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = entry.map_err(|err| KitchenError::Io {
            path: err.path().to_path_buf(),
            source: err.into_error(),
        })?;
        let Some(stem) = path.file_stem().map(|stem| stem.to_string_lossy()) else {
            continue;
        };

        let recipe = if stem == "default" {
            name.to_string()
        } else {
            format!("{name}::{stem}")
        };
        if !found.contains(&recipe) {
            found.push(recipe);
        }
    }

    Ok(found)
}

/// Compile `metadata.rb` into `metadata.json` when the former is newer.
///
/// Failure is never fatal. The caller continues with whatever metadata
/// happens to be on disk.
fn regenerate_metadata(knife: &str, cookbook_path: &Path, name: &str) {
    let source = cookbook_path.join(name).join(METADATA_RB);
    let compiled = cookbook_path.join(name).join(METADATA_JSON);
    if !source.exists() || !is_stale(&source, &compiled) {
        return;
    }

    debug!("regenerate metadata for cookbook {name:?}");
    let output = Command::new(knife)
        .arg("cookbook")
        .arg("metadata")
        .arg("-o")
        .arg(cookbook_path)
        .arg(name)
        .output();

    match output {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(
            "could not generate metadata.json for cookbook {name:?}: {}",
            String::from_utf8_lossy(&output.stderr).trim_end()
        ),
        Err(error) => warn!("could not generate metadata.json for cookbook {name:?}: {error}"),
    }
}

fn is_stale(source: &Path, compiled: &Path) -> bool {
    let modified = |path: &Path| fs::metadata(path).and_then(|meta| meta.modified()).ok();
    match (modified(source), modified(compiled)) {
        (Some(source), Some(compiled)) => source > compiled,
        (_, None) => true,
        (None, Some(_)) => false,
    }
}
