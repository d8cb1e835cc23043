// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Role and recipe expansion.
//!
//! Roles may list other roles in their run list. Expanding a node means
//! following those references until every reachable role is known, then
//! collecting the recipes of all of them along with the node's own recipes.
//!
//! A role is only expanded again when it is reached closer to the node than
//! before, so self references and cycles terminate on their own, and the
//! result does not depend on run list order. Nesting deeper than
//! [`MAX_ROLE_DEPTH`] is cut off with a warning.
//!
//! Queries over the whole kitchen skip nodes that reference unknown roles
//! with a warning, so one dangling reference does not hide every other node.

use crate::kitchen::{Catalog, Kitchen, KitchenError, Node, RunList};

use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Deepest role nesting level that is still expanded.
pub const MAX_ROLE_DEPTH: usize = 5;

/// Complete role and recipe assignment of a node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Expansion {
    /// Roles listed directly in node run list.
    pub role: Vec<String>,

    /// Every role reachable from node run list.
    pub roles: Vec<String>,

    /// Every recipe of node and of all reachable roles.
    pub recipes: Vec<String>,
}

/// Roles listed directly in run list of node.
pub fn roles_in_node(node: &Node) -> BTreeSet<String> {
    node.run_list().roles().map(ToOwned::to_owned).collect()
}

/// Recipes listed directly in run list of node, in run list order.
pub fn recipes_in_node(node: &Node) -> Vec<String> {
    let mut recipes: Vec<String> = Vec::new();
    for recipe in node.run_list().recipes() {
        if !recipes.iter().any(|known| known == recipe) {
            recipes.push(recipe.into());
        }
    }

    recipes
}

/// Every role reachable from run list of node.
///
/// # Errors
///
/// - Return [`ExpandError::UnknownRole`] if a referenced role does not exist.
pub fn roles_in_node_recursive(node: &Node, catalog: &Catalog) -> Result<BTreeSet<String>> {
    let mut expanded = BTreeMap::new();
    collect_roles(&node.run_list(), node.name(), catalog, 0, &mut expanded)?;

    Ok(expanded.into_keys().collect())
}

/// Record every role reachable from run list along with the shallowest
/// depth it was reached at.
fn collect_roles(
    run_list: &RunList,
    referrer: &str,
    catalog: &Catalog,
    depth: usize,
    expanded: &mut BTreeMap<String, usize>,
) -> Result<()> {
    for name in run_list.roles() {
        // INVARIANT: Only expand a role again when it is reached at a
        // shallower depth than before.
        if expanded.get(name).is_some_and(|&known| known <= depth) {
            continue;
        }

        let role = catalog.role(name).ok_or_else(|| ExpandError::UnknownRole {
            role: name.into(),
            referrer: referrer.into(),
        })?;
        expanded.insert(name.to_owned(), depth);

        if depth >= MAX_ROLE_DEPTH {
            if role.run_list.roles().next().is_some() {
                warn!("role {name:?} nested too deep, its sub roles are not expanded");
            }
            continue;
        }

        collect_roles(&role.run_list, name, catalog, depth + 1, expanded)?;
    }

    Ok(())
}

/// Expand node into its full role and recipe sets.
///
/// All lists are sorted, and free of duplicates.
///
/// # Errors
///
/// - Return [`ExpandError::UnknownRole`] if a referenced role does not exist.
pub fn expand_node(node: &Node, catalog: &Catalog) -> Result<Expansion> {
    let role = roles_in_node(node);
    let roles = roles_in_node_recursive(node, catalog)?;

    let mut recipes = recipes_in_node(node).into_iter().collect::<BTreeSet<_>>();
    for name in &roles {
        if let Some(found) = catalog.role(name) {
            recipes.extend(found.run_list.recipes().map(ToOwned::to_owned));
        }
    }

    Ok(Expansion {
        role: role.into_iter().collect(),
        roles: roles.into_iter().collect(),
        recipes: recipes.into_iter().collect(),
    })
}

/// Membership query with optional trailing wildcard.
///
/// `"web*"` matches any member starting with `web`, and a lone `"*"`
/// matches any non-empty set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Prefix(String),
    Exact(String),
}

impl Pattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.into()),
            None => Self::Exact(pattern.into()),
        }
    }

    /// Check if any member matches pattern.
    pub fn matches_any<'a>(&self, members: impl IntoIterator<Item = &'a str>) -> bool {
        let mut members = members.into_iter();
        match self {
            Self::Prefix(prefix) => members.any(|member| member.starts_with(prefix.as_str())),
            Self::Exact(name) => members.any(|member| member == name),
        }
    }
}

/// Nodes whose expanded role set matches pattern.
///
/// Nodes referencing unknown roles are skipped with a warning.
///
/// # Errors
///
/// - Return [`ExpandError::Kitchen`] if nodes cannot be loaded.
pub fn nodes_with_role(
    kitchen: &Kitchen,
    catalog: &Catalog,
    pattern: &str,
    environment: Option<&str>,
) -> Result<Vec<Node>> {
    let pattern = Pattern::parse(pattern);
    let mut matched = Vec::new();
    for node in kitchen.get_nodes(environment)? {
        let Some(roles) = skip_unknown_role(&node, roles_in_node_recursive(&node, catalog))? else {
            continue;
        };
        if pattern.matches_any(roles.iter().map(String::as_str)) {
            matched.push(node);
        }
    }

    Ok(matched)
}

/// Nodes whose expanded recipe set matches pattern.
///
/// Nodes referencing unknown roles are skipped with a warning.
///
/// # Errors
///
/// - Return [`ExpandError::Kitchen`] if nodes cannot be loaded.
pub fn nodes_with_recipe(
    kitchen: &Kitchen,
    catalog: &Catalog,
    pattern: &str,
    environment: Option<&str>,
) -> Result<Vec<Node>> {
    let pattern = Pattern::parse(pattern);
    let mut matched = Vec::new();
    for node in kitchen.get_nodes(environment)? {
        let Some(expansion) = skip_unknown_role(&node, expand_node(&node, catalog))? else {
            continue;
        };
        if pattern.matches_any(expansion.recipes.iter().map(String::as_str)) {
            matched.push(node);
        }
    }

    Ok(matched)
}

/// Turn unknown role of a queried node into a warning.
fn skip_unknown_role<T>(node: &Node, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(found) => Ok(Some(found)),
        Err(ExpandError::UnknownRole { role, referrer }) => {
            warn!(
                "skipping node {:?}: role {role:?} referenced by {referrer:?} does not exist",
                node.name()
            );
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

/// Nodes carrying a tag that matches pattern.
///
/// # Errors
///
/// - Return [`ExpandError::Kitchen`] if nodes cannot be loaded.
pub fn nodes_with_tag(
    kitchen: &Kitchen,
    pattern: &str,
    environment: Option<&str>,
) -> Result<Vec<Node>> {
    let pattern = Pattern::parse(pattern);
    Ok(kitchen
        .get_nodes(environment)?
        .into_iter()
        .filter(|node| pattern.matches_any(node.tags()))
        .collect())
}

/// All possible error types for role expansion.
#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    /// Run list references a role that does not exist.
    #[error("role {role:?} referenced by {referrer:?} does not exist")]
    UnknownRole { role: String, referrer: String },

    /// Kitchen cannot be read.
    #[error(transparent)]
    Kitchen(#[from] KitchenError),
}

/// Friendly result alias :3
pub type Result<T, E = ExpandError> = std::result::Result<T, E>;
