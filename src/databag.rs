// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Synthetic node data bag.
//!
//! Chef Solo cannot search for nodes, because there is no server to ask. To
//! make up for it, every node of the kitchen is written as an item of a data
//! bag named "node" right before a run. Recipes can then look up any node by
//! its id, complete with its merged attributes.
//!
//! The data bag is build output, not source. It is regenerated from scratch
//! for every run, and removed again once the run is over.

use crate::{
    attributes::{merge_node_attributes, AttributeError},
    expand::{expand_node, ExpandError},
    kitchen::{write_json, Catalog, Environment, Kitchen, KitchenError, Node},
};

use serde_json::Value;
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Name of generated data bag.
pub const NODE_DATA_BAG: &str = "node";

/// Generated node data bag of a kitchen.
#[derive(Debug, Clone)]
pub struct NodeDataBag {
    dir: PathBuf,
}

impl NodeDataBag {
    /// Construct handle to node data bag of kitchen.
    pub fn new(kitchen: &Kitchen) -> Self {
        Self {
            dir: kitchen.data_bags_dir().join(NODE_DATA_BAG),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.as_path()
    }

    /// Build one data bag item per node of kitchen.
    ///
    /// Any leftover data bag is removed first. The returned guard removes
    /// the data bag again once dropped, as does a failed build.
    ///
    /// # Errors
    ///
    /// - Return [`DataBagError::Kitchen`] if nodes or environments cannot be
    ///   loaded.
    /// - Return [`DataBagError::Expand`] if a node references unknown roles.
    /// - Return [`DataBagError::Attribute`] if a node references unknown
    ///   recipes.
    #[instrument(skip(self, kitchen, catalog), level = "debug")]
    pub fn build(&self, kitchen: &Kitchen, catalog: &Catalog) -> Result<DataBagGuard> {
        self.remove()?;
        mkdirp::mkdirp(&self.dir).map_err(|err| DataBagError::Io {
            path: self.dir.clone(),
            source: err,
        })?;
        let guard = DataBagGuard::new(self.clone());

        let mut environments: HashMap<String, Environment> = HashMap::new();
        let nodes = kitchen.get_nodes(None)?;
        for node in &nodes {
            let env_name = node.chef_environment().to_owned();
            if !environments.contains_key(&env_name) {
                let environment = kitchen.get_environment(&env_name)?;
                environments.insert(env_name.clone(), environment);
            }

            let item = node_item(node.clone(), catalog, &environments[&env_name])?;
            let id = data_bag_id(node.name());
            write_json(&self.dir.join(format!("{id}.json")), &item)?;
            debug!("wrote node data bag item {id:?}");
        }
        info!("built node data bag with {} items", nodes.len());

        Ok(guard)
    }

    /// Remove node data bag.
    ///
    /// Removing a data bag that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// - Return [`DataBagError::Io`] if data bag cannot be removed.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DataBagError::Io {
                path: self.dir.clone(),
                source: err,
            }),
        }
    }
}

/// Removes the node data bag when dropped.
#[derive(Debug)]
pub struct DataBagGuard {
    data_bag: Option<NodeDataBag>,
}

impl DataBagGuard {
    fn new(data_bag: NodeDataBag) -> Self {
        Self {
            data_bag: Some(data_bag),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.data_bag.as_ref().map(NodeDataBag::path)
    }

    /// Remove node data bag now, reporting failure.
    ///
    /// # Errors
    ///
    /// - Return [`DataBagError::Io`] if data bag cannot be removed.
    pub fn release(mut self) -> Result<()> {
        match self.data_bag.take() {
            Some(data_bag) => data_bag.remove(),
            None => Ok(()),
        }
    }

    /// Leave node data bag in place, returning its path.
    pub fn keep(mut self) -> Option<PathBuf> {
        self.data_bag.take().map(|data_bag| data_bag.path().to_path_buf())
    }
}

impl Drop for DataBagGuard {
    fn drop(&mut self) {
        if let Some(data_bag) = self.data_bag.take() {
            if let Err(error) = data_bag.remove() {
                warn!("{error}");
            }
        }
    }
}

/// Turn node into its data bag item.
///
/// # Errors
///
/// - Return [`DataBagError::Expand`] if node references unknown roles.
/// - Return [`DataBagError::Attribute`] if node references unknown recipes.
pub fn node_item(mut node: Node, catalog: &Catalog, environment: &Environment) -> Result<Node> {
    let expansion = expand_node(&node, catalog)?;
    let id = data_bag_id(node.name());
    node.insert("id", Value::String(id));
    node.insert("role", string_list(&expansion.role));
    node.insert("roles", string_list(&expansion.roles));
    node.insert("recipes", string_list(&expansion.recipes));

    merge_node_attributes(&mut node, &expansion, catalog, environment)?;
    add_automatic_attributes(&mut node);

    Ok(node)
}

fn string_list(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

/// Derive data bag item id from node name.
///
/// Dots, and anything else besides ASCII alphanumerics, `_`, and `-`, become
/// underscores.
pub fn data_bag_id(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Add `fqdn`, `hostname`, and `domain` derived from node name.
pub fn add_automatic_attributes(node: &mut Node) {
    let fqdn = node.name().to_owned();
    let (hostname, domain) = fqdn.split_once('.').unwrap_or((fqdn.as_str(), ""));
    let (hostname, domain) = (hostname.to_owned(), domain.to_owned());

    node.insert("hostname", Value::String(hostname));
    node.insert("domain", Value::String(domain));
    node.insert("fqdn", Value::String(fqdn));
}

/// All possible error types for node data bag building.
#[derive(Debug, thiserror::Error)]
pub enum DataBagError {
    /// Kitchen cannot be read, or item cannot be written.
    #[error(transparent)]
    Kitchen(#[from] KitchenError),

    /// Role expansion fails.
    #[error(transparent)]
    Expand(#[from] ExpandError),

    /// Attribute merging fails.
    #[error(transparent)]
    Attribute(#[from] AttributeError),

    /// Data bag directory cannot be created or removed.
    #[error("failed to access node data bag {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = DataBagError> = std::result::Result<T, E>;
