// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Node plugins.
//!
//! A plugin is a small action executed against a single node outside of a
//! regular Chef Solo run, e.g., recording the IP address of a node into its
//! node file. Plugins are compiled in and looked up by name through
//! [`PluginRegistry`]. The kitchen configuration may restrict which of them
//! are allowed to run.

use crate::{
    config::PluginSettings,
    kitchen::{Kitchen, KitchenError, Node},
    sync::{discover_ip, Target, Transport},
};

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

/// Everything a plugin may touch.
pub struct PluginContext<'a> {
    /// Kitchen the node belongs to.
    pub kitchen: &'a Kitchen,

    /// Transport to reach the node with.
    pub transport: &'a dyn Transport,

    /// Login target of the node.
    pub target: Target,
}

/// Action executed against a single node.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name used to look plugin up.
    fn name(&self) -> &str;

    /// One line summary for listings.
    fn description(&self) -> &str {
        ""
    }

    /// Run plugin against node.
    async fn execute(&self, node: &mut Node, ctx: &PluginContext<'_>) -> Result<()>;
}

/// Compiled plugins by name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Box<dyn Plugin>>,
}

impl PluginRegistry {
    /// Construct empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct registry holding every built-in plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SaveIp);
        registry
    }

    /// Add plugin, replacing any plugin of the same name.
    pub fn register(&mut self, plugin: impl Plugin + 'static) {
        self.plugins.insert(plugin.name().to_string(), Box::new(plugin));
    }

    /// Iterate over registered plugins in name order.
    pub fn plugins(&self) -> impl Iterator<Item = &dyn Plugin> {
        self.plugins.values().map(Box::as_ref)
    }

    /// Look up plugin allowed to run under target settings.
    ///
    /// An empty enabled list in `settings` allows every registered plugin.
    ///
    /// # Errors
    ///
    /// - Return [`PluginError::Unknown`] if no plugin has that name.
    /// - Return [`PluginError::Disabled`] if plugin is not enabled.
    pub fn load(&self, name: &str, settings: &PluginSettings) -> Result<&dyn Plugin> {
        let plugin = self
            .plugins
            .get(name)
            .ok_or_else(|| PluginError::Unknown {
                name: name.into(),
                available: self.plugins.keys().cloned().collect::<Vec<_>>().join(", "),
            })?;

        if !settings.enabled.is_empty() && !settings.enabled.iter().any(|enabled| enabled == name) {
            return Err(PluginError::Disabled { name: name.into() });
        }

        Ok(plugin.as_ref())
    }
}

/// Discover IP address of node, and persist it into its node file.
#[derive(Debug, Default, Clone, Copy)]
pub struct SaveIp;

#[async_trait]
impl Plugin for SaveIp {
    fn name(&self) -> &str {
        "save_ip"
    }

    fn description(&self) -> &str {
        "store the IP address of a node in its node file"
    }

    async fn execute(&self, node: &mut Node, ctx: &PluginContext<'_>) -> Result<()> {
        let address = discover_ip(ctx.transport, &ctx.target)
            .await
            .ok_or_else(|| PluginError::Failed {
                plugin: self.name().into(),
                message: format!("could not determine ip address of {:?}", node.name()),
            })?;

        node.set_ipaddress(address.as_str());
        ctx.kitchen.save_node(node)?;
        info!("{}: saved ip address {address}", node.name());

        Ok(())
    }
}

/// All possible error types for plugins.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// No plugin of that name is registered.
    #[error("no plugin named {name:?}, available plugins: {available}")]
    Unknown { name: String, available: String },

    /// Plugin exists, but kitchen configuration does not enable it.
    #[error("plugin {name:?} is not enabled in kitchen configuration")]
    Disabled { name: String },

    /// Plugin ran, but could not do its job.
    #[error("plugin {plugin:?} failed: {message}")]
    Failed { plugin: String, message: String },

    #[error(transparent)]
    Kitchen(#[from] KitchenError),
}

/// Friendly result alias :3
pub type Result<T, E = PluginError> = std::result::Result<T, E>;
