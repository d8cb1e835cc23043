// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Masterless Chef Solo orchestration.
//!
//! Oxichef drives Chef Solo runs over SSH against a fleet of nodes whose
//! configuration lives in a plain directory called the __kitchen__. There is
//! no Chef Server. Everything a server would normally compute, e.g., the final
//! attribute set of a node, or the answer to "which nodes have role X?", is
//! computed locally from the kitchen and shipped to the node right before the
//! run.
//!
//! # Kitchen Layout
//!
//! ```text
//! kitchen.toml
//! nodes/<fqdn>.json
//! roles/<name>.json
//! environments/<name>.json
//! cookbooks/<name>/metadata.json
//! site-cookbooks/<name>/metadata.json
//! data_bags/<bag>/<item>.json
//! data_bags/node/<id>.json      <- generated for every run, then removed
//! ```
//!
//! # See Also
//!
//! 1. [`kitchen`]
//! 2. [`databag`]
//! 3. [`sync`]

pub mod attributes;
pub mod config;
pub mod databag;
pub mod expand;
pub mod kitchen;
pub mod path;
pub mod plugin;
pub mod sync;

pub use config::KitchenConfig;
pub use kitchen::{Catalog, Environment, Kitchen, Node, Recipe, Role};
pub use sync::{NodeOutcome, NodeReport, Synchronizer};
