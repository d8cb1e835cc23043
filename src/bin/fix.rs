// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxichef::{
    config::KitchenConfig,
    databag::NodeDataBag,
    expand::{nodes_with_recipe, nodes_with_role, nodes_with_tag},
    path::{find_kitchen_root, KITCHEN_CONFIG},
    plugin::{PluginContext, PluginRegistry},
    sync::{OpenSsh, Target},
    Kitchen, Node, NodeOutcome, Synchronizer,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Confirm;
use std::{fs, path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "fix [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub global: GlobalOptions,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let global = self.global;
        match self.command {
            Command::Node(opts) => run_node(global, opts).await,
            Command::Role(opts) => run_shortcut(global, opts, "role").await,
            Command::Recipe(opts) => run_shortcut(global, opts, "recipe").await,
            Command::Plugin(opts) => run_plugin(global, opts).await,
            Command::NodesWithRole(opts) => run_query(global, opts, Query::Role),
            Command::NodesWithRecipe(opts) => run_query(global, opts, Query::Recipe),
            Command::NodesWithTag(opts) => run_query(global, opts, Query::Tag),
            Command::List(opts) => run_list(global, opts),
            Command::BuildDataBag => run_build_data_bag(global),
        }
    }
}

#[derive(Args, Clone, Debug)]
struct GlobalOptions {
    /// Only consider nodes of this chef environment.
    #[arg(short, long, global = true, value_name = "environment")]
    pub env: Option<String>,

    /// Debug logging, both locally and for Chef Solo.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Ask Chef Solo what it would do without doing it.
    #[arg(short, long, global = true)]
    pub why_run: bool,

    /// Maximum number of nodes configured at once.
    #[arg(short = 'j', long, global = true, value_name = "count")]
    pub concurrency: Option<usize>,

    /// Overwrite node files even if they already exist.
    #[arg(short, long, global = true)]
    pub force_save: bool,

    /// Do not ask for confirmation.
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Kitchen directory, defaults to the closest one holding kitchen.toml.
    #[arg(short = 'C', long, global = true, value_name = "path")]
    pub kitchen: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Configure nodes with their own run list.
    #[command(override_usage = "fix node [options] <node>... | all")]
    Node(NodeOptions),

    /// Apply single role to nodes.
    #[command(override_usage = "fix role [options] <role> --node <node>...")]
    Role(ShortcutOptions),

    /// Apply single recipe to nodes.
    #[command(override_usage = "fix recipe [options] <recipe> --node <node>...")]
    Recipe(ShortcutOptions),

    /// Run plugin against nodes.
    #[command(override_usage = "fix plugin [options] <plugin> --node <node>...")]
    Plugin(ShortcutOptions),

    /// List nodes having a matching role.
    #[command(override_usage = "fix nodes-with-role [options] <pattern>")]
    NodesWithRole(QueryOptions),

    /// List nodes having a matching recipe.
    #[command(override_usage = "fix nodes-with-recipe [options] <pattern>")]
    NodesWithRecipe(QueryOptions),

    /// List nodes having a matching tag.
    #[command(override_usage = "fix nodes-with-tag [options] <pattern>")]
    NodesWithTag(QueryOptions),

    /// List kitchen contents.
    #[command(override_usage = "fix list [options] <target>")]
    List(ListOptions),

    /// Build node data bag and leave it in place for inspection.
    #[command(override_usage = "fix build-data-bag [options]")]
    BuildDataBag,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct NodeOptions {
    /// Names of nodes to configure, or "all".
    #[arg(required = true, value_name = "node")]
    pub names: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ShortcutOptions {
    /// Name of role, recipe, or plugin.
    #[arg(required = true, value_name = "name")]
    pub name: String,

    /// Nodes to act on.
    #[arg(short, long = "node", required = true, value_name = "node")]
    pub nodes: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct QueryOptions {
    /// Exact name, prefix ending in "*", or "*" alone.
    #[arg(required = true, value_name = "pattern")]
    pub pattern: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ListOptions {
    #[arg(value_enum, value_name = "target")]
    pub target: ListTarget,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ListTarget {
    Nodes,
    Roles,
    Recipes,
    Environments,
    Plugins,
}

#[derive(Clone, Copy, Debug)]
enum Query {
    Role,
    Recipe,
    Tag,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.global.verbose { "debug" } else { "info" };
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run().await {
        error!("Fatal error: {error:?}");
        exit(1);
    }

    exit(0)
}

/// Locate kitchen and load its configuration, applying option overrides.
fn open_kitchen(global: &GlobalOptions) -> Result<(Kitchen, KitchenConfig)> {
    let start = match &global.kitchen {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let root = find_kitchen_root(&start)?;
    let path = root.join(KITCHEN_CONFIG);
    let mut config = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .parse::<KitchenConfig>()
        .with_context(|| format!("failed to parse {}", path.display()))?;

    config.run.verbose |= global.verbose;
    config.run.why_run |= global.why_run;
    if let Some(concurrency) = global.concurrency {
        config.connection.concurrency = concurrency;
    }
    config.validate()?;

    let kitchen = Kitchen::from_config(root, &config);
    Ok((kitchen, config))
}

async fn run_node(global: GlobalOptions, opts: NodeOptions) -> Result<()> {
    let (kitchen, config) = open_kitchen(&global)?;
    let nodes = if opts.names.iter().any(|name| name == "all") {
        let nodes = kitchen.get_nodes(global.env.as_deref())?;
        if nodes.is_empty() {
            bail!("no nodes found in {}", kitchen.nodes_dir().display());
        }

        let names = nodes.iter().map(Node::name).collect::<Vec<_>>().join(", ");
        info!("configuring all nodes: {names}");
        if !global.yes
            && !Confirm::new(&format!("Configure all {} nodes?", nodes.len()))
                .with_default(false)
                .prompt()?
        {
            info!("aborted");
            return Ok(());
        }

        nodes
    } else {
        opts.names
            .iter()
            .map(|name| kitchen.get_node(name))
            .collect::<Result<Vec<_>, _>>()?
    };

    converge(kitchen, config, nodes, global.force_save).await
}

async fn run_shortcut(global: GlobalOptions, opts: ShortcutOptions, kind: &str) -> Result<()> {
    let (kitchen, config) = open_kitchen(&global)?;
    let mut nodes = Vec::new();
    for name in &opts.nodes {
        let mut node = kitchen.get_node(name)?;
        node.set_run_list([format!("{kind}[{}]", opts.name)]);
        nodes.push(node);
    }

    converge(kitchen, config, nodes, global.force_save).await
}

async fn converge(kitchen: Kitchen, config: KitchenConfig, nodes: Vec<Node>, force_save: bool) -> Result<()> {
    let style = ProgressStyle::with_template("{elapsed_precise:.green}  [{wide_bar:.yellow/blue}]  {pos}/{len} nodes")?
        .progress_chars("-Cco.");
    let progress = ProgressBar::new(nodes.len() as u64).with_style(style);

    let reports = Synchronizer::new(kitchen, config, OpenSsh::new())
        .force_save(force_save)
        .with_progress(progress)
        .converge_all(nodes)
        .await?;

    let mut failed = 0;
    for report in &reports {
        match &report.result {
            Ok(NodeOutcome::Converged) => info!("{}: done", report.node),
            Ok(NodeOutcome::Skipped) => info!("{}: skipped dummy node", report.node),
            Err(error) => {
                failed += 1;
                error!("{}: {error}", report.node);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} nodes failed", reports.len());
    }

    Ok(())
}

async fn run_plugin(global: GlobalOptions, opts: ShortcutOptions) -> Result<()> {
    let (kitchen, config) = open_kitchen(&global)?;
    let registry = PluginRegistry::with_builtins();
    let plugin = registry.load(&opts.name, &config.plugins)?;
    let transport = OpenSsh::new();

    for name in &opts.nodes {
        let mut node = kitchen.get_node(name)?;
        let ctx = PluginContext {
            kitchen: &kitchen,
            transport: &transport,
            target: Target::from_config(name.as_str(), &config),
        };
        info!("running plugin {:?} on {name}", plugin.name());
        plugin.execute(&mut node, &ctx).await?;
    }

    Ok(())
}

fn run_query(global: GlobalOptions, opts: QueryOptions, query: Query) -> Result<()> {
    let (kitchen, _) = open_kitchen(&global)?;
    let env = global.env.as_deref();
    let nodes = match query {
        Query::Role => nodes_with_role(&kitchen, &kitchen.catalog()?, &opts.pattern, env)?,
        Query::Recipe => nodes_with_recipe(&kitchen, &kitchen.catalog()?, &opts.pattern, env)?,
        Query::Tag => nodes_with_tag(&kitchen, &opts.pattern, env)?,
    };

    for node in &nodes {
        match node.ipaddress() {
            Some(address) => println!("{}  {address}", node.name()),
            None => println!("{}", node.name()),
        }
    }
    info!("found {} nodes", nodes.len());

    Ok(())
}

fn run_list(global: GlobalOptions, opts: ListOptions) -> Result<()> {
    let (kitchen, _) = open_kitchen(&global)?;
    match opts.target {
        ListTarget::Nodes => {
            for node in kitchen.get_nodes(global.env.as_deref())? {
                println!("{}  [{}]", node.name(), node.chef_environment());
            }
        }
        ListTarget::Roles => {
            for role in kitchen.get_roles()? {
                println!("{:<32} {}", role.fullname, role.description);
            }
        }
        ListTarget::Recipes => {
            for recipe in kitchen.get_recipes()? {
                println!("{:<32} {}", recipe.name, recipe.description);
            }
        }
        ListTarget::Environments => {
            for environment in kitchen.get_environments()? {
                println!("{:<32} {}", environment.name, environment.description);
            }
        }
        ListTarget::Plugins => {
            for plugin in PluginRegistry::with_builtins().plugins() {
                println!("{:<32} {}", plugin.name(), plugin.description());
            }
        }
    }

    Ok(())
}

fn run_build_data_bag(global: GlobalOptions) -> Result<()> {
    let (kitchen, _) = open_kitchen(&global)?;
    let catalog = kitchen.catalog()?;
    let guard = NodeDataBag::new(&kitchen).build(&kitchen, &catalog)?;
    if let Some(path) = guard.keep() {
        info!("node data bag written to {}", path.display());
    }

    Ok(())
}
