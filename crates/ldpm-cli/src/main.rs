//! ldpm - command-line client for the linked data package registry

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ldpm_pkg::{CacheStore, Config, Ldpm, PackageId};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cat;
mod install;
mod tree;

#[derive(Parser)]
#[command(name = "ldpm")]
#[command(version)]
#[command(about = "Linked data package manager", long_about = None)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry base URL
    #[arg(long, global = true)]
    registry: Option<String>,

    /// Cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages and their data dependencies
    Install {
        /// Packages to install (name or name@version)
        #[arg(required = true)]
        packages: Vec<String>,

        /// Directory to install into
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Install at the top level instead of under datapackages/
        #[arg(long)]
        top: bool,

        /// Install script files as well as data files
        #[arg(short, long)]
        all: bool,

        /// Use the local package cache
        #[arg(short, long)]
        cache: bool,
    },

    /// Print the JSON-LD catalog of a package
    Cat {
        /// Package (name or name@version)
        package: String,
    },

    /// Print the resolved dependency tree of packages
    Resolve {
        /// Packages to resolve (name or name@version)
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Manage the local package cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Print the cache directory
    Dir,
    /// Remove every cached package
    Clean,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Parse package arguments such as `census` or `census@1.0.0`.
fn parse_packages(packages: &[String]) -> Result<Vec<PackageId>> {
    packages
        .iter()
        .map(|spec| {
            PackageId::parse(spec).with_context(|| format!("Invalid package '{spec}'"))
        })
        .collect()
}

/// Load the configuration file, then apply environment and flag overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match cli.config.clone().or_else(Config::default_path) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    }
    .from_env();

    if let Some(registry) = &cli.registry {
        config.registry.clone_from(registry);
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache_dir.clone_from(cache_dir);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    tracing::debug!(registry = %config.registry, cache_dir = ?config.cache_dir, "configuration loaded");

    match cli.command {
        Commands::Install {
            packages,
            dir,
            top,
            all,
            cache,
        } => {
            let ldpm = Ldpm::new(config).context("Failed to create registry client")?;
            let options = install::InstallArgs {
                packages,
                destination: dir,
                top,
                all,
                cache,
            };
            install::install(&ldpm, &options)?;
        }

        Commands::Cat { package } => {
            let ldpm = Ldpm::new(config).context("Failed to create registry client")?;
            cat::cat(&ldpm, &package)?;
        }

        Commands::Resolve { packages } => {
            let ldpm = Ldpm::new(config).context("Failed to create registry client")?;
            tree::print_trees(&ldpm, &packages)?;
        }

        Commands::Cache { command } => match command {
            CacheCommand::Dir => println!("{}", config.cache_dir.display()),
            CacheCommand::Clean => {
                CacheStore::open(config.cache_dir.clone())
                    .clear()
                    .context("Failed to clean the cache")?;
                println!("Cache cleaned");
            }
        },
    }

    Ok(())
}
