//! Implementation of the `ldpm install` command.

use anyhow::{Context, Result};
use ldpm_pkg::{InstallOptions, Ldpm};
use std::path::PathBuf;

/// Arguments of the install command.
#[derive(Debug)]
pub struct InstallArgs {
    /// Packages as given on the command line.
    pub packages: Vec<String>,
    /// Directory to install into.
    pub destination: PathBuf,
    /// Install roots directly under the destination.
    pub top: bool,
    /// Include script files.
    pub all: bool,
    /// Use the local package cache.
    pub cache: bool,
}

/// Install the requested packages and print where they went.
pub fn install(ldpm: &Ldpm, args: &InstallArgs) -> Result<()> {
    let ids = crate::parse_packages(&args.packages)?;
    let options = InstallOptions {
        top: args.top,
        all: args.all,
        cache: args.cache,
    };

    let roots = ldpm
        .install(&ids, options, &args.destination)
        .with_context(|| format!("Failed to install into {}", args.destination.display()))?;

    for dir in &roots {
        println!("+ {}", dir.display());
    }
    Ok(())
}
