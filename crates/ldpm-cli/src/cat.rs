//! Implementation of the `ldpm cat` command.

use anyhow::{Context, Result};
use ldpm_pkg::{Ldpm, PackageId};

/// Print the catalog of `package` as JSON on stdout.
pub fn cat(ldpm: &Ldpm, package: &str) -> Result<()> {
    let id = PackageId::parse(package).with_context(|| format!("Invalid package '{package}'"))?;
    let doc = ldpm
        .cat(&id)
        .with_context(|| format!("Failed to render catalog of {id}"))?;
    println!("{}", doc.to_json_pretty()?);
    Ok(())
}
