//! Implementation of the `ldpm resolve` command.

use anyhow::{Context, Result};
use ldpm_pkg::{Ldpm, ResolvedNode};

/// Resolve `packages` and print one indented tree per root.
pub fn print_trees(ldpm: &Ldpm, packages: &[String]) -> Result<()> {
    let ids = crate::parse_packages(packages)?;
    let roots = ldpm.resolve(&ids).context("Failed to resolve packages")?;
    for root in &roots {
        print!("{}", render_tree(root));
    }
    Ok(())
}

/// One line per node, indented two spaces per level.
fn render_tree(root: &ResolvedNode) -> String {
    let mut out = String::new();
    for (depth, node) in root.walk() {
        out.push_str(&format!("{:indent$}{}\n", "", node.id, indent = depth * 2));
    }
    out
}
