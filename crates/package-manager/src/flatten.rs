use crate::{
    remove_stale_flattened_aliases, symlink_package, ExistingLink, RemoveOrphansError, ResolvedNode,
    SymlinkPackageError,
};
use derive_more::{Display, Error};
use itertools::Itertools;
use miette::Diagnostic;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::Path,
};

/// Error type of [`FlattenDependencies`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum FlattenError {
    #[diagnostic(transparent)]
    SymlinkPackage(#[error(source)] SymlinkPackageError),

    #[diagnostic(transparent)]
    RemoveStaleAlias(#[error(source)] RemoveOrphansError),
}

/// Symlink every package of the graph into the root modules directory, the way npm lays out a flat
/// `node_modules`.
///
/// Shallower packages win a name. Root dependencies keep theirs.
#[must_use]
pub struct FlattenDependencies<'a> {
    pub nodes: &'a BTreeMap<String, ResolvedNode>,
    pub modules_dir: &'a Path,
    pub root_aliases: &'a BTreeSet<String>,
    pub skipped: &'a HashSet<String>,
    /// Aliases created by the previous install, by package id.
    pub previous_aliases_by_id: &'a BTreeMap<String, String>,
}

impl<'a> FlattenDependencies<'a> {
    /// Execute the subroutine and return the new aliases, by package id.
    pub async fn run(self) -> Result<BTreeMap<String, String>, FlattenError> {
        let FlattenDependencies { nodes, modules_dir, root_aliases, skipped, previous_aliases_by_id } = self;

        let mut taken: BTreeSet<&str> = BTreeSet::new();
        let mut aliases_by_id = BTreeMap::new();
        let candidates = nodes
            .values()
            .filter(|node| node.installable && !skipped.contains(node.pkg_id()))
            .sorted_by_key(|node| (node.depth, node.absolute_path.as_str()));
        for node in candidates {
            let name = node.name();
            if root_aliases.contains(name) || !taken.insert(name) {
                continue;
            }
            symlink_package(&node.hardlinked_location, &modules_dir.join(name), ExistingLink::ReplaceOutdated)
                .map_err(FlattenError::SymlinkPackage)?;
            aliases_by_id.insert(node.pkg_id().to_string(), name.to_string());
        }

        let stale_aliases = previous_aliases_by_id
            .values()
            .filter(|alias| !taken.contains(alias.as_str()) && !root_aliases.contains(*alias))
            .cloned()
            .collect::<Vec<_>>();
        remove_stale_flattened_aliases(modules_dir, stale_aliases)
            .await
            .map_err(FlattenError::RemoveStaleAlias)?;

        tracing::debug!(target: "knit::link", flattened = aliases_by_id.len());
        Ok(aliases_by_id)
    }
}
