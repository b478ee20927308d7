use crate::ResolvedNode;
use itertools::{Either, Itertools};
use knit_lockfile::{dependency_path, Lockfile, PackageSnapshot, ResolvedDependencies};
use knit_package_manifest::{DependencyGroup, PackageManifest};
use std::collections::BTreeMap;

/// Lockfile entry of a resolved node, along with the nodes its references point to.
pub struct SnapshotUpdate<'a> {
    /// Key of the entry in `packages`.
    pub dependency_path: String,
    pub snapshot: PackageSnapshot,
    pub node: &'a ResolvedNode,
    pub dependencies: Vec<&'a ResolvedNode>,
    pub optional_dependencies: Vec<&'a ResolvedNode>,
}

/// Compute the lockfile entry of every resolved node.
///
/// References recorded by `lockfile` are kept unless a node overrides them, since nodes deeper than
/// the resolution depth may not have been looked at in this run.
pub fn update_lockfile<'a>(
    nodes: &'a BTreeMap<String, ResolvedNode>,
    lockfile: &Lockfile,
) -> Vec<SnapshotUpdate<'a>> {
    let registry = lockfile.registry.as_str();
    nodes
        .values()
        .map(|node| {
            let dependency_path = dependency_path::relative(registry, &node.absolute_path).to_string();
            let (optional_dependencies, dependencies): (Vec<_>, Vec<_>) = node
                .children
                .iter()
                .filter_map(|child| nodes.get(child))
                .partition_map(|child| match node.package.optional_dependencies.contains(child.name()) {
                    true => Either::Left(child),
                    false => Either::Right(child),
                });

            let previous = lockfile.packages.get(&dependency_path);
            let mut snapshot =
                PackageSnapshot::new(node.package.resolution.to_lockfile(&dependency_path, registry));
            snapshot.dependencies = merge_references(
                previous.map(|previous| &previous.dependencies),
                &dependencies,
                registry,
            );
            snapshot.optional_dependencies = merge_references(
                previous.map(|previous| &previous.optional_dependencies),
                &optional_dependencies,
                registry,
            );
            snapshot.dev = node.dev.then_some(true);
            snapshot.optional = node.optional.then_some(true);
            if node.pkg_id() != node.absolute_path {
                snapshot.id = Some(node.pkg_id().to_string());
            }
            if dependency_path::is_absolute(&dependency_path) {
                snapshot.name = Some(node.name().to_string());
                snapshot.version = Some(node.version().to_string());
            }

            let package = &node.package;
            snapshot.peer_dependencies =
                (!package.peer_dependencies.is_empty()).then(|| package.peer_dependencies.clone());
            snapshot.bundled_dependencies = package.bundled_dependencies.clone();
            snapshot.engines = package.engines.clone();
            snapshot.os = package.os.clone();
            snapshot.cpu = package.cpu.clone();
            snapshot.deprecated = package.deprecated.clone();

            SnapshotUpdate { dependency_path, snapshot, node, dependencies, optional_dependencies }
        })
        .collect()
}

fn merge_references(
    previous: Option<&ResolvedDependencies>,
    children: &[&ResolvedNode],
    registry: &str,
) -> ResolvedDependencies {
    let mut references = previous.cloned().unwrap_or_default();
    for child in children {
        let reference = dependency_path::absolute_path_to_ref(
            &child.absolute_path,
            child.name(),
            &child.package.resolution,
            registry,
        );
        references.insert(child.name().to_string(), reference);
    }
    references
}

/// Make the root maps of a lockfile match the manifest.
///
/// `references` holds the references of the root dependencies resolved in this run, by alias. Root
/// dependencies that were not resolved again keep their previous reference.
pub fn sync_root_dependencies(
    lockfile: &mut Lockfile,
    manifest: &PackageManifest,
    references: ResolvedDependencies,
) {
    let mut all_references = lockfile.root_dependencies();
    all_references.extend(references);

    lockfile.specifiers = manifest
        .dependencies([DependencyGroup::Prod, DependencyGroup::Dev, DependencyGroup::Optional])
        .map(|(alias, pref)| (alias.to_string(), pref.to_string()))
        .collect();
    lockfile.dependencies.clear();
    lockfile.dev_dependencies.clear();
    lockfile.optional_dependencies.clear();

    for (alias, reference) in all_references {
        let group = if manifest.optional_dependencies.contains_key(&alias) {
            &mut lockfile.optional_dependencies
        } else if manifest.dev_dependencies.contains_key(&alias) {
            &mut lockfile.dev_dependencies
        } else if manifest.dependencies.contains_key(&alias) {
            &mut lockfile.dependencies
        } else {
            continue;
        };
        group.insert(alias, reference);
    }
}
