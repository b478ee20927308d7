use crate::{dependency_path, Lockfile, PackageSnapshot, ResolvedDependencies};
use knit_package_manifest::{DependencyGroup, PackageManifest};
use std::collections::{BTreeMap, HashSet};

impl Lockfile {
    /// Drop everything the manifest no longer reaches and recompute the `dev`/`optional` flags of the
    /// remaining snapshots.
    pub fn prune(self, manifest: &PackageManifest) -> Lockfile {
        let wanted: HashSet<&str> = manifest
            .dependencies([DependencyGroup::Prod, DependencyGroup::Dev, DependencyGroup::Optional])
            .map(|(name, _)| name)
            .collect();
        let is_wanted = |name: &String, _: &mut String| wanted.contains(name.as_str());

        let Lockfile {
            lockfile_version,
            lockfile_minor_version,
            registry,
            mut specifiers,
            mut dependencies,
            mut dev_dependencies,
            mut optional_dependencies,
            packages,
        } = self;
        specifiers.retain(is_wanted);
        dependencies.retain(is_wanted);
        dev_dependencies.retain(is_wanted);
        optional_dependencies.retain(is_wanted);

        let prod = reachable(&packages, [&dependencies, &optional_dependencies], Edges::All);
        let dev = reachable(&packages, [&dev_dependencies], Edges::All);
        let non_optional = reachable(&packages, [&dependencies, &dev_dependencies], Edges::Regular);

        let packages = packages
            .into_iter()
            .filter_map(|(path, mut snapshot)| {
                snapshot.dev = match (prod.contains(&path), dev.contains(&path)) {
                    (false, false) => return None,
                    (true, false) => Some(false),
                    (false, true) => Some(true),
                    (true, true) => None,
                };
                snapshot.optional = (!non_optional.contains(&path)).then_some(true);
                Some((path, snapshot))
            })
            .collect();

        Lockfile {
            lockfile_version,
            lockfile_minor_version,
            registry,
            specifiers,
            dependencies,
            dev_dependencies,
            optional_dependencies,
            packages,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Edges {
    /// Follow `dependencies` and `optionalDependencies`.
    All,
    /// Follow `dependencies` only.
    Regular,
}

fn reachable<const N: usize>(
    packages: &BTreeMap<String, PackageSnapshot>,
    roots: [&ResolvedDependencies; N],
    edges: Edges,
) -> HashSet<String> {
    let mut visited = HashSet::new();
    let mut stack: Vec<(&str, &str)> = roots
        .into_iter()
        .flatten()
        .map(|(name, reference)| (name.as_str(), reference.as_str()))
        .collect();

    while let Some((name, reference)) = stack.pop() {
        let Some(path) = dependency_path::ref_to_relative(reference, name) else { continue };
        if visited.contains(&path) {
            continue;
        }
        let Some(snapshot) = packages.get(&path) else {
            if edges == Edges::All && !is_local_directory(&path) {
                tracing::warn!(target: "knit::lockfile", "Cannot find resolution of {path} in lockfile");
            }
            continue;
        };
        stack.extend(snapshot.dependencies.iter().map(|(name, reference)| (name.as_str(), reference.as_str())));
        if edges == Edges::All {
            stack.extend(
                snapshot
                    .optional_dependencies
                    .iter()
                    .map(|(name, reference)| (name.as_str(), reference.as_str())),
            );
        }
        visited.insert(path);
    }

    visited
}

fn is_local_directory(path: &str) -> bool {
    path.starts_with("file:")
        && ![".tgz", ".tar.gz", ".tar"].iter().any(|extension| path.ends_with(extension))
}
