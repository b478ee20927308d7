use crate::{
    Link, LinkError, LinkResult, NodeId, PkgAddress, ResolveContext, ResolveDependenciesError,
    ResolveOptions, TopParent, TreeNode,
};
use derive_more::{Display, Error};
use knit_lockfile::{dependency_path, LoadLockfileError, Lockfile, ResolvedDependencies, SaveLockfileError};
use knit_modules_yaml::{CompatibilityError, CompatibilityOptions, Modules, ReadModulesError, WriteModulesError};
use knit_npmrc::Npmrc;
use knit_package_manifest::{DependencyGroup, PackageManifest};
use knit_store_controller::StoreController;
use miette::Diagnostic;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};

/// Error type of [`Install`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum InstallError {
    #[diagnostic(transparent)]
    ReadModules(#[error(source)] ReadModulesError),

    #[diagnostic(transparent)]
    Compatibility(#[error(source)] CompatibilityError),

    #[display("Failed to remove {dir:?}: {error}")]
    #[diagnostic(code(knit_package_manager::remove_modules_dir))]
    RemoveModulesDir {
        dir: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[diagnostic(transparent)]
    LoadLockfile(#[error(source)] LoadLockfileError),

    #[diagnostic(transparent)]
    ResolveDependencies(#[error(source)] ResolveDependenciesError),

    #[diagnostic(transparent)]
    Link(#[error(source)] LinkError),

    #[diagnostic(transparent)]
    SaveLockfile(#[error(source)] SaveLockfileError),

    #[diagnostic(transparent)]
    WriteModules(#[error(source)] WriteModulesError),
}

/// What an install did.
#[derive(Debug)]
pub struct InstallSummary {
    /// Root dependencies resolved in this run.
    pub root_addresses: Vec<PkgAddress>,
    /// Absolute paths of every resolved node.
    pub resolved_paths: Vec<String>,
    /// Absolute paths of the nodes that were (re)linked.
    pub updated_paths: Vec<String>,
    pub removed_ids: BTreeSet<String>,
}

/// This subroutine does everything `knit install` is supposed to do.
#[must_use]
pub struct Install<'a> {
    pub config: &'a Npmrc,
    pub manifest: &'a PackageManifest,
    pub store: &'a dyn StoreController,
    /// Directory of the manifest and of the wanted lockfile.
    pub project_dir: &'a Path,
}

impl<'a> Install<'a> {
    /// Execute the subroutine.
    pub async fn run(self) -> Result<InstallSummary, InstallError> {
        let Install { config, manifest, store, project_dir } = self;
        let modules_dir = config.modules_dir.as_path();

        tracing::info!(target: "knit::install", "Start all");

        let modules = read_modules(config)?;
        let wanted_lockfile = Lockfile::load_wanted(project_dir)
            .map_err(InstallError::LoadLockfile)?
            .unwrap_or_else(|| Lockfile::new(&config.registry));
        let current_lockfile = Lockfile::load_current(modules_dir)
            .map_err(InstallError::LoadLockfile)?
            .unwrap_or_else(|| Lockfile::new(&config.registry));

        let wanted_dependencies = manifest.root_wanted_dependencies();
        let prefs: HashMap<&str, &str> = wanted_dependencies
            .iter()
            .filter_map(|wanted| Some((wanted.alias.as_deref()?, wanted.pref.as_str())))
            .collect();
        let locked_root_dependencies: ResolvedDependencies = wanted_lockfile
            .root_dependencies()
            .into_iter()
            .filter(|(alias, _)| {
                wanted_lockfile.specifiers.get(alias).map(String::as_str) == prefs.get(alias.as_str()).copied()
            })
            .collect();

        let ctx = ResolveContext::new(config, store, project_dir, &wanted_lockfile, &current_lockfile);
        for id in modules.iter().flat_map(|modules| &modules.skipped) {
            ctx.skipped.insert(id.clone());
        }
        let root_addresses = ctx
            .resolve_dependencies(wanted_dependencies, ResolveOptions::root(locked_root_dependencies, config.update))
            .await
            .map_err(InstallError::ResolveDependencies)?;
        ctx.build_pending_trees();
        let graph = ctx.into_graph();
        tracing::debug!(target: "knit::install", packages = graph.installs.len(), skipped = graph.skipped.len());

        let top_parents = top_parents(&wanted_lockfile, manifest, &root_addresses);
        let prod_roots = root_addresses
            .iter()
            .filter(|address| !is_dev_only(manifest, &address.alias))
            .map(|address| &address.node_id)
            .collect();
        let non_optional_roots = root_addresses
            .iter()
            .filter(|address| !manifest.optional_dependencies.contains_key(&address.alias))
            .map(|address| &address.node_id)
            .collect();
        let non_dev_ids = reachable_ids(&graph.tree, prod_roots, |_, _| true);
        let non_optional_ids = reachable_ids(&graph.tree, non_optional_roots, |node, alias| {
            graph
                .installs
                .get(&node.pkg_id)
                .map_or(true, |package| !package.optional_dependencies.contains(alias))
        });

        let flattened_aliases_by_id =
            modules.map(|modules| modules.flattened_aliases_by_id).unwrap_or_default();
        let LinkResult {
            resolved_nodes,
            wanted_lockfile,
            current_lockfile,
            updated_paths,
            removed_ids,
            flattened_aliases_by_id,
        } = Link {
            config,
            store,
            prefix: project_dir,
            manifest,
            graph: &graph,
            root_addresses: &root_addresses,
            top_parents: &top_parents,
            non_dev_ids: &non_dev_ids,
            non_optional_ids: &non_optional_ids,
            wanted_lockfile,
            current_lockfile: &current_lockfile,
            flattened_aliases_by_id,
        }
        .run()
        .await
        .map_err(InstallError::Link)?;

        if !config.dry_run {
            if config.lockfile {
                wanted_lockfile.save_wanted(project_dir).map_err(InstallError::SaveLockfile)?;
            }
            current_lockfile.save_current(modules_dir).map_err(InstallError::SaveLockfile)?;

            let mut modules = Modules::new(
                config.store_dir.to_string_lossy(),
                config.independent_leaves,
                config.shamefully_flatten,
            );
            modules.skipped = graph.skipped.iter().cloned().collect();
            modules.skipped.sort();
            modules.flattened_aliases_by_id = flattened_aliases_by_id;
            modules.write(modules_dir).map_err(InstallError::WriteModules)?;
        }

        tracing::info!(target: "knit::install", "Complete all");

        Ok(InstallSummary {
            root_addresses,
            resolved_paths: resolved_nodes.into_keys().collect(),
            updated_paths,
            removed_ids,
        })
    }
}

/// Read the state of the modules dir and make sure it can be reused.
///
/// With `force`, an incompatible modules dir is removed and the state is discarded.
fn read_modules(config: &Npmrc) -> Result<Option<Modules>, InstallError> {
    let modules_dir = config.modules_dir.as_path();
    let Some(modules) = Modules::read(modules_dir).map_err(InstallError::ReadModules)? else {
        return Ok(None);
    };
    let options = CompatibilityOptions {
        store_dir: &config.store_dir,
        modules_dir,
        independent_leaves: config.independent_leaves,
        shamefully_flatten: config.shamefully_flatten,
    };
    match modules.check_compatibility(&options) {
        Ok(()) => Ok(Some(modules)),
        Err(error) if config.force => {
            tracing::info!(target: "knit::install", %error, "Recreating {}", modules_dir.display());
            if !config.dry_run {
                fs::remove_dir_all(modules_dir).map_err(|error| InstallError::RemoveModulesDir {
                    dir: modules_dir.to_path_buf(),
                    error,
                })?;
            }
            Ok(None)
        }
        Err(error) => Err(InstallError::Compatibility(error)),
    }
}

fn is_dev_only(manifest: &PackageManifest, alias: &str) -> bool {
    manifest.dev_dependencies.contains_key(alias)
        && !manifest.dependencies.contains_key(alias)
        && !manifest.optional_dependencies.contains_key(alias)
}

/// Locked root dependencies that were not resolved in this run, as seen by peer dependents.
fn top_parents(
    lockfile: &Lockfile,
    manifest: &PackageManifest,
    root_addresses: &[PkgAddress],
) -> Vec<TopParent> {
    let resolved: HashSet<&str> = root_addresses.iter().map(|address| address.alias.as_str()).collect();
    let wanted: HashSet<&str> = manifest
        .dependencies([DependencyGroup::Prod, DependencyGroup::Dev, DependencyGroup::Optional])
        .map(|(alias, _)| alias)
        .collect();
    lockfile
        .root_dependencies()
        .into_iter()
        .filter(|(alias, _)| !resolved.contains(alias.as_str()) && wanted.contains(alias.as_str()))
        .filter_map(|(alias, reference)| {
            let (relative_path, snapshot) = lockfile.snapshot_by_ref(&reference, &alias)?;
            let parsed = dependency_path::parse(&relative_path).ok();
            let name = snapshot
                .name
                .clone()
                .or_else(|| parsed.as_ref()?.name.map(str::to_string))?;
            let version = snapshot
                .version
                .clone()
                .or_else(|| parsed.as_ref()?.version.map(str::to_string))?;
            Some(TopParent { name, version })
        })
        .collect()
}

/// Ids of the packages reachable from `roots`, following the edges accepted by `follow`.
fn reachable_ids<'a>(
    tree: &'a HashMap<NodeId, TreeNode>,
    roots: Vec<&'a NodeId>,
    follow: impl Fn(&TreeNode, &str) -> bool,
) -> HashSet<String> {
    let mut ids = HashSet::new();
    let mut visited = HashSet::new();
    let mut stack = roots;
    while let Some(node_id) = stack.pop() {
        if !visited.insert(node_id) {
            continue;
        }
        let Some(node) = tree.get(node_id) else { continue };
        ids.insert(node.pkg_id.clone());
        stack.extend(
            node.children
                .iter()
                .filter(|(alias, _)| follow(node, alias))
                .map(|(_, child)| child),
        );
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use knit_testing_utils::{
        fs::{get_all_files, get_all_folders, is_symlink_or_junction},
        manifest_from_json, MockStore,
    };
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};

    struct Project {
        dir: TempDir,
        config: Npmrc,
        store: MockStore,
    }

    impl Project {
        fn new() -> Self {
            knit_diagnostics::enable_tracing_by_env();
            let dir = tempdir().unwrap();
            let mut config = Npmrc::new();
            config.modules_dir = dir.path().join("node_modules");
            config.store_dir = dir.path().join("store");
            let store = MockStore::new(&config.store_dir);
            Project { dir, config, store }
        }

        async fn install(&self, manifest: &str) -> Result<InstallSummary, InstallError> {
            let manifest = manifest_from_json(manifest);
            Install { config: &self.config, manifest: &manifest, store: &self.store, project_dir: self.dir.path() }
                .run()
                .await
        }

        fn modules_dir(&self) -> &Path {
            &self.config.modules_dir
        }

        fn sorted_requests(&self) -> Vec<String> {
            let mut requests = self.store.requests();
            requests.sort();
            requests
        }
    }

    const MANIFEST: &str = r#"{
        "dependencies": { "a": "^1.0.0" },
        "devDependencies": { "c": "^1.0.0" }
    }"#;

    fn publish(store: &mut MockStore) {
        store
            .add_package(r#"{ "name": "a", "version": "1.0.0", "dependencies": { "b": "^1.0.0" } }"#)
            .add_package(r#"{ "name": "b", "version": "1.0.0", "bin": "cli.js" }"#)
            .add_file("b", "1.0.0", "cli.js", "#!/usr/bin/env node")
            .add_package(r#"{ "name": "c", "version": "1.0.0" }"#);
    }

    #[tokio::test]
    async fn installs_the_manifest() {
        let mut project = Project::new();
        publish(&mut project.store);

        let summary = project.install(MANIFEST).await.unwrap();

        let modules_dir = project.modules_dir();
        assert_eq!(
            summary.root_addresses.iter().map(|address| address.alias.as_str()).collect::<BTreeSet<_>>(),
            BTreeSet::from(["a", "c"]),
        );
        assert_eq!(
            summary.resolved_paths,
            ["registry.npmjs.org/a/1.0.0", "registry.npmjs.org/b/1.0.0", "registry.npmjs.org/c/1.0.0"],
        );
        assert!(is_symlink_or_junction(&modules_dir.join("a")).unwrap());
        assert!(is_symlink_or_junction(&modules_dir.join("c")).unwrap());
        assert!(modules_dir.join("a/package.json").is_file());
        assert!(is_symlink_or_junction(&modules_dir.join(".registry.npmjs.org/a/1.0.0/node_modules/b")).unwrap());
        assert!(modules_dir.join(".registry.npmjs.org/b/1.0.0/node_modules/b/cli.js").is_file());
        #[cfg(unix)]
        assert!(modules_dir.join(".registry.npmjs.org/a/1.0.0/node_modules/a/node_modules/.bin/b").exists());

        let wanted_lockfile = Lockfile::load_wanted(project.dir.path()).unwrap().unwrap();
        assert_eq!(wanted_lockfile.specifiers.get("a").map(String::as_str), Some("^1.0.0"));
        assert_eq!(wanted_lockfile.dependencies.get("a").map(String::as_str), Some("1.0.0"));
        assert_eq!(wanted_lockfile.dev_dependencies.get("c").map(String::as_str), Some("1.0.0"));
        assert_eq!(wanted_lockfile.packages["/a/1.0.0"].dependencies.get("b").map(String::as_str), Some("1.0.0"));
        assert_eq!(wanted_lockfile.packages["/c/1.0.0"].dev, Some(true));
        assert_eq!(wanted_lockfile.packages["/b/1.0.0"].dev, None);
        let current_lockfile = Lockfile::load_current(modules_dir).unwrap().unwrap();
        assert_eq!(current_lockfile, wanted_lockfile);

        let modules = Modules::read(modules_dir).unwrap().unwrap();
        assert_eq!(modules.store, project.config.store_dir.to_string_lossy());
        assert!(modules.skipped.is_empty());

        assert_eq!(project.sorted_requests(), ["a@^1.0.0", "b@^1.0.0", "c@^1.0.0"]);
    }

    #[tokio::test]
    async fn reinstall_skips_what_is_in_place() {
        let mut project = Project::new();
        publish(&mut project.store);
        project.install(MANIFEST).await.unwrap();
        let first_lockfile = Lockfile::load_wanted(project.dir.path()).unwrap().unwrap();
        let requests_before = project.store.requests().len();

        let summary = project.install(MANIFEST).await.unwrap();

        let mut new_requests = project.store.requests().split_off(requests_before);
        new_requests.sort();
        assert_eq!(new_requests, ["a@^1.0.0", "c@^1.0.0"]);
        assert_eq!(summary.updated_paths, Vec::<String>::new());
        assert!(summary.removed_ids.is_empty());
        assert_eq!(Lockfile::load_wanted(project.dir.path()).unwrap().unwrap(), first_lockfile);
        assert!(project.modules_dir().join(".registry.npmjs.org/a/1.0.0/node_modules/b/package.json").is_file());
    }

    #[tokio::test]
    async fn removed_dependencies_are_pruned() {
        let mut project = Project::new();
        publish(&mut project.store);
        project.install(MANIFEST).await.unwrap();

        let summary = project.install(r#"{ "dependencies": { "a": "^1.0.0" } }"#).await.unwrap();

        let modules_dir = project.modules_dir();
        assert_eq!(summary.removed_ids, BTreeSet::from(["registry.npmjs.org/c/1.0.0".to_string()]));
        assert!(modules_dir.join("c").symlink_metadata().is_err());
        assert!(!modules_dir.join(".registry.npmjs.org/c/1.0.0").exists());
        assert!(modules_dir.join("a/package.json").is_file());
        assert!(get_all_folders(modules_dir).iter().all(|folder| !folder.contains("/c/")));
        assert!(get_all_files(modules_dir)
            .contains(&".registry.npmjs.org/b/1.0.0/node_modules/b/package.json".to_string()));
        let wanted_lockfile = Lockfile::load_wanted(project.dir.path()).unwrap().unwrap();
        assert!(wanted_lockfile.dev_dependencies.is_empty());
        assert_eq!(wanted_lockfile.packages.keys().collect::<Vec<_>>(), ["/a/1.0.0", "/b/1.0.0"]);
    }

    #[tokio::test]
    async fn peers_are_bound_to_the_root_dependency() {
        let mut project = Project::new();
        project
            .store
            .add_package(r#"{ "name": "a", "version": "1.0.0", "peerDependencies": { "p": "^2.0.0" } }"#)
            .add_package(r#"{ "name": "p", "version": "2.1.0" }"#);

        let summary = project
            .install(r#"{ "dependencies": { "a": "^1.0.0", "p": "2.1.0" } }"#)
            .await
            .unwrap();

        assert_eq!(
            summary.resolved_paths,
            ["registry.npmjs.org/a/1.0.0/p@2.1.0", "registry.npmjs.org/p/2.1.0"],
        );
        let a_modules = project.modules_dir().join(".registry.npmjs.org/a/1.0.0/p@2.1.0/node_modules");
        assert!(a_modules.join("a/package.json").is_file());
        assert!(is_symlink_or_junction(&a_modules.join("p")).unwrap());
        let wanted_lockfile = Lockfile::load_wanted(project.dir.path()).unwrap().unwrap();
        assert_eq!(wanted_lockfile.dependencies.get("a").map(String::as_str), Some("1.0.0/p@2.1.0"));
        let a = &wanted_lockfile.packages["/a/1.0.0/p@2.1.0"];
        assert_eq!(a.dependencies.get("p").map(String::as_str), Some("2.1.0"));
    }

    #[tokio::test]
    async fn failed_optional_dependency_is_left_out() {
        let mut project = Project::new();
        publish(&mut project.store);
        project.store.add_package(r#"{ "name": "x", "version": "1.0.0" }"#).fail_package("x");

        project
            .install(r#"{ "dependencies": { "a": "^1.0.0" }, "optionalDependencies": { "x": "^1.0.0" } }"#)
            .await
            .unwrap();

        assert!(project.modules_dir().join("x").symlink_metadata().is_err());
        let wanted_lockfile = Lockfile::load_wanted(project.dir.path()).unwrap().unwrap();
        assert!(wanted_lockfile.optional_dependencies.is_empty());
        assert_eq!(wanted_lockfile.specifiers.get("x").map(String::as_str), Some("^1.0.0"));
    }

    #[tokio::test]
    async fn incompatible_modules_dir() {
        let mut project = Project::new();
        publish(&mut project.store);
        Modules::new(project.config.store_dir.to_string_lossy(), false, true)
            .write(project.modules_dir())
            .unwrap();

        eprintln!("CASE: without force");
        let error = project.install(MANIFEST).await.unwrap_err();
        assert!(matches!(error, InstallError::Compatibility(CompatibilityError::ShamefullyFlatten { .. })));

        eprintln!("CASE: with force");
        project.config.force = true;
        project.install(MANIFEST).await.unwrap();
        let modules = Modules::read(project.modules_dir()).unwrap().unwrap();
        assert!(!modules.shamefully_flatten);
    }

    #[tokio::test]
    async fn shamefully_flatten_hoists_transitive_dependencies() {
        let mut project = Project::new();
        project.config.shamefully_flatten = true;
        publish(&mut project.store);

        project.install(MANIFEST).await.unwrap();

        let modules_dir = project.modules_dir();
        assert!(is_symlink_or_junction(&modules_dir.join("b")).unwrap());
        #[cfg(unix)]
        assert!(modules_dir.join(".bin/b").exists());
        let modules = Modules::read(modules_dir).unwrap().unwrap();
        assert_eq!(
            modules.flattened_aliases_by_id,
            BTreeMap::from([("registry.npmjs.org/b/1.0.0".to_string(), "b".to_string())]),
        );
    }
}
